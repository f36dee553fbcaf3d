/// Widening casts between the wire's fixed width integers and `usize`
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// For narrowing casts where validated configuration or a frame size limit ensures that the
///  value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("value out of range for a checked narrowing cast")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("value out of range for a checked narrowing cast")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prechecked_in_range() {
        let n: u16 = 65535usize.prechecked_cast();
        assert_eq!(n, u16::MAX);
        let n: usize = 7u16.safe_cast();
        assert_eq!(n, 7);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u16 = 65536usize.prechecked_cast();
    }
}
