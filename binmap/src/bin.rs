use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, Sub};

/// A bin names an aligned interval of chunks in a binary tree over the stream:
///
/// ```ascii
///               7
///           /       \
///       3              11
///     /   \           /  \
///   1       5       9     13
///  / \     / \     / \    / \
/// 0   2   4   6   8  10  12 14
/// ```
///
/// A bin at `layer` and `offset` covers base chunks `[offset * 2^layer, (offset+1) * 2^layer)`,
///  its number is `((2 * offset + 1) << layer) - 1`. Base chunks (layer 0) are the even numbers.
///
/// All arithmetic wraps so that the two sentinels [Bin::NONE] and [Bin::ALL] can flow through
///  navigation code without special casing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bin(pub u64);

impl Bin {
    pub const NONE: Bin = Bin(u64::MAX);
    pub const ALL: Bin = Bin(0x7fff_ffff_ffff_ffff);

    /// highest layer a bin can live on
    pub const MAX_LAYER: u64 = 63;

    pub const fn new(layer: u64, offset: u64) -> Bin {
        if layer > Self::MAX_LAYER {
            return Bin::NONE;
        }
        Bin(((offset.wrapping_mul(2).wrapping_add(1)) << layer).wrapping_sub(1))
    }

    pub fn is_none(self) -> bool {
        self == Bin::NONE
    }

    pub fn is_all(self) -> bool {
        self == Bin::ALL
    }

    /// The trailing `0111..1` bits that encode the layer, plus the 0 bit above them
    pub fn layer_bits(self) -> u64 {
        self.0 ^ self.0.wrapping_add(1)
    }

    pub fn layer(self) -> u64 {
        self.0.wrapping_add(1).trailing_zeros() as u64
    }

    pub fn layer_offset(self) -> u64 {
        self.0.checked_shr(self.layer() as u32 + 1).unwrap_or(0)
    }

    pub fn parent(self) -> Bin {
        let lbs = self.layer_bits();
        Bin((self.0 | lbs) & !lbs.wrapping_add(1))
    }

    pub fn left(self) -> Bin {
        let t = self.0.wrapping_add(1);
        Bin(self.0 ^ ((t & t.wrapping_neg()) >> 1))
    }

    pub fn right(self) -> Bin {
        let t = self.0.wrapping_add(1);
        Bin(self.0.wrapping_add((t & t.wrapping_neg()) >> 1))
    }

    /// leftmost base bin covered by this bin
    pub fn base_left(self) -> Bin {
        if self.is_none() {
            return Bin::NONE;
        }
        Bin(self.0 & self.0.wrapping_add(1))
    }

    /// rightmost base bin covered by this bin
    pub fn base_right(self) -> Bin {
        if self.is_none() {
            return Bin::NONE;
        }
        Bin((self.0 | self.0.wrapping_add(1)).wrapping_sub(1))
    }

    /// the bin left of this one on the same layer, or NONE at the start of the layer
    pub fn layer_left(self) -> Bin {
        if self.is_none() {
            return Bin::NONE;
        }
        let t = self.layer_bits().wrapping_add(1);
        if self.0 < t {
            return Bin::NONE;
        }
        Bin(self.0 - t)
    }

    pub fn layer_right(self) -> Bin {
        if self.is_none() {
            return Bin::NONE;
        }
        Bin(self.0.wrapping_add(self.layer_bits()).wrapping_add(1))
    }

    /// The leftmost bin on layer `z` that is above or below this bin
    pub fn layer_shift(self, z: u64) -> Bin {
        let low = 1u64.checked_shl(z as u32).unwrap_or(0).wrapping_sub(1);
        Bin((self.0 & !self.layer_bits()) | low)
    }

    pub fn is_base(self) -> bool {
        self.0 & 1 == 0
    }

    pub fn base_offset(self) -> u64 {
        (self.0 & self.0.wrapping_add(1)) >> 1
    }

    /// number of base chunks covered by this bin
    pub fn base_length(self) -> u64 {
        let t = self.0.wrapping_add(1);
        t & t.wrapping_neg()
    }

    /// true if `other` is this bin or one of its descendants
    pub fn contains(self, other: Bin) -> bool {
        if self.is_none() {
            return false;
        }
        (self.0 & self.0.wrapping_add(1)) <= other.0 && other.0 < (self.0 | self.0.wrapping_add(1))
    }

    pub fn sibling(self) -> Bin {
        Bin(self.0 ^ self.layer_bits().wrapping_add(1))
    }

    pub fn is_left(self) -> bool {
        self.0 & self.layer_bits().wrapping_add(1) == 0
    }

    pub fn is_right(self) -> bool {
        !self.is_left()
    }
}

impl From<u64> for Bin {
    fn from(value: u64) -> Self {
        Bin(value)
    }
}

impl From<Bin> for u64 {
    fn from(value: Bin) -> Self {
        value.0
    }
}

/// bin number arithmetic, wrapping like the navigation functions
impl Add<u64> for Bin {
    type Output = Bin;

    fn add(self, rhs: u64) -> Bin {
        Bin(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Bin {
    type Output = Bin;

    fn sub(self, rhs: u64) -> Bin {
        Bin(self.0.wrapping_sub(rhs))
    }
}

impl Sub<Bin> for Bin {
    type Output = u64;

    fn sub(self, rhs: Bin) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl Display for Bin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Bin::ALL => write!(f, "ALL"),
            Bin::NONE => write!(f, "NONE"),
            Bin(n) => write!(f, "{}", n),
        }
    }
}

impl Debug for Bin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::base_zero(0, 0, 0)]
    #[case::base_one(0, 1, 2)]
    #[case::layer_one(1, 0, 1)]
    #[case::layer_one_third(1, 3, 13)]
    #[case::layer_three(3, 0, 7)]
    #[case::layer_three_second(3, 1, 23)]
    #[case::layer_six(6, 0, 63)]
    #[case::too_high(64, 0, u64::MAX)]
    fn test_new(#[case] layer: u64, #[case] offset: u64, #[case] expected: u64) {
        assert_eq!(Bin::new(layer, offset), Bin(expected));
    }

    #[test]
    fn test_layer_and_offset_round_trip() {
        for layer in 0..40 {
            for offset in [0u64, 1, 2, 3, 17, 1000] {
                let b = Bin::new(layer, offset);
                assert_eq!(b.layer(), layer);
                assert_eq!(b.layer_offset(), offset);
            }
        }
    }

    #[rstest]
    #[case::base_left_child(0, 1)]
    #[case::base_right_child(2, 1)]
    #[case::layer_one(1, 3)]
    #[case::right_subtree(13, 11)]
    #[case::top(7, 15)]
    fn test_parent(#[case] bin: u64, #[case] expected: u64) {
        assert_eq!(Bin(bin).parent(), Bin(expected));
    }

    #[rstest]
    #[case::root(7, 3, 11)]
    #[case::layer_one(5, 4, 6)]
    #[case::layer_two(11, 9, 13)]
    fn test_children(#[case] bin: u64, #[case] left: u64, #[case] right: u64) {
        assert_eq!(Bin(bin).left(), Bin(left));
        assert_eq!(Bin(bin).right(), Bin(right));
        assert_eq!(Bin(left).sibling(), Bin(right));
        assert!(Bin(left).is_left());
        assert!(Bin(right).is_right());
    }

    #[rstest]
    #[case::base(4, 4, 4, 1)]
    #[case::layer_one(5, 4, 6, 2)]
    #[case::layer_three(23, 16, 30, 8)]
    fn test_base_range(#[case] bin: u64, #[case] left: u64, #[case] right: u64, #[case] len: u64) {
        let b = Bin(bin);
        assert_eq!(b.base_left(), Bin(left));
        assert_eq!(b.base_right(), Bin(right));
        assert_eq!(b.base_length(), len);
        assert_eq!(b.base_offset(), left / 2);
    }

    #[test]
    fn test_layer_left_right() {
        assert_eq!(Bin(5).layer_left(), Bin(1));
        assert_eq!(Bin(1).layer_left(), Bin::NONE);
        assert_eq!(Bin(0).layer_left(), Bin::NONE);
        assert_eq!(Bin(1).layer_right(), Bin(5));
        assert_eq!(Bin(7).layer_right(), Bin(23));
        assert_eq!(Bin::NONE.layer_right(), Bin::NONE);
    }

    #[test]
    fn test_layer_shift() {
        assert_eq!(Bin(9).layer_shift(0), Bin(8));
        assert_eq!(Bin(8).layer_shift(2), Bin(11));
        assert_eq!(Bin(20).layer_shift(3), Bin(23));
    }

    #[test]
    fn test_contains() {
        assert!(Bin(7).contains(Bin(0)));
        assert!(Bin(7).contains(Bin(14)));
        assert!(Bin(7).contains(Bin(7)));
        assert!(!Bin(7).contains(Bin(15)));
        assert!(!Bin(3).contains(Bin(8)));
        assert!(!Bin::NONE.contains(Bin(1)));
        assert!(Bin::ALL.contains(Bin(12345)));
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(Bin::NONE.base_left(), Bin::NONE);
        assert_eq!(Bin::NONE.layer_left(), Bin::NONE);
        assert_eq!(Bin::ALL.layer(), 63);
        assert_eq!(format!("{}", Bin::ALL), "ALL");
        assert_eq!(format!("{}", Bin::NONE), "NONE");
        assert_eq!(format!("{:?}", Bin(42)), "42");
    }
}
