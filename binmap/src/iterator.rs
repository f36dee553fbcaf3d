use crate::bin::Bin;
use crate::map::BinMap;

/// Common protocol of the bin iterators: a cursor that is advanced explicitly and can skip
///  ahead, with adapters to [std::iter::Iterator] for the common loops.
pub trait BinCursor: Sized {
    /// advances to the next maximal interval
    fn next_interval(&mut self) -> bool;
    /// advances to the first interval at or after `b`
    fn next_interval_after(&mut self, b: Bin) -> bool;
    /// advances to the next base bin
    fn next_base(&mut self) -> bool;
    fn value(&self) -> Bin;

    fn intervals(mut self) -> impl Iterator<Item = Bin> {
        std::iter::from_fn(move || self.next_interval().then(|| self.value()))
    }

    fn intervals_after(mut self, b: Bin) -> impl Iterator<Item = Bin> {
        let mut started = false;
        std::iter::from_fn(move || {
            let ok = if started {
                self.next_interval()
            }
            else {
                started = true;
                self.next_interval_after(b)
            };
            ok.then(|| self.value())
        })
    }

    fn bases(mut self) -> impl Iterator<Item = Bin> {
        std::iter::from_fn(move || self.next_base().then(|| self.value()))
    }
}

/// Walks the filled (or empty) intervals of a [BinMap] below a given root bin. The iterator
///  caches the current gap (the next run of the opposite state) to avoid searching the map
///  for every step.
#[derive(Clone)]
pub struct BinIterator<'a> {
    map: &'a BinMap,
    filled: bool,
    i: Bin,
    end: Bin,
    gap_left: Bin,
    gap_right: Bin,
}

impl<'a> BinIterator<'a> {
    pub fn filled(map: &'a BinMap, b: Bin) -> BinIterator<'a> {
        Self::new(map, true, b)
    }

    pub fn empty(map: &'a BinMap, b: Bin) -> BinIterator<'a> {
        Self::new(map, false, b)
    }

    fn new(map: &'a BinMap, filled: bool, b: Bin) -> BinIterator<'a> {
        let i = b.base_left() - 2;
        BinIterator {
            map,
            filled,
            i,
            end: b.base_right(),
            gap_left: Bin(0),
            gap_right: i,
        }
    }

    fn find_neg(&self, i: Bin) -> Bin {
        if self.filled {
            self.map.find_empty_after(i)
        }
        else {
            self.map.find_filled_after(i)
        }
    }

    fn find_pos(&self, i: Bin) -> Bin {
        if self.filled {
            self.map.find_filled_after(i)
        }
        else {
            self.map.find_empty_after(i)
        }
    }

    fn init_gap(&mut self, mut i: Bin) -> Bin {
        let mut gap = self.find_neg(i);
        if gap == i {
            i = self.find_pos(i);
            gap = self.find_neg(i);
        }

        self.gap_left = gap;
        self.gap_right = gap;
        i
    }

    pub fn next_base_after(&mut self, mut i: Bin) -> bool {
        if i >= self.gap_right + 2 {
            i = self.init_gap(i);
        }
        else if i >= self.gap_left {
            i = self.init_gap(self.gap_right + 2);
        }

        self.i = i.base_left();
        i <= self.end
    }

    fn next_after_from(&mut self, mut i: Bin, imin: Bin) -> bool {
        if i.is_none() {
            self.i = i;
            return false;
        }

        loop {
            let t = i.parent();
            if imin > t.base_left() || t.base_right() >= self.gap_left || t.base_right() > self.end {
                break;
            }
            i = t;
        }

        while i.base_right() >= self.gap_left && !i.is_base() {
            i = i.left();
        }

        self.i = i;
        i <= self.end
    }
}

impl BinCursor for BinIterator<'_> {
    fn next_interval(&mut self) -> bool {
        let mut i = self.i.layer_right();
        let mut imin = i.base_left();
        if imin >= self.gap_left {
            i = self.init_gap(self.gap_right + 2);
            imin = i;
        }
        self.next_after_from(i, imin)
    }

    fn next_interval_after(&mut self, mut i: Bin) -> bool {
        let mut imin = i.base_left();
        if i >= self.gap_right + 2 {
            i = self.init_gap(i);
            imin = i;
        }
        else if i >= self.gap_left {
            i = self.init_gap(self.gap_right + 2);
            imin = i;
        }
        self.next_after_from(i, imin)
    }

    fn next_base(&mut self) -> bool {
        self.next_base_after(self.i + 2)
    }

    fn value(&self) -> Bin {
        self.i
    }
}

/// Walks the intervals that are covered by both of two iterators, e.g. the bins a peer has
///  and we have not requested yet.
#[derive(Clone)]
pub struct IntersectionIterator<'a> {
    it: [BinIterator<'a>; 2],
    /// the iterator whose value was reported last
    p: Option<usize>,
    i: Bin,
}

impl<'a> IntersectionIterator<'a> {
    pub fn new(a: BinIterator<'a>, b: BinIterator<'a>) -> IntersectionIterator<'a> {
        IntersectionIterator {
            it: [a, b],
            p: None,
            i: Bin::NONE,
        }
    }

    fn align(&mut self) -> bool {
        let [a, b] = &mut self.it;
        loop {
            if a.value().base_right() < b.value().base_right() && !b.value().contains(a.value()) {
                if !a.next_interval_after(b.value().base_left()) {
                    return false;
                }
            }

            if b.value().contains(a.value()) {
                self.i = a.value();
                self.p = Some(0);
                return true;
            }

            if b.value().base_right() < a.value().base_right() && !a.value().contains(b.value()) {
                if !b.next_interval_after(a.value().base_left()) {
                    return false;
                }
            }

            if a.value().contains(b.value()) {
                self.i = b.value();
                self.p = Some(1);
                return true;
            }
        }
    }
}

impl BinCursor for IntersectionIterator<'_> {
    fn next_interval(&mut self) -> bool {
        match self.p {
            None => {
                if !self.it[0].next_interval() {
                    return false;
                }
                let start = self.it[0].value().base_left();
                if !self.it[1].next_interval_after(start) {
                    return false;
                }
            }
            Some(p) => {
                if !self.it[p].next_interval() {
                    return false;
                }
            }
        }
        self.align()
    }

    fn next_interval_after(&mut self, b: Bin) -> bool {
        if !self.it[0].next_interval_after(b) {
            return false;
        }
        let start = self.it[0].value().base_left();
        if !self.it[1].next_interval_after(start) {
            return false;
        }
        self.align()
    }

    fn next_base(&mut self) -> bool {
        let [a, b] = &mut self.it;
        if !a.next_base() || !b.next_base() {
            return false;
        }

        while a.value() != b.value() {
            while a.value() < b.value() {
                if !a.next_base_after(b.value()) {
                    return false;
                }
            }
            while b.value() < a.value() {
                if !b.next_base_after(a.value()) {
                    return false;
                }
            }
        }

        self.i = a.value();
        true
    }

    fn value(&self) -> Bin {
        self.i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn map_with(filled: &[u64]) -> BinMap {
        let mut m = BinMap::new();
        for &b in filled {
            m.set(Bin(b));
        }
        m
    }

    fn bins(values: &[u64]) -> Vec<Bin> {
        values.iter().map(|&b| Bin(b)).collect()
    }

    #[rstest]
    fn test_iterate_base_agrees_with_map(
        #[values(vec![2, 5, 12, 22, 24], vec![], vec![15], vec![7], vec![23], vec![3, 40, 77, 92])] filled: Vec<u64>,
        #[values(7, 15, 23)] root: u64,
    ) {
        let m = map_with(&filled);
        let root = Bin(root);

        let mut expected_filled = Vec::new();
        let mut expected_empty = Vec::new();
        let mut i = root.base_left();
        while i <= root.base_right() {
            if m.filled_at(i) {
                expected_filled.push(i);
            }
            else {
                expected_empty.push(i);
            }
            i = i + 2;
        }

        assert_eq!(m.iterate_filled_at(root).bases().collect::<Vec<_>>(), expected_filled);
        assert_eq!(m.iterate_empty_at(root).bases().collect::<Vec<_>>(), expected_empty);
    }

    #[rstest]
    #[case::basic(vec![2, 5, 12, 22, 24], vec![2, 5, 12, 22, 24], vec![0, 9, 14, 17, 20, 26, 29])]
    #[case::none_filled(vec![], vec![], vec![15])]
    #[case::all_filled(vec![15], vec![15], vec![])]
    #[case::first_half_filled(vec![7], vec![7], vec![23])]
    #[case::second_half_filled(vec![23], vec![23], vec![7])]
    fn test_iterate_intervals(#[case] filled: Vec<u64>, #[case] expected_filled: Vec<u64>, #[case] expected_empty: Vec<u64>) {
        let m = map_with(&filled);
        assert_eq!(m.iterate_filled_at(Bin(15)).intervals().collect::<Vec<_>>(), bins(&expected_filled));
        assert_eq!(m.iterate_empty_at(Bin(15)).intervals().collect::<Vec<_>>(), bins(&expected_empty));
    }

    #[test]
    fn test_iterate_after() {
        let m = map_with(&[2, 5, 12, 22, 24]);

        assert_eq!(m.iterate_filled_at(Bin(15)).intervals_after(Bin(12)).collect::<Vec<_>>(), bins(&[12, 22, 24]));
        assert_eq!(m.iterate_empty_at(Bin(15)).intervals_after(Bin(12)).collect::<Vec<_>>(), bins(&[14, 17, 20, 26, 29]));
    }

    #[rstest]
    #[case::from_start(0, vec![8, 10, 12, 14, 28])]
    #[case::from_middle(12, vec![12, 14, 28])]
    #[case::past_end(30, vec![])]
    fn test_iterate_base_after(#[case] first: u64, #[case] expected: Vec<u64>) {
        let m = map_with(&[11, 28]);

        let mut it = m.iterate_filled();
        let mut actual = Vec::new();
        let mut ok = it.next_base_after(Bin(first));
        while ok {
            actual.push(it.value());
            ok = it.next_base();
        }
        assert_eq!(actual, bins(&expected));
    }

    #[test]
    fn test_iterate_whole_map() {
        let filled = [5, 11, 28, 129];
        let m = map_with(&filled);
        assert_eq!(m.iterate_filled().intervals().collect::<Vec<_>>(), bins(&filled));
    }

    #[rstest]
    fn test_intersection_base_agrees_with_maps(
        #[values(
            (vec![5, 9, 19, 24], vec![7, 17, 29]),
            (vec![], vec![]),
            (vec![15], vec![15]),
            (vec![7], vec![23]),
            (vec![7, 21, 25], vec![5, 9, 23]),
            (vec![0, 30], vec![0, 30]),
            (vec![7], vec![7]),
            (vec![23], vec![23]),
        )] filled: (Vec<u64>, Vec<u64>),
        #[values(7, 15, 23)] root: u64,
    ) {
        let k0 = map_with(&filled.0);
        let k1 = map_with(&filled.1);
        let root = Bin(root);

        let mut expected_filled = Vec::new();
        let mut expected_empty = Vec::new();
        let mut i = root.base_left();
        while i <= root.base_right() {
            if k0.filled_at(i) && k1.filled_at(i) {
                expected_filled.push(i);
            }
            else if k0.empty_at(i) && k1.empty_at(i) {
                expected_empty.push(i);
            }
            i = i + 2;
        }

        let filled = IntersectionIterator::new(k0.iterate_filled_at(root), k1.iterate_filled_at(root));
        assert_eq!(filled.bases().collect::<Vec<_>>(), expected_filled);
        let empty = IntersectionIterator::new(k0.iterate_empty_at(root), k1.iterate_empty_at(root));
        assert_eq!(empty.bases().collect::<Vec<_>>(), expected_empty);
    }

    #[rstest]
    #[case::basic(vec![5, 9, 19, 24], vec![7, 17, 29], 15, vec![5, 9, 17], vec![1, 13, 29], vec![21, 24])]
    #[case::none_filled(vec![], vec![], 15, vec![], vec![], vec![])]
    #[case::all_filled(vec![15], vec![15], 15, vec![15], vec![], vec![])]
    #[case::no_intersection(vec![7], vec![23], 15, vec![], vec![23], vec![7])]
    #[case::middles_intersect(vec![7, 21, 25], vec![5, 9, 23], 15, vec![5, 9, 21, 25], vec![17, 29], vec![1, 13])]
    #[case::edges_intersect(vec![0, 30], vec![0, 30], 15, vec![0, 30], vec![], vec![])]
    #[case::first_half_filled(vec![7], vec![7], 15, vec![7], vec![], vec![])]
    #[case::second_half_filled(vec![23], vec![23], 15, vec![23], vec![], vec![])]
    #[case::wide(vec![255, 614], vec![23], 511, vec![23], vec![], vec![7, 47, 95, 191, 383, 614])]
    fn test_intersection_intervals(
        #[case] filled0: Vec<u64>,
        #[case] filled1: Vec<u64>,
        #[case] root: u64,
        #[case] expected_filled: Vec<u64>,
        #[case] expected_difference0: Vec<u64>,
        #[case] expected_difference1: Vec<u64>,
    ) {
        let k0 = map_with(&filled0);
        let k1 = map_with(&filled1);
        let root = Bin(root);

        let both = IntersectionIterator::new(k0.iterate_filled_at(root), k1.iterate_filled_at(root));
        assert_eq!(both.intervals().collect::<Vec<_>>(), bins(&expected_filled), "filled");

        let only1 = IntersectionIterator::new(k0.iterate_empty_at(root), k1.iterate_filled_at(root));
        assert_eq!(only1.intervals().collect::<Vec<_>>(), bins(&expected_difference0), "difference 1-0");

        let only0 = IntersectionIterator::new(k0.iterate_filled_at(root), k1.iterate_empty_at(root));
        assert_eq!(only0.intervals().collect::<Vec<_>>(), bins(&expected_difference1), "difference 0-1");
    }

    #[test]
    fn test_intersection_after() {
        let k0 = map_with(&[11, 28]);
        let k1 = map_with(&[15]);

        let it = IntersectionIterator::new(k0.iterate_filled_at(Bin(15)), k1.iterate_filled_at(Bin(15)));
        assert_eq!(it.intervals_after(Bin(12)).collect::<Vec<_>>(), bins(&[13, 28]));
    }
}
