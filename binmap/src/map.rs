use std::fmt::{Debug, Formatter};

use tracing::trace;

use crate::bin::Bin;
use crate::iterator::{BinCursor, BinIterator};

/// index of a cell in the arena
type Ref = u32;

const ROOT_REF: Ref = 1;

/// Bins on layers 0..=5 are stored as bits in a 32 bit bitmap owned by the layer 6 cell above them
const BITMAP_LAYER_BITS: u64 = 63;

const BITMAP_EMPTY: u32 = 0;
const BITMAP_FILLED: u32 = u32::MAX;

/// Growing beyond this many cells means some caller sets bins without bounds, which is a bug
const MAX_CELLS: usize = 2048;

/// `BIN_BITMAPS[b & 63]` is the mask of base chunks that bin `b` covers in its 32 bit bitmap
static BIN_BITMAPS: [u32; 64] = bin_bitmaps();

const fn bin_bitmaps() -> [u32; 64] {
    let mut result = [0u32; 64];
    let mut i = 0;
    while i < 64 {
        let b = i as u64;
        let offset = (b & (b + 1)) >> 1;
        let t = b + 1;
        let len = t & t.wrapping_neg();
        result[i] = if len >= 32 {
            u32::MAX
        } else {
            (((1u64 << len) - 1) << offset) as u32
        };
        i += 1;
    }
    result
}

fn bin_bitmap(b: Bin) -> u32 {
    BIN_BITMAPS[(b.0 & BITMAP_LAYER_BITS) as usize]
}

/// A cell is one of three things:
/// * a data cell: each half is either a bitmap or a [Ref] to a child cell. The bitmap in a half
///   that covers more than 32 base chunks is a pattern repeated for every 32 chunk block
/// * a free cell: `left` holds the next free [Ref]
/// * a flag cell (every index divisible by 32): bit `r & 31` of `left` / `right` says whether
///   the left / right half of cell `r` holds a [Ref]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
struct Cell {
    left: u32,
    right: u32,
}

impl Cell {
    fn symmetrical(&self) -> bool {
        self.left == self.right
    }

    fn half(&self, left: bool) -> u32 {
        if left { self.left } else { self.right }
    }

    fn set_half(&mut self, left: bool, value: u32) {
        if left {
            self.left = value;
        }
        else {
            self.right = value;
        }
    }
}

fn is_flag_ref(r: usize) -> bool {
    r & 31 == 0
}

fn flag_ref(r: Ref) -> usize {
    (r & !31) as usize
}

fn flag_bit(r: Ref) -> u32 {
    1 << (r & 31)
}

struct TraceHistory {
    refs: [Ref; 64],
    len: usize,
}

impl TraceHistory {
    fn new() -> TraceHistory {
        TraceHistory { refs: [0; 64], len: 0 }
    }

    fn push(&mut self, r: Ref) {
        self.refs[self.len] = r;
        self.len += 1;
    }
}

/// A compact set of bins, stored as a tree of cells in an arena. Uniform subtrees are
///  collapsed into a single bitmap, so long runs of filled or empty chunks cost nothing.
///
/// The map grows its root span on demand when bins to the right of it are set. Everything
///  outside the root span is empty.
#[derive(Clone)]
pub struct BinMap {
    free_top: Ref,
    alloc_count: usize,
    cell_count: usize,
    root_bin: Bin,
    cells: Vec<Cell>,
}

impl Default for BinMap {
    fn default() -> Self {
        BinMap::new()
    }
}

impl BinMap {
    pub fn new() -> BinMap {
        let mut result = BinMap {
            free_top: 0,
            alloc_count: 0,
            cell_count: 0,
            root_bin: Bin(63),
            cells: Vec::new(),
        };
        let root = result.alloc_cell();
        debug_assert_eq!(root, ROOT_REF);
        result
    }

    pub fn root_bin(&self) -> Bin {
        self.root_bin
    }

    fn cell(&self, r: Ref) -> &Cell {
        &self.cells[r as usize]
    }

    fn cell_mut(&mut self, r: Ref) -> &mut Cell {
        &mut self.cells[r as usize]
    }

    fn left_is_ref(&self, r: Ref) -> bool {
        self.cells[flag_ref(r)].left & flag_bit(r) != 0
    }

    fn right_is_ref(&self, r: Ref) -> bool {
        self.cells[flag_ref(r)].right & flag_bit(r) != 0
    }

    fn half_is_ref(&self, r: Ref, left: bool) -> bool {
        if left { self.left_is_ref(r) } else { self.right_is_ref(r) }
    }

    fn has_ref(&self, r: Ref) -> bool {
        self.left_is_ref(r) || self.right_is_ref(r)
    }

    fn set_half_is_ref(&mut self, r: Ref, left: bool, value: bool) {
        let bit = flag_bit(r);
        let flags = &mut self.cells[flag_ref(r)];
        let field = if left { &mut flags.left } else { &mut flags.right };
        if value {
            *field |= bit;
        }
        else {
            *field &= !bit;
        }
    }

    fn reserve_cells(&mut self, n: usize) {
        if self.cell_count - self.alloc_count > n + 1 {
            return;
        }

        let l = self.cells.len();
        let new_len = (l * 3 / 2)
            .max(l + (n + 1) * 32 / 31)
            .max(16);
        trace!("growing bin map from {} to {} cells", l, new_len);

        self.cells.resize(new_len, Cell::default());
        for i in (l..new_len).rev() {
            if !is_flag_ref(i) {
                self.cells[i].left = self.free_top;
                self.free_top = i as Ref;
                self.cell_count += 1;
            }
        }

        if self.cell_count > MAX_CELLS {
            panic!("bin map grew to a suspiciously large number of cells ({})", self.cell_count);
        }
    }

    fn alloc_cell(&mut self) -> Ref {
        self.reserve_cells(1);

        let r = self.free_top;
        self.free_top = self.cell(r).left;
        self.alloc_count += 1;

        *self.cell_mut(r) = Cell::default();
        self.set_half_is_ref(r, true, false);
        self.set_half_is_ref(r, false, false);
        r
    }

    fn free_cell(&mut self, r: Ref) {
        let c = *self.cell(r);
        if self.left_is_ref(r) {
            self.free_cell(c.left);
        }
        if self.right_is_ref(r) {
            self.free_cell(c.right);
        }

        self.cell_mut(r).left = self.free_top;
        self.free_top = r;
        self.alloc_count -= 1;
    }

    fn extend_root(&mut self) {
        if !self.has_ref(ROOT_REF) && self.cell(ROOT_REF).symmetrical() {
            self.cell_mut(ROOT_REF).right = BITMAP_EMPTY;
        }
        else {
            let r = self.alloc_cell();

            let root = *self.cell(ROOT_REF);
            *self.cell_mut(r) = root;
            let (left_ref, right_ref) = (self.left_is_ref(ROOT_REF), self.right_is_ref(ROOT_REF));
            self.set_half_is_ref(r, true, left_ref);
            self.set_half_is_ref(r, false, right_ref);

            *self.cell_mut(ROOT_REF) = Cell { left: r, right: BITMAP_EMPTY };
            self.set_half_is_ref(ROOT_REF, true, true);
            self.set_half_is_ref(ROOT_REF, false, false);
        }

        self.root_bin = self.root_bin.parent();
    }

    /// collapses the last cell on the traced path into its ancestors if it became uniform
    fn pack_cells(&mut self, rs: &TraceHistory) {
        let mut i = rs.len - 1;
        let mut r = rs.refs[i];
        if r == ROOT_REF {
            return;
        }

        if self.has_ref(r) || !self.cell(r).symmetrical() {
            return;
        }

        let bm = self.cell(r).left;
        loop {
            i -= 1;
            r = rs.refs[i];
            let c = *self.cell(r);

            if !self.left_is_ref(r) {
                if c.left != bm {
                    break;
                }
            }
            else if !self.right_is_ref(r) {
                if c.right != bm {
                    break;
                }
            }
            else {
                break;
            }

            if r == ROOT_REF {
                break;
            }
        }

        let nr = rs.refs[i + 1];
        let left = self.left_is_ref(r) && self.cell(r).left == nr;
        self.set_half_is_ref(r, left, false);
        self.cell_mut(r).set_half(left, bm);
        self.free_cell(nr);
    }

    fn trace(&self, target: Bin) -> (Ref, Bin) {
        let mut r = ROOT_REF;
        let mut b = self.root_bin;

        while target != b {
            let left = target < b;
            if !self.half_is_ref(r, left) {
                break;
            }
            r = self.cell(r).half(left);
            b = if left { b.left() } else { b.right() };
        }
        (r, b)
    }

    fn trace_history(&self, target: Bin, rs: &mut TraceHistory) -> (Ref, Bin) {
        let mut r = ROOT_REF;
        let mut b = self.root_bin;

        rs.push(r);
        while target != b {
            let left = target < b;
            if !self.half_is_ref(r, left) {
                break;
            }
            r = self.cell(r).half(left);
            b = if left { b.left() } else { b.right() };
            rs.push(r);
        }
        (r, b)
    }

    pub fn set(&mut self, b: Bin) {
        self.set_bitmap(b, BITMAP_FILLED);
    }

    pub fn reset(&mut self, b: Bin) {
        self.set_bitmap(b, BITMAP_EMPTY);
    }

    fn set_bitmap(&mut self, b: Bin, value: u32) {
        if b.is_none() {
            return;
        }
        if b.layer_bits() > BITMAP_LAYER_BITS {
            self.set_high_layer_bitmap(b, value);
        }
        else {
            self.set_low_layer_bitmap(b, value);
        }
    }

    /// marks every bin to the left of `b` as filled
    pub fn fill_before(&mut self, b: Bin) {
        self.walk_before(b, BITMAP_FILLED);
    }

    /// marks every bin to the left of `b` as empty
    pub fn reset_before(&mut self, b: Bin) {
        self.walk_before(b, BITMAP_EMPTY);
    }

    fn walk_before(&mut self, b: Bin, value: u32) {
        let mut b = b.layer_left();
        while !b.is_none() {
            if b.is_left() {
                self.set_bitmap(b, value);
                b = b.parent().layer_left();
            }
            else {
                b = b.parent();
            }
        }
    }

    /// adds a chain of cells from `r` at `b` down to `pre_bin`, each initialized with `bm`
    fn split_down_to(&mut self, mut r: Ref, mut b: Bin, pre_bin: Bin, bm: u32) -> (Ref, Bin) {
        self.reserve_cells((b.layer() - pre_bin.layer()) as usize);

        loop {
            let nr = self.alloc_cell();
            *self.cell_mut(nr) = Cell { left: bm, right: bm };

            let left = pre_bin < b;
            self.cell_mut(r).set_half(left, nr);
            self.set_half_is_ref(r, left, true);
            b = if left { b.left() } else { b.right() };

            r = nr;
            if b == pre_bin {
                return (r, b);
            }
        }
    }

    fn set_low_layer_bitmap(&mut self, target: Bin, value: u32) {
        let mask = bin_bitmap(target);
        let bitmap = value & mask;

        if !self.root_bin.contains(target) {
            if bitmap == BITMAP_EMPTY {
                return;
            }
            while !self.root_bin.contains(target) {
                self.extend_root();
            }
        }

        let pre_bin = Bin((target.0 & !(BITMAP_LAYER_BITS + 1)) | BITMAP_LAYER_BITS);
        let mut history = TraceHistory::new();
        let (r, b) = self.trace_history(target, &mut history);

        let left = target < b;
        let bm = self.cell(r).half(left);
        if bm & mask == bitmap {
            return;
        }
        if b == pre_bin {
            self.cell_mut(r).set_half(left, (bm & !mask) | bitmap);
            self.pack_cells(&history);
            return;
        }

        let (r, b) = self.split_down_to(r, b, pre_bin, bm);

        let left = target < b;
        let bm = self.cell(r).half(left);
        self.cell_mut(r).set_half(left, (bm & !mask) | bitmap);
    }

    fn set_high_layer_bitmap(&mut self, target: Bin, value: u32) {
        if target.contains(self.root_bin) {
            let root = *self.cell(ROOT_REF);
            if self.left_is_ref(ROOT_REF) {
                self.free_cell(root.left);
            }
            if self.right_is_ref(ROOT_REF) {
                self.free_cell(root.right);
            }

            self.root_bin = target;
            self.set_half_is_ref(ROOT_REF, true, false);
            self.set_half_is_ref(ROOT_REF, false, false);
            *self.cell_mut(ROOT_REF) = Cell { left: value, right: value };
            return;
        }

        let pre_bin = target.parent();

        if !self.root_bin.contains(pre_bin) {
            if value == BITMAP_EMPTY {
                return;
            }
            while !self.root_bin.contains(pre_bin) {
                self.extend_root();
            }
        }

        let mut history = TraceHistory::new();
        let (r, b) = self.trace_history(pre_bin, &mut history);

        let left = target < b;
        let mut bm = BITMAP_EMPTY;
        if self.half_is_ref(r, left) {
            self.set_half_is_ref(r, left, false);
            let child = self.cell(r).half(left);
            self.free_cell(child);
        }
        else {
            bm = self.cell(r).half(left);
            if bm == value {
                return;
            }
        }
        if b == pre_bin {
            self.cell_mut(r).set_half(left, value);
            self.pack_cells(&history);
            return;
        }

        let (r, b) = self.split_down_to(r, b, pre_bin, bm);
        let left = target < b;
        self.cell_mut(r).set_half(left, value);
    }

    fn test_bin(&self, target: Bin, v: u32) -> bool {
        let (r, b) = self.trace(target);
        let c = self.cell(r);

        if target.layer_bits() > BITMAP_LAYER_BITS {
            if target < b {
                return c.left == v;
            }
            if target > b {
                return c.right == v;
            }
            return !self.has_ref(r) && c.left == v && c.right == v;
        }

        let bm = c.half(target < b);
        let mask = bin_bitmap(target);
        (bm & mask) == (v & mask)
    }

    pub fn empty(&self) -> bool {
        let c = self.cell(ROOT_REF);
        !self.has_ref(ROOT_REF) && c.left == BITMAP_EMPTY && c.right == BITMAP_EMPTY
    }

    pub fn filled(&self) -> bool {
        let c = self.cell(ROOT_REF);
        !self.has_ref(ROOT_REF) && c.left == BITMAP_FILLED && c.right == BITMAP_FILLED
    }

    /// NB: a mixed bin is neither empty nor filled
    pub fn empty_at(&self, b: Bin) -> bool {
        if !self.root_bin.contains(b) {
            return !b.contains(self.root_bin) || self.empty();
        }
        self.test_bin(b, BITMAP_EMPTY)
    }

    pub fn filled_at(&self, b: Bin) -> bool {
        if !self.root_bin.contains(b) {
            return false;
        }
        self.test_bin(b, BITMAP_FILLED)
    }

    /// The largest uniformly filled or uniformly empty bin containing `target`. Returns
    ///  [Bin::ALL] if the map is completely empty, [Bin::NONE] if `target` is mixed.
    pub fn cover(&self, target: Bin) -> Bin {
        if !self.root_bin.contains(target) {
            if !target.contains(self.root_bin) {
                return self.root_bin.sibling();
            }
            if self.empty() {
                return Bin::ALL;
            }
            return Bin::NONE;
        }

        let (r, b) = self.trace(target);
        let c = self.cell(r);

        if target.layer_bits() > BITMAP_LAYER_BITS {
            let uniform = |bm: u32| bm == BITMAP_EMPTY || bm == BITMAP_FILLED;
            if target < b {
                return if uniform(c.left) { b.left() } else { Bin::NONE };
            }
            if b < target {
                return if uniform(c.right) { b.right() } else { Bin::NONE };
            }
            if self.has_ref(r) || !c.symmetrical() {
                return Bin::NONE;
            }
            return match c.left {
                BITMAP_EMPTY => Bin::ALL,
                BITMAP_FILLED => b,
                _ => Bin::NONE,
            };
        }

        let (bm, b) = if target < b {
            (c.left, b.left())
        }
        else {
            (c.right, b.right())
        };

        if bm == BITMAP_EMPTY {
            return if self.empty() { Bin::ALL } else { b };
        }
        if bm == BITMAP_FILLED {
            return if self.filled() { self.root_bin } else { b };
        }

        let mut nb = target;
        let mut mask = bin_bitmap(nb);
        let fully_set = bm & mask == mask;
        if bm & mask != BITMAP_EMPTY && !fully_set {
            return Bin::NONE;
        }

        loop {
            let prev = nb;
            nb = nb.parent();
            mask = bin_bitmap(nb);

            let still_uniform = if fully_set {
                bm & mask == mask
            }
            else {
                bm & mask == BITMAP_EMPTY
            };
            if !still_uniform {
                return prev;
            }
        }
    }

    pub fn find_empty(&self) -> Bin {
        self.find_first(BITMAP_FILLED)
    }

    pub fn find_filled(&self) -> Bin {
        self.find_first(BITMAP_EMPTY)
    }

    /// finds the first bin that is not uniformly `skip`
    fn find_first(&self, skip: u32) -> Bin {
        let wanted = !skip;
        let c = self.cell(ROOT_REF);

        let (mut r, mut b) = if self.left_is_ref(ROOT_REF) {
            (c.left, self.root_bin.left())
        }
        else if c.left != skip {
            if c.left == wanted {
                if !self.right_is_ref(ROOT_REF) && c.right == wanted {
                    return if skip == BITMAP_FILLED { Bin::ALL } else { self.root_bin };
                }
                return self.root_bin.left();
            }
            return offset_bitmap_bin(self.root_bin.left(), c.left ^ skip);
        }
        else if self.right_is_ref(ROOT_REF) {
            (c.right, self.root_bin.right())
        }
        else {
            if c.right == skip {
                if skip == BITMAP_EMPTY {
                    return Bin::NONE;
                }
                if self.root_bin.is_all() {
                    return Bin::NONE;
                }
                return self.root_bin.sibling();
            }
            return offset_bitmap_bin(self.root_bin.right(), c.right ^ skip);
        };

        let bm = loop {
            let c = self.cell(r);
            if self.left_is_ref(r) {
                r = c.left;
                b = b.left();
            }
            else if c.left != skip {
                b = b.left();
                break c.left;
            }
            else if self.right_is_ref(r) {
                r = c.right;
                b = b.right();
            }
            else {
                b = b.right();
                break c.right;
            }
        };

        offset_bitmap_bin(b, bm ^ skip)
    }

    /// The first empty base bin at or after `target`, or `target` itself if it is empty.
    ///  Returns [Bin::NONE] if everything after `target` within the root span is filled.
    pub fn find_empty_after(&self, target: Bin) -> Bin {
        let mut b = target;
        if self.empty_at(b) {
            return b;
        }

        loop {
            if b == self.root_bin || b.is_all() {
                return Bin::NONE;
            }
            b = b.parent();
            if !self.filled_at(b.right()) && b > target {
                b = b.right();
                break;
            }
        }

        loop {
            if !self.filled_at(b.left()) && b.left() > target {
                b = b.left();
            }
            else if !self.filled_at(b.right()) {
                b = b.right();
            }
            if b.is_base() {
                return b;
            }
        }
    }

    /// The first filled base bin at or after `target`, or `target` itself if it is filled.
    pub fn find_filled_after(&self, target: Bin) -> Bin {
        let mut b = target;
        if self.filled_at(b) {
            return b;
        }
        if !self.root_bin.contains(b) {
            return Bin::NONE;
        }

        loop {
            if b == self.root_bin {
                return Bin::NONE;
            }
            b = b.parent();
            if !self.empty_at(b.right()) && b > target {
                b = b.right();
                break;
            }
        }

        loop {
            if !self.empty_at(b.left()) && b.left() > target {
                b = b.left();
            }
            else if !self.empty_at(b.right()) {
                b = b.right();
            }
            else {
                return Bin::NONE;
            }
            if b.is_base() {
                return b;
            }
        }
    }

    pub fn find_last_filled(&self) -> Bin {
        if self.empty() {
            return Bin::NONE;
        }

        let mut b = self.root_bin;
        while b.layer() != 0 {
            b = if self.empty_at(b.right()) { b.left() } else { b.right() };
        }
        b
    }

    pub fn iterate_filled_at(&self, b: Bin) -> BinIterator<'_> {
        BinIterator::filled(self, b)
    }

    pub fn iterate_empty_at(&self, b: Bin) -> BinIterator<'_> {
        BinIterator::empty(self, b)
    }

    pub fn iterate_filled(&self) -> BinIterator<'_> {
        self.iterate_filled_at(self.root_bin)
    }

    pub fn iterate_empty(&self) -> BinIterator<'_> {
        self.iterate_empty_at(self.root_bin)
    }
}

/// The leftmost bin below `b` whose chunks are all set in the (non-uniform) pattern `bm`
fn offset_bitmap_bin(b: Bin, bm: u32) -> Bin {
    if bm == BITMAP_FILLED {
        return b;
    }
    if bm == BITMAP_EMPTY {
        return Bin::NONE;
    }

    let k = bm.trailing_zeros() as u64;
    let mut cur = Bin::new(0, b.base_offset() + k);
    while cur.is_left() && cur.layer() < 5 {
        let parent = cur.parent();
        let mask = bin_bitmap(parent);
        if bm & mask != mask {
            break;
        }
        cur = parent;
    }
    cur
}

impl Debug for BinMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BinMap{{root:{},filled:{:?}}}", self.root_bin, self.iterate_filled().intervals().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn map_with(filled: &[u64]) -> BinMap {
        let mut m = BinMap::new();
        for &b in filled {
            m.set(Bin(b));
        }
        m
    }

    #[test]
    fn test_bin_bitmaps() {
        assert_eq!(BIN_BITMAPS[0], 1);
        assert_eq!(BIN_BITMAPS[1], 0b11);
        assert_eq!(BIN_BITMAPS[5], 0b1100);
        assert_eq!(BIN_BITMAPS[31], u32::MAX);
        assert_eq!(BIN_BITMAPS[47], 0xffff_0000);
        assert_eq!(BIN_BITMAPS[62], 0x8000_0000);
        assert_eq!(BIN_BITMAPS[63], u32::MAX);
    }

    #[test]
    fn test_set_get() {
        let mut m = BinMap::new();
        m.set(Bin::new(1, 0));
        assert!(m.filled_at(Bin::new(1, 0)));
        assert!(m.filled_at(Bin::new(0, 1)));
    }

    #[test]
    fn test_chess() {
        let mut chess = BinMap::new();
        for i in 0..16 {
            if i & 1 == 1 {
                chess.set(Bin::new(0, i));
            }
            else {
                chess.reset(Bin::new(0, i));
            }
        }

        for i in 0..16 {
            if i & 1 == 1 {
                assert!(chess.filled_at(Bin::new(0, i)));
            }
            else {
                assert!(chess.empty_at(Bin::new(0, i)));
            }
        }

        assert!(!chess.empty_at(Bin::new(4, 0)));
        for i in (0..16).step_by(2) {
            chess.set(Bin::new(0, i));
        }
        assert!(chess.filled_at(Bin::new(4, 0)));
        assert!(chess.filled_at(Bin::new(2, 3)));

        chess.set(Bin::new(4, 1));
        assert!(chess.filled_at(Bin::new(5, 0)));
    }

    #[test]
    fn test_staircase() {
        const TOP_LAYER: u64 = 44;
        let mut staircase = BinMap::new();
        for i in 0..TOP_LAYER {
            staircase.set(Bin::new(i, 1));
        }

        assert!(!staircase.filled_at(Bin::new(TOP_LAYER, 0)));
        assert!(!staircase.empty_at(Bin::new(TOP_LAYER, 0)));

        staircase.set(Bin::new(0, 0));
        assert!(staircase.filled_at(Bin::new(TOP_LAYER, 0)));
    }

    #[test]
    fn test_hole() {
        let mut hole = BinMap::new();
        hole.set(Bin::new(8, 0));
        hole.reset(Bin::new(6, 1));
        hole.reset(Bin::new(6, 2));

        assert!(hole.filled_at(Bin::new(6, 0)));
        assert!(hole.filled_at(Bin::new(6, 3)));
        assert!(!hole.filled_at(Bin::new(8, 0)));
        assert!(!hole.empty_at(Bin::new(8, 0)));
        assert!(hole.empty_at(Bin::new(6, 1)));
    }

    #[test]
    fn test_find() {
        let mut hole = BinMap::new();
        hole.set(Bin::new(4, 0));
        hole.reset(Bin::new(1, 1));
        hole.reset(Bin::new(0, 7));
        assert_eq!(hole.find_empty().base_left(), Bin::new(0, 2));
    }

    #[test]
    fn test_alloc() {
        let mut m = BinMap::new();
        m.set(Bin::new(1, 0));
        m.set(Bin::new(1, 1));
        m.reset(Bin::new(1, 0));
        m.reset(Bin::new(1, 1));
        assert_eq!(m.alloc_count, 1);
    }

    #[test]
    fn test_alloc_released_after_packing() {
        let mut m = BinMap::new();
        for i in 0..1000 {
            m.set(Bin::new(0, i));
        }
        assert!(m.filled_at(Bin::new(0, 999)));
        for i in 0..1024 {
            m.set(Bin::new(0, i));
        }
        assert!(m.filled_at(Bin::new(10, 0)));
        assert_eq!(m.alloc_count, 1);
    }

    #[rstest]
    #[case::inside_high_run(Bin::new(0, 30), Bin::new(4, 1))]
    #[case::inside_low_run(Bin::new(0, 3), Bin::new(2, 0))]
    #[case::run_itself(Bin::new(2, 0), Bin::new(2, 0))]
    #[case::empty_gap(Bin::new(0, 5), Bin::new(2, 1))]
    #[case::mixed(Bin::new(4, 0), Bin::NONE)]
    fn test_cover(#[case] target: Bin, #[case] expected: Bin) {
        let mut m = BinMap::new();
        m.set(Bin::new(2, 0));
        m.set(Bin::new(4, 1));
        assert_eq!(m.cover(target), expected);
    }

    #[test]
    fn test_cover_uniform() {
        let mut m = BinMap::new();
        assert_eq!(m.cover(Bin(4)), Bin::ALL);
        m.set(Bin(63));
        assert_eq!(m.cover(Bin(4)), Bin(63));
        assert_eq!(m.cover(Bin(200)), Bin(63).sibling());
    }

    #[test]
    fn test_cover_contains_target() {
        let m = map_with(&[2, 9, 19, 24, 77, 300]);
        for b in 0..700u64 {
            let cover = m.cover(Bin(b));
            if cover.is_none() {
                assert!(!m.filled_at(Bin(b)) && !m.empty_at(Bin(b)), "{}", b);
                continue;
            }
            if cover.is_all() {
                continue;
            }
            assert!(cover.contains(Bin(b)), "cover {} of {}", cover, b);
            assert!(m.filled_at(cover) || m.empty_at(cover), "cover {} of {}", cover, b);
        }
    }

    #[test]
    fn test_seq_length() {
        let mut m = BinMap::new();
        m.set(Bin::new(3, 0));
        m.set(Bin::new(1, 4));
        m.set(Bin::new(0, 10));
        m.set(Bin::new(3, 2));
        assert_eq!(m.find_empty().base_offset(), 11);
    }

    #[test]
    fn test_empty_filled() {
        let mut m = BinMap::new();
        assert!(m.empty_at(Bin::ALL));

        m.set(Bin::new(1, 0));
        m.set(Bin::new(0, 2));
        m.set(Bin::new(0, 6));
        m.set(Bin::new(1, 5));
        m.set(Bin::new(0, 9));

        assert!(!m.empty_at(Bin::ALL));
        assert!(m.empty_at(Bin::new(2, 3)));
        assert!(!m.filled_at(Bin::new(2, 3)));
        assert!(m.filled_at(Bin::new(1, 0)));
        assert!(m.filled_at(Bin::new(1, 5)));
        assert!(!m.filled_at(Bin::new(1, 3)));

        m.set(Bin::new(0, 3));
        m.set(Bin::new(0, 7));
        m.set(Bin::new(0, 8));

        assert!(m.filled_at(Bin::new(2, 0)));
        assert!(m.filled_at(Bin::new(2, 2)));
        assert!(!m.filled_at(Bin::new(2, 1)));

        m.set(Bin::new(1, 2));
        assert!(m.filled_at(Bin::new(2, 1)));
    }

    #[test]
    fn test_set_reset_random() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut m = BinMap::new();
        for _ in 0..10_000 {
            let b = Bin(rng.random_range(0..20_000));
            if rng.random_bool(0.5) {
                m.set(b);
                assert!(m.filled_at(b));
                assert!(!m.empty_at(b));
            }
            else {
                m.reset(b);
                assert!(m.empty_at(b));
                assert!(!m.filled_at(b));
            }
        }
    }

    #[test]
    fn test_find_empty_after() {
        let mut hole = BinMap::new();
        for s in 0..8 {
            for i in s..8 {
                hole.set(Bin::new(3, 0));
                hole.reset(Bin::new(0, i));
                assert_eq!(hole.find_empty_after(Bin::new(0, s)), Bin::new(0, i));
            }
        }
    }

    #[test]
    fn test_find_empty_after_skips_filled_run() {
        let m = map_with(&[2, 5]);
        assert_eq!(m.find_empty_after(Bin(2)), Bin(8));
    }

    #[test]
    fn test_find_empty_after_full_root() {
        let m = map_with(&[63]);
        assert_eq!(m.find_empty_after(Bin(10)), Bin::NONE);
    }

    #[test]
    fn test_find_empty_after_sanity() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut m = BinMap::new();
        let n = 1_000u64;
        for _ in 0..n {
            let b = Bin(rng.random_range(0..n));
            if rng.random_bool(0.5) {
                m.set(b);
            }
            else {
                m.reset(b);
            }

            let b = Bin(rng.random_range(0..n));
            let next = m.find_empty_after(b);
            assert!(next.is_none() || m.empty_at(next), "next empty after {} bin {} should be empty", b, next);
            assert!(next >= b.base_left(), "next empty after {} bin {} should not be before it", b, next);
        }
    }

    #[test]
    fn test_find_filled_1() {
        let mut hole = BinMap::new();
        hole.set(Bin::new(3, 0));
        hole.reset(Bin::new(0, 0));
        assert_eq!(hole.find_filled(), Bin::new(0, 1));
    }

    #[test]
    fn test_find_filled_2() {
        let mut hole = BinMap::new();
        hole.set(Bin::new(3, 0));
        hole.reset(Bin::new(0, 1));
        assert_eq!(hole.find_filled(), Bin::new(0, 0));
    }

    #[test]
    fn test_find_filled_3() {
        let mut hole = BinMap::new();
        hole.set(Bin::new(3, 0));
        hole.reset(Bin::new(2, 0));
        assert_eq!(hole.find_filled().base_left(), Bin::new(0, 4));
    }

    #[test]
    fn test_find_filled_uniform() {
        assert_eq!(BinMap::new().find_filled(), Bin::NONE);
        assert_eq!(map_with(&[63]).find_filled(), Bin(63));
        assert_eq!(BinMap::new().find_empty(), Bin::ALL);
    }

    #[rstest]
    #[case::simple(vec![1, 4, 9], 6, 8)]
    #[case::inside(vec![2047], 4014, 4014)]
    #[case::scattered(vec![2447, 2471, 2481, 2511, 2535, 2545], 2484, 2496)]
    #[case::neighbours(vec![62218, 62282], 62220, 62282)]
    #[case::far(vec![83156], 41012, 83156)]
    #[case::after_gap(vec![27922, 33531], 33462, 33528)]
    fn test_find_filled_after(#[case] filled: Vec<u64>, #[case] bin: u64, #[case] expected: u64) {
        let m = map_with(&filled);
        assert_eq!(m.find_filled_after(Bin(bin)), Bin(expected));
    }

    #[test]
    fn test_find_filled_after_sanity() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut m = BinMap::new();
        let n = 1_000u64;
        for _ in 0..n {
            let b = Bin(rng.random_range(0..n));
            if rng.random_bool(0.5) {
                m.set(b);
            }
            else {
                m.reset(b);
            }

            let b = Bin(rng.random_range(0..n));
            let next = m.find_filled_after(b);
            assert!(next.is_none() || m.filled_at(next), "next filled after {} bin {} should be filled", b, next);
            assert!(next >= b.base_left(), "next filled after {} bin {} should not be before it", b, next);
        }
    }

    #[test]
    fn test_find_last_filled() {
        assert_eq!(BinMap::new().find_last_filled(), Bin::NONE);
        assert_eq!(map_with(&[4, 9, 300]).find_last_filled(), Bin(300));
        assert_eq!(map_with(&[7]).find_last_filled(), Bin(14));
    }

    #[test]
    fn test_fill_before() {
        for i in (2..32).step_by(2) {
            let mut m = BinMap::new();
            m.fill_before(Bin(i));
            for b in (0..i).step_by(2) {
                assert!(m.filled_at(Bin(b)));
            }
            assert!(!m.filled_at(Bin(i)));
        }
    }

    #[test]
    fn test_reset_before() {
        let mut m = map_with(&[255]);
        m.reset_before(Bin(100));
        for b in (0..100).step_by(2) {
            assert!(m.empty_at(Bin(b)), "{}", b);
        }
        for b in (100..256).step_by(2) {
            assert!(m.filled_at(Bin(b)), "{}", b);
        }
    }

    #[test]
    fn test_clone_is_independent() {
        let mut m = map_with(&[5, 77]);
        let c = m.clone();
        m.reset(Bin(5));
        assert!(c.filled_at(Bin(5)));
        assert!(m.empty_at(Bin(5)));
    }

    #[test]
    #[should_panic]
    fn test_unbounded_growth_panics() {
        let mut m = BinMap::new();
        for i in 0..10_000u64 {
            m.set(Bin::new(0, i * i));
        }
    }
}
