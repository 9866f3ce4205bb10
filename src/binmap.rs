//! Compressed set of bins with solid-subtree collapse.
//!
//! The map is a tree of fixed-size cells held in one `Vec` arena. Each cell
//! has two halves covering the left and right subtree of the cell's bin;
//! a half is either a 32-bit leaf bitmap (one bit per base bin of a 32-chunk
//! subtree) or an index of a child cell. Solid regions never materialise
//! cells: after every mutation the touched path is re-packed so that a cell
//! whose halves are two equal bitmaps is folded back into its parent.
//! Unused cells are threaded into a free list through their `left` word, so
//! allocation and release are O(1) and the arena stays dense for
//! serialisation.
//!
//! `find_complement` — the engine under every piece picker — walks two maps
//! at once with an explicit stack; the visiting order of the two halves of
//! each frame is taken from the `twist` bit matching the frame's width,
//! which de-synchronises otherwise identical sequential pickers.

use crate::bin::Bin;
use crate::error::AllocationError;

use std::io::{self, BufRead, Write};

/// Index of a cell in the arena.
pub type CellRef = u32;

type Bitmap = u32;

const BITMAP_EMPTY: Bitmap = 0;
const BITMAP_FILLED: Bitmap = u32::MAX;

/// A leaf bitmap covers bins with at most this many layer bits
/// (a 32-chunk subtree: layers 0..=5).
const BITMAP_LAYER_BITS: u64 = 2 * 32 - 1;

const ROOT_REF: CellRef = 0;

const FLAG_LEFT_REF: u8 = 0b001;
const FLAG_RIGHT_REF: u8 = 0b010;
const FLAG_FREE: u8 = 0b100;

#[derive(Clone, Copy, Default)]
struct Cell {
    /// Bitmap or child ref; free-list link while the cell is free.
    left: u32,
    right: u32,
    flags: u8,
}

impl Cell {
    #[inline]
    fn is_left_ref(&self) -> bool {
        self.flags & FLAG_LEFT_REF != 0
    }
    #[inline]
    fn is_right_ref(&self) -> bool {
        self.flags & FLAG_RIGHT_REF != 0
    }
    #[inline]
    fn is_free(&self) -> bool {
        self.flags & FLAG_FREE != 0
    }
}

/// Mask of base-bin bits covered by bin value `v` within its 32-chunk
/// subtree (`v` is the bin's low 6 bits; 63 means the whole subtree).
#[inline]
fn bin_bitmap(v: u64) -> Bitmap {
    debug_assert!(v <= BITMAP_LAYER_BITS);
    if v == BITMAP_LAYER_BITS {
        return BITMAP_FILLED;
    }
    let b = Bin::from_u64(v);
    let width = b.base_length();
    let lo = b.base_offset();
    if width >= 32 {
        BITMAP_FILLED
    } else {
        (((1u32 << width) - 1) as Bitmap) << lo
    }
}

/// In-subtree bin value (0..=62) of the largest solid-filled bin starting at
/// the lowest set bit of `b`.
fn first_solid_bin(b: Bitmap) -> u64 {
    debug_assert!(b != BITMAP_EMPTY);
    let i = b.trailing_zeros() as u64;
    let mut layer = 0u32;
    while layer < 5 {
        let width = 1u64 << (layer + 1);
        if i % width != 0 || i + width > 32 {
            break;
        }
        let mask = (((1u64 << width) - 1) << i) as u64;
        if (b as u64) & mask != mask {
            break;
        }
        layer += 1;
    }
    ((i >> layer) << (layer + 1)) | ((1u64 << layer) - 1)
}

/// Largest solid-filled bin of `bitmap`, positioned under the half-bin `bin`.
fn bitmap_to_bin(bin: Bin, bitmap: Bitmap) -> Bin {
    debug_assert!(bitmap != BITMAP_EMPTY);
    if bitmap == BITMAP_FILLED {
        return bin;
    }
    Bin::from_u64(bin.base_left().to_u64() + first_solid_bin(bitmap))
}

/// Compressed map bin -> {empty, filled}.
pub struct Binmap {
    cells: Vec<Cell>,
    allocated: usize,
    free_top: CellRef,
    root_bin: Bin,
}

impl Default for Binmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Binmap {
    pub fn new() -> Binmap {
        let mut map = Binmap {
            cells: Vec::new(),
            allocated: 0,
            free_top: ROOT_REF,
            // One cell covers 64 chunks: a layer-6 root.
            root_bin: Bin::from_u64(63),
        };
        let root = map.alloc_cell().expect("fresh arena");
        debug_assert_eq!(root, ROOT_REF);
        map
    }

    /// Root bin currently covered by the map. Grows on demand.
    pub fn root_bin(&self) -> Bin {
        self.root_bin
    }

    /// Number of live (allocated) cells.
    pub fn cell_count(&self) -> usize {
        self.allocated
    }

    /*
     * Arena plumbing
     */

    fn alloc_cell_dirty(&mut self) -> CellRef {
        debug_assert!(self.allocated < self.cells.len());
        let r = self.free_top;
        debug_assert!(self.cells[r as usize].is_free());
        self.free_top = self.cells[r as usize].left;
        self.cells[r as usize].flags &= !FLAG_FREE;
        self.allocated += 1;
        r
    }

    fn alloc_cell(&mut self) -> Result<CellRef, AllocationError> {
        self.reserve_cells(1)?;
        let r = self.alloc_cell_dirty();
        self.cells[r as usize] = Cell::default();
        Ok(r)
    }

    fn reserve_cells(&mut self, count: usize) -> Result<(), AllocationError> {
        if self.cells.len() - self.allocated >= count {
            return Ok(());
        }
        let old = self.cells.len();
        let new = 16usize.max(2 * old).max(self.allocated + count);
        if new > CellRef::MAX as usize {
            return Err(AllocationError::RefLimit);
        }
        self.cells.resize(new, Cell::default());
        // Thread the new cells into the free list, highest first so the
        // lowest new index comes out of the list first.
        for idx in (old..new).rev() {
            self.cells[idx].flags = FLAG_FREE;
            self.cells[idx].left = if idx + 1 < new {
                (idx + 1) as CellRef
            } else {
                self.free_top
            };
        }
        self.free_top = old as CellRef;
        Ok(())
    }

    /// Release `r` and its whole subtree back to the free list.
    fn free_cell(&mut self, r: CellRef) {
        debug_assert!(r != ROOT_REF);
        debug_assert!(!self.cells[r as usize].is_free());
        let cell = self.cells[r as usize];
        if cell.is_left_ref() {
            self.free_cell(cell.left);
        }
        if cell.is_right_ref() {
            self.free_cell(cell.right);
        }
        let c = &mut self.cells[r as usize];
        c.flags = FLAG_FREE;
        c.left = self.free_top;
        self.free_top = r;
        self.allocated -= 1;
    }

    /// Root one layer up; the old root cell becomes the new left half.
    fn extend_root(&mut self) -> Result<(), AllocationError> {
        debug_assert!(!self.root_bin.is_all());
        let root = self.cells[ROOT_REF as usize];
        if !root.is_left_ref() && !root.is_right_ref() && root.left == root.right {
            // Solid root: both halves of the taller root hold the same value.
            self.cells[ROOT_REF as usize].right = BITMAP_EMPTY;
        } else {
            let r = self.alloc_cell()?;
            self.cells[r as usize] = self.cells[ROOT_REF as usize];
            let c = &mut self.cells[ROOT_REF as usize];
            c.flags = FLAG_LEFT_REF;
            c.left = r;
            c.right = BITMAP_EMPTY;
        }
        self.root_bin = self.root_bin.parent();
        Ok(())
    }

    /// Collapse the traced path bottom-up while cells are uniform.
    /// `history` holds the refs from the root down to the mutated cell.
    fn pack_cells(&mut self, history: &[CellRef]) {
        let mut i = match history.len().checked_sub(1) {
            Some(i) => i,
            None => return,
        };
        let r = history[i];
        if r == ROOT_REF {
            return;
        }
        let c = self.cells[r as usize];
        if c.is_left_ref() || c.is_right_ref() || c.left != c.right {
            return;
        }
        let bitmap = c.left;
        loop {
            i -= 1;
            let r2 = history[i];
            let c2 = self.cells[r2 as usize];
            if !c2.is_left_ref() {
                if c2.left != bitmap {
                    break;
                }
            } else if !c2.is_right_ref() {
                if c2.right != bitmap {
                    break;
                }
            } else {
                break;
            }
            if r2 == ROOT_REF {
                break;
            }
        }
        let anc = history[i];
        let par = history[i + 1];
        let c2 = &mut self.cells[anc as usize];
        if c2.is_left_ref() && c2.left == par {
            c2.flags &= !FLAG_LEFT_REF;
            c2.left = bitmap;
        } else {
            debug_assert!(c2.is_right_ref() && c2.right == par);
            c2.flags &= !FLAG_RIGHT_REF;
            c2.right = bitmap;
        }
        self.free_cell(par);
    }

    /// Descend from the root toward `target`, stopping at `target`'s cell or
    /// at the last cell on the path. Returns (cell ref, cell bin).
    fn trace(&self, target: Bin) -> (CellRef, Bin) {
        debug_assert!(self.root_bin.contains(target));
        let mut cur_ref = ROOT_REF;
        let mut cur_bin = self.root_bin;
        while target != cur_bin {
            let cell = &self.cells[cur_ref as usize];
            if target < cur_bin {
                if cell.is_left_ref() {
                    cur_ref = cell.left;
                    cur_bin = cur_bin.left();
                } else {
                    break;
                }
            } else if cell.is_right_ref() {
                cur_ref = cell.right;
                cur_bin = cur_bin.right();
            } else {
                break;
            }
        }
        debug_assert!(cur_bin.layer_bits() > BITMAP_LAYER_BITS);
        (cur_ref, cur_bin)
    }

    /// As `trace`, also recording the refs walked (root first).
    fn trace_history(&self, target: Bin, history: &mut Vec<CellRef>) -> (CellRef, Bin) {
        debug_assert!(self.root_bin.contains(target));
        let mut cur_ref = ROOT_REF;
        let mut cur_bin = self.root_bin;
        history.push(ROOT_REF);
        while target != cur_bin {
            let cell = &self.cells[cur_ref as usize];
            if target < cur_bin {
                if cell.is_left_ref() {
                    cur_ref = cell.left;
                    cur_bin = cur_bin.left();
                } else {
                    break;
                }
            } else if cell.is_right_ref() {
                cur_ref = cell.right;
                cur_bin = cur_bin.right();
            } else {
                break;
            }
            history.push(cur_ref);
        }
        debug_assert!(cur_bin.layer_bits() > BITMAP_LAYER_BITS);
        (cur_ref, cur_bin)
    }

    /*
     * Queries
     */

    /// Whole-map emptiness: constant time on the root cell.
    pub fn is_empty(&self) -> bool {
        let c = &self.cells[ROOT_REF as usize];
        !c.is_left_ref() && !c.is_right_ref() && c.left == BITMAP_EMPTY && c.right == BITMAP_EMPTY
    }

    /// Whole-map fullness. Only a map grown to `ALL` can be full.
    pub fn is_filled(&self) -> bool {
        let c = &self.cells[ROOT_REF as usize];
        self.root_bin.is_all()
            && !c.is_left_ref()
            && !c.is_right_ref()
            && c.left == BITMAP_FILLED
            && c.right == BITMAP_FILLED
    }

    pub fn is_empty_in(&self, bin: Bin) -> bool {
        if bin.is_none() {
            return true;
        }
        if !self.root_bin.contains(bin) {
            return !bin.contains(self.root_bin) || self.is_empty();
        }
        let (cur_ref, cur_bin) = self.trace(bin);
        let cell = &self.cells[cur_ref as usize];
        if bin.layer_bits() > BITMAP_LAYER_BITS {
            if bin < cur_bin {
                return cell.left == BITMAP_EMPTY;
            }
            if cur_bin < bin {
                return cell.right == BITMAP_EMPTY;
            }
            return !cell.is_left_ref()
                && !cell.is_right_ref()
                && cell.left == BITMAP_EMPTY
                && cell.right == BITMAP_EMPTY;
        }
        debug_assert!(bin != cur_bin);
        let bm = if bin < cur_bin { cell.left } else { cell.right };
        bm & bin_bitmap(bin.to_u64() & BITMAP_LAYER_BITS) == BITMAP_EMPTY
    }

    pub fn is_filled_in(&self, bin: Bin) -> bool {
        if bin.is_none() {
            return false;
        }
        if !self.root_bin.contains(bin) {
            return false;
        }
        let (cur_ref, cur_bin) = self.trace(bin);
        let cell = &self.cells[cur_ref as usize];
        if bin.layer_bits() > BITMAP_LAYER_BITS {
            if bin < cur_bin {
                return cell.left == BITMAP_FILLED;
            }
            if cur_bin < bin {
                return cell.right == BITMAP_FILLED;
            }
            return !cell.is_left_ref()
                && !cell.is_right_ref()
                && cell.left == BITMAP_FILLED
                && cell.right == BITMAP_FILLED;
        }
        debug_assert!(bin != cur_bin);
        let bm = if bin < cur_bin { cell.left } else { cell.right };
        let mask = bin_bitmap(bin.to_u64() & BITMAP_LAYER_BITS);
        bm & mask == mask
    }

    /// The topmost solid (all-filled or all-empty) bin containing `bin`;
    /// `NONE` when `bin` straddles filled and empty regions.
    pub fn cover(&self, bin: Bin) -> Bin {
        if !self.root_bin.contains(bin) {
            if !bin.contains(self.root_bin) {
                return self.root_bin.sibling();
            }
            if self.is_empty() {
                return Bin::ALL;
            }
            return Bin::NONE;
        }
        let (cur_ref, mut cur_bin) = self.trace(bin);
        let cell = &self.cells[cur_ref as usize];
        if bin.layer_bits() > BITMAP_LAYER_BITS {
            if bin < cur_bin {
                if cell.left == BITMAP_EMPTY || cell.left == BITMAP_FILLED {
                    return cur_bin.left();
                }
                return Bin::NONE;
            }
            if cur_bin < bin {
                if cell.right == BITMAP_EMPTY || cell.right == BITMAP_FILLED {
                    return cur_bin.right();
                }
                return Bin::NONE;
            }
            if cell.is_left_ref() || cell.is_right_ref() || cell.left != cell.right {
                return Bin::NONE;
            }
            if cell.left == BITMAP_EMPTY {
                return Bin::ALL;
            }
            if cell.left == BITMAP_FILLED {
                return cur_bin;
            }
            return Bin::NONE;
        }
        debug_assert!(bin != cur_bin);
        let bm = if bin < cur_bin {
            cur_bin = cur_bin.left();
            cell.left
        } else {
            cur_bin = cur_bin.right();
            cell.right
        };
        if bm == BITMAP_EMPTY {
            if self.is_empty() {
                return Bin::ALL;
            }
            return cur_bin;
        }
        if bm == BITMAP_FILLED {
            if self.is_filled() {
                return Bin::ALL;
            }
            return cur_bin;
        }
        // Inside the bitmap: widen while the value stays uniform.
        let mut b = bin;
        let mut mask = bin_bitmap(b.to_u64() & BITMAP_LAYER_BITS);
        let mut best;
        if bm & mask == BITMAP_EMPTY {
            loop {
                best = b;
                b = b.parent();
                mask = bin_bitmap(b.to_u64() & BITMAP_LAYER_BITS);
                if bm & mask != BITMAP_EMPTY {
                    return best;
                }
            }
        } else if bm & mask == mask {
            loop {
                best = b;
                b = b.parent();
                mask = bin_bitmap(b.to_u64() & BITMAP_LAYER_BITS);
                if bm & mask != mask {
                    return best;
                }
            }
        }
        Bin::NONE
    }

    /// First empty base bin in in-order traversal; `NONE` when full.
    pub fn find_empty(&self) -> Bin {
        let found = self.find_extreme(BITMAP_FILLED);
        if found.is_none() {
            Bin::NONE
        } else {
            found.base_left()
        }
    }

    /// First filled base bin; `NONE` when empty.
    pub fn find_filled(&self) -> Bin {
        let found = self.find_extreme(BITMAP_EMPTY);
        if found.is_none() {
            Bin::NONE
        } else {
            found.base_left()
        }
    }

    /// Walk to the leftmost half whose bitmap differs from `skip`
    /// (FILLED -> looking for empty, EMPTY -> looking for filled).
    fn find_extreme(&self, skip: Bitmap) -> Bin {
        let root = &self.cells[ROOT_REF as usize];
        let mut cur_ref;
        let mut cur_bin;
        let bitmap;
        'walk: {
            if root.is_left_ref() {
                cur_ref = root.left;
                cur_bin = self.root_bin.left();
            } else if root.left != skip {
                if root.left == BITMAP_EMPTY && skip == BITMAP_FILLED {
                    // Searching for empty and the left half is all empty.
                    if !root.is_right_ref() && root.right == BITMAP_EMPTY {
                        return Bin::ALL;
                    }
                    return self.root_bin.left();
                }
                if root.left == BITMAP_FILLED && skip == BITMAP_EMPTY {
                    if !root.is_right_ref() && root.right == BITMAP_FILLED {
                        return self.root_bin;
                    }
                    return self.root_bin.left();
                }
                bitmap = root.left;
                cur_bin = self.root_bin.left();
                break 'walk;
            } else if root.is_right_ref() {
                cur_ref = root.right;
                cur_bin = self.root_bin.right();
            } else {
                if root.right == skip {
                    // Uniform map; for find_empty the region beyond the
                    // root is still empty unless the root is ALL.
                    if skip == BITMAP_FILLED && !self.root_bin.is_all() {
                        return self.root_bin.sibling();
                    }
                    return Bin::NONE;
                }
                bitmap = root.right;
                cur_bin = self.root_bin.right();
                break 'walk;
            }
            loop {
                let cell = &self.cells[cur_ref as usize];
                if cell.is_left_ref() {
                    cur_ref = cell.left;
                    cur_bin = cur_bin.left();
                } else if cell.left != skip {
                    bitmap = cell.left;
                    cur_bin = cur_bin.left();
                    break 'walk;
                } else if cell.is_right_ref() {
                    cur_ref = cell.right;
                    cur_bin = cur_bin.right();
                } else {
                    debug_assert!(cell.right != skip);
                    bitmap = cell.right;
                    cur_bin = cur_bin.right();
                    break 'walk;
                }
            }
        }
        if skip == BITMAP_FILLED {
            bitmap_to_bin(cur_bin, !bitmap)
        } else {
            bitmap_to_bin(cur_bin, bitmap)
        }
    }

    /// First empty base bin at or to the right of `start`; `NONE` when
    /// everything from `start` to the end of the root's range is filled.
    pub fn find_empty_from(&self, start: Bin) -> Bin {
        let start = start.base_left();
        if self.is_empty_in(start) {
            return start;
        }
        // Climb from start; each time we sit in a left child, the sibling
        // subtree lies entirely to the right and may hold the first empty.
        let mut cur = start;
        while self.root_bin.contains(cur) && cur != self.root_bin {
            let parent = cur.parent();
            if cur.is_left() && !self.is_filled_in(parent.right()) {
                return self.leftmost_empty_base(parent.right());
            }
            cur = parent;
        }
        Bin::NONE
    }

    /// Leftmost empty base bin of a subtree known to contain one.
    fn leftmost_empty_base(&self, mut bin: Bin) -> Bin {
        while !bin.is_base() {
            if !self.is_filled_in(bin.left()) {
                bin = bin.left();
            } else {
                bin = bin.right();
            }
        }
        debug_assert!(self.is_empty_in(bin));
        bin
    }

    /*
     * Mutation
     */

    pub fn set(&mut self, bin: Bin) {
        let _ = self.try_set(bin);
    }

    pub fn reset(&mut self, bin: Bin) {
        let _ = self.try_reset(bin);
    }

    /// `set` that surfaces arena exhaustion; the map is unchanged on error.
    pub fn try_set(&mut self, bin: Bin) -> Result<(), AllocationError> {
        if bin.is_none() {
            return Ok(());
        }
        if bin.layer_bits() > BITMAP_LAYER_BITS {
            self.set_high_layer_bitmap(bin, BITMAP_FILLED)
        } else {
            self.set_low_layer_bitmap(bin, BITMAP_FILLED)
        }
    }

    pub fn try_reset(&mut self, bin: Bin) -> Result<(), AllocationError> {
        if bin.is_none() {
            return Ok(());
        }
        if bin.layer_bits() > BITMAP_LAYER_BITS {
            self.set_high_layer_bitmap(bin, BITMAP_EMPTY)
        } else {
            self.set_low_layer_bitmap(bin, BITMAP_EMPTY)
        }
    }

    /// Empty the whole map without shrinking the root.
    pub fn clear(&mut self) {
        let cell = self.cells[ROOT_REF as usize];
        if cell.is_left_ref() {
            self.free_cell(cell.left);
        }
        if cell.is_right_ref() {
            self.free_cell(cell.right);
        }
        let c = &mut self.cells[ROOT_REF as usize];
        c.flags = 0;
        c.left = BITMAP_EMPTY;
        c.right = BITMAP_EMPTY;
    }

    /// Write `value` into the bitmap bits of a bin at layer <= 5.
    fn set_low_layer_bitmap(&mut self, bin: Bin, value: Bitmap) -> Result<(), AllocationError> {
        debug_assert!(bin.layer_bits() <= BITMAP_LAYER_BITS);
        let mask = bin_bitmap(bin.to_u64() & BITMAP_LAYER_BITS);
        let bits = value & mask;

        if !self.root_bin.contains(bin) {
            if bits == BITMAP_EMPTY {
                return Ok(());
            }
            while !self.root_bin.contains(bin) {
                self.extend_root()?;
            }
        }

        // The layer-6 bin whose cell holds this bin's bitmap half.
        let pre_bin = Bin::from_u64((bin.to_u64() & !(BITMAP_LAYER_BITS + 1)) | BITMAP_LAYER_BITS);

        let mut history = Vec::with_capacity(64);
        let (mut cur_ref, mut cur_bin) = self.trace_history(pre_bin, &mut history);

        let filler;
        {
            let cell = &mut self.cells[cur_ref as usize];
            if bin < cur_bin {
                debug_assert!(!cell.is_left_ref());
                if cell.left & mask == bits {
                    return Ok(());
                }
                if cur_bin == pre_bin {
                    cell.left = (cell.left & !mask) | bits;
                    self.pack_cells(&history);
                    return Ok(());
                }
                filler = cell.left;
            } else {
                debug_assert!(!cell.is_right_ref());
                if cell.right & mask == bits {
                    return Ok(());
                }
                if cur_bin == pre_bin {
                    cell.right = (cell.right & !mask) | bits;
                    self.pack_cells(&history);
                    return Ok(());
                }
                filler = cell.right;
            }
        }

        // Unpack the uniform region down to pre_bin.
        self.reserve_cells((cur_bin.layer() - pre_bin.layer()) as usize)?;
        loop {
            let r = self.alloc_cell_dirty();
            self.cells[r as usize] = Cell {
                left: filler,
                right: filler,
                flags: 0,
            };
            let parent = &mut self.cells[cur_ref as usize];
            if pre_bin < cur_bin {
                parent.flags |= FLAG_LEFT_REF;
                parent.left = r;
                cur_bin = cur_bin.left();
            } else {
                parent.flags |= FLAG_RIGHT_REF;
                parent.right = r;
                cur_bin = cur_bin.right();
            }
            cur_ref = r;
            if cur_bin == pre_bin {
                break;
            }
        }
        let cell = &mut self.cells[cur_ref as usize];
        if bin < cur_bin {
            cell.left = (cell.left & !mask) | bits;
        } else {
            cell.right = (cell.right & !mask) | bits;
        }
        Ok(())
    }

    /// Make a bin at layer >= 6 uniformly `value`.
    fn set_high_layer_bitmap(&mut self, bin: Bin, value: Bitmap) -> Result<(), AllocationError> {
        debug_assert!(bin.layer_bits() > BITMAP_LAYER_BITS);

        if bin.contains(self.root_bin) {
            let cell = self.cells[ROOT_REF as usize];
            if cell.is_left_ref() {
                self.free_cell(cell.left);
            }
            if cell.is_right_ref() {
                self.free_cell(cell.right);
            }
            self.root_bin = bin;
            let c = &mut self.cells[ROOT_REF as usize];
            c.flags = 0;
            c.left = value;
            c.right = value;
            return Ok(());
        }

        let pre_bin = bin.parent();
        if !self.root_bin.contains(pre_bin) {
            if value == BITMAP_EMPTY {
                return Ok(());
            }
            while !self.root_bin.contains(pre_bin) {
                self.extend_root()?;
            }
        }

        let mut history = Vec::with_capacity(64);
        let (mut cur_ref, mut cur_bin) = self.trace_history(pre_bin, &mut history);

        let mut filler = BITMAP_EMPTY;
        {
            if bin < cur_bin {
                let cell = self.cells[cur_ref as usize];
                if cell.is_left_ref() {
                    debug_assert!(cur_bin == pre_bin);
                    self.cells[cur_ref as usize].flags &= !FLAG_LEFT_REF;
                    self.free_cell(cell.left);
                } else {
                    filler = cell.left;
                    if filler == value {
                        return Ok(());
                    }
                }
                if cur_bin == pre_bin {
                    self.cells[cur_ref as usize].left = value;
                    self.pack_cells(&history);
                    return Ok(());
                }
            } else {
                let cell = self.cells[cur_ref as usize];
                if cell.is_right_ref() {
                    debug_assert!(cur_bin == pre_bin);
                    self.cells[cur_ref as usize].flags &= !FLAG_RIGHT_REF;
                    self.free_cell(cell.right);
                } else {
                    filler = cell.right;
                    if filler == value {
                        return Ok(());
                    }
                }
                if cur_bin == pre_bin {
                    self.cells[cur_ref as usize].right = value;
                    self.pack_cells(&history);
                    return Ok(());
                }
            }
        }

        self.reserve_cells((cur_bin.layer() - pre_bin.layer()) as usize)?;
        loop {
            let r = self.alloc_cell_dirty();
            self.cells[r as usize] = Cell {
                left: filler,
                right: filler,
                flags: 0,
            };
            let parent = &mut self.cells[cur_ref as usize];
            if pre_bin < cur_bin {
                parent.flags |= FLAG_LEFT_REF;
                parent.left = r;
                cur_bin = cur_bin.left();
            } else {
                parent.flags |= FLAG_RIGHT_REF;
                parent.right = r;
                cur_bin = cur_bin.right();
            }
            cur_ref = r;
            if cur_bin == pre_bin {
                break;
            }
        }
        let cell = &mut self.cells[cur_ref as usize];
        if bin < cur_bin {
            cell.left = value;
        } else {
            cell.right = value;
        }
        Ok(())
    }

    /*
     * Copy
     */

    /// Replace `dst` wholesale with `src`.
    pub fn copy(dst: &mut Binmap, src: &Binmap) {
        dst.root_bin = src.root_bin;
        Self::copy_cells(dst, ROOT_REF, src, ROOT_REF);
    }

    /// Replace the `range` subtree of `dst` with the same subtree of `src`.
    pub fn copy_range(dst: &mut Binmap, src: &Binmap, range: Bin) {
        if range.contains(dst.root_bin) {
            if src.root_bin.contains(range) {
                let (sref, _sbin) = src.trace(range);
                dst.root_bin = range;
                Self::copy_cells(dst, ROOT_REF, src, sref);
            } else if range.contains(src.root_bin) {
                dst.root_bin = src.root_bin;
                Self::copy_cells(dst, ROOT_REF, src, ROOT_REF);
            } else {
                dst.reset(range);
            }
            return;
        }
        if src.root_bin.contains(range) {
            let (sref, sbin) = src.trace(range);
            let cell = src.cells[sref as usize];
            if range.layer_bits() <= BITMAP_LAYER_BITS {
                let bm = if range < sbin { cell.left } else { cell.right };
                let _ = dst.set_low_layer_bitmap(range, bm);
            } else if range == sbin {
                if cell.is_left_ref() || cell.is_right_ref() || cell.left != cell.right {
                    Self::copy_subtree(dst, src, sref, range);
                } else {
                    let _ = dst.set_high_layer_bitmap(range, cell.left);
                }
            } else if range < sbin {
                let _ = dst.set_high_layer_bitmap(range, cell.left);
            } else {
                let _ = dst.set_high_layer_bitmap(range, cell.right);
            }
        } else if range.contains(src.root_bin) {
            dst.reset(range);
            let cell = src.cells[ROOT_REF as usize];
            if cell.is_left_ref() || cell.is_right_ref() || cell.left != cell.right {
                Self::copy_subtree(dst, src, ROOT_REF, src.root_bin);
            } else {
                let _ = dst.set_high_layer_bitmap(src.root_bin, cell.left);
            }
        } else {
            dst.reset(range);
        }
    }

    /// Graft the subtree of `src` rooted at (`sref`, `sbin`) into `dst`.
    fn copy_subtree(dst: &mut Binmap, src: &Binmap, sref: CellRef, sbin: Bin) {
        debug_assert!(sbin.layer_bits() > BITMAP_LAYER_BITS);
        while !dst.root_bin.contains(sbin) {
            if dst.extend_root().is_err() {
                return;
            }
        }
        let (mut cur_ref, mut cur_bin) = dst.trace(sbin);
        if cur_bin != sbin {
            let cell = dst.cells[cur_ref as usize];
            let filler = if sbin < cur_bin { cell.left } else { cell.right };
            if dst
                .reserve_cells((cur_bin.layer() - sbin.layer()) as usize)
                .is_err()
            {
                return;
            }
            loop {
                let r = dst.alloc_cell_dirty();
                dst.cells[r as usize] = Cell {
                    left: filler,
                    right: filler,
                    flags: 0,
                };
                let parent = &mut dst.cells[cur_ref as usize];
                if sbin < cur_bin {
                    parent.flags |= FLAG_LEFT_REF;
                    parent.left = r;
                    cur_bin = cur_bin.left();
                } else {
                    parent.flags |= FLAG_RIGHT_REF;
                    parent.right = r;
                    cur_bin = cur_bin.right();
                }
                cur_ref = r;
                if cur_bin == sbin {
                    break;
                }
            }
        }
        Self::copy_cells(dst, cur_ref, src, sref);
    }

    /// Clone the cell subtree `sref` of `src` over the cell `dref` of `dst`.
    fn copy_cells(dst: &mut Binmap, dref: CellRef, src: &Binmap, sref: CellRef) {
        // Count source cells so one reservation covers the clone.
        let mut scount = 0usize;
        let mut stack = vec![sref];
        while let Some(r) = stack.pop() {
            scount += 1;
            let c = &src.cells[r as usize];
            if c.is_left_ref() {
                stack.push(c.left);
            }
            if c.is_right_ref() {
                stack.push(c.right);
            }
        }
        let mut dcount = 0usize;
        stack.push(dref);
        while let Some(r) = stack.pop() {
            dcount += 1;
            let c = &dst.cells[r as usize];
            if c.is_left_ref() {
                stack.push(c.left);
            }
            if c.is_right_ref() {
                stack.push(c.right);
            }
        }
        if dcount < scount && dst.reserve_cells(scount - dcount).is_err() {
            return;
        }

        let dcell = dst.cells[dref as usize];
        if dcell.is_left_ref() {
            dst.free_cell(dcell.left);
        }
        if dcell.is_right_ref() {
            dst.free_cell(dcell.right);
        }
        dst.cells[dref as usize].flags = 0;

        let mut pairs = vec![(sref, dref)];
        while let Some((s, d)) = pairs.pop() {
            let scell = src.cells[s as usize];
            let dcell = &mut dst.cells[d as usize];
            dcell.flags = 0;
            dcell.left = scell.left;
            dcell.right = scell.right;
            if scell.is_left_ref() {
                dcell.flags |= FLAG_LEFT_REF;
                let child = dst.alloc_cell_dirty();
                dst.cells[d as usize].left = child;
                pairs.push((scell.left, child));
            }
            if scell.is_right_ref() {
                dst.cells[d as usize].flags |= FLAG_RIGHT_REF;
                let child = dst.alloc_cell_dirty();
                dst.cells[d as usize].right = child;
                pairs.push((scell.right, child));
            }
        }
    }

    /*
     * find_complement
     */

    /// First base-aligned bin that is filled in `src` and empty in `dst`,
    /// visited in `twist` order; `NONE` when `src \ dst` is empty.
    pub fn find_complement(dst: &Binmap, src: &Binmap, twist: u64) -> Bin {
        Self::find_complement_in(dst, src, Bin::ALL, twist)
    }

    /// As `find_complement`, restricted to the subtree `range`.
    pub fn find_complement_in(dst: &Binmap, src: &Binmap, mut range: Bin, twist: u64) -> Bin {
        let mut sref = ROOT_REF;
        let mut sbitmap = BITMAP_EMPTY;
        let is_sref;

        if range.contains(src.root_bin) {
            range = src.root_bin;
            is_sref = true;
        } else if src.root_bin.contains(range) {
            let (r, sbin) = src.trace(range);
            sref = r;
            if range == sbin {
                is_sref = true;
            } else {
                is_sref = false;
                let cell = &src.cells[sref as usize];
                sbitmap = if range < sbin { cell.left } else { cell.right };
                sbitmap &= bin_bitmap(range.to_u64() & BITMAP_LAYER_BITS);
                if sbitmap == BITMAP_EMPTY {
                    return Bin::NONE;
                }
            }
        } else {
            return Bin::NONE;
        }

        if dst.is_empty() {
            if is_sref {
                let cell = &src.cells[sref as usize];
                if !cell.is_left_ref()
                    && !cell.is_right_ref()
                    && cell.left == BITMAP_FILLED
                    && cell.right == BITMAP_FILLED
                {
                    return range;
                }
                return Self::complement_sref(range, BITMAP_EMPTY, src, sref, twist);
            }
            return Self::complement_bitmaps(range, BITMAP_EMPTY, sbitmap, twist);
        }

        if dst.root_bin.contains(range) {
            let (dref, dbin) = dst.trace(range);
            if range == dbin {
                if is_sref {
                    return Self::complement_refs(range, dst, dref, src, sref, twist);
                }
                return Self::complement_dref(range, dst, dref, sbitmap, twist);
            }
            let dcell = &dst.cells[dref as usize];
            let dbitmap = if range < dbin { dcell.left } else { dcell.right };
            if dbitmap == BITMAP_FILLED {
                return Bin::NONE;
            }
            if is_sref {
                if dbitmap == BITMAP_EMPTY {
                    let cell = &src.cells[sref as usize];
                    if !cell.is_left_ref()
                        && !cell.is_right_ref()
                        && cell.left == BITMAP_FILLED
                        && cell.right == BITMAP_FILLED
                    {
                        return range;
                    }
                }
                return Self::complement_sref(range, dbitmap, src, sref, twist);
            }
            if sbitmap & !dbitmap != BITMAP_EMPTY {
                return Self::complement_bitmaps(range, dbitmap, sbitmap, twist);
            }
            return Bin::NONE;
        }

        if !range.contains(dst.root_bin) {
            // Disjoint trees: everything of src inside range is additional.
            if is_sref {
                return Self::complement_sref(range, BITMAP_EMPTY, src, sref, twist);
            }
            return Self::complement_bitmaps(range, BITMAP_EMPTY, sbitmap, twist);
        }

        // range strictly contains dst's tree.
        if is_sref {
            let mut stack: Vec<(Bin, CellRef, u8)> = Vec::with_capacity(64);
            push_s(&mut stack, range, sref, twist);
            while let Some((b, sr, is_left)) = pop(&mut stack) {
                let scell = src.cells[sr as usize];
                if is_left {
                    if b.left() == dst.root_bin {
                        if scell.is_left_ref() {
                            let res = Self::complement_refs(
                                dst.root_bin,
                                dst,
                                ROOT_REF,
                                src,
                                scell.left,
                                twist,
                            );
                            if !res.is_none() {
                                return res;
                            }
                        } else if scell.left != BITMAP_EMPTY {
                            let res =
                                Self::complement_dref(dst.root_bin, dst, ROOT_REF, scell.left, twist);
                            if !res.is_none() {
                                return res;
                            }
                        }
                        continue;
                    }
                    if scell.is_left_ref() {
                        push_s(&mut stack, b.left(), scell.left, twist);
                        continue;
                    }
                    if scell.left != BITMAP_EMPTY {
                        return Self::complement_beyond(
                            b.left(),
                            dst,
                            scell.left,
                            twist,
                        );
                    }
                } else {
                    // The whole right half lies outside dst's tree.
                    if scell.is_right_ref() {
                        return Self::complement_sref(b.right(), BITMAP_EMPTY, src, scell.right, twist);
                    }
                    if scell.right != BITMAP_EMPTY {
                        return Self::complement_bitmaps(b.right(), BITMAP_EMPTY, scell.right, twist);
                    }
                }
            }
            return Bin::NONE;
        }
        Self::complement_beyond(range, dst, sbitmap, twist)
    }

    /// `src` is a solid bitmap spread over `range`, which strictly contains
    /// `dst`'s root; honour the twist when deciding whether the in-tree or
    /// the beyond-tree part comes first.
    fn complement_beyond(range: Bin, dst: &Binmap, sbitmap: Bitmap, twist: u64) -> Bin {
        if twist & (range.base_length() - 1) & !(dst.root_bin.base_length() - 1) == 0 {
            let res = Self::complement_dref(dst.root_bin, dst, ROOT_REF, sbitmap, twist);
            if !res.is_none() {
                return res;
            }
            return Self::complement_bitmaps(dst.root_bin.sibling(), BITMAP_EMPTY, sbitmap, twist);
        }
        if sbitmap != BITMAP_FILLED {
            return Self::complement_bitmaps(range, BITMAP_EMPTY, sbitmap, twist);
        }
        // Everything under `range` is in src and the twist points past the
        // destination tree: flow the highest twist bit to find the first
        // whole subtree beyond it.
        let mut s = twist & (range.base_length() - 1);
        s |= s >> 1;
        s |= s >> 2;
        s |= s >> 4;
        s |= s >> 8;
        s |= s >> 16;
        s |= s >> 32;
        Bin::from_u64(s + 1 + (s >> 1))
    }

    /// Both sides are cell trees.
    fn complement_refs(
        bin: Bin,
        dst: &Binmap,
        dref: CellRef,
        src: &Binmap,
        sref: CellRef,
        twist: u64,
    ) -> Bin {
        let mut stack: Vec<(Bin, CellRef, CellRef, u8)> = Vec::with_capacity(64);
        push_sd(&mut stack, bin, sref, dref, twist);
        while let Some((b, sr, dr, is_left)) = pop_sd(&mut stack) {
            let sc = src.cells[sr as usize];
            let dc = dst.cells[dr as usize];
            if is_left {
                if sc.is_left_ref() {
                    if dc.is_left_ref() {
                        push_sd(&mut stack, b.left(), sc.left, dc.left, twist);
                        continue;
                    }
                    if dc.left != BITMAP_FILLED {
                        let res = Self::complement_sref(b.left(), dc.left, src, sc.left, twist);
                        if !res.is_none() {
                            return res;
                        }
                    }
                } else if sc.left != BITMAP_EMPTY {
                    if dc.is_left_ref() {
                        let res = Self::complement_dref(b.left(), dst, dc.left, sc.left, twist);
                        if !res.is_none() {
                            return res;
                        }
                    } else if sc.left & !dc.left != BITMAP_EMPTY {
                        return Self::complement_bitmaps(b.left(), dc.left, sc.left, twist);
                    }
                }
            } else if sc.is_right_ref() {
                if dc.is_right_ref() {
                    push_sd(&mut stack, b.right(), sc.right, dc.right, twist);
                    continue;
                }
                if dc.right != BITMAP_FILLED {
                    let res = Self::complement_sref(b.right(), dc.right, src, sc.right, twist);
                    if !res.is_none() {
                        return res;
                    }
                }
            } else if sc.right != BITMAP_EMPTY {
                if dc.is_right_ref() {
                    let res = Self::complement_dref(b.right(), dst, dc.right, sc.right, twist);
                    if !res.is_none() {
                        return res;
                    }
                } else if sc.right & !dc.right != BITMAP_EMPTY {
                    return Self::complement_bitmaps(b.right(), dc.right, sc.right, twist);
                }
            }
        }
        Bin::NONE
    }

    /// Source is a cell tree; destination is one flat bitmap.
    fn complement_sref(bin: Bin, dbitmap: Bitmap, src: &Binmap, sref: CellRef, twist: u64) -> Bin {
        let mut stack: Vec<(Bin, CellRef, u8)> = Vec::with_capacity(64);
        push_s(&mut stack, bin, sref, twist);
        while let Some((b, sr, is_left)) = pop(&mut stack) {
            let sc = src.cells[sr as usize];
            if is_left {
                if sc.is_left_ref() {
                    push_s(&mut stack, b.left(), sc.left, twist);
                    continue;
                }
                if sc.left & !dbitmap != BITMAP_EMPTY {
                    return Self::complement_bitmaps(b.left(), dbitmap, sc.left, twist);
                }
            } else if sc.is_right_ref() {
                push_s(&mut stack, b.right(), sc.right, twist);
                continue;
            } else if sc.right & !dbitmap != BITMAP_EMPTY {
                return Self::complement_bitmaps(b.right(), dbitmap, sc.right, twist);
            }
        }
        Bin::NONE
    }

    /// Destination is a cell tree; source is one flat bitmap.
    fn complement_dref(bin: Bin, dst: &Binmap, dref: CellRef, sbitmap: Bitmap, twist: u64) -> Bin {
        let mut stack: Vec<(Bin, CellRef, u8)> = Vec::with_capacity(64);
        push_s(&mut stack, bin, dref, twist);
        while let Some((b, dr, is_left)) = pop(&mut stack) {
            let dc = dst.cells[dr as usize];
            if is_left {
                if dc.is_left_ref() {
                    push_s(&mut stack, b.left(), dc.left, twist);
                    continue;
                }
                if sbitmap & !dc.left != BITMAP_EMPTY {
                    return Self::complement_bitmaps(b.left(), dc.left, sbitmap, twist);
                }
            } else if dc.is_right_ref() {
                push_s(&mut stack, b.right(), dc.right, twist);
                continue;
            } else if sbitmap & !dc.right != BITMAP_EMPTY {
                return Self::complement_bitmaps(b.right(), dc.right, sbitmap, twist);
            }
        }
        Bin::NONE
    }

    /// Both sides are flat bitmaps under `bin`: permute the difference by
    /// the low twist bits and take the first solid run. Bitmap bit positions
    /// are absolute within the 32-chunk half containing `bin`.
    fn complement_bitmaps(bin: Bin, dbitmap: Bitmap, sbitmap: Bitmap, twist: u64) -> Bin {
        let mut bitmap = sbitmap & !dbitmap;
        debug_assert!(bitmap != BITMAP_EMPTY);
        if bitmap == BITMAP_FILLED {
            return bin;
        }
        let twist = twist & (bin.base_length() - 1);
        if twist & 1 != 0 {
            bitmap = ((bitmap & 0x5555_5555) << 1) | ((bitmap & 0xAAAA_AAAA) >> 1);
        }
        if twist & 2 != 0 {
            bitmap = ((bitmap & 0x3333_3333) << 2) | ((bitmap & 0xCCCC_CCCC) >> 2);
        }
        if twist & 4 != 0 {
            bitmap = ((bitmap & 0x0F0F_0F0F) << 4) | ((bitmap & 0xF0F0_F0F0) >> 4);
        }
        if twist & 8 != 0 {
            bitmap = ((bitmap & 0x00FF_00FF) << 8) | ((bitmap & 0xFF00_FF00) >> 8);
        }
        if twist & 16 != 0 {
            bitmap = ((bitmap & 0x0000_FFFF) << 16) | ((bitmap & 0xFFFF_0000) >> 16);
        }
        let base = if bin.layer_bits() > BITMAP_LAYER_BITS {
            bin.base_left()
        } else {
            // A sub-half bin: rebase to the half so that the in-half bin
            // value adds up to the right absolute position.
            Bin::from_u64(bin.to_u64() & !BITMAP_LAYER_BITS)
        };
        Bin::from_u64(base.twisted(twist & !0x1F).to_u64() + first_solid_bin(bitmap))
            .twisted(twist & 0x1F)
    }

    /*
     * Persistence: text serialisation, one line per scalar then per-cell
     * blocks. Free cells are written too so the free list survives.
     */

    pub fn serialize(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "root bin {}", self.root_bin.to_u64())?;
        writeln!(out, "free top {}", self.free_top)?;
        writeln!(out, "alloc cells {}", self.allocated)?;
        writeln!(out, "cells num {}", self.cells.len())?;
        for cell in &self.cells {
            writeln!(out, "leftb {}", cell.left as i32)?;
            writeln!(out, "rightb {}", cell.right as i32)?;
            writeln!(out, "is_left {}", u8::from(cell.is_left_ref()))?;
            writeln!(out, "is_right {}", u8::from(cell.is_right_ref()))?;
            writeln!(out, "is_free {}", u8::from(cell.is_free()))?;
        }
        Ok(())
    }

    pub fn deserialize(input: &mut dyn BufRead) -> io::Result<Binmap> {
        fn field(input: &mut dyn BufRead, key: &str) -> io::Result<i64> {
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("missing binmap field {key}"),
                ));
            }
            let rest = line
                .trim_end()
                .strip_prefix(key)
                .and_then(|r| r.strip_prefix(' '))
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("bad binmap field, wanted {key}"),
                    )
                })?;
            rest.parse::<i64>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }

        let root_bin = field(input, "root bin")? as u64;
        let free_top = field(input, "free top")? as u32;
        let allocated = field(input, "alloc cells")? as usize;
        let cells_num = field(input, "cells num")? as usize;
        if allocated > cells_num || cells_num == 0 || cells_num > CellRef::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "binmap cell counts corrupt",
            ));
        }
        let mut cells = Vec::with_capacity(cells_num);
        for _ in 0..cells_num {
            let left = field(input, "leftb")? as i32 as u32;
            let right = field(input, "rightb")? as i32 as u32;
            let mut flags = 0u8;
            if field(input, "is_left")? != 0 {
                flags |= FLAG_LEFT_REF;
            }
            if field(input, "is_right")? != 0 {
                flags |= FLAG_RIGHT_REF;
            }
            if field(input, "is_free")? != 0 {
                flags |= FLAG_FREE;
            }
            cells.push(Cell { left, right, flags });
        }
        let live = cells.iter().filter(|c| !c.is_free()).count();
        if live != allocated {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "binmap allocated-cell count mismatch",
            ));
        }
        Ok(Binmap {
            cells,
            allocated,
            free_top,
            root_bin: Bin::from_u64(root_bin),
        })
    }
}

/*
 * Twist-ordered stack frames. Each frame is visited twice: the first pop
 * keeps it and flips its direction, the second pop removes it. The first
 * direction comes from the twist bit matching the frame's half-width.
 */

#[inline]
fn initial_dir(b: Bin, twist: u64) -> u8 {
    u8::from(twist & (b.base_length() >> 1) != 0)
}

#[inline]
fn push_s(stack: &mut Vec<(Bin, CellRef, u8)>, b: Bin, r: CellRef, twist: u64) {
    stack.push((b, r, initial_dir(b, twist)));
}

#[inline]
fn pop(stack: &mut Vec<(Bin, CellRef, u8)>) -> Option<(Bin, CellRef, bool)> {
    let top = stack.last_mut()?;
    let (b, r, dir) = (top.0, top.1, top.2);
    let is_left = dir & 1 == 0;
    if dir & 2 == 0 {
        top.2 ^= 0b11;
    } else {
        stack.pop();
    }
    Some((b, r, is_left))
}

#[inline]
fn push_sd(stack: &mut Vec<(Bin, CellRef, CellRef, u8)>, b: Bin, s: CellRef, d: CellRef, twist: u64) {
    stack.push((b, s, d, initial_dir(b, twist)));
}

#[inline]
fn pop_sd(stack: &mut Vec<(Bin, CellRef, CellRef, u8)>) -> Option<(Bin, CellRef, CellRef, bool)> {
    let top = stack.last_mut()?;
    let (b, s, d, dir) = (top.0, top.1, top.2, top.3);
    let is_left = dir & 1 == 0;
    if dir & 2 == 0 {
        top.3 ^= 0b11;
    } else {
        stack.pop();
    }
    Some((b, s, d, is_left))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_filled() {
        let mut map = Binmap::new();
        map.set(Bin::new(0, 3));
        assert!(map.is_filled_in(Bin::new(0, 3)));
        assert!(map.is_empty_in(Bin::new(0, 2)));
        assert!(!map.is_filled_in(Bin::new(1, 1)));
        map.set(Bin::new(0, 2));
        assert!(map.is_filled_in(Bin::new(1, 1)));
    }

    #[test]
    fn test_auto_grow() {
        let mut map = Binmap::new();
        // Beyond the initial 64-chunk root.
        map.set(Bin::new(0, 1000));
        assert!(map.is_filled_in(Bin::new(0, 1000)));
        assert!(map.is_empty_in(Bin::new(0, 999)));
        assert!(map.root_bin().contains(Bin::new(0, 1000)));
    }

    #[test]
    fn test_pack_collapses_uniform_subtrees() {
        let mut map = Binmap::new();
        for i in 0..4096 {
            map.set(Bin::chunk(i));
        }
        // A solid region must collapse back to near-constant cells.
        assert!(map.cell_count() <= 2, "cells: {}", map.cell_count());
        assert!(map.is_filled_in(Bin::new(12, 0)));
    }

    #[test]
    fn test_reset_splits() {
        let mut map = Binmap::new();
        map.set(Bin::new(6, 0));
        map.reset(Bin::chunk(17));
        assert!(map.is_empty_in(Bin::chunk(17)));
        assert!(map.is_filled_in(Bin::chunk(16)));
        assert!(!map.is_filled_in(Bin::new(6, 0)));
        assert_eq!(map.find_empty(), Bin::chunk(17));
    }

    #[test]
    fn test_cover() {
        let mut map = Binmap::new();
        for i in 4..8 {
            map.set(Bin::chunk(i));
        }
        assert_eq!(map.cover(Bin::chunk(5)), Bin::new(2, 1));
        assert_eq!(map.cover(Bin::chunk(1)), Bin::new(2, 0));
        map.set(Bin::chunk(2));
        assert_eq!(map.cover(Bin::chunk(1)), Bin::chunk(1));
    }

    #[test]
    fn test_find_complement_basic() {
        let mut have = Binmap::new();
        let mut offer = Binmap::new();
        for i in 0..16 {
            offer.set(Bin::chunk(i));
        }
        have.set(Bin::new(2, 0));
        let extra = Binmap::find_complement(&have, &offer, 0);
        assert_eq!(extra, Bin::new(2, 1));
        for i in 0..16 {
            have.set(Bin::chunk(i));
        }
        assert!(Binmap::find_complement(&have, &offer, 0).is_none());
    }

    #[test]
    fn test_find_complement_range_and_twist() {
        let mut have = Binmap::new();
        let mut offer = Binmap::new();
        for i in 0..8 {
            offer.set(Bin::chunk(i));
        }
        let range = Bin::new(1, 1); // chunks 2,3
        let b = Binmap::find_complement_in(&have, &offer, range, 0);
        assert_eq!(b, range);
        have.set(Bin::chunk(2));
        let b = Binmap::find_complement_in(&have, &offer, range, 0);
        assert_eq!(b, Bin::chunk(3));
        // Twist flips the visiting order of the two chunks.
        have.clear();
        let b0 = Binmap::find_complement_in(&have, &offer, Bin::new(2, 0), 1);
        assert!(offer.is_filled_in(b0));
        assert!(have.is_empty_in(b0));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut map = Binmap::new();
        for i in [0u64, 3, 7, 100, 1000] {
            map.set(Bin::chunk(i));
        }
        let mut buf = Vec::new();
        map.serialize(&mut buf).unwrap();
        let mut rd = io::BufReader::new(&buf[..]);
        let copy = Binmap::deserialize(&mut rd).unwrap();
        for i in 0..1100u64 {
            assert_eq!(
                map.is_filled_in(Bin::chunk(i)),
                copy.is_filled_in(Bin::chunk(i)),
                "chunk {i}"
            );
        }
        assert_eq!(map.cell_count(), copy.cell_count());
    }

    #[test]
    fn test_deserialize_rejects_corrupt_header() {
        let text = "root bin 63\nfree top 0\nalloc cells 9\ncells num 2\n";
        let mut rd = io::BufReader::new(text.as_bytes());
        assert!(Binmap::deserialize(&mut rd).is_err());
    }

    #[test]
    fn test_copy_range() {
        let mut src = Binmap::new();
        for i in 0..32 {
            src.set(Bin::chunk(i));
        }
        let mut dst = Binmap::new();
        dst.set(Bin::chunk(40));
        Binmap::copy_range(&mut dst, &src, Bin::new(3, 1)); // chunks 8..16
        for i in 8..16 {
            assert!(dst.is_filled_in(Bin::chunk(i)));
        }
        assert!(dst.is_empty_in(Bin::chunk(7)));
        assert!(dst.is_filled_in(Bin::chunk(40)));
    }
}
