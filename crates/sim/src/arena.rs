//! The cell arena: a fixed-capacity, id-indexed store of entity slots.
//!
//! Ids are 16-bit with 0 reserved as the "no cell" sentinel and wire
//! terminator, so at most 65535 cells are live at once. Allocation
//! scans forward from a rotating cursor, which is amortized O(1) under
//! steady occupancy and fails deterministically once the arena is
//! full.

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// Slot id. 0 is reserved and never assigned.
pub type CellId = u16;

/// Total slot count, including the reserved slot 0.
pub const CELL_CAPACITY: usize = 1 << 16;

/// Errors from arena slot management.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("no free cell slot available")]
    Exhausted,
}

/// Cell type tags. Values 0..=250 are player cells and double as the
/// owning player id.
pub const DEAD_TYPE: u8 = 251;
pub const MOTHER_TYPE: u8 = 252;
pub const VIRUS_TYPE: u8 = 253;
pub const PELLET_TYPE: u8 = 254;
pub const EJECTED_TYPE: u8 = 255;

/// Largest player type value.
pub const MAX_PLAYER_TYPE: u8 = 250;

#[inline]
pub fn is_player_type(t: u8) -> bool {
    t <= MAX_PLAYER_TYPE
}

/// Cell flag bits. EXIST and AUTOSPLIT are latched; the rest are
/// cleared at the start of every tick (see [`flags::CLEAR_MASK`]).
pub mod flags {
    /// Slot holds a live cell.
    pub const EXIST: u8 = 0x01;
    /// Position/size changed this tick (NeedsBroadcast).
    pub const UPDATED: u8 = 0x02;
    /// Fully engulfed by a colliding cell this tick.
    pub const INSIDE: u8 = 0x04;
    /// Movement constrained to the owner's line.
    pub const LOCKED: u8 = 0x08;
    /// Latched once the cell crosses the autosplit size.
    pub const AUTOSPLIT: u8 = 0x10;
    /// Scheduled for removal; slot is zeroed next tick.
    pub const REMOVED: u8 = 0x20;
    /// Eligible to merge with a same-owner cell.
    pub const MERGE: u8 = 0x40;
    /// Deferred pop (virus split or player pop) pending.
    pub const POP: u8 = 0x80;

    /// Bits that survive the per-tick clear.
    pub const CLEAR_MASK: u8 = EXIST | AUTOSPLIT;

    /// A cell carrying any of these takes no part in resolution.
    pub const SKIP_RESOLVE: u8 = INSIDE | REMOVED | POP;
}

/// Decaying directional impulse applied after splits and ejects.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Boost {
    pub dx: f32,
    pub dy: f32,
    /// Remaining magnitude; at or below 1 the boost is spent.
    pub d: f32,
}

/// One entity slot. Mass is radius squared throughout.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cell {
    pub x: f32,
    pub y: f32,
    pub r: f32,
    pub cell_type: u8,
    pub flags: u8,
    /// Consumer id, valid only while REMOVED is set and the cause was
    /// consumption; 0 with REMOVED means "expired".
    pub eaten_by: CellId,
    /// Age in milliseconds.
    pub age: f32,
    pub boost: Boost,
}

impl Cell {
    #[inline]
    pub fn exists(&self) -> bool {
        self.flags & flags::EXIST != 0
    }

    #[inline]
    pub fn is_player(&self) -> bool {
        is_player_type(self.cell_type)
    }

    #[inline]
    pub fn is_boosting(&self) -> bool {
        self.boost.d > 1.0
    }

    #[inline]
    pub fn has(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u8) {
        self.flags |= bit;
    }

    #[inline]
    pub fn clear(&mut self, bit: u8) {
        self.flags &= !bit;
    }

    /// Mass (r²) of this cell.
    #[inline]
    pub fn mass(&self) -> f32 {
        self.r * self.r
    }
}

/// Fixed-capacity cell store.
///
/// Every slot sits behind its own mutex. Sequential tick phases go
/// through [`Arena::cell_mut`], which takes no lock; the parallel
/// narrow phase locks the two cells of a candidate pair in ascending
/// id order via [`Arena::lock_pair`].
pub struct Arena {
    slots: Box<[Mutex<Cell>]>,
    cursor: CellId,
    live: usize,
}

impl Arena {
    pub fn new() -> Self {
        let slots = (0..CELL_CAPACITY)
            .map(|_| Mutex::new(Cell::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            cursor: 1,
            live: 0,
        }
    }

    /// Number of live cells.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Find the next free slot, scanning forward from the cursor and
    /// wrapping once. Slot 0 is never considered.
    fn next_free(&mut self) -> Result<CellId, ArenaError> {
        let mut id = self.cursor;
        for _ in 0..CELL_CAPACITY {
            if id == 0 {
                id = 1;
            }
            if !self.slots[id as usize].get_mut().exists() {
                self.cursor = id.wrapping_add(1);
                return Ok(id);
            }
            id = id.wrapping_add(1);
        }
        Err(ArenaError::Exhausted)
    }

    /// Allocate a slot for a new cell.
    pub fn allocate(
        &mut self,
        cell_type: u8,
        x: f32,
        y: f32,
        r: f32,
        boost: Boost,
    ) -> Result<CellId, ArenaError> {
        let id = self.next_free()?;
        let cell = self.slots[id as usize].get_mut();
        *cell = Cell {
            x,
            y,
            r,
            cell_type,
            flags: flags::EXIST,
            eaten_by: 0,
            age: 0.0,
            boost,
        };
        self.live += 1;
        Ok(id)
    }

    /// Zero a slot, returning it to the free pool.
    pub fn free(&mut self, id: CellId) {
        let cell = self.slots[id as usize].get_mut();
        if cell.exists() {
            self.live -= 1;
        }
        *cell = Cell::default();
    }

    /// Copy a live cell into a freshly allocated slot retyped Dead and
    /// zero the original. Other cells may keep referencing the *new*
    /// id as `eaten_by`, so the old slot can be reused immediately.
    pub fn tombstone(&mut self, id: CellId) -> Result<CellId, ArenaError> {
        let src = *self.slots[id as usize].get_mut();
        let new_id = self.next_free()?;
        let dst = self.slots[new_id as usize].get_mut();
        *dst = src;
        dst.cell_type = DEAD_TYPE;
        dst.flags = flags::EXIST;
        dst.age = 0.0;
        // One cell zeroed, one created: the live count is unchanged.
        *self.slots[id as usize].get_mut() = Cell::default();
        Ok(new_id)
    }

    /// Direct access for the sequential phases (no locking).
    #[inline]
    pub fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        self.slots[id as usize].get_mut()
    }

    /// Snapshot of a cell (brief lock).
    #[inline]
    pub fn cell(&self, id: CellId) -> Cell {
        *self.slots[id as usize].lock()
    }

    /// Lock one cell for the parallel resolution phase.
    #[inline]
    pub fn lock(&self, id: CellId) -> MutexGuard<'_, Cell> {
        self.slots[id as usize].lock()
    }

    /// Lock a candidate pair in ascending id order, so two shards
    /// resolving the same pair can never deadlock.
    pub fn lock_pair(
        &self,
        a: CellId,
        b: CellId,
    ) -> (MutexGuard<'_, Cell>, MutexGuard<'_, Cell>) {
        debug_assert_ne!(a, b);
        if a < b {
            let ga = self.slots[a as usize].lock();
            let gb = self.slots[b as usize].lock();
            (ga, gb)
        } else {
            let gb = self.slots[b as usize].lock();
            let ga = self.slots[a as usize].lock();
            (ga, gb)
        }
    }

    // Read accessors for the transport/encoder boundary.

    #[inline]
    pub fn x(&self, id: CellId) -> f32 {
        self.slots[id as usize].lock().x
    }

    #[inline]
    pub fn y(&self, id: CellId) -> f32 {
        self.slots[id as usize].lock().y
    }

    #[inline]
    pub fn r(&self, id: CellId) -> f32 {
        self.slots[id as usize].lock().r
    }

    #[inline]
    pub fn cell_type(&self, id: CellId) -> u8 {
        self.slots[id as usize].lock().cell_type
    }

    #[inline]
    pub fn eaten_by(&self, id: CellId) -> CellId {
        self.slots[id as usize].lock().eaten_by
    }

}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_skips_zero_and_rotates() {
        let mut arena = Arena::new();
        let a = arena.allocate(PELLET_TYPE, 1.0, 2.0, 10.0, Boost::default()).unwrap();
        let b = arena.allocate(PELLET_TYPE, 3.0, 4.0, 10.0, Boost::default()).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        arena.free(a);
        // Cursor keeps rotating, the freed slot is not immediately reused.
        let c = arena.allocate(VIRUS_TYPE, 0.0, 0.0, 100.0, Boost::default()).unwrap();
        assert_eq!(c, 3);
    }

    #[test]
    fn exhaustion_is_deterministic() {
        let mut arena = Arena::new();
        for _ in 0..CELL_CAPACITY - 1 {
            arena.allocate(PELLET_TYPE, 0.0, 0.0, 10.0, Boost::default()).unwrap();
        }
        assert_eq!(
            arena.allocate(PELLET_TYPE, 0.0, 0.0, 10.0, Boost::default()),
            Err(ArenaError::Exhausted)
        );
        // Freeing one slot makes allocation succeed again.
        arena.free(1234);
        assert_eq!(
            arena.allocate(PELLET_TYPE, 0.0, 0.0, 10.0, Boost::default()),
            Ok(1234)
        );
    }

    #[test]
    fn freed_slot_is_zeroed() {
        let mut arena = Arena::new();
        let id = arena.allocate(EJECTED_TYPE, 5.0, 6.0, 38.0, Boost { dx: 1.0, dy: 0.0, d: 780.0 }).unwrap();
        arena.free(id);
        assert_eq!(arena.cell(id), Cell::default());
    }

    #[test]
    fn tombstone_moves_state_to_new_slot() {
        let mut arena = Arena::new();
        let id = arena.allocate(7, 50.0, -20.0, 64.0, Boost::default()).unwrap();
        arena.cell_mut(id).age = 400.0;

        let dead = arena.tombstone(id).unwrap();
        assert_ne!(dead, id);
        assert_eq!(arena.cell(id), Cell::default());

        let cell = arena.cell(dead);
        assert_eq!(cell.cell_type, DEAD_TYPE);
        assert_eq!(cell.x, 50.0);
        assert_eq!(cell.y, -20.0);
        assert_eq!(cell.r, 64.0);
        assert_eq!(cell.age, 0.0);
        assert_eq!(arena.len(), 1);
    }
}
