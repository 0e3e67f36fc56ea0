//! Link identifier allocation and the id to handle table owned by
//! each hub

use crate::utils::types::LinkId;
use parking_lot::Mutex;

/// Upper bound on simultaneous links multiplexed through a single hub.
/// Identifier 0 is reserved on the wire so the usable range is
/// `1..MAX_LINKS_PER_TUNNEL`.
pub const MAX_LINKS_PER_TUNNEL: usize = 1024;

/// Bounded pool of link identifiers. Every id is either free in here or
/// assigned to exactly one live link in the [`LinkTable`].
pub struct LinkIdAllocator {
    /// Ids not currently assigned to a live link
    free: Mutex<Vec<LinkId>>,
}

impl Default for LinkIdAllocator {
    fn default() -> Self {
        let free = (1..MAX_LINKS_PER_TUNNEL as LinkId).collect();
        Self {
            free: Mutex::new(free),
        }
    }
}

impl LinkIdAllocator {
    /// Takes a free id out of the pool, or [None] when every id is
    /// assigned to a live link. Never blocks beyond the pool lock.
    pub fn acquire(&self) -> Option<LinkId> {
        self.free.lock().pop()
    }

    /// Returns an id to the pool once its link has been fully released
    pub fn release(&self, id: LinkId) {
        debug_assert_ne!(id, 0, "released the reserved link id");
        self.free.lock().push(id);
    }

    /// Number of ids currently available for new links
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Dense table mapping link ids to their handles. Slot 0 is never
/// populated. Callers must only present ids inside the allocator range.
pub struct LinkTable<Handle> {
    slots: Mutex<Box<[Option<Handle>]>>,
}

impl<Handle> Default for LinkTable<Handle> {
    fn default() -> Self {
        let slots = (0..MAX_LINKS_PER_TUNNEL).map(|_| None).collect();
        Self {
            slots: Mutex::new(slots),
        }
    }
}

impl<Handle: Clone> LinkTable<Handle> {
    /// Stores the handle for `id`. Fails without changing anything if the
    /// slot is already occupied, which would indicate an id reuse bug.
    pub fn set(&self, id: LinkId, handle: Handle) -> bool {
        let mut slots = self.slots.lock();
        let slot = &mut slots[id as usize];
        if slot.is_some() {
            return false;
        }
        *slot = Some(handle);
        true
    }

    /// Current occupant of the slot for `id`
    pub fn get(&self, id: LinkId) -> Option<Handle> {
        self.slots.lock()[id as usize].clone()
    }

    /// Clears the slot for `id`. Fails if the slot was already empty.
    pub fn reset(&self, id: LinkId) -> bool {
        self.slots.lock()[id as usize].take().is_some()
    }

    /// Number of slots currently holding a live link
    pub fn active(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    /// Empties the table, yielding every live handle. Used when the hub
    /// socket dies and all links must be told to stop.
    pub fn take_all(&self) -> Vec<Handle> {
        self.slots
            .lock()
            .iter_mut()
            .filter_map(|slot| slot.take())
            .collect()
    }
}
