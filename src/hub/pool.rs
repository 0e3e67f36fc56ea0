//! Least-loaded selection over the set of live hubs
//!
//! The pool is a hand-rolled binary min-heap keyed on the number of
//! links currently admitted through each hub. Selecting a hub
//! pre-increments its load under the same lock, so the choice is atomic
//! with the accounting; the matching decrement happens when the link
//! terminates.

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};

/// Index value marking an entry that is no longer in the pool. A load
/// drop arriving after the entry was removed becomes a no-op.
const DETACHED: usize = usize::MAX;

/// One hub wrapped with the bookkeeping the heap needs
pub struct PoolEntry<H> {
    /// The hub links are admitted to
    pub hub: H,
    /// Links currently admitted through this hub. Only written while
    /// holding the pool lock.
    priority: AtomicI64,
    /// Position inside the heap backing array, [DETACHED] once removed.
    /// Only written while holding the pool lock.
    index: AtomicUsize,
}

impl<H> PoolEntry<H> {
    /// Current admitted-link count for this hub
    pub fn load(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }
}

/// Mutex-protected min-heap of live hubs ordered by current load
pub struct HubPool<H> {
    heap: Mutex<Vec<Arc<PoolEntry<H>>>>,
}

impl<H> Default for HubPool<H> {
    fn default() -> Self {
        Self {
            heap: Mutex::new(Vec::new()),
        }
    }
}

impl<H> HubPool<H> {
    /// Number of live hubs in the pool
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Inserts a hub with no admitted links and returns its pool entry
    pub fn push(&self, hub: H) -> Arc<PoolEntry<H>> {
        let entry = Arc::new(PoolEntry {
            hub,
            priority: AtomicI64::new(0),
            index: AtomicUsize::new(DETACHED),
        });

        let heap = &mut *self.heap.lock();
        entry.index.store(heap.len(), Ordering::Relaxed);
        heap.push(entry.clone());
        let last = heap.len() - 1;
        sift_up(heap, last);

        entry
    }

    /// Removes the entry from the pool, marking it detached. Load drops
    /// arriving for it afterwards are ignored. Removing an already
    /// detached entry does nothing.
    pub fn remove(&self, entry: &Arc<PoolEntry<H>>) {
        let heap = &mut *self.heap.lock();

        let index = entry.index.swap(DETACHED, Ordering::Relaxed);
        if index == DETACHED {
            return;
        }

        // Swap the last entry into the vacated slot and restore the
        // heap property around it
        let last = heap.len() - 1;
        heap.swap(index, last);
        heap.pop();

        if index < heap.len() {
            heap[index].index.store(index, Ordering::Relaxed);
            sift_down(heap, index);
            sift_up(heap, index);
        }
    }

    /// Returns the least loaded hub after admitting one link to it, or
    /// [None] when no hub is currently alive
    pub fn fetch_least_loaded(&self) -> Option<Arc<PoolEntry<H>>> {
        let heap = &mut *self.heap.lock();

        let entry = heap.first()?.clone();
        entry.priority.fetch_add(1, Ordering::Relaxed);
        sift_down(heap, 0);

        Some(entry)
    }

    /// Releases one admitted link from the entry. The dual of
    /// [Self::fetch_least_loaded]; a no-op when the entry has already
    /// been removed from the pool.
    pub fn drop_load(&self, entry: &Arc<PoolEntry<H>>) {
        let heap = &mut *self.heap.lock();

        let index = entry.index.load(Ordering::Relaxed);
        if index == DETACHED {
            return;
        }

        entry.priority.fetch_sub(1, Ordering::Relaxed);
        sift_up(heap, index);
    }
}

fn sift_up<H>(heap: &mut [Arc<PoolEntry<H>>], mut index: usize) {
    while index > 0 {
        let parent = (index - 1) / 2;
        if heap[parent].load() <= heap[index].load() {
            break;
        }
        swap_entries(heap, index, parent);
        index = parent;
    }
}

fn sift_down<H>(heap: &mut [Arc<PoolEntry<H>>], mut index: usize) {
    loop {
        let mut smallest = index;
        let left = index * 2 + 1;
        let right = index * 2 + 2;

        if left < heap.len() && heap[left].load() < heap[smallest].load() {
            smallest = left;
        }
        if right < heap.len() && heap[right].load() < heap[smallest].load() {
            smallest = right;
        }
        if smallest == index {
            break;
        }

        swap_entries(heap, index, smallest);
        index = smallest;
    }
}

fn swap_entries<H>(heap: &mut [Arc<PoolEntry<H>>], a: usize, b: usize) {
    heap.swap(a, b);
    heap[a].index.store(a, Ordering::Relaxed);
    heap[b].index.store(b, Ordering::Relaxed);
}
