//! Active-connection table and connection-record recycling

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::clock;
use crate::conn::{Conn, ConnId};

enum Entry {
    Empty,
    /// Slot claimed by `acquire_slot` but not yet published; counts toward
    /// the connection limit so a failing pre-connect callback cannot
    /// oversubscribe.
    Reserved,
    Live(Arc<Conn>),
}

struct Slot {
    generation: AtomicU32,
    entry: RwLock<Entry>,
}

/// Slot-indexed container owning every live connection record.
///
/// The slot index plus the slot's generation form the public [`ConnId`];
/// `remove` bumps the generation so a late event on a recycled slot fails
/// the lookup instead of reaching the wrong connection.
pub(crate) struct ActiveTable {
    slots: Box<[Slot]>,
    free_indexes: Mutex<Vec<u32>>,
    count: AtomicUsize,
}

impl ActiveTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: AtomicU32::new(0),
                entry: RwLock::new(Entry::Empty),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            free_indexes: Mutex::new((0..capacity as u32).rev().collect()),
            count: AtomicUsize::new(0),
        }
    }

    /// First phase of insertion: claims a slot and returns its identifier,
    /// or `None` once the table is full.
    pub(crate) fn acquire_slot(&self) -> Option<ConnId> {
        let index = self.free_indexes.lock().unwrap().pop()?;
        let slot = &self.slots[index as usize];
        *slot.entry.write().unwrap() = Entry::Reserved;
        self.count.fetch_add(1, Ordering::AcqRel);
        Some(ConnId::new(index, slot.generation.load(Ordering::Acquire)))
    }

    /// Second phase: installs the record, making it lookup-visible.
    pub(crate) fn publish(&self, id: ConnId, conn: Arc<Conn>) {
        let slot = &self.slots[id.index() as usize];
        let mut entry = slot.entry.write().unwrap();
        debug_assert!(matches!(*entry, Entry::Reserved));
        *entry = Entry::Live(conn);
    }

    /// Cancels a reservation that was never published.
    pub(crate) fn abandon_pending(&self, id: ConnId) {
        self.vacate(id.index());
    }

    /// Frees a published slot.
    pub(crate) fn remove(&self, id: ConnId) {
        self.vacate(id.index());
    }

    fn vacate(&self, index: u32) {
        let slot = &self.slots[index as usize];
        {
            let mut entry = slot.entry.write().unwrap();
            debug_assert!(!matches!(*entry, Entry::Empty));
            *entry = Entry::Empty;
        }
        slot.generation.fetch_add(1, Ordering::AcqRel);
        self.free_indexes.lock().unwrap().push(index);
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Returns the record only if it is published, generation-current, and
    /// not invalidated by a close in progress.
    pub(crate) fn lookup(&self, id: ConnId) -> Option<Arc<Conn>> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation.load(Ordering::Acquire) != id.generation() {
            return None;
        }
        match &*slot.entry.read().unwrap() {
            Entry::Live(conn) if conn.is_valid() => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// Live connections plus unreleased reservations.
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Snapshot of every live identifier.
    pub(crate) fn ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .filter_map(|slot| match &*slot.entry.read().unwrap() {
                Entry::Live(conn) if conn.is_valid() => Some(conn.id()),
                _ => None,
            })
            .collect()
    }
}

/// Two-tier recycler for connection records: a bounded free list whose
/// entries are reusable only after the quarantine, and an unbounded GC list
/// for overflow awaiting release.
pub(crate) struct ConnPool {
    pool_size: usize,
    pool_hold: usize,
    lock_time_ms: u64,
    free: Mutex<VecDeque<Arc<Conn>>>,
    gc: Mutex<VecDeque<Arc<Conn>>>,
}

impl ConnPool {
    pub(crate) fn new(pool_size: usize, pool_hold: usize, lock_time_ms: u64) -> Self {
        Self {
            pool_size,
            pool_hold,
            lock_time_ms,
            free: Mutex::new(VecDeque::with_capacity(pool_size.min(1024))),
            gc: Mutex::new(VecDeque::new()),
        }
    }

    /// Offers the head of the free list for reuse. A record still inside its
    /// quarantine goes back where it was and the caller allocates fresh;
    /// this bounds the time between an identifier retiring and its slot
    /// being reassigned.
    pub(crate) fn take(&self) -> Option<Arc<Conn>> {
        let mut free = self.free.lock().unwrap();
        let conn = free.pop_front()?;
        if clock::millis_since(conn.free_time()) >= self.lock_time_ms {
            Some(conn)
        } else {
            free.push_front(conn);
            None
        }
    }

    /// Accepts a quiesced record back; overflow lands on the GC list in
    /// release order.
    pub(crate) fn put(&self, conn: Arc<Conn>) {
        {
            let mut free = self.free.lock().unwrap();
            if free.len() < self.pool_size {
                free.push_back(conn);
                return;
            }
        }

        let over_hold = {
            let mut gc = self.gc.lock().unwrap();
            gc.push_back(conn);
            gc.len() > self.pool_hold
        };
        if over_hold {
            self.sweep(false);
        }
    }

    /// Walks the GC list oldest-first, dropping records that are unreferenced
    /// and past quarantine. Stops at the first record that fails the check;
    /// the list is ordered by release time. `force` drops everything.
    pub(crate) fn sweep(&self, force: bool) {
        let mut gc = self.gc.lock().unwrap();
        while let Some(front) = gc.front() {
            if !force {
                let isolated = Arc::strong_count(front) == 1;
                let aged = clock::millis_since(front.free_time()) >= self.lock_time_ms;
                if !isolated || !aged {
                    break;
                }
            }
            gc.pop_front();
        }
    }

    /// Drops the free list (shutdown path; the GC list is swept separately
    /// with `force`).
    pub(crate) fn clear(&self) {
        self.free.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn gc_len(&self) -> usize {
        self.gc.lock().unwrap().len()
    }
}
