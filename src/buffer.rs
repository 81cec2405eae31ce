//! Recyclable byte buffers backing per-connection send queues

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::clock;

/// A fixed-capacity byte buffer with separate read and write cursors.
///
/// Send queues chain buffers instead of growing them: an item is appended to
/// until full, drained from the front as the socket accepts bytes, and
/// recycled through the [`BufferPool`] once empty.
#[derive(Debug)]
pub(crate) struct Buffer {
    data: Box<[u8]>,
    read_offset: usize,
    write_offset: usize,
}

impl Buffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_offset: 0,
            write_offset: 0,
        }
    }

    /// Bytes available to be read.
    pub(crate) fn remaining(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Capacity still available for writing.
    pub(crate) fn remaining_mut(&self) -> usize {
        self.data.len() - self.write_offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread region.
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.read_offset..self.write_offset]
    }

    /// Marks `amount` bytes consumed from the front. If this is not called
    /// after a socket write, the next write resends the same data.
    pub(crate) fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.write_offset.min(self.read_offset + amount);
    }

    /// Copies as much of `src` as fits behind the write cursor and returns
    /// the number of bytes taken.
    pub(crate) fn append(&mut self, src: &[u8]) -> usize {
        let take = self.remaining_mut().min(src.len());
        self.data[self.write_offset..self.write_offset + take].copy_from_slice(&src[..take]);
        self.write_offset += take;
        take
    }

    /// Returns the buffer to a clean state for reuse.
    pub(crate) fn reset(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }
}

/// Bounded multi-producer multi-consumer recycler for [`Buffer`]s.
///
/// Returns over the free-list capacity land on a GC list stamped with their
/// release time; the GC list is drained oldest-first once entries have aged
/// past the pool's lock time, or immediately when forced at shutdown.
/// Crossing the GC high-water mark triggers an eager sweep.
#[derive(Debug)]
pub(crate) struct BufferPool {
    item_capacity: usize,
    pool_size: usize,
    pool_hold: usize,
    lock_time_ms: u64,
    free: Mutex<VecDeque<Buffer>>,
    gc: Mutex<VecDeque<(u64, Buffer)>>,
}

impl BufferPool {
    pub(crate) fn new(
        item_capacity: usize,
        pool_size: usize,
        pool_hold: usize,
        lock_time_ms: u64,
    ) -> Self {
        Self {
            item_capacity,
            pool_size,
            pool_hold,
            lock_time_ms,
            free: Mutex::new(VecDeque::with_capacity(pool_size.min(1024))),
            gc: Mutex::new(VecDeque::new()),
        }
    }

    /// Draws a recycled buffer, or allocates a fresh one when the free list
    /// is empty.
    pub(crate) fn get(&self) -> Buffer {
        let recycled = self.free.lock().unwrap().pop_front();
        recycled.unwrap_or_else(|| Buffer::new(self.item_capacity))
    }

    /// Returns a buffer to the pool.
    pub(crate) fn put(&self, mut buffer: Buffer) {
        buffer.reset();

        {
            let mut free = self.free.lock().unwrap();
            if free.len() < self.pool_size {
                free.push_back(buffer);
                return;
            }
        }

        let over_hold = {
            let mut gc = self.gc.lock().unwrap();
            gc.push_back((clock::now_millis(), buffer));
            gc.len() > self.pool_hold
        };
        if over_hold {
            self.sweep(false);
        }
    }

    /// Releases aged GC entries, oldest first, stopping at the first entry
    /// still inside the lock time. `force` releases everything.
    pub(crate) fn sweep(&self, force: bool) {
        let mut gc = self.gc.lock().unwrap();
        while let Some((freed_at, _)) = gc.front() {
            if !force && clock::millis_since(*freed_at) < self.lock_time_ms {
                break;
            }
            gc.pop_front();
        }
    }

    /// Drops the free list; GC entries are left for a forced sweep.
    pub(crate) fn clear(&self) {
        self.free.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    #[cfg(test)]
    fn gc_len(&self) -> usize {
        self.gc.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_append_and_drain() {
        let mut buf = Buffer::new(8);
        assert_eq!(5, buf.append(b"hello"));
        assert_eq!(5, buf.remaining());
        assert_eq!(b"hello", buf.as_slice());

        buf.mark_read(2);
        assert_eq!(b"llo", buf.as_slice());

        // only three bytes of capacity left behind the write cursor
        assert_eq!(3, buf.append(b"world"));
        assert_eq!(b"llowor", buf.as_slice());
        assert_eq!(0, buf.remaining_mut());
    }

    #[test]
    fn buffer_mark_read_saturates_at_write_offset() {
        let mut buf = Buffer::new(8);
        buf.append(b"abc");
        buf.mark_read(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn pool_recycles_within_capacity() {
        let pool = BufferPool::new(16, 2, 4, 1_000);
        let mut a = pool.get();
        a.append(b"x");
        pool.put(a);
        assert_eq!(1, pool.free_len());

        // recycled buffers come back clean
        let b = pool.get();
        assert!(b.is_empty());
        assert_eq!(16, b.remaining_mut());
    }

    #[test]
    fn pool_overflow_goes_to_gc_and_ages_out() {
        let pool = BufferPool::new(16, 1, 8, 50);
        pool.put(Buffer::new(16));
        pool.put(Buffer::new(16));
        assert_eq!(1, pool.free_len());
        assert_eq!(1, pool.gc_len());

        // too young to release
        pool.sweep(false);
        assert_eq!(1, pool.gc_len());

        std::thread::sleep(std::time::Duration::from_millis(60));
        pool.sweep(false);
        assert_eq!(0, pool.gc_len());
    }

    #[test]
    fn forced_sweep_ignores_age() {
        let pool = BufferPool::new(16, 0, 8, 60_000);
        pool.put(Buffer::new(16));
        assert_eq!(1, pool.gc_len());
        pool.sweep(true);
        assert_eq!(0, pool.gc_len());
    }
}
