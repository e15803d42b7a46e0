//! Buffer pools shared between the pipeline thread and a background I/O thread.
//!
//! Entries move by value through crossbeam queues. Holding a [`PoolEntry`] is
//! what it means to hold a lock on it; the [`LockState`] tag only records which
//! kind of access the holder has.

use crate::buffer::{AllocationPolicy, Buffer};
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Access the current holder of an entry has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Sitting in the free queue
    Free,
    /// Held by a producer (reader thread or a stage filling an output)
    WriteLocked,
    /// Holds complete data, owned by a consumer
    ReadLocked,
}

/// One Buffer of a pool.
pub struct PoolEntry {
    buffer: Buffer,
    state: LockState,
    pool_id: u64,
    index: usize,
}

impl PoolEntry {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Mutable access while write-locked. Read-locked data is immutable.
    pub fn buffer_mut(&mut self) -> Option<&mut Buffer> {
        match self.state {
            LockState::WriteLocked => Some(&mut self.buffer),
            _ => None,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Position of the entry inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn buffer_for_io(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub(crate) fn mark(&mut self, state: LockState) {
        self.state = state;
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("pool", &self.pool_id)
            .field("index", &self.index)
            .field("state", &self.state)
            .field("sequence", &self.buffer.sequence())
            .finish()
    }
}

/// Fixed set of pre-allocated Buffers with a free queue.
pub struct BufferPool {
    id: u64,
    size: usize,
    free_tx: Sender<PoolEntry>,
    free_rx: Receiver<PoolEntry>,
}

impl BufferPool {
    /// Allocate `size` copies of `layout` with `policy`.
    pub fn new(id: u64, layout: &Buffer, size: usize, policy: AllocationPolicy) -> Result<Self> {
        let (free_tx, free_rx) = unbounded();
        for index in 0..size {
            let mut buffer = layout.clone_layout();
            buffer.allocate(policy)?;
            // The receiver is alive, so this cannot fail.
            let _ = free_tx.send(PoolEntry {
                buffer,
                state: LockState::Free,
                pool_id: id,
                index,
            });
        }
        tracing::debug!(
            "Buffer pool {} created: {} x {}",
            id,
            size,
            layout.signature()
        );
        Ok(Self {
            id,
            size,
            free_tx,
            free_rx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Entries currently in the free queue.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Take a free entry without waiting, write-locking it.
    pub fn try_acquire(&self) -> Option<PoolEntry> {
        self.free_rx.try_recv().ok().map(|mut entry| {
            entry.mark(LockState::WriteLocked);
            entry
        })
    }

    /// The free queue, for callers that need to `select!` on it.
    pub(crate) fn free_queue(&self) -> &Receiver<PoolEntry> {
        &self.free_rx
    }

    /// Return an entry to the free queue.
    ///
    /// Entries from another pool are dropped and `false` is returned.
    pub fn release(&self, mut entry: PoolEntry) -> bool {
        if entry.pool_id != self.id {
            return false;
        }
        entry.mark(LockState::Free);
        let _ = self.free_tx.send(entry);
        true
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ElementType;

    fn layout() -> Buffer {
        let mut buf = Buffer::new("visibilities", 7, 1);
        buf.add_field("vis", ElementType::Complex32, 4).unwrap();
        buf
    }

    #[test]
    fn test_pool_entries_are_allocated() {
        let pool = BufferPool::new(1, &layout(), 3, AllocationPolicy::heap()).unwrap();
        assert_eq!(pool.available(), 3);
        let entry = pool.try_acquire().unwrap();
        assert!(entry.buffer().is_allocated());
        assert_eq!(entry.state(), LockState::WriteLocked);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let pool = BufferPool::new(2, &layout(), 1, AllocationPolicy::heap()).unwrap();
        let entry = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert!(pool.release(entry));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_foreign_entry_is_dropped() {
        let a = BufferPool::new(1, &layout(), 1, AllocationPolicy::heap()).unwrap();
        let b = BufferPool::new(2, &layout(), 1, AllocationPolicy::heap()).unwrap();
        let entry = a.try_acquire().unwrap();
        assert!(!b.release(entry));
        assert_eq!(b.available(), 1);
        assert_eq!(a.available(), 0);
    }

    #[test]
    fn test_read_locked_is_immutable() {
        let pool = BufferPool::new(1, &layout(), 1, AllocationPolicy::heap()).unwrap();
        let mut entry = pool.try_acquire().unwrap();
        assert!(entry.buffer_mut().is_some());
        entry.mark(LockState::ReadLocked);
        assert!(entry.buffer_mut().is_none());
    }
}
