//! Shared-memory transport.
//!
//! A producer allocates a segment from a [`ShmArena`] and hands its
//! [`ShmHandle`] (`{arena id, offset}`) to the consumer once, through a
//! fallback transport. After that every exchange is a token hand-over on the
//! segment's control block:
//!
//! ```text
//! producer                      segment                      consumer
//!   wait "receive complete" ─┐  [cookie|link|len|data...]  ┌─ wait "data ready"
//!   copy message in          │                             │  validate cookie/link
//!   signal "data ready" ─────┴──────────────────────────── ┘  copy message out
//!                                                             signal "receive complete"
//! ```
//!
//! Whoever holds the token owns the segment bytes; the bytes live inside the
//! same mutex as the token so they are never touched concurrently.
//!
//! The cookie/link prefix is a provenance sanity check, not a security
//! boundary. Two unrelated producers writing the same segment concurrently is
//! undefined: the arena hands each allocation to exactly one producer and does
//! not detect reuse.

use crate::buffer::AllocationPolicy;
use crate::error::{Result, RuntimeError};
use crate::transport::{IoProgress, Transport, TransportKind, TransportOps};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Magic value at the start of every shared allocation ("SHMCOOKE").
pub const SHM_COOKIE: u64 = 0x5348_4D43_4F4F_4B45;

/// Cookie, link and message length precede the message bytes.
pub const SHM_HEADER_LEN: usize = 24;

/// Wire size of an encoded [`ShmHandle`].
pub const SHM_HANDLE_LEN: usize = 16;

/// Location of a shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmHandle {
    /// Identifies the arena (stands in for the owning process id)
    pub arena_id: u64,
    /// Offset of the allocation inside the arena
    pub offset: u64,
}

impl ShmHandle {
    pub fn encode(&self) -> [u8; SHM_HANDLE_LEN] {
        let mut raw = [0u8; SHM_HANDLE_LEN];
        raw[..8].copy_from_slice(&self.arena_id.to_le_bytes());
        raw[8..].copy_from_slice(&self.offset.to_le_bytes());
        raw
    }

    pub fn decode(raw: &[u8; SHM_HANDLE_LEN]) -> Self {
        let mut id = [0u8; 8];
        let mut offset = [0u8; 8];
        id.copy_from_slice(&raw[..8]);
        offset.copy_from_slice(&raw[8..]);
        Self {
            arena_id: u64::from_le_bytes(id),
            offset: u64::from_le_bytes(offset),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// Producer may write the next message
    Producer,
    /// A message is ready for the consumer
    Consumer,
}

struct SegmentState {
    bytes: Vec<u8>,
    token: Token,
    read_pos: usize,
    closed: bool,
}

impl SegmentState {
    fn message_len(&self) -> usize {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[16..24]);
        u64::from_le_bytes(raw) as usize
    }

    fn validate(&self, handle: &ShmHandle) -> Result<()> {
        let mut cookie = [0u8; 8];
        let mut link = [0u8; 8];
        cookie.copy_from_slice(&self.bytes[..8]);
        link.copy_from_slice(&self.bytes[8..16]);
        if u64::from_le_bytes(cookie) != SHM_COOKIE {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "bad cookie in segment at offset {}",
                handle.offset
            )));
        }
        if u64::from_le_bytes(link) != handle.offset {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "segment link {} does not match handle offset {}",
                u64::from_le_bytes(link),
                handle.offset
            )));
        }
        Ok(())
    }
}

/// One shared allocation plus its control block.
pub struct ShmSegment {
    state: Mutex<SegmentState>,
    data_ready: Condvar,
    recv_complete: Condvar,
    capacity: usize,
}

impl ShmSegment {
    fn new(offset: u64, capacity: usize) -> Self {
        let mut bytes = vec![0u8; SHM_HEADER_LEN + capacity];
        bytes[..8].copy_from_slice(&SHM_COOKIE.to_le_bytes());
        bytes[8..16].copy_from_slice(&offset.to_le_bytes());
        Self {
            state: Mutex::new(SegmentState {
                bytes,
                token: Token::Producer,
                read_pos: 0,
                closed: false,
            }),
            data_ready: Condvar::new(),
            recv_complete: Condvar::new(),
            capacity,
        }
    }

    /// Message capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> Result<MutexGuard<'_, SegmentState>> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::transport("shared segment lock poisoned"))
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.data_ready.notify_all();
        self.recv_complete.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn scribble(&self, at: usize, raw: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.bytes[at..at + raw.len()].copy_from_slice(raw);
    }
}

/// Registry of shared segments reachable by handle.
///
/// The arena is an explicit object shared by every endpoint on the host
/// rather than a global, so tests and separate runtimes stay isolated.
pub struct ShmArena {
    id: u64,
    inner: Mutex<ArenaInner>,
}

struct ArenaInner {
    next_offset: u64,
    segments: HashMap<u64, Registered>,
}

/// A segment plus the number of endpoints attached to it.
struct Registered {
    segment: Arc<ShmSegment>,
    endpoints: usize,
}

impl ShmArena {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(ArenaInner {
                next_offset: 0,
                segments: HashMap::new(),
            }),
        })
    }

    /// Arena for this process, identified by its pid.
    pub fn for_process() -> Arc<Self> {
        Self::new(std::process::id() as u64)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> Result<MutexGuard<'_, ArenaInner>> {
        self.inner
            .lock()
            .map_err(|_| RuntimeError::transport("shared arena lock poisoned"))
    }

    /// Allocate a segment able to hold messages of up to `capacity` bytes.
    ///
    /// The caller counts as its first attached endpoint.
    pub fn allocate(&self, capacity: usize) -> Result<(ShmHandle, Arc<ShmSegment>)> {
        let mut inner = self.lock()?;
        let offset = inner.next_offset;
        inner.next_offset += (SHM_HEADER_LEN + capacity) as u64;
        let segment = Arc::new(ShmSegment::new(offset, capacity));
        inner.segments.insert(
            offset,
            Registered {
                segment: segment.clone(),
                endpoints: 1,
            },
        );
        Ok((
            ShmHandle {
                arena_id: self.id,
                offset,
            },
            segment,
        ))
    }

    /// Resolve a handle received from a peer, validating its provenance, and
    /// attach one more endpoint to it.
    pub fn resolve(&self, handle: &ShmHandle) -> Result<Arc<ShmSegment>> {
        if handle.arena_id != self.id {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "handle for arena {} presented to arena {}",
                handle.arena_id, self.id
            )));
        }
        let mut inner = self.lock()?;
        let entry = inner.segments.get_mut(&handle.offset).ok_or_else(|| {
            RuntimeError::HandshakeMismatch(format!("no segment at offset {}", handle.offset))
        })?;
        entry.segment.lock()?.validate(handle)?;
        entry.endpoints += 1;
        Ok(entry.segment.clone())
    }

    /// Detach one endpoint; the segment is released with its last one.
    fn detach(&self, handle: &ShmHandle) -> Result<()> {
        let mut inner = self.lock()?;
        let last = match inner.segments.get_mut(&handle.offset) {
            Some(entry) => {
                entry.endpoints = entry.endpoints.saturating_sub(1);
                entry.endpoints == 0
            }
            None => false,
        };
        if last {
            inner.segments.remove(&handle.offset);
            tracing::debug!("Released shared segment at offset {}", handle.offset);
        }
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.lock().map(|inner| inner.segments.len()).unwrap_or(0)
    }
}

/// Which side of the segment an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmRole {
    Producer,
    Consumer,
}

/// Endpoint of a shared-memory link.
pub struct ShmTransport {
    arena: Arc<ShmArena>,
    role: ShmRole,
    handle: ShmHandle,
    segment: Arc<ShmSegment>,
    pending_send: Option<Vec<u8>>,
    recv_progress: usize,
}

impl ShmTransport {
    /// Allocate a segment and send its handle through `fallback`.
    pub fn producer(arena: &Arc<ShmArena>, capacity: usize, fallback: &mut Transport) -> Result<Self> {
        let (handle, segment) = arena.allocate(capacity)?;
        if let Err(e) = fallback.send_blocking(&handle.encode()) {
            arena.detach(&handle)?;
            return Err(e);
        }
        tracing::debug!(
            "Shared segment {:?} ({} bytes) offered via {}",
            handle,
            capacity,
            fallback.describe()
        );
        Ok(Self {
            arena: arena.clone(),
            role: ShmRole::Producer,
            handle,
            segment,
            pending_send: None,
            recv_progress: 0,
        })
    }

    /// Receive a handle through `fallback` and attach to its segment.
    pub fn consumer(arena: &Arc<ShmArena>, fallback: &mut Transport) -> Result<Self> {
        let mut raw = [0u8; SHM_HANDLE_LEN];
        fallback.recv_blocking(&mut raw)?;
        let handle = ShmHandle::decode(&raw);
        let segment = arena.resolve(&handle)?;
        tracing::debug!("Attached to shared segment {:?}", handle);
        Ok(Self {
            arena: arena.clone(),
            role: ShmRole::Consumer,
            handle,
            segment,
            pending_send: None,
            recv_progress: 0,
        })
    }

    pub fn role(&self) -> ShmRole {
        self.role
    }

    pub fn handle(&self) -> ShmHandle {
        self.handle
    }

    fn require(&self, role: ShmRole) -> Result<()> {
        if self.role != role {
            return Err(RuntimeError::InvalidState(format!(
                "{:?} end of shared segment cannot do that",
                self.role
            )));
        }
        Ok(())
    }

    /// Copy a message in and pass the token. Returns `Pending` without blocking
    /// when the consumer still holds the token.
    fn try_put(&mut self, bytes: &[u8], blocking: bool) -> Result<IoProgress> {
        if bytes.len() > self.segment.capacity {
            return Err(RuntimeError::CapacityExceeded {
                requested: bytes.len(),
                capacity: self.segment.capacity,
            });
        }
        let mut state = self.segment.lock()?;
        while state.token == Token::Consumer && !state.closed {
            if !blocking {
                return Ok(IoProgress::Pending);
            }
            state = self
                .segment
                .recv_complete
                .wait(state)
                .map_err(|_| RuntimeError::transport("shared segment lock poisoned"))?;
        }
        if state.closed {
            return Err(RuntimeError::transport("shared segment closed by consumer"));
        }
        state.bytes[16..24].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
        state.bytes[SHM_HEADER_LEN..SHM_HEADER_LEN + bytes.len()].copy_from_slice(bytes);
        state.read_pos = 0;
        state.token = Token::Consumer;
        drop(state);
        self.segment.data_ready.notify_one();
        Ok(IoProgress::Complete)
    }

    /// Copy from the current message into `buf[recv_progress..]`.
    fn take(&mut self, buf: &mut [u8], blocking: bool) -> Result<IoProgress> {
        let mut state = self.segment.lock()?;
        while state.token == Token::Producer {
            if state.closed {
                return Err(RuntimeError::transport("shared segment closed by producer"));
            }
            if !blocking {
                return Ok(IoProgress::Pending);
            }
            state = self
                .segment
                .data_ready
                .wait(state)
                .map_err(|_| RuntimeError::transport("shared segment lock poisoned"))?;
        }
        state.validate(&self.handle)?;

        let want = buf.len() - self.recv_progress;
        let len = state.message_len();
        let remaining = len - state.read_pos;
        if want > remaining {
            return Err(RuntimeError::transport(format!(
                "shared message has {} bytes left, receive wants {}",
                remaining, want
            )));
        }
        let from = SHM_HEADER_LEN + state.read_pos;
        buf[self.recv_progress..].copy_from_slice(&state.bytes[from..from + want]);
        state.read_pos += want;
        self.recv_progress = 0;
        if state.read_pos == len {
            state.token = Token::Producer;
            drop(state);
            self.segment.recv_complete.notify_one();
        }
        Ok(IoProgress::Complete)
    }
}

impl TransportOps for ShmTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SharedMemory
    }

    fn send_blocking(&mut self, bytes: &[u8]) -> Result<()> {
        self.require(ShmRole::Producer)?;
        self.wait_for_sent()?;
        self.try_put(bytes, true).map(|_| ())
    }

    fn send_nonblocking(&mut self, bytes: &[u8]) -> Result<IoProgress> {
        self.require(ShmRole::Producer)?;
        if self.pending_send.is_some() {
            return Err(RuntimeError::InvalidState(
                "previous non-blocking send still pending".to_string(),
            ));
        }
        let progress = self.try_put(bytes, false)?;
        if progress == IoProgress::Pending {
            self.pending_send = Some(bytes.to_vec());
        }
        Ok(progress)
    }

    fn wait_for_sent(&mut self) -> Result<()> {
        if let Some(bytes) = self.pending_send.take() {
            self.try_put(&bytes, true)?;
        }
        Ok(())
    }

    fn recv_blocking(&mut self, buf: &mut [u8]) -> Result<()> {
        self.require(ShmRole::Consumer)?;
        self.take(buf, true).map(|_| ())
    }

    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> Result<IoProgress> {
        self.require(ShmRole::Consumer)?;
        self.take(buf, false)
    }

    fn wait_for_received(&mut self, buf: &mut [u8]) -> Result<()> {
        self.recv_blocking(buf)
    }

    fn recv_progress(&self) -> usize {
        self.recv_progress
    }

    fn knows_message_length(&self) -> bool {
        true
    }

    fn message_length(&mut self, blocking: bool) -> Result<Option<usize>> {
        self.require(ShmRole::Consumer)?;
        let mut state = self.segment.lock()?;
        while state.token == Token::Producer {
            if state.closed {
                return Err(RuntimeError::transport("shared segment closed by producer"));
            }
            if !blocking {
                return Ok(None);
            }
            state = self
                .segment
                .data_ready
                .wait(state)
                .map_err(|_| RuntimeError::transport("shared segment lock poisoned"))?;
        }
        state.validate(&self.handle)?;
        Ok(Some(state.message_len() - state.read_pos))
    }

    fn allocation_policy(&self) -> AllocationPolicy {
        AllocationPolicy::fixed(self.segment.capacity)
    }

    fn describe(&self) -> String {
        format!(
            "shm({:?}, arena={}, offset={})",
            self.role, self.handle.arena_id, self.handle.offset
        )
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        self.segment.close();
        if let Err(e) = self.arena.detach(&self.handle) {
            tracing::warn!("Failed to detach from shared segment {:?}: {}", self.handle, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::thread;

    fn connected(capacity: usize) -> (Arc<ShmArena>, ShmTransport, ShmTransport) {
        let arena = ShmArena::new(7);
        let (a, b) = LoopbackTransport::pair();
        let mut fa = Transport::from(a);
        let mut fb = Transport::from(b);
        let producer = ShmTransport::producer(&arena, capacity, &mut fa).unwrap();
        let consumer = ShmTransport::consumer(&arena, &mut fb).unwrap();
        (arena, producer, consumer)
    }

    #[test]
    fn test_handle_encoding() {
        let handle = ShmHandle {
            arena_id: 12,
            offset: 4096,
        };
        assert_eq!(ShmHandle::decode(&handle.encode()), handle);
    }

    #[test]
    fn test_exchange_across_threads() {
        let (_arena, mut producer, mut consumer) = connected(64);
        let writer = thread::spawn(move || {
            for i in 0..5u8 {
                producer.send_blocking(&[i; 16]).unwrap();
            }
            producer
        });
        for i in 0..5u8 {
            assert_eq!(consumer.message_length(true).unwrap(), Some(16));
            let mut buf = [0u8; 16];
            consumer.recv_blocking(&mut buf).unwrap();
            assert_eq!(buf, [i; 16]);
        }
        let _producer = writer.join().unwrap();
    }

    #[test]
    fn test_token_blocks_second_send() {
        let (_arena, mut producer, mut consumer) = connected(8);
        assert!(producer.send_nonblocking(&[1, 2]).unwrap().is_complete());
        assert_eq!(producer.send_nonblocking(&[3, 4]).unwrap(), IoProgress::Pending);

        let mut buf = [0u8; 2];
        consumer.recv_blocking(&mut buf).unwrap();
        producer.wait_for_sent().unwrap();
        consumer.recv_blocking(&mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn test_message_over_capacity() {
        let (_arena, mut producer, _consumer) = connected(4);
        assert!(matches!(
            producer.send_blocking(&[0u8; 5]),
            Err(RuntimeError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_corrupted_cookie_detected() {
        let (_arena, mut producer, mut consumer) = connected(8);
        producer.send_blocking(&[1, 2, 3]).unwrap();
        consumer.segment.scribble(0, &[0xFF; 8]);
        let mut buf = [0u8; 3];
        assert!(matches!(
            consumer.recv_blocking(&mut buf),
            Err(RuntimeError::HandshakeMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_handle_rejected() {
        let arena = ShmArena::new(1);
        let bogus = ShmHandle {
            arena_id: 1,
            offset: 999,
        };
        assert!(matches!(
            arena.resolve(&bogus),
            Err(RuntimeError::HandshakeMismatch(_))
        ));
        let foreign = ShmHandle {
            arena_id: 2,
            offset: 0,
        };
        assert!(arena.resolve(&foreign).is_err());
    }

    #[test]
    fn test_producer_drop_unblocks_consumer() {
        let (_arena, producer, mut consumer) = connected(8);
        drop(producer);
        let mut buf = [0u8; 1];
        assert!(matches!(
            consumer.recv_blocking(&mut buf),
            Err(RuntimeError::Transport(_))
        ));
    }

    #[test]
    fn test_segment_released_with_last_endpoint() {
        let arena = ShmArena::new(3);
        for _ in 0..5 {
            let (a, b) = LoopbackTransport::pair();
            let mut fa = Transport::from(a);
            let mut fb = Transport::from(b);
            let producer = ShmTransport::producer(&arena, 32, &mut fa).unwrap();
            let consumer = ShmTransport::consumer(&arena, &mut fb).unwrap();
            assert_eq!(arena.segment_count(), 1);
            drop(producer);
            assert_eq!(arena.segment_count(), 1);
            drop(consumer);
        }
        assert_eq!(arena.segment_count(), 0);
    }

    #[test]
    fn test_unclaimed_segment_released_by_producer() {
        let arena = ShmArena::new(4);
        let (a, _b) = LoopbackTransport::pair();
        let mut fa = Transport::from(a);
        let producer = ShmTransport::producer(&arena, 32, &mut fa).unwrap();
        let handle = producer.handle();
        drop(producer);
        assert_eq!(arena.segment_count(), 0);
        assert!(arena.resolve(&handle).is_err());
    }

    #[test]
    fn test_wrong_role() {
        let (_arena, mut producer, mut consumer) = connected(8);
        let mut buf = [0u8; 1];
        assert!(producer.recv_blocking(&mut buf).is_err());
        assert!(consumer.send_blocking(&[1]).is_err());
    }
}
