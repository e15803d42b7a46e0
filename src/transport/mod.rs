//! Byte-level transports behind one capability interface.
//!
//! The set of backends is closed and known at compile time, so they are
//! expressed as variants of the [`Transport`] enum, each implementing
//! [`TransportOps`]. Matching on the enum keeps dispatch static on the hot
//! path, the same way built-in pipeline nodes are dispatched.
//!
//! # Backends
//!
//! - [`LoopbackTransport`] - in-process byte stream over crossbeam channels
//! - [`ShmTransport`] - shared-memory segment with a two-token handshake
//! - [`SocketTransport`] - TCP stream between hosts
//! - [`ReplayTransport`] - record to / replay from a file
//!
//! # Non-blocking operations
//!
//! `send_nonblocking` / `recv_nonblocking` start an operation and may return
//! [`IoProgress::Pending`]. The transport remembers how far it got, so a later
//! call to the same non-blocking method continues rather than restarts, and
//! `wait_for_sent` / `wait_for_received` block until the pending operation
//! completes. A receive must be resumed with the same destination slice.

pub mod loopback;
pub mod replay;
pub mod shm;
pub mod socket;

pub use loopback::LoopbackTransport;
pub use replay::ReplayTransport;
pub use shm::{ShmArena, ShmHandle, ShmRole, ShmTransport, SHM_COOKIE, SHM_HEADER_LEN};
pub use socket::SocketTransport;

use crate::buffer::AllocationPolicy;
use crate::error::Result;
use std::fmt;

/// Outcome of a non-blocking transport call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoProgress {
    /// The whole operation finished
    Complete,
    /// Partial progress was recorded; resume later
    Pending,
}

impl IoProgress {
    pub fn is_complete(&self) -> bool {
        matches!(self, IoProgress::Complete)
    }
}

/// Which backend a transport is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Loopback,
    SharedMemory,
    Socket,
    Replay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Loopback => "loopback",
            TransportKind::SharedMemory => "shm",
            TransportKind::Socket => "socket",
            TransportKind::Replay => "replay",
        };
        f.write_str(name)
    }
}

/// Capability interface every backend provides.
///
/// Implementations only keep connection/handshake state; they never own the
/// data they carry beyond a pending non-blocking send.
pub trait TransportOps: Send {
    fn kind(&self) -> TransportKind;

    /// Send all of `bytes`, blocking until done.
    fn send_blocking(&mut self, bytes: &[u8]) -> Result<()>;

    /// Start sending `bytes`; the transport keeps a copy of whatever is not yet sent.
    fn send_nonblocking(&mut self, bytes: &[u8]) -> Result<IoProgress>;

    /// Block until a pending non-blocking send has completed.
    fn wait_for_sent(&mut self) -> Result<()>;

    /// Fill all of `buf`, blocking until done.
    fn recv_blocking(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Fill as much of `buf` as is available without blocking.
    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> Result<IoProgress>;

    /// Block until a pending non-blocking receive into `buf` has completed.
    fn wait_for_received(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Bytes received so far by the pending receive.
    fn recv_progress(&self) -> usize;

    /// Abandon a pending receive that has not received anything yet.
    ///
    /// Returns `false` (and keeps the receive pending) once bytes have arrived.
    fn cancel_recv(&mut self) -> bool {
        self.recv_progress() == 0
    }

    /// Whether the backend can report the next message's total length
    /// out of band, ahead of the header.
    fn knows_message_length(&self) -> bool {
        false
    }

    /// Total length of the next message, if the backend knows it.
    ///
    /// With `blocking == false` this returns `Ok(None)` when no message has arrived yet.
    fn message_length(&mut self, _blocking: bool) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Growth capability and allocator of the wire format.
    fn allocation_policy(&self) -> AllocationPolicy;

    /// Human-readable peer description for logs.
    fn describe(&self) -> String;
}

/// Closed set of transport backends.
pub enum Transport {
    Loopback(LoopbackTransport),
    SharedMemory(ShmTransport),
    Socket(SocketTransport),
    Replay(ReplayTransport),
}

macro_rules! dispatch {
    ($self:ident, $t:ident => $body:expr) => {
        match $self {
            Transport::Loopback($t) => $body,
            Transport::SharedMemory($t) => $body,
            Transport::Socket($t) => $body,
            Transport::Replay($t) => $body,
        }
    };
}

impl TransportOps for Transport {
    fn kind(&self) -> TransportKind {
        dispatch!(self, t => t.kind())
    }

    fn send_blocking(&mut self, bytes: &[u8]) -> Result<()> {
        dispatch!(self, t => t.send_blocking(bytes))
    }

    fn send_nonblocking(&mut self, bytes: &[u8]) -> Result<IoProgress> {
        dispatch!(self, t => t.send_nonblocking(bytes))
    }

    fn wait_for_sent(&mut self) -> Result<()> {
        dispatch!(self, t => t.wait_for_sent())
    }

    fn recv_blocking(&mut self, buf: &mut [u8]) -> Result<()> {
        dispatch!(self, t => t.recv_blocking(buf))
    }

    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> Result<IoProgress> {
        dispatch!(self, t => t.recv_nonblocking(buf))
    }

    fn wait_for_received(&mut self, buf: &mut [u8]) -> Result<()> {
        dispatch!(self, t => t.wait_for_received(buf))
    }

    fn recv_progress(&self) -> usize {
        dispatch!(self, t => t.recv_progress())
    }

    fn cancel_recv(&mut self) -> bool {
        dispatch!(self, t => t.cancel_recv())
    }

    fn knows_message_length(&self) -> bool {
        dispatch!(self, t => t.knows_message_length())
    }

    fn message_length(&mut self, blocking: bool) -> Result<Option<usize>> {
        dispatch!(self, t => t.message_length(blocking))
    }

    fn allocation_policy(&self) -> AllocationPolicy {
        dispatch!(self, t => t.allocation_policy())
    }

    fn describe(&self) -> String {
        dispatch!(self, t => t.describe())
    }
}

impl From<LoopbackTransport> for Transport {
    fn from(t: LoopbackTransport) -> Self {
        Transport::Loopback(t)
    }
}

impl From<ShmTransport> for Transport {
    fn from(t: ShmTransport) -> Self {
        Transport::SharedMemory(t)
    }
}

impl From<SocketTransport> for Transport {
    fn from(t: SocketTransport) -> Self {
        Transport::Socket(t)
    }
}

impl From<ReplayTransport> for Transport {
    fn from(t: ReplayTransport) -> Self {
        Transport::Replay(t)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind())
            .field("peer", &self.describe())
            .finish()
    }
}
