//! Point-to-point channels over pluggable transports.
//!
//! A [`Channel`] binds one source [`Buffer`], one destination [`Buffer`] and
//! one [`Transport`]. It adds message framing, per-link sequence tagging and
//! the read/write state machines; the transport only moves bytes.
//!
//! # Framing
//!
//! - **Fixed-size** buffers: exactly one receive of the known packed length.
//! - **Variable-size** buffers: if the transport reports the message length
//!   out of band it is used directly; otherwise the fixed 24-byte header is
//!   read first, the destination grows to the declared length, and the
//!   payload is read into place.
//!
//! Either way the destination is unpacked in place when the last byte lands.
//!
//! # Failure
//!
//! A failed call moves the channel to the `Error` state and every later call
//! returns [`ChannelStatus::Error`]. Nothing is retried; the owning stage
//! decides whether to stall, skip the cycle, or rebuild the channel.

pub mod id;
pub mod stats;

pub use id::{ChannelTag, TagAllocator};
pub use stats::ChannelStats;

use crate::buffer::{Buffer, WireHeader, HEADER_LEN};
use crate::error::{Result, RuntimeError};
use crate::transport::{IoProgress, Transport, TransportOps};
use std::time::Instant;

/// Receive-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Nothing read yet
    Idle,
    /// Waiting for the header (or the out-of-band length) of a variable-size message
    ReadingHeader,
    /// Receiving the payload of a variable-size message
    ReadingBody,
    /// Last read completed and was unpacked
    Finished,
    /// A fixed-size receive is in flight
    Busy,
    /// A call failed; the channel is unusable
    Error,
}

/// Send-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Finished,
    Busy,
}

/// Result of a read or write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Finished,
    Busy,
    Error,
}

impl ChannelStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, ChannelStatus::Finished)
    }
}

/// A framed, sequence-tagged link between two Buffers.
pub struct Channel {
    tag: ChannelTag,
    source: Buffer,
    destination: Buffer,
    transport: Transport,
    read_state: ReadState,
    write_state: WriteState,
    /// Wire offset the current receive phase starts at
    read_from: usize,
    /// Total message length of the read in progress
    read_target: usize,
    read_started: Option<Instant>,
    next_send_seq: u64,
    expected_recv_seq: Option<u64>,
    failed: bool,
    last_error: Option<RuntimeError>,
    stats: ChannelStats,
}

impl Channel {
    /// Bind `source` and `destination` to `transport`.
    ///
    /// The two buffers must agree on type tag, version and framing.
    pub fn new(
        tag: ChannelTag,
        source: Buffer,
        destination: Buffer,
        transport: Transport,
    ) -> Result<Self> {
        let (src, dst) = (source.signature(), destination.signature());
        if !src.compatible_with(&dst) {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "channel {}: source {} does not match destination {}",
                tag, src, dst
            )));
        }
        if source.is_variable_size() != destination.is_variable_size() {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "channel {}: source and destination disagree on variable-size framing",
                tag
            )));
        }
        tracing::debug!(
            "Channel {} created: {} over {}",
            tag,
            src,
            transport.describe()
        );
        Ok(Self {
            tag,
            source,
            destination,
            transport,
            read_state: ReadState::Idle,
            write_state: WriteState::Finished,
            read_from: 0,
            read_target: 0,
            read_started: None,
            next_send_seq: 0,
            expected_recv_seq: None,
            failed: false,
            last_error: None,
            stats: ChannelStats::default(),
        })
    }

    /// A channel whose source and destination share one layout.
    pub fn with_layout(tag: ChannelTag, layout: &Buffer, transport: Transport) -> Result<Self> {
        Self::new(tag, layout.clone_layout(), layout.clone_layout(), transport)
    }

    pub fn tag(&self) -> ChannelTag {
        self.tag
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn last_error(&self) -> Option<&RuntimeError> {
        self.last_error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<RuntimeError> {
        self.last_error.take()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn source(&self) -> &Buffer {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut Buffer {
        &mut self.source
    }

    pub fn destination(&self) -> &Buffer {
        &self.destination
    }

    pub fn destination_mut(&mut self) -> &mut Buffer {
        &mut self.destination
    }

    /// Exchange the destination buffer with `other` (used to point the channel
    /// at a pool entry). Not allowed while a read is in flight.
    pub fn swap_destination(&mut self, other: &mut Buffer) -> Result<()> {
        if self.read_in_flight() {
            return Err(RuntimeError::InvalidState(format!(
                "channel {}: destination swapped during a read",
                self.tag
            )));
        }
        std::mem::swap(&mut self.destination, other);
        Ok(())
    }

    /// Exchange the source buffer with `other`. Not allowed while a write is in flight.
    pub fn swap_source(&mut self, other: &mut Buffer) -> Result<()> {
        if self.write_state == WriteState::Busy {
            return Err(RuntimeError::InvalidState(format!(
                "channel {}: source swapped during a write",
                self.tag
            )));
        }
        std::mem::swap(&mut self.source, other);
        Ok(())
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn read_in_flight(&self) -> bool {
        matches!(
            self.read_state,
            ReadState::Busy | ReadState::ReadingHeader | ReadState::ReadingBody
        )
    }

    // ── Reads ──

    /// Blocking read. Resumes a pending non-blocking read if there is one.
    pub fn read(&mut self) -> ChannelStatus {
        self.drive_read(true)
    }

    /// Start (or continue) a read without blocking.
    pub fn read_nonblocking(&mut self) -> ChannelStatus {
        self.drive_read(false)
    }

    /// Block until a pending non-blocking read completes.
    pub fn wait_for_read(&mut self) -> ChannelStatus {
        self.drive_read(true)
    }

    /// Abandon a pending read that has not consumed any bytes yet.
    ///
    /// Returns `true` if the channel is idle afterwards.
    pub fn cancel_read(&mut self) -> bool {
        match self.read_state {
            ReadState::Busy | ReadState::ReadingHeader => {
                if self.transport.cancel_recv() {
                    self.read_state = ReadState::Idle;
                    self.read_started = None;
                    true
                } else {
                    false
                }
            }
            ReadState::ReadingBody => false,
            _ => true,
        }
    }

    fn drive_read(&mut self, blocking: bool) -> ChannelStatus {
        if self.failed {
            return ChannelStatus::Error;
        }
        match self.advance_read(blocking) {
            Ok(ChannelStatus::Busy) => {
                self.stats.record_busy();
                ChannelStatus::Busy
            }
            Ok(status) => status,
            Err(e) => self.fail(e),
        }
    }

    fn ensure_allocated(buffer: &mut Buffer, transport: &Transport) -> Result<()> {
        if !buffer.is_allocated() {
            buffer.allocate(transport.allocation_policy())?;
        }
        Ok(())
    }

    /// Receive `wire[read_from..read_target]`, resuming partial progress.
    fn receive_phase(&mut self, blocking: bool) -> Result<IoProgress> {
        let (from, to) = (self.read_from, self.read_target);
        let buf = &mut self.destination.wire_mut()[from..to];
        if blocking {
            if self.transport.recv_progress() > 0 {
                self.transport.wait_for_received(buf)?;
            } else {
                self.transport.recv_blocking(buf)?;
            }
            Ok(IoProgress::Complete)
        } else {
            self.transport.recv_nonblocking(buf)
        }
    }

    fn advance_read(&mut self, blocking: bool) -> Result<ChannelStatus> {
        loop {
            match self.read_state {
                ReadState::Idle | ReadState::Finished => {
                    Self::ensure_allocated(&mut self.destination, &self.transport)?;
                    self.read_started = Some(Instant::now());
                    self.read_from = 0;
                    if self.destination.is_variable_size() {
                        self.read_state = ReadState::ReadingHeader;
                    } else {
                        self.read_target = self.destination.packed_len();
                        if self.destination.wire().len() < self.read_target {
                            self.destination.resize(self.read_target)?;
                        }
                        self.read_state = ReadState::Busy;
                    }
                }
                ReadState::ReadingHeader => {
                    if self.transport.knows_message_length() {
                        let Some(total) = self.transport.message_length(blocking)? else {
                            return Ok(ChannelStatus::Busy);
                        };
                        self.destination.resize(total)?;
                        self.read_from = 0;
                        self.read_target = total;
                    } else {
                        if self.destination.wire().len() < HEADER_LEN {
                            self.destination.resize(HEADER_LEN)?;
                        }
                        self.read_from = 0;
                        self.read_target = HEADER_LEN;
                        if self.receive_phase(blocking)? == IoProgress::Pending {
                            return Ok(ChannelStatus::Busy);
                        }
                        let header = WireHeader::decode(&self.destination.wire()[..HEADER_LEN])?;
                        let total = header.message_len();
                        self.destination.resize(total)?;
                        self.read_from = HEADER_LEN;
                        self.read_target = total;
                    }
                    self.read_state = ReadState::ReadingBody;
                }
                ReadState::ReadingBody | ReadState::Busy => {
                    if self.read_from < self.read_target
                        && self.receive_phase(blocking)? == IoProgress::Pending
                    {
                        return Ok(ChannelStatus::Busy);
                    }
                    self.destination.unpack()?;
                    self.finish_read();
                    return Ok(ChannelStatus::Finished);
                }
                ReadState::Error => return Ok(ChannelStatus::Error),
            }
        }
    }

    fn finish_read(&mut self) {
        self.read_state = ReadState::Finished;
        let waited = self
            .read_started
            .take()
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);
        self.stats.record_received(self.read_target, waited);

        let sequence = self.destination.sequence();
        if let Some(expected) = self.expected_recv_seq {
            if sequence != expected {
                self.stats.record_gap();
                tracing::warn!(
                    "Channel {}: sequence gap, expected {} got {}",
                    self.tag,
                    expected,
                    sequence
                );
            }
        }
        self.expected_recv_seq = Some(sequence.wrapping_add(1));
    }

    // ── Writes ──

    /// Pack the source and send it, blocking until sent.
    pub fn write(&mut self) -> ChannelStatus {
        if self.failed {
            return ChannelStatus::Error;
        }
        if self.write_state == WriteState::Busy {
            if let Err(e) = self.transport.wait_for_sent() {
                return self.fail(e);
            }
            self.write_state = WriteState::Finished;
        }
        match self.start_write(true) {
            Ok(_) => ChannelStatus::Finished,
            Err(e) => self.fail(e),
        }
    }

    /// Pack the source and start sending it without blocking.
    pub fn write_nonblocking(&mut self) -> ChannelStatus {
        if self.failed {
            return ChannelStatus::Error;
        }
        if self.write_state == WriteState::Busy {
            self.stats.record_busy();
            return ChannelStatus::Busy;
        }
        match self.start_write(false) {
            Ok(IoProgress::Complete) => ChannelStatus::Finished,
            Ok(IoProgress::Pending) => {
                self.write_state = WriteState::Busy;
                self.stats.record_busy();
                ChannelStatus::Busy
            }
            Err(e) => self.fail(e),
        }
    }

    /// Block until a pending non-blocking write has gone out.
    pub fn wait_for_write(&mut self) -> ChannelStatus {
        if self.failed {
            return ChannelStatus::Error;
        }
        if self.write_state == WriteState::Busy {
            if let Err(e) = self.transport.wait_for_sent() {
                return self.fail(e);
            }
            self.write_state = WriteState::Finished;
        }
        ChannelStatus::Finished
    }

    fn start_write(&mut self, blocking: bool) -> Result<IoProgress> {
        Self::ensure_allocated(&mut self.source, &self.transport)?;
        self.source.set_sequence(self.next_send_seq);
        let bytes = self.source.pack()?;
        let len = bytes.len();
        let progress = if blocking {
            self.transport.send_blocking(bytes)?;
            IoProgress::Complete
        } else {
            self.transport.send_nonblocking(bytes)?
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        self.stats.record_sent(len);
        Ok(progress)
    }

    fn fail(&mut self, err: RuntimeError) -> ChannelStatus {
        tracing::error!(
            "Channel {} over {} failed: {}",
            self.tag,
            self.transport.describe(),
            err
        );
        self.failed = true;
        self.read_state = ReadState::Error;
        self.stats.record_error();
        self.last_error = Some(err);
        ChannelStatus::Error
    }

    /// Take the channel apart, returning its buffers and transport.
    pub fn into_parts(self) -> (Buffer, Buffer, Transport) {
        (self.source, self.destination, self.transport)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("tag", &self.tag)
            .field("source", &self.source.signature())
            .field("transport", &self.transport)
            .field("read_state", &self.read_state)
            .field("write_state", &self.write_state)
            .field("failed", &self.failed)
            .finish()
    }
}
