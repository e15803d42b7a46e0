//! Per-channel choice between inline and background I/O.
//!
//! The [`ConcurrencyManager`] owns every registered [`Channel`] together with
//! a pool of Buffers for it. Stage code only ever asks for pool entries:
//!
//! - input channels: [`get_read_locked_buffer`](ConcurrencyManager::get_read_locked_buffer)
//!   then [`release`](ConcurrencyManager::release)
//! - output channels: [`get_write_locked_buffer`](ConcurrencyManager::get_write_locked_buffer)
//!   then [`release`](ConcurrencyManager::release), which publishes the data
//!
//! Whether the transport call happens inline on the pipeline thread
//! ([`IoMode::Synchronous`]) or on a dedicated reader/writer thread
//! ([`IoMode::Asynchronous`]) is invisible to that code.
//!
//! # Mode switches
//!
//! Switching tears down the channel's pool and builds a new one sized for the
//! new mode (one entry when synchronous). The background thread is stopped
//! first; a receive that has not consumed any bytes is cancelled, a partially
//! received message is completed. Entries that were already filled stay in the
//! channel's ready queue and are handed out before any new read, so no data is
//! dropped or duplicated. A switch is refused while the stage still holds
//! entries from the old pool.

pub mod pool;
pub mod worker;

pub use pool::{BufferPool, LockState, PoolEntry};
pub use worker::{WorkerHandle, WorkerKind};

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelStats, ChannelStatus, ChannelTag, TagAllocator};
use crate::error::{Result, RuntimeError};
use crate::transport::{Transport, TransportOps};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which end of the channel the local stage is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The stage consumes data arriving on the channel
    Input,
    /// The stage produces data leaving on the channel
    Output,
}

/// How a channel's transport calls are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IoMode {
    /// Inline on the pipeline thread, one Buffer
    Synchronous,
    /// On a dedicated thread with a pool of `pool_size` Buffers
    Asynchronous { pool_size: usize },
}

impl IoMode {
    fn pool_size(&self) -> usize {
        match self {
            IoMode::Synchronous => 1,
            IoMode::Asynchronous { pool_size } => *pool_size,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, IoMode::Asynchronous { .. })
    }
}

enum Link {
    Local(Channel),
    Worker(WorkerHandle),
    /// Transiently empty while the channel moves between owners
    Detached,
}

struct ChannelSlot {
    direction: Direction,
    mode: IoMode,
    link: Link,
    pool: Option<Arc<BufferPool>>,
    /// Layout and allocation policy used to build pools
    layout: Buffer,
    /// Input: filled entries waiting for the stage. Output: entries waiting to be sent.
    ready_tx: Sender<PoolEntry>,
    ready_rx: Receiver<PoolEntry>,
    /// Entries currently held by the stage
    checked_out: usize,
    /// Set once any entry has been handed out
    started: bool,
    /// The pool is borrowed from another channel
    shares_pool: bool,
    /// Stats of a terminated worker's channel
    final_stats: Option<ChannelStats>,
}

/// Owns channels and their pools; one per pipeline thread.
pub struct ConcurrencyManager {
    tags: Arc<TagAllocator>,
    slots: BTreeMap<ChannelTag, ChannelSlot>,
    next_pool_id: u64,
}

impl ConcurrencyManager {
    /// Create a manager issuing channel tags from `tags`.
    pub fn new(tags: Arc<TagAllocator>) -> Self {
        Self {
            tags,
            slots: BTreeMap::new(),
            next_pool_id: 0,
        }
    }

    /// Build a channel over `transport` and register it.
    pub fn open(
        &mut self,
        source: Buffer,
        destination: Buffer,
        transport: Transport,
        direction: Direction,
        mode: IoMode,
    ) -> Result<ChannelTag> {
        let tag = self.tags.next_tag();
        let channel = Channel::new(tag, source, destination, transport)?;
        self.register(channel, direction, mode)?;
        Ok(tag)
    }

    /// Register an existing channel under its own tag.
    pub fn register(&mut self, channel: Channel, direction: Direction, mode: IoMode) -> Result<()> {
        if mode.pool_size() == 0 {
            return Err(RuntimeError::Config(format!(
                "channel {}: asynchronous pool size must be at least 1",
                channel.tag()
            )));
        }
        let tag = channel.tag();
        if self.slots.contains_key(&tag) {
            return Err(RuntimeError::InvalidState(format!(
                "channel {} already registered",
                tag
            )));
        }
        let layout = match direction {
            Direction::Input => channel.destination().clone_layout(),
            Direction::Output => channel.source().clone_layout(),
        };
        let (ready_tx, ready_rx) = unbounded();
        tracing::info!(
            "Registered {:?} channel {} ({:?})",
            direction,
            tag,
            mode
        );
        self.slots.insert(
            tag,
            ChannelSlot {
                direction,
                mode,
                link: Link::Local(channel),
                pool: None,
                layout,
                ready_tx,
                ready_rx,
                checked_out: 0,
                started: false,
                shares_pool: false,
                final_stats: None,
            },
        );
        Ok(())
    }

    pub fn channel_tags(&self) -> Vec<ChannelTag> {
        self.slots.keys().copied().collect()
    }

    pub fn mode(&self, tag: ChannelTag) -> Option<IoMode> {
        self.slots.get(&tag).map(|slot| slot.mode)
    }

    /// Stats of the channel if it is not currently owned by a worker thread.
    pub fn stats(&self, tag: ChannelTag) -> Option<ChannelStats> {
        let slot = self.slots.get(&tag)?;
        match &slot.link {
            Link::Local(channel) => Some(channel.stats().clone()),
            _ => slot.final_stats.clone(),
        }
    }

    fn slot_mut(&mut self, tag: ChannelTag) -> Result<&mut ChannelSlot> {
        self.slots
            .get_mut(&tag)
            .ok_or_else(|| RuntimeError::InvalidState(format!("unknown channel {}", tag)))
    }

    fn ensure_pool(&mut self, tag: ChannelTag) -> Result<Arc<BufferPool>> {
        let pool_id = self.next_pool_id;
        let slot = self.slot_mut(tag)?;
        if let Some(pool) = &slot.pool {
            return Ok(pool.clone());
        }
        let policy = match &slot.link {
            Link::Local(channel) => channel.transport().allocation_policy(),
            _ => {
                return Err(RuntimeError::InvalidState(format!(
                    "channel {} has no pool but is not local",
                    tag
                )))
            }
        };
        let pool = Arc::new(BufferPool::new(
            pool_id,
            &slot.layout,
            slot.mode.pool_size(),
            policy,
        )?);
        slot.pool = Some(pool.clone());
        self.next_pool_id += 1;
        Ok(pool)
    }

    /// Start the background thread of an asynchronous channel if needed.
    fn ensure_worker(&mut self, tag: ChannelTag) -> Result<()> {
        let pool = self.ensure_pool(tag)?;
        let slot = self.slot_mut(tag)?;
        if !slot.mode.is_async() || !matches!(slot.link, Link::Local(_)) {
            return Ok(());
        }
        let Link::Local(channel) = std::mem::replace(&mut slot.link, Link::Detached) else {
            return Ok(());
        };
        if channel.is_failed() {
            slot.link = Link::Local(channel);
            return Err(RuntimeError::WorkerTerminated {
                tag,
                reason: "channel failed earlier".to_string(),
            });
        }
        let handle = match slot.direction {
            Direction::Input => worker::spawn_reader(channel, pool, slot.ready_tx.clone())?,
            Direction::Output => worker::spawn_writer(channel, pool, slot.ready_rx.clone())?,
        };
        slot.link = Link::Worker(handle);
        Ok(())
    }

    /// Join a worker that exited on its own and turn that into an error.
    fn reap_worker(&mut self, tag: ChannelTag) -> RuntimeError {
        let slot = match self.slot_mut(tag) {
            Ok(slot) => slot,
            Err(e) => return e,
        };
        let Link::Worker(handle) = std::mem::replace(&mut slot.link, Link::Detached) else {
            return RuntimeError::InvalidState(format!("channel {} has no worker", tag));
        };
        match handle.reap() {
            Ok(mut channel) => {
                let reason = channel
                    .take_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "worker exited".to_string());
                slot.final_stats = Some(channel.stats().clone());
                slot.link = Link::Local(channel);
                tracing::error!("Worker for channel {} terminated: {}", tag, reason);
                RuntimeError::WorkerTerminated { tag, reason }
            }
            Err(e) => e,
        }
    }

    fn expect_direction(slot: &ChannelSlot, tag: ChannelTag, direction: Direction) -> Result<()> {
        if slot.direction != direction {
            return Err(RuntimeError::InvalidState(format!(
                "channel {} is an {:?} channel",
                tag, slot.direction
            )));
        }
        Ok(())
    }

    fn channel_error(channel: &mut Channel) -> RuntimeError {
        channel
            .take_error()
            .unwrap_or_else(|| RuntimeError::transport(format!("channel {} failed", channel.tag())))
    }

    /// Read one message into `entry` inline on the calling thread.
    fn read_inline(channel: &mut Channel, entry: &mut PoolEntry, blocking: bool) -> Result<bool> {
        channel.swap_destination(entry.buffer_for_io())?;
        let mut status = if blocking {
            channel.read()
        } else {
            channel.read_nonblocking()
        };
        if status == ChannelStatus::Busy && !channel.cancel_read() {
            // Bytes of this message already arrived; complete it.
            status = channel.wait_for_read();
        }
        let restored = channel.swap_destination(entry.buffer_for_io());
        match status {
            ChannelStatus::Finished => restored.map(|_| true),
            ChannelStatus::Busy => restored.map(|_| false),
            ChannelStatus::Error => Err(Self::channel_error(channel)),
        }
    }

    /// Next complete input Buffer, blocking until one is available.
    ///
    /// Synchronous channels perform the read right here.
    pub fn get_read_locked_buffer(&mut self, tag: ChannelTag) -> Result<PoolEntry> {
        match self.acquire_read(tag, true)? {
            Some(entry) => Ok(entry),
            None => Err(RuntimeError::InvalidState(format!(
                "channel {}: blocking read returned no data",
                tag
            ))),
        }
    }

    /// Next complete input Buffer if one is available right now.
    pub fn try_get_read_locked_buffer(&mut self, tag: ChannelTag) -> Result<Option<PoolEntry>> {
        self.acquire_read(tag, false)
    }

    fn acquire_read(&mut self, tag: ChannelTag, blocking: bool) -> Result<Option<PoolEntry>> {
        {
            let slot = self.slot_mut(tag)?;
            Self::expect_direction(slot, tag, Direction::Input)?;
            if let Ok(entry) = slot.ready_rx.try_recv() {
                slot.checked_out += 1;
                slot.started = true;
                return Ok(Some(entry));
            }
        }
        self.ensure_worker(tag)?;
        let pool = self.ensure_pool(tag)?;

        let slot = self.slot_mut(tag)?;
        slot.started = true;
        let entry = match &mut slot.link {
            Link::Local(channel) => {
                if channel.is_failed() {
                    return Err(RuntimeError::InvalidState(format!(
                        "channel {} failed earlier and must be recreated",
                        tag
                    )));
                }
                let mut entry = pool
                    .try_acquire()
                    .ok_or(RuntimeError::PoolExhausted(tag))?;
                match Self::read_inline(channel, &mut entry, blocking) {
                    Ok(true) => {
                        entry.mark(LockState::ReadLocked);
                        Some(entry)
                    }
                    Ok(false) => {
                        pool.release(entry);
                        None
                    }
                    Err(e) => {
                        pool.release(entry);
                        tracing::error!("Synchronous read on channel {} failed: {}", tag, e);
                        return Err(e);
                    }
                }
            }
            Link::Worker(handle) => {
                if blocking {
                    select! {
                        recv(slot.ready_rx) -> entry => entry.ok(),
                        recv(handle.done()) -> _ => slot.ready_rx.try_recv().ok(),
                    }
                } else {
                    slot.ready_rx.try_recv().ok()
                }
            }
            Link::Detached => {
                return Err(RuntimeError::InvalidState(format!(
                    "channel {} is detached",
                    tag
                )))
            }
        };

        match entry {
            Some(entry) => {
                slot.checked_out += 1;
                Ok(Some(entry))
            }
            None => {
                let exited = matches!(&slot.link, Link::Worker(handle) if handle.has_exited());
                if exited {
                    Err(self.reap_worker(tag))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// A free output Buffer to fill.
    ///
    /// Blocks on asynchronous channels until the writer returns one; fails
    /// with `PoolExhausted` on synchronous channels whose only Buffer is held.
    pub fn get_write_locked_buffer(&mut self, tag: ChannelTag) -> Result<PoolEntry> {
        {
            let slot = self.slot_mut(tag)?;
            Self::expect_direction(slot, tag, Direction::Output)?;
        }
        self.ensure_worker(tag)?;
        let pool = self.ensure_pool(tag)?;
        let slot = self.slot_mut(tag)?;
        slot.started = true;

        let entry = match &slot.link {
            Link::Worker(handle) => {
                select! {
                    recv(pool.free_queue()) -> entry => entry.ok(),
                    recv(handle.done()) -> _ => None,
                }
            }
            _ => pool.try_acquire(),
        };
        match entry {
            Some(mut entry) => {
                entry.mark(LockState::WriteLocked);
                slot.checked_out += 1;
                Ok(entry)
            }
            None if matches!(slot.link, Link::Worker(_)) => Err(self.reap_worker(tag)),
            None => Err(RuntimeError::PoolExhausted(tag)),
        }
    }

    /// Give an entry back.
    ///
    /// On an input channel the Buffer returns to the free queue. On an output
    /// channel its contents are sent: inline when synchronous, by the writer
    /// thread when asynchronous.
    pub fn release(&mut self, tag: ChannelTag, entry: PoolEntry) -> Result<()> {
        let direction = {
            let slot = self.slot_mut(tag)?;
            slot.checked_out = slot.checked_out.saturating_sub(1);
            slot.direction
        };
        match direction {
            Direction::Input => {
                let slot = self.slot_mut(tag)?;
                if let Some(pool) = &slot.pool {
                    pool.release(entry);
                }
                Ok(())
            }
            Direction::Output => self.publish(tag, entry),
        }
    }

    /// Send a read-locked or write-locked entry out through an output channel.
    fn publish(&mut self, tag: ChannelTag, mut entry: PoolEntry) -> Result<()> {
        self.ensure_worker(tag)?;
        let pool = self.ensure_pool(tag)?;
        let slot = self.slot_mut(tag)?;
        entry.mark(LockState::ReadLocked);
        match &mut slot.link {
            Link::Local(channel) => {
                if channel.is_failed() {
                    pool.release(entry);
                    return Err(RuntimeError::InvalidState(format!(
                        "channel {} failed earlier and must be recreated",
                        tag
                    )));
                }
                channel.swap_source(entry.buffer_for_io())?;
                let status = channel.write();
                let restored = channel.swap_source(entry.buffer_for_io());
                pool.release(entry);
                if status == ChannelStatus::Error {
                    let err = Self::channel_error(channel);
                    tracing::error!("Synchronous write on channel {} failed: {}", tag, err);
                    return Err(err);
                }
                restored
            }
            Link::Worker(handle) => {
                if handle.has_exited() {
                    pool.release(entry);
                    return Err(self.reap_worker(tag));
                }
                slot.ready_tx
                    .send(entry)
                    .map_err(|_| RuntimeError::WorkerTerminated {
                        tag,
                        reason: "ready queue closed".to_string(),
                    })
            }
            Link::Detached => Err(RuntimeError::InvalidState(format!(
                "channel {} is detached",
                tag
            ))),
        }
    }

    /// Pass an input entry straight to an output channel drawing from the same
    /// pool. The entry is freed once it has been sent.
    pub fn forward(&mut self, from: ChannelTag, entry: PoolEntry, to: ChannelTag) -> Result<()> {
        {
            let to_slot = self.slot_mut(to)?;
            Self::expect_direction(to_slot, to, Direction::Output)?;
            let same_pool = to_slot
                .pool
                .as_ref()
                .is_some_and(|pool| pool.id() == entry.pool_id());
            if !same_pool {
                return Err(RuntimeError::InvalidState(format!(
                    "channels {} and {} do not share a pool",
                    from, to
                )));
            }
        }
        let from_slot = self.slot_mut(from)?;
        Self::expect_direction(from_slot, from, Direction::Input)?;
        from_slot.checked_out = from_slot.checked_out.saturating_sub(1);
        self.publish(to, entry)
    }

    /// Let `output` draw its Buffers from the pool of `input`.
    ///
    /// Only legal before either channel has been used, and the layouts must match.
    pub fn share_pool(&mut self, input: ChannelTag, output: ChannelTag) -> Result<()> {
        {
            let (in_slot, out_slot) = (
                self.slots.get(&input),
                self.slots.get(&output),
            );
            let (Some(in_slot), Some(out_slot)) = (in_slot, out_slot) else {
                return Err(RuntimeError::InvalidState(format!(
                    "unknown channel {} or {}",
                    input, output
                )));
            };
            Self::expect_direction(in_slot, input, Direction::Input)?;
            Self::expect_direction(out_slot, output, Direction::Output)?;
            if in_slot.started || out_slot.started || out_slot.pool.is_some() {
                return Err(RuntimeError::InvalidState(format!(
                    "pool of {} can only be shared with {} before first use",
                    input, output
                )));
            }
            if !in_slot.layout.signature().compatible_with(&out_slot.layout.signature()) {
                return Err(RuntimeError::HandshakeMismatch(format!(
                    "cannot share pool: {} carries {}, {} carries {}",
                    input,
                    in_slot.layout.signature(),
                    output,
                    out_slot.layout.signature()
                )));
            }
        }
        let pool = self.ensure_pool(input)?;
        let in_slot = self.slot_mut(input)?;
        in_slot.shares_pool = true;
        let out_slot = self.slot_mut(output)?;
        out_slot.pool = Some(pool);
        out_slot.shares_pool = true;
        tracing::info!("Channel {} shares the buffer pool of {}", output, input);
        Ok(())
    }

    /// Switch a channel between synchronous and asynchronous I/O.
    pub fn set_mode(&mut self, tag: ChannelTag, mode: IoMode) -> Result<()> {
        if mode.pool_size() == 0 {
            return Err(RuntimeError::Config(format!(
                "channel {}: asynchronous pool size must be at least 1",
                tag
            )));
        }
        let slot = self.slot_mut(tag)?;
        if slot.mode == mode {
            return Ok(());
        }
        if slot.shares_pool {
            return Err(RuntimeError::InvalidState(format!(
                "channel {} shares its pool and cannot switch modes",
                tag
            )));
        }
        if slot.checked_out > 0 {
            return Err(RuntimeError::InvalidState(format!(
                "channel {}: {} buffer(s) still held by the stage",
                tag, slot.checked_out
            )));
        }

        if let Link::Worker(handle) = std::mem::replace(&mut slot.link, Link::Detached) {
            let mut channel = handle.stop()?;
            slot.final_stats = None;
            if channel.is_failed() {
                let reason = Self::channel_error(&mut channel).to_string();
                slot.link = Link::Local(channel);
                return Err(RuntimeError::WorkerTerminated { tag, reason });
            }
            slot.link = Link::Local(channel);
        }

        tracing::info!(
            "Channel {} switching from {:?} to {:?} ({} filled buffer(s) carried over)",
            tag,
            slot.mode,
            mode,
            slot.ready_rx.len()
        );
        // Ready entries from the old pool stay queued; releasing them later
        // drops them because their pool id no longer matches.
        slot.pool = None;
        slot.mode = mode;
        Ok(())
    }

    /// Stop a channel's worker (if any) and hand the channel back.
    pub fn close(&mut self, tag: ChannelTag) -> Result<Channel> {
        let slot = self
            .slots
            .remove(&tag)
            .ok_or_else(|| RuntimeError::InvalidState(format!("unknown channel {}", tag)))?;
        match slot.link {
            Link::Local(channel) => Ok(channel),
            Link::Worker(handle) => handle.stop(),
            Link::Detached => Err(RuntimeError::InvalidState(format!(
                "channel {} is detached",
                tag
            ))),
        }
    }

    /// Stop all workers, returning the first failure.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut first_error = None;
        for tag in self.channel_tags() {
            if let Err(e) = self.stop_worker(tag) {
                tracing::warn!("Channel {} did not stop cleanly: {}", tag, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_worker(&mut self, tag: ChannelTag) -> Result<()> {
        let slot = self.slot_mut(tag)?;
        if let Link::Worker(handle) = std::mem::replace(&mut slot.link, Link::Detached) {
            let channel = handle.stop()?;
            slot.final_stats = Some(channel.stats().clone());
            slot.link = Link::Local(channel);
        }
        Ok(())
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
