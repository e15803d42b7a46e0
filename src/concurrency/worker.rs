//! Background I/O threads for asynchronous channels.
//!
//! # Architecture
//!
//! ```text
//!   reader:  free queue ──> [channel.read into entry] ──> ready queue ──> pipeline
//!   writer:  pipeline ──> ready queue ──> [channel.write from entry] ──> free queue
//! ```
//!
//! Each worker owns its [`Channel`] while it runs and hands it back from the
//! thread when it exits, so a mode switch can continue on the same link.
//! Exit is observable without joining: the worker holds the only sender of a
//! `done` queue, which disconnects when the thread returns.

use crate::channel::{Channel, ChannelStatus, ChannelTag};
use crate::concurrency::pool::{BufferPool, LockState, PoolEntry};
use crate::error::{Result, RuntimeError};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use crossbeam_utils::Backoff;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sleep between polls once spinning has given up
const IDLE_POLL: Duration = Duration::from_micros(200);

/// Which way a worker moves data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Reader,
    Writer,
}

/// Handle to a running reader or writer thread.
pub struct WorkerHandle {
    tag: ChannelTag,
    kind: WorkerKind,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    join: Option<JoinHandle<Channel>>,
}

impl WorkerHandle {
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Queue that disconnects when the thread exits, for `select!`.
    pub(crate) fn done(&self) -> &Receiver<()> {
        &self.done_rx
    }

    /// Whether the thread has returned.
    pub fn has_exited(&self) -> bool {
        matches!(self.done_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Ask the thread to stop and wait for it, recovering the channel.
    pub fn stop(mut self) -> Result<Channel> {
        self.stop_tx.take();
        self.join_inner()
    }

    /// Wait for a thread that already exited on its own.
    pub fn reap(mut self) -> Result<Channel> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<Channel> {
        let handle = self.join.take().ok_or_else(|| RuntimeError::WorkerTerminated {
            tag: self.tag,
            reason: "already joined".to_string(),
        })?;
        handle.join().map_err(|_| RuntimeError::WorkerTerminated {
            tag: self.tag,
            reason: "worker panicked".to_string(),
        })
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

/// Spawn a reader that fills free entries of `pool` from `channel`.
pub fn spawn_reader(
    channel: Channel,
    pool: Arc<BufferPool>,
    ready_tx: Sender<PoolEntry>,
) -> Result<WorkerHandle> {
    let tag = channel.tag();
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (done_tx, done_rx) = bounded::<()>(0);
    let join = thread::Builder::new()
        .name(format!("corrflow-reader-{}", tag.0))
        .spawn(move || {
            let _done = done_tx;
            let mut reader = Reader {
                channel,
                pool,
                ready_tx,
                stop_rx,
            };
            reader.run();
            reader.channel
        })?;
    Ok(WorkerHandle {
        tag,
        kind: WorkerKind::Reader,
        stop_tx: Some(stop_tx),
        done_rx,
        join: Some(join),
    })
}

/// Spawn a writer that drains `ready_rx` into `channel`.
pub fn spawn_writer(
    channel: Channel,
    pool: Arc<BufferPool>,
    ready_rx: Receiver<PoolEntry>,
) -> Result<WorkerHandle> {
    let tag = channel.tag();
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (done_tx, done_rx) = bounded::<()>(0);
    let join = thread::Builder::new()
        .name(format!("corrflow-writer-{}", tag.0))
        .spawn(move || {
            let _done = done_tx;
            let mut writer = Writer {
                channel,
                pool,
                ready_rx,
                stop_rx,
            };
            writer.run();
            writer.channel
        })?;
    Ok(WorkerHandle {
        tag,
        kind: WorkerKind::Writer,
        stop_tx: Some(stop_tx),
        done_rx,
        join: Some(join),
    })
}

struct Reader {
    channel: Channel,
    pool: Arc<BufferPool>,
    ready_tx: Sender<PoolEntry>,
    stop_rx: Receiver<()>,
}

enum ReadOutcome {
    Filled,
    Stopped,
    Failed,
}

impl Reader {
    fn run(&mut self) {
        let tag = self.channel.tag();
        tracing::info!("Reader thread for channel {} started", tag);

        loop {
            let free = self.pool.free_queue().clone();
            let mut entry = select! {
                recv(self.stop_rx) -> _ => break,
                recv(free) -> entry => match entry {
                    Ok(entry) => entry,
                    Err(_) => break,
                },
            };
            entry.mark(LockState::WriteLocked);

            if self.channel.swap_destination(entry.buffer_for_io()).is_err() {
                self.pool.release(entry);
                break;
            }
            let outcome = self.fill();
            // Cannot fail: no read is in flight after `fill` returns.
            let _ = self.channel.swap_destination(entry.buffer_for_io());

            match outcome {
                ReadOutcome::Filled => {
                    entry.mark(LockState::ReadLocked);
                    if self.ready_tx.send(entry).is_err() {
                        break;
                    }
                }
                ReadOutcome::Stopped => {
                    self.pool.release(entry);
                    break;
                }
                ReadOutcome::Failed => {
                    self.pool.release(entry);
                    tracing::error!(
                        "Reader thread for channel {} terminating: {}",
                        tag,
                        self.channel
                            .last_error()
                            .map(|e| e.to_string())
                            .unwrap_or_default()
                    );
                    return;
                }
            }
        }

        tracing::info!("Reader thread for channel {} stopped", tag);
    }

    /// Poll the channel until one message lands, the thread is stopped while
    /// nothing has arrived, or the channel fails.
    fn fill(&mut self) -> ReadOutcome {
        let backoff = Backoff::new();
        loop {
            match self.channel.read_nonblocking() {
                ChannelStatus::Finished => return ReadOutcome::Filled,
                ChannelStatus::Error => return ReadOutcome::Failed,
                ChannelStatus::Busy => {}
            }
            if stop_requested(&self.stop_rx) {
                if self.channel.cancel_read() {
                    return ReadOutcome::Stopped;
                }
                // Part of a message already arrived; finish it so nothing is lost.
                return match self.channel.wait_for_read() {
                    ChannelStatus::Finished => ReadOutcome::Filled,
                    _ => ReadOutcome::Failed,
                };
            }
            if backoff.is_completed() {
                thread::sleep(IDLE_POLL);
            } else {
                backoff.snooze();
            }
        }
    }
}

struct Writer {
    channel: Channel,
    pool: Arc<BufferPool>,
    ready_rx: Receiver<PoolEntry>,
    stop_rx: Receiver<()>,
}

impl Writer {
    fn run(&mut self) {
        let tag = self.channel.tag();
        tracing::info!("Writer thread for channel {} started", tag);

        loop {
            let entry = select! {
                recv(self.stop_rx) -> _ => break,
                recv(self.ready_rx) -> entry => match entry {
                    Ok(entry) => entry,
                    Err(_) => break,
                },
            };
            if !self.send(entry) {
                return;
            }
        }

        // Flush what the pipeline already handed over.
        while let Ok(entry) = self.ready_rx.try_recv() {
            if !self.send(entry) {
                return;
            }
        }
        tracing::info!("Writer thread for channel {} stopped", tag);
    }

    fn send(&mut self, mut entry: PoolEntry) -> bool {
        let tag = self.channel.tag();
        if self.channel.swap_source(entry.buffer_for_io()).is_err() {
            self.pool.release(entry);
            return false;
        }
        let status = self.channel.write();
        let _ = self.channel.swap_source(entry.buffer_for_io());
        self.pool.release(entry);
        if status == ChannelStatus::Error {
            tracing::error!(
                "Writer thread for channel {} terminating: {}",
                tag,
                self.channel
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            );
            return false;
        }
        true
    }
}
