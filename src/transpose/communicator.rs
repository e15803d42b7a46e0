//! Collective exchange primitive.
//!
//! [`Collective`] is the one seam the redistributor needs from the cluster:
//! a barrier and a variable-count all-to-all. [`LocalCommunicator`] implements
//! it for a group of participants inside one process (one thread each), which
//! is what the demo and the tests run on.

use crate::error::{Result, RuntimeError};
use crate::transpose::redistributor::ExchangeTable;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Barrier};

/// Cluster-wide rendezvous and all-to-all exchange.
#[cfg_attr(test, mockall::automock)]
pub trait Collective: Send {
    /// Number of participants.
    fn size(&self) -> usize;

    /// Index of this participant in `[0, size)`.
    fn index(&self) -> usize;

    /// Block until every participant has called `barrier`.
    fn barrier(&mut self) -> Result<()>;

    /// Send `send[offsets[p]..][..counts[p]]` to every participant `p` and
    /// receive participant `p`'s slice into `recv` at `recv_table.offsets[p]`.
    ///
    /// Every participant must call this with tables of length `size()`.
    fn all_to_all_v(
        &mut self,
        send: &[u8],
        send_table: &ExchangeTable,
        recv: &mut [u8],
        recv_table: &ExchangeTable,
    ) -> Result<()>;
}

struct Slice {
    epoch: u64,
    from: usize,
    bytes: Vec<u8>,
}

/// In-process participant of a collective group.
pub struct LocalCommunicator {
    index: usize,
    peers: Vec<Sender<Slice>>,
    inbox: Receiver<Slice>,
    /// Slices of a later exchange that arrived early
    stash: Vec<Slice>,
    barrier: Arc<Barrier>,
    epoch: u64,
}

impl LocalCommunicator {
    /// Create `size` connected participants; hand one to each thread.
    pub fn group(size: usize) -> Vec<LocalCommunicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let barrier = Arc::new(Barrier::new(size.max(1)));
        receivers
            .into_iter()
            .enumerate()
            .map(|(index, inbox)| LocalCommunicator {
                index,
                peers: senders.clone(),
                inbox,
                stash: Vec::new(),
                barrier: barrier.clone(),
                epoch: 0,
            })
            .collect()
    }

    fn check_table(&self, name: &str, table: &ExchangeTable, buffer_len: usize) -> Result<()> {
        if table.len() != self.peers.len() {
            return Err(RuntimeError::CollectiveFailure(format!(
                "participant {}: {} table has {} slots for {} participants",
                self.index,
                name,
                table.len(),
                self.peers.len()
            )));
        }
        if let Some(slot) = (0..table.len()).find(|&p| table.slot(p).end > buffer_len) {
            return Err(RuntimeError::CollectiveFailure(format!(
                "participant {}: {} slot {} ({:?}) exceeds buffer of {} bytes",
                self.index,
                name,
                slot,
                table.slot(slot),
                buffer_len
            )));
        }
        Ok(())
    }

    fn next_slice(&mut self) -> Result<Slice> {
        if let Some(pos) = self.stash.iter().position(|s| s.epoch == self.epoch) {
            return Ok(self.stash.swap_remove(pos));
        }
        loop {
            let slice = self.inbox.recv().map_err(|_| {
                RuntimeError::CollectiveFailure(format!(
                    "participant {}: inbox closed",
                    self.index
                ))
            })?;
            if slice.epoch == self.epoch {
                return Ok(slice);
            }
            self.stash.push(slice);
        }
    }
}

impl Collective for LocalCommunicator {
    fn size(&self) -> usize {
        self.peers.len()
    }

    fn index(&self) -> usize {
        self.index
    }

    fn barrier(&mut self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }

    fn all_to_all_v(
        &mut self,
        send: &[u8],
        send_table: &ExchangeTable,
        recv: &mut [u8],
        recv_table: &ExchangeTable,
    ) -> Result<()> {
        self.check_table("send", send_table, send.len())?;
        self.check_table("receive", recv_table, recv.len())?;
        self.epoch += 1;

        for (peer, tx) in self.peers.iter().enumerate() {
            let bytes = send[send_table.slot(peer)].to_vec();
            tx.send(Slice {
                epoch: self.epoch,
                from: self.index,
                bytes,
            })
            .map_err(|_| {
                RuntimeError::CollectiveFailure(format!(
                    "participant {}: peer {} is gone",
                    self.index, peer
                ))
            })?;
        }

        for _ in 0..self.peers.len() {
            let slice = self.next_slice()?;
            let slot = recv_table.slot(slice.from);
            if slot.len() != slice.bytes.len() {
                return Err(RuntimeError::CollectiveFailure(format!(
                    "participant {}: peer {} sent {} bytes, expected {}",
                    self.index,
                    slice.from,
                    slice.bytes.len(),
                    slot.len()
                )));
            }
            recv[slot].copy_from_slice(&slice.bytes);
        }
        Ok(())
    }
}
