//! In-process loopback transport.
//!
//! Messages travel as owned byte chunks over crossbeam channels; the receive
//! side treats the chunks as one byte stream so a header and its payload can
//! be read with separate calls.

use crate::buffer::AllocationPolicy;
use crate::error::{Result, RuntimeError};
use crate::transport::{IoProgress, TransportKind, TransportOps};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError, TrySendError};

/// One endpoint of an in-process link.
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    /// Chunk being consumed and how much of it is already used
    current: Option<(Vec<u8>, usize)>,
    recv_progress: usize,
    pending_send: Option<Vec<u8>>,
    label: String,
}

impl LoopbackTransport {
    fn from_parts(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>, label: String) -> Self {
        Self {
            tx,
            rx,
            current: None,
            recv_progress: 0,
            pending_send: None,
            label,
        }
    }

    /// A single endpoint that receives what it sends.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self::from_parts(tx, rx, "loopback(self)".to_string())
    }

    /// Two connected endpoints with unbounded queues.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (
            Self::from_parts(a_tx, a_rx, "loopback(a)".to_string()),
            Self::from_parts(b_tx, b_rx, "loopback(b)".to_string()),
        )
    }

    /// Two connected endpoints where at most `depth` messages may be in flight
    /// in each direction; a full queue makes senders wait.
    pub fn bounded_pair(depth: usize) -> (Self, Self) {
        let (a_tx, b_rx) = bounded(depth);
        let (b_tx, a_rx) = bounded(depth);
        (
            Self::from_parts(a_tx, a_rx, format!("loopback(a, depth={})", depth)),
            Self::from_parts(b_tx, b_rx, format!("loopback(b, depth={})", depth)),
        )
    }

    /// Number of complete messages waiting to be received.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Fill `buf[recv_progress..]` from the byte stream.
    fn fill(&mut self, buf: &mut [u8], blocking: bool) -> Result<IoProgress> {
        while self.recv_progress < buf.len() {
            if self.current.is_none() {
                let chunk = if blocking {
                    self.rx
                        .recv()
                        .map_err(|_| RuntimeError::transport("loopback peer closed"))?
                } else {
                    match self.rx.try_recv() {
                        Ok(chunk) => chunk,
                        Err(TryRecvError::Empty) => return Ok(IoProgress::Pending),
                        Err(TryRecvError::Disconnected) => {
                            return Err(RuntimeError::transport("loopback peer closed"))
                        }
                    }
                };
                self.current = Some((chunk, 0));
            }

            let Some((chunk, used)) = self.current.as_mut() else {
                continue;
            };
            let n = (chunk.len() - *used).min(buf.len() - self.recv_progress);
            buf[self.recv_progress..self.recv_progress + n].copy_from_slice(&chunk[*used..*used + n]);
            *used += n;
            self.recv_progress += n;
            if *used == chunk.len() {
                self.current = None;
            }
        }
        self.recv_progress = 0;
        Ok(IoProgress::Complete)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportOps for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn send_blocking(&mut self, bytes: &[u8]) -> Result<()> {
        self.wait_for_sent()?;
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| RuntimeError::transport("loopback peer closed"))
    }

    fn send_nonblocking(&mut self, bytes: &[u8]) -> Result<IoProgress> {
        if self.pending_send.is_some() {
            return Err(RuntimeError::InvalidState(
                "previous non-blocking send still pending".to_string(),
            ));
        }
        match self.tx.try_send(bytes.to_vec()) {
            Ok(()) => Ok(IoProgress::Complete),
            Err(TrySendError::Full(chunk)) => {
                self.pending_send = Some(chunk);
                Ok(IoProgress::Pending)
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(RuntimeError::transport("loopback peer closed"))
            }
        }
    }

    fn wait_for_sent(&mut self) -> Result<()> {
        if let Some(chunk) = self.pending_send.take() {
            self.tx
                .send(chunk)
                .map_err(|_| RuntimeError::transport("loopback peer closed"))?;
        }
        Ok(())
    }

    fn recv_blocking(&mut self, buf: &mut [u8]) -> Result<()> {
        self.fill(buf, true).map(|_| ())
    }

    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> Result<IoProgress> {
        self.fill(buf, false)
    }

    fn wait_for_received(&mut self, buf: &mut [u8]) -> Result<()> {
        self.fill(buf, true).map(|_| ())
    }

    fn recv_progress(&self) -> usize {
        self.recv_progress
    }

    fn allocation_policy(&self) -> AllocationPolicy {
        AllocationPolicy::heap()
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
