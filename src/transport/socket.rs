//! TCP socket transport for links between hosts.

use crate::buffer::AllocationPolicy;
use crate::error::{Result, RuntimeError};
use crate::transport::{IoProgress, TransportKind, TransportOps};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

/// One end of a TCP connection.
pub struct SocketTransport {
    stream: TcpStream,
    peer: SocketAddr,
    nonblocking: bool,
    /// Unsent tail of a non-blocking send
    pending_send: Option<Vec<u8>>,
    recv_progress: usize,
}

impl SocketTransport {
    /// Connect to a listening peer.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// Accept one connection from `listener`.
    pub fn accept(listener: &TcpListener) -> Result<Self> {
        let (stream, _) = listener.accept()?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        tracing::debug!("Socket transport connected to {}", peer);
        Ok(Self {
            stream,
            peer,
            nonblocking: false,
            pending_send: None,
            recv_progress: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn set_mode(&mut self, nonblocking: bool) -> Result<()> {
        if self.nonblocking != nonblocking {
            self.stream.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    /// Read into `buf[recv_progress..]` until full or the socket would block.
    fn fill(&mut self, buf: &mut [u8], blocking: bool) -> Result<IoProgress> {
        self.set_mode(!blocking)?;
        while self.recv_progress < buf.len() {
            match self.stream.read(&mut buf[self.recv_progress..]) {
                Ok(0) => {
                    return Err(RuntimeError::transport(format!(
                        "connection to {} closed",
                        self.peer
                    )))
                }
                Ok(n) => self.recv_progress += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(IoProgress::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(RuntimeError::transport(e)),
            }
        }
        self.recv_progress = 0;
        Ok(IoProgress::Complete)
    }
}

impl TransportOps for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn send_blocking(&mut self, bytes: &[u8]) -> Result<()> {
        self.wait_for_sent()?;
        self.set_mode(false)?;
        self.stream
            .write_all(bytes)
            .map_err(|e| RuntimeError::transport(format!("send to {}: {}", self.peer, e)))
    }

    fn send_nonblocking(&mut self, bytes: &[u8]) -> Result<IoProgress> {
        if self.pending_send.is_some() {
            return Err(RuntimeError::InvalidState(
                "previous non-blocking send still pending".to_string(),
            ));
        }
        self.set_mode(true)?;
        let mut sent = 0;
        while sent < bytes.len() {
            match self.stream.write(&bytes[sent..]) {
                Ok(0) => {
                    return Err(RuntimeError::transport(format!(
                        "connection to {} closed",
                        self.peer
                    )))
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.pending_send = Some(bytes[sent..].to_vec());
                    return Ok(IoProgress::Pending);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(RuntimeError::transport(e)),
            }
        }
        Ok(IoProgress::Complete)
    }

    fn wait_for_sent(&mut self) -> Result<()> {
        if let Some(rest) = self.pending_send.take() {
            self.set_mode(false)?;
            self.stream
                .write_all(&rest)
                .map_err(|e| RuntimeError::transport(format!("send to {}: {}", self.peer, e)))?;
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
        format!("tcp({})", self.peer)
    }
}
