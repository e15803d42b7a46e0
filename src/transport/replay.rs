//! File-backed transport: record a live stream, replay it deterministically.
//!
//! The file holds the raw concatenation of sent messages, exactly what a
//! socket would have carried, so replayed data goes through the same framing
//! as live data.

use crate::buffer::AllocationPolicy;
use crate::error::{Result, RuntimeError};
use crate::transport::{IoProgress, TransportKind, TransportOps};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

enum ReplayMode {
    Record(BufWriter<File>),
    Replay(BufReader<File>),
}

/// Record-or-replay endpoint bound to one file.
pub struct ReplayTransport {
    mode: ReplayMode,
    path: PathBuf,
    messages: u64,
}

impl ReplayTransport {
    /// Create (truncate) `path` and append every sent message to it.
    pub fn record(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        tracing::info!("Recording transport stream to {:?}", path);
        Ok(Self {
            mode: ReplayMode::Record(BufWriter::new(file)),
            path,
            messages: 0,
        })
    }

    /// Serve receives from a previously recorded file.
    pub fn replay(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        tracing::info!("Replaying transport stream from {:?}", path);
        Ok(Self {
            mode: ReplayMode::Replay(BufReader::new(file)),
            path,
            messages: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.mode, ReplayMode::Record(_))
    }

    /// Number of send or receive calls completed.
    pub fn messages(&self) -> u64 {
        self.messages
    }
}

impl TransportOps for ReplayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Replay
    }

    fn send_blocking(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.mode {
            ReplayMode::Record(writer) => {
                writer.write_all(bytes)?;
                writer.flush()?;
                self.messages += 1;
                Ok(())
            }
            ReplayMode::Replay(_) => Err(RuntimeError::InvalidState(format!(
                "{:?} is open for replay",
                self.path
            ))),
        }
    }

    fn send_nonblocking(&mut self, bytes: &[u8]) -> Result<IoProgress> {
        self.send_blocking(bytes).map(|_| IoProgress::Complete)
    }

    fn wait_for_sent(&mut self) -> Result<()> {
        Ok(())
    }

    fn recv_blocking(&mut self, buf: &mut [u8]) -> Result<()> {
        match &mut self.mode {
            ReplayMode::Replay(reader) => {
                reader.read_exact(buf).map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        RuntimeError::transport(format!("end of replay file {:?}", self.path))
                    } else {
                        RuntimeError::Io(e)
                    }
                })?;
                self.messages += 1;
                Ok(())
            }
            ReplayMode::Record(_) => Err(RuntimeError::InvalidState(format!(
                "{:?} is open for recording",
                self.path
            ))),
        }
    }

    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> Result<IoProgress> {
        self.recv_blocking(buf).map(|_| IoProgress::Complete)
    }

    fn wait_for_received(&mut self, _buf: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn recv_progress(&self) -> usize {
        0
    }

    fn allocation_policy(&self) -> AllocationPolicy {
        AllocationPolicy::heap()
    }

    fn describe(&self) -> String {
        format!("replay({})", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");

        let mut recorder = ReplayTransport::record(&path).unwrap();
        recorder.send_blocking(&[1, 2, 3]).unwrap();
        recorder.send_blocking(&[4, 5]).unwrap();
        assert_eq!(recorder.messages(), 2);
        drop(recorder);

        let mut player = ReplayTransport::replay(&path).unwrap();
        let mut buf = [0u8; 5];
        player.recv_blocking(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);

        let mut more = [0u8; 1];
        assert!(matches!(
            player.recv_blocking(&mut more),
            Err(RuntimeError::Transport(_))
        ));
    }

    #[test]
    fn test_wrong_direction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let mut recorder = ReplayTransport::record(&path).unwrap();
        let mut buf = [0u8; 1];
        assert!(recorder.recv_blocking(&mut buf).is_err());

        let mut player = ReplayTransport::replay(&path).unwrap();
        assert!(player.send_blocking(&[1]).is_err());
    }
}
