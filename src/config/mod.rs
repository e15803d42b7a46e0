//! Runtime configuration for the corrflow binary
//!
//! The core types take plain values at construction time; this module only
//! exists so the demo binary can be driven from a TOML file.
//!
//! # Example
//!
//! ```toml
//! [buffer]
//! capacity = 16384
//! allow_overwrite = true
//! substreams = 4
//! window = 4096
//!
//! [topology]
//! x = 4
//! y = 4
//! z = 4
//! t = 2
//!
//! [channels]
//! mode = "asynchronous"
//! pool_size = 4
//! transport = "loopback"
//!
//! [driver]
//! cycles = 32
//! cycle_period_ms = 0
//! ```

use crate::concurrency::IoMode;
use crate::error::{Result, RuntimeError};
use crate::topology::TorusDims;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default cyclic buffer capacity in samples
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Default samples per cycle
pub const DEFAULT_WINDOW: usize = 4 * 1024;

/// Default tracing filter
pub const DEFAULT_LOG_FILTER: &str = "info,corrflow=debug";

/// Cyclic input buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    /// Samples of history kept per substream
    pub capacity: usize,
    /// Evict the oldest samples when full instead of making the producer wait
    pub allow_overwrite: bool,
    /// Number of substreams (subbands/beamlets)
    pub substreams: usize,
    /// Samples consumed per cycle
    pub window: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            allow_overwrite: true,
            substreams: 4,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Station and subband placement for the transpose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransposeSection {
    /// Group holding each station's input
    pub station_groups: Vec<usize>,
    /// Group correlating each subband
    pub subband_groups: Vec<usize>,
    /// Bytes per (station, subband) slice
    pub slice_bytes: usize,
}

impl Default for TransposeSection {
    fn default() -> Self {
        Self {
            station_groups: vec![0, 0, 1, 1],
            subband_groups: vec![0, 1, 0, 1],
            slice_bytes: 64,
        }
    }
}

/// Scheduling of the demo's stage-to-stage channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModeChoice {
    #[default]
    Synchronous,
    Asynchronous,
}

/// Backend of the demo's stage-to-stage channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportChoice {
    #[default]
    Loopback,
    SharedMemory,
    Socket,
    /// Record the stream to `replay_file`
    Record,
    /// Read the stream back from `replay_file`
    Replay,
}

/// Channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsSection {
    pub mode: ModeChoice,
    /// Buffers per asynchronous channel
    pub pool_size: usize,
    pub transport: TransportChoice,
    /// Segment size for the shared-memory transport
    pub shm_capacity: usize,
    /// File used by the record/replay transports
    pub replay_file: Option<PathBuf>,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            mode: ModeChoice::Synchronous,
            pool_size: 4,
            transport: TransportChoice::Loopback,
            shm_capacity: 1 << 20,
            replay_file: None,
        }
    }
}

impl ChannelsSection {
    pub fn io_mode(&self) -> IoMode {
        match self.mode {
            ModeChoice::Synchronous => IoMode::Synchronous,
            ModeChoice::Asynchronous => IoMode::Asynchronous {
                pool_size: self.pool_size,
            },
        }
    }
}

/// Stage driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub cycles: u64,
    /// Minimum cycle length; 0 runs as fast as possible
    pub cycle_period_ms: u64,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            cycles: 32,
            cycle_period_ms: 0,
        }
    }
}

/// Synthetic antenna feed settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSection {
    /// Drop every n-th packet (0 = lossless)
    pub loss_every: u64,
    /// Samples per packet
    pub packet_samples: usize,
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            loss_every: 7,
            packet_samples: 256,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Write a daily rolling log file here as well
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub buffer: BufferSection,
    pub topology: TorusDims,
    pub transpose: TransposeSection,
    pub channels: ChannelsSection,
    pub driver: DriverSection,
    pub input: InputSection,
    pub logging: LoggingSection,
}

impl RuntimeConfig {
    /// Parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config: RuntimeConfig = toml::from_str(&content)
            .map_err(|e| RuntimeError::Config(format!("Failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject settings the runtime cannot be built from
    pub fn validate(&self) -> Result<()> {
        let b = &self.buffer;
        if b.capacity == 0 || b.substreams == 0 {
            return Err(RuntimeError::Config(
                "buffer.capacity and buffer.substreams must be positive".to_string(),
            ));
        }
        if b.window == 0 || b.window > b.capacity {
            return Err(RuntimeError::Config(format!(
                "buffer.window must be in 1..={} (got {})",
                b.capacity, b.window
            )));
        }
        self.topology.validate()?;
        if self.channels.mode == ModeChoice::Asynchronous && self.channels.pool_size == 0 {
            return Err(RuntimeError::Config(
                "channels.pool_size must be at least 1 in asynchronous mode".to_string(),
            ));
        }
        if self.channels.transport == TransportChoice::Socket
            && self.channels.mode == ModeChoice::Synchronous
        {
            // Writer and reader share one thread; a window larger than the
            // socket buffer would never drain.
            return Err(RuntimeError::Config(
                "channels.transport = \"socket\" requires mode = \"asynchronous\"".to_string(),
            ));
        }
        if matches!(
            self.channels.transport,
            TransportChoice::Record | TransportChoice::Replay
        ) && self.channels.replay_file.is_none()
        {
            return Err(RuntimeError::Config(
                "channels.replay_file is required for record/replay".to_string(),
            ));
        }
        if self.input.packet_samples == 0 {
            return Err(RuntimeError::Config(
                "input.packet_samples must be positive".to_string(),
            ));
        }
        let t = &self.transpose;
        if t.station_groups.is_empty() || t.subband_groups.is_empty() {
            return Err(RuntimeError::Config(
                "transpose needs at least one station and one subband".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective configuration as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RuntimeError::Config(format!("Failed to serialize config: {}", e)))
    }
}
