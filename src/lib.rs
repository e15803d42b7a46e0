//! # corrflow: streaming runtime for a distributed correlator
//!
//! The plumbing a correlator pipeline stands on: typed sample buffers,
//! channels that carry them over interchangeable transports, a per-channel
//! choice between inline and background I/O, a time-indexed ring between the
//! network and the first stage, and the torus-aware all-to-all transpose that
//! moves station-major data to subband-major.
//!
//! ## Architecture
//!
//! - **Buffers** ([`buffer`]): named, versioned records whose storage is their wire image
//! - **Transports** ([`transport`]): loopback, shared memory, TCP socket and file replay
//!   behind one [`TransportOps`](transport::TransportOps) interface
//! - **Channels** ([`channel`]): framing, sequence tagging and blocking/non-blocking
//!   read/write state machines
//! - **Concurrency** ([`concurrency`]): buffer pools and reader/writer threads,
//!   switchable per channel at run time
//! - **Cyclic buffer** ([`cyclic`]): absolute-time sample ring with loss flags
//! - **Topology** ([`topology`]) and **transpose** ([`transpose`]): node placement on
//!   a 4-D torus and the collective redistribution between groups
//! - **Driver** ([`driver`]): lockstep stage scheduling
//!
//! ## Example
//!
//! ```ignore
//! use corrflow::{
//!     buffer::{Buffer, ElementType},
//!     concurrency::{ConcurrencyManager, Direction, IoMode},
//!     driver::SchedulerState,
//!     transport::LoopbackTransport,
//! };
//!
//! let state = SchedulerState::new();
//! let mut channels = ConcurrencyManager::new(state.tags());
//!
//! let mut layout = Buffer::new("beamlets", 0x11, 1);
//! let samples = layout.add_field("samples", ElementType::I16, 256)?;
//!
//! let (tx, rx) = LoopbackTransport::pair();
//! let out = channels.open(layout.clone_layout(), layout.clone_layout(), tx.into(),
//!     Direction::Output, IoMode::Asynchronous { pool_size: 4 })?;
//! let inp = channels.open(layout.clone_layout(), layout.clone_layout(), rx.into(),
//!     Direction::Input, IoMode::Synchronous)?;
//!
//! let mut entry = channels.get_write_locked_buffer(out)?;
//! entry.buffer_mut().unwrap().write_field(samples, &[1i16; 256])?;
//! channels.release(out, entry)?;
//!
//! let entry = channels.get_read_locked_buffer(inp)?;
//! assert_eq!(entry.buffer().read_field::<i16>(samples)?[0], 1);
//! channels.release(inp, entry)?;
//! ```

pub mod buffer;
pub mod channel;
pub mod concurrency;
pub mod config;
pub mod cyclic;
pub mod driver;
pub mod error;
pub mod topology;
pub mod transport;
pub mod transpose;

// Re-export commonly used types
pub use buffer::{AllocationPolicy, Buffer, ElementType, FieldHandle};
pub use channel::{Channel, ChannelStatus, ChannelTag};
pub use concurrency::{ConcurrencyManager, Direction, IoMode, PoolEntry};
pub use config::RuntimeConfig;
pub use cyclic::{CyclicSampleBuffer, SampleFlags};
pub use driver::{SchedulerState, Stage, StageDriver};
pub use error::{Result, RuntimeError};
pub use topology::{Coordinate, TopologyMapper, TorusDims};
pub use transport::{Transport, TransportOps};
pub use transpose::{CollectiveRedistributor, RotationSchedule, TransposePlan};
