//! Topology-aware all-to-all redistribution.
//!
//! - [`communicator`]: the [`Collective`] seam and an in-process implementation
//! - [`redistributor`]: exchange tables, slice addressing and the fenced
//!   data/metadata exchange
//! - [`rotation`]: the same redistribution expressed as pairwise phases

pub mod communicator;
pub mod redistributor;
pub mod rotation;

pub use communicator::{Collective, LocalCommunicator};
pub use redistributor::{
    CollectiveRedistributor, ExchangeTable, StreamMetadata, TransposeLayout, TransposePlan,
    MAX_FLAG_RANGES, METADATA_RECORD_LEN,
};
pub use rotation::{HalfAction, RotationSchedule, Transfer};
