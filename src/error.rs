//! Error handling for the corrflow runtime
//!
//! This module defines the runtime error taxonomy and a Result alias for use
//! throughout the crate.
//!
//! # Propagation
//!
//! Wiring mistakes (`NotInitialized`, `AlreadyAllocated`, `CapacityExceeded`,
//! `HandshakeMismatch`, `Config`) and `CollectiveFailure` are fatal: the
//! owning process logs them and exits through [`fatal`]. A `Transport` error on
//! a single channel is surfaced to the stage as a channel-state transition and
//! the stage decides what to do. Missing real-time samples are never errors;
//! they are reported as flag bits by the cyclic buffer.

use crate::channel::ChannelTag;
use thiserror::Error;

/// Exit status used when a fatal error terminates the process
pub const FATAL_EXIT_CODE: i32 = 1;

/// Main error type for runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A Buffer was used before `allocate()`
    #[error("Buffer '{0}' is not initialized")]
    NotInitialized(String),

    /// `allocate()` was called on an already allocated Buffer
    #[error("Buffer '{0}' is already allocated")]
    AlreadyAllocated(String),

    /// Resize beyond what the transport allows, or a full cyclic buffer
    /// with overwrite disallowed
    #[error("Capacity exceeded: requested {requested} bytes, capacity {capacity} bytes")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// Unknown field handle or element type mismatch
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// Any send/receive failure on a transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Shared-memory cookie validation failed, or source/destination buffers disagree
    #[error("Handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// The all-to-all primitive failed
    #[error("Collective failure: {0}")]
    CollectiveFailure(String),

    /// A background I/O thread exited
    #[error("Worker for channel {tag} terminated: {reason}")]
    WorkerTerminated { tag: ChannelTag, reason: String },

    /// No free pool entry is available for a synchronous operation
    #[error("Buffer pool exhausted for channel {0}")]
    PoolExhausted(ChannelTag),

    /// Operation not legal in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<RuntimeError>,
    },
}

impl RuntimeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        RuntimeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a transport error from anything displayable
    pub fn transport(message: impl std::fmt::Display) -> Self {
        RuntimeError::Transport(message.to_string())
    }

    /// Whether this error indicates a mis-wired pipeline or a broken collective
    pub fn is_fatal(&self) -> bool {
        match self {
            RuntimeError::NotInitialized(_)
            | RuntimeError::AlreadyAllocated(_)
            | RuntimeError::CapacityExceeded { .. }
            | RuntimeError::InvalidField(_)
            | RuntimeError::HandshakeMismatch(_)
            | RuntimeError::CollectiveFailure(_)
            | RuntimeError::Config(_) => true,
            RuntimeError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &RuntimeError {
        match self {
            RuntimeError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

/// Log an unrecoverable error and terminate the process.
///
/// There is no process-level restart; whatever supervises the node decides
/// what happens next.
pub fn fatal(err: &RuntimeError) -> ! {
    tracing::error!("Fatal runtime error, terminating: {}", err);
    std::process::exit(FATAL_EXIT_CODE)
}
