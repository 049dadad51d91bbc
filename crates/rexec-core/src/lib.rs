//! # rexec core
//!
//! Output sinks, byte pumps and error classification shared by the local and
//! remote executors.

#![warn(missing_docs)]

/// Output sinks and byte pumps
pub mod stream;

/// Error classification
pub mod error;

pub use stream::{
    pump, CaptureBuffer, CapturedOutput, ChunkCopier, OutputStreams, PollRead, SharedWriter,
    PUMP_BUFFER_SIZE,
};
pub use error::{FailurePolicy, Phase};
