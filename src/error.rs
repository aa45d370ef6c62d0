//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, used across the pipeline. Using
//! the `thiserror` crate, it provides a centralized, consistent way to handle the error
//! taxonomy the pipeline can hit: configuration problems caught at `init`, resource failures,
//! transport/protocol issues on the wire, buffer overflow conditions, and processor contract
//! violations.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: semantic errors in the configuration (bad MTU, mismatched channel
//!   masks/resolutions, non-power-of-two buffer sizes). Fails at `init`.
//! - **`Resource`**: memory-pin or socket bind/open failure. Fails at `init`.
//! - **`Transport`**: socket error or timeout. Recovered by terminating the affected stream.
//! - **`Protocol`**: the packet counter decreased — a monotonicity violation. Fatal for the
//!   offending stream.
//! - **`RangeFlattening`**: a consumer requested a wrapped range larger than the buffer's
//!   flattening slack. A programming error, surfaced to the caller.
//! - **`ProcessorContract`**: a processor returned a `need` counter greater than what was
//!   made available to it. Fatal for the scheduler.
//! - **`Io`**: wraps `std::io::Error` for socket and filesystem operations.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types directly,
//! simplifying error handling throughout the pipeline with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the pipeline's error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: packet counter decreased (expected {expected}, got {received})")]
    Protocol { expected: u64, received: u64 },

    #[error(
        "range-flattening overflow: range needs {requested} slack elements, buffer only has {available}"
    )]
    RangeFlattening { requested: usize, available: usize },

    #[error("processor returned need={need} greater than to_counter={to_counter}")]
    ProcessorContract { need: usize, to_counter: usize },
}
