//! Cooperative cancellation token shared by every pipeline worker.
//!
//! Every blocking point in the pipeline (socket `recv`, ring-buffer spin waits) is expected to
//! observe a [`StopToken`] rather than block unboundedly, the Rust equivalent of the
//! `std::stop_token` threaded through the reference implementation's receive loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheaply cloneable, cooperative stop signal.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    /// Create a fresh, unsignaled token.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal every clone of this token.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
