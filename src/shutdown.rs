use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide "stop" request, handed explicitly to every component.
///
/// Set once (by the acceptor when it observes an interrupt, or directly by
/// the coordinator) and read by the acceptor, the client queue and the
/// worker registry. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` only for the call that flipped the flag.
    pub fn trigger(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
