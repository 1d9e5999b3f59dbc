use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot cancellation flag shared between a request handler and the
/// generation pipeline working on its behalf.
///
/// Cancellation is cooperative: setting the flag never interrupts a phase that
/// is already running (model load, token generation). The pipeline consults
/// [`AbortSignal::is_set`] between phases and stops before starting the next
/// one, so a request signalled mid-phase may still complete.
#[derive(Debug, Default)]
pub struct AbortSignal {
    aborted: AtomicBool,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal as triggered. Calling it again has no further effect.
    pub fn set(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}
