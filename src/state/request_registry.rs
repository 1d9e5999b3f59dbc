//! Registry of in-flight chat requests and their abort signals.
//!
//! Every mutation goes through a single mutex, so register, unregister,
//! signal and signal_all never interleave partially. Entries only live while
//! the request is in flight; the registry drains naturally as requests finish.

use super::abort::AbortSignal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type RequestId = String;

/// Thread-safe map from request id to the abort signal of that request.
#[derive(Clone, Default)]
pub struct RequestRegistry {
    requests: Arc<Mutex<HashMap<RequestId, Arc<AbortSignal>>>>,
}

impl RequestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. A reused id silently replaces the previous entry.
    pub fn register(&self, request_id: RequestId, signal: Arc<AbortSignal>) {
        let previous = self.requests.lock().insert(request_id.clone(), signal);
        if previous.is_some() {
            warn!("REGISTRY: request id reused, replacing entry - request_id={request_id}");
        } else {
            debug!("REGISTRY: registered request - request_id={request_id}");
        }
    }

    /// Remove a request. Returns false when it was not registered.
    pub fn unregister(&self, request_id: &str) -> bool {
        let removed = self.requests.lock().remove(request_id).is_some();
        if removed {
            debug!("REGISTRY: unregistered request - request_id={request_id}");
        }
        removed
    }

    /// Set the abort signal of one request, if it is still registered.
    pub fn signal(&self, request_id: &str) -> bool {
        let requests = self.requests.lock();
        match requests.get(request_id) {
            Some(signal) => {
                signal.set();
                info!("REGISTRY: abort signalled - request_id={request_id}");
                true
            }
            None => false,
        }
    }

    /// Set the abort signal of every registered request and return how many
    /// were signalled.
    ///
    /// The mutex is held for the whole walk: requests registered before the
    /// call are always signalled, requests registered concurrently may or may
    /// not be. Setting a signal is a single atomic store and never re-enters
    /// the registry.
    pub fn signal_all(&self) -> usize {
        let requests = self.requests.lock();
        for (request_id, signal) in requests.iter() {
            info!("REGISTRY: signalling abort - request_id={request_id}");
            signal.set();
        }
        requests.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Register a request and return a guard that unregisters it on drop.
    pub fn track(&self, request_id: RequestId, signal: Arc<AbortSignal>) -> InFlightRequest {
        self.register(request_id.clone(), Arc::clone(&signal));
        InFlightRequest {
            registry: self.clone(),
            request_id,
            signal,
            finished: false,
        }
    }
}

/// Scope guard for a registered request.
///
/// The HTTP layer holds this across the whole request. When the client goes
/// away the handler future is dropped without reaching [`InFlightRequest::finish`],
/// which is reported as a disconnect: the request is signalled before it is
/// unregistered, so the pipeline (which holds its own handle on the signal)
/// stops at its next checkpoint.
pub struct InFlightRequest {
    registry: RequestRegistry,
    request_id: RequestId,
    signal: Arc<AbortSignal>,
    finished: bool,
}

impl InFlightRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn signal(&self) -> Arc<AbortSignal> {
        Arc::clone(&self.signal)
    }

    /// Mark the request as completed normally.
    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Client disconnected from request {}, signalling abort",
                self.request_id
            );
            self.signal.set();
        }
        self.registry.unregister(&self.request_id);
    }
}
