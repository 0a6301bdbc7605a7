//! Request correlation
//!
//! Maps an outstanding request id to the continuation that must run when its
//! response arrives. Not shared across threads; every call happens on the
//! tick thread that drains ops.

use std::collections::HashMap;
use tracing::{trace, warn};

use crate::types::RequestId;

/// Table of outstanding requests and their continuations
pub struct RequestCorrelator<H> {
    handlers: HashMap<RequestId, H>,
}

impl<H> RequestCorrelator<H> {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the continuation for a request that has already been sent
    pub fn register(&mut self, request_id: RequestId, handler: H) {
        if self.handlers.insert(request_id, handler).is_some() {
            warn!(request_id, "Replaced continuation for request already in flight");
        }
    }

    /// Send a request and register its continuation in one step
    pub fn send_and_register<F>(&mut self, send: F, handler: H) -> RequestId
    where
        F: FnOnce() -> RequestId,
    {
        let request_id = send();
        self.register(request_id, handler);
        request_id
    }

    /// Remove and return the continuation for a response
    ///
    /// Unknown ids yield `None`: the response is stale or already handled.
    pub fn take(&mut self, request_id: RequestId) -> Option<H> {
        let handler = self.handlers.remove(&request_id);
        if handler.is_none() {
            trace!(request_id, "Ignoring response for unknown request");
        }
        handler
    }

    /// Whether a request is still awaiting its response
    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.handlers.contains_key(&request_id)
    }

    /// Number of requests in flight
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Iterate over in-flight continuations
    pub fn pending(&self) -> impl Iterator<Item = (&RequestId, &H)> {
        self.handlers.iter()
    }

    /// Drop every in-flight continuation
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Invoke the registered callback for a response, exactly once
    ///
    /// Returns false when no callback was registered for `request_id`.
    pub fn complete<R>(&mut self, request_id: RequestId, response: R) -> bool
    where
        H: FnOnce(R),
    {
        match self.take(request_id) {
            Some(handler) => {
                handler(response);
                true
            }
            None => false,
        }
    }
}

impl<H> Default for RequestCorrelator<H> {
    fn default() -> Self {
        Self::new()
    }
}
