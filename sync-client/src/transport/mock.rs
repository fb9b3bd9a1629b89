//! Mock transport for testing.
//!
//! Allows queueing responses and capturing sent requests for verification.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use sync_types::{MutationResult, PullRequest, PullResponse, PushRequest, PushResponse};

/// Mock transport for testing.
///
/// Push requests without a queued response are acknowledged automatically
/// with increasing versions and sequence numbers; pulls without a queued
/// response return an empty page.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    pushes: Vec<PushRequest>,
    pulls: Vec<PullRequest>,
    push_queue: VecDeque<Result<PushResponse, TransportError>>,
    pull_queue: VecDeque<Result<PullResponse, TransportError>>,
    next_seq: u64,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next `push()` call.
    pub fn queue_push(&self, response: PushResponse) {
        let mut inner = self.inner.lock().unwrap();
        inner.push_queue.push_back(Ok(response));
    }

    /// Queue a response for the next `pull()` call.
    pub fn queue_pull(&self, response: PullResponse) {
        let mut inner = self.inner.lock().unwrap();
        inner.pull_queue.push_back(Ok(response));
    }

    /// Cause the next push() to fail with the given error.
    pub fn fail_next_push(&self, error: TransportError) {
        let mut inner = self.inner.lock().unwrap();
        inner.push_queue.push_back(Err(error));
    }

    /// Cause the next pull() to fail with the given error.
    pub fn fail_next_pull(&self, error: TransportError) {
        let mut inner = self.inner.lock().unwrap();
        inner.pull_queue.push_back(Err(error));
    }

    /// Get all push requests that were sent.
    pub fn pushes(&self) -> Vec<PushRequest> {
        let inner = self.inner.lock().unwrap();
        inner.pushes.clone()
    }

    /// Get all pull requests that were sent.
    pub fn pulls(&self) -> Vec<PullRequest> {
        let inner = self.inner.lock().unwrap();
        inner.pulls.clone()
    }

    /// Get the last push request that was sent.
    pub fn last_push(&self) -> Option<PushRequest> {
        let inner = self.inner.lock().unwrap();
        inner.pushes.last().cloned()
    }

    /// Clear all state (requests and queues).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pushes.push(request.clone());

        if let Some(queued) = inner.push_queue.pop_front() {
            return queued;
        }

        let mut results = Vec::with_capacity(request.events.len());
        for event in &request.events {
            inner.next_seq += 1;
            results.push(MutationResult::Ack {
                mutation_id: event.id,
                version: event.based_on_version.next(),
                global_seq: sync_types::GlobalSeq::new(inner.next_seq),
            });
        }
        Ok(PushResponse { results })
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pulls.push(request.clone());

        inner.pull_queue.pop_front().unwrap_or(Ok(PullResponse {
            entries: Vec::new(),
            cursor: request.since,
            has_more: false,
        }))
    }
}
