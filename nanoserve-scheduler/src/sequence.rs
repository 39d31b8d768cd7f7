use std::time::Instant;

use nanoserve_core::{GenerationRequest, RequestHandle};

/// A request waiting in the scheduler queue.
#[derive(Debug, Clone)]
pub struct QueuedSequence {
    pub seq_id: u64,
    pub request: GenerationRequest,
    pub enqueued_at: Instant,
}

impl QueuedSequence {
    pub fn new(seq_id: u64, request: GenerationRequest) -> Self {
        Self {
            seq_id,
            request,
            enqueued_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            request_id: self.request.request_id.clone(),
            seq_id: self.seq_id,
        }
    }
}
