use std::collections::{HashMap, VecDeque};

use nanoserve_core::{EngineConfig, GenerationRequest, RequestHandle, Result, ServeError};
use tracing::debug;

use crate::adaptive::{AdaptiveBatchController, BatchStats};
use crate::sequence::QueuedSequence;

/// FCFS request queue whose batch sizes come from an
/// [`AdaptiveBatchController`].
pub struct BatchScheduler {
    controller: AdaptiveBatchController,
    /// Also cap batches at the controller's learned size.
    use_learned_size: bool,
    waiting: VecDeque<u64>,
    sequences: HashMap<u64, QueuedSequence>,
    next_seq_id: u64,
}

impl BatchScheduler {
    pub fn new(controller: AdaptiveBatchController, use_learned_size: bool) -> Self {
        Self {
            controller,
            use_learned_size,
            waiting: VecDeque::new(),
            sequences: HashMap::new(),
            next_seq_id: 1,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(
            AdaptiveBatchController::from_config(config)?,
            config.use_learned_batch_size,
        ))
    }

    pub fn enqueue(&mut self, request: GenerationRequest) -> RequestHandle {
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;

        let seq = QueuedSequence::new(seq_id, request);
        let handle = seq.handle();
        self.sequences.insert(seq_id, seq);
        self.waiting.push_back(seq_id);
        handle
    }

    /// Remove a queued request. Requests already handed out by
    /// [`next_batch`](Self::next_batch) are no longer known here.
    pub fn cancel(&mut self, seq_id: u64) -> Result<()> {
        if self.sequences.remove(&seq_id).is_none() {
            return Err(ServeError::SeqNotFound(seq_id));
        }
        self.waiting.retain(|&id| id != seq_id);
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.waiting.len()
    }

    /// Batch size the next call to [`next_batch`](Self::next_batch) would
    /// aim for, before limiting it to the queue depth.
    pub fn target_batch_size(&self, available_memory_fraction: f64) -> usize {
        let recommended = self
            .controller
            .recommend(available_memory_fraction, self.queue_depth());
        if self.use_learned_size {
            recommended.min(self.controller.current_size())
        } else {
            recommended
        }
    }

    /// Pop the next batch in arrival order. Empty only when the queue is.
    pub fn next_batch(&mut self, available_memory_fraction: f64) -> Vec<QueuedSequence> {
        if self.waiting.is_empty() {
            return Vec::new();
        }
        let target = self.target_batch_size(available_memory_fraction);
        let mut batch = Vec::with_capacity(target);
        while batch.len() < target {
            let Some(seq_id) = self.waiting.pop_front() else {
                break;
            };
            if let Some(seq) = self.sequences.remove(&seq_id) {
                batch.push(seq);
            }
        }
        debug!(
            batch_size = batch.len(),
            target,
            queue_depth = self.waiting.len(),
            "formed batch"
        );
        batch
    }

    /// Feed a finished batch's throughput back into the controller.
    pub fn record(&mut self, batch_size: usize, throughput: f64) {
        self.controller.record(batch_size, throughput);
    }

    pub fn controller(&self) -> &AdaptiveBatchController {
        &self.controller
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.controller.stats()
    }
}
