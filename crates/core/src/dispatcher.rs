//! Batch dispatch: grouping pending per-adapter requests into descriptors.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::batch::{BatchBuilder, BatchDescriptor, PaddingSide};
use crate::config::RunConfig;

/// Source of batch descriptors for the routing engine.
///
/// Implementations guarantee that every pending request ends up in exactly
/// one slice, that slices are adapter-homogeneous and contiguous, and that no
/// descriptor exceeds the configured row limit.
pub trait Dispatcher {
    /// Next batch to run, or `None` when nothing is pending.
    fn next_batch(&mut self) -> Option<BatchDescriptor>;
}

/// One unit of work: a token sequence for one adapter.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub adapter_name: String,
    pub tokens: Vec<u32>,
    pub prompt: Option<String>,
}

impl PendingRequest {
    pub fn new(adapter_name: impl Into<String>, tokens: Vec<u32>) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            tokens,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Upper bound on rows per descriptor. Zero is raised to one.
    pub max_rows: usize,
    /// Sequences longer than this are truncated. Inference batches are
    /// padded to exactly this length so rows can grow while decoding.
    pub cutoff_len: usize,
    pub pad_id: u32,
    pub collect_router_logits: bool,
    pub is_inference: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_rows: 16,
            cutoff_len: 256,
            pad_id: 0,
            collect_router_logits: false,
            is_inference: false,
        }
    }
}

#[derive(Debug)]
struct AdapterQueue {
    name: String,
    padding_side: PaddingSide,
    micro_batch_size: usize,
    pending: VecDeque<PendingRequest>,
}

/// Reference dispatcher: one FIFO per adapter, served round-robin.
///
/// Each adapter contributes at most its `micro_batch_size` rows per batch,
/// in the order adapters were first seen; the round-robin cursor resumes
/// after the last adapter served so no adapter starves under `max_rows`.
#[derive(Debug)]
pub struct QueueDispatcher {
    config: DispatcherConfig,
    queues: Vec<AdapterQueue>,
    cursor: usize,
}

impl QueueDispatcher {
    pub fn new(mut config: DispatcherConfig) -> Self {
        if config.max_rows == 0 {
            warn!("max_rows is 0, dispatching one row per batch");
            config.max_rows = 1;
        }
        Self {
            config,
            queues: Vec::new(),
            cursor: 0,
        }
    }

    /// Dispatcher with one queue per adapter of the run file.
    pub fn from_run_config(run: &RunConfig, is_inference: bool) -> Self {
        let mut dispatcher = Self::new(DispatcherConfig {
            max_rows: run.max_rows,
            cutoff_len: run.cutoff_len,
            pad_id: run.pad_id,
            collect_router_logits: run.collect_router_logits,
            is_inference,
        });
        for adapter in &run.lora {
            dispatcher.add_adapter(&adapter.name, adapter.padding_side, adapter.micro_batch_size);
        }
        dispatcher
    }

    /// Declare an adapter queue. Re-declaring updates its settings.
    pub fn add_adapter(&mut self, name: &str, padding_side: PaddingSide, micro_batch_size: usize) {
        let micro_batch_size = micro_batch_size.max(1);
        match self.queues.iter_mut().find(|q| q.name == name) {
            Some(queue) => {
                queue.padding_side = padding_side;
                queue.micro_batch_size = micro_batch_size;
            }
            None => self.queues.push(AdapterQueue {
                name: name.to_string(),
                padding_side,
                micro_batch_size,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Queue a request. Requests for undeclared adapters get a queue with
    /// right padding and the full row budget.
    pub fn submit(&mut self, request: PendingRequest) {
        let idx = match self.queues.iter().position(|q| q.name == request.adapter_name) {
            Some(idx) => idx,
            None => {
                self.add_adapter(
                    &request.adapter_name,
                    PaddingSide::default(),
                    self.config.max_rows,
                );
                self.queues.len() - 1
            }
        };
        self.queues[idx].pending.push_back(request);
    }

    pub fn num_pending(&self) -> usize {
        self.queues.iter().map(|q| q.pending.len()).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.num_pending() == 0
    }
}

impl QueueDispatcher {
    /// Put drained requests back at the front of their queues, in order.
    fn requeue(&mut self, taken: Vec<(usize, Vec<PendingRequest>)>) {
        for (idx, requests) in taken.into_iter().rev() {
            let queue = &mut self.queues[idx];
            for request in requests.into_iter().rev() {
                queue.pending.push_front(request);
            }
        }
    }
}

impl Dispatcher for QueueDispatcher {
    fn next_batch(&mut self) -> Option<BatchDescriptor> {
        if self.is_idle() {
            return None;
        }

        let mut builder = BatchBuilder::new(self.config.pad_id)
            .max_seq_len(self.config.cutoff_len)
            .collect_router_logits(self.config.collect_router_logits)
            .inference(self.config.is_inference);
        if self.config.is_inference {
            builder = builder.fixed_seq_len(self.config.cutoff_len);
        }
        let mut budget = self.config.max_rows;
        let num_queues = self.queues.len();
        let mut taken = Vec::new();

        let mut visited = 0;
        while visited < num_queues && budget > 0 {
            let idx = (self.cursor + visited) % num_queues;
            visited += 1;

            let queue = &mut self.queues[idx];
            let take = queue.micro_batch_size.min(budget).min(queue.pending.len());
            if take == 0 {
                continue;
            }
            budget -= take;

            let requests: Vec<PendingRequest> = queue.pending.drain(..take).collect();
            let mut sequences = Vec::with_capacity(take);
            let mut prompts = Vec::with_capacity(take);
            for request in &requests {
                if request.tokens.len() > self.config.cutoff_len {
                    warn!(
                        adapter = %queue.name,
                        len = request.tokens.len(),
                        cutoff_len = self.config.cutoff_len,
                        "truncating sequence"
                    );
                }
                sequences.push(request.tokens.clone());
                prompts.push(request.prompt.clone());
            }
            builder.push_with_prompts(queue.name.clone(), queue.padding_side, sequences, prompts);
            taken.push((idx, requests));
        }

        debug!(
            rows = builder.num_rows(),
            pending = self.num_pending(),
            "dispatching batch"
        );
        match builder.build() {
            Ok(batch) => {
                self.cursor = (self.cursor + visited) % num_queues;
                Some(batch)
            }
            Err(e) => {
                warn!(error = %e, "batch rejected, requests requeued");
                self.requeue(taken);
                None
            }
        }
    }
}
