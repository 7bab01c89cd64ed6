//! Global-batch fetching
//!
//! A "global batch" is a fixed count of micro-batches pulled from the
//! underlying source in one fetch, matching the number of micro-batches the
//! pipeline schedule consumes per step.

use async_trait::async_trait;
use parallel_core::{Error, FetchConfig, Result};
use tracing::warn;

/// Source of micro-batches.
#[async_trait]
pub trait BatchSource: Send {
    /// Micro-batch item type.
    type Batch: Send;

    /// Next micro-batch, or `None` when the source is exhausted.
    async fn next_batch(&mut self) -> Option<Self::Batch>;
}

/// One global batch: the micro-batches for a single training step.
#[derive(Debug)]
pub struct GlobalBatch<B> {
    /// Micro-batches in fetch order
    pub micro_batches: Vec<B>,
}

impl<B> GlobalBatch<B> {
    /// Number of micro-batches in this global batch.
    pub fn len(&self) -> usize {
        self.micro_batches.len()
    }

    /// True if the batch holds no micro-batches.
    pub fn is_empty(&self) -> bool {
        self.micro_batches.is_empty()
    }
}

/// Fetcher that pulls a fixed micro-batch count per global batch.
#[derive(Debug)]
pub struct GlobalBatchFetcher {
    micro_batches: usize,
    fetched: u64,
}

impl GlobalBatchFetcher {
    /// Fetcher from configuration. The micro-batch count must be positive.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        if config.micro_batches == 0 {
            return Err(Error::Precondition {
                message: "micro_batches must be > 0".to_string(),
            });
        }
        Ok(Self {
            micro_batches: config.micro_batches,
            fetched: 0,
        })
    }

    /// Micro-batches per global batch.
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    /// Global batches fetched so far.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Fetch the next global batch.
    ///
    /// Returns `None` on a clean end of the source. A trailing partial
    /// global batch is dropped with a warning: a step must always see the
    /// full micro-batch count.
    pub async fn fetch<S: BatchSource>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<GlobalBatch<S::Batch>>> {
        let mut micro_batches = Vec::with_capacity(self.micro_batches);
        for _ in 0..self.micro_batches {
            match source.next_batch().await {
                Some(batch) => micro_batches.push(batch),
                None => break,
            }
        }

        if micro_batches.is_empty() {
            return Ok(None);
        }
        if micro_batches.len() < self.micro_batches {
            warn!(
                got = micro_batches.len(),
                expected = self.micro_batches,
                "Dropping trailing partial global batch"
            );
            return Ok(None);
        }

        self.fetched += 1;
        Ok(Some(GlobalBatch { micro_batches }))
    }
}
