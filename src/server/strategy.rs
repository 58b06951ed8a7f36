//! Work distribution.
//!
//! Decides, from the local worker-pool state, how much enqueued work the next
//! pull may take on.

use super::worker::ProcessingRegistry;
use crate::storage::PageRequest;
use std::sync::Arc;

pub trait WorkDistributionStrategy: Send + Sync {
    fn can_onboard_new_work(&self) -> bool;

    /// The page to pull; a `limit` of zero means "pull nothing".
    fn work_page_request(&self) -> PageRequest;
}

/// Pulls exactly as many jobs as there are free workers.
pub struct BasicWorkDistributionStrategy {
    worker_pool_size: usize,
    processing: Arc<ProcessingRegistry>,
}

impl BasicWorkDistributionStrategy {
    pub(crate) fn new(worker_pool_size: usize, processing: Arc<ProcessingRegistry>) -> Self {
        Self {
            worker_pool_size,
            processing,
        }
    }
}

impl WorkDistributionStrategy for BasicWorkDistributionStrategy {
    fn can_onboard_new_work(&self) -> bool {
        self.processing.len() < self.worker_pool_size
    }

    fn work_page_request(&self) -> PageRequest {
        let free = self.worker_pool_size.saturating_sub(self.processing.len());
        PageRequest::asc(0, free)
    }
}
