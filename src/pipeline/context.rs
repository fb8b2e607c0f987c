use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::dispatch::{Dispatcher, PipelineEvent};
use crate::erx::ErxGateway;
use crate::lock::LeaseLock;
use crate::queue::WorkQueue;

/// Collaborators shared by every worker and service. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub gateway: Arc<dyn ErxGateway>,
    pub routing_queue: Arc<dyn WorkQueue>,
    pub status_queue: Arc<dyn WorkQueue>,
    pub lease: Arc<dyn LeaseLock>,
    pub dispatcher: Arc<Dispatcher>,
}

impl PipelineContext {
    pub fn publish(&self, event: PipelineEvent) {
        self.dispatcher.publish(&event);
    }
}
