//! Per-pipeline write locks.

use fastci_core::PipelineId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per pipeline, serializing every writer of that pipeline.
#[derive(Debug, Default)]
pub struct PipelineLocks {
    inner: Mutex<HashMap<PipelineId, Arc<AsyncMutex<()>>>>,
}

impl PipelineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: PipelineId) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(id).or_default().clone()
    }

    pub async fn lock(&self, id: PipelineId) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }

    /// Drop the entry of a pipeline that will never be written again.
    pub fn forget(&self, id: PipelineId) {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
