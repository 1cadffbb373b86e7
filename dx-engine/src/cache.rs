//! In-memory payload cache
//!
//! Holds the dataset and claimed root of open operations until they reach
//! a terminal status. Not persisted: after a restart the cache is empty and
//! `finalize` fails the affected operations.

use std::collections::HashMap;
use tokio::sync::RwLock;

use dx_core::{Locator, OperationId, OperationPayload, OperationType, Timestamp};

/// Cached request of one operation
#[derive(Debug, Clone, PartialEq)]
pub struct CachedOperation {
    pub operation_type: OperationType,
    pub locator: Locator,
    pub payload: OperationPayload,
    pub cached_at: Timestamp,
}

impl CachedOperation {
    pub fn new(operation_type: OperationType, locator: Locator, payload: OperationPayload) -> Self {
        Self {
            operation_type,
            locator,
            payload,
            cached_at: Timestamp::now(),
        }
    }
}

#[derive(Default)]
pub struct OperationCache {
    entries: RwLock<HashMap<OperationId, CachedOperation>>,
}

impl OperationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, operation_id: OperationId, entry: CachedOperation) {
        self.entries.write().await.insert(operation_id, entry);
    }

    pub async fn get(&self, operation_id: &OperationId) -> Option<CachedOperation> {
        self.entries.read().await.get(operation_id).cloned()
    }

    pub async fn remove(&self, operation_id: &OperationId) -> Option<CachedOperation> {
        self.entries.write().await.remove(operation_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
