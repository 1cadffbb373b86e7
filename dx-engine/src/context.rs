//! Node context
//!
//! Every engine component of a node, built once at startup and handed to
//! command handlers by reference.

use std::sync::Arc;
use tracing::info;

use dx_core::{Locator, OperationId, OperationPayload, OperationStatusView, OperationType};
use dx_network::NetworkGateway;

use crate::cache::OperationCache;
use crate::commands;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::finality::{FinalityListener, FinalityTracker};
use crate::pool::WorkerPool;
use crate::registry::OperationRegistry;
use crate::replica::ReplicaService;
use crate::scheduler::{CommandHandler, CommandScheduler};
use crate::storage::{EngineStorage, MemoryStorage};
use crate::verify::IntegrityVerifier;

/// Shared components of one node
pub struct NodeContext {
    pub config: EngineConfig,
    pub storage: Arc<dyn EngineStorage>,
    pub cache: Arc<OperationCache>,
    pub verifier: Arc<IntegrityVerifier>,
    pub finality: Arc<FinalityTracker>,
    pub scheduler: Arc<CommandScheduler>,
    pub registry: Arc<OperationRegistry>,
    pub gateway: Arc<dyn NetworkGateway>,
    pub replica: Arc<ReplicaService>,
}

impl NodeContext {
    pub fn builder(config: EngineConfig) -> NodeContextBuilder {
        NodeContextBuilder::new(config)
    }

    /// Start an operation
    pub async fn create_operation(
        &self,
        operation_type: OperationType,
        locator: Locator,
        payload: OperationPayload,
    ) -> EngineResult<OperationId> {
        self.registry.create_operation(operation_type, locator, payload).await
    }

    /// Poll an operation
    pub async fn get_status(&self, operation_id: &OperationId) -> EngineResult<OperationStatusView> {
        self.registry.get_status(operation_id).await
    }
}

/// Builder of [`NodeContext`]
pub struct NodeContextBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn EngineStorage>>,
    gateway: Option<Arc<dyn NetworkGateway>>,
    handlers: Vec<Arc<dyn CommandHandler>>,
}

impl NodeContextBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            storage: None,
            gateway: None,
            handlers: Vec::new(),
        }
    }

    /// Storage backend; in-memory when not set
    pub fn storage(mut self, storage: Arc<dyn EngineStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn NetworkGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Extra command handler; replaces a built-in one of the same name
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub async fn build(self) -> EngineResult<Arc<NodeContext>> {
        self.config.validate()?;
        let config = self.config;

        let gateway = self
            .gateway
            .ok_or_else(|| EngineError::Configuration("a network gateway is required".to_string()))?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()) as Arc<dyn EngineStorage>);

        let pool = Arc::new(WorkerPool::new(config.worker_pool_min, config.worker_pool_max)?);
        let verifier = Arc::new(IntegrityVerifier::new(pool));
        let cache = Arc::new(OperationCache::new());
        let finality = Arc::new(FinalityTracker::new(storage.clone(), config.replication_factor));

        let handlers = self
            .handlers
            .into_iter()
            .fold(commands::default_handlers(), |registry, handler| registry.register(handler));
        let scheduler = Arc::new(CommandScheduler::new(
            storage.clone(),
            handlers,
            config.backoff.clone(),
            config.scheduler_max_concurrency,
        ));

        let registry = Arc::new(OperationRegistry::new(
            config.clone(),
            storage.clone(),
            cache.clone(),
            scheduler.clone(),
            finality.clone(),
            verifier.clone(),
        ));
        let listener: Arc<dyn FinalityListener> = registry.clone();
        finality.set_listener(Arc::downgrade(&listener)).await;

        let replica = Arc::new(ReplicaService::new(gateway.local_node_id().clone()));
        replica.register(&gateway).await;

        info!(
            node_id = %gateway.local_node_id(),
            replication_factor = config.replication_factor,
            handlers = ?scheduler.handlers().names(),
            "Node context ready"
        );

        Ok(Arc::new(NodeContext {
            config,
            storage,
            cache,
            verifier,
            finality,
            scheduler,
            registry,
            gateway,
            replica,
        }))
    }
}
