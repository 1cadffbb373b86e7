//! Test helpers: in-process clusters on a MemoryNetwork

#![allow(dead_code)]

use std::sync::Arc;

use dx_core::merkle::{canonical_leaves, compute_root};
use dx_core::{digest_to_hex, Timestamp};
use dx_engine::{CommandHandler, EngineConfig, EngineStorage, NodeContext, TickReport};
use dx_network::{MemoryNetwork, MessageRouter, NodeManager, RouterConfig, Transport};

pub struct TestNode {
    pub ctx: Arc<NodeContext>,
    pub router: Arc<MessageRouter>,
}

/// Node builder options
#[derive(Default)]
pub struct NodeOptions {
    pub storage: Option<Arc<dyn EngineStorage>>,
    pub handlers: Vec<Arc<dyn CommandHandler>>,
}

pub async fn spawn_node(network: &MemoryNetwork, node_id: &str, config: EngineConfig) -> TestNode {
    spawn_node_with(network, node_id, config, NodeOptions::default()).await
}

pub async fn spawn_node_with(
    network: &MemoryNetwork,
    node_id: &str,
    config: EngineConfig,
    options: NodeOptions,
) -> TestNode {
    let node_manager = Arc::new(NodeManager::new(node_id.to_string()));
    let (transport, inbox) = network.join(node_manager.clone()).await;
    let router = Arc::new(MessageRouter::new(node_manager, transport, RouterConfig::default()));
    router.clone().spawn(inbox);

    let mut builder = NodeContext::builder(config).gateway(router.clone());
    if let Some(storage) = options.storage {
        builder = builder.storage(storage);
    }
    for handler in options.handlers {
        builder = builder.handler(handler);
    }
    let ctx = builder.build().await.unwrap();

    TestNode { ctx, router }
}

/// Coordinator connected to `replicas` replica nodes
pub struct Cluster {
    pub network: MemoryNetwork,
    pub coordinator: TestNode,
    pub replicas: Vec<TestNode>,
}

impl Cluster {
    pub async fn start(replicas: usize, config: EngineConfig) -> Self {
        Self::start_with(replicas, config, NodeOptions::default()).await
    }

    pub async fn start_with(replicas: usize, config: EngineConfig, options: NodeOptions) -> Self {
        let network = MemoryNetwork::default();
        let coordinator = spawn_node_with(&network, "coordinator", config.clone(), options).await;

        let mut nodes = Vec::new();
        for i in 1..=replicas {
            let node = spawn_node(&network, &format!("replica-{}", i), config.clone()).await;
            coordinator
                .router
                .transport()
                .connect(&format!("replica-{}", i))
                .await
                .unwrap();
            nodes.push(node);
        }

        Self {
            network,
            coordinator,
            replicas: nodes,
        }
    }

    pub fn ctx(&self) -> &Arc<NodeContext> {
        &self.coordinator.ctx
    }

    /// Run everything due at `now` on the coordinator and wait for it
    pub async fn run_due_at(&self, now: Timestamp) -> TickReport {
        self.ctx().scheduler.run_due(self.ctx(), now).await.unwrap()
    }

    pub async fn run_due(&self) -> TickReport {
        self.run_due_at(Timestamp::now()).await
    }
}

/// Canonical dataset of `n` triples and its hex root
pub fn dataset(n: usize) -> (Vec<String>, String) {
    let leaves = canonical_leaves(
        (0..n)
            .map(|i| format!("<urn:asset:{}> <urn:p:value> \"{}\" .", i, i * 7))
            .collect(),
    );
    let root = digest_to_hex(&compute_root(&leaves));
    (leaves, root)
}
