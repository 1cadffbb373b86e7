//! Command handlers for the CLI

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dx_core::merkle::{self, canonical_leaves};
use dx_core::{
    digest_from_hex, digest_to_hex, CommandStatus, Locator, OperationId, OperationPayload,
    OperationStatus, OperationType,
};
use dx_engine::{EngineConfig, EngineStorage, NodeContext, SchedulerRunner, SledStorage};
use dx_network::{MemoryNetwork, MessageRouter, NodeManager, RouterConfig, Transport};

use crate::{CommandStatusArg, Commands, MerkleCommands, OperationStatusArg};

type CmdResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub async fn run(command: Commands, data_dir: &Path) -> CmdResult {
    match command {
        Commands::Status { operation_id } => handle_status(&open_storage(data_dir)?, &operation_id).await,
        Commands::Operations { status } => handle_operations(&open_storage(data_dir)?, status).await,
        Commands::Commands { status, operation_id } => {
            handle_commands(&open_storage(data_dir)?, status, operation_id).await
        }
        Commands::Finality { locator } => handle_finality(&open_storage(data_dir)?, &locator).await,
        Commands::Stats => {
            let stats = open_storage(data_dir)?.get_stats().await?;
            print_json(&stats)
        }
        Commands::Merkle { action } => handle_merkle(action),
        Commands::Simulate {
            replicas,
            leaves,
            replication_factor,
        } => handle_simulate(replicas, leaves, replication_factor).await,
    }
}

fn open_storage(data_dir: &Path) -> Result<SledStorage, Box<dyn std::error::Error + Send + Sync>> {
    if !data_dir.exists() {
        return Err(format!("data directory {} does not exist", data_dir.display()).into());
    }
    Ok(SledStorage::open(data_dir)?)
}

fn print_json<T: Serialize>(data: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

async fn handle_status(storage: &SledStorage, operation_id: &str) -> CmdResult {
    let operation_id: OperationId = operation_id.parse()?;
    let operation = storage
        .get_operation(&operation_id)
        .await?
        .ok_or_else(|| format!("Operation {} not found", operation_id))?;
    let responses = storage.list_responses(&operation_id).await?;
    let summary = dx_core::ResponseSummary::from_responses(&responses);
    let commands = storage.list_commands_for_operation(&operation_id).await?;

    println!("Operation: {}", operation.operation_id);
    println!("  Type: {}", operation.operation_type);
    println!("  Locator: {}", operation.locator);
    println!("  Status: {}", operation.status);
    if let Some(error) = &operation.error_message {
        println!("  Error: {}", error);
    }
    if let Some(data) = &operation.data {
        println!("  Data: {}", data);
    }
    println!(
        "  Responses: {} ack, {} nack, {} busy, {} failed",
        summary.ack, summary.nack, summary.busy, summary.failed
    );
    for response in &responses {
        println!(
            "    {} {}{}",
            response.peer_id,
            response.status,
            response.message.as_ref().map(|m| format!(" ({})", m)).unwrap_or_default()
        );
    }
    println!("  Commands:");
    for command in &commands {
        println!(
            "    {} {} {} attempts={}",
            command.id, command.name, command.status, command.attempts
        );
    }
    Ok(())
}

async fn handle_operations(storage: &SledStorage, status: Option<OperationStatusArg>) -> CmdResult {
    let mut operations = storage.list_operations(status.map(operation_status)).await?;
    operations.sort_by_key(|operation| operation.created_at);

    println!("Found {} operations:", operations.len());
    for operation in operations {
        println!(
            "  {} {} {} - {}",
            operation.operation_id, operation.operation_type, operation.locator, operation.status
        );
    }
    Ok(())
}

async fn handle_commands(
    storage: &SledStorage,
    statuses: Vec<CommandStatusArg>,
    operation_id: Option<String>,
) -> CmdResult {
    let statuses: Vec<CommandStatus> = if statuses.is_empty() {
        ALL_COMMAND_STATUSES.to_vec()
    } else {
        statuses.into_iter().map(command_status).collect()
    };

    let mut commands = match operation_id {
        Some(id) => {
            let id: OperationId = id.parse()?;
            storage
                .list_commands_for_operation(&id)
                .await?
                .into_iter()
                .filter(|command| statuses.contains(&command.status))
                .collect()
        }
        None => storage.list_commands_by_status(&statuses).await?,
    };
    commands.sort_by_key(|command| command.created_at);

    println!("Found {} commands:", commands.len());
    for command in commands {
        print!(
            "  {} {} {} due={} retries_left={}",
            command.id,
            command.name,
            command.status,
            command.due_at.as_millis(),
            command.retries_left
        );
        if let Some(error) = &command.last_error {
            print!(" ({})", error);
        }
        println!();
    }
    Ok(())
}

async fn handle_finality(storage: &SledStorage, locator: &str) -> CmdResult {
    let locator = Locator::new(locator)?;
    let state = storage.get_finality_state(&locator).await?;
    let acks = storage.list_finality_acks(&locator).await?;

    println!("Locator: {}", state.locator);
    println!("  Distinct acks: {}", state.distinct_ack_count);
    println!("  Quorum reached: {}", state.min_acks_reached);
    if let Some(reached_at) = state.reached_at {
        println!("  Reached at: {}", reached_at.as_millis());
    }
    for ack in acks {
        println!("    {} (operation {})", ack.peer_id, ack.operation_id);
    }
    Ok(())
}

// ==================== Merkle ====================

#[derive(Serialize)]
struct RootOutput {
    leaf_count: usize,
    merkle_root: String,
}

#[derive(Serialize)]
struct VerifyOutput {
    valid: bool,
    leaf_index: usize,
    computed_root: String,
}

fn read_leaves(file: &Path) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
    let content = std::fs::read_to_string(file)?;
    let leaves: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();
    if leaves.is_empty() {
        return Err(format!("{} contains no leaves", file.display()).into());
    }
    Ok(canonical_leaves(leaves))
}

fn handle_merkle(action: MerkleCommands) -> CmdResult {
    match action {
        MerkleCommands::Root { file } => {
            let leaves = read_leaves(&file)?;
            print_json(&RootOutput {
                leaf_count: leaves.len(),
                merkle_root: digest_to_hex(&merkle::compute_root(&leaves)),
            })
        }
        MerkleCommands::Prove { file, index } => {
            let leaves = read_leaves(&file)?;
            let proof = merkle::prove_leaf(&leaves, index)
                .ok_or_else(|| format!("leaf index {} out of range (0..{})", index, leaves.len()))?;
            print_json(&proof)
        }
        MerkleCommands::Verify { file, index, root } => {
            let leaves = read_leaves(&file)?;
            let expected = digest_from_hex(&root)?;
            let computed = merkle::compute_root(&leaves);
            let valid = match (merkle::prove_leaf(&leaves, index), leaves.get(index)) {
                (Some(proof), Some(leaf)) => {
                    merkle::verify(&expected, &proof, &merkle::hash_leaf(index, leaf.as_bytes()), index)
                }
                _ => false,
            };
            print_json(&VerifyOutput {
                valid,
                leaf_index: index,
                computed_root: digest_to_hex(&computed),
            })
        }
    }
}

// ==================== Simulation ====================

type SimulatedNode = (Arc<NodeContext>, Arc<MessageRouter>);

async fn spawn_node(
    network: &MemoryNetwork,
    node_id: &str,
    config: EngineConfig,
) -> Result<SimulatedNode, Box<dyn std::error::Error + Send + Sync>> {
    let node_manager = Arc::new(NodeManager::new(node_id.to_string()));
    let (transport, inbox) = network.join(node_manager.clone()).await;
    let router = Arc::new(MessageRouter::new(node_manager, transport, RouterConfig::default()));
    router.clone().spawn(inbox);

    let ctx = NodeContext::builder(config).gateway(router.clone()).build().await?;
    Ok((ctx, router))
}

async fn handle_simulate(replicas: usize, leaf_count: usize, replication_factor: Option<u32>) -> CmdResult {
    let mut config = EngineConfig::from_env();
    if let Some(replication_factor) = replication_factor {
        config = config.with_replication_factor(replication_factor);
    }
    config.scheduler_tick_interval_ms = config.scheduler_tick_interval_ms.min(50);
    config.validate()?;

    let network = MemoryNetwork::default();
    let (ctx, router) = spawn_node(&network, "coordinator", config.clone()).await?;
    let mut replica_nodes = Vec::with_capacity(replicas);
    for i in 1..=replicas {
        let peer = format!("replica-{}", i);
        replica_nodes.push(spawn_node(&network, &peer, config.clone()).await?);
        router.transport().connect(&peer).await?;
    }

    let leaves = canonical_leaves(
        (0..leaf_count)
            .map(|i| format!("<urn:dx:asset:{}> <urn:dx:value> \"{}\" .", i, i))
            .collect(),
    );
    let root = digest_to_hex(&merkle::compute_root(&leaves));
    println!(
        "Publishing {} leaves (root {}) to {} replicas, replication factor {}",
        leaves.len(),
        root,
        replicas,
        config.replication_factor
    );

    let runner = SchedulerRunner::new(ctx.clone()).start().await?;
    let mut events = ctx.registry.subscribe();
    let operation_id = ctx
        .create_operation(
            OperationType::Publish,
            Locator::new("did:dx:simulated/1")?,
            OperationPayload::dataset(leaves, root),
        )
        .await?;

    let deadline = Duration::from_millis(config.operation_timeout_ms.saturating_add(1_000));
    let waited = tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if event.operation_id == operation_id && event.status.is_terminal() => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    runner.stop().await;

    if waited.is_err() {
        println!("Operation {} did not finish in time", operation_id);
    }
    let view = ctx.get_status(&operation_id).await?;
    print_json(&view)?;

    if view.status != OperationStatus::Completed {
        return Err(format!("operation ended {}", view.status).into());
    }
    Ok(())
}

const ALL_COMMAND_STATUSES: [CommandStatus; 7] = [
    CommandStatus::Pending,
    CommandStatus::Scheduled,
    CommandStatus::Processing,
    CommandStatus::Completed,
    CommandStatus::Failed,
    CommandStatus::Repeating,
    CommandStatus::Expired,
];

fn operation_status(arg: OperationStatusArg) -> OperationStatus {
    match arg {
        OperationStatusArg::Pending => OperationStatus::Pending,
        OperationStatusArg::InProgress => OperationStatus::InProgress,
        OperationStatusArg::Completed => OperationStatus::Completed,
        OperationStatusArg::Failed => OperationStatus::Failed,
    }
}

fn command_status(arg: CommandStatusArg) -> CommandStatus {
    match arg {
        CommandStatusArg::Pending => CommandStatus::Pending,
        CommandStatusArg::Scheduled => CommandStatus::Scheduled,
        CommandStatusArg::Processing => CommandStatus::Processing,
        CommandStatusArg::Completed => CommandStatus::Completed,
        CommandStatusArg::Failed => CommandStatus::Failed,
        CommandStatusArg::Repeating => CommandStatus::Repeating,
        CommandStatusArg::Expired => CommandStatus::Expired,
    }
}
