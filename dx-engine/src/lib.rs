//! DX Engine - operation execution core of a data-exchange node
//!
//! Runs client operations (publish, update, get, ask, search) against the
//! peers of the network and decides when they are final.
//!
//! # Architecture
//!
//! - **CommandScheduler**: persistent, retrying, priority-aware command
//!   execution driven by a [`SchedulerRunner`]
//! - **OperationRegistry**: operation lifecycle and the completion decision
//! - **FinalityTracker**: distinct replica acks per locator and quorum
//! - **IntegrityVerifier**: Merkle root and inclusion-proof checks on a
//!   dedicated [`WorkerPool`]
//! - **ReplicaService**: the serving side other nodes talk to
//!
//! # Publish flow
//!
//! ```text
//! create_operation ─► replicate command ─► ProtocolRequest to peers
//!                                               │
//!          COMPLETED ◄── verify_dataset ◄── quorum of ACKs
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dx_core::{Locator, OperationPayload, OperationType};
//! use dx_engine::{EngineConfig, NodeContext, SchedulerRunner};
//! use dx_network::NetworkGateway;
//!
//! async fn example(gateway: Arc<dyn NetworkGateway>, leaves: Vec<String>, root: String) {
//!     let ctx = NodeContext::builder(EngineConfig::from_env())
//!         .gateway(gateway)
//!         .build()
//!         .await
//!         .unwrap();
//!     let runner = SchedulerRunner::new(ctx.clone()).start().await.unwrap();
//!
//!     let id = ctx
//!         .create_operation(
//!             OperationType::Publish,
//!             Locator::new("did:dkg:otp/0xabc/1").unwrap(),
//!             OperationPayload::dataset(leaves, root),
//!         )
//!         .await
//!         .unwrap();
//!     println!("{:?}", ctx.get_status(&id).await.unwrap());
//!     runner.stop().await;
//! }
//! ```

pub mod cache;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod finality;
pub mod pool;
pub mod registry;
pub mod replica;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod verify;

pub use cache::{CachedOperation, OperationCache};
pub use config::EngineConfig;
pub use context::{NodeContext, NodeContextBuilder};
pub use error::{EngineError, EngineResult};
pub use finality::{FinalityListener, FinalityTracker};
pub use pool::{PoolStats, WorkerPool};
pub use registry::{OperationEvent, OperationRegistry, ResponseOutcome};
pub use replica::{ReplicaService, StoredDataset};
pub use retry::BackoffStrategy;
pub use runner::{RunnerHandle, SchedulerRunner};
pub use scheduler::{CommandHandler, CommandOutcome, CommandScheduler, HandlerRegistry, TickReport};
pub use storage::{EngineStorage, MemoryStorage, OperationUpdate, SledStorage, StorageStats};
pub use verify::{IntegrityReport, IntegrityVerifier};
