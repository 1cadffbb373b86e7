//! DX Network - peer messaging for the operation engine
//!
//! The engine only talks to [`NetworkGateway`]: send a payload to a peer
//! and wait for the reply with a timeout, and register handlers for
//! incoming message types. This crate provides:
//! - the message envelope and payloads
//! - peer tracking ([`NodeManager`])
//! - a request/response router implementing the gateway
//! - an in-process transport for tests and single-process clusters

pub mod error;
pub mod gateway;
pub mod memory;
pub mod message;
pub mod node;
pub mod router;

pub use error::{NetworkError, NetworkResult};
pub use gateway::NetworkGateway;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::*;
pub use node::{ConnectionState, NodeManager, PeerNode, Transport};
pub use router::{MessageHandler, MessageRouter, RouterConfig};
