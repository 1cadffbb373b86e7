//! DX Core - shared types for the operation execution engine
//!
//! This crate holds everything the other dx crates agree on:
//! - identifiers, locators and timestamps
//! - command, operation and finality records with their closed status enums
//! - the SHA-256 Merkle tree used as the integrity gate

pub mod error;
pub mod merkle;
pub mod types;

pub use error::*;
pub use merkle::{MerkleProof, MerkleTree};
pub use types::*;
