//! Integrity verification
//!
//! Async front of the Merkle functions in `dx_core::merkle`. Tree building
//! runs on the [`WorkerPool`]; checking a proof is cheap and stays inline.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use dx_core::merkle::{self, MerkleProof, MerkleTree};
use dx_core::{digest_to_hex, Digest32};

use crate::error::EngineResult;
use crate::pool::WorkerPool;

/// Outcome of checking a dataset against a claimed root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    /// Root recomputed from the dataset, hex encoded
    pub computed_root: String,
    /// Leaf whose inclusion proof was checked
    pub challenged_index: Option<usize>,
    pub reason: Option<String>,
}

impl IntegrityReport {
    fn invalid(computed_root: &Digest32, challenged_index: Option<usize>, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            computed_root: digest_to_hex(computed_root),
            challenged_index,
            reason: Some(reason.into()),
        }
    }
}

/// Merkle integrity gate
pub struct IntegrityVerifier {
    pool: Arc<WorkerPool>,
}

impl IntegrityVerifier {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub async fn compute_root(&self, leaves: Vec<String>) -> EngineResult<Digest32> {
        self.pool.run(move || merkle::compute_root(&leaves)).await
    }

    pub async fn prove_leaf(&self, leaves: Vec<String>, index: usize) -> EngineResult<Option<MerkleProof>> {
        self.pool.run(move || merkle::prove_leaf(&leaves, index)).await
    }

    pub fn verify(&self, root: &Digest32, proof: &MerkleProof, leaf_hash: &Digest32, index: usize) -> bool {
        merkle::verify(root, proof, leaf_hash, index)
    }

    /// Recompute the root of `leaves` and check a random leaf's inclusion
    /// proof against `expected_root`
    pub async fn verify_dataset(&self, leaves: Vec<String>, expected_root: Digest32) -> EngineResult<IntegrityReport> {
        self.pool
            .run(move || {
                let tree = MerkleTree::build(&leaves);
                let computed = tree.root();

                if leaves.is_empty() {
                    return IntegrityReport::invalid(&computed, None, "empty dataset");
                }

                let index = rand::thread_rng().gen_range(0..leaves.len());
                let proof = match tree.proof(index) {
                    Some(proof) => proof,
                    None => return IntegrityReport::invalid(&computed, Some(index), "no proof for challenged leaf"),
                };

                let leaf_hash = merkle::hash_leaf(index, leaves[index].as_bytes());
                if computed != expected_root {
                    return IntegrityReport::invalid(
                        &computed,
                        Some(index),
                        format!(
                            "root mismatch: expected {}, computed {}",
                            digest_to_hex(&expected_root),
                            digest_to_hex(&computed)
                        ),
                    );
                }
                if !merkle::verify(&expected_root, &proof, &leaf_hash, index) {
                    return IntegrityReport::invalid(&computed, Some(index), "inclusion proof rejected");
                }

                IntegrityReport {
                    valid: true,
                    computed_root: digest_to_hex(&computed),
                    challenged_index: Some(index),
                    reason: None,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_core::merkle::{canonical_leaves, hash_leaf};

    fn verifier() -> IntegrityVerifier {
        IntegrityVerifier::new(Arc::new(WorkerPool::new(1, 2).unwrap()))
    }

    fn leaves() -> Vec<String> {
        canonical_leaves(vec!["c".into(), "a".into(), "b".into(), "d".into(), "e".into()])
    }

    #[tokio::test]
    async fn test_compute_and_prove() {
        let verifier = verifier();
        let root = verifier.compute_root(leaves()).await.unwrap();
        assert_eq!(root, merkle::compute_root(&leaves()));

        let proof = verifier.prove_leaf(leaves(), 4).await.unwrap().unwrap();
        assert!(verifier.verify(&root, &proof, &hash_leaf(4, b"e"), 4));
        assert!(!verifier.verify(&root, &proof, &hash_leaf(4, b"x"), 4));
        assert!(verifier.prove_leaf(leaves(), 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verify_dataset() {
        let verifier = verifier();
        let root = merkle::compute_root(&leaves());

        let report = verifier.verify_dataset(leaves(), root).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.computed_root, digest_to_hex(&root));
        assert!(report.challenged_index.unwrap() < 5);

        let mut tampered = leaves();
        tampered[2].push('!');
        let report = verifier.verify_dataset(tampered, root).await.unwrap();
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("root mismatch"));

        let report = verifier.verify_dataset(Vec::new(), [0u8; 32]).await.unwrap();
        assert!(!report.valid);
    }

    #[tokio::test]
    async fn test_padded_dataset_fails_against_original_root() {
        let verifier = verifier();
        let original = canonical_leaves(vec!["a".into(), "b".into(), "c".into()]);
        let root = merkle::compute_root(&original);

        let mut padded = original.clone();
        padded.push("c".into());
        let report = verifier.verify_dataset(padded, root).await.unwrap();
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("root mismatch"));
    }
}
