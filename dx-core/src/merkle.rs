//! Merkle tree for dataset integrity
//!
//! Binary tree over SHA-256 leaf hashes. Levels with an odd number of nodes
//! duplicate their last node. The root of an empty dataset is all zeros.
//!
//! A leaf hash commits to the leaf's position, so repeating the last leaf
//! changes the root instead of reproducing the duplicated node. Leaves and
//! interior nodes are hashed under distinct prefixes.
//!
//! Leaf order is significant; callers sort leaves with [`canonical_leaves`]
//! before building a tree.

use serde::{Deserialize, Serialize};

use crate::types::{compute_digest, Digest32};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hash of the leaf stored at `index`
pub fn hash_leaf(index: usize, leaf: &[u8]) -> Digest32 {
    let mut data = Vec::with_capacity(1 + 8 + leaf.len());
    data.push(LEAF_PREFIX);
    data.extend_from_slice(&(index as u64).to_be_bytes());
    data.extend_from_slice(leaf);
    compute_digest(&data)
}

/// Parent of two nodes
pub fn hash_pair(left: &Digest32, right: &Digest32) -> Digest32 {
    let mut data = [0u8; 65];
    data[0] = NODE_PREFIX;
    data[1..33].copy_from_slice(left);
    data[33..].copy_from_slice(right);
    compute_digest(&data)
}

/// Deterministic leaf order
pub fn canonical_leaves(mut leaves: Vec<String>) -> Vec<String> {
    leaves.sort();
    leaves
}

/// Fully materialized tree, level 0 being the leaf hashes
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest32>>,
}

impl MerkleTree {
    pub fn build<L: AsRef<[u8]>>(leaves: &[L]) -> Self {
        let hashes = leaves
            .iter()
            .enumerate()
            .map(|(index, leaf)| hash_leaf(index, leaf.as_ref()))
            .collect();
        Self::from_leaf_hashes(hashes)
    }

    pub fn from_leaf_hashes(hashes: Vec<Digest32>) -> Self {
        let mut levels = vec![hashes];

        while levels.last().map(|level| level.len() > 1).unwrap_or(false) {
            let current = &levels[levels.len() - 1];
            let next: Vec<Digest32> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [single] => hash_pair(single, single),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        Self { levels }
    }

    pub fn root(&self) -> Digest32 {
        match self.levels.last() {
            Some(top) if top.len() == 1 => top[0],
            _ => [0u8; 32],
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Inclusion proof for the leaf at `leaf_index`
    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        let leaf_hash = *self.levels.first()?.get(leaf_index)?;
        let mut siblings = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            // Odd level: the last node is paired with itself.
            let sibling = level.get(sibling_index).copied().unwrap_or(level[index]);
            siblings.push(sibling);
            index /= 2;
        }

        Some(MerkleProof {
            root: self.root(),
            leaf_index,
            leaf_hash,
            siblings,
        })
    }
}

/// Inclusion evidence for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    #[serde(with = "hex_digest")]
    pub root: Digest32,
    pub leaf_index: usize,
    #[serde(with = "hex_digest")]
    pub leaf_hash: Digest32,
    #[serde(with = "hex_digest_vec")]
    pub siblings: Vec<Digest32>,
}

impl MerkleProof {
    /// Fold the sibling path starting from `leaf_hash` at `index`
    pub fn compute_root(&self, leaf_hash: &Digest32, index: usize) -> Digest32 {
        let mut current = *leaf_hash;
        let mut index = index;

        for sibling in &self.siblings {
            current = if index % 2 == 0 {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
            index /= 2;
        }

        current
    }
}

/// Root of `leaves`
pub fn compute_root<L: AsRef<[u8]>>(leaves: &[L]) -> Digest32 {
    MerkleTree::build(leaves).root()
}

/// Proof for `leaves[index]`; `None` when the index is out of range
pub fn prove_leaf<L: AsRef<[u8]>>(leaves: &[L], index: usize) -> Option<MerkleProof> {
    MerkleTree::build(leaves).proof(index)
}

/// Check that `leaf_hash` sits at `index` under `root`.
///
/// `leaf_hash` must come from [`hash_leaf`] with the same `index`.
///
/// Any mismatch or malformed proof yields `false`.
pub fn verify(root: &Digest32, proof: &MerkleProof, leaf_hash: &Digest32, index: usize) -> bool {
    if proof.leaf_index != index || &proof.leaf_hash != leaf_hash || &proof.root != root {
        return false;
    }
    // The index must address a leaf of a tree this deep.
    let depth = proof.siblings.len();
    if depth >= usize::BITS as usize || index >> depth != 0 {
        return false;
    }
    &proof.compute_root(leaf_hash, index) == root
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::{digest_from_hex, Digest32};

    pub fn serialize<S: Serializer>(digest: &Digest32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Digest32, D::Error> {
        let s = String::deserialize(deserializer)?;
        digest_from_hex(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_digest_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::{digest_from_hex, Digest32};

    pub fn serialize<S: Serializer>(digests: &[Digest32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(digests.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Digest32>, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        items
            .iter()
            .map(|s| digest_from_hex(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
