use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use infomesh_core::Action;
use infomesh_crypto::{canonical_entry_bytes, canonical_root_bytes, content_hash, sign_hex, verify_hex, CryptoError};
use infomesh_ledger::{CreditEntry, CreditLedger, LedgerError};
use rand::seq::index::sample as sample_indices;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

// --- Merkle tree (C7) -------------------------------------------------------

/// Membership proof for one leaf: the sibling hash and left/right
/// orientation at each level from leaf to root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipProof {
    pub leaf_index: usize,
    pub leaf_hash: String,
    /// `(sibling_hash, sibling_is_left)` per level, leaf to root.
    pub siblings: Vec<(String, bool)>,
    pub root_hash: String,
}

/// A Merkle tree over ordered hex leaf hashes. Internal nodes are
/// `SHA-256(left_hex || right_hex)`; an odd node at any layer is paired
/// with a duplicate of itself. The empty tree's root is the empty
/// string.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    layers: Vec<Vec<String>>,
}

impl MerkleTree {
    pub fn build(leaves: Vec<String>) -> Self {
        if leaves.is_empty() {
            return Self { layers: vec![Vec::new()] };
        }
        let mut layers = vec![leaves];
        while layers.last().unwrap().len() > 1 {
            let current = layers.last().unwrap();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            let mut i = 0;
            while i < current.len() {
                let left = &current[i];
                let right = current.get(i + 1).unwrap_or(left);
                next.push(node_hash(left, right));
                i += 2;
            }
            layers.push(next);
        }
        Self { layers }
    }

    pub fn root_hash(&self) -> String {
        self.layers.last().and_then(|l| l.first()).cloned().unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.layers.first().map(|l| l.len()).unwrap_or(0)
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MembershipProof> {
        let leaves = self.layers.first()?;
        if leaf_index >= leaves.len() {
            return None;
        }
        let leaf_hash = leaves[leaf_index].clone();
        let mut siblings = Vec::new();
        let mut idx = leaf_index;

        for layer in &self.layers[..self.layers.len() - 1] {
            let is_right_child = idx % 2 == 1;
            let sibling_idx = if is_right_child { idx - 1 } else { idx + 1 };
            let sibling = layer.get(sibling_idx).unwrap_or(&layer[idx]).clone();
            // sibling_is_left is true when our node is the right child.
            siblings.push((sibling, is_right_child));
            idx /= 2;
        }

        Some(MembershipProof { leaf_index, leaf_hash, siblings, root_hash: self.root_hash() })
    }
}

fn node_hash(left: &str, right: &str) -> String {
    content_hash(format!("{left}{right}").as_bytes())
}

/// Verify a membership proof independent of any particular tree
/// instance — recomputes the path from `leaf_hash` to `root_hash`.
pub fn verify_membership_proof(proof: &MembershipProof) -> bool {
    let mut current = proof.leaf_hash.clone();
    for (sibling, sibling_is_left) in &proof.siblings {
        current = if *sibling_is_left {
            node_hash(sibling, &current)
        } else {
            node_hash(&current, sibling)
        };
    }
    current == proof.root_hash
}

// --- Credit proof protocol (C8) ---------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditProof {
    pub peer_id: String,
    pub request_id: String,
    pub total_earned: f64,
    pub total_spent: f64,
    pub action_breakdown: HashMap<Action, f64>,
    pub entry_count: usize,
    pub merkle_root: String,
    pub root_signature: String,
    pub sample_entries: Vec<CreditEntry>,
    pub sample_proofs: Vec<MembershipProof>,
    pub timestamp: f64,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditVerificationResult {
    pub peer_id: String,
    pub verified: bool,
    pub total_earned: f64,
    pub entry_count: usize,
    pub valid_signatures: usize,
    pub invalid_signatures: usize,
    pub valid_proofs: usize,
    pub invalid_proofs: usize,
    pub merkle_root_valid: bool,
    pub detail: String,
}

/// Builds signed Merkle credit proofs from a node's signed ledger
/// entries, for P2P spot-check verification by other peers.
pub struct CreditProofBuilder<'a> {
    ledger: &'a CreditLedger,
    peer_id: String,
    secret_key: [u8; 32],
    public_key_hex: String,
}

impl<'a> CreditProofBuilder<'a> {
    pub fn new(ledger: &'a CreditLedger, peer_id: impl Into<String>, secret_key: [u8; 32], public_key_hex: impl Into<String>) -> Self {
        Self { ledger, peer_id: peer_id.into(), secret_key, public_key_hex: public_key_hex.into() }
    }

    pub async fn build_proof(&self, sample_size: usize, request_id: &str) -> Result<CreditProof, ProofError> {
        let entries = self.ledger.signed_entries().await?;
        if entries.is_empty() {
            return Ok(self.empty_proof(request_id));
        }

        let entry_hashes: Vec<String> = entries.iter().map(|e| e.entry_hash.clone()).collect();
        let tree = MerkleTree::build(entry_hashes);

        let root_payload = canonical_root_bytes(&tree.root_hash(), entries.len(), &self.peer_id);
        let root_signature = sign_hex(&self.secret_key, &root_payload)?;

        let indices = select_sample(entries.len(), sample_size);
        let mut sample_entries = Vec::with_capacity(indices.len());
        let mut sample_proofs = Vec::with_capacity(indices.len());
        for idx in indices {
            sample_entries.push(entries[idx].clone());
            if let Some(proof) = tree.proof(idx) {
                sample_proofs.push(proof);
            }
        }

        let mut breakdown: HashMap<Action, f64> = HashMap::new();
        for entry in &entries {
            *breakdown.entry(entry.action).or_insert(0.0) += entry.credits;
        }

        let stats = self.ledger.stats().await?;

        info!(
            event = "credit_proof_built",
            peer_id = %self.peer_id,
            entry_count = entries.len(),
            sample_size = sample_entries.len(),
            root = %&tree.root_hash()[..tree.root_hash().len().min(16)],
        );

        Ok(CreditProof {
            peer_id: self.peer_id.clone(),
            request_id: request_id.to_string(),
            total_earned: stats.total_earned,
            total_spent: stats.total_spent,
            action_breakdown: breakdown,
            entry_count: entries.len(),
            merkle_root: tree.root_hash(),
            root_signature,
            sample_entries,
            sample_proofs,
            timestamp: now(),
            public_key: self.public_key_hex.clone(),
        })
    }

    fn empty_proof(&self, request_id: &str) -> CreditProof {
        CreditProof {
            peer_id: self.peer_id.clone(),
            request_id: request_id.to_string(),
            total_earned: 0.0,
            total_spent: 0.0,
            action_breakdown: HashMap::new(),
            entry_count: 0,
            merkle_root: String::new(),
            root_signature: String::new(),
            sample_entries: Vec::new(),
            sample_proofs: Vec::new(),
            timestamp: now(),
            public_key: self.public_key_hex.clone(),
        }
    }
}

fn select_sample(total: usize, sample_size: usize) -> Vec<usize> {
    if total <= sample_size {
        return (0..total).collect();
    }
    let mut idx: Vec<usize> = sample_indices(&mut rand::thread_rng(), total, sample_size).into_vec();
    idx.sort_unstable();
    idx
}

/// Verify a credit proof received from a peer. Pure function — no
/// ledger or network access, only what's carried in `proof`.
///
/// Three checks compose the result: the Merkle root's signature, each
/// sampled entry's signature and recomputed hash, and each sampled
/// entry's Merkle membership proof. An empty ledger (`entry_count == 0`)
/// is trivially valid.
pub fn verify_credit_proof(proof: &CreditProof) -> CreditVerificationResult {
    if proof.entry_count == 0 {
        return CreditVerificationResult {
            peer_id: proof.peer_id.clone(),
            verified: true,
            total_earned: 0.0,
            entry_count: 0,
            valid_signatures: 0,
            invalid_signatures: 0,
            valid_proofs: 0,
            invalid_proofs: 0,
            merkle_root_valid: true,
            detail: "empty_ledger".to_string(),
        };
    }

    let root_payload = canonical_root_bytes(&proof.merkle_root, proof.entry_count, &proof.peer_id);
    let merkle_root_valid = verify_hex(&proof.public_key, &root_payload, &proof.root_signature).unwrap_or(false);

    let mut valid_sigs = 0usize;
    let mut invalid_sigs = 0usize;
    let mut valid_proofs_count = 0usize;
    let mut invalid_proofs_count = 0usize;

    for (i, entry) in proof.sample_entries.iter().enumerate() {
        let canonical = canonical_entry_bytes(
            entry.action,
            entry.quantity,
            entry.weight,
            entry.multiplier,
            entry.credits,
            entry.timestamp,
            &entry.note,
        );
        let expected_hash = content_hash(&canonical);

        if expected_hash != entry.entry_hash {
            invalid_sigs += 1;
            continue;
        }

        let sig_valid = match &entry.signature {
            Some(sig) => verify_hex(&proof.public_key, &canonical, sig).unwrap_or(false),
            None => false,
        };
        if sig_valid {
            valid_sigs += 1;
        } else {
            invalid_sigs += 1;
        }

        if let Some(membership) = proof.sample_proofs.get(i) {
            if verify_membership_proof(membership) && membership.root_hash == proof.merkle_root {
                valid_proofs_count += 1;
            } else {
                invalid_proofs_count += 1;
            }
        }
    }

    let verified = merkle_root_valid
        && invalid_sigs == 0
        && invalid_proofs_count == 0
        && (valid_sigs > 0 || proof.sample_entries.is_empty());

    let mut details = Vec::new();
    if !merkle_root_valid {
        details.push("merkle_root_signature_invalid".to_string());
    }
    if invalid_sigs > 0 {
        details.push(format!("invalid_entry_signatures={invalid_sigs}"));
    }
    if invalid_proofs_count > 0 {
        details.push(format!("invalid_merkle_proofs={invalid_proofs_count}"));
    }
    let detail = if details.is_empty() { "ok".to_string() } else { details.join("; ") };

    let result = CreditVerificationResult {
        peer_id: proof.peer_id.clone(),
        verified,
        total_earned: proof.total_earned,
        entry_count: proof.entry_count,
        valid_signatures: valid_sigs,
        invalid_signatures: invalid_sigs,
        valid_proofs: valid_proofs_count,
        invalid_proofs: invalid_proofs_count,
        merkle_root_valid,
        detail,
    };

    info!(
        event = "credit_proof_verified",
        peer_id = %result.peer_id,
        verified = result.verified,
        valid_sigs = result.valid_signatures,
        invalid_sigs = result.invalid_signatures,
        detail = %result.detail,
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_has_empty_root() {
        let tree = MerkleTree::build(Vec::new());
        assert_eq!(tree.root_hash(), "");
    }

    #[test]
    fn single_leaf_root_is_the_leaf() {
        let tree = MerkleTree::build(vec!["abc".to_string()]);
        assert_eq!(tree.root_hash(), "abc");
    }

    #[test]
    fn odd_layer_duplicates_last_node() {
        let leaves = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let tree = MerkleTree::build(leaves);
        let expected_layer1_2 = node_hash("c", "c");
        let expected_root = node_hash(&node_hash("a", "b"), &expected_layer1_2);
        assert_eq!(tree.root_hash(), expected_root);
    }

    #[test]
    fn every_leaf_has_a_valid_proof() {
        let leaves: Vec<String> = (0..7).map(|i| format!("leaf-{i}")).collect();
        let tree = MerkleTree::build(leaves.clone());
        for i in 0..leaves.len() {
            let proof = tree.proof(i).unwrap();
            assert!(verify_membership_proof(&proof));
            assert_eq!(proof.root_hash, tree.root_hash());
        }
    }

    #[test]
    fn tampered_proof_fails_verification() {
        let leaves: Vec<String> = (0..4).map(|i| format!("leaf-{i}")).collect();
        let tree = MerkleTree::build(leaves);
        let mut proof = tree.proof(1).unwrap();
        proof.leaf_hash = "tampered".to_string();
        assert!(!verify_membership_proof(&proof));
    }

    #[test]
    fn empty_proof_is_trivially_verified() {
        let proof = CreditProof {
            peer_id: "peer".to_string(),
            request_id: String::new(),
            total_earned: 0.0,
            total_spent: 0.0,
            action_breakdown: HashMap::new(),
            entry_count: 0,
            merkle_root: String::new(),
            root_signature: String::new(),
            sample_entries: Vec::new(),
            sample_proofs: Vec::new(),
            timestamp: 0.0,
            public_key: String::new(),
        };
        let result = verify_credit_proof(&proof);
        assert!(result.verified);
        assert_eq!(result.detail, "empty_ledger");
    }

    #[test]
    fn mutated_entry_hash_marks_invalid_signature() {
        let keys = infomesh_crypto::generate_ed25519();
        let canonical = canonical_entry_bytes(Action::Crawl, 1.0, 1.0, 1.0, 1.0, 100.0, "");
        let entry_hash = content_hash(&canonical);
        let signature = sign_hex(&keys.secret_key, &canonical).unwrap();

        let entry = CreditEntry {
            entry_id: 1,
            action: Action::Crawl,
            quantity: 1.0,
            weight: 1.0,
            multiplier: 1.0,
            credits: 1.0,
            timestamp: 100.0,
            note: String::new(),
            entry_hash: entry_hash.clone(),
            signature: Some(signature),
        };
        let tree = MerkleTree::build(vec![entry_hash]);
        let membership = tree.proof(0).unwrap();
        let root_payload = canonical_root_bytes(&tree.root_hash(), 1, "peer");
        let root_signature = sign_hex(&keys.secret_key, &root_payload).unwrap();

        let mut proof = CreditProof {
            peer_id: "peer".to_string(),
            request_id: String::new(),
            total_earned: 1.0,
            total_spent: 0.0,
            action_breakdown: HashMap::new(),
            entry_count: 1,
            merkle_root: tree.root_hash(),
            root_signature,
            sample_entries: vec![entry],
            sample_proofs: vec![membership],
            timestamp: 100.0,
            public_key: keys.public_key_hex(),
        };

        let ok = verify_credit_proof(&proof);
        assert!(ok.verified);

        // Mutate one byte of the entry's note — hash no longer matches.
        proof.sample_entries[0].note = "x".to_string();
        let tampered = verify_credit_proof(&proof);
        assert_eq!(tampered.invalid_signatures, 1);
        assert!(!tampered.verified);
    }
}
