//! Commit-reveal codec.
//!
//! A request is bound to a seed before the provider sees it: only
//! `SHA-256(seed)` travels with the submission. The final random value mixes
//! the revealed seed with the provider's contribution, so neither side can
//! choose the outcome alone.

use crate::types::{Address, Hash32, RequestId};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

const RANDOM_VALUE_DOMAIN: &[u8] = b"fairwager:random";

/// Commit to a seed. Pure and deterministic.
pub fn commit(seed: &[u8]) -> Hash32 {
    Sha256::digest(seed).into()
}

/// True iff `candidate_seed` hashes to `commitment`.
pub fn verify(commitment: &Hash32, candidate_seed: &[u8]) -> bool {
    let computed = commit(candidate_seed);
    // Compare every byte so timing does not leak the matching prefix.
    computed
        .iter()
        .zip(commitment.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Authoritative random value for a verified fulfillment.
///
/// ```text
/// value = SHA-256("fairwager:random" || seed || provider_random)
/// ```
pub fn derive_random_value(revealed_seed: &Hash32, provider_random: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(RANDOM_VALUE_DOMAIN);
    hasher.update(revealed_seed);
    hasher.update(provider_random);
    hasher.finalize().into()
}

/// Deterministic request id from requester, per-requester nonce and a
/// timestamp salt.
pub fn derive_request_id(requester: &Address, nonce: u64, salt: u64) -> RequestId {
    let mut hasher = Sha256::new();
    hasher.update(requester.as_str().as_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.update(salt.to_be_bytes());
    let digest: Hash32 = hasher.finalize().into();
    RequestId::from_digest(&digest)
}

/// A freshly generated seed together with its commitment.
#[derive(Clone)]
pub struct SeedCommitment {
    pub seed: Hash32,
    pub commitment: Hash32,
}

impl SeedCommitment {
    /// Draw a seed from the operating system RNG and commit to it.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: Hash32) -> Self {
        Self {
            commitment: commit(&seed),
            seed,
        }
    }
}

impl std::fmt::Debug for SeedCommitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedCommitment")
            .field("commitment", &hex::encode(self.commitment))
            .finish_non_exhaustive()
    }
}
