use serde::{Deserialize, Serialize};

use cannon_primitives::Hash;

/// Everything an on-chain verifier needs to replay a single step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepWitness {
    /// Encoded pre-state.
    pub state: Vec<u8>,
    pub state_hash: Hash,
    /// Thread proof (multi-threaded only), the instruction proof and up to two memory proofs.
    pub proof_data: Vec<u8>,

    /// The preimage read during the step, if any.
    pub preimage_key: Option<Hash>,
    /// Preimage bytes with their 8-byte big-endian length prefix.
    pub preimage_value: Option<Vec<u8>>,
    pub preimage_offset: Option<u64>,
}

impl StepWitness {
    #[must_use]
    pub fn has_preimage(&self) -> bool {
        self.preimage_key.is_some()
    }
}
