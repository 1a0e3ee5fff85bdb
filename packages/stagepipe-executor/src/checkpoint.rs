use crate::error::{ExecutorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

const DIGEST_LEN: usize = 32;

/// Pipeline state between two iterations: one opaque blob per operator
/// instance, keyed by instance name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    /// Number of iterations completed before this snapshot
    pub iteration: u64,
    pub created_at: DateTime<Utc>,
    pub op_states: BTreeMap<String, Vec<u8>>,
}

impl Checkpoint {
    pub fn new(iteration: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            iteration,
            created_at: Utc::now(),
            op_states: BTreeMap::new(),
        }
    }

    pub fn set_op_state(&mut self, instance_name: &str, state: Vec<u8>) {
        self.op_states.insert(instance_name.to_string(), state);
    }

    pub fn op_state(&self, instance_name: &str) -> Option<&[u8]> {
        self.op_states.get(instance_name).map(Vec::as_slice)
    }

    pub fn num_ops(&self) -> usize {
        self.op_states.len()
    }

    /// bincode payload prefixed with its SHA-256 digest
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(DIGEST_LEN + payload.len());
        out.extend_from_slice(&Sha256::digest(&payload));
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DIGEST_LEN {
            return Err(ExecutorError::checkpoint(format!(
                "Checkpoint too short: {} bytes",
                bytes.len()
            )));
        }
        let (digest, payload) = bytes.split_at(DIGEST_LEN);
        if Sha256::digest(payload).as_slice() != digest {
            return Err(ExecutorError::checkpoint("Checkpoint digest mismatch"));
        }
        Ok(bincode::deserialize(payload)?)
    }
}

/// Retains checkpoints handed over by the caller
pub struct CheckpointStore {
    checkpoints: Arc<parking_lot::Mutex<Vec<Checkpoint>>>,
}

impl CheckpointStore {
    pub fn new_in_memory() -> Self {
        Self {
            checkpoints: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// Save checkpoint
    pub fn save(&self, checkpoint: Checkpoint) {
        let mut checkpoints = self.checkpoints.lock();

        // Replace a checkpoint taken at the same iteration
        checkpoints.retain(|cp| cp.iteration != checkpoint.iteration);

        checkpoints.push(checkpoint);
    }

    pub fn load(&self, id: Uuid) -> Option<Checkpoint> {
        self.checkpoints.lock().iter().find(|cp| cp.id == id).cloned()
    }

    pub fn load_at(&self, iteration: u64) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .iter()
            .find(|cp| cp.iteration == iteration)
            .cloned()
    }

    /// Checkpoint with the highest iteration
    pub fn latest(&self) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .iter()
            .max_by_key(|cp| cp.iteration)
            .cloned()
    }

    pub fn iterations(&self) -> Vec<u64> {
        let mut its: Vec<u64> = self.checkpoints.lock().iter().map(|cp| cp.iteration).collect();
        its.sort_unstable();
        its
    }

    /// Drop checkpoints older than `iteration`
    pub fn prune_before(&self, iteration: u64) -> usize {
        let mut checkpoints = self.checkpoints.lock();
        let before = checkpoints.len();
        checkpoints.retain(|cp| cp.iteration >= iteration);
        before - checkpoints.len()
    }

    pub fn clear(&self) {
        self.checkpoints.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.lock().is_empty()
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(iteration: u64) -> Checkpoint {
        let mut cp = Checkpoint::new(iteration);
        cp.set_op_state("reader", iteration.to_le_bytes().to_vec());
        cp.set_op_state("decoder", Vec::new());
        cp
    }

    #[test]
    fn test_serialize_roundtrip() {
        let cp = sample(4);
        let bytes = cp.serialize().unwrap();
        let restored = Checkpoint::deserialize(&bytes).unwrap();
        assert_eq!(restored, cp);
        assert_eq!(restored.op_state("reader"), Some(&4u64.to_le_bytes()[..]));
    }

    #[test]
    fn test_tampered_checkpoint_rejected() {
        let mut bytes = sample(1).serialize().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Checkpoint::deserialize(&bytes),
            Err(ExecutorError::Checkpoint(_))
        ));
        assert!(Checkpoint::deserialize(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_store_replaces_same_iteration() {
        let store = CheckpointStore::new_in_memory();
        store.save(sample(1));
        store.save(sample(2));
        let replacement = sample(1);
        let id = replacement.id;
        store.save(replacement);

        assert_eq!(store.len(), 2);
        assert_eq!(store.load_at(1).unwrap().id, id);
        assert_eq!(store.latest().unwrap().iteration, 2);
        assert_eq!(store.iterations(), vec![1, 2]);
    }

    #[test]
    fn test_store_prune() {
        let store = CheckpointStore::new_in_memory();
        for i in 0..5 {
            store.save(sample(i));
        }
        assert_eq!(store.prune_before(3), 3);
        assert_eq!(store.iterations(), vec![3, 4]);
        store.clear();
        assert!(store.is_empty());
    }
}
