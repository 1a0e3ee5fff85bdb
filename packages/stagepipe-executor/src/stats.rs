//! Per-operator output memory statistics
//!
//! Each stage writes into its own map, so stage threads never contend with
//! each other. Maps are merged only when statistics are read.

use crate::error::{ExecutorError, Result};
use crate::graph::OpType;
use crate::tensor::TensorHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Memory figures of one operator output, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub real_size: usize,
    pub max_real_size: usize,
    pub reserved: usize,
    pub max_reserved: usize,
}

impl MemoryStats {
    fn merge_max(&mut self, other: &MemoryStats) {
        self.real_size = self.real_size.max(other.real_size);
        self.max_real_size = self.max_real_size.max(other.max_real_size);
        self.reserved = self.reserved.max(other.reserved);
        self.max_reserved = self.max_reserved.max(other.max_reserved);
    }
}

/// Operator key -> stats per output
pub type ExecutorMetaMap = BTreeMap<String, Vec<MemoryStats>>;

/// Stats key of an operator: `<STAGE>_<instance name>`
pub fn stats_key(stage: OpType, instance_name: &str) -> String {
    format!("{}_{}", stage, instance_name)
}

#[derive(Debug, Default)]
pub struct MemoryStatsCollector {
    enabled: AtomicBool,
    stages: [Mutex<ExecutorMetaMap>; 3],
}

impl MemoryStatsCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            stages: Default::default(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Fold the current sizes of an operator's outputs into its stage map
    pub fn record(&self, stage: OpType, instance_name: &str, outputs: &[TensorHandle]) {
        if !self.is_enabled() {
            return;
        }
        let current: Vec<MemoryStats> = outputs
            .iter()
            .map(|handle| {
                let tl = handle.read();
                let (max_real, max_reserved) = tl.max_sizes();
                MemoryStats {
                    real_size: tl.nbytes(),
                    max_real_size: max_real,
                    reserved: tl.capacity(),
                    max_reserved,
                }
            })
            .collect();

        let mut map = self.stages[stage.index()].lock();
        let entry = map
            .entry(stats_key(stage, instance_name))
            .or_insert_with(|| vec![MemoryStats::default(); current.len()]);
        if entry.len() < current.len() {
            entry.resize(current.len(), MemoryStats::default());
        }
        for (acc, now) in entry.iter_mut().zip(&current) {
            acc.merge_max(now);
        }
    }

    /// Merged snapshot of all stages
    pub fn snapshot(&self) -> ExecutorMetaMap {
        let mut merged = ExecutorMetaMap::new();
        for stage in &self.stages {
            let map = stage.lock();
            for (key, stats) in map.iter() {
                merged.insert(key.clone(), stats.clone());
            }
        }
        merged
    }

    pub fn clear(&self) {
        for stage in &self.stages {
            stage.lock().clear();
        }
    }
}

pub fn meta_to_json(meta: &ExecutorMetaMap) -> Result<String> {
    serde_json::to_string_pretty(meta).map_err(ExecutorError::serialization)
}
