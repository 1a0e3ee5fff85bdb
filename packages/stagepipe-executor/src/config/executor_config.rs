//! Executor configuration
//!
//! Built in code through the setters below or loaded from a versioned YAML
//! file:
//!
//! ```yaml
//! version: 1
//! executor:
//!   max_batch_size: 64
//!   executor_type: async_separated
//!   queue_depths: { cpu: 3, gpu: 2 }
//! ```

use super::error::{ConfigError, ConfigResult};
use crate::queue_policy::QueueSizes;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

pub const MAX_BATCH_SIZE_LIMIT: usize = 65_536;
pub const MAX_THREADS: usize = 1_024;
pub const MAX_QUEUE_DEPTH: usize = 64;

/// Trait for validatable configuration objects
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    /// Name used in error messages
    fn config_name(&self) -> &'static str {
        "Config"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    /// Synchronous, one iteration in flight
    Simple,
    /// Synchronous, one queue depth shared by all stages
    Pipelined,
    /// Synchronous, independent CPU and device queue depths
    Separated,
    /// Stage worker threads, one queue depth shared by all stages
    AsyncPipelined,
    /// Stage worker threads, independent CPU and device queue depths
    AsyncSeparated,
}

impl ExecutorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorType::Simple => "simple",
            ExecutorType::Pipelined => "pipelined",
            ExecutorType::Separated => "separated",
            ExecutorType::AsyncPipelined => "async_pipelined",
            ExecutorType::AsyncSeparated => "async_separated",
        }
    }

    pub fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "simple" => Ok(ExecutorType::Simple),
            "pipelined" => Ok(ExecutorType::Pipelined),
            "separated" => Ok(ExecutorType::Separated),
            "async_pipelined" => Ok(ExecutorType::AsyncPipelined),
            "async_separated" => Ok(ExecutorType::AsyncSeparated),
            _ => Err(ConfigError::UnknownExecutorType(s.to_string())),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, ExecutorType::AsyncPipelined | ExecutorType::AsyncSeparated)
    }

    pub fn is_separated(&self) -> bool {
        matches!(self, ExecutorType::Separated | ExecutorType::AsyncSeparated)
    }
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a stage does with its remaining operators after one fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    StopOnError,
    /// Run the rest of the stage so every failing operator gets reported
    ContinueStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub max_batch_size: usize,
    pub num_threads: usize,
    /// `None` runs MIXED and GPU operators synchronously on the host
    pub device_id: Option<u32>,
    /// Byte hint for outputs that do not declare one
    pub bytes_per_sample_hint: usize,
    pub queue_depths: QueueSizes,
    pub executor_type: ExecutorType,
    pub enable_memory_stats: bool,
    pub enable_checkpointing: bool,
    pub error_policy: ErrorPolicy,
    pub restrict_pinned_memory: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            num_threads: default_num_threads(),
            device_id: None,
            bytes_per_sample_hint: 0,
            queue_depths: QueueSizes::default(),
            executor_type: ExecutorType::AsyncPipelined,
            enable_memory_stats: false,
            enable_checkpointing: false,
            error_policy: ErrorPolicy::StopOnError,
            restrict_pinned_memory: false,
        }
    }
}

fn default_num_threads() -> usize {
    (num_cpus::get() * 3 / 4).max(1)
}

impl ExecutorConfig {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size,
            ..Self::default()
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn device_id(mut self, id: Option<u32>) -> Self {
        self.device_id = id;
        self
    }

    pub fn bytes_per_sample_hint(mut self, hint: usize) -> Self {
        self.bytes_per_sample_hint = hint;
        self
    }

    pub fn queue_depths(mut self, cpu: usize, gpu: usize) -> Self {
        self.queue_depths = QueueSizes::new(cpu, gpu);
        self
    }

    pub fn executor_type(mut self, t: ExecutorType) -> Self {
        self.executor_type = t;
        self
    }

    pub fn memory_stats(mut self, enable: bool) -> Self {
        self.enable_memory_stats = enable;
        self
    }

    pub fn checkpointing(mut self, enable: bool) -> Self {
        self.enable_checkpointing = enable;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn restrict_pinned_memory(mut self, restrict: bool) -> Self {
        self.restrict_pinned_memory = restrict;
        self
    }

    /// Depths actually used: the simple executor never overlaps iterations
    pub fn effective_queue_depths(&self) -> QueueSizes {
        match self.executor_type {
            ExecutorType::Simple => QueueSizes::uniform(1),
            _ => self.queue_depths,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let version = value
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or(ConfigError::MissingVersion)? as u32;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        let file: ConfigFileV1 = serde_yaml::from_value(value)?;
        file.executor.validate()?;
        Ok(file.executor)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(&ConfigFileV1 {
            version: 1,
            executor: self.clone(),
        })?)
    }

    pub fn save_yaml(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

/// YAML Schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFileV1 {
    version: u32,
    executor: ExecutorConfig,
}

impl Validatable for ExecutorConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(ConfigError::range_with_hint(
                "max_batch_size",
                self.max_batch_size,
                1,
                MAX_BATCH_SIZE_LIMIT,
                "The executor needs a positive batch size to size its buffers",
            ));
        }
        if self.num_threads == 0 || self.num_threads > MAX_THREADS {
            return Err(ConfigError::range_with_hint(
                "num_threads",
                self.num_threads,
                1,
                MAX_THREADS,
                "Use at least one operator thread",
            ));
        }
        for (field, depth) in [
            ("queue_depths.cpu", self.queue_depths.cpu),
            ("queue_depths.gpu", self.queue_depths.gpu),
        ] {
            if depth == 0 || depth > MAX_QUEUE_DEPTH {
                return Err(ConfigError::range_with_hint(
                    field,
                    depth,
                    1,
                    MAX_QUEUE_DEPTH,
                    "Every stage needs at least one buffer slot",
                ));
            }
        }
        let uniform = matches!(
            self.executor_type,
            ExecutorType::Pipelined | ExecutorType::AsyncPipelined
        );
        if uniform && self.queue_depths.cpu != self.queue_depths.gpu {
            return Err(ConfigError::conflict(
                format!(
                    "{} executor with different CPU ({}) and GPU ({}) queue depths",
                    self.executor_type, self.queue_depths.cpu, self.queue_depths.gpu
                ),
                "use a separated executor type or equal depths",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "ExecutorConfig"
    }
}
