//! Executor configuration
//!
//! - `ExecutorConfig`: batch size, threads, device, queue depths, executor
//!   type and feature switches
//! - `Validatable`: range and consistency checks with remediation hints
//! - YAML load/save with a versioned schema

pub mod error;
pub mod executor_config;

pub use error::{ConfigError, ConfigResult};
pub use executor_config::{
    ErrorPolicy, ExecutorConfig, ExecutorType, Validatable, MAX_BATCH_SIZE_LIMIT, MAX_QUEUE_DEPTH,
    MAX_THREADS, SUPPORTED_VERSIONS,
};
