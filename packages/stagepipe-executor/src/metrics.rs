//! Prometheus export of executor memory statistics

use crate::error::{ExecutorError, Result};
use crate::stats::ExecutorMetaMap;
use prometheus::{IntGaugeVec, Opts, Registry};

pub struct MemoryStatsExporter {
    registry: Registry,
    real_size: IntGaugeVec,
    max_real_size: IntGaugeVec,
    reserved: IntGaugeVec,
    max_reserved: IntGaugeVec,
}

impl MemoryStatsExporter {
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(
                Opts::new(name, help).namespace("stagepipe"),
                &["operator", "output"],
            )
            .map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };
        Ok(Self {
            real_size: gauge("output_real_bytes", "Bytes used by an operator output")?,
            max_real_size: gauge("output_max_sample_bytes", "Largest sample of an operator output")?,
            reserved: gauge("output_reserved_bytes", "Bytes reserved for an operator output")?,
            max_reserved: gauge(
                "output_max_sample_reserved_bytes",
                "Largest per-sample reservation of an operator output",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn publish(&self, meta: &ExecutorMetaMap) {
        for (operator, outputs) in meta {
            for (idx, stats) in outputs.iter().enumerate() {
                let idx = idx.to_string();
                let labels = [operator.as_str(), idx.as_str()];
                self.real_size
                    .with_label_values(&labels)
                    .set(stats.real_size as i64);
                self.max_real_size
                    .with_label_values(&labels)
                    .set(stats.max_real_size as i64);
                self.reserved
                    .with_label_values(&labels)
                    .set(stats.reserved as i64);
                self.max_reserved
                    .with_label_values(&labels)
                    .set(stats.max_reserved as i64);
            }
        }
    }
}

fn metrics_error(e: prometheus::Error) -> ExecutorError {
    ExecutorError::Internal(format!("metrics: {}", e))
}
