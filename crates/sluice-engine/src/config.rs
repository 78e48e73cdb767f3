//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sluice_core::{Result, SluiceError};
use sluice_kernels::TransferFn;

use crate::scheduler::SchedulerKind;

/// Runtime settings shared by every layer of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads executing forward and backward tasks.
    pub workers: usize,

    /// Ready-queue backend.
    pub scheduler: SchedulerKind,

    /// Activation applied after every layer.
    pub transfer: TransferFn,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            scheduler: SchedulerKind::default(),
            transfer: TransferFn::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl EngineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferFn) -> Self {
        self.transfer = transfer;
        self
    }

    /// Load a config from JSON. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SluiceError::Config("workers must be at least 1".into()));
        }
        if let TransferFn::HyperbolicTangent { a, b } = self.transfer {
            if a == 0.0 || !a.is_finite() || !b.is_finite() {
                return Err(SluiceError::Config(format!("invalid tanh parameters a={a} b={b}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.transfer, TransferFn::Sigmoid);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"workers": 3, "scheduler": "rayon"}"#).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.scheduler, SchedulerKind::Rayon);
        assert_eq!(config.transfer, TransferFn::default());
    }

    #[test]
    fn test_from_json_file() {
        let dir = std::env::temp_dir().join(format!("sluice-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.json");
        std::fs::write(&path, r#"{"workers": 2, "transfer": {"type": "rectify_linear"}}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.transfer, TransferFn::RectifyLinear);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_zero_workers_invalid() {
        let config = EngineConfig::default().with_workers(0);
        assert!(matches!(config.validate(), Err(SluiceError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_json_file("/nonexistent/sluice.json").unwrap_err();
        assert!(matches!(err, SluiceError::Io(_)));
    }
}
