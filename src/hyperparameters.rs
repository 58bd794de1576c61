use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::model::ModelConfig;
use crate::registry::Architecture;
use crate::{Error, Result};

/// Run parameters, resolved once at startup and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// Training batch size. Batches arrive pre-built, so this only shapes the loader.
    pub batch_size: usize,

    /// Evaluation batch size, same caveat as `batch_size`.
    pub test_batch_size: usize,

    /// Number of training epochs
    pub epochs: usize,

    /// Initial Adam learning rate
    pub learning_rate: f64,

    /// Per-epoch learning-rate decay factor
    pub gamma: f64,

    /// Batches between progress lines
    pub log_interval: usize,

    pub seed: u64,

    /// Disables accelerator use even when one would be available
    pub no_cuda: bool,

    /// Write a parameter snapshot at the end of the run
    pub save_model: bool,

    pub architecture: Architecture,

    pub model: ModelConfig,

    pub metrics_path: PathBuf,

    pub checkpoint_path: PathBuf,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            batch_size: 128,
            test_batch_size: 1000,
            epochs: 50,
            learning_rate: 1.0,
            gamma: 0.7,
            log_interval: 2,
            seed: 1,
            no_cuda: false,
            save_model: false,
            architecture: Architecture::default(),
            model: ModelConfig::default(),
            metrics_path: PathBuf::from("Results/Lossframe.csv"),
            checkpoint_path: PathBuf::from("HtoA.ckpt"),
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.epochs == 0 {
            return invalid("epochs must be at least 1".to_string());
        }
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return invalid("batch sizes must be positive".to_string());
        }
        if self.log_interval == 0 {
            return invalid("log interval must be positive".to_string());
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return invalid(format!("learning rate {} is not a finite non-negative number", self.learning_rate));
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return invalid(format!("gamma {} is outside (0, 1]", self.gamma));
        }
        self.model.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn device(&self) -> Device {
        Device::resolve(self.no_cuda)
    }
}

/// Where tensor arithmetic runs. Only the CPU backend is compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
}

impl Device {
    pub fn resolve(no_cuda: bool) -> Self {
        if !no_cuda {
            warn!("no accelerator backend available, falling back to cpu");
        }
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}
