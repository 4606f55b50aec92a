// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Hyperparameters and training knobs.
//!
//! Both structs deserialize from JSON with defaults for missing fields and can
//! be overridden from `SPIRAL_LSTM_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};
use spiral_config::env::{override_with, parse};
use spiral_config::ConfigError;
use st_tensor::CpuBackend;

/// The four sizes that fix every weight shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LstmConfig {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
}

impl Default for LstmConfig {
    fn default() -> Self {
        Self::new(50, 8, 16, 50)
    }
}

impl LstmConfig {
    pub const fn new(
        vocab_size: usize,
        embedding_size: usize,
        hidden_size: usize,
        output_size: usize,
    ) -> Self {
        Self {
            vocab_size,
            embedding_size,
            hidden_size,
            output_size,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("embedding_size", self.embedding_size),
            ("hidden_size", self.hidden_size),
            ("output_size", self.output_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Applies `SPIRAL_LSTM_{VOCAB,EMBEDDING,HIDDEN,OUTPUT}_SIZE`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_with(&mut self.vocab_size, "SPIRAL_LSTM_VOCAB_SIZE")?;
        override_with(&mut self.embedding_size, "SPIRAL_LSTM_EMBEDDING_SIZE")?;
        override_with(&mut self.hidden_size, "SPIRAL_LSTM_HIDDEN_SIZE")?;
        override_with(&mut self.output_size, "SPIRAL_LSTM_OUTPUT_SIZE")?;
        Ok(())
    }
}

/// Optimiser and backpropagation settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    /// Lower bound every gradient element is clipped to.
    pub clip_min: f32,
    /// Upper bound every gradient element is clipped to.
    pub clip_max: f32,
    /// Steps per truncated-BPTT chunk. `None` backpropagates through the
    /// whole sequence.
    pub bptt_window: Option<usize>,
    /// Seed for weight initialisation.
    pub seed: u64,
    /// `m·k·n` volume from which the CPU backend parallelises matmul.
    pub parallel_matmul_volume: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            clip_min: -5.0,
            clip_max: 5.0,
            bptt_window: None,
            seed: spiral_config::determinism::base_seed(),
            parallel_matmul_volume: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.clip_min <= self.clip_max) {
            return Err(ConfigError::Invalid(format!(
                "clip range [{}, {}] is inverted",
                self.clip_min, self.clip_max
            )));
        }
        if self.bptt_window == Some(0) {
            return Err(ConfigError::Invalid("bptt_window must be positive".into()));
        }
        Ok(())
    }

    /// Applies the `SPIRAL_LSTM_*` training overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_with(&mut self.learning_rate, "SPIRAL_LSTM_LEARNING_RATE")?;
        override_with(&mut self.clip_min, "SPIRAL_LSTM_CLIP_MIN")?;
        override_with(&mut self.clip_max, "SPIRAL_LSTM_CLIP_MAX")?;
        override_with(&mut self.seed, "SPIRAL_LSTM_SEED")?;
        if let Some(window) = parse::<usize>("SPIRAL_LSTM_BPTT_WINDOW")? {
            self.bptt_window = Some(window);
        }
        if let Some(volume) = parse::<usize>("SPIRAL_LSTM_PARALLEL_VOLUME")? {
            self.parallel_matmul_volume = Some(volume);
        }
        Ok(())
    }

    /// CPU backend honouring `parallel_matmul_volume`.
    pub fn cpu_backend(&self) -> CpuBackend {
        match self.parallel_matmul_volume {
            Some(volume) => CpuBackend::new().with_parallel_volume(volume),
            None => CpuBackend::new(),
        }
    }
}

/// A full configuration file: `{ "model": {...}, "training": {...} }`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: LstmConfig,
    pub training: TrainingConfig,
}

impl EngineConfig {
    /// Defaults, then environment overrides, then validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file, then applies environment overrides and validates.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let mut config: Self = serde_json::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.model.apply_env()?;
        self.training.apply_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        self.training.validate()
    }
}
