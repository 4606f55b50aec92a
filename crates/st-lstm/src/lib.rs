// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// crates/st-lstm/src/lib.rs
//! Single-layer LSTM sequence trainer.
//!
//! [`LstmEngine`] owns a weight set, the recurrent state and a
//! [`TensorPool`](st_tensor::TensorPool) over one [`MathBackend`]. It runs the
//! forward pass, a summed softmax cross-entropy loss, truncated
//! backpropagation through time, gradient clipping and plain SGD, and can
//! save itself to (and restore itself from) a JSON document.
//!
//! ```no_run
//! use st_lstm::{LstmConfig, LstmEngine, Targets, TrainingConfig};
//! use st_tensor::CpuBackend;
//!
//! # fn main() -> Result<(), st_lstm::EngineError> {
//! let mut engine = LstmEngine::new(
//!     CpuBackend::new(),
//!     LstmConfig::new(50, 8, 16, 50),
//!     TrainingConfig::default(),
//! )?;
//! let loss = engine.train_step(&[1, 2, 3], Targets::Indices(&[2, 3, 4]))?;
//! assert!(loss.is_finite());
//! # Ok(())
//! # }
//! ```
//!
//! [`MathBackend`]: st_tensor::MathBackend

mod context;
pub mod config;
pub mod engine;
pub mod error;
pub mod gradients;
pub mod io;
pub mod loss;
pub mod params;
pub mod sequence;

pub use config::{EngineConfig, LstmConfig, TrainingConfig};
pub use engine::{EnginePhase, EpochStats, ForwardOutput, LstmEngine, TrainingSample};
pub use error::{EngineError, EngineResult, PersistError};
pub use gradients::GradientSet;
pub use params::{Gate, ParamName, WeightSet};
pub use sequence::{one_hot, sequence_tensor, Targets};
