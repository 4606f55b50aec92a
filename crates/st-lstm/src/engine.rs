// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fmt;

use st_tensor::{MathBackend, PoolStats, TensorHandle, TensorPool};

use crate::config::{LstmConfig, TrainingConfig};
use crate::context::{ForwardContext, RecurrentState};
use crate::error::{EngineError, EngineResult};
use crate::gradients::GradientSet;
use crate::loss::sequence_cross_entropy;
use crate::params::{ParamName, WeightSet};
use crate::sequence::{sequence_tensor, Targets};

/// Where the engine is inside a training call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnginePhase {
    #[default]
    Idle,
    Forward,
    Loss,
    Backward,
    Applied,
}

fn enter(phase: &mut EnginePhase, next: EnginePhase) {
    tracing::trace!(from = ?*phase, to = ?next, "engine phase");
    *phase = next;
}

/// Result of [`LstmEngine::forward`].
#[derive(Debug)]
pub struct ForwardOutput<T> {
    /// `[len, output]` softmax rows, owned by the caller.
    pub predictions: T,
    /// Summed cross-entropy, present when targets were supplied.
    pub loss: Option<f32>,
}

/// One supervised sequence for [`LstmEngine::fit`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrainingSample {
    pub tokens: Vec<usize>,
    pub targets: Vec<usize>,
}

impl TrainingSample {
    pub fn new(tokens: Vec<usize>, targets: Vec<usize>) -> Self {
        Self { tokens, targets }
    }
}

/// Summary of one pass over the training samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub mean_loss: f32,
    pub samples: usize,
    /// Pool reuse rate observed at the end of the epoch.
    pub reuse_rate: f64,
}

/// LSTM trainer over one math backend.
///
/// Owns the weights, the recurrent state and a tensor pool. Every call starts
/// from a zeroed recurrent state. Dropping the engine runs [`teardown`](Self::teardown).
pub struct LstmEngine<B: MathBackend> {
    config: LstmConfig,
    training: TrainingConfig,
    pool: TensorPool<B>,
    weights: WeightSet<B::Tensor>,
    state: Option<RecurrentState<B::Tensor>>,
    phase: EnginePhase,
}

impl<B: MathBackend> fmt::Debug for LstmEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LstmEngine")
            .field("backend", &self.backend().name())
            .field("config", &self.config)
            .field("training", &self.training)
            .field("phase", &self.phase)
            .field("live", &self.is_live())
            .finish()
    }
}

impl<B: MathBackend> LstmEngine<B> {
    /// Builds an engine with freshly initialised weights.
    pub fn new(backend: B, config: LstmConfig, training: TrainingConfig) -> EngineResult<Self> {
        config.validate()?;
        training.validate()?;
        let weights = WeightSet::initialise(&backend, &config, training.seed)?;
        Self::from_parts(backend, config, training, weights)
    }

    /// Builds an engine around existing weights. Shapes must match `config`.
    pub fn from_parts(
        backend: B,
        config: LstmConfig,
        training: TrainingConfig,
        weights: WeightSet<B::Tensor>,
    ) -> EngineResult<Self> {
        config.validate()?;
        training.validate()?;
        for name in ParamName::ALL {
            let tensor = weights.get(name)?;
            let expected = name.shape(&config);
            if tensor.shape() != &expected {
                return Err(st_tensor::TensorError::shape_mismatch(
                    "load_weight",
                    tensor.shape(),
                    &expected,
                )
                .into());
            }
        }
        let state = RecurrentState::zeros(&backend, config.hidden_size)?;
        tracing::debug!(
            backend = backend.name(),
            vocab = config.vocab_size,
            embedding = config.embedding_size,
            hidden = config.hidden_size,
            output = config.output_size,
            "lstm engine ready"
        );
        Ok(Self {
            config,
            training,
            pool: TensorPool::new(backend),
            weights,
            state: Some(state),
            phase: EnginePhase::Idle,
        })
    }

    pub fn backend(&self) -> &B {
        self.pool.backend()
    }

    pub fn config(&self) -> &LstmConfig {
        &self.config
    }

    pub fn training(&self) -> &TrainingConfig {
        &self.training
    }

    pub fn training_mut(&mut self) -> &mut TrainingConfig {
        &mut self.training
    }

    pub fn weights(&self) -> &WeightSet<B::Tensor> {
        &self.weights
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// False once [`teardown`](Self::teardown) has run.
    pub fn is_live(&self) -> bool {
        self.state.is_some()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Hands a tensor produced by this engine (for example forward
    /// predictions) back to the pool for reuse.
    pub fn recycle(&self, tensor: B::Tensor) {
        self.pool.recycle(tensor);
    }

    /// Releases idle pooled tensors. Returns how many were released.
    pub fn trim_pool(&mut self) -> usize {
        self.pool.trim()
    }

    /// Host copy of one weight.
    pub fn weight_to_host(&self, name: ParamName) -> EngineResult<Vec<f32>> {
        Ok(self.backend().to_host(self.weights.get(name)?)?)
    }

    /// Overwrites one weight from host data of the same shape.
    pub fn set_weight_from_host(&mut self, name: ParamName, data: &[f32]) -> EngineResult<()> {
        let backend = self.pool.backend();
        let target = self.weights.get_mut(name)?;
        let incoming = backend.from_host(data, target.shape())?;
        let copied = backend.copy(target, &incoming);
        backend.release(incoming)?;
        Ok(copied?)
    }

    /// Runs the sequence and, when `targets` are given, its summed loss.
    pub fn forward(
        &mut self,
        tokens: &[usize],
        targets: Option<Targets<'_, B::Tensor>>,
    ) -> EngineResult<ForwardOutput<B::Tensor>> {
        let state = self.state.as_mut().ok_or(EngineError::TornDown)?;
        enter(&mut self.phase, EnginePhase::Forward);
        let mut ctx = ForwardContext::new(&self.pool, &self.weights, self.config, false);
        let outcome = ctx.run(state, tokens).and_then(|predictions| {
            let loss = match targets {
                Some(targets) => {
                    enter(&mut self.phase, EnginePhase::Loss);
                    match sequence_cross_entropy(self.pool.backend(), &predictions, targets) {
                        Ok(loss) => Some(loss),
                        Err(err) => {
                            self.pool.recycle(predictions);
                            return Err(err);
                        }
                    }
                }
                None => None,
            };
            Ok(ForwardOutput { predictions, loss })
        });
        drop(ctx);
        enter(&mut self.phase, EnginePhase::Idle);
        outcome
    }

    /// Loss of one sequence against per-step target rows. Weights and pool
    /// contents are left as they were; the recurrent state is reset.
    pub fn calculate_sequence_loss(
        &mut self,
        tokens: &[usize],
        targets: &[B::Tensor],
    ) -> EngineResult<f32> {
        if targets.len() != tokens.len() {
            return Err(EngineError::TargetLength {
                expected: tokens.len(),
                got: targets.len(),
            });
        }
        let state = self.state.as_mut().ok_or(EngineError::TornDown)?;
        let backend = self.pool.backend();
        let expected = sequence_tensor(backend, targets)?;

        enter(&mut self.phase, EnginePhase::Forward);
        let mut ctx = ForwardContext::new(&self.pool, &self.weights, self.config, false);
        let outcome = ctx.run(state, tokens).and_then(|predictions| {
            let loss = sequence_cross_entropy(
                backend,
                &predictions,
                Targets::Distribution(&expected),
            );
            self.pool.recycle(predictions);
            loss
        });
        drop(ctx);
        if let Err(err) = backend.release(expected) {
            tracing::warn!(error = %err, "failed to release target sequence");
        }
        enter(&mut self.phase, EnginePhase::Idle);
        outcome
    }

    /// Forward pass with cached activations followed by BPTT. Returns the
    /// pre-update loss and clipped gradients for every weight. The engine is
    /// back in [`EnginePhase::Idle`] on return, whether or not the gradients
    /// are later applied.
    pub fn compute_gradients(
        &mut self,
        tokens: &[usize],
        targets: Targets<'_, B::Tensor>,
    ) -> EngineResult<(f32, GradientSet<B::Tensor>)> {
        if targets.len() != tokens.len() {
            return Err(EngineError::TargetLength {
                expected: tokens.len(),
                got: targets.len(),
            });
        }
        let state = self.state.as_mut().ok_or(EngineError::TornDown)?;
        enter(&mut self.phase, EnginePhase::Forward);
        let mut ctx = ForwardContext::new(&self.pool, &self.weights, self.config, true);
        let predictions = match ctx.run(state, tokens) {
            Ok(predictions) => predictions,
            Err(err) => {
                drop(ctx);
                enter(&mut self.phase, EnginePhase::Idle);
                return Err(err);
            }
        };

        enter(&mut self.phase, EnginePhase::Loss);
        let loss = sequence_cross_entropy(self.pool.backend(), &predictions, targets);
        self.pool.recycle(predictions);
        let outcome = loss.and_then(|loss| {
            enter(&mut self.phase, EnginePhase::Backward);
            let grads = ctx.backward(targets, &self.training)?;
            Ok((loss, grads))
        });
        drop(ctx);
        enter(&mut self.phase, EnginePhase::Idle);
        outcome
    }

    /// `weight -= learning_rate · grad` for every weight, then releases the
    /// gradients. The key sets must match exactly.
    pub fn apply_gradients(
        &mut self,
        grads: GradientSet<B::Tensor>,
        learning_rate: f32,
    ) -> EngineResult<()> {
        let backend = self.pool.backend();
        if self.state.is_none() {
            grads.dispose(backend);
            return Err(EngineError::TornDown);
        }
        let missing: Vec<ParamName> = self
            .weights
            .names()
            .filter(|name| grads.get(*name).is_none())
            .collect();
        let unexpected: Vec<ParamName> = grads
            .names()
            .filter(|name| !self.weights.contains(*name))
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            grads.dispose(backend);
            enter(&mut self.phase, EnginePhase::Idle);
            return Err(EngineError::GradientMismatch {
                missing,
                unexpected,
            });
        }

        let mut outcome = Ok(());
        for (name, grad) in grads.iter() {
            let step = self
                .weights
                .get_mut(name)
                .and_then(|weight| Ok(backend.sub_scaled(weight, grad, learning_rate)?));
            if let Err(err) = step {
                outcome = Err(err);
                break;
            }
        }
        grads.dispose(backend);
        match outcome {
            Ok(()) => {
                enter(&mut self.phase, EnginePhase::Applied);
                enter(&mut self.phase, EnginePhase::Idle);
                Ok(())
            }
            Err(err) => {
                enter(&mut self.phase, EnginePhase::Idle);
                Err(err)
            }
        }
    }

    /// Gradient computation and an SGD step at the configured learning rate.
    /// Returns the loss measured before the update.
    pub fn train_step(
        &mut self,
        tokens: &[usize],
        targets: Targets<'_, B::Tensor>,
    ) -> EngineResult<f32> {
        let (loss, grads) = self.compute_gradients(tokens, targets)?;
        let learning_rate = self.training.learning_rate;
        self.apply_gradients(grads, learning_rate)?;
        Ok(loss)
    }

    /// Per-step output distributions on the host.
    pub fn predict(&mut self, tokens: &[usize]) -> EngineResult<Vec<Vec<f32>>> {
        let ForwardOutput { predictions, .. } = self.forward(tokens, None)?;
        let host = self.pool.backend().to_host(&predictions);
        self.pool.recycle(predictions);
        let width = self.config.output_size;
        Ok(host?.chunks(width).map(<[f32]>::to_vec).collect())
    }

    /// Runs [`train_step`](Self::train_step) over every sample for `epochs`
    /// passes, trimming the pool between epochs.
    pub fn fit(
        &mut self,
        samples: &[TrainingSample],
        epochs: usize,
    ) -> EngineResult<Vec<EpochStats>> {
        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let mut total = 0.0f64;
            for sample in samples {
                let loss = self.train_step(&sample.tokens, Targets::Indices(&sample.targets))?;
                total += f64::from(loss);
            }
            let mean_loss = if samples.is_empty() {
                0.0
            } else {
                (total / samples.len() as f64) as f32
            };
            let reuse_rate = self.pool.stats().reuse_rate();
            let released = self.pool.trim();
            tracing::info!(
                epoch,
                mean_loss,
                samples = samples.len(),
                reuse_rate,
                released,
                "epoch finished"
            );
            history.push(EpochStats {
                epoch,
                mean_loss,
                samples: samples.len(),
                reuse_rate,
            });
        }
        Ok(history)
    }

    /// Releases the pool, every weight and the recurrent state. Safe to call
    /// more than once; later calls do nothing.
    pub fn teardown(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let pooled = self.pool.trim();
        let backend = self.pool.backend();
        let mut released = 0;
        for (name, weight) in self.weights.drain() {
            match backend.release(weight) {
                Ok(()) => released += 1,
                Err(err) => tracing::warn!(%name, error = %err, "failed to release weight"),
            }
        }
        for tensor in [state.h, state.c] {
            if let Err(err) = backend.release(tensor) {
                tracing::warn!(error = %err, "failed to release recurrent state");
            }
        }
        self.phase = EnginePhase::Idle;
        tracing::debug!(pooled, weights = released, "lstm engine torn down");
    }
}

impl<B: MathBackend> Drop for LstmEngine<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
