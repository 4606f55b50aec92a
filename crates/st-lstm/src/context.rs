// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-call forward/backward workspace.
//!
//! A [`ForwardContext`] borrows the engine's pool and weights for one call.
//! Everything it rents is a pool guard, so dropping the context hands every
//! intermediate back to the pool whether the call succeeded or not.

use st_tensor::{MathBackend, PooledTensor, Shape, TensorPool};

use crate::config::{LstmConfig, TrainingConfig};
use crate::error::{EngineError, EngineResult};
use crate::gradients::GradientSet;
use crate::params::{Gate, ParamName, WeightSet};
use crate::sequence::Targets;

/// Hidden and cell state carried from one step to the next.
#[derive(Debug)]
pub(crate) struct RecurrentState<T> {
    pub h: T,
    pub c: T,
}

impl<T> RecurrentState<T> {
    pub fn zeros<B: MathBackend<Tensor = T>>(backend: &B, hidden: usize) -> EngineResult<Self> {
        Ok(Self {
            h: backend.zeros(&Shape::row(hidden))?,
            c: backend.zeros(&Shape::row(hidden))?,
        })
    }

    pub fn reset<B: MathBackend<Tensor = T>>(&mut self, backend: &B) -> EngineResult<()> {
        backend.fill(&mut self.h, 0.0)?;
        backend.fill(&mut self.c, 0.0)?;
        Ok(())
    }
}

/// Activations of one time step kept for backpropagation.
struct StepCache<'p, B: MathBackend> {
    token: usize,
    x: PooledTensor<'p, B>,
    h_prev: PooledTensor<'p, B>,
    c_prev: PooledTensor<'p, B>,
    f: PooledTensor<'p, B>,
    i: PooledTensor<'p, B>,
    g: PooledTensor<'p, B>,
    o: PooledTensor<'p, B>,
    tanh_c: PooledTensor<'p, B>,
    h: PooledTensor<'p, B>,
    y: PooledTensor<'p, B>,
}

pub(crate) struct ForwardContext<'p, B: MathBackend> {
    pool: &'p TensorPool<B>,
    weights: &'p WeightSet<B::Tensor>,
    config: LstmConfig,
    keep_cache: bool,
    steps: Vec<StepCache<'p, B>>,
}

impl<'p, B: MathBackend> ForwardContext<'p, B> {
    pub fn new(
        pool: &'p TensorPool<B>,
        weights: &'p WeightSet<B::Tensor>,
        config: LstmConfig,
        keep_cache: bool,
    ) -> Self {
        Self {
            pool,
            weights,
            config,
            keep_cache,
            steps: Vec::new(),
        }
    }

    fn backend(&self) -> &'p B {
        self.pool.backend()
    }

    fn weight(&self, name: ParamName) -> EngineResult<&'p B::Tensor> {
        self.weights.get(name)
    }

    fn rent(&self, shape: &Shape) -> EngineResult<PooledTensor<'p, B>> {
        Ok(self.pool.rent(shape)?)
    }

    /// `act(x·W_x + h_prev·W_h + b)` for one gate.
    fn gate(
        &self,
        gate: Gate,
        x: &B::Tensor,
        h_prev: &B::Tensor,
    ) -> EngineResult<PooledTensor<'p, B>> {
        let backend = self.backend();
        let hidden = Shape::row(self.config.hidden_size);
        let mut zx = self.rent(&hidden)?;
        let mut zh = self.rent(&hidden)?;
        backend.matmul(&mut zx, x, self.weight(gate.input_weight())?)?;
        backend.matmul(&mut zh, h_prev, self.weight(gate.hidden_weight())?)?;
        backend.add_scaled(&mut zx, &zh, 1.0)?;
        backend.add_row_broadcast(&mut zh, &zx, self.weight(gate.bias())?)?;
        match gate {
            Gate::Cell => backend.tanh(&mut zx, &zh)?,
            _ => backend.sigmoid(&mut zx, &zh)?,
        }
        Ok(zx)
    }

    /// Runs the sequence from a zeroed state and returns the `[len, output]`
    /// prediction tensor. The caller owns the result.
    pub fn run(
        &mut self,
        state: &mut RecurrentState<B::Tensor>,
        tokens: &[usize],
    ) -> EngineResult<B::Tensor> {
        let vocab = self.config.vocab_size;
        let out_of_range = tokens.iter().enumerate().find(|(_, token)| **token >= vocab);
        if let Some((step, &token)) = out_of_range {
            return Err(EngineError::TokenOutOfRange { step, token, vocab });
        }
        let backend = self.backend();
        state.reset(backend)?;
        self.steps.clear();

        let LstmConfig {
            embedding_size,
            hidden_size,
            output_size,
            ..
        } = self.config;
        let embed = Shape::row(embedding_size);
        let hidden = Shape::row(hidden_size);
        let output = Shape::row(output_size);
        let mut predictions = self.rent(&Shape::matrix(tokens.len(), output_size))?;

        for (t, &token) in tokens.iter().enumerate() {
            let mut x = self.rent(&embed)?;
            backend.embedding_lookup(&mut x, self.weight(ParamName::Embedding)?, token)?;
            let mut h_prev = self.rent(&hidden)?;
            let mut c_prev = self.rent(&hidden)?;
            backend.copy(&mut h_prev, &state.h)?;
            backend.copy(&mut c_prev, &state.c)?;

            let f = self.gate(Gate::Forget, &x, &h_prev)?;
            let i = self.gate(Gate::Input, &x, &h_prev)?;
            let g = self.gate(Gate::Cell, &x, &h_prev)?;
            let o = self.gate(Gate::Output, &x, &h_prev)?;

            let mut c = self.rent(&hidden)?;
            let mut scratch = self.rent(&hidden)?;
            backend.mul(&mut c, &f, &c_prev)?;
            backend.mul(&mut scratch, &i, &g)?;
            backend.add_scaled(&mut c, &scratch, 1.0)?;
            let mut tanh_c = self.rent(&hidden)?;
            backend.tanh(&mut tanh_c, &c)?;
            let mut h = self.rent(&hidden)?;
            backend.mul(&mut h, &o, &tanh_c)?;

            let mut logits = self.rent(&output)?;
            let mut biased = self.rent(&output)?;
            let mut y = self.rent(&output)?;
            backend.matmul(&mut logits, &h, self.weight(ParamName::WeightOut)?)?;
            backend.add_row_broadcast(&mut biased, &logits, self.weight(ParamName::BiasOut)?)?;
            backend.softmax_rows(&mut y, &biased)?;
            backend.set_row(&mut predictions, t, &y)?;

            backend.copy(&mut state.h, &h)?;
            backend.copy(&mut state.c, &c)?;

            if self.keep_cache {
                self.steps.push(StepCache {
                    token,
                    x,
                    h_prev,
                    c_prev,
                    f,
                    i,
                    g,
                    o,
                    tanh_c,
                    h,
                    y,
                });
            }
        }
        Ok(predictions.detach())
    }

    /// Backpropagates `targets` through the cached steps of the last
    /// [`run`](Self::run). Every gradient is clipped into the configured
    /// range before it is returned.
    pub fn backward(
        &self,
        targets: Targets<'_, B::Tensor>,
        training: &TrainingConfig,
    ) -> EngineResult<GradientSet<B::Tensor>> {
        let len = self.steps.len();
        if targets.len() != len {
            return Err(EngineError::TargetLength {
                expected: len,
                got: targets.len(),
            });
        }
        let backend = self.backend();
        let LstmConfig {
            embedding_size,
            hidden_size,
            output_size,
            ..
        } = self.config;
        let embed = Shape::row(embedding_size);
        let hidden = Shape::row(hidden_size);
        let output = Shape::row(output_size);
        let input_outer = Shape::matrix(embedding_size, hidden_size);
        let hidden_outer = Shape::matrix(hidden_size, hidden_size);
        let output_outer = Shape::matrix(hidden_size, output_size);

        let mut grads = GradientSet::zeros(backend, &self.config)?;
        let mut dh_next = self.pool.rent_zeroed(&hidden)?;
        let mut dc_next = self.pool.rent_zeroed(&hidden)?;

        for (t, step) in self.steps.iter().enumerate().rev() {
            if let Some(window) = training.bptt_window {
                if (t + 1) % window == 0 && t + 1 < len {
                    backend.fill(&mut dh_next, 0.0)?;
                    backend.fill(&mut dc_next, 0.0)?;
                }
            }

            // dy = y - target
            let mut dy = self.rent(&output)?;
            match targets {
                Targets::Indices(indices) => {
                    let target = indices[t];
                    if target >= output_size {
                        return Err(EngineError::TargetOutOfRange {
                            step: t,
                            target,
                            classes: output_size,
                        });
                    }
                    backend.softmax_cross_entropy_grad(&mut dy, &step.y, &[target])?;
                }
                Targets::Distribution(dist) => {
                    let mut expected = self.rent(&output)?;
                    backend.slice_row(&mut expected, dist, t)?;
                    backend.sub(&mut dy, &step.y, &expected)?;
                }
            }

            let mut outer = self.rent(&output_outer)?;
            backend.matmul_transpose_lhs(&mut outer, &step.h, &dy)?;
            backend.add_scaled(grads.get_mut(ParamName::WeightOut)?, &outer, 1.0)?;
            backend.add_scaled(grads.get_mut(ParamName::BiasOut)?, &dy, 1.0)?;

            let mut dh = self.rent(&hidden)?;
            backend.matmul_transpose_rhs(&mut dh, &dy, self.weight(ParamName::WeightOut)?)?;
            backend.add_scaled(&mut dh, &dh_next, 1.0)?;

            let mut scratch = self.rent(&hidden)?;
            let mut deriv = self.rent(&hidden)?;

            let mut d_o = self.rent(&hidden)?;
            backend.mul(&mut scratch, &dh, &step.tanh_c)?;
            backend.sigmoid_derivative(&mut deriv, &step.o)?;
            backend.mul(&mut d_o, &scratch, &deriv)?;

            let mut dc = self.rent(&hidden)?;
            backend.mul(&mut scratch, &dh, &step.o)?;
            backend.tanh_derivative(&mut deriv, &step.tanh_c)?;
            backend.mul(&mut dc, &scratch, &deriv)?;
            backend.add_scaled(&mut dc, &dc_next, 1.0)?;

            let mut d_f = self.rent(&hidden)?;
            backend.mul(&mut scratch, &dc, &step.c_prev)?;
            backend.sigmoid_derivative(&mut deriv, &step.f)?;
            backend.mul(&mut d_f, &scratch, &deriv)?;

            let mut d_i = self.rent(&hidden)?;
            backend.mul(&mut scratch, &dc, &step.g)?;
            backend.sigmoid_derivative(&mut deriv, &step.i)?;
            backend.mul(&mut d_i, &scratch, &deriv)?;

            let mut d_g = self.rent(&hidden)?;
            backend.mul(&mut scratch, &dc, &step.i)?;
            backend.tanh_derivative(&mut deriv, &step.g)?;
            backend.mul(&mut d_g, &scratch, &deriv)?;

            backend.mul(&mut dc_next, &dc, &step.f)?;

            let mut dx = self.pool.rent_zeroed(&embed)?;
            backend.fill(&mut dh_next, 0.0)?;
            let mut input_grad = self.rent(&input_outer)?;
            let mut hidden_grad = self.rent(&hidden_outer)?;
            let mut dx_part = self.rent(&embed)?;
            let mut dh_part = self.rent(&hidden)?;
            for (gate, delta) in [
                (Gate::Forget, &d_f),
                (Gate::Input, &d_i),
                (Gate::Cell, &d_g),
                (Gate::Output, &d_o),
            ] {
                let w_x = self.weight(gate.input_weight())?;
                let w_h = self.weight(gate.hidden_weight())?;
                backend.matmul_transpose_lhs(&mut input_grad, &step.x, delta)?;
                backend.add_scaled(grads.get_mut(gate.input_weight())?, &input_grad, 1.0)?;
                backend.matmul_transpose_lhs(&mut hidden_grad, &step.h_prev, delta)?;
                backend.add_scaled(grads.get_mut(gate.hidden_weight())?, &hidden_grad, 1.0)?;
                backend.add_scaled(grads.get_mut(gate.bias())?, delta, 1.0)?;

                backend.matmul_transpose_rhs(&mut dx_part, delta, w_x)?;
                backend.add_scaled(&mut dx, &dx_part, 1.0)?;
                backend.matmul_transpose_rhs(&mut dh_part, delta, w_h)?;
                backend.add_scaled(&mut dh_next, &dh_part, 1.0)?;
            }
            backend.accumulate_row(grads.get_mut(ParamName::Embedding)?, step.token, &dx)?;
        }

        grads.clip(self.pool, training.clip_min, training.clip_max)?;
        Ok(grads)
    }
}
