// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;
use std::fmt;

use st_tensor::{MathBackend, TensorHandle, TensorPool};

use crate::config::LstmConfig;
use crate::error::{EngineError, EngineResult};
use crate::params::ParamName;

/// Per-call gradients keyed like the weight set.
///
/// Consumed by [`LstmEngine::apply_gradients`](crate::LstmEngine::apply_gradients)
/// or [`dispose`](Self::dispose); either way every tensor is released and the
/// mapping is gone afterwards.
#[derive(Debug)]
pub struct GradientSet<T> {
    grads: BTreeMap<ParamName, T>,
}

impl<T> Default for GradientSet<T> {
    fn default() -> Self {
        Self {
            grads: BTreeMap::new(),
        }
    }
}

impl<T: TensorHandle> GradientSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// One zero tensor per parameter.
    pub fn zeros<B>(backend: &B, config: &LstmConfig) -> EngineResult<Self>
    where
        B: MathBackend<Tensor = T>,
    {
        let mut set = Self::new();
        for name in ParamName::ALL {
            set.insert(name, backend.zeros(&name.shape(config))?);
        }
        Ok(set)
    }

    pub fn get(&self, name: ParamName) -> Option<&T> {
        self.grads.get(&name)
    }

    pub(crate) fn get_mut(&mut self, name: ParamName) -> EngineResult<&mut T> {
        self.grads
            .get_mut(&name)
            .ok_or(EngineError::MissingWeight(name))
    }

    pub fn insert(&mut self, name: ParamName, grad: T) -> Option<T> {
        self.grads.insert(name, grad)
    }

    pub fn remove(&mut self, name: ParamName) -> Option<T> {
        self.grads.remove(&name)
    }

    pub fn names(&self) -> impl Iterator<Item = ParamName> + '_ {
        self.grads.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamName, &T)> + '_ {
        self.grads.iter().map(|(name, grad)| (*name, grad))
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Clamps every gradient element into `[min, max]`.
    pub(crate) fn clip<B>(&mut self, pool: &TensorPool<B>, min: f32, max: f32) -> EngineResult<()>
    where
        B: MathBackend<Tensor = T>,
    {
        let backend = pool.backend();
        for grad in self.grads.values_mut() {
            let mut clipped = pool.rent(grad.shape())?;
            backend.clip(&mut clipped, grad, min, max)?;
            backend.copy(grad, &clipped)?;
        }
        Ok(())
    }

    /// Releases every gradient through `backend`. Returns how many releases
    /// succeeded.
    pub fn dispose<B>(self, backend: &B) -> usize
    where
        B: MathBackend<Tensor = T>,
    {
        self.dispose_with(|grad| backend.release(grad))
    }

    /// Hands every gradient to `release`. A failure is logged and the next
    /// entry is still released.
    pub fn dispose_with<E, F>(mut self, mut release: F) -> usize
    where
        E: fmt::Display,
        F: FnMut(T) -> Result<(), E>,
    {
        let mut released = 0;
        for (name, grad) in std::mem::take(&mut self.grads) {
            match release(grad) {
                Ok(()) => released += 1,
                Err(err) => tracing::warn!(%name, error = %err, "failed to release gradient"),
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_tensor::{CpuBackend, Shape};

    #[test]
    fn zeros_cover_every_parameter() {
        let cpu = CpuBackend::new();
        let config = LstmConfig::new(6, 2, 3, 4);
        let grads = GradientSet::zeros(&cpu, &config).unwrap();
        assert_eq!(grads.len(), ParamName::ALL.len());
        assert_eq!(
            grads.get(ParamName::WeightOut).unwrap().shape(),
            &Shape::matrix(3, 4)
        );
    }

    #[test]
    fn one_failing_release_does_not_stop_the_rest() {
        let cpu = CpuBackend::new();
        let grads = GradientSet::zeros(&cpu, &LstmConfig::new(6, 2, 3, 4)).unwrap();
        let mut attempted = Vec::new();
        let released = grads.dispose_with(|grad| {
            attempted.push(grad.shape().clone());
            if attempted.len() == 3 {
                Err("device lost")
            } else {
                Ok(())
            }
        });
        assert_eq!(attempted.len(), ParamName::ALL.len());
        assert_eq!(released, ParamName::ALL.len() - 1);
    }

    #[test]
    fn clip_bounds_every_entry() {
        let cpu = CpuBackend::new();
        let pool = TensorPool::new(cpu.clone());
        let mut grads = GradientSet::new();
        grads.insert(
            ParamName::BiasOut,
            cpu.from_host(&[-9.0, 0.25, 9.0], &Shape::row(3)).unwrap(),
        );
        grads.clip(&pool, -1.0, 1.0).unwrap();
        assert_eq!(grads.get(ParamName::BiasOut).unwrap().data(), &[-1.0, 0.25, 1.0]);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
