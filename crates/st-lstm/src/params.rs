// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter naming, shapes and deterministic initialisation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::distributions::{Distribution, Uniform};
use spiral_config::determinism::rng_for;
use st_tensor::{MathBackend, Shape};

use crate::config::LstmConfig;
use crate::error::{EngineError, EngineResult};

const EMBEDDING_RANGE: f32 = 0.1;
const FORGET_BIAS: f32 = 1.0;

/// Every trainable tensor in the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamName {
    Embedding,
    WeightXf,
    WeightXi,
    WeightXc,
    WeightXo,
    WeightHf,
    WeightHi,
    WeightHc,
    WeightHo,
    BiasF,
    BiasI,
    BiasC,
    BiasO,
    WeightOut,
    BiasOut,
}

impl ParamName {
    pub const ALL: [ParamName; 15] = [
        ParamName::Embedding,
        ParamName::WeightXf,
        ParamName::WeightXi,
        ParamName::WeightXc,
        ParamName::WeightXo,
        ParamName::WeightHf,
        ParamName::WeightHi,
        ParamName::WeightHc,
        ParamName::WeightHo,
        ParamName::BiasF,
        ParamName::BiasI,
        ParamName::BiasC,
        ParamName::BiasO,
        ParamName::WeightOut,
        ParamName::BiasOut,
    ];

    /// Key used in saved model documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            ParamName::Embedding => "embedding",
            ParamName::WeightXf => "weight_xf",
            ParamName::WeightXi => "weight_xi",
            ParamName::WeightXc => "weight_xc",
            ParamName::WeightXo => "weight_xo",
            ParamName::WeightHf => "weight_hf",
            ParamName::WeightHi => "weight_hi",
            ParamName::WeightHc => "weight_hc",
            ParamName::WeightHo => "weight_ho",
            ParamName::BiasF => "bias_f",
            ParamName::BiasI => "bias_i",
            ParamName::BiasC => "bias_c",
            ParamName::BiasO => "bias_o",
            ParamName::WeightOut => "weight_out",
            ParamName::BiasOut => "bias_out",
        }
    }

    pub fn shape(self, config: &LstmConfig) -> Shape {
        let LstmConfig {
            vocab_size: v,
            embedding_size: e,
            hidden_size: h,
            output_size: o,
        } = *config;
        match self {
            ParamName::Embedding => Shape::matrix(v, e),
            ParamName::WeightXf | ParamName::WeightXi | ParamName::WeightXc | ParamName::WeightXo => {
                Shape::matrix(e, h)
            }
            ParamName::WeightHf | ParamName::WeightHi | ParamName::WeightHc | ParamName::WeightHo => {
                Shape::matrix(h, h)
            }
            ParamName::BiasF | ParamName::BiasI | ParamName::BiasC | ParamName::BiasO => {
                Shape::row(h)
            }
            ParamName::WeightOut => Shape::matrix(h, o),
            ParamName::BiasOut => Shape::row(o),
        }
    }

    fn is_bias(self) -> bool {
        matches!(
            self,
            ParamName::BiasF
                | ParamName::BiasI
                | ParamName::BiasC
                | ParamName::BiasO
                | ParamName::BiasOut
        )
    }

    /// Host values for a fresh parameter, reproducible from `seed`.
    pub(crate) fn initial_values(self, config: &LstmConfig, seed: u64) -> Vec<f32> {
        let shape = self.shape(config);
        let len = shape.numel();
        if self.is_bias() {
            let value = if self == ParamName::BiasF { FORGET_BIAS } else { 0.0 };
            return vec![value; len];
        }
        let limit = if self == ParamName::Embedding {
            EMBEDDING_RANGE
        } else {
            let (fan_in, fan_out) = shape.as_matrix();
            (6.0 / (fan_in + fan_out) as f32).sqrt()
        };
        let mut rng = rng_for(seed, self.as_str());
        let dist = Uniform::new_inclusive(-limit, limit);
        (0..len).map(|_| dist.sample(&mut rng)).collect()
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = ();

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        ParamName::ALL
            .into_iter()
            .find(|param| param.as_str() == name)
            .ok_or(())
    }
}

/// The four LSTM gates and the parameters each one reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    Forget,
    Input,
    Cell,
    Output,
}

impl Gate {
    pub const ALL: [Gate; 4] = [Gate::Forget, Gate::Input, Gate::Cell, Gate::Output];

    pub const fn input_weight(self) -> ParamName {
        match self {
            Gate::Forget => ParamName::WeightXf,
            Gate::Input => ParamName::WeightXi,
            Gate::Cell => ParamName::WeightXc,
            Gate::Output => ParamName::WeightXo,
        }
    }

    pub const fn hidden_weight(self) -> ParamName {
        match self {
            Gate::Forget => ParamName::WeightHf,
            Gate::Input => ParamName::WeightHi,
            Gate::Cell => ParamName::WeightHc,
            Gate::Output => ParamName::WeightHo,
        }
    }

    pub const fn bias(self) -> ParamName {
        match self {
            Gate::Forget => ParamName::BiasF,
            Gate::Input => ParamName::BiasI,
            Gate::Cell => ParamName::BiasC,
            Gate::Output => ParamName::BiasO,
        }
    }
}

/// Named parameter tensors. A name without an entry is an unset weight.
#[derive(Debug)]
pub struct WeightSet<T> {
    tensors: BTreeMap<ParamName, T>,
}

impl<T> Default for WeightSet<T> {
    fn default() -> Self {
        Self {
            tensors: BTreeMap::new(),
        }
    }
}

impl<T> WeightSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates every parameter on `backend` with seeded initial values.
    pub fn initialise<B>(backend: &B, config: &LstmConfig, seed: u64) -> EngineResult<Self>
    where
        B: MathBackend<Tensor = T>,
    {
        let mut weights = Self::new();
        for name in ParamName::ALL {
            let values = name.initial_values(config, seed);
            let tensor = backend.from_host(&values, &name.shape(config))?;
            weights.insert(name, tensor);
        }
        Ok(weights)
    }

    pub fn get(&self, name: ParamName) -> EngineResult<&T> {
        self.tensors.get(&name).ok_or(EngineError::MissingWeight(name))
    }

    pub fn get_mut(&mut self, name: ParamName) -> EngineResult<&mut T> {
        self.tensors
            .get_mut(&name)
            .ok_or(EngineError::MissingWeight(name))
    }

    pub fn insert(&mut self, name: ParamName, tensor: T) -> Option<T> {
        self.tensors.insert(name, tensor)
    }

    pub fn remove(&mut self, name: ParamName) -> Option<T> {
        self.tensors.remove(&name)
    }

    pub fn contains(&self, name: ParamName) -> bool {
        self.tensors.contains_key(&name)
    }

    pub fn names(&self) -> impl Iterator<Item = ParamName> + '_ {
        self.tensors.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamName, &T)> + '_ {
        self.tensors.iter().map(|(name, tensor)| (*name, tensor))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Empties the set, yielding every tensor in name order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (ParamName, T)> {
        std::mem::take(&mut self.tensors).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_tensor::{CpuBackend, TensorHandle};

    #[test]
    fn names_round_trip_through_strings() {
        for name in ParamName::ALL {
            assert_eq!(name.as_str().parse::<ParamName>(), Ok(name));
        }
        assert!("weight_zz".parse::<ParamName>().is_err());
    }

    #[test]
    fn shapes_follow_hyperparameters() {
        let config = LstmConfig::new(50, 8, 16, 40);
        assert_eq!(ParamName::Embedding.shape(&config), Shape::matrix(50, 8));
        assert_eq!(ParamName::WeightXc.shape(&config), Shape::matrix(8, 16));
        assert_eq!(ParamName::WeightHo.shape(&config), Shape::matrix(16, 16));
        assert_eq!(ParamName::BiasI.shape(&config), Shape::row(16));
        assert_eq!(ParamName::WeightOut.shape(&config), Shape::matrix(16, 40));
        assert_eq!(ParamName::BiasOut.shape(&config), Shape::row(40));
    }

    #[test]
    fn initialisation_is_seeded_and_bounded() {
        let config = LstmConfig::new(10, 4, 6, 10);
        let a = ParamName::WeightXf.initial_values(&config, 9);
        let b = ParamName::WeightXf.initial_values(&config, 9);
        let c = ParamName::WeightXf.initial_values(&config, 10);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let limit = (6.0f32 / 10.0).sqrt();
        assert!(a.iter().all(|v| v.abs() <= limit));

        let embedding = ParamName::Embedding.initial_values(&config, 9);
        assert!(embedding.iter().all(|v| v.abs() <= EMBEDDING_RANGE));
        assert!(ParamName::BiasF.initial_values(&config, 9).iter().all(|v| *v == 1.0));
        assert!(ParamName::BiasO.initial_values(&config, 9).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn weight_set_reports_unset_entries() {
        let cpu = CpuBackend::new();
        let config = LstmConfig::new(5, 2, 3, 5);
        let mut weights = WeightSet::initialise(&cpu, &config, 1).unwrap();
        assert_eq!(weights.len(), ParamName::ALL.len());
        assert_eq!(weights.get(ParamName::BiasOut).unwrap().shape(), &Shape::row(5));

        weights.remove(ParamName::WeightHc);
        let err = weights.get(ParamName::WeightHc).unwrap_err();
        assert!(matches!(err, EngineError::MissingWeight(ParamName::WeightHc)));
    }
}
