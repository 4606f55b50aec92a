use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::env;

const DEFAULT_SEED: u64 = 42;

/// Process-wide determinism knobs.
#[derive(Clone, Debug)]
pub struct DeterminismConfig {
    /// Base seed used to derive per-component seeds.
    pub base_seed: u64,
    /// If true reductions should run sequentially to ensure stable ordering.
    pub sequential_reduction: bool,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            base_seed: DEFAULT_SEED,
            sequential_reduction: false,
        }
    }
}

impl DeterminismConfig {
    /// Builds a configuration snapshot from environment variables. Unparsable
    /// values are logged and replaced by the defaults.
    fn from_env() -> Self {
        let mut cfg = Self::default();
        match env::parse::<u64>("SPIRAL_DETERMINISTIC_SEED") {
            Ok(Some(seed)) => cfg.base_seed = seed,
            Ok(None) => {}
            Err(err) => tracing::warn!("{err}; keeping seed {DEFAULT_SEED}"),
        }
        match env::flag("SPIRAL_DETERMINISTIC_REDUCTION") {
            Ok(Some(flag)) => cfg.sequential_reduction = flag,
            Ok(None) => {}
            Err(err) => tracing::warn!("{err}; reductions stay parallel"),
        }
        cfg
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        derive_seed(self.base_seed, label)
    }
}

/// Mixes `seed` and `label` into a new seed. Stable for a given build.
pub fn derive_seed<L: Hash>(seed: u64, label: L) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

/// Returns an RNG derived from an explicit seed and a component label.
pub fn rng_for<L: Hash>(seed: u64, label: L) -> StdRng {
    StdRng::seed_from_u64(derive_seed(seed, label))
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised deterministic configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Returns the base seed, honouring `SPIRAL_DETERMINISTIC_SEED`.
pub fn base_seed() -> u64 {
    config().base_seed
}

/// Returns whether reductions should be forced to run sequentially.
pub fn lock_reduction_order() -> bool {
    config().sequential_reduction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_env::with_env;
    use rand::Rng;

    #[test]
    fn defaults_apply_without_env() {
        with_env(
            &[
                ("SPIRAL_DETERMINISTIC_SEED", None),
                ("SPIRAL_DETERMINISTIC_REDUCTION", None),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert_eq!(cfg.base_seed, 42);
                assert!(!cfg.sequential_reduction);
            },
        );
    }

    #[test]
    fn env_overrides_seed_and_reduction() {
        with_env(
            &[
                ("SPIRAL_DETERMINISTIC_SEED", Some("1337")),
                ("SPIRAL_DETERMINISTIC_REDUCTION", Some("on")),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert_eq!(cfg.base_seed, 1337);
                assert!(cfg.sequential_reduction);
            },
        );
    }

    #[test]
    fn bad_seed_falls_back_to_default() {
        with_env(&[("SPIRAL_DETERMINISTIC_SEED", Some("abc"))], || {
            assert_eq!(DeterminismConfig::from_env().base_seed, 42);
        });
    }

    #[test]
    fn labels_produce_distinct_but_repeatable_streams() {
        let a: f32 = rng_for(7, "embedding").gen();
        let b: f32 = rng_for(7, "embedding").gen();
        let c: f32 = rng_for(7, "weight_out").gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
