//! Concurrency planning module for modplay
//!
//! Derives the global limit on simultaneous emulator processes from CPU core
//! count and configuration.

use crate::config::Config;

/// Upper bound for a derived conversion limit
const MAX_DERIVED_CONVERSIONS: u32 = 8;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of emulator processes running at once
    pub max_concurrent_conversions: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - An explicit non-zero `max_concurrent_conversions` is used unchanged
    /// - Otherwise half the cores, clamped to [1, 8]
    pub fn derive(cfg: &Config) -> Self {
        Self::for_cores(
            num_cpus::get() as u32,
            cfg.conversion.max_concurrent_conversions,
        )
    }

    /// Derive a plan for a known core count
    pub fn for_cores(total_cores: u32, configured: u32) -> Self {
        let max_concurrent_conversions = if configured > 0 {
            configured
        } else {
            derive_max_conversions(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_conversions,
        }
    }
}

/// Half the cores, at least 1 and at most 8
fn derive_max_conversions(cores: u32) -> u32 {
    (cores / 2).clamp(1, MAX_DERIVED_CONVERSIONS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // A zero setting derives half the cores, clamped to [1, 8].
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_concurrency_derivation(cores in 1u32..256) {
            let plan = ConcurrencyPlan::for_cores(cores, 0);

            prop_assert_eq!(plan.total_cores, cores);
            prop_assert!(plan.max_concurrent_conversions >= 1);
            prop_assert!(plan.max_concurrent_conversions <= MAX_DERIVED_CONVERSIONS);
            if (2..=16).contains(&cores) {
                prop_assert_eq!(plan.max_concurrent_conversions, cores / 2);
            }
        }
    }

    // An explicit setting is used unchanged.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_explicit_config_override(
            cores in 1u32..256,
            explicit in 1u32..64,
        ) {
            let plan = ConcurrencyPlan::for_cores(cores, explicit);
            prop_assert_eq!(plan.max_concurrent_conversions, explicit);
        }
    }

    #[test]
    fn test_derived_boundaries() {
        assert_eq!(ConcurrencyPlan::for_cores(1, 0).max_concurrent_conversions, 1);
        assert_eq!(ConcurrencyPlan::for_cores(3, 0).max_concurrent_conversions, 1);
        assert_eq!(ConcurrencyPlan::for_cores(8, 0).max_concurrent_conversions, 4);
        assert_eq!(ConcurrencyPlan::for_cores(64, 0).max_concurrent_conversions, 8);
    }

    #[test]
    fn test_derive_from_config() {
        let mut cfg = Config::default();
        cfg.conversion.max_concurrent_conversions = 3;
        let plan = derive_plan(&cfg);
        assert_eq!(plan.max_concurrent_conversions, 3);
        assert!(plan.total_cores >= 1);
    }
}
