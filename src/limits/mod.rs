//! # Resource limits
//!
//! Guards against a malformed or adversarial SUT/scenario pair asking the
//! scheduler for more concurrency, more instances, or a longer walk than the
//! operator's environment is willing to give it. These are resource-safety
//! checks, distinct from `validation::validate_scenario`'s structural checks —
//! a scenario can be perfectly well-formed and still ask for `-n 50000000`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PARALLEL: usize = 64;
pub const DEFAULT_MAX_INSTANCE_TARGET: usize = 100_000;
pub const DEFAULT_MAX_SCENARIO_STEPS: usize = 1_000;
pub const DEFAULT_MAX_RUN_DURATION_SECS: u64 = 3_600;

/// Resource ceilings for one run. All fields have safe defaults; load from
/// the environment with `from_env` the way the CLI does for every other
/// tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Ceiling on the scheduler's concurrency cap `P`.
    pub max_parallel: usize,
    /// Ceiling on the requested instance count `N`.
    pub max_instance_target: usize,
    /// Ceiling on a scenario's own declared `max_steps`.
    pub max_scenario_steps: usize,
    /// Soft ceiling on total run wall-clock; enforced by the CLI as a
    /// deadline around `scheduler::execute`, not inside the scheduler itself.
    pub max_run_duration: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_instance_target: DEFAULT_MAX_INSTANCE_TARGET,
            max_scenario_steps: DEFAULT_MAX_SCENARIO_STEPS,
            max_run_duration: Duration::from_secs(DEFAULT_MAX_RUN_DURATION_SECS),
        }
    }
}

impl ExecutionLimits {
    /// Reads overrides from `RUNNER_MAX_PARALLEL`, `RUNNER_MAX_INSTANCE_TARGET`,
    /// `RUNNER_MAX_SCENARIO_STEPS`, `RUNNER_MAX_RUN_DURATION_SECS`.
    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Ok(val) = std::env::var("RUNNER_MAX_PARALLEL") {
            if let Ok(n) = val.parse() {
                limits.max_parallel = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_MAX_INSTANCE_TARGET") {
            if let Ok(n) = val.parse() {
                limits.max_instance_target = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_MAX_SCENARIO_STEPS") {
            if let Ok(n) = val.parse() {
                limits.max_scenario_steps = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_MAX_RUN_DURATION_SECS") {
            if let Ok(n) = val.parse() {
                limits.max_run_duration = Duration::from_secs(n);
            }
        }

        limits
    }

    pub fn strict() -> Self {
        Self {
            max_parallel: 4,
            max_instance_target: 100,
            max_scenario_steps: 20,
            max_run_duration: Duration::from_secs(30),
        }
    }

    pub fn relaxed() -> Self {
        Self {
            max_parallel: 512,
            max_instance_target: 1_000_000,
            max_scenario_steps: 10_000,
            max_run_duration: Duration::from_secs(24 * 3_600),
        }
    }
}

#[derive(Debug)]
pub struct LimitValidationResult {
    pub passed: bool,
    pub violations: Vec<LimitViolation>,
}

#[derive(Debug, Clone)]
pub struct LimitViolation {
    pub limit_name: String,
    pub limit_value: String,
    pub actual_value: String,
    pub message: String,
}

/// Checks a requested run shape against `limits` before the scheduler starts.
pub fn validate_limits(
    instance_target: usize,
    parallelism: usize,
    scenario_max_steps: usize,
    limits: &ExecutionLimits,
) -> LimitValidationResult {
    let mut violations = Vec::new();

    if instance_target > limits.max_instance_target {
        violations.push(LimitViolation {
            limit_name: "max_instance_target".to_string(),
            limit_value: limits.max_instance_target.to_string(),
            actual_value: instance_target.to_string(),
            message: format!(
                "requested {instance_target} instances, maximum allowed is {}",
                limits.max_instance_target
            ),
        });
    }

    if parallelism > limits.max_parallel {
        violations.push(LimitViolation {
            limit_name: "max_parallel".to_string(),
            limit_value: limits.max_parallel.to_string(),
            actual_value: parallelism.to_string(),
            message: format!(
                "requested concurrency {parallelism}, maximum allowed is {}",
                limits.max_parallel
            ),
        });
    }

    if scenario_max_steps > limits.max_scenario_steps {
        violations.push(LimitViolation {
            limit_name: "max_scenario_steps".to_string(),
            limit_value: limits.max_scenario_steps.to_string(),
            actual_value: scenario_max_steps.to_string(),
            message: format!(
                "scenario declares max_steps={scenario_max_steps}, maximum allowed is {}",
                limits.max_scenario_steps
            ),
        });
    }

    LimitValidationResult {
        passed: violations.is_empty(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_documented_constants() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.max_parallel, DEFAULT_MAX_PARALLEL);
        assert_eq!(limits.max_instance_target, DEFAULT_MAX_INSTANCE_TARGET);
    }

    #[test]
    fn strict_limits_are_tighter_than_default() {
        let strict = ExecutionLimits::strict();
        let default = ExecutionLimits::default();
        assert!(strict.max_parallel < default.max_parallel);
    }

    #[test]
    fn within_limits_passes_with_no_violations() {
        let limits = ExecutionLimits::default();
        let result = validate_limits(100, 10, 50, &limits);
        assert!(result.passed);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn exceeding_parallel_cap_is_reported() {
        let limits = ExecutionLimits::strict();
        let result = validate_limits(10, 100, 5, &limits);
        assert!(!result.passed);
        assert_eq!(result.violations[0].limit_name, "max_parallel");
    }

    #[test]
    fn multiple_violations_are_all_collected() {
        let limits = ExecutionLimits::strict();
        let result = validate_limits(1_000_000, 1_000, 50_000, &limits);
        assert_eq!(result.violations.len(), 3);
    }
}
