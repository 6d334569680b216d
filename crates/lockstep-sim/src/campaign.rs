//! Campaign runner: many seeds, first failure kept for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::simulator::{FaultConfig, SimulationConfig, SimulationResult, Simulator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..20`.
    pub seed_range: Range<u64>,
    /// Operations per seed.
    pub steps: u32,
    pub max_epics: u32,
    pub max_stories_per_epic: u32,
    pub fault_body_percent: u8,
    pub fault_hook_percent: u8,
    pub fault_deadline_percent: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..20,
            steps: sim.steps,
            max_epics: sim.max_epics,
            max_stories_per_epic: sim.max_stories_per_epic,
            fault_body_percent: sim.fault.body_failure_percent,
            fault_hook_percent: sim.fault.hook_failure_percent,
            fault_deadline_percent: sim.fault.expired_deadline_percent,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            steps: self.steps,
            max_epics: self.max_epics,
            max_stories_per_epic: self.max_stories_per_epic,
            fault: FaultConfig {
                body_failure_percent: self.fault_body_percent,
                hook_failure_percent: self.fault_hook_percent,
                expired_deadline_percent: self.fault_deadline_percent,
            },
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.steps == 0 {
            bail!("steps must be > 0");
        }
        if self.max_epics == 0 || self.max_stories_per_epic == 0 {
            bail!("max_epics and max_stories_per_epic must be > 0");
        }
        for (name, percent) in [
            ("fault_body_percent", self.fault_body_percent),
            ("fault_hook_percent", self.fault_hook_percent),
            ("fault_deadline_percent", self.fault_deadline_percent),
        ] {
            if percent > 100 {
                bail!("{name} must be within 0..=100, got {percent}");
            }
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Steps that committed, across every seed.
    pub commits: u64,
    /// Steps that were rolled back, across every seed.
    pub rollbacks: u64,
}

impl CampaignReport {
    /// True if every seed passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation cannot set
/// up its scratch repository.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        commits: 0,
        rollbacks: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let result = Simulator::new(config.sim_config_for_seed(seed))?.run()?;
        report.commits += u64::from(result.commits);
        report.rollbacks += u64::from(result.rollbacks);

        if result.oracle.passed {
            report.seeds_passed += 1;
            continue;
        }
        warn!(seed, violations = result.oracle.violations.len(), "seed failed");
        report.first_failure.get_or_insert(seed);
        report.failures.push(SeedFailure {
            seed,
            violations: result
                .oracle
                .violations
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
    }

    Ok(report)
}

/// Replay a single seed with its full trace.
///
/// # Errors
///
/// Returns an error when config validation or simulation setup fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    config.validate()?;
    Simulator::new(config.sim_config_for_seed(seed))?.run()
}
