//! Campaigns over real scratch repositories.

use lockstep_sim::{CampaignConfig, Fault, StepOutcome, replay_seed, run_campaign};
use proptest::prelude::*;

fn small_campaign() -> CampaignConfig {
    CampaignConfig {
        seed_range: 0..4,
        steps: 25,
        fault_body_percent: 20,
        fault_hook_percent: 10,
        fault_deadline_percent: 10,
        ..CampaignConfig::default()
    }
}

#[test]
fn small_campaign_holds_every_invariant() {
    let report = run_campaign(&small_campaign()).expect("campaign");
    assert_eq!(report.seeds_run, 4);
    assert!(report.all_passed(), "{:#?}", report.failures);
    assert_eq!(report.first_failure, None);
    assert!(report.commits > 0);
    assert!(report.rollbacks > 0);
}

#[test]
fn replaying_a_seed_reproduces_its_trace() {
    let config = small_campaign();
    let first = replay_seed(2, &config).expect("first run");
    let second = replay_seed(2, &config).expect("second run");
    assert_eq!(first.trace, second.trace);
    assert_eq!(first.commits, second.commits);
}

#[test]
fn injected_faults_always_roll_back() {
    let config = CampaignConfig {
        fault_body_percent: 50,
        ..small_campaign()
    };
    let result = replay_seed(1, &config).expect("run");
    assert!(result.oracle.passed, "{:#?}", result.oracle.violations);
    let faulted: Vec<_> = result
        .trace
        .iter()
        .filter(|event| event.fault != Fault::None)
        .collect();
    assert!(!faulted.is_empty());
    for event in faulted {
        assert!(
            matches!(event.outcome, StepOutcome::RolledBack { .. }),
            "step {} committed under {:?}",
            event.step,
            event.fault
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn arbitrary_seeds_pass(seed in any::<u64>()) {
        let config = CampaignConfig {
            seed_range: seed..seed.saturating_add(1),
            steps: 15,
            ..CampaignConfig::default()
        };
        prop_assume!(!config.seed_range.is_empty());
        let result = replay_seed(seed, &config).expect("run");
        prop_assert!(result.oracle.passed, "{:?}", result.oracle.violations);
    }
}
