//! Epic aggregate invariants over arbitrary story operation sequences.

use proptest::prelude::*;

use lockstep_core::config::ContextConfig;
use lockstep_core::coordinator::StateCoordinator;
use lockstep_core::db::StateStore;
use lockstep_core::model::StoryState;
use lockstep_core::service::NewStory;

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Transition(u8, StoryState),
    Complete(u8, u8),
}

fn arb_state() -> impl Strategy<Value = StoryState> {
    prop::sample::select(StoryState::ALL.to_vec())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0_u8..8).prop_map(Op::Create),
        (0_u8..8, arb_state()).prop_map(|(n, s)| Op::Transition(n, s)),
        (0_u8..8, 0_u8..20).prop_map(|(n, e)| Op::Complete(n, e)),
    ]
}

fn story_id(n: u8) -> String {
    format!("3.{n}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn aggregate_holds_after_every_operation(ops in prop::collection::vec(arb_op(), 1..40)) {
        let store = StateStore::open_in_memory().expect("store");
        let coordinator = StateCoordinator::new(store.conn(), ContextConfig::default());
        coordinator.create_epic(3, "Props", None).expect("epic");

        for op in ops {
            // Rejected operations are part of the sequence; only the
            // invariant after each step matters.
            let _ = match op {
                Op::Create(n) => coordinator
                    .create_story(
                        &NewStory {
                            story_id: story_id(n),
                            epic_num: 3,
                            title: format!("Story {n}"),
                            ..NewStory::default()
                        },
                        None,
                    )
                    .map(|_| ()),
                Op::Transition(n, s) => coordinator.transition_story(&story_id(n), s).map(|_| ()),
                Op::Complete(n, e) => coordinator
                    .complete_story(&story_id(n), f64::from(e))
                    .map(|_| ()),
            };

            let epic = coordinator.epics().require(3).expect("epic");
            prop_assert!(epic.completed_stories + epic.in_progress_stories <= epic.total_stories);
            let expected = if epic.total_stories == 0 {
                0.0
            } else {
                #[allow(clippy::cast_precision_loss)]
                let pct = epic.completed_stories as f64 / epic.total_stories as f64 * 100.0;
                pct
            };
            prop_assert!((epic.progress_percent - expected).abs() < 1e-9);
            let fresh = coordinator.compute_aggregate(3).expect("aggregate");
            prop_assert!(fresh.matches(&epic));
        }
    }
}
