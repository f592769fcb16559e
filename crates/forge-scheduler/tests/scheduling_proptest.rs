// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for batch construction soundness.

use forge_core::{Layer, PlanStep, StepAction};
use forge_scheduler::{ScheduleError, build_execution_order};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn make_step(id: String, deps: Vec<String>) -> PlanStep {
    PlanStep {
        target: format!("src/{id}.js"),
        description: String::new(),
        action: StepAction::Create,
        layer: Layer::Backend,
        depends_on: deps,
        id,
    }
}

/// Generate a random DAG: step `i` may only depend on steps `< i`.
fn arb_dag(max_steps: usize) -> impl Strategy<Value = Vec<PlanStep>> {
    prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..max_steps)
        .prop_map(|dep_picks| {
            dep_picks
                .iter()
                .enumerate()
                .map(|(i, picks)| {
                    let deps: BTreeSet<String> = picks
                        .iter()
                        .filter(|_| i > 0)
                        .map(|pick| format!("s{}", pick.index(i.max(1))))
                        .collect();
                    make_step(format!("s{i}"), deps.into_iter().collect())
                })
                .collect()
        })
}

proptest! {
    #[test]
    fn batches_respect_dependencies(steps in arb_dag(24)) {
        let batches = build_execution_order(&steps).expect("forward-referencing graphs are DAGs");

        // Every step's dependencies live in strictly earlier batches.
        let mut batch_of: BTreeMap<&str, usize> = BTreeMap::new();
        for (k, batch) in batches.iter().enumerate() {
            for step in batch {
                batch_of.insert(step.id.as_str(), k);
            }
        }
        for step in &steps {
            let own = batch_of[step.id.as_str()];
            for dep in &step.depends_on {
                prop_assert!(batch_of[dep.as_str()] < own,
                    "step {} in batch {} depends on {} in batch {}",
                    step.id, own, dep, batch_of[dep.as_str()]);
            }
        }
    }

    #[test]
    fn batch_union_is_input_set_without_duplicates(steps in arb_dag(24)) {
        let batches = build_execution_order(&steps).unwrap();
        let mut seen: Vec<&str> = batches
            .iter()
            .flat_map(|b| b.iter().map(|s| s.id.as_str()))
            .collect();
        let total = seen.len();
        seen.sort_unstable();
        seen.dedup();
        prop_assert_eq!(total, seen.len(), "duplicate step in batches");
        prop_assert_eq!(seen.len(), steps.len(), "batch union differs from input set");
    }

    #[test]
    fn cycles_always_fail(cycle_len in 2usize..8, extra in 0usize..6) {
        // A cycle s0 -> s1 -> ... -> s0, plus independent extras.
        let mut steps: Vec<PlanStep> = (0..cycle_len)
            .map(|i| make_step(format!("s{i}"), vec![format!("s{}", (i + 1) % cycle_len)]))
            .collect();
        steps.extend((0..extra).map(|i| make_step(format!("x{i}"), vec![])));

        match build_execution_order(&steps) {
            Err(ScheduleError::CircularDependency { remaining }) => {
                prop_assert_eq!(remaining.len(), cycle_len);
            }
            Ok(_) => prop_assert!(false, "cycle was scheduled"),
        }
    }
}
