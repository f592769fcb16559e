// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for budget conservation under arbitrary op sequences.

use forge_budget::{BudgetCategory, TokenBudget};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Reserve(u64),
    Consume(usize, u64),
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..500).prop_map(Op::Reserve),
        (any::<prop::sample::Index>(), 1u64..600)
            .prop_map(|(i, amount)| Op::Consume(i.index(64), amount)),
        any::<prop::sample::Index>().prop_map(|i| Op::Release(i.index(64))),
    ]
}

proptest! {
    /// Successful operations preserve `used + reserved <= total`; rejected
    /// consumes never move the ledger.
    #[test]
    fn conservation_holds_under_arbitrary_ops(ops in prop::collection::vec(arb_op(), 1..120)) {
        let total = 2_000u64;
        let budget = TokenBudget::new(total);
        let mut live_ids: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::Reserve(amount) => {
                    if let Ok(id) = budget.reserve(BudgetCategory::Agentic, amount) {
                        live_ids.push(id);
                    }
                }
                Op::Consume(pick, amount) => {
                    if !live_ids.is_empty() {
                        let id = live_ids[pick % live_ids.len()].clone();
                        if budget.consume(&id, amount).is_ok() {
                            // Fully consumed reservations vanish from the ledger.
                            let report = budget.report();
                            if !report.reservations.iter().any(|r| r.id == id) {
                                live_ids.retain(|l| *l != id);
                            }
                        }
                    }
                }
                Op::Release(pick) => {
                    if !live_ids.is_empty() {
                        let id = live_ids.remove(pick % live_ids.len());
                        let _ = budget.release(&id);
                    }
                }
            }

            let report = budget.report();
            prop_assert!(
                report.used + report.reserved <= report.total,
                "conservation violated: used={} reserved={} total={}",
                report.used, report.reserved, report.total
            );
            prop_assert_eq!(report.available, report.total - report.used - report.reserved);
            // Every live reservation respects 0 <= consumed <= reserved.
            for reservation in &report.reservations {
                prop_assert!(reservation.consumed <= reservation.reserved);
            }
        }
    }

    /// Releasing everything returns the ledger to reserved == 0.
    #[test]
    fn releasing_all_reservations_clears_reserved(amounts in prop::collection::vec(1u64..200, 1..20)) {
        let budget = TokenBudget::new(100_000);
        let ids: Vec<String> = amounts
            .iter()
            .filter_map(|a| budget.reserve(BudgetCategory::Plan, *a).ok())
            .collect();
        for id in &ids {
            budget.release(id).unwrap();
        }
        let report = budget.report();
        prop_assert_eq!(report.reserved, 0);
        prop_assert_eq!(report.used, 0);
        prop_assert!(report.reservations.is_empty());
    }
}
