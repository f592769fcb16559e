// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plan risk assessment: the approval decision input.

use forge_core::{Complexity, Plan, RiskLevel};

/// File count above which a plan earns a risk bump.
const LARGE_PLAN_FILES: usize = 10;

fn is_critical_config(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == "package.json"
        || name == "tsconfig.json"
        || name.starts_with("webpack")
        || name.starts_with("vite.config")
        || name == ".env"
        || name.starts_with(".env.")
}

/// Derive the risk level that decides whether approval is required.
///
/// One bump each for: migrations present, more than ten files, critical
/// config files touched, high complexity, explicit risks, and dependency
/// changes. Zero bumps map to low and exactly one to medium; two or more,
/// or any high-complexity bump, map to high.
#[must_use]
pub fn assess_risk(plan: &Plan) -> RiskLevel {
    let mut bumps = 0u32;
    let mut high_complexity = false;

    if !plan.migrations.is_empty() {
        bumps += 1;
    }
    if plan.files.len() > LARGE_PLAN_FILES {
        bumps += 1;
    }
    if plan.files.iter().any(|f| is_critical_config(&f.path)) {
        bumps += 1;
    }
    if plan.complexity == Complexity::High {
        bumps += 1;
        high_complexity = true;
    }
    if !plan.risks.is_empty() {
        bumps += 1;
    }
    if plan.dependency_changes {
        bumps += 1;
    }

    match bumps {
        0 => RiskLevel::Low,
        1 if !high_complexity => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}
