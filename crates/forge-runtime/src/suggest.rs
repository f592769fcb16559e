// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fix-suggestion generation for validation failures.

use forge_core::FixSuggestion;
use forge_gate::GateReport;

/// Produce the structured suggestion for one failed check by name.
#[must_use]
pub fn suggestion_for(check: &str) -> FixSuggestion {
    let (title, description, actions): (&str, &str, Vec<&str>) = match check {
        "SyntaxCheck" => (
            "Fix syntax errors",
            "Generated files failed syntax validation.",
            vec![
                "Regenerate with more context so truncated files are completed",
                "Inspect the per-file errors in the check details",
            ],
        ),
        "DependencyCheck" => (
            "Resolve missing imports",
            "Relative imports reference files that are not in the bundle.",
            vec![
                "Add the missing files to the plan",
                "Fix the import paths to match generated file locations",
                "Install external packages the code depends on",
            ],
        ),
        "SchemaCheck" => (
            "Complete required bundle fields",
            "The bundle is missing required fields or carries wrong types.",
            vec![
                "Ensure id, type, created_at, and files are present",
                "Ensure every plan step has id, action, and target",
            ],
        ),
        "TestCoverageCheck" => (
            "Raise test coverage",
            "Too few source files are covered by generated tests.",
            vec![
                "Regenerate with test generation enabled for uncovered files",
                "Lower the coverage threshold and retry validation",
            ],
        ),
        "MigrationReversibilityCheck" => (
            "Make migrations reversible",
            "One or more migrations lack a working reverse script.",
            vec![
                "Add reverse SQL undoing every forward operation",
                "Split irreversible changes into separate, documented migrations",
            ],
        ),
        _ => (
            "Review check output",
            "A validation check failed; inspect its details.",
            vec!["Read the check details and retry validation"],
        ),
    };
    FixSuggestion {
        check: check.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        actions: actions.into_iter().map(str::to_string).collect(),
    }
}

/// One suggestion per distinct failed blocker in a gate report.
#[must_use]
pub fn for_report(report: &GateReport) -> Vec<FixSuggestion> {
    let mut seen: Vec<&str> = Vec::new();
    let mut suggestions = Vec::new();
    for blocker in &report.blockers {
        if !seen.contains(&blocker.name.as_str()) {
            seen.push(&blocker.name);
            suggestions.push(suggestion_for(&blocker.name));
        }
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_checks_have_specific_suggestions() {
        for check in [
            "SyntaxCheck",
            "DependencyCheck",
            "SchemaCheck",
            "TestCoverageCheck",
            "MigrationReversibilityCheck",
        ] {
            let s = suggestion_for(check);
            assert_eq!(s.check, check);
            assert!(!s.actions.is_empty());
            assert_ne!(s.title, "Review check output");
        }
    }

    #[test]
    fn unknown_check_gets_the_generic_suggestion() {
        let s = suggestion_for("SomethingNew");
        assert_eq!(s.check, "SomethingNew");
        assert_eq!(s.title, "Review check output");
    }
}
