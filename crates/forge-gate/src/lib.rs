// SPDX-License-Identifier: MIT OR Apache-2.0
//! Release gate: the ordered validator chain between a built bundle and a
//! signed bundle.
//!
//! Six checks run sequentially in a fixed order; every check runs even when
//! an earlier one fails, so callers receive a complete diagnostic picture.
//! Blockers decide the overall result; warnings never flip it. A check that
//! returns an error (or panics in its logic and surfaces it as one) is
//! recorded as a failed blocker attributed to that check.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The six built-in checks.
pub mod checks;
/// Syntax scanners shared with code-generation agents.
pub mod syntax;

use forge_bus::EventBus;
use forge_core::{Bundle, EventKind};
use serde::Serialize;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, warn};

pub use checks::{
    DependencyCheck, MigrationReversibilityCheck, SchemaCheck, SecurityCheck, SyntaxCheck,
    TestCoverageCheck,
};

// ---------------------------------------------------------------------------
// Check contract
// ---------------------------------------------------------------------------

/// Whether a failed check blocks signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    /// A failure prevents the bundle from being signed.
    Blocker,
    /// A failure is reported but never blocks.
    Warning,
}

/// What a check reports back.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    /// Whether the check passed.
    pub passed: bool,
    /// One-line human-readable summary.
    pub message: String,
    /// Structured findings.
    pub details: serde_json::Value,
}

/// One validation check in the gate's chain.
#[async_trait::async_trait]
pub trait GateCheck: Send + Sync {
    /// Stable check name (used in events, suggestions, and `skip_checks`).
    fn name(&self) -> &'static str;

    /// Whether a failure blocks signing.
    fn level(&self) -> CheckLevel;

    /// Run the check against a bundle.
    ///
    /// Returning `Err` is treated as a failed blocker attributed to this
    /// check.
    async fn run(&self, bundle: &Bundle, config: &GateConfig) -> anyhow::Result<CheckOutcome>;
}

// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

/// Gate configuration.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum test coverage percentage.
    pub coverage_threshold: f64,
    /// Check names to skip (recorded as skipped, counted as passed).
    pub skip_checks: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 80.0,
            skip_checks: Vec::new(),
        }
    }
}

/// Result of one check's execution.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Check name.
    pub name: String,
    /// Blocker or warning.
    pub level: CheckLevel,
    /// Whether the check passed (skipped counts as passed).
    pub passed: bool,
    /// Whether the check was skipped by configuration.
    pub skipped: bool,
    /// One-line summary.
    pub message: String,
    /// Structured findings.
    pub details: serde_json::Value,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Aggregate gate result.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    /// `true` when no blocker failed; warnings never flip this.
    pub passed: bool,
    /// Failed blocker-level checks.
    pub blockers: Vec<CheckResult>,
    /// Failed warning-level checks.
    pub warnings: Vec<CheckResult>,
    /// Every check's result, in chain order.
    pub checks: Vec<CheckResult>,
}

// ---------------------------------------------------------------------------
// ReleaseGate
// ---------------------------------------------------------------------------

/// The ordered validator chain.
pub struct ReleaseGate {
    checks: Vec<Box<dyn GateCheck>>,
    config: GateConfig,
}

impl ReleaseGate {
    /// Create a gate with the standard six-check chain.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            checks: vec![
                Box::new(SyntaxCheck),
                Box::new(DependencyCheck),
                Box::new(SchemaCheck),
                Box::new(TestCoverageCheck),
                Box::new(SecurityCheck),
                Box::new(MigrationReversibilityCheck),
            ],
            config,
        }
    }

    /// Create a gate with an explicit chain (tests and embedders).
    #[must_use]
    pub fn with_checks(config: GateConfig, checks: Vec<Box<dyn GateCheck>>) -> Self {
        Self { checks, config }
    }

    /// Borrow the configuration.
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Names of the chain's checks, in order.
    #[must_use]
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run the chain without event emission.
    pub async fn run(&self, bundle: &Bundle) -> GateReport {
        self.execute(bundle, None, None).await
    }

    /// Run the chain, emitting per-check and summary events for `task_id`.
    pub async fn run_with_events(
        &self,
        bundle: &Bundle,
        bus: &EventBus,
        task_id: &str,
    ) -> GateReport {
        self.execute(bundle, Some(bus), Some(task_id)).await
    }

    async fn execute(
        &self,
        bundle: &Bundle,
        bus: Option<&EventBus>,
        task_id: Option<&str>,
    ) -> GateReport {
        let mut results: Vec<CheckResult> = Vec::with_capacity(self.checks.len());

        for check in &self.checks {
            let name = check.name();
            if let Some(bus) = bus {
                bus.publish(
                    EventKind::ValidationCheckStart,
                    task_id,
                    json!({ "check": name }),
                );
            }

            let start = Instant::now();
            let result = if self.config.skip_checks.iter().any(|s| s == name) {
                CheckResult {
                    name: name.to_string(),
                    level: check.level(),
                    passed: true,
                    skipped: true,
                    message: "skipped by configuration".to_string(),
                    details: serde_json::Value::Null,
                    duration_ms: 0,
                }
            } else {
                match check.run(bundle, &self.config).await {
                    Ok(outcome) => CheckResult {
                        name: name.to_string(),
                        level: check.level(),
                        passed: outcome.passed,
                        skipped: false,
                        message: outcome.message,
                        details: outcome.details,
                        duration_ms: start.elapsed().as_millis() as u64,
                    },
                    // A throwing check is a blocker attributed to the check.
                    Err(e) => {
                        warn!(target: "forge.gate", check = name, error = %e, "check errored");
                        CheckResult {
                            name: name.to_string(),
                            level: CheckLevel::Blocker,
                            passed: false,
                            skipped: false,
                            message: format!("check failed to run: {e}"),
                            details: serde_json::Value::Null,
                            duration_ms: start.elapsed().as_millis() as u64,
                        }
                    }
                }
            };

            debug!(
                target: "forge.gate",
                check = name,
                passed = result.passed,
                skipped = result.skipped,
                duration_ms = result.duration_ms,
                "check complete"
            );
            if let Some(bus) = bus {
                bus.publish(
                    EventKind::ValidationCheckComplete,
                    task_id,
                    json!({
                        "check": name,
                        "passed": result.passed,
                        "skipped": result.skipped,
                        "message": result.message,
                    }),
                );
            }
            results.push(result);
        }

        let blockers: Vec<CheckResult> = results
            .iter()
            .filter(|r| !r.passed && r.level == CheckLevel::Blocker)
            .cloned()
            .collect();
        let warnings: Vec<CheckResult> = results
            .iter()
            .filter(|r| !r.passed && r.level == CheckLevel::Warning)
            .cloned()
            .collect();
        let passed = blockers.is_empty();

        if let Some(bus) = bus {
            bus.publish(
                EventKind::ValidationSummary,
                task_id,
                json!({
                    "passed": passed,
                    "blockers": blockers.len(),
                    "warnings": warnings.len(),
                }),
            );
        }

        GateReport {
            passed,
            blockers,
            warnings,
            checks: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{DataLossRisk, Layer, StepAction};

    fn clean_bundle() -> Bundle {
        forge_bundle_builder()
            .file(
                "src/utils.js",
                StepAction::Create,
                "export const x = 1;\n",
                Layer::Backend,
                "util",
            )
            .test(
                "src/utils.test.js",
                "import { x } from './utils';\ntest('x', () => { expect(x).toBe(1); });\n",
                "src/utils.js",
                "jest",
                None,
            )
            .build()
    }

    // A minimal local stand-in so gate tests do not depend on forge-bundle.
    struct TestBundleBuilder {
        files: Vec<forge_core::FileEntry>,
        tests: Vec<forge_core::TestEntry>,
        migrations: Vec<forge_core::MigrationEntry>,
    }

    fn forge_bundle_builder() -> TestBundleBuilder {
        TestBundleBuilder {
            files: vec![],
            tests: vec![],
            migrations: vec![],
        }
    }

    impl TestBundleBuilder {
        fn file(
            mut self,
            path: &str,
            action: StepAction,
            content: &str,
            layer: Layer,
            description: &str,
        ) -> Self {
            self.files.push(forge_core::FileEntry {
                path: path.into(),
                action,
                checksum: forge_core::content_checksum(content),
                size: content.len() as u64,
                content: content.into(),
                layer,
                description: description.into(),
            });
            self
        }

        fn test(
            mut self,
            path: &str,
            content: &str,
            source_file: &str,
            framework: &str,
            coverage: Option<f64>,
        ) -> Self {
            self.tests.push(forge_core::TestEntry {
                path: path.into(),
                checksum: forge_core::content_checksum(content),
                content: content.into(),
                source_file: source_file.into(),
                framework: framework.into(),
                coverage,
            });
            self
        }

        fn migration(mut self, id: &str, forward: &str, reverse: &str) -> Self {
            self.migrations.push(forge_core::MigrationEntry {
                id: id.into(),
                description: String::new(),
                checksum_forward: forge_core::content_checksum(forward),
                checksum_reverse: forge_core::content_checksum(reverse),
                sql_forward: forward.into(),
                sql_reverse: reverse.into(),
                data_loss_risk: DataLossRisk::Low,
                database: "app".into(),
            });
            self
        }

        fn build(self) -> Bundle {
            Bundle {
                id: "bundle_test".into(),
                bundle_type: forge_core::BundleType::Feature,
                created_at: chrono::Utc::now(),
                plan: None,
                app_spec: None,
                files: self.files,
                tests: self.tests,
                migrations: self.migrations,
                commands: vec![],
                metadata: forge_core::BundleMetadata::default(),
            }
        }
    }

    #[tokio::test]
    async fn clean_bundle_passes_all_checks() {
        let gate = ReleaseGate::new(GateConfig::default());
        let report = gate.run(&clean_bundle()).await;
        assert!(report.passed, "blockers: {:?}", report.blockers);
        assert_eq!(report.checks.len(), 6);
        assert!(report.blockers.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn syntax_blocker_fails_the_gate() {
        let bundle = forge_bundle_builder()
            .file(
                "src/bad.js",
                StepAction::Create,
                "function bad() { return // incomplete",
                Layer::Backend,
                "",
            )
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(!report.passed);
        assert_eq!(report.blockers[0].name, "SyntaxCheck");
    }

    #[tokio::test]
    async fn unresolved_relative_import_fails_dependency_check() {
        let bundle = forge_bundle_builder()
            .file(
                "src/a.js",
                StepAction::Create,
                "import { b } from './missing';\nexport const a = b;\n",
                Layer::Backend,
                "",
            )
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(report.blockers.iter().any(|b| b.name == "DependencyCheck"));
    }

    #[tokio::test]
    async fn resolvable_imports_and_externals_pass() {
        let bundle = forge_bundle_builder()
            .file(
                "src/a.js",
                StepAction::Create,
                "import { b } from './b';\nimport fs from 'fs';\nexport const a = b;\n",
                Layer::Backend,
                "",
            )
            .file("src/b.ts", StepAction::Create, "export const b = 2;\n", Layer::Backend, "")
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(
            !report.blockers.iter().any(|b| b.name == "DependencyCheck"),
            "{:?}",
            report.blockers
        );
    }

    #[tokio::test]
    async fn directory_index_imports_resolve() {
        let bundle = forge_bundle_builder()
            .file(
                "src/a.js",
                StepAction::Create,
                "import { lib } from './lib';\nexport const a = lib;\n",
                Layer::Backend,
                "",
            )
            .file("src/lib/index.ts", StepAction::Create, "export const lib = 1;\n", Layer::Backend, "")
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(!report.blockers.iter().any(|b| b.name == "DependencyCheck"));
    }

    #[tokio::test]
    async fn coverage_below_threshold_blocks() {
        let bundle = forge_bundle_builder()
            .file("src/a.js", StepAction::Create, "export const a = 1;\n", Layer::Backend, "")
            .build();
        let gate = ReleaseGate::new(GateConfig::default()); // 80% threshold
        let report = gate.run(&bundle).await;
        let coverage = report
            .blockers
            .iter()
            .find(|b| b.name == "TestCoverageCheck")
            .expect("coverage should block");
        assert!(coverage.message.contains("0.0%"));
    }

    #[tokio::test]
    async fn zero_threshold_passes_untested_code() {
        let bundle = forge_bundle_builder()
            .file("src/a.js", StepAction::Create, "export const a = 1;\n", Layer::Backend, "")
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(report.passed);
    }

    #[tokio::test]
    async fn security_findings_warn_but_never_block() {
        let bundle = forge_bundle_builder()
            .file(
                "src/danger.js",
                StepAction::Create,
                "const apiKey = \"sk-123456789012345678\";\neval(userInput);\n",
                Layer::Backend,
                "",
            )
            .test("src/danger.test.js", "test('d', () => {});", "src/danger.js", "jest", None)
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(report.passed, "warnings must not block");
        let security = report
            .warnings
            .iter()
            .find(|w| w.name == "SecurityCheck")
            .expect("security findings expected");
        assert!(security.message.contains("finding"));
    }

    #[tokio::test]
    async fn irreversible_migration_blocks() {
        let bundle = forge_bundle_builder()
            .migration("m1", "CREATE TABLE users (id INT);", "")
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(!report.passed);
        assert!(report
            .blockers
            .iter()
            .any(|b| b.name == "MigrationReversibilityCheck"));
    }

    #[tokio::test]
    async fn reversible_migration_passes() {
        let bundle = forge_bundle_builder()
            .migration(
                "m1",
                "CREATE TABLE users (id INT);\nCREATE INDEX idx_users ON users (id);",
                "DROP INDEX idx_users;\nDROP TABLE users;",
            )
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        assert!(report.passed, "{:?}", report.blockers);
    }

    #[tokio::test]
    async fn missing_inverse_op_is_detected() {
        let bundle = forge_bundle_builder()
            .migration(
                "m1",
                "CREATE TABLE a (id INT);\nCREATE TABLE b (id INT);",
                "DROP TABLE a;",
            )
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        let report = gate.run(&bundle).await;
        let migration = report
            .blockers
            .iter()
            .find(|b| b.name == "MigrationReversibilityCheck")
            .unwrap();
        let errors = migration.details["errors"].as_array().unwrap();
        assert!(errors
            .iter()
            .any(|e| e["error"].as_str().unwrap().contains("DROP TABLE b")));
    }

    #[tokio::test]
    async fn skip_checks_records_skipped_and_passes() {
        let bundle = forge_bundle_builder()
            .file("src/a.js", StepAction::Create, "export const a = 1;\n", Layer::Backend, "")
            .build();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 80.0,
            skip_checks: vec!["TestCoverageCheck".into()],
        });
        let report = gate.run(&bundle).await;
        assert!(report.passed);
        let coverage = report
            .checks
            .iter()
            .find(|c| c.name == "TestCoverageCheck")
            .unwrap();
        assert!(coverage.skipped);
    }

    #[tokio::test]
    async fn gate_is_deterministic_across_runs() {
        let bundle = forge_bundle_builder()
            .file(
                "src/bad.js",
                StepAction::Create,
                "function bad() { return // incomplete",
                Layer::Backend,
                "",
            )
            .migration("m1", "CREATE TABLE t (id INT);", "")
            .build();
        let gate = ReleaseGate::new(GateConfig::default());
        let a = gate.run(&bundle).await;
        let b = gate.run(&bundle).await;
        let names =
            |r: &GateReport| r.blockers.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&a), names(&b));
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.warnings.len(), b.warnings.len());
    }

    #[tokio::test]
    async fn events_are_emitted_in_chain_order() {
        let bus = EventBus::new();
        let gate = ReleaseGate::new(GateConfig {
            coverage_threshold: 0.0,
            ..Default::default()
        });
        gate.run_with_events(&clean_bundle(), &bus, "task_x").await;

        let replay = bus.events_since(None, Some("task_x"));
        let starts: Vec<String> = replay
            .events
            .iter()
            .filter(|e| e.kind == EventKind::ValidationCheckStart)
            .map(|e| e.data["check"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            starts,
            vec![
                "SyntaxCheck",
                "DependencyCheck",
                "SchemaCheck",
                "TestCoverageCheck",
                "SecurityCheck",
                "MigrationReversibilityCheck"
            ]
        );
        let completes = replay
            .events
            .iter()
            .filter(|e| e.kind == EventKind::ValidationCheckComplete)
            .count();
        assert_eq!(completes, 6);
        let summary = replay
            .events
            .iter()
            .find(|e| e.kind == EventKind::ValidationSummary)
            .unwrap();
        assert_eq!(summary.data["passed"], true);
        // The summary comes after every per-check event.
        assert_eq!(replay.events.last().unwrap().kind, EventKind::ValidationSummary);
    }
}
