// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios driven with the scripted mock client.

use forge_agents::{
    AgentKind, AgentUsage, Completion, GeneratedFile, MockClient, StepArtifact, StepContext,
    StepOutput, SubAgent, TokenUsage,
};
use forge_core::{EventKind, PhaseName, PlanStep, RequestContext, TaskStatus};
use forge_error::ForgeError;
use forge_runtime::{ApprovalDecision, Orchestrator, OrchestratorConfig, ValidationRetryOptions};
use forge_scheduler::Scheduler;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

// One RSA keypair per test process; generation is the slow part.
fn shared_key_dir() -> PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        std::env::temp_dir().join(format!("forge-scenario-keys-{}", std::process::id()))
    })
    .clone()
}

fn init_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn test_config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        coverage_threshold: 0.0,
        max_retries: 1,
        retry_delays: vec![Duration::from_millis(1)],
        approval_timeout: Duration::from_secs(5),
        state_dir: dir.join("tasks"),
        key_dir: shared_key_dir(),
        ..Default::default()
    }
}

fn simple_plan_json() -> String {
    serde_json::json!({
        "steps": [{
            "id": "s1",
            "action": "create",
            "target": "src/utils.js",
            "description": "add utility module",
            "layer": "backend",
            "depends_on": [],
        }],
        "files": [{"path": "src/utils.js", "action": "create"}],
        "migrations": [],
        "complexity": "low",
        "estimated_duration": "5m",
        "risks": [],
        "dependency_changes": false,
    })
    .to_string()
}

fn risky_plan_json() -> String {
    let files: Vec<serde_json::Value> = (0..15)
        .map(|i| serde_json::json!({"path": format!("src/f{i}.js"), "action": "create"}))
        .collect();
    serde_json::json!({
        "steps": [{
            "id": "s1",
            "action": "create",
            "target": "src/f0.js",
            "description": "first file",
            "layer": "backend",
            "depends_on": [],
        }],
        "files": files,
        "migrations": [{"id": "m1", "description": "add users table"}],
        "complexity": "medium",
        "estimated_duration": "1h",
        "risks": [],
        "dependency_changes": false,
    })
    .to_string()
}

/// Script the mock by prompt role: analyze, plan, then per-agent output.
fn scripted_llm(plan_json: String, code: &'static str, migration_sql: &'static str) -> Arc<MockClient> {
    Arc::new(MockClient::with_handler(move |_call, request| {
        let text = if request.system.contains("analysis") {
            "The request touches one utility module.".to_string()
        } else if request.system.contains("planning") {
            format!("```json\n{plan_json}\n```")
        } else if request.system.contains("migration generator") {
            migration_sql.to_string()
        } else if request.system.contains("test generator") {
            "```js\ntest('utils', () => {});\n```".to_string()
        } else {
            format!("```js\n{code}\n```")
        };
        Ok(Completion {
            text,
            usage: TokenUsage {
                prompt_tokens: 200,
                completion_tokens: 100,
            },
        })
    }))
}

fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn orchestrator(config: OrchestratorConfig, llm: Arc<MockClient>) -> Arc<Orchestrator> {
    init_tracing();
    let _guard = init_lock().lock().unwrap();
    let orchestrator = Orchestrator::new(config, llm);
    orchestrator.initialize().unwrap();
    Arc::new(orchestrator)
}

fn event_kinds(orchestrator: &Orchestrator, task_id: &str) -> Vec<EventKind> {
    orchestrator
        .bus()
        .events_since(None, Some(task_id))
        .events
        .iter()
        .map(|e| e.kind)
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: low-risk happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn low_risk_happy_path_produces_signed_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(simple_plan_json(), "export const x = 1;", "");
    let orchestrator = orchestrator(test_config(dir.path()), llm);

    let task = orchestrator
        .create_task("add a utility module", RequestContext::default())
        .unwrap();
    let outcome = orchestrator.run_task(&task.id).await.unwrap();

    assert!(outcome.success, "error: {:?}", outcome.error);
    let signed = outcome.bundle.expect("signed bundle expected");
    assert_eq!(signed.signature.algorithm, "RSA-SHA256");
    assert_eq!(signed.bundle.files.len(), 1);
    assert_eq!(signed.bundle.files[0].path, "src/utils.js");
    assert!(signed.bundle.files[0].content.contains("export const x = 1;"));
    assert!(orchestrator.signer().verify_own(&signed).unwrap());

    // Metrics recorded real token consumption.
    let record = orchestrator.store().get_task(&task.id).unwrap();
    assert_eq!(record.status, TaskStatus::Complete);
    assert!(record.metrics.tokens_used.total > 0);
    assert_eq!(record.bundle_id.as_deref(), Some(signed.bundle.id.as_str()));

    // Expected event trace.
    let kinds = event_kinds(&orchestrator, &task.id);
    for expected in [
        EventKind::TaskStart,
        EventKind::CodeAnalyzing,
        EventKind::CodePlanning,
        EventKind::CodeGenerating,
        EventKind::CodeValidating,
        EventKind::ValidationSummary,
        EventKind::TaskComplete,
    ] {
        assert!(kinds.contains(&expected), "missing {expected:?} in {kinds:?}");
    }
    let count = |k: EventKind| kinds.iter().filter(|x| **x == k).count();
    assert_eq!(count(EventKind::ValidationCheckStart), 6);
    assert_eq!(count(EventKind::ValidationCheckComplete), 6);
    assert_eq!(count(EventKind::ApprovalRequired), 0);

    // Phase ordering invariant: completion timestamps are monotone.
    let completed = |p: PhaseName| record.phases[&p].completed_at.unwrap();
    assert!(completed(PhaseName::Analyze) <= completed(PhaseName::Plan));
    assert!(completed(PhaseName::Plan) <= completed(PhaseName::Generate));
    assert!(completed(PhaseName::Generate) <= completed(PhaseName::Validate));
}

// ---------------------------------------------------------------------------
// Scenario 2: high-risk plan approved externally
// ---------------------------------------------------------------------------

#[tokio::test]
async fn high_risk_plan_waits_for_approval_then_proceeds() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(risky_plan_json(), "export const f = 1;", "");
    let orchestrator = orchestrator(test_config(dir.path()), llm);

    let task = orchestrator
        .create_task("large feature", RequestContext::default())
        .unwrap();
    let task_id = task.id.clone();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let task_id = task_id.clone();
        tokio::spawn(async move { orchestrator.run_task(&task_id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator
        .submit_approval(
            &task_id,
            ApprovalDecision {
                approved: true,
                reason: None,
                modified_plan: None,
            },
        )
        .unwrap();

    let outcome = runner.await.unwrap().unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);

    let kinds = event_kinds(&orchestrator, &task_id);
    let required = kinds
        .iter()
        .position(|k| *k == EventKind::ApprovalRequired)
        .expect("approval_required expected");
    let received = kinds
        .iter()
        .position(|k| *k == EventKind::ApprovalReceived)
        .expect("approval_received expected");
    assert!(required < received);
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::ApprovalRequired).count(),
        1
    );
    // Pipeline proceeded through validation.
    assert!(kinds.contains(&EventKind::CodeValidating));
}

// ---------------------------------------------------------------------------
// Scenario 3: rejection stops the pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_approval_fails_in_plan_phase() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(risky_plan_json(), "export const f = 1;", "");
    let orchestrator = orchestrator(test_config(dir.path()), llm);

    let task = orchestrator
        .create_task("large feature", RequestContext::default())
        .unwrap();
    let task_id = task.id.clone();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let task_id = task_id.clone();
        tokio::spawn(async move { orchestrator.run_task(&task_id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator
        .submit_approval(
            &task_id,
            ApprovalDecision {
                approved: false,
                reason: Some("Too risky".to_string()),
                modified_plan: None,
            },
        )
        .unwrap();

    let outcome = runner.await.unwrap().unwrap();
    assert!(!outcome.success);
    let error = outcome.error.expect("task error expected");
    assert_eq!(error.phase, Some(PhaseName::Plan));
    assert!(error.recoverable);
    assert!(error.message.contains("Too risky"));

    let kinds = event_kinds(&orchestrator, &task_id);
    assert!(!kinds.contains(&EventKind::CodeGenerating));
    assert!(!kinds.contains(&EventKind::CodeValidating));
    assert!(kinds.contains(&EventKind::TaskError));
}

// ---------------------------------------------------------------------------
// Scenario 4: syntax blocker stops signing
// ---------------------------------------------------------------------------

/// Emits content verbatim, without the code agent's own re-validation, so
/// broken output reaches the gate.
struct RawAgent {
    content: &'static str,
}

#[async_trait::async_trait]
impl SubAgent for RawAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::CodeGen
    }

    async fn execute(
        &self,
        step: &PlanStep,
        _ctx: &StepContext,
    ) -> Result<StepOutput, ForgeError> {
        Ok(StepOutput {
            step_id: step.id.clone(),
            artifact: StepArtifact::File(GeneratedFile {
                path: step.target.clone(),
                action: step.action,
                content: self.content.to_string(),
                layer: step.layer,
                description: step.description.clone(),
            }),
            tokens_used: 42,
        })
    }

    fn usage(&self) -> AgentUsage {
        AgentUsage {
            tokens_used: 0,
            token_budget: 0,
            steps_executed: 0,
        }
    }

    fn reset(&self) {}
}

#[tokio::test]
async fn syntax_blocker_prevents_signed_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(simple_plan_json(), "unused", "");
    let mut agents: BTreeMap<AgentKind, Arc<dyn SubAgent>> = BTreeMap::new();
    agents.insert(
        AgentKind::CodeGen,
        Arc::new(RawAgent {
            content: "function bad() { return // incomplete",
        }),
    );
    let scheduler = Scheduler::with_agents(agents);
    let orchestrator = {
        let _guard = init_lock().lock().unwrap();
        let orchestrator =
            Orchestrator::with_scheduler(test_config(dir.path()), llm, scheduler);
        orchestrator.initialize().unwrap();
        Arc::new(orchestrator)
    };

    let task = orchestrator
        .create_task("add a broken module", RequestContext::default())
        .unwrap();
    let outcome = orchestrator.run_task(&task.id).await.unwrap();

    assert!(!outcome.success);
    assert!(outcome.bundle.is_none(), "no signed bundle on gate failure");
    let report = outcome.gate_report.expect("gate report expected");
    assert!(!report.passed);
    assert!(report.blockers.iter().any(|b| b.name == "SyntaxCheck"));

    let error = outcome.error.expect("task error expected");
    assert_eq!(error.phase, Some(PhaseName::Validate));
    assert!(error.recoverable);
    assert!(
        error.suggestions.iter().any(|s| s.check == "SyntaxCheck"),
        "suggestions: {:?}",
        error.suggestions
    );
}

// ---------------------------------------------------------------------------
// Scenario 5: non-reversible migration blocks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn irreversible_migration_blocks_validation() {
    let dir = tempfile::tempdir().unwrap();
    let plan = serde_json::json!({
        "steps": [{
            "id": "s1",
            "action": "create",
            "target": "migrations/001_users.sql",
            "description": "create users table",
            "layer": "database",
            "depends_on": [],
        }],
        "files": [{"path": "migrations/001_users.sql", "action": "create"}],
        "migrations": [{"id": "m1", "description": "create users table"}],
        "complexity": "low",
        "risks": [],
        "dependency_changes": false,
    })
    .to_string();
    // Forward SQL only; the reverse block is missing.
    let llm = scripted_llm(plan, "unused", "```sql\nCREATE TABLE users (id INT);\n```");
    let mut config = test_config(dir.path());
    config.require_approval = false;
    let orchestrator = orchestrator(config, llm);

    let task = orchestrator
        .create_task("add users table", RequestContext::default())
        .unwrap();
    let outcome = orchestrator.run_task(&task.id).await.unwrap();

    assert!(!outcome.success);
    let report = outcome.gate_report.expect("gate report expected");
    assert!(report
        .blockers
        .iter()
        .any(|b| b.name == "MigrationReversibilityCheck"));
    let error = outcome.error.unwrap();
    assert!(error
        .suggestions
        .iter()
        .any(|s| s.check == "MigrationReversibilityCheck"));
}

// ---------------------------------------------------------------------------
// Scenario 6: signature tamper detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tampered_bundle_fails_verification_until_resigned() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(simple_plan_json(), "export const x = 1;", "");
    let orchestrator = orchestrator(test_config(dir.path()), llm);

    let task = orchestrator
        .create_task("add a utility module", RequestContext::default())
        .unwrap();
    let outcome = orchestrator.run_task(&task.id).await.unwrap();
    let mut signed = outcome.bundle.expect("signed bundle expected");
    let signer = orchestrator.signer();

    assert!(signer.verify_own(&signed).unwrap());

    // One-character mutation flips verification.
    signed.bundle.files[0].content = signed.bundle.files[0].content.replacen('1', "2", 1);
    assert!(!signer.verify_own(&signed).unwrap());

    // Re-signing the mutated bundle verifies again.
    let resigned = signer.sign(&signed.bundle).unwrap();
    assert!(signer.verify_own(&resigned).unwrap());
}

// ---------------------------------------------------------------------------
// Approval timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_timeout_fails_recoverably() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(risky_plan_json(), "export const f = 1;", "");
    let mut config = test_config(dir.path());
    config.approval_timeout = Duration::from_millis(100);
    let orchestrator = orchestrator(config, llm);

    let task = orchestrator
        .create_task("large feature", RequestContext::default())
        .unwrap();
    let outcome = orchestrator.run_task(&task.id).await.unwrap();

    assert!(!outcome.success);
    let error = outcome.error.unwrap();
    assert!(error.message.contains("timed out"));
    assert!(error.recoverable);
    assert_eq!(error.phase, Some(PhaseName::Plan));
    // The rendezvous was disarmed: a late approval is rejected.
    assert!(orchestrator
        .submit_approval(
            &task.id,
            ApprovalDecision {
                approved: true,
                reason: None,
                modified_plan: None,
            },
        )
        .is_err());
}

// ---------------------------------------------------------------------------
// Modified plan merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_with_modified_plan_merges_before_generate() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(risky_plan_json(), "export const f = 1;", "");
    let orchestrator = orchestrator(test_config(dir.path()), llm);

    let task = orchestrator
        .create_task("large feature", RequestContext::default())
        .unwrap();
    let task_id = task.id.clone();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let task_id = task_id.clone();
        tokio::spawn(async move { orchestrator.run_task(&task_id).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Trim the plan to a single target file.
    orchestrator
        .submit_approval(
            &task_id,
            ApprovalDecision {
                approved: true,
                reason: Some("reduced scope".to_string()),
                modified_plan: Some(serde_json::json!({
                    "files": [{"path": "src/f0.js", "action": "create"}],
                })),
            },
        )
        .unwrap();

    let outcome = runner.await.unwrap().unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);

    let kinds = event_kinds(&orchestrator, &task_id);
    assert!(kinds.contains(&EventKind::PlanModified));
    let record = orchestrator.store().get_task(&task_id).unwrap();
    assert_eq!(record.plan.unwrap().files.len(), 1);
}

// ---------------------------------------------------------------------------
// Retry-validation and regenerate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_validation_with_lower_threshold_signs_the_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(simple_plan_json(), "export const x = 1;", "");
    let mut config = test_config(dir.path());
    config.coverage_threshold = 80.0; // no tests generated → coverage 0
    config.require_approval = false;
    let orchestrator = orchestrator(config, llm);

    let task = orchestrator
        .create_task("add a utility module", RequestContext::default())
        .unwrap();
    let outcome = orchestrator.run_task(&task.id).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome
        .gate_report
        .unwrap()
        .blockers
        .iter()
        .any(|b| b.name == "TestCoverageCheck"));

    let retried = orchestrator
        .retry_validation(
            &task.id,
            ValidationRetryOptions {
                coverage_threshold: Some(0.0),
                skip_checks: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert!(retried.success, "error: {:?}", retried.error);
    let signed = retried.bundle.unwrap();
    assert!(orchestrator.get_signed_bundle(&signed.bundle.id).is_some());
    assert_eq!(
        orchestrator.store().get_task(&task.id).unwrap().status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn regenerate_links_a_fresh_task() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(simple_plan_json(), "export const x = 1;", "");
    let orchestrator = orchestrator(test_config(dir.path()), llm);

    let task = orchestrator
        .create_task("add a utility module", RequestContext::default())
        .unwrap();
    orchestrator.run_task(&task.id).await.unwrap();

    let regenerated = orchestrator
        .regenerate(&task.id, Some("use const exports"))
        .unwrap();
    assert_ne!(regenerated.id, task.id);
    assert_eq!(regenerated.regenerated_from.as_deref(), Some(task.id.as_str()));
    assert!(regenerated.request.contains("use const exports"));
    assert_eq!(regenerated.status, TaskStatus::Pending);

    let outcome = orchestrator.run_task(&regenerated.id).await.unwrap();
    assert!(outcome.success);
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_task_recovers_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let llm = scripted_llm(simple_plan_json(), "export const x = 1;", "");
    let config = test_config(dir.path());
    let orchestrator1 = orchestrator(config.clone(), llm);

    let task = orchestrator1
        .create_task("add a utility module", RequestContext::default())
        .unwrap();
    orchestrator1.run_task(&task.id).await.unwrap();
    drop(orchestrator1);

    // A fresh orchestrator over the same state directory recovers the record.
    let llm = scripted_llm(simple_plan_json(), "export const x = 1;", "");
    let orchestrator2 = orchestrator(config, llm);
    let recovered = orchestrator2.store().recover(&task.id).unwrap();
    assert_eq!(recovered.status, TaskStatus::Complete);
    assert!(recovered.bundle_id.is_some());
    assert!(recovered.metrics.tokens_used.total > 0);
}
