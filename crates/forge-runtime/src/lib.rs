// SPDX-License-Identifier: MIT OR Apache-2.0
//! forge-runtime
//!
//! Orchestration layer.
//!
//! Responsibilities:
//! - drive the four-phase pipeline (analyze → plan → generate → validate)
//! - gate risky plans behind an approval rendezvous
//! - account tokens against the shared budget with reservations
//! - persist every status transition before emitting its event
//! - sign the bundle once the release gate passes

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Process-wide metrics and the informational cost model.
pub mod metrics;
/// Plan risk assessment.
pub mod risk;
/// Fix-suggestion generation for validation failures.
pub mod suggest;

mod prompts;

use chrono::Utc;
use forge_agents::{Completion, CompletionRequest, LlmClient, StepContext, StepArtifact};
use forge_budget::{BudgetCategory, BudgetError, BudgetSignal, TokenBudget};
use forge_bundle::BundleBuilder;
use forge_bus::EventBus;
use forge_core::{
    Bundle, EventKind, PhaseName, PhaseStatus, Plan, RequestContext, SignedBundle, TaskError,
    TaskRecord, TaskStatus,
};
use forge_error::{ErrorCode, ForgeError};
use forge_gate::{GateConfig, GateReport, ReleaseGate};
use forge_retry::{RecoveryHooks, RetryHarness, RetrySchedule};
use forge_scheduler::{ScheduleError, Scheduler};
use forge_signer::BundleSigner;
use forge_store::TaskStore;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use metrics::{MetricsSnapshot, RunMetrics, estimate_cost_usd};
pub use risk::assess_risk;
pub use suggest::suggestion_for;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Orchestrator configuration with serde defaults.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Whether medium/high-risk plans block on approval.
    pub require_approval: bool,
    /// How long an approval may stay pending.
    #[serde(with = "duration_secs")]
    pub approval_timeout: Duration,
    /// Release-gate coverage threshold (percent).
    pub coverage_threshold: f64,
    /// Retry cap for phase operations.
    pub max_retries: u32,
    /// Retry delay schedule for phase operations.
    #[serde(with = "duration_secs_vec")]
    pub retry_delays: Vec<Duration>,
    /// Total token budget for the process.
    pub token_budget: u64,
    /// Tokens reserved per phase LLM call.
    pub phase_reservation: u64,
    /// Directory for persisted task records.
    pub state_dir: PathBuf,
    /// Directory for the signing keypair.
    pub key_dir: PathBuf,
    /// Target database name for migrations.
    pub database: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            require_approval: true,
            approval_timeout: Duration::from_secs(300),
            coverage_threshold: 80.0,
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            token_budget: 1_000_000,
            phase_reservation: 20_000,
            state_dir: PathBuf::from("forge-data/tasks"),
            key_dir: PathBuf::from("forge-data/keys"),
            database: "app".to_string(),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_secs_vec {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(d)?
            .into_iter()
            .map(Duration::from_secs)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// An external approval decision for a blocked task.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApprovalDecision {
    /// Whether the plan may proceed.
    pub approved: bool,
    /// Optional human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Optional plan modifications, merged by top-level field.
    #[serde(default)]
    pub modified_plan: Option<Value>,
}

/// Options for re-running validation on a failed task.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct ValidationRetryOptions {
    /// Override the coverage threshold.
    pub coverage_threshold: Option<f64>,
    /// Check names to skip.
    pub skip_checks: Vec<String>,
}

/// Final result of driving one task through the pipeline.
#[derive(Debug)]
pub struct TaskOutcome {
    /// The task id.
    pub task_id: String,
    /// Whether a signed bundle was produced.
    pub success: bool,
    /// The signed bundle, on success.
    pub bundle: Option<SignedBundle>,
    /// The gate report, when validation ran.
    pub gate_report: Option<GateReport>,
    /// The task error, on failure.
    pub error: Option<TaskError>,
}

// ---------------------------------------------------------------------------
// Phase recovery hooks
// ---------------------------------------------------------------------------

/// Recovery state shared between the retry harness and prompt assembly.
struct PhaseRecovery {
    context_limit: AtomicUsize,
    feedback: Mutex<Vec<String>>,
    timeout_raised: AtomicBool,
}

impl PhaseRecovery {
    fn new(context_files: usize) -> Self {
        Self {
            context_limit: AtomicUsize::new(context_files),
            feedback: Mutex::new(Vec::new()),
            timeout_raised: AtomicBool::new(false),
        }
    }

    fn context_limit(&self) -> usize {
        self.context_limit.load(Ordering::Relaxed)
    }

    fn feedback(&self) -> Vec<String> {
        self.feedback.lock().expect("feedback lock poisoned").clone()
    }

    fn timeout_was_raised(&self) -> bool {
        self.timeout_raised.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl RecoveryHooks for PhaseRecovery {
    async fn reduce_context(&self, _attempt: u32) {
        // Halve the number of context files fed into the next prompt.
        let current = self.context_limit.load(Ordering::Relaxed);
        self.context_limit.store(current / 2, Ordering::Relaxed);
    }

    async fn add_feedback(&self, message: &str) {
        self.feedback
            .lock()
            .expect("feedback lock poisoned")
            .push(message.to_string());
    }

    async fn increase_timeout(&self) {
        self.timeout_raised.store(true, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The pipeline state machine.
///
/// One orchestrator serves many tasks; each task is driven by a single
/// [`run_task`](Self::run_task) call (one orchestration loop per task id),
/// while tasks run concurrently against the shared bus, budget, and signer.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<TaskStore>,
    bus: Arc<EventBus>,
    budget: Arc<TokenBudget>,
    signer: Arc<BundleSigner>,
    scheduler: Scheduler,
    llm: Arc<dyn LlmClient>,
    approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    bundles: Mutex<HashMap<String, Bundle>>,
    signed: Mutex<HashMap<String, SignedBundle>>,
    metrics: RunMetrics,
}

impl Orchestrator {
    /// Create an orchestrator with default components over one client.
    #[must_use]
    pub fn new(config: OrchestratorConfig, llm: Arc<dyn LlmClient>) -> Self {
        let scheduler = Scheduler::new(Arc::clone(&llm));
        Self::with_scheduler(config, llm, scheduler)
    }

    /// Create an orchestrator with an explicit scheduler (tests and
    /// embedders that swap sub-agents).
    #[must_use]
    pub fn with_scheduler(
        config: OrchestratorConfig,
        llm: Arc<dyn LlmClient>,
        scheduler: Scheduler,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let budget = Arc::new(TokenBudget::new(config.token_budget));

        // Budget signals surface as bus events.
        let signal_bus = Arc::clone(&bus);
        budget.on_signal(move |signal| {
            let (kind, data) = match signal {
                BudgetSignal::Warning { .. } => (
                    EventKind::BudgetWarning,
                    serde_json::to_value(signal).unwrap_or_default(),
                ),
                BudgetSignal::Exceeded { .. } => (
                    EventKind::BudgetExceeded,
                    serde_json::to_value(signal).unwrap_or_default(),
                ),
            };
            signal_bus.publish(kind, None, data);
        });

        Self {
            store: Arc::new(TaskStore::new(&config.state_dir)),
            signer: Arc::new(BundleSigner::new(&config.key_dir)),
            bus,
            budget,
            scheduler,
            llm,
            approvals: Mutex::new(HashMap::new()),
            bundles: Mutex::new(HashMap::new()),
            signed: Mutex::new(HashMap::new()),
            metrics: RunMetrics::new(),
            config,
        }
    }

    /// Load (or generate) the signing keypair. Call before the first task.
    ///
    /// # Errors
    ///
    /// Propagates signer key I/O and generation failures.
    pub fn initialize(&self) -> Result<(), ForgeError> {
        self.signer.initialize().map_err(|e| {
            ForgeError::new(ErrorCode::KeyIoFailed, "signer initialization failed").with_source(e)
        })
    }

    /// Drain bus subscribers. Pending tasks keep running but stop emitting.
    pub fn shutdown(&self) {
        self.bus.shutdown();
    }

    /// The shared event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The task store.
    #[must_use]
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// The shared token budget.
    #[must_use]
    pub fn budget(&self) -> &Arc<TokenBudget> {
        &self.budget
    }

    /// The bundle signer.
    #[must_use]
    pub fn signer(&self) -> &Arc<BundleSigner> {
        &self.signer
    }

    /// Process-wide metrics snapshot.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Look up a signed bundle by bundle id.
    #[must_use]
    pub fn get_signed_bundle(&self, bundle_id: &str) -> Option<SignedBundle> {
        self.signed
            .lock()
            .expect("signed lock poisoned")
            .get(bundle_id)
            .cloned()
    }

    /// Create a pending task for a request.
    ///
    /// # Errors
    ///
    /// Propagates store persistence failures.
    pub fn create_task(
        &self,
        request: &str,
        context: RequestContext,
    ) -> Result<TaskRecord, ForgeError> {
        self.store
            .create_task(request, context)
            .map_err(Self::store_error)
    }

    /// Resolve a pending approval for a blocked task.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::TaskInvalidState`] when the task is not awaiting
    /// approval.
    pub fn submit_approval(
        &self,
        task_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), ForgeError> {
        let sender = self
            .approvals
            .lock()
            .expect("approval lock poisoned")
            .remove(task_id)
            .ok_or_else(|| {
                ForgeError::new(
                    ErrorCode::TaskInvalidState,
                    format!("task {task_id} is not awaiting approval"),
                )
            })?;
        sender.send(decision).map_err(|_| {
            ForgeError::new(ErrorCode::Internal, "approval rendezvous already resolved")
        })
    }

    /// Create a new task linked to a failed one, with fix instructions
    /// appended to the request.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::TaskNotFound`] for unknown ids; store failures.
    pub fn regenerate(
        &self,
        task_id: &str,
        fix_instructions: Option<&str>,
    ) -> Result<TaskRecord, ForgeError> {
        let original = self.store.get_task(task_id).ok_or_else(|| {
            ForgeError::new(ErrorCode::TaskNotFound, format!("task not found: {task_id}"))
        })?;
        let mut request = original.request.clone();
        if let Some(fix) = fix_instructions {
            request.push_str("\n\nFix instructions:\n");
            request.push_str(fix);
        }
        let mut record = TaskRecord::new(request, original.context.clone());
        record.regenerated_from = Some(original.id.clone());
        self.store.insert(record.clone()).map_err(Self::store_error)?;
        info!(
            target: "forge.runtime",
            original = %original.id,
            regenerated = %record.id,
            "task regenerated"
        );
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// Drive a pending task through the full pipeline.
    ///
    /// Pipeline failures are reported in the returned [`TaskOutcome`] (and
    /// on the task record), not as `Err`.
    ///
    /// # Errors
    ///
    /// Only caller misuse errors: unknown task id or a task that is not
    /// pending.
    pub async fn run_task(&self, task_id: &str) -> Result<TaskOutcome, ForgeError> {
        let task = self.store.get_task(task_id).ok_or_else(|| {
            ForgeError::new(ErrorCode::TaskNotFound, format!("task not found: {task_id}"))
        })?;
        if task.status != TaskStatus::Pending {
            return Err(ForgeError::new(
                ErrorCode::TaskInvalidState,
                format!("task {task_id} is {}, expected pending", task.status.as_str()),
            ));
        }

        let run_start = Instant::now();
        self.bus.publish(
            EventKind::TaskStart,
            Some(task_id),
            json!({ "request": task.request }),
        );

        // -- analyze --
        let analysis = match self.run_analyze(&task).await {
            Ok(analysis) => analysis,
            Err(e) => return Ok(self.finish_failed(task_id, PhaseName::Analyze, e, run_start)),
        };

        // -- plan --
        let plan = match self.run_plan(&task, &analysis).await {
            Ok(plan) => plan,
            Err(e) => return Ok(self.finish_failed(task_id, PhaseName::Plan, e, run_start)),
        };

        // -- approval checkpoint --
        let plan = match self.approval_checkpoint(task_id, plan).await {
            Ok(plan) => plan,
            Err(e) => return Ok(self.finish_failed(task_id, PhaseName::Plan, e, run_start)),
        };

        // -- generate --
        let bundle = match self.run_generate(&task, &plan).await {
            Ok(bundle) => bundle,
            Err(e) => return Ok(self.finish_failed(task_id, PhaseName::Generate, e, run_start)),
        };

        // -- validate --
        let gate_config = GateConfig {
            coverage_threshold: self.config.coverage_threshold,
            skip_checks: Vec::new(),
        };
        self.run_validate(task_id, &bundle, gate_config, run_start)
            .await
    }

    /// Re-run the release gate over a failed task's bundle.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::TaskNotFound`] / [`ErrorCode::TaskInvalidState`] when
    /// the task is unknown, not failed, or has no bundle to validate.
    pub async fn retry_validation(
        &self,
        task_id: &str,
        options: ValidationRetryOptions,
    ) -> Result<TaskOutcome, ForgeError> {
        let task = self.store.get_task(task_id).ok_or_else(|| {
            ForgeError::new(ErrorCode::TaskNotFound, format!("task not found: {task_id}"))
        })?;
        if task.status != TaskStatus::Failed {
            return Err(ForgeError::new(
                ErrorCode::TaskInvalidState,
                format!("task {task_id} is {}, expected failed", task.status.as_str()),
            ));
        }
        let bundle = self
            .bundles
            .lock()
            .expect("bundle lock poisoned")
            .get(task_id)
            .cloned()
            .ok_or_else(|| {
                ForgeError::new(
                    ErrorCode::TaskInvalidState,
                    format!("task {task_id} has no bundle to validate"),
                )
            })?;

        let gate_config = GateConfig {
            coverage_threshold: options
                .coverage_threshold
                .unwrap_or(self.config.coverage_threshold),
            skip_checks: options.skip_checks,
        };
        self.run_validate(task_id, &bundle, gate_config, Instant::now())
            .await
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn run_analyze(&self, task: &TaskRecord) -> Result<Value, ForgeError> {
        self.phase_started(
            &task.id,
            PhaseName::Analyze,
            TaskStatus::Analyzing,
            EventKind::CodeAnalyzing,
        )?;
        let tokens_before = self.budget.used();
        let started = Instant::now();

        let recovery = Arc::new(PhaseRecovery::new(task.context.files.len()));
        let harness = self.harness(Arc::clone(&recovery));
        let result = harness
            .run(|_attempt| {
                let request = prompts::analyze_request(
                    &task.request,
                    &task.context,
                    recovery.context_limit(),
                    &recovery.feedback(),
                );
                async move { self.call_llm(BudgetCategory::Analyze, request).await }
            })
            .await;

        if recovery.timeout_was_raised() {
            debug!(target: "forge.runtime", task = %task.id, "analyze timeout was raised once");
        }
        match result {
            Ok(completion) => {
                let analysis = json!({ "summary": completion.text });
                self.phase_completed(
                    &task.id,
                    PhaseName::Analyze,
                    analysis.clone(),
                    tokens_before,
                    started,
                )?;
                Ok(analysis)
            }
            Err(e) => {
                self.phase_errored(&task.id, PhaseName::Analyze, &e);
                Err(e)
            }
        }
    }

    async fn run_plan(&self, task: &TaskRecord, analysis: &Value) -> Result<Plan, ForgeError> {
        self.phase_started(
            &task.id,
            PhaseName::Plan,
            TaskStatus::Planning,
            EventKind::CodePlanning,
        )?;
        let tokens_before = self.budget.used();
        let started = Instant::now();
        let summary = analysis["summary"].as_str().unwrap_or_default().to_string();

        let recovery = Arc::new(PhaseRecovery::new(task.context.files.len()));
        let harness = self.harness(Arc::clone(&recovery));
        let result = harness
            .run(|_attempt| {
                let request = prompts::plan_request(
                    &task.request,
                    &summary,
                    &task.context,
                    recovery.context_limit(),
                    &recovery.feedback(),
                );
                async move {
                    let completion = self.call_llm(BudgetCategory::Plan, request).await?;
                    parse_plan(&completion.text)
                }
            })
            .await;

        match result {
            Ok(plan) => {
                let plan_value = serde_json::to_value(&plan).unwrap_or_default();
                let stored_plan = plan.clone();
                self.store
                    .modify(&task.id, move |t| t.plan = Some(stored_plan))
                    .map_err(Self::store_error)?;
                self.phase_completed(
                    &task.id,
                    PhaseName::Plan,
                    json!({ "plan": plan_value }),
                    tokens_before,
                    started,
                )?;
                Ok(plan)
            }
            Err(e) => {
                self.phase_errored(&task.id, PhaseName::Plan, &e);
                Err(e)
            }
        }
    }

    /// Block medium/high-risk plans on an external decision.
    async fn approval_checkpoint(&self, task_id: &str, plan: Plan) -> Result<Plan, ForgeError> {
        let risk = assess_risk(&plan);
        debug!(target: "forge.runtime", task = task_id, risk = ?risk, "risk assessed");
        if !(risk.requires_approval() && self.config.require_approval) {
            return Ok(plan);
        }

        // Persist the blocked state before announcing it.
        self.store
            .modify(task_id, |t| t.status = TaskStatus::AwaitingApproval)
            .map_err(Self::store_error)?;
        let (sender, receiver) = oneshot::channel();
        self.approvals
            .lock()
            .expect("approval lock poisoned")
            .insert(task_id.to_string(), sender);
        self.bus.publish(
            EventKind::ApprovalRequired,
            Some(task_id),
            json!({
                "risk": risk,
                "files": plan.files.len(),
                "migrations": plan.migrations.len(),
                "complexity": plan.complexity,
            }),
        );

        let decision = tokio::select! {
            decision = receiver => decision.ok(),
            () = tokio::time::sleep(self.config.approval_timeout) => None,
        };
        // Disarm the rendezvous whichever way it resolved.
        self.approvals
            .lock()
            .expect("approval lock poisoned")
            .remove(task_id);

        let Some(decision) = decision else {
            return Err(ForgeError::new(
                ErrorCode::ApprovalTimeout,
                "approval timed out",
            )
            .with_context("reason", "timeout"));
        };

        self.bus.publish(
            EventKind::ApprovalReceived,
            Some(task_id),
            json!({ "approved": decision.approved, "reason": decision.reason.clone() }),
        );

        if !decision.approved {
            let reason = decision.reason.unwrap_or_else(|| "rejected".to_string());
            return Err(
                ForgeError::new(ErrorCode::ApprovalRejected, format!("plan rejected: {reason}"))
                    .with_context("reason", reason),
            );
        }

        let plan = match decision.modified_plan {
            None => plan,
            Some(modification) => {
                let merged = merge_plan(&plan, modification)?;
                let stored_plan = merged.clone();
                self.store
                    .modify(task_id, move |t| t.plan = Some(stored_plan))
                    .map_err(Self::store_error)?;
                self.bus.publish(
                    EventKind::PlanModified,
                    Some(task_id),
                    json!({ "steps": merged.steps.len(), "files": merged.files.len() }),
                );
                merged
            }
        };
        Ok(plan)
    }

    async fn run_generate(&self, task: &TaskRecord, plan: &Plan) -> Result<Bundle, ForgeError> {
        self.phase_started(
            &task.id,
            PhaseName::Generate,
            TaskStatus::Generating,
            EventKind::CodeGenerating,
        )?;
        let tokens_before = self.budget.used();
        let started = Instant::now();

        let ctx = StepContext {
            request: task.request.clone(),
            context_files: task.context.files.clone(),
            database: self.config.database.clone(),
        };

        let reservation = self
            .budget
            .reserve(BudgetCategory::Agentic, self.config.phase_reservation)
            .map_err(Self::budget_error)?;

        let run = self
            .scheduler
            .run_with_events(&plan.steps, &ctx, &self.bus, &task.id)
            .await;

        let result: Result<Bundle, ForgeError> = match run {
            Err(ScheduleError::CircularDependency { remaining }) => {
                Err(
                    ForgeError::new(ErrorCode::CircularDependency, "plan steps contain a cycle")
                        .with_context("remaining", remaining),
                )
            }
            Ok(run) => {
                let consumed = run.tokens_used.min(self.config.phase_reservation);
                if consumed > 0 {
                    if let Err(e) = self.budget.consume(&reservation, consumed) {
                        warn!(target: "forge.runtime", task = %task.id, error = %e, "agentic consume failed");
                    }
                }
                if !run.all_succeeded {
                    let failures = run
                        .failures()
                        .into_iter()
                        .map(|(step, error)| format!("{step}: {error}"))
                        .collect::<Vec<_>>()
                        .join("; ");
                    Err(ForgeError::new(
                        ErrorCode::StepFailed,
                        format!("generation failed: {failures}"),
                    ))
                } else {
                    let mut builder = BundleBuilder::new()
                        .plan(serde_json::to_value(plan).unwrap_or_default())
                        .tokens_used(run.tokens_used)
                        .duration_ms(started.elapsed().as_millis() as u64);
                    for output in run.outputs() {
                        builder = match &output.artifact {
                            StepArtifact::File(f) => builder.file(
                                &f.path,
                                f.action,
                                &f.content,
                                f.layer,
                                &f.description,
                            ),
                            StepArtifact::Test(t) => builder.test(
                                &t.path,
                                &t.content,
                                &t.source_file,
                                &t.framework,
                                None,
                            ),
                            StepArtifact::Migration(m) => builder.migration(
                                &m.id,
                                &m.description,
                                &m.sql_forward,
                                &m.sql_reverse,
                                m.data_loss_risk,
                                &m.database,
                            ),
                        };
                    }
                    Ok(builder.build())
                }
            }
        };
        // The reservation never outlives the phase.
        let _ = self.budget.release(&reservation);

        match result {
            Ok(bundle) => {
                self.bundles
                    .lock()
                    .expect("bundle lock poisoned")
                    .insert(task.id.clone(), bundle.clone());
                let bundle_id = bundle.id.clone();
                self.store
                    .modify(&task.id, move |t| t.bundle_id = Some(bundle_id))
                    .map_err(Self::store_error)?;
                self.phase_completed(
                    &task.id,
                    PhaseName::Generate,
                    json!({
                        "bundle_id": bundle.id,
                        "files": bundle.files.len(),
                        "tests": bundle.tests.len(),
                        "migrations": bundle.migrations.len(),
                    }),
                    tokens_before,
                    started,
                )?;
                Ok(bundle)
            }
            Err(e) => {
                self.phase_errored(&task.id, PhaseName::Generate, &e);
                Err(e)
            }
        }
    }

    async fn run_validate(
        &self,
        task_id: &str,
        bundle: &Bundle,
        gate_config: GateConfig,
        run_start: Instant,
    ) -> Result<TaskOutcome, ForgeError> {
        self.phase_started(
            task_id,
            PhaseName::Validate,
            TaskStatus::Validating,
            EventKind::CodeValidating,
        )?;
        let tokens_before = self.budget.used();
        let started = Instant::now();

        let gate = ReleaseGate::new(gate_config);
        let report = gate.run_with_events(bundle, &self.bus, task_id).await;

        if report.passed {
            let signed = self.signer.sign(bundle).map_err(|e| {
                ForgeError::new(ErrorCode::SignatureFailed, "bundle signing failed").with_source(e)
            });
            let signed = match signed {
                Ok(signed) => signed,
                Err(e) => {
                    self.phase_errored(task_id, PhaseName::Validate, &e);
                    return Ok(self.finish_failed(task_id, PhaseName::Validate, e, run_start));
                }
            };
            self.signed
                .lock()
                .expect("signed lock poisoned")
                .insert(signed.bundle.id.clone(), signed.clone());

            self.phase_completed(
                task_id,
                PhaseName::Validate,
                json!({ "passed": true, "warnings": report.warnings.len() }),
                tokens_before,
                started,
            )?;
            let total_tokens = self
                .store
                .modify(task_id, |t| t.status = TaskStatus::Complete)
                .map_err(Self::store_error)?
                .metrics
                .tokens_used
                .total;
            self.bus.publish(
                EventKind::TaskComplete,
                Some(task_id),
                json!({ "bundle_id": signed.bundle.id, "warnings": report.warnings.len() }),
            );
            self.metrics
                .record_task(run_start.elapsed().as_millis() as u64, total_tokens, true);
            info!(target: "forge.runtime", task = task_id, bundle = %signed.bundle.id, "task complete");

            Ok(TaskOutcome {
                task_id: task_id.to_string(),
                success: true,
                bundle: Some(signed),
                gate_report: Some(report),
                error: None,
            })
        } else {
            let suggestions = suggest::for_report(&report);
            let error = TaskError {
                message: format!(
                    "validation failed: {} blocking check(s)",
                    report.blockers.len()
                ),
                phase: Some(PhaseName::Validate),
                recoverable: true,
                blockers: report
                    .blockers
                    .iter()
                    .map(|b| serde_json::to_value(b).unwrap_or_default())
                    .collect(),
                warnings: report
                    .warnings
                    .iter()
                    .map(|w| serde_json::to_value(w).unwrap_or_default())
                    .collect(),
                suggestions,
            };
            self.store
                .modify(task_id, {
                    let error = error.clone();
                    move |t| {
                        t.status = TaskStatus::Failed;
                        if let Some(phase) = t.phases.get_mut(&PhaseName::Validate) {
                            phase.status = PhaseStatus::Failed;
                            phase.error = Some(error.message.clone());
                            phase.completed_at = Some(Utc::now());
                        }
                        t.error = Some(error);
                    }
                })
                .map_err(Self::store_error)?;
            self.bus.publish(
                EventKind::TaskError,
                Some(task_id),
                json!({
                    "message": error.message,
                    "phase": "validate",
                    "recoverable": true,
                    "blockers": error.blockers.len(),
                }),
            );
            self.metrics
                .record_task(run_start.elapsed().as_millis() as u64, 0, false);
            warn!(target: "forge.runtime", task = task_id, "validation failed");

            Ok(TaskOutcome {
                task_id: task_id.to_string(),
                success: false,
                bundle: None,
                gate_report: Some(report),
                error: Some(error),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Record keeping
    // -----------------------------------------------------------------------

    fn phase_started(
        &self,
        task_id: &str,
        phase: PhaseName,
        status: TaskStatus,
        event: EventKind,
    ) -> Result<(), ForgeError> {
        self.store
            .modify(task_id, move |t| {
                t.status = status;
                if let Some(record) = t.phases.get_mut(&phase) {
                    record.status = PhaseStatus::InProgress;
                    record.started_at = Some(Utc::now());
                }
            })
            .map_err(Self::store_error)?;
        self.bus
            .publish(event, Some(task_id), json!({ "phase": phase.as_str() }));
        Ok(())
    }

    fn phase_completed(
        &self,
        task_id: &str,
        phase: PhaseName,
        result: Value,
        tokens_before: u64,
        started: Instant,
    ) -> Result<(), ForgeError> {
        let tokens_delta = self.budget.used().saturating_sub(tokens_before);
        let duration_ms = started.elapsed().as_millis() as u64;
        self.store
            .modify(task_id, move |t| {
                if let Some(record) = t.phases.get_mut(&phase) {
                    record.status = PhaseStatus::Complete;
                    record.result = Some(result);
                    record.completed_at = Some(Utc::now());
                }
                let name = phase.as_str().to_string();
                t.metrics.tokens_used.total += tokens_delta;
                *t.metrics.tokens_used.by_phase.entry(name.clone()).or_insert(0) += tokens_delta;
                *t.metrics.duration_ms.entry(name).or_insert(0) += duration_ms;
                t.metrics.total_duration_ms += duration_ms;
                t.metrics.estimated_cost_usd = estimate_cost_usd(t.metrics.tokens_used.total);
            })
            .map_err(Self::store_error)?;
        debug!(
            target: "forge.runtime",
            task = task_id,
            phase = phase.as_str(),
            tokens = tokens_delta,
            duration_ms,
            "phase complete"
        );
        Ok(())
    }

    /// Mark a phase failed; best-effort, the original error wins.
    fn phase_errored(&self, task_id: &str, phase: PhaseName, error: &ForgeError) {
        let message = error.to_string();
        if let Err(e) = self.store.modify(task_id, move |t| {
            if let Some(record) = t.phases.get_mut(&phase) {
                record.status = PhaseStatus::Failed;
                record.error = Some(message);
                record.completed_at = Some(Utc::now());
            }
        }) {
            warn!(target: "forge.runtime", task = task_id, error = %e, "phase record update failed");
        }
    }

    /// Mark the whole task failed, persist, emit `task_error`.
    fn finish_failed(
        &self,
        task_id: &str,
        phase: PhaseName,
        error: ForgeError,
        run_start: Instant,
    ) -> TaskOutcome {
        let recoverable = is_recoverable(&error);
        let task_error = TaskError {
            message: error.to_string(),
            phase: Some(phase),
            recoverable,
            blockers: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
        };
        let stored = task_error.clone();
        if let Err(e) = self.store.modify(task_id, move |t| {
            t.status = TaskStatus::Failed;
            t.error = Some(stored);
        }) {
            warn!(target: "forge.runtime", task = task_id, error = %e, "failure persistence failed");
        }
        self.bus.publish(
            EventKind::TaskError,
            Some(task_id),
            json!({
                "message": task_error.message,
                "phase": phase.as_str(),
                "recoverable": recoverable,
                "code": error.code.as_str(),
            }),
        );
        self.metrics
            .record_task(run_start.elapsed().as_millis() as u64, 0, false);
        warn!(
            target: "forge.runtime",
            task = task_id,
            phase = phase.as_str(),
            code = error.code.as_str(),
            "task failed"
        );
        TaskOutcome {
            task_id: task_id.to_string(),
            success: false,
            bundle: None,
            gate_report: None,
            error: Some(task_error),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn harness(&self, recovery: Arc<PhaseRecovery>) -> RetryHarness {
        RetryHarness::new(RetrySchedule::new(
            self.config.retry_delays.clone(),
            self.config.max_retries,
        ))
        .with_hooks(recovery)
    }

    /// One LLM call under a budget reservation owned by the call.
    async fn call_llm(
        &self,
        category: BudgetCategory,
        request: CompletionRequest,
    ) -> Result<Completion, ForgeError> {
        let reservation = self
            .budget
            .reserve(category, self.config.phase_reservation)
            .map_err(Self::budget_error)?;
        match self.llm.complete(request).await {
            Ok(completion) => {
                let used = completion.usage.total().min(self.config.phase_reservation);
                if used > 0 {
                    self.budget
                        .consume(&reservation, used)
                        .map_err(Self::budget_error)?;
                }
                // A fully consumed reservation is already gone.
                let _ = self.budget.release(&reservation);
                Ok(completion)
            }
            Err(e) => {
                let _ = self.budget.release(&reservation);
                Err(e)
            }
        }
    }

    fn budget_error(error: BudgetError) -> ForgeError {
        let code = match &error {
            BudgetError::InsufficientBudget { .. } => ErrorCode::BudgetInsufficient,
            BudgetError::InvalidReservation { .. } => ErrorCode::ReservationInvalid,
            BudgetError::ReservationExceeded { .. } => ErrorCode::ReservationExceeded,
        };
        ForgeError::new(code, error.to_string())
    }

    fn store_error(error: forge_store::StoreError) -> ForgeError {
        ForgeError::new(ErrorCode::StoreIoFailed, error.to_string()).with_source(error)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state_dir", &self.config.state_dir)
            .field("require_approval", &self.config.require_approval)
            .finish()
    }
}

/// Parse a plan out of a model response (fenced JSON or raw).
fn parse_plan(text: &str) -> Result<Plan, ForgeError> {
    let body = forge_agents::extract_code_block(text);
    serde_json::from_str(&body).map_err(|e| {
        ForgeError::new(
            ErrorCode::GenerationMalformed,
            format!("plan response did not parse as JSON: {e}"),
        )
    })
}

/// Merge a plan modification by top-level field.
fn merge_plan(plan: &Plan, modification: Value) -> Result<Plan, ForgeError> {
    let Value::Object(modification) = modification else {
        return Err(ForgeError::new(
            ErrorCode::TaskInvalidState,
            "modified_plan must be a JSON object",
        ));
    };
    let mut value = serde_json::to_value(plan)
        .map_err(|e| ForgeError::new(ErrorCode::Internal, e.to_string()))?;
    let object = value.as_object_mut().expect("plan serializes to an object");
    for (key, field) in modification {
        object.insert(key, field);
    }
    serde_json::from_value(value).map_err(|e| {
        ForgeError::new(
            ErrorCode::TaskInvalidState,
            format!("modified plan is invalid: {e}"),
        )
    })
}

/// Whether a pipeline failure leaves the task retryable by the client.
fn is_recoverable(error: &ForgeError) -> bool {
    match error.code {
        ErrorCode::ApprovalTimeout
        | ErrorCode::ApprovalRejected
        | ErrorCode::GateBlocked
        | ErrorCode::GenerationMalformed
        | ErrorCode::StepFailed
        | ErrorCode::ToolFailed
        | ErrorCode::CircularDependency => true,
        ErrorCode::BudgetExceeded
        | ErrorCode::BudgetInsufficient
        | ErrorCode::LlmAuthFailed => false,
        _ => error.class().is_retryable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = OrchestratorConfig::default();
        assert!(config.require_approval);
        assert_eq!(config.approval_timeout, Duration::from_secs(300));
        assert_eq!(config.coverage_threshold, 80.0);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delays.len(), 3);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"approval_timeout": 60, "coverage_threshold": 50.0}"#)
                .unwrap();
        assert_eq!(config.approval_timeout, Duration::from_secs(60));
        assert_eq!(config.coverage_threshold, 50.0);
        assert!(config.require_approval);
    }

    #[test]
    fn parse_plan_accepts_fenced_and_raw_json() {
        let raw = r#"{"steps": [], "complexity": "low"}"#;
        assert!(parse_plan(raw).is_ok());
        let fenced = format!("```json\n{raw}\n```");
        assert!(parse_plan(&fenced).is_ok());
        assert!(parse_plan("not json").is_err());
    }

    #[test]
    fn merge_plan_replaces_top_level_fields() {
        let plan: Plan = serde_json::from_value(json!({
            "steps": [{"id": "s1", "action": "create", "target": "a.js", "description": "x"}],
            "complexity": "low",
            "risks": ["one"],
        }))
        .unwrap();
        let merged = merge_plan(&plan, json!({"risks": [], "complexity": "high"})).unwrap();
        assert!(merged.risks.is_empty());
        assert_eq!(merged.complexity, forge_core::Complexity::High);
        assert_eq!(merged.steps.len(), 1);
    }

    #[test]
    fn merge_plan_rejects_non_objects() {
        let plan = Plan::default();
        assert!(merge_plan(&plan, json!(42)).is_err());
    }

    #[test]
    fn recoverability_policy() {
        assert!(is_recoverable(&ForgeError::new(
            ErrorCode::ApprovalRejected,
            "no"
        )));
        assert!(is_recoverable(&ForgeError::new(ErrorCode::StepFailed, "x")));
        assert!(!is_recoverable(&ForgeError::new(
            ErrorCode::BudgetExceeded,
            "x"
        )));
        assert!(!is_recoverable(&ForgeError::new(
            ErrorCode::LlmAuthFailed,
            "x"
        )));
    }
}
