// SPDX-License-Identifier: MIT OR Apache-2.0
//! forge-core
//!
//! The stable contract for Bundle Forge.
//!
//! Everything that crosses a component boundary lives here: task and phase
//! records, plans and their steps, bundles, events, and the canonical
//! JSON / SHA-256 helpers every other crate hashes with.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Bundle, file/test/migration/command entries, and signature block.
pub mod bundle;
/// Typed events and the closed event-kind set.
pub mod event;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use bundle::{
    Bundle, BundleMetadata, BundleType, CommandEntry, CommandPhase, DataLossRisk, FileEntry,
    MigrationEntry, SignatureBlock, SignedBundle, TestEntry,
};
pub use event::{Event, EventKind};

// ---------------------------------------------------------------------------
// Task lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// A task is created `Pending`, walks the phase states in order, and
/// terminates in `Complete` or `Failed`. `AwaitingApproval` is entered only
/// when the plan's risk level requires a human decision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up by the orchestrator.
    Pending,
    /// The analyze phase is running.
    Analyzing,
    /// The plan phase is running.
    Planning,
    /// Blocked on an external approval decision.
    AwaitingApproval,
    /// The generate phase is running.
    Generating,
    /// The validate phase is running.
    Validating,
    /// Terminal: a signed bundle was produced.
    Complete,
    /// Terminal: the pipeline failed.
    Failed,
}

impl TaskStatus {
    /// Returns `true` for the two terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Stable wire string for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// One of the four pipeline phases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    /// Understand the request against the workspace context.
    Analyze,
    /// Produce an ordered, dependency-annotated plan.
    Plan,
    /// Fan steps out to sub-agents and build the bundle.
    Generate,
    /// Run the release gate and sign on pass.
    Validate,
}

impl PhaseName {
    /// The fixed pipeline order.
    pub const ORDER: [PhaseName; 4] = [Self::Analyze, Self::Plan, Self::Generate, Self::Validate];

    /// Stable wire string for this phase.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Generate => "generate",
            Self::Validate => "validate",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single phase within a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not started.
    #[default]
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Finished with an unrecovered error.
    Failed,
    /// Deliberately not executed (e.g. pipeline aborted earlier).
    Skipped,
}

/// Execution record for one phase of one task.
///
/// Invariant: across a task's four records, `completed_at` values are
/// non-decreasing in [`PhaseName::ORDER`] — a later phase cannot complete
/// before an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct PhaseRecord {
    /// Current status.
    pub status: PhaseStatus,
    /// Phase result payload, shape owned by the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When execution began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished (either way).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// A workspace file supplied with the request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContextFile {
    /// Path relative to the workspace root.
    pub path: String,
    /// Full file content.
    pub content: String,
}

/// Workspace context accompanying a generation request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct RequestContext {
    /// Files whose content was included with the request.
    pub files: Vec<ContextFile>,
    /// Paths of all files in the workspace (names only, no content).
    pub workspace_files: Vec<String>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Plan complexity tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Small, contained change.
    #[default]
    Low,
    /// Several files or one tricky concern.
    Medium,
    /// Wide blast radius or structural change.
    High,
}

/// Derived risk level over a plan; medium and high require approval.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Proceed without approval.
    Low,
    /// Approval required.
    Medium,
    /// Approval required.
    High,
}

impl RiskLevel {
    /// Whether this level gates the pipeline on an approval decision.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        !matches!(self, Self::Low)
    }
}

/// What a plan step does to its target path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Create a new file.
    Create,
    /// Modify an existing file.
    Modify,
    /// Delete a file.
    Delete,
}

/// Architectural layer a step belongs to; drives agent selection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Schema / migration work.
    Database,
    /// Server-side code.
    Backend,
    /// Client-side code.
    Frontend,
    /// Test files.
    Test,
    /// Build / tool configuration.
    Config,
    /// Deployment descriptors.
    Deployment,
    /// Anything else.
    #[default]
    General,
}

/// One ordered unit of work inside a [`Plan`].
///
/// `depends_on` must form a DAG across the plan's steps; cycles are rejected
/// before scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanStep {
    /// Unique step id within the plan.
    pub id: String,
    /// What happens to the target.
    pub action: StepAction,
    /// Target path.
    pub target: String,
    /// Human-readable description of the work.
    pub description: String,
    /// Architectural layer.
    #[serde(default)]
    pub layer: Layer,
    /// Ids of steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A file the plan intends to change.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannedFile {
    /// Target path.
    pub path: String,
    /// Intended action.
    pub action: StepAction,
}

/// A migration the plan proposes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannedMigration {
    /// Migration identifier.
    pub id: String,
    /// What the migration does.
    pub description: String,
}

/// Output of the plan phase.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Plan {
    /// Ordered, dependency-annotated steps.
    pub steps: Vec<PlanStep>,
    /// Files the plan will touch.
    #[serde(default)]
    pub files: Vec<PlannedFile>,
    /// Proposed migrations, if any.
    #[serde(default)]
    pub migrations: Vec<PlannedMigration>,
    /// Complexity tag.
    #[serde(default)]
    pub complexity: Complexity,
    /// Free-form duration estimate (e.g. `"15m"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    /// Explicit risks called out by the planner.
    #[serde(default)]
    pub risks: Vec<String>,
    /// Whether the plan changes dependency manifests.
    #[serde(default)]
    pub dependency_changes: bool,
}

/// Builder for [`Plan`]s, mostly used by tests and embedders.
///
/// # Examples
///
/// ```
/// use forge_core::{PlanBuilder, StepAction, Layer};
///
/// let plan = PlanBuilder::new()
///     .step("s1", StepAction::Create, "src/utils.js", "add helper", Layer::Backend, &[])
///     .build();
/// assert_eq!(plan.steps.len(), 1);
/// assert_eq!(plan.files.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step and its implied planned file.
    #[must_use]
    pub fn step(
        mut self,
        id: &str,
        action: StepAction,
        target: &str,
        description: &str,
        layer: Layer,
        depends_on: &[&str],
    ) -> Self {
        self.plan.steps.push(PlanStep {
            id: id.to_string(),
            action,
            target: target.to_string(),
            description: description.to_string(),
            layer,
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
        });
        self.plan.files.push(PlannedFile {
            path: target.to_string(),
            action,
        });
        self
    }

    /// Append a proposed migration.
    #[must_use]
    pub fn migration(mut self, id: &str, description: &str) -> Self {
        self.plan.migrations.push(PlannedMigration {
            id: id.to_string(),
            description: description.to_string(),
        });
        self
    }

    /// Set the complexity tag.
    #[must_use]
    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.plan.complexity = complexity;
        self
    }

    /// Append an explicit risk.
    #[must_use]
    pub fn risk(mut self, risk: &str) -> Self {
        self.plan.risks.push(risk.to_string());
        self
    }

    /// Mark the plan as changing dependency manifests.
    #[must_use]
    pub fn dependency_changes(mut self, yes: bool) -> Self {
        self.plan.dependency_changes = yes;
        self
    }

    /// Consume the builder and produce the plan.
    #[must_use]
    pub fn build(self) -> Plan {
        self.plan
    }
}

// ---------------------------------------------------------------------------
// Metrics and errors
// ---------------------------------------------------------------------------

/// Token consumption, total and split by phase.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct TokensUsed {
    /// Total tokens consumed by the task.
    pub total: u64,
    /// Tokens per phase, keyed by phase name.
    #[serde(default)]
    pub by_phase: BTreeMap<String, u64>,
}

/// Per-task metrics collected by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct TaskMetrics {
    /// Token consumption.
    pub tokens_used: TokensUsed,
    /// Wall-clock duration per phase in milliseconds.
    #[serde(default)]
    pub duration_ms: BTreeMap<String, u64>,
    /// Total wall-clock duration in milliseconds.
    pub total_duration_ms: u64,
    /// Informational cost estimate in USD.
    pub estimated_cost_usd: f64,
    /// Retry count.
    ///
    /// TODO: wire per-phase retry counts out of the retry harness; the field
    /// is currently always 0.
    pub retries: u32,
}

/// A structured remediation hint attached to validation failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FixSuggestion {
    /// Name of the failed check this suggestion addresses.
    pub check: String,
    /// Short title.
    pub title: String,
    /// What went wrong and how to approach it.
    pub description: String,
    /// Concrete actions the client can take.
    pub actions: Vec<String>,
}

/// User-facing task error.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskError {
    /// Human-readable message.
    pub message: String,
    /// Phase that failed, if the failure is attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseName>,
    /// Whether the client can retry (retry-validation / regenerate).
    pub recoverable: bool,
    /// Blocking validation findings, when the validate phase failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<serde_json::Value>,
    /// Non-blocking validation findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<serde_json::Value>,
    /// Structured remediation hints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<FixSuggestion>,
}

// ---------------------------------------------------------------------------
// Task record
// ---------------------------------------------------------------------------

/// The full record of one generation task.
///
/// Created when a request arrives, mutated only by the orchestrator, and
/// persisted by the state manager after every status change. Terminal in
/// [`TaskStatus::Complete`] or [`TaskStatus::Failed`]; retained afterwards
/// for recovery and history.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskRecord {
    /// Unique task id (unique per process).
    pub id: String,
    /// The original natural-language request.
    pub request: String,
    /// Workspace context supplied with the request.
    #[serde(default)]
    pub context: RequestContext,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Per-phase execution records.
    pub phases: BTreeMap<PhaseName, PhaseRecord>,
    /// The plan, once the plan phase has produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Id of the produced bundle, once validate has passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    /// Id of the task this one was regenerated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regenerated_from: Option<String>,
    /// Collected metrics.
    #[serde(default)]
    pub metrics: TaskMetrics,
    /// Terminal error, when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp; strictly monotone per task.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a fresh pending task with all four phase records seeded.
    #[must_use]
    pub fn new(request: impl Into<String>, context: RequestContext) -> Self {
        let now = Utc::now();
        let phases = PhaseName::ORDER
            .iter()
            .map(|p| (*p, PhaseRecord::default()))
            .collect();
        Self {
            id: format!("task_{}", Uuid::new_v4().simple()),
            request: request.into(),
            context,
            status: TaskStatus::Pending,
            phases,
            plan: None,
            bundle_id: None,
            regenerated_from: None,
            metrics: TaskMetrics::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a phase record.
    #[must_use]
    pub fn phase(&self, name: PhaseName) -> Option<&PhaseRecord> {
        self.phases.get(&name)
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON and hashing
// ---------------------------------------------------------------------------

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a value into the byte-stable JSON form that checksums and
/// signatures are computed over.
///
/// Stability comes from routing through [`serde_json::Value`]: object keys
/// land in `BTreeMap` order at every nesting level, arrays keep their
/// order, and the compact encoder emits no whitespace. Two calls over
/// equal values therefore produce identical bytes.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// SHA-256 of `bytes`, rendered as lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Checksum of file or SQL content, as stored in bundle entries.
#[must_use]
pub fn content_checksum(content: &str) -> String {
    sha256_hex(content.as_bytes())
}
