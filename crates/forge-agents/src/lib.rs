// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sub-agents: role-specific generation adapters.
//!
//! The scheduler hands each plan step to one of three [`SubAgent`]
//! variants: code generation, test generation, or migration generation.
//! Every agent builds a prompt, invokes the LLM through its own token
//! accounting, and parses a single code block out of the response. Code
//! generation additionally re-validates its output syntactically and
//! retries with the scanner's errors fed back into the prompt.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The LLM client seam and the scripted mock.
pub mod client;
/// Prompt assembly helpers.
mod prompts;

use forge_core::{ContextFile, DataLossRisk, Layer, PlanStep, StepAction};
use forge_error::{ErrorCode, ForgeError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub use client::{Completion, CompletionRequest, LlmClient, MockClient, TokenUsage};

/// Post-generation syntax retry cap for code generation.
const SYNTAX_RETRIES: u32 = 2;

/// Default per-agent token budget.
const DEFAULT_AGENT_TOKEN_BUDGET: u64 = 200_000;

// ---------------------------------------------------------------------------
// Kinds and outputs
// ---------------------------------------------------------------------------

/// The three sub-agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentKind {
    /// Generates application code.
    CodeGen,
    /// Generates test files.
    TestGen,
    /// Generates forward/reverse SQL migrations.
    Migration,
}

impl AgentKind {
    /// Stable name used in logs and usage snapshots.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGen => "codegen",
            Self::TestGen => "testgen",
            Self::Migration => "migration",
        }
    }
}

/// Deterministic agent selection for a plan step.
///
/// Test layer or test-style target naming → TestGen; migration-ish target
/// or database layer → Migration; everything else → CodeGen.
#[must_use]
pub fn select_agent_kind(step: &PlanStep) -> AgentKind {
    let target = step.target.to_ascii_lowercase();
    if step.layer == Layer::Test
        || target.contains(".test.")
        || target.contains(".spec.")
        || target.starts_with("tests/")
        || target.contains("/tests/")
        || target.contains("__tests__/")
    {
        return AgentKind::TestGen;
    }
    if step.layer == Layer::Database || target.contains("migration") {
        return AgentKind::Migration;
    }
    AgentKind::CodeGen
}

/// Context shared by every step execution of one generate phase.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    /// The original user request.
    pub request: String,
    /// Workspace files supplied with the request.
    pub context_files: Vec<ContextFile>,
    /// Target database name for migrations.
    pub database: String,
}

/// A generated source file.
#[derive(Debug, Clone)]
pub struct GeneratedFile {
    /// Target path.
    pub path: String,
    /// Action the apply engine should take.
    pub action: StepAction,
    /// File content (empty for deletes).
    pub content: String,
    /// Architectural layer.
    pub layer: Layer,
    /// What the change is for.
    pub description: String,
}

/// A generated test file.
#[derive(Debug, Clone)]
pub struct GeneratedTest {
    /// Test file path.
    pub path: String,
    /// Test content.
    pub content: String,
    /// Source file the test covers.
    pub source_file: String,
    /// Target framework.
    pub framework: String,
}

/// A generated migration.
#[derive(Debug, Clone)]
pub struct GeneratedMigration {
    /// Migration identifier.
    pub id: String,
    /// What it does.
    pub description: String,
    /// Forward SQL.
    pub sql_forward: String,
    /// Reverse SQL.
    pub sql_reverse: String,
    /// Assessed data-loss risk.
    pub data_loss_risk: DataLossRisk,
    /// Target database.
    pub database: String,
}

/// What one step execution produced.
#[derive(Debug, Clone)]
pub enum StepArtifact {
    /// A source file change.
    File(GeneratedFile),
    /// A test file.
    Test(GeneratedTest),
    /// A migration.
    Migration(GeneratedMigration),
}

/// Result of executing one plan step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The executed step's id.
    pub step_id: String,
    /// The produced artifact.
    pub artifact: StepArtifact,
    /// Tokens this execution consumed.
    pub tokens_used: u64,
}

/// Per-agent accounting snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AgentUsage {
    /// Tokens consumed since the last reset.
    pub tokens_used: u64,
    /// This agent's token budget.
    pub token_budget: u64,
    /// Steps executed since the last reset.
    pub steps_executed: u64,
}

// ---------------------------------------------------------------------------
// SubAgent trait
// ---------------------------------------------------------------------------

/// A role-specific generator executing one plan step end-to-end.
#[async_trait::async_trait]
pub trait SubAgent: Send + Sync {
    /// Which role this agent fills.
    fn kind(&self) -> AgentKind;

    /// Execute one step with the given context.
    async fn execute(&self, step: &PlanStep, ctx: &StepContext)
    -> Result<StepOutput, ForgeError>;

    /// Current accounting snapshot.
    fn usage(&self) -> AgentUsage;

    /// Zero the accounting counters.
    fn reset(&self);
}

/// Shared accounting state embedded in each agent.
struct AgentAccounting {
    tokens_used: AtomicU64,
    token_budget: u64,
    steps_executed: AtomicU64,
}

impl AgentAccounting {
    fn new(token_budget: u64) -> Self {
        Self {
            tokens_used: AtomicU64::new(0),
            token_budget,
            steps_executed: AtomicU64::new(0),
        }
    }

    fn check_budget(&self, kind: AgentKind) -> Result<(), ForgeError> {
        let used = self.tokens_used.load(Ordering::Relaxed);
        if used >= self.token_budget {
            return Err(ForgeError::new(
                ErrorCode::BudgetExceeded,
                format!("{} agent token budget exhausted", kind.as_str()),
            )
            .with_context("tokens_used", used)
            .with_context("token_budget", self.token_budget));
        }
        Ok(())
    }

    fn record(&self, usage: &TokenUsage) {
        self.tokens_used.fetch_add(usage.total(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> AgentUsage {
        AgentUsage {
            tokens_used: self.tokens_used.load(Ordering::Relaxed),
            token_budget: self.token_budget,
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.tokens_used.store(0, Ordering::Relaxed);
        self.steps_executed.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Extract every fenced code block as `(language, body)`.
#[must_use]
pub fn extract_code_blocks(text: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let Some(newline) = after_fence.find('\n') else {
            break;
        };
        let lang = after_fence[..newline].trim().to_string();
        let body_start = &after_fence[newline + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        blocks.push((lang, body_start[..close].trim_end().to_string()));
        rest = &body_start[close + 3..];
    }
    blocks
}

/// Extract a single code block, falling back to the trimmed raw text when
/// the response carries no fences.
#[must_use]
pub fn extract_code_block(text: &str) -> String {
    extract_code_blocks(text)
        .into_iter()
        .next()
        .map_or_else(|| text.trim().to_string(), |(_, body)| body)
}

/// Assess a migration's data-loss risk from its forward SQL.
#[must_use]
pub fn assess_data_loss_risk(sql_forward: &str) -> DataLossRisk {
    let sql = sql_forward.to_ascii_uppercase();
    if sql.contains("DROP TABLE")
        || sql.contains("DROP COLUMN")
        || sql.contains("TRUNCATE")
        || sql.contains("DELETE FROM")
    {
        DataLossRisk::High
    } else if sql.contains("ALTER TABLE") {
        DataLossRisk::Medium
    } else {
        DataLossRisk::Low
    }
}

// ---------------------------------------------------------------------------
// CodeGenAgent
// ---------------------------------------------------------------------------

/// Generates application code, re-validating its own output.
pub struct CodeGenAgent {
    llm: Arc<dyn LlmClient>,
    accounting: AgentAccounting,
}

impl CodeGenAgent {
    /// Create an agent with the default token budget.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_budget(llm, DEFAULT_AGENT_TOKEN_BUDGET)
    }

    /// Create an agent with an explicit token budget.
    #[must_use]
    pub fn with_budget(llm: Arc<dyn LlmClient>, token_budget: u64) -> Self {
        Self {
            llm,
            accounting: AgentAccounting::new(token_budget),
        }
    }
}

#[async_trait::async_trait]
impl SubAgent for CodeGenAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::CodeGen
    }

    async fn execute(
        &self,
        step: &PlanStep,
        ctx: &StepContext,
    ) -> Result<StepOutput, ForgeError> {
        self.accounting.steps_executed.fetch_add(1, Ordering::Relaxed);

        // Deletes need no generation.
        if step.action == StepAction::Delete {
            return Ok(StepOutput {
                step_id: step.id.clone(),
                artifact: StepArtifact::File(GeneratedFile {
                    path: step.target.clone(),
                    action: StepAction::Delete,
                    content: String::new(),
                    layer: step.layer,
                    description: step.description.clone(),
                }),
                tokens_used: 0,
            });
        }

        let mut tokens = 0u64;
        let mut feedback: Vec<String> = Vec::new();

        for attempt in 0..=SYNTAX_RETRIES {
            self.accounting.check_budget(self.kind())?;
            let request = prompts::code_request(step, ctx, &feedback);
            let completion = self.llm.complete(request).await?;
            self.accounting.record(&completion.usage);
            tokens += completion.usage.total();

            let content = extract_code_block(&completion.text);
            let errors = forge_gate::syntax::scan_by_extension(&step.target, &content)
                .unwrap_or_default();
            if errors.is_empty() {
                return Ok(StepOutput {
                    step_id: step.id.clone(),
                    artifact: StepArtifact::File(GeneratedFile {
                        path: step.target.clone(),
                        action: step.action,
                        content,
                        layer: step.layer,
                        description: step.description.clone(),
                    }),
                    tokens_used: tokens,
                });
            }
            warn!(
                target: "forge.agents",
                step = %step.id,
                attempt,
                errors = errors.len(),
                "generated code failed syntax scan"
            );
            feedback = errors;
        }

        Err(ForgeError::new(
            ErrorCode::GenerationMalformed,
            format!(
                "step {}: generated code failed syntax validation after {} attempts: {}",
                step.id,
                SYNTAX_RETRIES + 1,
                feedback.join("; ")
            ),
        ))
    }

    fn usage(&self) -> AgentUsage {
        self.accounting.snapshot()
    }

    fn reset(&self) {
        self.accounting.reset();
    }
}

// ---------------------------------------------------------------------------
// TestGenAgent
// ---------------------------------------------------------------------------

/// Generates test files for source targets.
pub struct TestGenAgent {
    llm: Arc<dyn LlmClient>,
    accounting: AgentAccounting,
    framework: String,
}

impl TestGenAgent {
    /// Create an agent targeting the default framework (`jest`).
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_budget(llm, DEFAULT_AGENT_TOKEN_BUDGET)
    }

    /// Create an agent with an explicit token budget.
    #[must_use]
    pub fn with_budget(llm: Arc<dyn LlmClient>, token_budget: u64) -> Self {
        Self {
            llm,
            accounting: AgentAccounting::new(token_budget),
            framework: "jest".to_string(),
        }
    }

    /// `src/a.js` → `src/a.test.js`; targets already named like tests pass
    /// through unchanged.
    #[must_use]
    pub fn test_path_for(target: &str) -> String {
        if target.contains(".test.") || target.contains(".spec.") {
            return target.to_string();
        }
        match target.rfind('.') {
            Some(dot) => format!("{}.test{}", &target[..dot], &target[dot..]),
            None => format!("{target}.test.js"),
        }
    }

    /// Inverse of [`test_path_for`](Self::test_path_for) for test-named
    /// targets.
    fn source_for(target: &str) -> String {
        target.replace(".test.", ".").replace(".spec.", ".")
    }
}

#[async_trait::async_trait]
impl SubAgent for TestGenAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::TestGen
    }

    async fn execute(
        &self,
        step: &PlanStep,
        ctx: &StepContext,
    ) -> Result<StepOutput, ForgeError> {
        self.accounting.steps_executed.fetch_add(1, Ordering::Relaxed);
        self.accounting.check_budget(self.kind())?;

        let is_test_target = step.target.contains(".test.") || step.target.contains(".spec.");
        let (path, source_file) = if is_test_target {
            (step.target.clone(), Self::source_for(&step.target))
        } else {
            (Self::test_path_for(&step.target), step.target.clone())
        };

        let request = prompts::test_request(step, ctx, &source_file, &self.framework);
        let completion = self.llm.complete(request).await?;
        self.accounting.record(&completion.usage);
        let content = extract_code_block(&completion.text);

        debug!(target: "forge.agents", step = %step.id, path = %path, "test generated");
        Ok(StepOutput {
            step_id: step.id.clone(),
            artifact: StepArtifact::Test(GeneratedTest {
                path,
                content,
                source_file,
                framework: self.framework.clone(),
            }),
            tokens_used: completion.usage.total(),
        })
    }

    fn usage(&self) -> AgentUsage {
        self.accounting.snapshot()
    }

    fn reset(&self) {
        self.accounting.reset();
    }
}

// ---------------------------------------------------------------------------
// MigrationAgent
// ---------------------------------------------------------------------------

/// Generates forward/reverse SQL migrations.
pub struct MigrationAgent {
    llm: Arc<dyn LlmClient>,
    accounting: AgentAccounting,
}

impl MigrationAgent {
    /// Create an agent with the default token budget.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_budget(llm, DEFAULT_AGENT_TOKEN_BUDGET)
    }

    /// Create an agent with an explicit token budget.
    #[must_use]
    pub fn with_budget(llm: Arc<dyn LlmClient>, token_budget: u64) -> Self {
        Self {
            llm,
            accounting: AgentAccounting::new(token_budget),
        }
    }

    /// Split a response into forward and reverse SQL.
    ///
    /// Two fenced blocks are forward then reverse; a single block is split
    /// on a `-- down` marker when present; otherwise the reverse is empty
    /// and the release gate rejects the migration.
    #[must_use]
    pub fn split_sql(text: &str) -> (String, String) {
        let blocks = extract_code_blocks(text);
        match blocks.len() {
            0 => Self::split_on_marker(text.trim()),
            1 => Self::split_on_marker(&blocks[0].1),
            _ => (blocks[0].1.clone(), blocks[1].1.clone()),
        }
    }

    fn split_on_marker(sql: &str) -> (String, String) {
        let lower = sql.to_ascii_lowercase();
        if let Some(idx) = lower.find("-- down") {
            let forward = sql[..idx].trim().to_string();
            let after = &sql[idx..];
            let reverse = after
                .lines()
                .skip(1)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
            let forward = forward
                .strip_prefix("-- up")
                .map_or(forward.clone(), |s| s.trim().to_string());
            (forward, reverse)
        } else {
            (sql.trim().to_string(), String::new())
        }
    }
}

#[async_trait::async_trait]
impl SubAgent for MigrationAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Migration
    }

    async fn execute(
        &self,
        step: &PlanStep,
        ctx: &StepContext,
    ) -> Result<StepOutput, ForgeError> {
        self.accounting.steps_executed.fetch_add(1, Ordering::Relaxed);
        self.accounting.check_budget(self.kind())?;

        let request = prompts::migration_request(step, ctx);
        let completion = self.llm.complete(request).await?;
        self.accounting.record(&completion.usage);

        let (sql_forward, sql_reverse) = Self::split_sql(&completion.text);
        let database = if ctx.database.is_empty() {
            "app".to_string()
        } else {
            ctx.database.clone()
        };

        debug!(target: "forge.agents", step = %step.id, "migration generated");
        Ok(StepOutput {
            step_id: step.id.clone(),
            artifact: StepArtifact::Migration(GeneratedMigration {
                id: format!("mig_{}", step.id),
                description: step.description.clone(),
                data_loss_risk: assess_data_loss_risk(&sql_forward),
                sql_forward,
                sql_reverse,
                database,
            }),
            tokens_used: completion.usage.total(),
        })
    }

    fn usage(&self) -> AgentUsage {
        self.accounting.snapshot()
    }

    fn reset(&self) {
        self.accounting.reset();
    }
}
