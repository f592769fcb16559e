// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sub-agent scheduler: topological batching and parallel dispatch.
//!
//! Plan steps with dependency lists become a sequence of batches such that
//! every step in batch `k` depends only on steps in earlier batches. Steps
//! within a batch run concurrently and are collected settled — one failure
//! never masks a sibling's result. Batches run strictly in sequence; once a
//! batch reports failures, later batches are not dispatched and their steps
//! are recorded as skipped.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use forge_agents::{
    AgentKind, AgentUsage, CodeGenAgent, LlmClient, MigrationAgent, StepContext, StepOutput,
    SubAgent, TestGenAgent, select_agent_kind,
};
use forge_bus::EventBus;
use forge_core::{EventKind, PlanStep};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Errors from batch construction.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The dependency graph is not a DAG (or references unknown step ids).
    #[error("circular dependency among steps: {}", remaining.join(", "))]
    CircularDependency {
        /// Ids of the steps that could not be scheduled.
        remaining: Vec<String>,
    },
}

/// How one step ended.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step produced an artifact.
    Success(StepOutput),
    /// The step failed; the error is preserved as text plus code.
    Failed {
        /// Stringified failure.
        error: String,
        /// Stable error code.
        code: forge_error::ErrorCode,
    },
    /// The step was never dispatched because an earlier batch failed.
    Skipped,
}

impl StepOutcome {
    /// Whether this outcome is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// One step's settled result.
#[derive(Debug)]
pub struct StepResult {
    /// The step id.
    pub step_id: String,
    /// Which agent kind handled (or would have handled) the step.
    pub agent: AgentKind,
    /// How it ended.
    pub outcome: StepOutcome,
}

/// Aggregate result of one scheduler run.
#[derive(Debug)]
pub struct SchedulerRun {
    /// Per-step results in dispatch order (skipped steps last).
    pub results: Vec<StepResult>,
    /// Number of batches dispatched.
    pub batches_dispatched: usize,
    /// Tokens consumed by successful steps.
    pub tokens_used: u64,
    /// Whether every step succeeded.
    pub all_succeeded: bool,
}

impl SchedulerRun {
    /// Iterator over successful outputs.
    pub fn outputs(&self) -> impl Iterator<Item = &StepOutput> {
        self.results.iter().filter_map(|r| match &r.outcome {
            StepOutcome::Success(out) => Some(out),
            _ => None,
        })
    }

    /// Stringified failures as `(step_id, error)` pairs.
    #[must_use]
    pub fn failures(&self) -> Vec<(String, String)> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                StepOutcome::Failed { error, .. } => Some((r.step_id.clone(), error.clone())),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Batch construction
// ---------------------------------------------------------------------------

/// Build dependency-ordered batches.
///
/// Repeatedly selects every not-yet-done step whose dependencies are all
/// done. An empty selection with steps remaining means the graph is cyclic
/// (or references unknown ids) and fails with
/// [`ScheduleError::CircularDependency`] naming the remaining steps.
///
/// # Errors
///
/// [`ScheduleError::CircularDependency`] when the input is not a DAG.
pub fn build_execution_order(steps: &[PlanStep]) -> Result<Vec<Vec<PlanStep>>, ScheduleError> {
    let mut done: BTreeSet<&str> = BTreeSet::new();
    let mut pending: Vec<&PlanStep> = steps.iter().collect();
    let mut batches: Vec<Vec<PlanStep>> = Vec::new();

    while !pending.is_empty() {
        let (ready, blocked): (Vec<&PlanStep>, Vec<&PlanStep>) = pending
            .into_iter()
            .partition(|s| s.depends_on.iter().all(|d| done.contains(d.as_str())));

        if ready.is_empty() {
            return Err(ScheduleError::CircularDependency {
                remaining: blocked.iter().map(|s| s.id.clone()).collect(),
            });
        }
        for step in &ready {
            done.insert(step.id.as_str());
        }
        batches.push(ready.into_iter().cloned().collect());
        pending = blocked;
    }
    Ok(batches)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Holds one agent per kind and drives plan execution.
pub struct Scheduler {
    agents: BTreeMap<AgentKind, Arc<dyn SubAgent>>,
}

impl Scheduler {
    /// Create a scheduler with the three default agents over one client.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        let mut agents: BTreeMap<AgentKind, Arc<dyn SubAgent>> = BTreeMap::new();
        agents.insert(
            AgentKind::CodeGen,
            Arc::new(CodeGenAgent::new(Arc::clone(&llm))),
        );
        agents.insert(
            AgentKind::TestGen,
            Arc::new(TestGenAgent::new(Arc::clone(&llm))),
        );
        agents.insert(AgentKind::Migration, Arc::new(MigrationAgent::new(llm)));
        Self { agents }
    }

    /// Create a scheduler with explicit agents (tests and embedders).
    #[must_use]
    pub fn with_agents(agents: BTreeMap<AgentKind, Arc<dyn SubAgent>>) -> Self {
        Self { agents }
    }

    /// Execute a plan's steps in dependency-ordered batches.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::CircularDependency`] when the step graph is cyclic;
    /// per-step failures are collected in the result, not raised.
    pub async fn run(
        &self,
        steps: &[PlanStep],
        ctx: &StepContext,
    ) -> Result<SchedulerRun, ScheduleError> {
        self.run_inner(steps, ctx, None, None).await
    }

    /// Execute with per-step `agent_action` / `agent_observation` events.
    ///
    /// # Errors
    ///
    /// As for [`run`](Self::run).
    pub async fn run_with_events(
        &self,
        steps: &[PlanStep],
        ctx: &StepContext,
        bus: &EventBus,
        task_id: &str,
    ) -> Result<SchedulerRun, ScheduleError> {
        self.run_inner(steps, ctx, Some(bus), Some(task_id)).await
    }

    async fn run_inner(
        &self,
        steps: &[PlanStep],
        ctx: &StepContext,
        bus: Option<&EventBus>,
        task_id: Option<&str>,
    ) -> Result<SchedulerRun, ScheduleError> {
        let batches = build_execution_order(steps)?;
        let mut results: Vec<StepResult> = Vec::with_capacity(steps.len());
        let mut batches_dispatched = 0usize;
        let mut failed = false;

        for (batch_index, batch) in batches.iter().enumerate() {
            if failed {
                // An earlier batch failed; the rest of the plan is skipped.
                for step in batch {
                    results.push(StepResult {
                        step_id: step.id.clone(),
                        agent: select_agent_kind(step),
                        outcome: StepOutcome::Skipped,
                    });
                }
                continue;
            }

            batches_dispatched += 1;
            debug!(
                target: "forge.scheduler",
                batch = batch_index,
                steps = batch.len(),
                "dispatching batch"
            );

            let futures = batch.iter().map(|step| {
                let kind = select_agent_kind(step);
                let agent = Arc::clone(
                    self.agents
                        .get(&kind)
                        .unwrap_or_else(|| panic!("no agent registered for {kind:?}")),
                );
                if let Some(bus) = bus {
                    bus.publish(
                        EventKind::AgentAction,
                        task_id,
                        json!({ "step": step.id, "agent": kind.as_str(), "target": step.target }),
                    );
                }
                let step = step.clone();
                let ctx = ctx.clone();
                async move {
                    let outcome = agent.execute(&step, &ctx).await;
                    (step, kind, outcome)
                }
            });

            // Settled collection: every step in the batch finishes either
            // way before the batch is judged.
            let settled = futures::future::join_all(futures).await;

            for (step, kind, outcome) in settled {
                let result = match outcome {
                    Ok(output) => StepOutcome::Success(output),
                    Err(e) => {
                        warn!(
                            target: "forge.scheduler",
                            step = %step.id,
                            error = %e,
                            "step failed"
                        );
                        failed = true;
                        StepOutcome::Failed {
                            error: e.to_string(),
                            code: e.code,
                        }
                    }
                };
                if let Some(bus) = bus {
                    bus.publish(
                        EventKind::AgentObservation,
                        task_id,
                        json!({
                            "step": step.id,
                            "agent": kind.as_str(),
                            "success": result.is_success(),
                        }),
                    );
                }
                results.push(StepResult {
                    step_id: step.id.clone(),
                    agent: kind,
                    outcome: result,
                });
            }
        }

        let tokens_used = results
            .iter()
            .filter_map(|r| match &r.outcome {
                StepOutcome::Success(out) => Some(out.tokens_used),
                _ => None,
            })
            .sum();
        let all_succeeded = results.iter().all(|r| r.outcome.is_success());

        Ok(SchedulerRun {
            results,
            batches_dispatched,
            tokens_used,
            all_succeeded,
        })
    }

    /// Per-agent usage snapshots.
    #[must_use]
    pub fn usage(&self) -> BTreeMap<AgentKind, AgentUsage> {
        self.agents
            .iter()
            .map(|(kind, agent)| (*kind, agent.usage()))
            .collect()
    }

    /// Total tokens consumed across all agents.
    #[must_use]
    pub fn tokens_used(&self) -> u64 {
        self.agents.values().map(|a| a.usage().tokens_used).sum()
    }

    /// Zero every agent's accounting.
    pub fn reset(&self) {
        for agent in self.agents.values() {
            agent.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_agents::MockClient;
    use forge_core::{Layer, StepAction};

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep {
            id: id.into(),
            action: StepAction::Create,
            target: format!("src/{id}.js"),
            description: format!("build {id}"),
            layer: Layer::Backend,
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
        }
    }

    #[test]
    fn independent_steps_form_one_batch() {
        let steps = vec![step("a", &[]), step("b", &[]), step("c", &[])];
        let batches = build_execution_order(&steps).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn chain_forms_sequential_batches() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let batches = build_execution_order(&steps).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0][0].id, "a");
        assert_eq!(batches[1][0].id, "b");
        assert_eq!(batches[2][0].id, "c");
    }

    #[test]
    fn diamond_dependency_batches_correctly() {
        let steps = vec![
            step("top", &[]),
            step("left", &["top"]),
            step("right", &["top"]),
            step("bottom", &["left", "right"]),
        ];
        let batches = build_execution_order(&steps).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[2][0].id, "bottom");
    }

    #[test]
    fn cycle_is_rejected_naming_remaining_steps() {
        let steps = vec![step("a", &["b"]), step("b", &["a"]), step("c", &[])];
        let err = build_execution_order(&steps).unwrap_err();
        let ScheduleError::CircularDependency { remaining } = err;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"a".to_string()));
        assert!(remaining.contains(&"b".to_string()));
    }

    #[test]
    fn unknown_dependency_is_reported_as_unschedulable() {
        let steps = vec![step("a", &["ghost"])];
        assert!(build_execution_order(&steps).is_err());
    }

    #[test]
    fn batch_membership_is_a_partition() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
            step("e", &[]),
        ];
        let batches = build_execution_order(&steps).unwrap();
        let mut seen: Vec<String> = batches
            .iter()
            .flat_map(|b| b.iter().map(|s| s.id.clone()))
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    fn scheduler_with_mock(texts: Vec<String>) -> Scheduler {
        Scheduler::new(Arc::new(MockClient::from_texts(texts)))
    }

    #[tokio::test]
    async fn run_executes_all_steps_and_sums_tokens() {
        let scheduler =
            scheduler_with_mock(vec!["```js\nexport const ok = 1;\n```".to_string()]);
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let run = scheduler.run(&steps, &StepContext::default()).await.unwrap();
        assert!(run.all_succeeded);
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.batches_dispatched, 2);
        assert!(run.tokens_used > 0);
        assert_eq!(scheduler.tokens_used(), run.tokens_used);
    }

    #[tokio::test]
    async fn failure_settles_siblings_and_skips_later_batches() {
        // The mock fails only for the step targeting src/boom.js.
        let llm = Arc::new(MockClient::with_handler(|_, request| {
            if request.prompt.contains("boom") {
                Err(forge_error::ForgeError::from_signal(Some(401), "denied"))
            } else {
                Ok(forge_agents::Completion {
                    text: "```js\nexport const ok = 1;\n```".into(),
                    usage: forge_agents::TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 10,
                    },
                })
            }
        }));
        let scheduler = Scheduler::new(llm);
        let steps = vec![
            step("good", &[]),
            step("boom", &[]),
            step("after", &["good"]),
        ];
        let run = scheduler.run(&steps, &StepContext::default()).await.unwrap();
        assert!(!run.all_succeeded);

        let by_id = |id: &str| run.results.iter().find(|r| r.step_id == id).unwrap();
        // The sibling of the failing step still settled with its own result.
        assert!(by_id("good").outcome.is_success());
        assert!(matches!(by_id("boom").outcome, StepOutcome::Failed { .. }));
        // The dependent batch was never dispatched.
        assert!(matches!(by_id("after").outcome, StepOutcome::Skipped));
        assert_eq!(run.batches_dispatched, 1);
        assert_eq!(run.failures().len(), 1);
    }

    #[tokio::test]
    async fn agent_selection_routes_by_step_shape() {
        let scheduler = scheduler_with_mock(vec![
            "```js\nexport const ok = 1;\n```".to_string(),
        ]);
        let steps = vec![
            step("code", &[]),
            PlanStep {
                id: "test".into(),
                action: StepAction::Create,
                target: "src/code.test.js".into(),
                description: "tests".into(),
                layer: Layer::Test,
                depends_on: vec!["code".into()],
            },
            PlanStep {
                id: "mig".into(),
                action: StepAction::Create,
                target: "migrations/001_x.sql".into(),
                description: "schema".into(),
                layer: Layer::Database,
                depends_on: vec![],
            },
        ];
        let run = scheduler.run(&steps, &StepContext::default()).await.unwrap();
        let by_id = |id: &str| run.results.iter().find(|r| r.step_id == id).unwrap();
        assert_eq!(by_id("code").agent, AgentKind::CodeGen);
        assert_eq!(by_id("test").agent, AgentKind::TestGen);
        assert_eq!(by_id("mig").agent, AgentKind::Migration);
    }

    #[tokio::test]
    async fn reset_zeroes_all_agents() {
        let scheduler = scheduler_with_mock(vec!["```js\nconst a = 1;\n```".to_string()]);
        let steps = vec![step("a", &[])];
        scheduler.run(&steps, &StepContext::default()).await.unwrap();
        assert!(scheduler.tokens_used() > 0);
        scheduler.reset();
        assert_eq!(scheduler.tokens_used(), 0);
        for usage in scheduler.usage().values() {
            assert_eq!(usage.tokens_used, 0);
            assert_eq!(usage.steps_executed, 0);
        }
    }

    #[tokio::test]
    async fn events_are_emitted_per_step() {
        let bus = EventBus::new();
        let scheduler = scheduler_with_mock(vec!["```js\nconst a = 1;\n```".to_string()]);
        let steps = vec![step("a", &[]), step("b", &["a"])];
        scheduler
            .run_with_events(&steps, &StepContext::default(), &bus, "task_1")
            .await
            .unwrap();
        let replay = bus.events_since(None, Some("task_1"));
        let actions = replay
            .events
            .iter()
            .filter(|e| e.kind == EventKind::AgentAction)
            .count();
        let observations = replay
            .events
            .iter()
            .filter(|e| e.kind == EventKind::AgentObservation)
            .count();
        assert_eq!(actions, 2);
        assert_eq!(observations, 2);
    }
}
