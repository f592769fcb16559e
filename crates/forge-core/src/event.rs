// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed events published on the event bus.
//!
//! The kind set is closed and wire-visible; transports forward events
//! verbatim as `{type: "event", event: {...}}`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The closed set of event kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventKind {
    TaskStart,
    TaskProgress,
    TaskComplete,
    TaskError,
    AgentThinking,
    AgentAction,
    AgentObservation,
    CodeAnalyzing,
    CodePlanning,
    CodeGenerating,
    CodeValidating,
    ValidationCheckStart,
    ValidationCheckComplete,
    ValidationSummary,
    ToolStart,
    ToolProgress,
    ToolComplete,
    ToolError,
    BudgetWarning,
    BudgetExceeded,
    ApprovalRequired,
    ApprovalReceived,
    PlanModified,
    Log,
    Warning,
    Error,
}

impl EventKind {
    /// Stable wire string for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStart => "task_start",
            Self::TaskProgress => "task_progress",
            Self::TaskComplete => "task_complete",
            Self::TaskError => "task_error",
            Self::AgentThinking => "agent_thinking",
            Self::AgentAction => "agent_action",
            Self::AgentObservation => "agent_observation",
            Self::CodeAnalyzing => "code_analyzing",
            Self::CodePlanning => "code_planning",
            Self::CodeGenerating => "code_generating",
            Self::CodeValidating => "code_validating",
            Self::ValidationCheckStart => "validation_check_start",
            Self::ValidationCheckComplete => "validation_check_complete",
            Self::ValidationSummary => "validation_summary",
            Self::ToolStart => "tool_start",
            Self::ToolProgress => "tool_progress",
            Self::ToolComplete => "tool_complete",
            Self::ToolError => "tool_error",
            Self::BudgetWarning => "budget_warning",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalReceived => "approval_received",
            Self::PlanModified => "plan_modified",
            Self::Log => "log",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event.
///
/// Ids are `evt_<n>_<unix_ms>` with `n` strictly increasing within a
/// process; timestamps are non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Monotonic event id.
    pub id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Publication timestamp.
    pub timestamp: DateTime<Utc>,
    /// Task this event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Structured payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    /// Sequence number parsed back out of the id, used by replay cursors.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.id.split('_').nth(1).and_then(|s| s.parse().ok())
    }
}
