// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle types: the normalized artifact a task produces.
//!
//! An unsigned [`Bundle`] is assembled by the bundle builder, screened by the
//! release gate, and only then wrapped into a [`SignedBundle`] whose
//! signature covers the deterministic JSON of the unsigned bundle.

use crate::{Layer, StepAction};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Overall shape of a bundle, classified from its file actions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BundleType {
    /// Predominantly new files (create ratio above 0.8).
    Full,
    /// A mix of created and modified files.
    Feature,
    /// Modifications only.
    Patch,
    /// Deletions without dominating creates/modifies.
    Cleanup,
}

impl BundleType {
    /// Stable wire string for this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Feature => "feature",
            Self::Patch => "patch",
            Self::Cleanup => "cleanup",
        }
    }
}

/// How likely a migration is to destroy data.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DataLossRisk {
    /// Additive change.
    #[default]
    Low,
    /// Restructuring without obvious loss.
    Medium,
    /// Drops tables or columns.
    High,
}

/// A file the bundle creates, modifies, or deletes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileEntry {
    /// Target path; never empty.
    pub path: String,
    /// What the apply engine should do.
    pub action: StepAction,
    /// New file content (empty for deletes).
    pub content: String,
    /// SHA-256 hex digest of `content`.
    pub checksum: String,
    /// Architectural layer.
    #[serde(default)]
    pub layer: Layer,
    /// What this change is for.
    #[serde(default)]
    pub description: String,
    /// Content length in bytes.
    pub size: u64,
}

/// A generated test file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TestEntry {
    /// Test file path.
    pub path: String,
    /// Test file content.
    pub content: String,
    /// Path of the source file this test covers.
    pub source_file: String,
    /// Test framework the content targets.
    pub framework: String,
    /// Estimated coverage contribution, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    /// SHA-256 hex digest of `content`.
    pub checksum: String,
}

/// A database migration with forward and reverse SQL.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MigrationEntry {
    /// Migration identifier.
    pub id: String,
    /// What the migration does.
    pub description: String,
    /// Forward (apply) SQL.
    pub sql_forward: String,
    /// Reverse (rollback) SQL.
    pub sql_reverse: String,
    /// Data-loss risk classification.
    #[serde(default)]
    pub data_loss_risk: DataLossRisk,
    /// Target database name.
    #[serde(default)]
    pub database: String,
    /// SHA-256 hex digest of `sql_forward`.
    pub checksum_forward: String,
    /// SHA-256 hex digest of `sql_reverse`.
    pub checksum_reverse: String,
}

/// When a derived command should run relative to bundle apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CommandPhase {
    /// Before files are applied.
    #[serde(rename = "pre-apply")]
    PreApply,
    /// After files are applied.
    #[serde(rename = "post-apply")]
    PostApply,
}

/// A shell command the client should run around apply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandEntry {
    /// The command line.
    pub command: String,
    /// When to run it.
    pub when: CommandPhase,
    /// Why the command is needed.
    pub description: String,
    /// Risk annotation (currently only for migration commands).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<DataLossRisk>,
}

/// Aggregate counters attached to a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct BundleMetadata {
    /// Tokens consumed to produce the bundle.
    pub tokens_used: u64,
    /// Wall-clock generation time in milliseconds.
    pub duration_ms: u64,
    /// Number of file entries.
    pub file_count: usize,
    /// Number of test entries.
    pub test_count: usize,
    /// Number of migration entries.
    pub migration_count: usize,
    /// Number of derived commands.
    pub command_count: usize,
}

/// An unsigned bundle: everything the client needs to apply a change.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Bundle {
    /// Unique bundle id.
    pub id: String,
    /// Classified bundle type.
    pub bundle_type: BundleType,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// The plan this bundle implements, as produced by the plan phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
    /// Application spec the request carried, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_spec: Option<serde_json::Value>,
    /// Files to create/modify/delete.
    pub files: Vec<FileEntry>,
    /// Generated tests.
    #[serde(default)]
    pub tests: Vec<TestEntry>,
    /// Database migrations.
    #[serde(default)]
    pub migrations: Vec<MigrationEntry>,
    /// Commands to run around apply.
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
    /// Aggregate counters.
    #[serde(default)]
    pub metadata: BundleMetadata,
}

/// Signature over the deterministic JSON of an unsigned bundle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SignatureBlock {
    /// Signature algorithm; always `"RSA-SHA256"`.
    pub algorithm: String,
    /// Base64 of the raw signature bytes.
    pub value: String,
    /// When the signature was produced.
    pub signed_at: DateTime<Utc>,
    /// Short identifier of the signing key.
    pub key_id: String,
}

/// A bundle plus its signature block.
///
/// The signature covers the bundle fields only — serializing a
/// `SignedBundle`, removing `signature`, and canonicalizing must reproduce
/// the exact bytes that were signed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SignedBundle {
    /// The signed payload.
    #[serde(flatten)]
    pub bundle: Bundle,
    /// The signature block.
    pub signature: SignatureBlock,
}
