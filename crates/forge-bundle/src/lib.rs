// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle assembly.
//!
//! Normalizes raw generation outputs into the bundle schema: fresh id and
//! timestamp, SHA-256 checksums over file content and migration SQL, bundle
//! type classification from the action mix, and derived pre/post-apply
//! commands. Shape validation reports errors and warnings without blocking.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use forge_core::{
    Bundle, BundleMetadata, BundleType, CommandEntry, CommandPhase, DataLossRisk, FileEntry,
    Layer, MigrationEntry, StepAction, TestEntry, content_checksum,
};
use tracing::debug;
use uuid::Uuid;

/// Fraction of creates above which a bundle classifies as `full`.
const FULL_CREATE_RATIO: f64 = 0.8;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify a bundle from its file actions.
///
/// Rules, in order: create ratio above 0.8 → `full`; creates and modifies
/// together → `feature`; modifies without creates → `patch`; deletes without
/// dominating creates/modifies → `cleanup`. An empty file list classifies as
/// `patch` (and separately warns in shape validation).
#[must_use]
pub fn classify_bundle_type(files: &[FileEntry]) -> BundleType {
    let total = files.len();
    if total == 0 {
        return BundleType::Patch;
    }
    let creates = files.iter().filter(|f| f.action == StepAction::Create).count();
    let modifies = files.iter().filter(|f| f.action == StepAction::Modify).count();
    let deletes = files.iter().filter(|f| f.action == StepAction::Delete).count();

    if creates as f64 / total as f64 > FULL_CREATE_RATIO {
        return BundleType::Full;
    }
    if creates > 0 && modifies > 0 {
        return BundleType::Feature;
    }
    if modifies > 0 {
        return BundleType::Patch;
    }
    if deletes > 0 {
        return BundleType::Cleanup;
    }
    // Creates only, but at or below the full ratio (cannot occur with the
    // branches above exhausted; kept for totality).
    BundleType::Feature
}

// ---------------------------------------------------------------------------
// Derived commands
// ---------------------------------------------------------------------------

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_package_manifest(path: &str) -> bool {
    file_name(path) == "package.json"
}

fn is_build_config(path: &str) -> bool {
    let name = file_name(path);
    name == "tsconfig.json"
        || name.starts_with("webpack.config")
        || name.starts_with("vite.config")
        || name.starts_with("rollup.config")
        || name.starts_with("babel.config")
}

/// Derive the commands a client should run around apply.
#[must_use]
pub fn derive_commands(files: &[FileEntry], migrations: &[MigrationEntry]) -> Vec<CommandEntry> {
    let mut commands = Vec::new();

    if files.iter().any(|f| is_package_manifest(&f.path)) {
        commands.push(CommandEntry {
            command: "npm install".into(),
            when: CommandPhase::PreApply,
            description: "Install dependencies (package manifest changed)".into(),
            risk_level: None,
        });
    }

    if !migrations.is_empty() {
        let risk = migrations
            .iter()
            .map(|m| m.data_loss_risk)
            .max()
            .unwrap_or_default();
        commands.push(CommandEntry {
            command: "npm run migrate".into(),
            when: CommandPhase::PreApply,
            description: "Apply database migrations".into(),
            risk_level: Some(risk),
        });
    }

    if files.iter().any(|f| is_build_config(&f.path)) {
        commands.push(CommandEntry {
            command: "npm run build".into(),
            when: CommandPhase::PostApply,
            description: "Rebuild (build configuration changed)".into(),
            risk_level: None,
        });
    }

    commands
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder assembling a [`Bundle`] from raw generation outputs.
///
/// # Examples
///
/// ```
/// use forge_bundle::BundleBuilder;
/// use forge_core::{StepAction, Layer, BundleType};
///
/// let bundle = BundleBuilder::new()
///     .file("src/a.js", StepAction::Create, "export {}", Layer::Backend, "new module")
///     .build();
/// assert_eq!(bundle.bundle_type, BundleType::Full);
/// assert_eq!(bundle.files[0].checksum.len(), 64);
/// ```
#[derive(Debug, Default)]
pub struct BundleBuilder {
    plan: Option<serde_json::Value>,
    app_spec: Option<serde_json::Value>,
    files: Vec<FileEntry>,
    tests: Vec<TestEntry>,
    migrations: Vec<MigrationEntry>,
    tokens_used: u64,
    duration_ms: u64,
}

impl BundleBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the plan the bundle implements.
    #[must_use]
    pub fn plan(mut self, plan: serde_json::Value) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Attach the request's application spec.
    #[must_use]
    pub fn app_spec(mut self, app_spec: serde_json::Value) -> Self {
        self.app_spec = Some(app_spec);
        self
    }

    /// Append a file entry; checksum and size are computed here.
    #[must_use]
    pub fn file(
        mut self,
        path: impl Into<String>,
        action: StepAction,
        content: impl Into<String>,
        layer: Layer,
        description: impl Into<String>,
    ) -> Self {
        let content = content.into();
        self.files.push(FileEntry {
            path: path.into(),
            action,
            checksum: content_checksum(&content),
            size: content.len() as u64,
            content,
            layer,
            description: description.into(),
        });
        self
    }

    /// Append a test entry; the checksum is computed here.
    #[must_use]
    pub fn test(
        mut self,
        path: impl Into<String>,
        content: impl Into<String>,
        source_file: impl Into<String>,
        framework: impl Into<String>,
        coverage: Option<f64>,
    ) -> Self {
        let content = content.into();
        self.tests.push(TestEntry {
            path: path.into(),
            checksum: content_checksum(&content),
            content,
            source_file: source_file.into(),
            framework: framework.into(),
            coverage,
        });
        self
    }

    /// Append a migration entry; forward/reverse checksums are computed here.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn migration(
        mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        sql_forward: impl Into<String>,
        sql_reverse: impl Into<String>,
        data_loss_risk: DataLossRisk,
        database: impl Into<String>,
    ) -> Self {
        let sql_forward = sql_forward.into();
        let sql_reverse = sql_reverse.into();
        self.migrations.push(MigrationEntry {
            id: id.into(),
            description: description.into(),
            checksum_forward: content_checksum(&sql_forward),
            checksum_reverse: content_checksum(&sql_reverse),
            sql_forward,
            sql_reverse,
            data_loss_risk,
            database: database.into(),
        });
        self
    }

    /// Record tokens consumed producing the bundle.
    #[must_use]
    pub fn tokens_used(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Record wall-clock generation time.
    #[must_use]
    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    /// Consume the builder: classify, derive commands, fill metadata.
    #[must_use]
    pub fn build(self) -> Bundle {
        let bundle_type = classify_bundle_type(&self.files);
        let commands = derive_commands(&self.files, &self.migrations);
        let metadata = BundleMetadata {
            tokens_used: self.tokens_used,
            duration_ms: self.duration_ms,
            file_count: self.files.len(),
            test_count: self.tests.len(),
            migration_count: self.migrations.len(),
            command_count: commands.len(),
        };
        let bundle = Bundle {
            id: format!("bundle_{}", Uuid::new_v4().simple()),
            bundle_type,
            created_at: Utc::now(),
            plan: self.plan,
            app_spec: self.app_spec,
            files: self.files,
            tests: self.tests,
            migrations: self.migrations,
            commands,
            metadata,
        };
        debug!(
            target: "forge.bundle",
            id = %bundle.id,
            bundle_type = bundle.bundle_type.as_str(),
            files = bundle.files.len(),
            "bundle assembled"
        );
        bundle
    }
}

// ---------------------------------------------------------------------------
// Shape validation
// ---------------------------------------------------------------------------

/// Result of validating a bundle's final shape.
#[derive(Debug, Clone)]
pub struct ShapeReport {
    /// `true` when no errors were found (warnings do not count).
    pub valid: bool,
    /// Hard shape violations.
    pub errors: Vec<String>,
    /// Advisory findings.
    pub warnings: Vec<String>,
}

/// Validate a bundle's final shape.
///
/// Missing ids and fields are errors; an empty file list and high-risk
/// migrations are warnings.
#[must_use]
pub fn validate_shape(bundle: &Bundle) -> ShapeReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if bundle.id.is_empty() {
        errors.push("bundle id must not be empty".to_string());
    }

    if bundle.files.is_empty() {
        warnings.push("bundle has no file entries".to_string());
    }
    for (i, file) in bundle.files.iter().enumerate() {
        if file.path.is_empty() {
            errors.push(format!("file[{i}] has an empty path"));
        }
        if file.checksum != content_checksum(&file.content) {
            errors.push(format!("file[{i}] ({}) checksum mismatch", file.path));
        }
    }

    for (i, test) in bundle.tests.iter().enumerate() {
        if test.path.is_empty() {
            errors.push(format!("test[{i}] has an empty path"));
        }
        if test.source_file.is_empty() {
            errors.push(format!("test[{i}] ({}) has no source file", test.path));
        }
    }

    for (i, migration) in bundle.migrations.iter().enumerate() {
        if migration.id.is_empty() {
            errors.push(format!("migration[{i}] has an empty id"));
        }
        if migration.data_loss_risk == DataLossRisk::High {
            warnings.push(format!(
                "migration {} carries high data-loss risk",
                migration.id
            ));
        }
    }

    ShapeReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}
