// SPDX-License-Identifier: MIT OR Apache-2.0
//! The six built-in gate checks, in their fixed chain order.

use crate::syntax;
use crate::{CheckLevel, CheckOutcome, GateCheck, GateConfig};
use forge_core::{Bundle, StepAction};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// 1. SyntaxCheck
// ---------------------------------------------------------------------------

/// Validates every file and test by extension: JS/TS-family via the
/// structural scanner, JSON via the JSON parser, CSS by balance scan.
/// Other file types pass.
pub struct SyntaxCheck;

#[async_trait::async_trait]
impl GateCheck for SyntaxCheck {
    fn name(&self) -> &'static str {
        "SyntaxCheck"
    }

    fn level(&self) -> CheckLevel {
        CheckLevel::Blocker
    }

    async fn run(&self, bundle: &Bundle, _config: &GateConfig) -> anyhow::Result<CheckOutcome> {
        let mut file_errors: Vec<serde_json::Value> = Vec::new();

        let sources = bundle
            .files
            .iter()
            .filter(|f| f.action != StepAction::Delete)
            .map(|f| (&f.path, &f.content))
            .chain(bundle.tests.iter().map(|t| (&t.path, &t.content)));

        for (path, content) in sources {
            if let Some(errors) = syntax::scan_by_extension(path, content) {
                for error in errors {
                    file_errors.push(json!({ "file": path, "error": error }));
                }
            }
        }

        let passed = file_errors.is_empty();
        Ok(CheckOutcome {
            passed,
            message: if passed {
                "all files parse".to_string()
            } else {
                format!("{} syntax error(s)", file_errors.len())
            },
            details: json!({ "errors": file_errors }),
        })
    }
}

// ---------------------------------------------------------------------------
// 2. DependencyCheck
// ---------------------------------------------------------------------------

/// Extracts static, dynamic, and CommonJS imports and resolves every
/// relative specifier against the bundle's file list. Non-relative imports
/// are treated as external and assumed resolvable.
pub struct DependencyCheck;

/// Extension search order for import resolution.
const EXTENSION_ORDER: [&str; 6] = ["", ".js", ".jsx", ".ts", ".tsx", ".json"];

fn import_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // import x from 'y' / import 'y'
            Regex::new(r#"(?m)^\s*import\s+(?:[\w$*{},\s]+from\s+)?['"]([^'"]+)['"]"#)
                .expect("static import pattern"),
            // export ... from 'y'
            Regex::new(r#"(?m)^\s*export\s+[\w$*{},\s]+from\s+['"]([^'"]+)['"]"#)
                .expect("re-export pattern"),
            // dynamic import('y')
            Regex::new(r#"import\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("dynamic import pattern"),
            // require('y')
            Regex::new(r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require pattern"),
        ]
    })
}

/// Extract all import specifiers from one source file.
#[must_use]
pub fn extract_imports(source: &str) -> Vec<String> {
    let mut specifiers = Vec::new();
    for pattern in import_patterns() {
        for captures in pattern.captures_iter(source) {
            specifiers.push(captures[1].to_string());
        }
    }
    specifiers
}

/// Collapse `.` and `..` segments of a `/`-separated path.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn resolve_relative(importer: &str, specifier: &str, files: &BTreeSet<String>) -> bool {
    let base = match importer.rfind('/') {
        Some(idx) => &importer[..idx],
        None => "",
    };
    let joined = normalize_path(&format!("{base}/{specifier}"));

    for ext in EXTENSION_ORDER {
        if files.contains(&format!("{joined}{ext}")) {
            return true;
        }
    }
    // Directory import: look for index files.
    for ext in EXTENSION_ORDER.iter().skip(1) {
        if files.contains(&format!("{joined}/index{ext}")) {
            return true;
        }
    }
    false
}

#[async_trait::async_trait]
impl GateCheck for DependencyCheck {
    fn name(&self) -> &'static str {
        "DependencyCheck"
    }

    fn level(&self) -> CheckLevel {
        CheckLevel::Blocker
    }

    async fn run(&self, bundle: &Bundle, _config: &GateConfig) -> anyhow::Result<CheckOutcome> {
        let known: BTreeSet<String> = bundle
            .files
            .iter()
            .filter(|f| f.action != StepAction::Delete)
            .map(|f| f.path.clone())
            .chain(bundle.tests.iter().map(|t| t.path.clone()))
            .collect();

        let mut unresolved: Vec<serde_json::Value> = Vec::new();
        let mut external = 0usize;

        let sources = bundle
            .files
            .iter()
            .filter(|f| f.action != StepAction::Delete)
            .map(|f| (&f.path, &f.content))
            .chain(bundle.tests.iter().map(|t| (&t.path, &t.content)));

        for (path, content) in sources {
            for specifier in extract_imports(content) {
                if specifier.starts_with("./") || specifier.starts_with("../") {
                    if !resolve_relative(path, &specifier, &known) {
                        unresolved.push(json!({ "file": path, "import": specifier }));
                    }
                } else {
                    external += 1;
                }
            }
        }

        let passed = unresolved.is_empty();
        Ok(CheckOutcome {
            passed,
            message: if passed {
                format!("all relative imports resolve ({external} external)")
            } else {
                format!("{} unresolved import(s)", unresolved.len())
            },
            details: json!({ "unresolved": unresolved, "external_count": external }),
        })
    }
}

// ---------------------------------------------------------------------------
// 3. SchemaCheck
// ---------------------------------------------------------------------------

/// Validates required bundle fields and the types of optional blocks.
pub struct SchemaCheck;

#[async_trait::async_trait]
impl GateCheck for SchemaCheck {
    fn name(&self) -> &'static str {
        "SchemaCheck"
    }

    fn level(&self) -> CheckLevel {
        CheckLevel::Blocker
    }

    async fn run(&self, bundle: &Bundle, _config: &GateConfig) -> anyhow::Result<CheckOutcome> {
        let mut errors: Vec<String> = Vec::new();

        if bundle.id.is_empty() {
            errors.push("bundle id is empty".to_string());
        }
        for (i, file) in bundle.files.iter().enumerate() {
            if file.path.is_empty() {
                errors.push(format!("files[{i}].path is empty"));
            }
        }

        if let Some(app_spec) = &bundle.app_spec {
            if !app_spec.is_object() {
                errors.push("app_spec must be an object".to_string());
            }
        }
        if let Some(plan) = &bundle.plan {
            if !plan.is_object() {
                errors.push("plan must be an object".to_string());
            } else if let Some(steps) = plan.get("steps") {
                match steps.as_array() {
                    None => errors.push("plan.steps must be an array".to_string()),
                    Some(steps) => {
                        for (i, step) in steps.iter().enumerate() {
                            for field in ["id", "action", "target"] {
                                if step.get(field).and_then(|v| v.as_str()).is_none() {
                                    errors.push(format!("plan.steps[{i}].{field} is missing"));
                                }
                            }
                        }
                    }
                }
            }
        }

        let passed = errors.is_empty();
        Ok(CheckOutcome {
            passed,
            message: if passed {
                "bundle schema is well-formed".to_string()
            } else {
                format!("{} schema violation(s)", errors.len())
            },
            details: json!({ "errors": errors }),
        })
    }
}

// ---------------------------------------------------------------------------
// 4. TestCoverageCheck
// ---------------------------------------------------------------------------

/// Computes the fraction of testable source files covered by generated
/// tests and fails below the configured threshold.
pub struct TestCoverageCheck;

const CODE_EXTENSIONS: [&str; 6] = ["js", "jsx", "ts", "tsx", "mjs", "cjs"];

fn extension(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or("")
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name)
}

fn is_test_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.contains(".test.")
        || name.contains(".spec.")
        || path.contains("__tests__/")
        || path.starts_with("tests/")
        || path.contains("/tests/")
}

fn is_config_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == "package.json"
        || name.starts_with('.')
        || name.contains(".config.")
        || name.starts_with("tsconfig")
}

/// Whether a bundle file counts toward the coverage denominator.
#[must_use]
pub fn should_be_tested(path: &str, action: StepAction) -> bool {
    action != StepAction::Delete
        && CODE_EXTENSIONS.contains(&extension(path))
        && !is_test_path(path)
        && !is_config_path(path)
}

fn is_covered(source_path: &str, tests: &[(String, String)]) -> bool {
    let stem = file_stem(source_path);
    tests.iter().any(|(test_path, source_file)| {
        if source_file == source_path {
            return true;
        }
        // Conventional match: `<stem>.test.*` / `<stem>.spec.*`.
        let test_name = test_path.rsplit('/').next().unwrap_or(test_path);
        test_name.starts_with(&format!("{stem}.test."))
            || test_name.starts_with(&format!("{stem}.spec."))
    })
}

#[async_trait::async_trait]
impl GateCheck for TestCoverageCheck {
    fn name(&self) -> &'static str {
        "TestCoverageCheck"
    }

    fn level(&self) -> CheckLevel {
        CheckLevel::Blocker
    }

    async fn run(&self, bundle: &Bundle, config: &GateConfig) -> anyhow::Result<CheckOutcome> {
        let tests: Vec<(String, String)> = bundle
            .tests
            .iter()
            .map(|t| (t.path.clone(), t.source_file.clone()))
            .collect();

        let testable: Vec<&str> = bundle
            .files
            .iter()
            .filter(|f| should_be_tested(&f.path, f.action))
            .map(|f| f.path.as_str())
            .collect();

        let uncovered: Vec<&str> = testable
            .iter()
            .copied()
            .filter(|path| !is_covered(path, &tests))
            .collect();

        let coverage = if testable.is_empty() {
            100.0
        } else {
            (testable.len() - uncovered.len()) as f64 / testable.len() as f64 * 100.0
        };
        let passed = coverage >= config.coverage_threshold;

        Ok(CheckOutcome {
            passed,
            message: format!(
                "coverage {coverage:.1}% (threshold {:.1}%)",
                config.coverage_threshold
            ),
            details: json!({
                "coverage_pct": coverage,
                "threshold_pct": config.coverage_threshold,
                "testable": testable,
                "uncovered": uncovered,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// 5. SecurityCheck
// ---------------------------------------------------------------------------

/// Heuristic scan for hardcoded secrets, dangerous constructs, and SQL
/// string building. Findings are reported but never block.
pub struct SecurityCheck;

/// Severity of a security finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    /// Leaked key material or credentials.
    Critical,
    /// Dangerous construct likely exploitable.
    High,
    /// Risky pattern worth review.
    Medium,
}

/// One security finding.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityFinding {
    /// Severity classification.
    pub severity: FindingSeverity,
    /// Which rule fired.
    pub rule: &'static str,
    /// File the pattern matched in.
    pub file: String,
    /// 1-based line of the match.
    pub line: usize,
}

struct SecurityRule {
    rule: &'static str,
    severity: FindingSeverity,
    pattern: Regex,
}

fn security_rules() -> &'static Vec<SecurityRule> {
    static RULES: OnceLock<Vec<SecurityRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let rule = |rule, severity, pattern: &str| SecurityRule {
            rule,
            severity,
            pattern: Regex::new(pattern).expect("security pattern"),
        };
        vec![
            rule(
                "hardcoded_credential",
                FindingSeverity::High,
                r#"(?i)(api[_-]?key|apikey|secret|password|passwd|auth[_-]?token)\s*[:=]\s*['"][^'"]{8,}['"]"#,
            ),
            rule(
                "private_key_material",
                FindingSeverity::Critical,
                r"-----BEGIN (RSA |EC |OPENSSH )?PRIVATE KEY-----",
            ),
            rule(
                "aws_access_key",
                FindingSeverity::Critical,
                r"\bAKIA[0-9A-Z]{16}\b",
            ),
            rule(
                "database_uri_credentials",
                FindingSeverity::Critical,
                r"(?i)\b(postgres|postgresql|mysql|mongodb(\+srv)?|redis)://[^/\s:@]+:[^@\s]+@",
            ),
            rule("eval_call", FindingSeverity::High, r"\beval\s*\("),
            rule(
                "function_constructor",
                FindingSeverity::High,
                r"\bnew\s+Function\s*\(",
            ),
            rule(
                "inner_html_assignment",
                FindingSeverity::Medium,
                r"\.innerHTML\s*=",
            ),
            rule(
                "document_write",
                FindingSeverity::Medium,
                r"\bdocument\.write\s*\(",
            ),
            rule(
                "sql_string_concatenation",
                FindingSeverity::Medium,
                r#"(?i)["'][^"']*\b(select|insert|update|delete)\b[^"']*["']\s*\+"#,
            ),
            rule(
                "sql_template_interpolation",
                FindingSeverity::Medium,
                r"(?is)`[^`]*\b(select|insert|update|delete)\b[^`]*\$\{",
            ),
        ]
    })
}

fn line_of_offset(source: &str, offset: usize) -> usize {
    source[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

/// Scan one file's content and return findings.
#[must_use]
pub fn scan_security(path: &str, content: &str) -> Vec<SecurityFinding> {
    let mut findings = Vec::new();
    for rule in security_rules() {
        for m in rule.pattern.find_iter(content) {
            findings.push(SecurityFinding {
                severity: rule.severity,
                rule: rule.rule,
                file: path.to_string(),
                line: line_of_offset(content, m.start()),
            });
        }
    }
    findings
}

#[async_trait::async_trait]
impl GateCheck for SecurityCheck {
    fn name(&self) -> &'static str {
        "SecurityCheck"
    }

    fn level(&self) -> CheckLevel {
        CheckLevel::Warning
    }

    async fn run(&self, bundle: &Bundle, _config: &GateConfig) -> anyhow::Result<CheckOutcome> {
        let mut findings: Vec<SecurityFinding> = Vec::new();
        for file in bundle.files.iter().filter(|f| f.action != StepAction::Delete) {
            findings.extend(scan_security(&file.path, &file.content));
        }
        for test in &bundle.tests {
            findings.extend(scan_security(&test.path, &test.content));
        }

        let critical = findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Critical)
            .count();
        let passed = findings.is_empty();
        Ok(CheckOutcome {
            passed,
            message: if passed {
                "no security findings".to_string()
            } else {
                format!("{} finding(s), {critical} critical", findings.len())
            },
            details: json!({ "findings": findings }),
        })
    }
}

// ---------------------------------------------------------------------------
// 6. MigrationReversibilityCheck
// ---------------------------------------------------------------------------

/// Requires non-empty forward and reverse SQL and verifies each recognised
/// forward operation has its named inverse in the reverse script.
///
/// Operation extraction is regex-based over a closed set (`CREATE TABLE`,
/// `DROP TABLE`, `ADD COLUMN`, `DROP COLUMN`, `CREATE INDEX`,
/// `DROP INDEX`); anything else is unknown and assumed fine.
pub struct MigrationReversibilityCheck;

/// A recognised DDL operation, carrying the object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SqlOp {
    /// `CREATE TABLE <name>`
    CreateTable(String),
    /// `DROP TABLE <name>`
    DropTable(String),
    /// `ADD COLUMN <name>`
    AddColumn(String),
    /// `DROP COLUMN <name>`
    DropColumn(String),
    /// `CREATE INDEX <name>`
    CreateIndex(String),
    /// `DROP INDEX <name>`
    DropIndex(String),
}

impl SqlOp {
    /// The operation that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> SqlOp {
        match self {
            Self::CreateTable(n) => Self::DropTable(n.clone()),
            Self::DropTable(n) => Self::CreateTable(n.clone()),
            Self::AddColumn(n) => Self::DropColumn(n.clone()),
            Self::DropColumn(n) => Self::AddColumn(n.clone()),
            Self::CreateIndex(n) => Self::DropIndex(n.clone()),
            Self::DropIndex(n) => Self::CreateIndex(n.clone()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::CreateTable(n) => format!("CREATE TABLE {n}"),
            Self::DropTable(n) => format!("DROP TABLE {n}"),
            Self::AddColumn(n) => format!("ADD COLUMN {n}"),
            Self::DropColumn(n) => format!("DROP COLUMN {n}"),
            Self::CreateIndex(n) => format!("CREATE INDEX {n}"),
            Self::DropIndex(n) => format!("DROP INDEX {n}"),
        }
    }
}

fn sql_op_patterns() -> &'static Vec<(Regex, fn(String) -> SqlOp)> {
    static PATTERNS: OnceLock<Vec<(Regex, fn(String) -> SqlOp)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let pattern = |p: &str| Regex::new(p).expect("sql op pattern");
        vec![
            (
                pattern(r#"(?i)\bCREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?[`"]?(\w+)"#),
                SqlOp::CreateTable as fn(String) -> SqlOp,
            ),
            (
                pattern(r#"(?i)\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?[`"]?(\w+)"#),
                SqlOp::DropTable,
            ),
            (
                pattern(r#"(?i)\bADD\s+COLUMN\s+(?:IF\s+NOT\s+EXISTS\s+)?[`"]?(\w+)"#),
                SqlOp::AddColumn,
            ),
            (
                pattern(r#"(?i)\bDROP\s+COLUMN\s+(?:IF\s+EXISTS\s+)?[`"]?(\w+)"#),
                SqlOp::DropColumn,
            ),
            (
                pattern(r#"(?i)\bCREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:IF\s+NOT\s+EXISTS\s+)?[`"]?(\w+)"#),
                SqlOp::CreateIndex,
            ),
            (
                pattern(r#"(?i)\bDROP\s+INDEX\s+(?:IF\s+EXISTS\s+)?[`"]?(\w+)"#),
                SqlOp::DropIndex,
            ),
        ]
    })
}

/// Extract the recognised operations from a SQL string, lowercasing names.
#[must_use]
pub fn extract_sql_ops(sql: &str) -> BTreeSet<SqlOp> {
    let mut ops = BTreeSet::new();
    for (pattern, make) in sql_op_patterns() {
        for captures in pattern.captures_iter(sql) {
            ops.insert(make(captures[1].to_ascii_lowercase()));
        }
    }
    ops
}

#[async_trait::async_trait]
impl GateCheck for MigrationReversibilityCheck {
    fn name(&self) -> &'static str {
        "MigrationReversibilityCheck"
    }

    fn level(&self) -> CheckLevel {
        CheckLevel::Blocker
    }

    async fn run(&self, bundle: &Bundle, _config: &GateConfig) -> anyhow::Result<CheckOutcome> {
        let mut errors: Vec<serde_json::Value> = Vec::new();

        for migration in &bundle.migrations {
            if migration.sql_forward.trim().is_empty() {
                errors.push(json!({ "migration": migration.id, "error": "forward SQL is empty" }));
                continue;
            }
            if migration.sql_reverse.trim().is_empty() {
                errors.push(json!({ "migration": migration.id, "error": "reverse SQL is empty" }));
                continue;
            }

            let forward = extract_sql_ops(&migration.sql_forward);
            let reverse = extract_sql_ops(&migration.sql_reverse);

            for op in &forward {
                if !reverse.contains(&op.inverse()) {
                    errors.push(json!({
                        "migration": migration.id,
                        "error": format!(
                            "forward op `{}` has no inverse `{}` in reverse SQL",
                            op.describe(),
                            op.inverse().describe()
                        ),
                    }));
                }
            }
            for op in &reverse {
                if !forward.contains(&op.inverse()) {
                    errors.push(json!({
                        "migration": migration.id,
                        "error": format!(
                            "reverse op `{}` has no inverse `{}` in forward SQL",
                            op.describe(),
                            op.inverse().describe()
                        ),
                    }));
                }
            }
        }

        let passed = errors.is_empty();
        Ok(CheckOutcome {
            passed,
            message: if passed {
                format!("{} migration(s) reversible", bundle.migrations.len())
            } else {
                format!("{} reversibility problem(s)", errors.len())
            },
            details: json!({ "errors": errors }),
        })
    }
}
