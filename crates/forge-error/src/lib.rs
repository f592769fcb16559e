// SPDX-License-Identifier: MIT OR Apache-2.0
//! Failure taxonomy shared by every forge crate.
//!
//! Failures are described along two axes. [`ErrorClass`] is the closed
//! nine-entry retry axis (rate limit, token limit, auth, network, timeout,
//! generation, validation, tool error, unrecoverable): the retry harness
//! picks its recovery action by class, and [`classify_signal`] folds raw
//! transport evidence (HTTP status, message substrings) into it.
//! [`ErrorCode`] pins down the concrete failure within a class, and
//! [`ForgeError`] is the carrier type: code plus message, an optional
//! source for cause-chaining, provider retry-after advice, and free-form
//! diagnostic context.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ErrorClass (the retry taxonomy)
// ---------------------------------------------------------------------------

/// Retry-relevant classification of a failure.
///
/// This is the closed set the retry harness dispatches recovery on; the
/// mapping from raw signals (HTTP status, message text) is
/// [`classify_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Provider throttling (HTTP 429).
    RateLimit,
    /// Prompt exceeded the model's context window.
    TokenLimit,
    /// Credentials rejected (HTTP 401/403). Never retried.
    Auth,
    /// Transport-level failure (reset, refused, DNS, HTTP 5xx).
    Network,
    /// The operation or connection timed out.
    Timeout,
    /// Model output could not be parsed.
    Generation,
    /// Explicit validation failure.
    Validation,
    /// A tool invocation failed during agentic execution.
    ToolError,
    /// Anything else. Never retried.
    Unrecoverable,
}

impl ErrorClass {
    /// Whether the retry harness may attempt this class again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth | Self::Unrecoverable)
    }

    /// Stable wire string for this class.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::TokenLimit => "token_limit",
            Self::Auth => "auth",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Generation => "generation",
            Self::Validation => "validation",
            Self::ToolError => "tool_error",
            Self::Unrecoverable => "unrecoverable",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a raw failure signal into an [`ErrorClass`].
///
/// `status` is the HTTP status code when the failure came from an HTTP
/// transport; `message` is matched case-insensitively for the documented
/// substrings.
#[must_use]
pub fn classify_signal(status: Option<u16>, message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();

    if status == Some(429) {
        return ErrorClass::RateLimit;
    }
    if status == Some(400)
        && (msg.contains("context length") || msg.contains("token limit") || msg.contains("too long"))
    {
        return ErrorClass::TokenLimit;
    }
    if matches!(status, Some(401) | Some(403)) {
        return ErrorClass::Auth;
    }
    if msg.contains("timeout") || msg.contains("timed out") {
        return ErrorClass::Timeout;
    }
    if status.is_some_and(|s| s >= 500)
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("dns")
        || msg.contains("name resolution")
    {
        return ErrorClass::Network;
    }
    if msg.contains("json") || msg.contains("parse") || msg.contains("syntax") {
        return ErrorClass::Generation;
    }
    if msg.contains("validation") {
        return ErrorClass::Validation;
    }
    if msg.contains("tool") {
        return ErrorClass::ToolError;
    }
    ErrorClass::Unrecoverable
}

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Which subsystem an [`ErrorCode`] originates from; useful for grouping
/// failures in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Token budget accounting.
    Budget,
    /// LLM transport and generation.
    Llm,
    /// Plan scheduling.
    Schedule,
    /// Release gate validation.
    Gate,
    /// Bundle signing and verification.
    Signer,
    /// Task state persistence.
    Store,
    /// Task lifecycle.
    Task,
    /// Approval checkpoint.
    Approval,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Budget => "budget",
            Self::Llm => "llm",
            Self::Schedule => "schedule",
            Self::Gate => "gate",
            Self::Signer => "signer",
            Self::Store => "store",
            Self::Task => "task",
            Self::Approval => "approval",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Wire-stable identifier for one concrete failure.
///
/// Codes travel in task errors and event payloads as
/// `SCREAMING_SNAKE_CASE` strings; once a code has shipped, its spelling
/// is frozen so clients can match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Budget --
    /// A reservation was requested beyond the available budget.
    BudgetInsufficient,
    /// Total usage crossed the configured budget.
    BudgetExceeded,
    /// A reservation id is unknown or already closed.
    ReservationInvalid,
    /// A consume exceeded its reservation.
    ReservationExceeded,

    // -- LLM --
    /// Provider throttled the request.
    LlmRateLimited,
    /// Prompt exceeded the model's context window.
    LlmTokenLimit,
    /// Credentials rejected.
    LlmAuthFailed,
    /// Transport-level failure talking to the provider.
    LlmNetwork,
    /// The call timed out.
    LlmTimeout,
    /// Model output could not be parsed into the expected shape.
    GenerationMalformed,

    // -- Schedule --
    /// Step dependencies contain a cycle.
    CircularDependency,
    /// A sub-agent step failed.
    StepFailed,
    /// A tool invocation failed during agentic execution.
    ToolFailed,

    // -- Gate --
    /// One or more blocking checks failed.
    GateBlocked,

    // -- Signer --
    /// Signer used before `initialize`.
    SignerNotInitialized,
    /// Keypair could not be read, written, or generated.
    KeyIoFailed,
    /// Signing or verification failed at the crypto layer.
    SignatureFailed,

    // -- Store --
    /// Task state could not be read or written.
    StoreIoFailed,

    // -- Task --
    /// Task id is unknown.
    TaskNotFound,
    /// Task is not in a state that allows the requested operation.
    TaskInvalidState,

    // -- Approval --
    /// The approval wait expired.
    ApprovalTimeout,
    /// The plan was explicitly rejected.
    ApprovalRejected,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// The subsystem this code originates from.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BudgetInsufficient
            | Self::BudgetExceeded
            | Self::ReservationInvalid
            | Self::ReservationExceeded => ErrorCategory::Budget,

            Self::LlmRateLimited
            | Self::LlmTokenLimit
            | Self::LlmAuthFailed
            | Self::LlmNetwork
            | Self::LlmTimeout
            | Self::GenerationMalformed => ErrorCategory::Llm,

            Self::CircularDependency | Self::StepFailed | Self::ToolFailed => {
                ErrorCategory::Schedule
            }

            Self::GateBlocked => ErrorCategory::Gate,

            Self::SignerNotInitialized | Self::KeyIoFailed | Self::SignatureFailed => {
                ErrorCategory::Signer
            }

            Self::StoreIoFailed => ErrorCategory::Store,

            Self::TaskNotFound | Self::TaskInvalidState => ErrorCategory::Task,

            Self::ApprovalTimeout | Self::ApprovalRejected => ErrorCategory::Approval,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the [`ErrorClass`] the retry harness should treat this code as.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::LlmRateLimited => ErrorClass::RateLimit,
            Self::LlmTokenLimit => ErrorClass::TokenLimit,
            Self::LlmAuthFailed => ErrorClass::Auth,
            Self::LlmNetwork => ErrorClass::Network,
            Self::LlmTimeout => ErrorClass::Timeout,
            Self::GenerationMalformed => ErrorClass::Generation,
            Self::GateBlocked => ErrorClass::Validation,
            Self::ToolFailed => ErrorClass::ToolError,
            // Budget exhaustion is deliberately non-retryable.
            _ => ErrorClass::Unrecoverable,
        }
    }

    /// The frozen string form of this code (e.g. `"BUDGET_EXCEEDED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetInsufficient => "BUDGET_INSUFFICIENT",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::ReservationInvalid => "RESERVATION_INVALID",
            Self::ReservationExceeded => "RESERVATION_EXCEEDED",
            Self::LlmRateLimited => "LLM_RATE_LIMITED",
            Self::LlmTokenLimit => "LLM_TOKEN_LIMIT",
            Self::LlmAuthFailed => "LLM_AUTH_FAILED",
            Self::LlmNetwork => "LLM_NETWORK",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::GenerationMalformed => "GENERATION_MALFORMED",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::StepFailed => "STEP_FAILED",
            Self::ToolFailed => "TOOL_FAILED",
            Self::GateBlocked => "GATE_BLOCKED",
            Self::SignerNotInitialized => "SIGNER_NOT_INITIALIZED",
            Self::KeyIoFailed => "KEY_IO_FAILED",
            Self::SignatureFailed => "SIGNATURE_FAILED",
            Self::StoreIoFailed => "STORE_IO_FAILED",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::TaskInvalidState => "TASK_INVALID_STATE",
            Self::ApprovalTimeout => "APPROVAL_TIMEOUT",
            Self::ApprovalRejected => "APPROVAL_REJECTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ForgeError
// ---------------------------------------------------------------------------

/// The error type every forge component surfaces.
///
/// Pairs an [`ErrorCode`] with the human-readable story of what went
/// wrong; the underlying cause and any provider retry-after advice ride
/// along, and callers can pin extra diagnostics onto `context`.
///
/// # Builder usage
///
/// ```
/// use forge_error::{ForgeError, ErrorCode};
///
/// let err = ForgeError::new(ErrorCode::LlmRateLimited, "throttled")
///     .with_context("provider", "mock")
///     .with_retry_after(std::time::Duration::from_secs(2));
/// assert!(err.class().is_retryable());
/// ```
pub struct ForgeError {
    /// What failed, as a wire-stable code.
    pub code: ErrorCode,
    /// The story of the failure, for humans.
    pub message: String,
    /// The error that caused this one, when known.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Provider-supplied retry-after delay, when available (rate limits).
    pub retry_after: Option<Duration>,
    /// Extra diagnostics keyed by name.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ForgeError {
    /// Build an error from a code and a message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            retry_after: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach provider retry-after advice.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Record a named diagnostic value on the error.
    ///
    /// Values that fail to serialize to JSON are dropped rather than
    /// turning a diagnostic into a second failure.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// The retry class for this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    /// Classify a raw transport signal into a forge error.
    ///
    /// This is the constructor LLM adapters use: HTTP status plus message
    /// text, mapped through [`classify_signal`].
    pub fn from_signal(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let code = match classify_signal(status, &message) {
            ErrorClass::RateLimit => ErrorCode::LlmRateLimited,
            ErrorClass::TokenLimit => ErrorCode::LlmTokenLimit,
            ErrorClass::Auth => ErrorCode::LlmAuthFailed,
            ErrorClass::Network => ErrorCode::LlmNetwork,
            ErrorClass::Timeout => ErrorCode::LlmTimeout,
            ErrorClass::Generation => ErrorCode::GenerationMalformed,
            ErrorClass::Validation => ErrorCode::GateBlocked,
            ErrorClass::ToolError => ErrorCode::ToolFailed,
            ErrorClass::Unrecoverable => ErrorCode::Internal,
        };
        let mut err = Self::new(code, message);
        if let Some(s) = status {
            err = err.with_context("http_status", s);
        }
        err
    }
}

impl fmt::Display for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl fmt::Debug for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForgeError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("retry_after", &self.retry_after)
            .field("context", &self.context)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl std::error::Error for ForgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used across the workspace.
pub type Result<T, E = ForgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_is_rate_limit() {
        assert_eq!(classify_signal(Some(429), "slow down"), ErrorClass::RateLimit);
    }

    #[test]
    fn http_400_with_context_length_is_token_limit() {
        assert_eq!(
            classify_signal(Some(400), "maximum context length exceeded"),
            ErrorClass::TokenLimit
        );
        assert_eq!(
            classify_signal(Some(400), "prompt too long"),
            ErrorClass::TokenLimit
        );
    }

    #[test]
    fn plain_http_400_is_not_token_limit() {
        assert_eq!(
            classify_signal(Some(400), "bad request"),
            ErrorClass::Unrecoverable
        );
    }

    #[test]
    fn http_401_403_are_auth() {
        assert_eq!(classify_signal(Some(401), "no"), ErrorClass::Auth);
        assert_eq!(classify_signal(Some(403), "no"), ErrorClass::Auth);
        assert!(!ErrorClass::Auth.is_retryable());
    }

    #[test]
    fn transport_failures_are_network() {
        assert_eq!(classify_signal(Some(502), "bad gateway"), ErrorClass::Network);
        assert_eq!(
            classify_signal(None, "connection refused"),
            ErrorClass::Network
        );
        assert_eq!(
            classify_signal(None, "DNS lookup failed"),
            ErrorClass::Network
        );
    }

    #[test]
    fn timeout_wins_over_network_text() {
        assert_eq!(
            classify_signal(None, "connection timed out"),
            ErrorClass::Timeout
        );
    }

    #[test]
    fn parse_failures_are_generation() {
        assert_eq!(
            classify_signal(None, "invalid JSON in model output"),
            ErrorClass::Generation
        );
        assert_eq!(
            classify_signal(None, "unexpected syntax near token"),
            ErrorClass::Generation
        );
    }

    #[test]
    fn unknown_is_unrecoverable() {
        let class = classify_signal(None, "segfault");
        assert_eq!(class, ErrorClass::Unrecoverable);
        assert!(!class.is_retryable());
    }

    #[test]
    fn code_categories_cover_budget_and_signer() {
        assert_eq!(ErrorCode::BudgetExceeded.category(), ErrorCategory::Budget);
        assert_eq!(
            ErrorCode::SignerNotInitialized.category(),
            ErrorCategory::Signer
        );
    }

    #[test]
    fn budget_exceeded_is_not_retryable() {
        assert_eq!(ErrorCode::BudgetExceeded.class(), ErrorClass::Unrecoverable);
    }

    #[test]
    fn from_signal_maps_to_llm_codes() {
        let err = ForgeError::from_signal(Some(429), "throttled");
        assert_eq!(err.code, ErrorCode::LlmRateLimited);
        assert_eq!(
            err.context.get("http_status"),
            Some(&serde_json::json!(429))
        );
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = ForgeError::new(ErrorCode::TaskNotFound, "task_x");
        let s = err.to_string();
        assert!(s.contains("TASK_NOT_FOUND"));
        assert!(s.contains("task_x"));
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = ForgeError::new(ErrorCode::StoreIoFailed, "persist failed").with_source(io);
        let src = std::error::Error::source(&err).unwrap();
        assert!(src.to_string().contains("disk on fire"));
    }

    #[test]
    fn codes_serialize_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::CircularDependency).unwrap(),
            "\"CIRCULAR_DEPENDENCY\""
        );
    }
}
