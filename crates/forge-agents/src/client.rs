// SPDX-License-Identifier: MIT OR Apache-2.0
//! The LLM client seam.
//!
//! The orchestrator treats the language model as an opaque call returning
//! text plus usage counts. Real transports implement [`LlmClient`]; tests
//! and scenario suites use [`MockClient`].

use forge_error::{ErrorCode, ForgeError};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Token usage reported for one completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Prompt plus completion tokens.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt.
    pub system: String,
    /// User prompt.
    pub prompt: String,
    /// Completion token cap.
    pub max_tokens: u32,
}

/// One completion response.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The model's text output.
    pub text: String,
    /// Reported usage.
    pub usage: TokenUsage,
}

/// An opaque language-model call.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce a completion for the request.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ForgeError>;
}

// ---------------------------------------------------------------------------
// MockClient
// ---------------------------------------------------------------------------

type MockHandler =
    Box<dyn Fn(u32, &CompletionRequest) -> Result<Completion, ForgeError> + Send + Sync>;

/// Scripted client for tests and scenario suites.
///
/// Responses come from either a fixed text sequence (the last entry repeats
/// once the script runs out) or a custom handler receiving the 0-based call
/// index and the request.
pub struct MockClient {
    handler: MockHandler,
    calls: AtomicU32,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockClient {
    /// Mock whose `n`-th call returns `texts[min(n, len-1)]` with fixed
    /// non-zero usage counts.
    #[must_use]
    pub fn from_texts(texts: Vec<String>) -> Self {
        Self::with_handler(move |call, _request| {
            let idx = (call as usize).min(texts.len().saturating_sub(1));
            let text = texts
                .get(idx)
                .cloned()
                .ok_or_else(|| ForgeError::new(ErrorCode::Internal, "mock has no responses"))?;
            Ok(Completion {
                text,
                usage: TokenUsage {
                    prompt_tokens: 120,
                    completion_tokens: 80,
                },
            })
        })
    }

    /// Mock driven by a custom handler.
    pub fn with_handler(
        handler: impl Fn(u32, &CompletionRequest) -> Result<Completion, ForgeError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Copies of every request received, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

#[async_trait::async_trait]
impl LlmClient for MockClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ForgeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request.clone());
        (self.handler)(call, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_texts_repeats_last_entry() {
        let mock = MockClient::from_texts(vec!["a".into(), "b".into()]);
        let req = CompletionRequest {
            system: String::new(),
            prompt: "p".into(),
            max_tokens: 100,
        };
        assert_eq!(mock.complete(req.clone()).await.unwrap().text, "a");
        assert_eq!(mock.complete(req.clone()).await.unwrap().text, "b");
        assert_eq!(mock.complete(req).await.unwrap().text, "b");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn handler_sees_call_index_and_request() {
        let mock = MockClient::with_handler(|call, request| {
            Ok(Completion {
                text: format!("{call}:{}", request.prompt),
                usage: TokenUsage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                },
            })
        });
        let req = CompletionRequest {
            system: String::new(),
            prompt: "hello".into(),
            max_tokens: 10,
        };
        assert_eq!(mock.complete(req.clone()).await.unwrap().text, "0:hello");
        assert_eq!(mock.complete(req).await.unwrap().text, "1:hello");
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let mock = MockClient::with_handler(|_, _| {
            Err(ForgeError::from_signal(Some(429), "throttled"))
        });
        let err = mock
            .complete(CompletionRequest {
                system: String::new(),
                prompt: "x".into(),
                max_tokens: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmRateLimited);
    }
}
