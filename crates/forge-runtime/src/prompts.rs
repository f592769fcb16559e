// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prompt assembly for the analyze and plan phases.
//!
//! Thin on purpose: the real prompt engineering lives outside the core.
//! The contract the parsers rely on is "plan responses carry a JSON plan,
//! optionally fenced".

use forge_agents::CompletionRequest;
use forge_core::RequestContext;

const MAX_COMPLETION_TOKENS: u32 = 4096;

fn context_section(context: &RequestContext, limit: usize) -> String {
    let mut out = String::new();
    for file in context.files.iter().take(limit) {
        out.push_str(&format!("\n--- {} ---\n{}\n", file.path, file.content));
    }
    if !context.workspace_files.is_empty() {
        out.push_str("\nWorkspace files:\n");
        for path in &context.workspace_files {
            out.push_str(&format!("- {path}\n"));
        }
    }
    out
}

fn feedback_section(feedback: &[String]) -> String {
    if feedback.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nPrevious attempt failed; address these problems:\n");
    for item in feedback {
        out.push_str(&format!("- {item}\n"));
    }
    out
}

pub(crate) fn analyze_request(
    request: &str,
    context: &RequestContext,
    context_limit: usize,
    feedback: &[String],
) -> CompletionRequest {
    let prompt = format!(
        "Request: {request}\n{}{}\nSummarize what parts of the workspace this request \
         touches and what needs to change.",
        context_section(context, context_limit),
        feedback_section(feedback),
    );
    CompletionRequest {
        system: "You are a code analysis assistant. Answer with a concise analysis.".to_string(),
        prompt,
        max_tokens: MAX_COMPLETION_TOKENS,
    }
}

pub(crate) fn plan_request(
    request: &str,
    analysis_summary: &str,
    context: &RequestContext,
    context_limit: usize,
    feedback: &[String],
) -> CompletionRequest {
    let prompt = format!(
        "Request: {request}\n\nAnalysis:\n{analysis_summary}\n{}{}\n\
         Produce an implementation plan as JSON with fields: steps (id, action, target, \
         description, layer, depends_on), files (path, action), migrations (id, \
         description), complexity, estimated_duration, risks, dependency_changes.",
        context_section(context, context_limit),
        feedback_section(feedback),
    );
    CompletionRequest {
        system: "You are a planning assistant. Output a single JSON object, optionally in \
                 a fenced code block."
            .to_string(),
        prompt,
        max_tokens: MAX_COMPLETION_TOKENS,
    }
}
