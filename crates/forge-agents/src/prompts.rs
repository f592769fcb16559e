// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prompt assembly for the sub-agents.
//!
//! The concrete wording is deliberately thin; the contract with the model
//! is "one fenced code block" (two for migrations), which the parsers in
//! the crate root rely on.

use crate::StepContext;
use crate::client::CompletionRequest;
use forge_core::PlanStep;

const MAX_COMPLETION_TOKENS: u32 = 4096;

fn context_section(ctx: &StepContext) -> String {
    let mut out = String::new();
    for file in &ctx.context_files {
        out.push_str(&format!("\n--- {} ---\n{}\n", file.path, file.content));
    }
    out
}

pub(crate) fn code_request(
    step: &PlanStep,
    ctx: &StepContext,
    feedback: &[String],
) -> CompletionRequest {
    let mut prompt = format!(
        "Request: {}\n\nStep: {} {:?} `{}`\n{}\n",
        ctx.request, step.id, step.action, step.target, step.description
    );
    prompt.push_str(&context_section(ctx));
    if !feedback.is_empty() {
        prompt.push_str("\nThe previous attempt had syntax errors; fix them:\n");
        for error in feedback {
            prompt.push_str(&format!("- {error}\n"));
        }
    }
    prompt.push_str("\nReturn the complete file content in a single fenced code block.");
    CompletionRequest {
        system: "You are a code generator. Output exactly one fenced code block containing \
                 the full file content."
            .to_string(),
        prompt,
        max_tokens: MAX_COMPLETION_TOKENS,
    }
}

pub(crate) fn test_request(
    step: &PlanStep,
    ctx: &StepContext,
    source_file: &str,
    framework: &str,
) -> CompletionRequest {
    let mut prompt = format!(
        "Request: {}\n\nWrite {framework} tests for `{source_file}`.\nStep: {}\n",
        ctx.request, step.description
    );
    prompt.push_str(&context_section(ctx));
    prompt.push_str("\nReturn the complete test file in a single fenced code block.");
    CompletionRequest {
        system: format!(
            "You are a test generator targeting {framework}. Output exactly one fenced code \
             block containing the full test file."
        ),
        prompt,
        max_tokens: MAX_COMPLETION_TOKENS,
    }
}

pub(crate) fn migration_request(step: &PlanStep, ctx: &StepContext) -> CompletionRequest {
    let mut prompt = format!(
        "Request: {}\n\nMigration step: {} `{}`\n{}\n",
        ctx.request, step.id, step.target, step.description
    );
    prompt.push_str(&context_section(ctx));
    prompt.push_str(
        "\nReturn two fenced sql code blocks: the forward migration first, then the \
         reverse migration that undoes it.",
    );
    CompletionRequest {
        system: "You are a database migration generator. Output two fenced sql code blocks: \
                 forward then reverse."
            .to_string(),
        prompt,
        max_tokens: MAX_COMPLETION_TOKENS,
    }
}
