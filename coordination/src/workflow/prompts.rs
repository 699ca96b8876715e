//! Stage prompts.

pub const PREPROCESS_SYSTEM: &str = "You turn raw developer requests into precise engineering \
tasks. Restate the request, list explicit requirements and constraints, and note any \
assumptions. Do not write code.";

pub const PLANNER_SYSTEM: &str = "You are a senior engineer planning an implementation. \
Produce a short numbered plan: files to touch (with paths), types and functions to add or \
change (in backticks), edge cases, and how to test. Do not write the full code.";

pub const CODER_SYSTEM: &str = "You are an expert programmer. Implement the plan exactly. \
Reply with the complete code only, in one fenced block, with no commentary.";

pub const REVIEWER_SYSTEM: &str = "You are a strict code reviewer. Start your reply with \
APPROVED or REJECTED on its own line. If rejected, follow with concrete, actionable feedback.";

pub fn preprocess(context: &str) -> String {
    format!("{context}\n\nRewrite the request above as a precise task description.")
}

pub fn plan(context: &str, codebase: Option<&str>, escalation_feedback: Option<&str>) -> String {
    let mut prompt = context.to_string();
    if let Some(codebase) = codebase {
        prompt.push_str(&format!("\n\n## Codebase\n{codebase}"));
    }
    if let Some(feedback) = escalation_feedback {
        prompt.push_str(&format!(
            "\n\n## Previous attempts were rejected\nEarlier implementations of the plan failed review. \
             Write a new plan that addresses every point below.\n{feedback}"
        ));
    }
    prompt.push_str("\n\nWrite the implementation plan.");
    prompt
}

pub fn generate(context: &str, plan: &str, tool_context: &str) -> String {
    let mut prompt = format!("{context}\n\n## Plan\n{plan}");
    if !tool_context.is_empty() {
        prompt.push_str(&format!("\n\n## Relevant code\n{tool_context}"));
    }
    prompt.push_str("\n\nImplement the plan. Address all reviewer feedback above, if any.");
    prompt
}

pub fn vote_task(input: &str, plan: Option<&str>) -> String {
    match plan {
        Some(plan) => format!("{input}\n\n## Plan\n{plan}"),
        None => input.to_string(),
    }
}

pub fn review(context: &str, plan: &str, code: &str, test_output: Option<&str>) -> String {
    let mut prompt = format!("{context}\n\n## Plan\n{plan}\n\n## Code under review\n```\n{code}\n```");
    if let Some(tests) = test_output {
        prompt.push_str(&format!("\n\n## Test results\n{tests}"));
    }
    prompt.push_str("\n\nDoes this code correctly and completely implement the task? Reply APPROVED or REJECTED.");
    prompt
}
