//! Attempt prompt assembly and retry-context trimming.
//!
//! The prompt is built from the task, a task-file excerpt, the optional
//! plan file, and on retries a summary of the previous attempt's
//! verification failure. When the estimate exceeds the per-attempt
//! budget, up to three trim passes run: truncate command output, drop
//! command output, drop the retry context entirely.

use ih_domain::tokens::estimate_tokens;
use ih_domain::{Error, Result};
use ih_taskfile::Task;

/// Verification-failure context carried into a retry attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub failure_summary: String,
    /// Filtered error output of the failing command.
    pub command_output: String,
}

pub struct PromptParts<'a> {
    pub task: &'a Task,
    /// Raw markdown of the task file (or the relevant excerpt).
    pub task_file_excerpt: &'a str,
    pub plan_file: Option<&'a str>,
    pub retry: Option<RetryContext>,
}

/// Cap applied to command output on the first trim pass.
const OUTPUT_TRUNCATE_CHARS: usize = 1000;

/// Build the prompt, trimming until it fits `max_tokens`.
///
/// Fails with `prompt-budget-exceeded` when even the fully trimmed
/// prompt is over budget.
pub fn build_attempt_prompt(parts: &PromptParts<'_>, max_tokens: u32) -> Result<String> {
    // Pass 0: untrimmed. 1: truncated output. 2: no output. 3: no retry.
    for pass in 0..=3 {
        let retry = match (&parts.retry, pass) {
            (None, _) | (_, 3) => None,
            (Some(r), 0) => Some(render_retry(r, None)),
            (Some(r), 1) => Some(render_retry(r, Some(OUTPUT_TRUNCATE_CHARS))),
            (Some(r), 2) => Some(render_retry_without_output(r)),
            _ => None,
        };
        let prompt = render(parts, retry.as_deref());
        let estimated = estimate_tokens(&prompt);
        if estimated <= max_tokens {
            if pass > 0 {
                tracing::info!(pass, estimated, "retry context trimmed to fit prompt budget");
            }
            return Ok(prompt);
        }
        if parts.retry.is_none() {
            // Nothing left to trim.
            break;
        }
    }

    let estimated = estimate_tokens(&render(parts, None));
    Err(Error::Budget(format!(
        "prompt-budget-exceeded: estimated={estimated} max={max_tokens} — narrow the task or raise max_prompt_tokens_per_attempt"
    )))
}

fn render(parts: &PromptParts<'_>, retry: Option<&str>) -> String {
    let task = parts.task;
    let mut prompt = String::new();

    prompt.push_str("Work on exactly this task from the task list:\n\n");
    if !task.phase_path.is_empty() {
        prompt.push_str(&format!("Phase: {}\n", task.phase_path.join(" > ")));
    }
    prompt.push_str(&format!("Task: {}\n\n", task.text));

    prompt.push_str("Task file for context (do not work on other tasks):\n");
    prompt.push_str("```markdown\n");
    prompt.push_str(parts.task_file_excerpt);
    prompt.push_str("\n```\n");

    if let Some(plan) = parts.plan_file {
        prompt.push_str("\nCurrent plan notes:\n");
        prompt.push_str(plan);
        prompt.push('\n');
    }

    if let Some(retry) = retry {
        prompt.push_str(retry);
    }

    prompt.push_str(
        "\nWhen the task is complete, summarize what you changed. \
         If the task is too large, reply with a line `DECOMPOSE:` followed by `- ` subtask bullets. \
         If you cannot proceed, reply `BLOCKED: <reason>`. \
         If you tried and failed, reply `FAILED: <reason>`.\n",
    );
    prompt
}

fn render_retry(retry: &RetryContext, truncate_output: Option<usize>) -> String {
    let output = match truncate_output {
        Some(max) if retry.command_output.len() > max => {
            let boundary = (0..=max)
                .rev()
                .find(|&i| retry.command_output.is_char_boundary(i))
                .unwrap_or(0);
            format!("{}\n[output truncated]", &retry.command_output[..boundary])
        }
        _ => retry.command_output.clone(),
    };
    format!(
        "\nPrevious attempt {} failed verification: {}\n\
         Error output:\n```\n{}\n```\n\
         Fix the specific errors above. Do not rewrite from scratch — \
         keep the existing approach and make the smallest change that passes.\n",
        retry.attempt, retry.failure_summary, output
    )
}

fn render_retry_without_output(retry: &RetryContext) -> String {
    format!(
        "\nPrevious attempt {} failed verification: {}\n\
         Fix the failure. Do not rewrite from scratch — \
         keep the existing approach and make the smallest change that passes.\n",
        retry.attempt, retry.failure_summary
    )
}
