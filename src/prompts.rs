//! Prompt rendering for phase invocations.
//!
//! Each phase may ship a markdown template named `<phase>.md` (lowercase)
//! in the prompts directory; a compiled-in generic template covers the
//! rest, so a bare checkout runs without any on-disk templates.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::status::STATUS_SENTINEL;

/// Per-iteration values substituted into the template.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub sub_task_number: u32,
    pub total_sub_tasks: u32,
    pub working_dir: PathBuf,
    pub retry_count: u32,
    pub max_retries: u32,
}

const DEFAULT_TEMPLATE: &str = "\
You are executing the {{phase}} phase of an autonomous engineering workflow.

## TASK
{{task}}

## CONTEXT
- Working directory: {{working_dir}}
- Sub-task: {{sub_task}} of {{total_sub_tasks}}
- Retries used for this phase: {{retry_count}} of {{max_retries}}

Work autonomously; do not ask questions. Write the outputs of this phase as
markdown files under the .cloudforge/ directory.
";

const STATUS_INSTRUCTIONS: &str = "\
When you are finished, end your reply with exactly this block:

CLOUDFORGE_STATUS:
  phase: {{phase}}
  result: DONE | NEEDS_RETRY | BLOCKED
  tasks_remaining: <number, only inside the implementation loop>
  summary: <one line describing what happened>
";

/// Produce the prompt text for one phase invocation.
pub fn render_prompt(
    prompts_dir: &Path,
    phase: &str,
    task: &str,
    ctx: &PromptContext,
) -> Result<String> {
    let override_path = prompts_dir.join(format!("{}.md", phase.to_lowercase()));
    let mut template = if override_path.is_file() {
        std::fs::read_to_string(&override_path)
            .with_context(|| format!("Failed to read prompt template {}", override_path.display()))?
    } else {
        DEFAULT_TEMPLATE.to_string()
    };

    // Templates that never mention the sentinel still get the reporting
    // contract appended, otherwise the scheduler can only ever synthesize.
    if !template.contains(STATUS_SENTINEL) {
        template.push('\n');
        template.push_str(STATUS_INSTRUCTIONS);
    }

    Ok(substitute(&template, phase, task, ctx))
}

fn substitute(template: &str, phase: &str, task: &str, ctx: &PromptContext) -> String {
    template
        .replace("{{phase}}", phase)
        .replace("{{task}}", task)
        .replace("{{sub_task}}", &ctx.sub_task_number.to_string())
        .replace("{{total_sub_tasks}}", &ctx.total_sub_tasks.to_string())
        .replace("{{working_dir}}", &ctx.working_dir.display().to_string())
        .replace("{{retry_count}}", &ctx.retry_count.to_string())
        .replace("{{max_retries}}", &ctx.max_retries.to_string())
}
