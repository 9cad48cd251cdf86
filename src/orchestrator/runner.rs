//! Agent process execution: spawn the CLI, stream its output, return a
//! summary once both output streams and the exit status are known.

use crate::config::Config;
use crate::orchestrator::state::TokenTotals;
use crate::stream::{
    ContentBlock, ParsedLine, StreamEvent, describe_tool_use, parse_line, tool_emoji,
    truncate_snippet,
};
use crate::ui::OrchestratorUI;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

pub struct AgentRunner {
    config: Config,
}

/// Summary of one finished agent invocation. The runner never fails: spawn
/// errors are folded into a result with `success == false`.
#[derive(Debug, Default)]
pub struct RunnerResult {
    pub success: bool,
    pub exit_code: i32,
    /// Concatenation of all text the agent produced on stdout, in arrival
    /// order. Status parsing and rate-limit scanning read this.
    pub output: String,
    /// Final answer text from the `result` event, if any.
    pub final_result: Option<String>,
    pub session_id: Option<String>,
    pub tokens: TokenTotals,
    pub stderr: String,
}

impl RunnerResult {
    fn spawn_failure(message: String) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stderr: message,
            ..Self::default()
        }
    }
}

impl AgentRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn build_command(&self, prompt: &str, session_id: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.config.cli_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions")
            .arg("--max-turns")
            .arg(self.config.max_turns.to_string());
        if let Some(model) = &self.config.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(sid) = session_id {
            cmd.arg("--resume").arg(sid);
        }
        cmd.arg(prompt);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.config.working_dir)
            .kill_on_drop(true);
        cmd
    }

    /// Run one agent invocation to completion.
    ///
    /// The child's pid is published through `active_pid` for the lifetime of
    /// the process so the shutdown path can forward SIGTERM; it is zeroed
    /// before returning. Stdout and stderr are drained concurrently and the
    /// result is assembled only after both hit EOF and the exit status is
    /// known.
    pub async fn run(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        ui: Option<Arc<OrchestratorUI>>,
        active_pid: &Arc<AtomicU32>,
    ) -> RunnerResult {
        let mut cmd = self.build_command(prompt, session_id);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return RunnerResult::spawn_failure(e.to_string()),
        };
        active_pid.store(child.id().unwrap_or(0), Ordering::SeqCst);

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            active_pid.store(0, Ordering::SeqCst);
            return RunnerResult::spawn_failure("child stdio handles unavailable".to_string());
        };

        // Stderr drains on its own task so a noisy stderr can never stall
        // the stdout line reader.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let start = Instant::now();
        let ui_clone = ui.clone();
        let elapsed_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Some(ref ui) = ui_clone {
                    ui.update_elapsed(start.elapsed());
                }
            }
        });

        let mut result = RunnerResult::default();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if line.is_empty() {
                continue;
            }
            match parse_line(&line) {
                ParsedLine::Event(event) => {
                    self.apply_event(event, &mut result, ui.as_deref());
                }
                ParsedLine::Ignored => {}
                ParsedLine::Raw => {
                    result.output.push_str(&line);
                    result.output.push('\n');
                }
            }
        }

        result.stderr = stderr_task.await.unwrap_or_default();
        let exit_code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        elapsed_task.abort();
        active_pid.store(0, Ordering::SeqCst);

        if let Some(text) = &result.final_result
            && !text.is_empty()
        {
            if !result.output.is_empty() && !result.output.ends_with('\n') {
                result.output.push('\n');
            }
            result.output.push_str(text);
            result.output.push('\n');
        }

        result.exit_code = exit_code;
        result.success = exit_code == 0;
        result
    }

    fn apply_event(
        &self,
        event: StreamEvent,
        result: &mut RunnerResult,
        ui: Option<&OrchestratorUI>,
    ) {
        match event {
            StreamEvent::Assistant { message } => {
                for block in message.blocks() {
                    match block {
                        ContentBlock::ToolUse { name, input } => {
                            let desc = describe_tool_use(&name, &input);
                            if let Some(ui) = ui {
                                ui.show_tool_use(tool_emoji(&name), &desc);
                            }
                        }
                        ContentBlock::Text { text } => {
                            let snippet = truncate_snippet(&text, 60);
                            if !snippet.is_empty()
                                && let Some(ui) = ui
                            {
                                ui.show_text(&snippet);
                            }
                            result.output.push_str(&text);
                            result.output.push('\n');
                        }
                    }
                }
            }
            StreamEvent::ContentBlockDelta { delta } => {
                result.output.push_str(&delta.text);
            }
            StreamEvent::Result {
                session_id,
                result: final_text,
                usage,
                total_usage,
            } => {
                if let Some(sid) = session_id {
                    result.session_id = Some(sid);
                }
                if final_text.is_some() {
                    result.final_result = final_text;
                }
                if let Some(u) = total_usage.or(usage) {
                    result.tokens.input_tokens += u.input_tokens;
                    result.tokens.output_tokens += u.output_tokens;
                }
            }
            StreamEvent::Message { usage } => {
                if let Some(u) = usage {
                    result.tokens.input_tokens += u.input_tokens;
                    result.tokens.output_tokens += u.output_tokens;
                }
            }
        }
    }
}
