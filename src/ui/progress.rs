use crate::orchestrator::state::WorkflowState;
use crate::ui::icons::{CHECK, CLOCK, CROSS, SPARKLE, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Terminal UI for the orchestrator, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar — position in the canonical workflow order
/// - Iteration bar — spinner with the current iteration and live status
///
/// All output is best-effort: the scheduler never blocks on the terminal,
/// and rich rendering falls back to `eprintln!` when unavailable.
pub struct OrchestratorUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    iteration_bar: ProgressBar,
    verbose: bool,
    current_iter: AtomicU32,
    iter_cap: AtomicU32,
}

impl OrchestratorUI {
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phase");

        let iteration_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let iteration_bar = multi.add(ProgressBar::new_spinner());
        iteration_bar.set_style(iteration_style);
        iteration_bar.set_prefix(" Iter");

        Self {
            multi,
            phase_bar,
            iteration_bar,
            verbose,
            current_iter: AtomicU32::new(0),
            iter_cap: AtomicU32::new(0),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` so
    /// messages are never silently lost.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Announce the phase about to execute and move the phase bar.
    pub fn phase_banner(&self, phase: &str, position: u64, sub_task: Option<(u32, u32)>) {
        self.phase_bar.set_position(position);
        let msg = match sub_task {
            Some((current, total)) if total > 0 => {
                format!("{} (sub-task {}/{})", style(phase).yellow(), current, total)
            }
            _ => format!("{}", style(phase).yellow()),
        };
        self.phase_bar.set_message(msg);
    }

    /// Start the iteration spinner.
    pub fn start_iteration(&self, iteration: u32, cap: u32) {
        self.current_iter.store(iteration, Ordering::SeqCst);
        self.iter_cap.store(cap, Ordering::SeqCst);
        self.iteration_bar.set_message(format!(
            "Running iteration {}/{} {}",
            style(iteration).cyan(),
            cap,
            style("(starting...)").dim()
        ));
        self.iteration_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    fn iteration_message(&self, detail: &str) {
        let iter = self.current_iter.load(Ordering::SeqCst);
        let cap = self.iter_cap.load(Ordering::SeqCst);
        self.iteration_bar.set_message(format!(
            "Running iteration {}/{} {}",
            style(iter).cyan(),
            cap,
            detail
        ));
    }

    /// Update the spinner with a short status string.
    pub fn log_step(&self, msg: &str) {
        self.iteration_message(&style(format!("({})", msg)).dim().to_string());
        if self.verbose {
            self.print_line(format!("    {} {}", style("→").dim(), style(msg).dim()));
        }
    }

    /// Refresh the spinner with wall-clock elapsed time.
    pub fn update_elapsed(&self, elapsed: Duration) {
        let secs = elapsed.as_secs();
        let time_str = if secs >= 60 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}s", secs)
        };
        self.iteration_message(&style(format!("({})", time_str)).dim().to_string());
    }

    /// Show a tool use event from the agent stream.
    pub fn show_tool_use(&self, emoji: &str, description: &str) {
        self.iteration_message(&format!("{} {}", emoji, style(description).yellow()));
        self.print_line(format!("    {} {}", emoji, style(description).yellow()));
    }

    /// Show a snippet of the agent's narration.
    pub fn show_text(&self, snippet: &str) {
        self.iteration_message(&style(snippet).dim().to_string());
        if self.verbose {
            self.print_line(format!("    {}", style(snippet).dim()));
        }
    }

    /// Per-second countdown display while waiting out a rate limit.
    pub fn countdown_tick(&self, remaining_secs: u64, reason: &str) {
        let mins = remaining_secs / 60;
        let secs = remaining_secs % 60;
        self.iteration_message(&format!(
            "{}{} {}",
            CLOCK,
            style(format!("{}: retrying in {}m {:02}s", reason, mins, secs)).yellow(),
            style("(ctrl-c to stop)").dim()
        ));
    }

    pub fn warn(&self, msg: &str) {
        self.print_line(format!("  {}{}", WARN, style(msg).yellow()));
    }

    pub fn error(&self, msg: &str) {
        self.print_line(format!("  {}{}", CROSS, style(msg).red().bold()));
    }

    /// Report the result recorded for the iteration that just finished.
    pub fn iteration_result(&self, phase: &str, result: &str, summary: &str) {
        self.iteration_bar.disable_steady_tick();
        let line = if summary.is_empty() {
            format!("  {} {}: {}", SPARKLE, style(phase).yellow(), result)
        } else {
            format!(
                "  {} {}: {} — {}",
                SPARKLE,
                style(phase).yellow(),
                result,
                style(summary).dim()
            )
        };
        self.print_line(line);
    }

    pub fn phase_complete(&self, phase: &str) {
        self.phase_bar.inc(1);
        self.print_line(format!(
            "{}{} completed",
            CHECK,
            style(phase).green().bold()
        ));
    }

    /// Final summary printed on clean termination.
    pub fn final_summary(&self, state: &WorkflowState, elapsed: Duration) {
        self.iteration_bar.finish_and_clear();
        self.phase_bar.finish_and_clear();
        self.print_line(format!(
            "{}Workflow finished: {} iteration(s), {} phase(s) completed in {}m {}s",
            CHECK,
            state.iteration,
            state.completed_phases.len(),
            elapsed.as_secs() / 60,
            elapsed.as_secs() % 60,
        ));
        self.print_line(format!(
            "  Tokens: {} in / {} out",
            state.total_tokens.input_tokens, state.total_tokens.output_tokens
        ));
    }

    /// Halt message printed when a circuit breaker or crash stops the run.
    pub fn halt(&self, reason: &str) {
        self.iteration_bar.finish_and_clear();
        self.phase_bar.finish_and_clear();
        self.print_line(format!("{}{}", CROSS, style(reason).red().bold()));
    }
}
