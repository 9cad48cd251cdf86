use anyhow::{Context, Result};
use std::path::PathBuf;

/// Name of the hidden artifact directory inside the working directory.
pub const ARTIFACT_DIR_NAME: &str = ".cloudforge";

/// State file name inside the artifact directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Runtime configuration for a cloudforge run.
///
/// Assembled once from CLI arguments and handed to the scheduler. All paths
/// derive from `working_dir`, which is canonicalized up front so the child
/// agent and the artifact directory agree on locations.
#[derive(Debug, Clone)]
pub struct Config {
    pub working_dir: PathBuf,
    pub cli_path: String,
    pub model: Option<String>,
    pub max_iterations: u32,
    pub max_phase_retries: u32,
    pub max_turns: u32,
    pub rate_limit_wait_secs: u64,
    pub verbose: bool,
}

impl Config {
    pub fn new(
        working_dir: Option<PathBuf>,
        cli_path: Option<String>,
        model: Option<String>,
        max_iterations: u32,
        max_phase_retries: u32,
        max_turns: u32,
        rate_limit_wait_secs: u64,
        verbose: bool,
    ) -> Result<Self> {
        let working_dir = match working_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to get current directory")?,
        };
        let working_dir = working_dir
            .canonicalize()
            .context("Failed to resolve working directory")?;

        let cli_path = cli_path
            .or_else(|| std::env::var("CLOUDFORGE_AGENT_CMD").ok())
            .unwrap_or_else(|| "claude".to_string());

        Ok(Self {
            working_dir,
            cli_path,
            model,
            max_iterations,
            max_phase_retries,
            max_turns,
            rate_limit_wait_secs,
            verbose,
        })
    }

    /// The `.cloudforge` directory holding state, plan, and phase artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.working_dir.join(ARTIFACT_DIR_NAME)
    }

    /// Directory searched for prompt template overrides and `workflow.dot`.
    pub fn prompts_dir(&self) -> PathBuf {
        self.artifact_dir().join("prompts")
    }

    pub fn ensure_artifact_dir(&self) -> Result<()> {
        std::fs::create_dir_all(self.artifact_dir())
            .context("Failed to create artifact directory")?;
        Ok(())
    }
}
