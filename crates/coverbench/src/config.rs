//! Harness configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::executor::{AgentCommand, ExecutionLimits};
use crate::result::{HarnessError, HarnessResult};
use crate::snippet::{Snippet, SnippetLayout};

/// Color output choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorChoice {
    /// Always use colors
    Always,
    /// Use colors when output is a terminal
    #[default]
    Auto,
    /// Never use colors
    Never,
}

impl ColorChoice {
    /// Should use colors based on output detection
    #[must_use]
    pub fn should_color(self) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => std::io::IsTerminal::is_terminal(&std::io::stdout()),
        }
    }
}

/// How to start a fork agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Harness binary acting as agent
    pub program: Option<PathBuf>,
    /// Arguments placed before the protocol arguments
    pub args: Vec<String>,
}

fn new_run_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Tool whose generated suites are evaluated
    pub tool: String,
    /// Tag separating this run's results from others
    pub run_tag: String,
    /// Snippet project directory
    pub project_dir: PathBuf,
    /// Results root directory
    pub results_root: PathBuf,
    /// Per-case timeout in milliseconds
    pub case_timeout_ms: u64,
    /// Reclamation passes after a timeout
    pub reclaim_attempts: u32,
    /// Pause between reclamation passes in milliseconds
    pub reclaim_pause_ms: u64,
    /// Fork agent for isolated snippets
    pub agent: AgentConfig,
    /// Color output choice for the source view
    pub color: ColorChoice,
    /// Default log filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            tool: "default".to_string(),
            run_tag: new_run_tag(),
            project_dir: PathBuf::from("."),
            results_root: PathBuf::from("results"),
            case_timeout_ms: 30_000,
            reclaim_attempts: 5,
            reclaim_pause_ms: 100,
            agent: AgentConfig::default(),
            color: ColorChoice::Auto,
            log_filter: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Create new default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate YAML configuration
    pub fn from_yaml(text: &str) -> HarnessResult<Self> {
        let config: Self = serde_yaml_ng::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize as YAML
    pub fn to_yaml(&self) -> HarnessResult<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    /// Set the tool name
    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Set the run tag
    #[must_use]
    pub fn with_run_tag(mut self, run_tag: impl Into<String>) -> Self {
        self.run_tag = run_tag.into();
        self
    }

    /// Set the project directory
    #[must_use]
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    /// Set the results root
    #[must_use]
    pub fn with_results_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_root = dir.into();
        self
    }

    /// Set the per-case timeout
    #[must_use]
    pub const fn with_case_timeout_ms(mut self, ms: u64) -> Self {
        self.case_timeout_ms = ms;
        self
    }

    /// Set the reclamation passes
    #[must_use]
    pub const fn with_reclaim_attempts(mut self, attempts: u32) -> Self {
        self.reclaim_attempts = attempts;
        self
    }

    /// Set the pause between reclamation passes
    #[must_use]
    pub const fn with_reclaim_pause_ms(mut self, ms: u64) -> Self {
        self.reclaim_pause_ms = ms;
        self
    }

    /// Set the fork agent
    #[must_use]
    pub fn with_agent(mut self, command: AgentCommand) -> Self {
        self.agent = AgentConfig {
            program: Some(command.program),
            args: command.prefix_args,
        };
        self
    }

    /// Set color choice
    #[must_use]
    pub const fn with_color(mut self, color: ColorChoice) -> Self {
        self.color = color;
        self
    }

    /// Check values that would make a run meaningless
    pub fn validate(&self) -> HarnessResult<()> {
        if self.tool.trim().is_empty() {
            return Err(HarnessError::config("tool must not be empty"));
        }
        if self.run_tag.trim().is_empty() || self.run_tag.contains(['/', '\\']) {
            return Err(HarnessError::config(format!("invalid run tag `{}`", self.run_tag)));
        }
        if self.case_timeout_ms == 0 {
            return Err(HarnessError::config("case_timeout_ms must be positive"));
        }
        if self.reclaim_attempts == 0 {
            return Err(HarnessError::config("reclaim_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Per-case timeout
    #[must_use]
    pub const fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }

    /// Per-case timeout for `snippet`, honoring its override
    #[must_use]
    pub fn timeout_for(&self, snippet: &Snippet) -> Duration {
        snippet
            .timeout_ms
            .map_or_else(|| self.case_timeout(), Duration::from_millis)
    }

    /// Bounded executor limits
    #[must_use]
    pub const fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            case_timeout: self.case_timeout(),
            reclaim_attempts: self.reclaim_attempts,
            reclaim_pause: Duration::from_millis(self.reclaim_pause_ms),
        }
    }

    /// Directory layout of this run
    #[must_use]
    pub fn layout(&self) -> SnippetLayout {
        SnippetLayout::new(&self.project_dir, &self.results_root, &self.tool, &self.run_tag)
    }

    /// Fork agent command, if configured
    #[must_use]
    pub fn agent_command(&self) -> Option<AgentCommand> {
        self.agent
            .program
            .as_ref()
            .map(|program| AgentCommand::new(program.clone()).with_args(self.agent.args.iter().cloned()))
    }

    /// Install a stderr `tracing` subscriber; `RUST_LOG` overrides `log_filter`
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_filter));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippet::RoutineRef;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.case_timeout(), Duration::from_secs(30));
        assert_eq!(config.limits(), ExecutionLimits::default());
        assert_eq!(config.run_tag.len(), 32);
        assert!(config.agent_command().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_tags_differ() {
        assert_ne!(HarnessConfig::default().run_tag, HarnessConfig::default().run_tag);
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = HarnessConfig::from_yaml(
            "tool: randoop\nrun_tag: r1\ncase_timeout_ms: 500\nagent:\n  program: /bin/harness\n  args: [agent]\n",
        )
        .unwrap();
        assert_eq!(config.tool, "randoop");
        assert_eq!(config.case_timeout(), Duration::from_millis(500));
        assert_eq!(config.reclaim_attempts, 5);
        let agent = config.agent_command().unwrap();
        assert_eq!(agent.program, PathBuf::from("/bin/harness"));
        assert_eq!(agent.prefix_args, vec!["agent"]);
        assert_eq!(config.layout().run_dir(), PathBuf::from("results/randoop/r1"));
    }

    #[test]
    fn test_yaml_rejects_invalid_values() {
        let err = HarnessConfig::from_yaml("case_timeout_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("case_timeout_ms"));
        assert!(HarnessConfig::from_yaml("run_tag: a/b\n").is_err());
        assert!(matches!(HarnessConfig::from_yaml("tool: [1"), Err(HarnessError::Yaml(_))));
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = HarnessConfig::new()
            .with_tool("evosuite")
            .with_run_tag("nightly")
            .with_reclaim_pause_ms(50)
            .with_color(ColorChoice::Never)
            .with_agent(AgentCommand::new("harness").with_arg("agent"));
        let back = HarnessConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_snippet_timeout_override() {
        let config = HarnessConfig::new().with_case_timeout_ms(1_000);
        let snippet = Snippet::new("s", "src/lib.rs", RoutineRef::function("f"));
        assert_eq!(config.timeout_for(&snippet), Duration::from_secs(1));
        assert_eq!(config.timeout_for(&snippet.with_timeout_ms(20)), Duration::from_millis(20));
    }
}
