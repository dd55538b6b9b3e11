//! Configuration types and the fallback-chain loader.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Top-level configuration, loaded once at daemon startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub task_limits: TaskLimits,
    pub parallel_limits: ParallelLimits,
    pub timeouts: Timeouts,
    pub evidence_settings: EvidenceSettings,
    pub supervisor: SupervisorConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Fallback chain: explicit path → `.taskdaemon.yml` in the
    /// current directory → `~/.config/taskdaemon/taskdaemon.yml` →
    /// built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".taskdaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(error = %e, path = %local_config.display(), "Config::load: failed to load project-local config"),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskdaemon").join("taskdaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => warn!(error = %e, path = %user_config.display(), "Config::load: failed to load user config"),
                }
            }
        }

        info!("Config::load: no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("failed to parse config file")?;
        info!(path = %path.as_ref().display(), "Config::load_from_file: loaded");
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,
    #[serde(rename = "base-url")]
    pub base_url: String,
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 8192,
            timeout_ms: 300_000,
        }
    }
}

/// `files 1-20, tests 1-50, seconds 30-900` — bounds clamped on load,
/// never silently ignored past their documented range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLimits {
    #[serde(rename = "files-touched")]
    pub files_touched: u32,
    #[serde(rename = "tests-run")]
    pub tests_run: u32,
    pub seconds: u64,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self { files_touched: 20, tests_run: 50, seconds: 300 }
    }
}

impl TaskLimits {
    pub fn clamped(&self) -> Self {
        Self {
            files_touched: self.files_touched.clamp(1, 20),
            tests_run: self.tests_run.clamp(1, 50),
            seconds: self.seconds.clamp(30, 900),
        }
    }
}

/// `subagents 1-9, executors 1-4`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelLimits {
    pub subagents: u32,
    pub executors: u32,
}

impl Default for ParallelLimits {
    fn default() -> Self {
        Self { subagents: 9, executors: 4 }
    }
}

impl ParallelLimits {
    pub fn clamped(&self) -> Self {
        Self { subagents: self.subagents.clamp(1, 9), executors: self.executors.clamp(1, 4) }
    }
}

/// `deadlock 60s, operation 120s, idle 45m, hard 10m`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(rename = "deadlock-seconds")]
    pub deadlock_seconds: u64,
    #[serde(rename = "operation-seconds")]
    pub operation_seconds: u64,
    #[serde(rename = "idle-minutes")]
    pub idle_minutes: u64,
    #[serde(rename = "hard-minutes")]
    pub hard_minutes: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { deadlock_seconds: 60, operation_seconds: 120, idle_minutes: 45, hard_minutes: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceSettings {
    #[serde(rename = "retention-days")]
    pub retention_days: u32,
    #[serde(rename = "compression-enabled")]
    pub compression_enabled: bool,
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self { retention_days: 30, compression_enabled: false }
    }
}

/// Supervisor polling and watchdog intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    #[serde(rename = "scan-interval-seconds")]
    pub scan_interval_seconds: u64,
    #[serde(rename = "stale-threshold-seconds")]
    pub stale_threshold_seconds: u64,
    #[serde(rename = "idle-exit-minutes")]
    pub idle_exit_minutes: u64,
    pub profile: TimeoutProfile,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 300,
            stale_threshold_seconds: 30,
            idle_exit_minutes: 60,
            profile: TimeoutProfile::Standard,
        }
    }
}

/// `standard: idle 60s / hard 10m; long: 120s / 30m; extended: 300s / 60m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutProfile {
    Standard,
    Long,
    Extended,
}

impl TimeoutProfile {
    pub fn idle_timeout_secs(self) -> u64 {
        match self {
            TimeoutProfile::Standard => 60,
            TimeoutProfile::Long => 120,
            TimeoutProfile::Extended => 300,
        }
    }

    pub fn hard_timeout_secs(self) -> u64 {
        match self {
            TimeoutProfile::Standard => 600,
            TimeoutProfile::Long => 1_800,
            TimeoutProfile::Extended => 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
    #[serde(rename = "initial-backoff-ms")]
    pub initial_backoff_ms: u64,
    #[serde(rename = "backoff-cap-ms")]
    pub backoff_cap_ms: u64,
    #[serde(rename = "retry-threshold")]
    pub retry_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 1_000, backoff_cap_ms: 60_000, retry_threshold: 2 }
    }
}
