//! Configuration for imaginize.
//!
//! Settings are layered file → environment → CLI. The file is
//! `<state-dir>/imaginize.toml`:
//!
//! ```toml
//! [lock]
//! stale_threshold_ms = 300000
//! poll_interval_ms = 100
//! timeout_ms = 30000
//!
//! [retry]
//! max_retries = 5
//! base_delay_ms = 2000
//! max_delay_ms = 60000
//! rate_limit_delay_ms = 65000
//! jitter_ms = 500
//!
//! [manifest]
//! stuck_threshold_ms = 300000
//! max_chapter_attempts = 3
//!
//! [pipeline]
//! skip_failed = true
//! concurrency = 1
//!
//! [processor]
//! command = "./render-chapter.sh"
//! timeout_ms = 600000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::persist::LockOptions;
use crate::retry::RetryPolicy;

/// File name of the configuration file inside the state directory.
pub const CONFIG_FILE: &str = "imaginize.toml";

/// Per-process log files live here, inside the state directory.
pub fn log_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_stale_threshold_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            stale_threshold_ms: default_stale_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_rate_limit_delay_ms() -> u64 {
    65_000
}

fn default_jitter_ms() -> u64 {
    500
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSection {
    /// Claims older than this are considered abandoned
    #[serde(default = "default_stuck_threshold_ms")]
    pub stuck_threshold_ms: u64,
    /// Tries per chapter before workers stop re-claiming it
    #[serde(default = "default_max_chapter_attempts")]
    pub max_chapter_attempts: u32,
}

fn default_stuck_threshold_ms() -> u64 {
    300_000
}

fn default_max_chapter_attempts() -> u32 {
    3
}

impl Default for ManifestSection {
    fn default() -> Self {
        Self {
            stuck_threshold_ms: default_stuck_threshold_ms(),
            max_chapter_attempts: default_max_chapter_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Keep going when a chapter fails
    #[serde(default = "default_skip_failed")]
    pub skip_failed: bool,
    /// Worker processes for phases that support concurrency
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_skip_failed() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            skip_failed: default_skip_failed(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSection {
    /// Shell command run once per chapter
    #[serde(default)]
    pub command: Option<String>,
    /// Kill the command after this long; unset means no limit
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// The complete imaginize.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImaginizeToml {
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub manifest: ManifestSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub processor: ProcessorSection,
}

impl ImaginizeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse imaginize.toml")
    }

    /// Load `<state_dir>/imaginize.toml`, or defaults when it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `IMAGINIZE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let parse_u64 = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{key} must be a non-negative integer, got '{v}'"))
                })
                .transpose()
        };

        if let Some(ms) = parse_u64("IMAGINIZE_STALE_LOCK_MS")? {
            self.lock.stale_threshold_ms = ms;
        }
        if let Some(ms) = parse_u64("IMAGINIZE_LOCK_TIMEOUT_MS")? {
            self.lock.timeout_ms = ms;
        }
        if let Some(retries) = parse_u64("IMAGINIZE_MAX_RETRIES")? {
            self.retry.max_retries = u32::try_from(retries)
                .context("IMAGINIZE_MAX_RETRIES is out of range")?;
        }
        if let Some(cmd) = lookup("IMAGINIZE_EXEC").filter(|c| !c.trim().is_empty()) {
            self.processor.command = Some(cmd);
        }
        Ok(())
    }

    /// Return warnings for settings that are legal but likely mistakes.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.lock.stale_threshold_ms < self.lock.timeout_ms {
            warnings.push(format!(
                "lock.stale_threshold_ms ({}) is shorter than lock.timeout_ms ({}); a slow holder may lose its lock",
                self.lock.stale_threshold_ms, self.lock.timeout_ms
            ));
        }
        if self.lock.poll_interval_ms == 0 {
            warnings.push("lock.poll_interval_ms is 0; waiters will spin".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.manifest.max_chapter_attempts == 0 {
            warnings.push(
                "manifest.max_chapter_attempts is 0; failed chapters are never retried".to_string(),
            );
        }
        if self.pipeline.concurrency == 0 {
            warnings.push("pipeline.concurrency is 0; treating it as 1".to_string());
        }

        warnings
    }
}

/// CLI flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub concurrency: Option<usize>,
    pub exec: Option<String>,
    pub skip_failed: Option<bool>,
    pub stuck_threshold_ms: Option<u64>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub toml: ImaginizeToml,
}

impl Config {
    /// Load file and environment layers for `state_dir`, then apply CLI overrides.
    pub fn load(state_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        let mut toml = ImaginizeToml::load_or_default(state_dir)?;
        toml.apply_env()?;
        Ok(Self::from_toml(state_dir, toml, cli))
    }

    pub fn from_toml(state_dir: &Path, mut toml: ImaginizeToml, cli: &CliOverrides) -> Self {
        if let Some(n) = cli.concurrency {
            toml.pipeline.concurrency = n;
        }
        if let Some(cmd) = &cli.exec {
            toml.processor.command = Some(cmd.clone());
        }
        if let Some(skip) = cli.skip_failed {
            toml.pipeline.skip_failed = skip;
        }
        if let Some(ms) = cli.stuck_threshold_ms {
            toml.manifest.stuck_threshold_ms = ms;
        }
        Self {
            state_dir: state_dir.to_path_buf(),
            toml,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::default()
            .timeout(Duration::from_millis(self.toml.lock.timeout_ms))
            .stale_threshold(Duration::from_millis(self.toml.lock.stale_threshold_ms))
            .poll_interval(Duration::from_millis(self.toml.lock.poll_interval_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.toml.retry;
        RetryPolicy {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            rate_limit_delay: Duration::from_millis(retry.rate_limit_delay_ms),
            jitter: Duration::from_millis(retry.jitter_ms),
        }
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.toml.manifest.stuck_threshold_ms)
    }

    pub fn max_chapter_attempts(&self) -> u32 {
        self.toml.manifest.max_chapter_attempts
    }

    pub fn concurrency(&self) -> usize {
        self.toml.pipeline.concurrency.max(1)
    }

    pub fn skip_failed(&self) -> bool {
        self.toml.pipeline.skip_failed
    }

    pub fn processor_command(&self) -> Option<&str> {
        self.toml.processor.command.as_deref()
    }

    pub fn processor_timeout(&self) -> Option<Duration> {
        self.toml.processor.timeout_ms.map(Duration::from_millis)
    }

    /// Effective settings as stored in the state's `configSnapshot`.
    pub fn snapshot(&self) -> Map<String, Value> {
        match serde_json::to_value(&self.toml) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
