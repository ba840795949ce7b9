//! Pipeline configuration stored as `config.toml` under the data directory.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// Intended to be edited by humans; missing fields default to values that
/// work for a single-operator deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many jobs may be actively stepping at once. Reflects the
    /// generation backend's rate limits, not a scheduler requirement.
    pub max_concurrent_jobs: usize,

    /// Wall-clock budget for a single agent execution.
    pub agent_timeout_secs: u64,

    /// Interval between heartbeat events while an agent execution is in
    /// flight.
    pub heartbeat_interval_ms: u64,

    /// Safety bound on scheduling iterations per job.
    pub max_iterations: u32,

    /// Directory for persisted project snapshots.
    pub projects_dir: String,

    /// Directory for persisted job records.
    pub jobs_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            agent_timeout_secs: 10 * 60,
            heartbeat_interval_ms: 15_000,
            max_iterations: 200,
            projects_dir: "data/projects".to_string(),
            jobs_dir: "data/jobs".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow!("max_concurrent_jobs must be >= 1"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(anyhow!("heartbeat_interval_ms must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.projects_dir.trim().is_empty() || self.jobs_dir.trim().is_empty() {
            return Err(anyhow!("storage directories must be non-empty"));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
