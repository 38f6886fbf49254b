//! Engine configuration stored under `<data_dir>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry budget for a generation cycle (attempts, >= 1).
    pub max_iterations: u32,

    /// Version source directories retained per block during cleanup.
    pub keep_versions: usize,

    /// Refresh interval applied to new blocks when the caller gives none.
    pub default_refresh_interval_secs: u64,

    pub sandbox: SandboxConfig,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter argv prefix for candidate execution (e.g. `["python3"]`).
    pub command: Vec<String>,

    /// Hard wall-clock budget per execution in seconds.
    pub timeout_secs: u64,

    /// Truncate captured candidate stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command to invoke the generation backend; prompt on stdin, candidate
    /// JSON on stdout.
    pub command: Vec<String>,

    /// Maximum time to wait for a generation in seconds.
    pub timeout_secs: u64,

    /// Truncate generator output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string()],
            timeout_secs: 30,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 300,
            output_limit_bytes: 400_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            keep_versions: 5,
            default_refresh_interval_secs: 3600,
            sandbox: SandboxConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be >= 1"));
        }
        if self.keep_versions == 0 {
            return Err(anyhow!("keep_versions must be >= 1"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.command.is_empty() || self.sandbox.command[0].trim().is_empty() {
            return Err(anyhow!("sandbox.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
