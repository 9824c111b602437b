//! Engine configuration stored at `<state_root>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::TrustLevel;
use crate::io::process::RunLimits;
use crate::io::state_store::write_atomic;

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Trust level for workflows started without an explicit override.
    pub trust_level: TrustLevel,

    /// Wall-clock limit for each shell command (actions and validations).
    pub command_timeout_secs: u64,

    /// Bytes of command stdout/stderr kept before truncation for display.
    pub output_limit_bytes: usize,

    /// How often running commands check for cancellation.
    pub poll_interval_ms: u64,

    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Agent command; receives the prompt on stdin and prints JSON lines.
    pub command: Vec<String>,

    pub timeout_secs: u64,

    /// Total attempts for transient failures (1 disables retry).
    pub max_attempts: u32,

    /// First backoff delay; doubles on each retry.
    pub base_delay_ms: u64,

    /// Driver messages kept per call; later ones are discarded.
    pub max_messages: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: vec!["agent".to_string(), "--json".to_string()],
            timeout_secs: 10 * 60,
            max_attempts: 3,
            base_delay_ms: 500,
            max_messages: 500,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trust_level: TrustLevel::Standard,
            command_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            poll_interval_ms: 100,
            driver: DriverConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.driver.command.is_empty() || self.driver.command[0].trim().is_empty() {
            return Err(anyhow!("driver.command must be a non-empty array"));
        }
        if self.driver.timeout_secs == 0 {
            return Err(anyhow!("driver.timeout_secs must be > 0"));
        }
        if self.driver.max_attempts == 0 {
            return Err(anyhow!("driver.max_attempts must be > 0"));
        }
        if self.driver.max_messages == 0 {
            return Err(anyhow!("driver.max_messages must be > 0"));
        }
        Ok(())
    }

    /// Limits applied to step actions and validation commands.
    pub fn command_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Duration::from_secs(self.command_timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Limits applied to one driver invocation.
    pub fn driver_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Duration::from_secs(self.driver.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
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
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.trust_level = TrustLevel::Autonomous;
        cfg.driver.max_attempts = 5;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "trust_level = \"paranoid\"\n\n[driver]\ncommand = [\"my-agent\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.trust_level, TrustLevel::Paranoid);
        assert_eq!(cfg.driver.command, vec!["my-agent".to_string()]);
        assert_eq!(cfg.driver.max_attempts, 3);
        assert_eq!(cfg.command_timeout_secs, 600);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "command_timeout_secs = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("command_timeout_secs must be > 0"));
    }
}
