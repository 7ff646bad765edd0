//! Engine configuration, optionally loaded from a TOML file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::invariants::is_valid_state_name;

/// Engine configuration (TOML).
///
/// Missing fields take their defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Context tag given to nodes mounted without an explicit one.
    pub main_context: String,

    /// Downgrade failed parent/location lookups to diagnostics.
    pub permissive: bool,

    /// Return a handler's synchronous error from `dispatch` instead of
    /// folding it into the outcome.
    pub strict_handlers: bool,

    /// Make every selector yield `None` instead of failing.
    pub suppress_selector_errors: bool,

    /// Buffer size of the action stream; slow subscribers lag past it.
    pub action_stream_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            main_context: "main".to_string(),
            permissive: false,
            strict_handlers: false,
            suppress_selector_errors: false,
            action_stream_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_state_name(&self.main_context) {
            return Err(anyhow!(
                "main_context must be a non-empty word (got '{}')",
                self.main_context
            ));
        }
        if self.action_stream_capacity == 0 {
            return Err(anyhow!("action_stream_capacity must be > 0"));
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
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
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
        let path = temp.path().join("nested").join("engine.toml");
        let cfg = EngineConfig {
            permissive: true,
            action_stream_capacity: 8,
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Partial files keep defaults for everything they omit.
    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("engine.toml");
        fs::write(&path, "strict_handlers = true\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(cfg.strict_handlers);
        assert_eq!(cfg.main_context, "main");
        assert_eq!(cfg.action_stream_capacity, 256);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("engine.toml");
        fs::write(&path, "main_context = \"not valid\"\n").expect("write");
        let err = load_config(&path).expect_err("invalid context");
        assert!(format!("{err:#}").contains("main_context"));

        let zero = EngineConfig {
            action_stream_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(zero.validate().is_err());
    }
}
