//! Runner configuration stored in `infratest.toml` next to the root module.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// File name of the optional runner configuration.
pub const CONFIG_FILE: &str = "infratest.toml";

/// Runner configuration (TOML).
///
/// Every field has a default, so a missing file or a partial file is valid.
/// Command-line flags override these values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory scanned for test files and auto variable files, relative to
    /// the working directory.
    pub test_directory: PathBuf,

    /// Environment variables with this prefix provide global variable values.
    pub var_env_prefix: String,

    /// How long a hard cancel waits for the in-flight engine call to finish.
    pub cancel_grace_secs: u64,

    /// Where errored-state recovery artifacts are written.
    pub errored_state_dir: PathBuf,

    /// Record plans and states for every run and render them.
    pub verbose: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            test_directory: PathBuf::from("tests"),
            var_env_prefix: "INFRATEST_VAR_".to_string(),
            cancel_grace_secs: 5,
            errored_state_dir: PathBuf::from("."),
            verbose: false,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cancel_grace_secs == 0 {
            return Err(anyhow!("cancel_grace_secs must be > 0"));
        }
        if self.var_env_prefix.trim().is_empty() {
            return Err(anyhow!("var_env_prefix must be a non-empty string"));
        }
        if self.test_directory.as_os_str().is_empty() {
            return Err(anyhow!("test_directory must be a non-empty path"));
        }
        if self.test_directory.is_absolute() {
            return Err(anyhow!(
                "test_directory must be relative to the working directory, got {}",
                self.test_directory.display()
            ));
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
