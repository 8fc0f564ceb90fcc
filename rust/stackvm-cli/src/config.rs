//! Configuration file parsing for `stackvm.toml`.
//!
//! Searches the current directory then its ancestors. A missing file means
//! default resource limits.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use stackvm::config::ConfigError;
use stackvm::ResourceLimits;

/// File name looked up during discovery.
pub const CONFIG_FILE: &str = "stackvm.toml";

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct StackvmConfig {
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct RunSection {
    /// Dump machine state before every instruction.
    #[serde(default)]
    pub verbose: bool,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log: Option<String>,
}

impl StackvmConfig {
    /// Load the nearest `stackvm.toml`, or defaults when none is found.
    pub fn load() -> Result<Self, String> {
        match Self::discover() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        Self::from_str(&content).map_err(|e| format!("invalid toml in '{}': {}", path.display(), e))
    }

    /// Path of the nearest `stackvm.toml` at or above the working directory.
    pub fn discover() -> Option<PathBuf> {
        let dir = std::env::current_dir().ok()?;
        Self::discover_from(&dir)
    }

    pub fn discover_from(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Parse a TOML string directly.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Every problem with the configured limits.
    pub fn problems(&self) -> Vec<ConfigError> {
        self.limits.validate()
    }

    /// Generate a default `stackvm.toml` template.
    pub fn default_template() -> &'static str {
        r#"# StackVM configuration

[limits]
dynamic_expansion = true
heap_storage_backup = true

# Frame counts
frames = { soft = 512, hard = 1024 }

# Byte sizes; K, M and G suffixes are accepted
stack = { soft = "1K", hard = "8K" }
locals = { soft = "64K", hard = "128K" }
globals = { soft = "1M", hard = "512M" }

[run]
verbose = false
# log = "stackvm=debug"
"#
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
