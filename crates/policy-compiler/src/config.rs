use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::compiler::DEFAULT_GEO_SOURCE;

/// Inputs the compiler would otherwise hard-code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompilerConfig {
    /// Optional DNS policy file adopted verbatim when valid.
    #[serde(default = "default_dns_override_path")]
    pub dns_override_path: PathBuf,
    /// Optional route override file (domain strategy, block list).
    #[serde(default = "default_route_override_path")]
    pub route_override_path: PathBuf,
    /// Honor the legacy port / tag-suffix block-list fields.
    #[serde(default)]
    pub legacy_block_matching: bool,
    /// Source selector for override block rules.
    #[serde(default = "default_geo_source")]
    pub geo_source: String,
    /// Name server used when no DNS override file is adopted.
    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dns_override_path: default_dns_override_path(),
            route_override_path: default_route_override_path(),
            legacy_block_matching: false,
            geo_source: default_geo_source(),
            fallback_dns: default_fallback_dns(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_dns_override_path() -> PathBuf {
    PathBuf::from("/etc/v2node/dns.json")
}

fn default_route_override_path() -> PathBuf {
    PathBuf::from("/etc/v2node/route.json")
}

fn default_geo_source() -> String {
    DEFAULT_GEO_SOURCE.to_string()
}

fn default_fallback_dns() -> String {
    "localhost".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

impl CompilerConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the defaults with a warning; a file that exists
    /// but cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "compiler configuration not found; using defaults"
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::load_from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn load_from_str(yaml: &str) -> Result<Self> {
        serde_yml::from_str(yaml).context("YAML deserialization failed")
    }
}
