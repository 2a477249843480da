use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::node::NodeDescriptor;

/// How the engine resolves domains before matching IP rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainStrategy {
    #[default]
    AsIs,
    IPIfNonMatch,
    IPOnDemand,
}

impl DomainStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStrategy::AsIs => "AsIs",
            DomainStrategy::IPIfNonMatch => "IPIfNonMatch",
            DomainStrategy::IPOnDemand => "IPOnDemand",
        }
    }
}

impl fmt::Display for DomainStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown domain strategy '{0}'")]
pub struct UnknownDomainStrategy(pub String);

impl FromStr for DomainStrategy {
    type Err = UnknownDomainStrategy;

    /// Case-insensitive; an empty string means the default.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "asis" => Ok(DomainStrategy::AsIs),
            "ipifnonmatch" => Ok(DomainStrategy::IPIfNonMatch),
            "ipondemand" => Ok(DomainStrategy::IPOnDemand),
            _ => Err(UnknownDomainStrategy(s.to_string())),
        }
    }
}

impl Serialize for DomainStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DomainStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Operator overrides read from the local route file.
///
/// ```json
/// {"domainStrategy": "IPIfNonMatch", "block_cn_nodes": [3, 7]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OverridePolicy {
    #[serde(default, rename = "domainStrategy")]
    pub domain_strategy: DomainStrategy,
    /// Node ids whose inbound must reject mainland-China sources.
    #[serde(default, rename = "block_cn_nodes")]
    pub block_list: BTreeSet<i64>,
    /// Legacy schema: match nodes whose tag ends with `_<port>`. Values
    /// outside 1..=65535 are kept but never match.
    #[serde(default, rename = "block_cn_ports")]
    pub legacy_ports: Vec<i64>,
    /// Legacy schema: match nodes whose tag ends with one of these suffixes.
    #[serde(default, rename = "block_cn_tags")]
    pub legacy_tag_suffixes: Vec<String>,
}

impl OverridePolicy {
    /// Whether `node` is subject to source blocking.
    ///
    /// Matching is by exact node id. The tag-suffix criteria of the legacy
    /// schema are only consulted when `legacy` is set.
    pub fn blocks(&self, node: &NodeDescriptor, legacy: bool) -> bool {
        if self.block_list.contains(&node.id) {
            return true;
        }
        if !legacy {
            return false;
        }
        self.legacy_ports
            .iter()
            .filter(|port| (1..=i64::from(u16::MAX)).contains(*port))
            .any(|port| node.tag.ends_with(&format!("_{port}")))
            || self
                .legacy_tag_suffixes
                .iter()
                .filter(|suffix| !suffix.is_empty())
                .any(|suffix| node.tag.ends_with(suffix.as_str()))
    }

    pub fn has_legacy_entries(&self) -> bool {
        !self.legacy_ports.is_empty() || !self.legacy_tag_suffixes.is_empty()
    }
}

/// Load the route override file, falling back to [`OverridePolicy::default`]
/// when it is absent or cannot be parsed. Never fails.
pub fn load_overrides(path: impl AsRef<Path>) -> OverridePolicy {
    let path = path.as_ref();
    match try_load_overrides(path) {
        Ok(Some(policy)) => {
            info!(
                path = %path.display(),
                domain_strategy = %policy.domain_strategy,
                blocked_nodes = policy.block_list.len(),
                "loaded route overrides"
            );
            policy
        }
        Ok(None) => {
            debug!(path = %path.display(), "no route override file; using defaults");
            OverridePolicy::default()
        }
        Err(e) => {
            let error = format!("{e:#}");
            warn!(path = %path.display(), error = %error, "ignoring route override file");
            OverridePolicy::default()
        }
    }
}

/// Read and parse the route override file.
///
/// Returns `Ok(None)` when the file does not exist.
pub fn try_load_overrides(path: impl AsRef<Path>) -> Result<Option<OverridePolicy>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read route override file: {}", path.display()))?;
    load_overrides_from_str(&contents)
        .with_context(|| format!("failed to parse route override file: {}", path.display()))
        .map(Some)
}

/// Parse route overrides from a JSON string.
pub fn load_overrides_from_str(json: &str) -> Result<OverridePolicy> {
    serde_json::from_str(json).context("JSON deserialization failed")
}
