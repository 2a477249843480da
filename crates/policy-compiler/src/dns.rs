use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use net_probe::CapabilityProbe;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::node::{Directive, NodeDescriptor, ACTION_DNS};

/// Address family preference for engine-side DNS queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    UseIP,
    UseIPv4,
    UseIPv6,
    UseIPv4v6,
}

impl QueryStrategy {
    /// The strategy used when the override file does not pin one.
    pub fn for_host(has_public_ipv6: bool) -> Self {
        if has_public_ipv6 {
            QueryStrategy::UseIPv4v6
        } else {
            QueryStrategy::UseIPv4
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStrategy::UseIP => "UseIP",
            QueryStrategy::UseIPv4 => "UseIPv4",
            QueryStrategy::UseIPv6 => "UseIPv6",
            QueryStrategy::UseIPv4v6 => "UseIPv4v6",
        }
    }
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown query strategy '{0}'")]
pub struct UnknownQueryStrategy(pub String);

impl FromStr for QueryStrategy {
    type Err = UnknownQueryStrategy;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "useip" => Ok(QueryStrategy::UseIP),
            "useipv4" => Ok(QueryStrategy::UseIPv4),
            "useipv6" => Ok(QueryStrategy::UseIPv6),
            "useipv4v6" => Ok(QueryStrategy::UseIPv4v6),
            _ => Err(UnknownQueryStrategy(s.to_string())),
        }
    }
}

impl Serialize for QueryStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Absent, `null` and `""` all mean "not set".
fn deserialize_query_strategy<'de, D>(deserializer: D) -> std::result::Result<Option<QueryStrategy>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => raw.parse().map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// One upstream resolver.
///
/// Accepts the engine's two spellings: a bare address string, or an object
/// with `address`, optional `domains`, and any further engine fields
/// (`port`, `expectIPs`, `skipFallback`, ...) which are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "NameServerRepr")]
pub struct NameServer {
    pub address: String,
    /// Restricts this server to the listed domains; empty means any.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NameServer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            domains: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NameServerRepr {
    Address(String),
    Object {
        address: String,
        #[serde(default)]
        domains: Vec<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl From<NameServerRepr> for NameServer {
    fn from(repr: NameServerRepr) -> Self {
        match repr {
            NameServerRepr::Address(address) => NameServer::new(address),
            NameServerRepr::Object {
                address,
                domains,
                extra,
            } => NameServer {
                address,
                domains,
                extra,
            },
        }
    }
}

/// The DNS override file as written by the operator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsDocument {
    pub servers: Vec<NameServer>,
    #[serde(default, deserialize_with = "deserialize_query_strategy")]
    pub query_strategy: Option<QueryStrategy>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The resolved DNS section handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsPolicy {
    pub servers: Vec<NameServer>,
    pub query_strategy: QueryStrategy,
    /// Fields of an adopted override document this compiler does not model
    /// (hosts, clientIp, disableCache, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Builds the DNS policy for one compilation cycle.
pub struct DnsPolicyResolver<'a> {
    probe: &'a dyn CapabilityProbe,
    fallback_server: &'a str,
}

impl<'a> DnsPolicyResolver<'a> {
    pub fn new(probe: &'a dyn CapabilityProbe, fallback_server: &'a str) -> Self {
        Self {
            probe,
            fallback_server,
        }
    }

    /// Adopt the override file if it is valid, otherwise synthesize the
    /// default single-server policy, then append every node's `dns`
    /// directives in node / directive order. Never fails.
    pub fn resolve(&self, override_path: &Path, nodes: &[NodeDescriptor]) -> DnsPolicy {
        let mut policy = match load_dns_document(override_path) {
            Ok(Some(doc)) => {
                info!(
                    path = %override_path.display(),
                    servers = doc.servers.len(),
                    "adopted DNS override file"
                );
                self.adopt(doc)
            }
            Ok(None) => {
                debug!(path = %override_path.display(), "no DNS override file");
                self.synthesize()
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(
                    path = %override_path.display(),
                    error = %error,
                    "ignoring DNS override file"
                );
                self.synthesize()
            }
        };

        for node in nodes {
            for raw in node.routes.iter().filter(|r| r.action == ACTION_DNS) {
                match Directive::parse(raw) {
                    Ok(Some(Directive::Dns { server, domains })) => {
                        debug!(node = %node.tag, server = %server, "adding panel name server");
                        policy.servers.push(NameServer::new(server).with_domains(domains));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(node = %node.tag, action = ACTION_DNS, error = %e, "dropping directive");
                    }
                }
            }
        }

        policy
    }

    fn adopt(&self, doc: DnsDocument) -> DnsPolicy {
        let query_strategy = doc
            .query_strategy
            .unwrap_or_else(|| self.default_strategy());
        DnsPolicy {
            servers: doc.servers,
            query_strategy,
            extra: doc.extra,
        }
    }

    fn synthesize(&self) -> DnsPolicy {
        DnsPolicy {
            servers: vec![NameServer::new(self.fallback_server)],
            query_strategy: self.default_strategy(),
            extra: Map::new(),
        }
    }

    fn default_strategy(&self) -> QueryStrategy {
        QueryStrategy::for_host(self.probe.has_public_ipv6())
    }
}

/// Read the DNS override file. `Ok(None)` when it does not exist.
pub fn load_dns_document(path: &Path) -> Result<Option<DnsDocument>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read DNS override file: {}", path.display()))?;
    let doc: DnsDocument = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse DNS override file: {}", path.display()))?;
    Ok(Some(doc))
}
