use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::outbound::{OutboundDescriptor, RegistryError};

pub const ACTION_DNS: &str = "dns";
pub const ACTION_BLOCK: &str = "block";
pub const ACTION_BLOCK_IP: &str = "block_ip";
pub const ACTION_BLOCK_PORT: &str = "block_port";
pub const ACTION_PROTOCOL: &str = "protocol";
pub const ACTION_ROUTE: &str = "route";
pub const ACTION_ROUTE_IP: &str = "route_ip";
pub const ACTION_DEFAULT_OUT: &str = "default_out";

/// One proxy inbound as delivered by the panel, together with its routing
/// directives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Panel-side node identifier; block lists refer to nodes by this id.
    pub id: i64,
    /// Inbound tag of the listener serving this node. Unique per node.
    pub tag: String,
    /// Routing directives in panel order.
    #[serde(default)]
    pub routes: Vec<RouteDirective>,
}

impl NodeDescriptor {
    pub fn new(id: i64, tag: impl Into<String>) -> Self {
        Self {
            id,
            tag: tag.into(),
            routes: Vec::new(),
        }
    }

    pub fn with_route(mut self, route: RouteDirective) -> Self {
        self.routes.push(route);
        self
    }
}

/// A routing directive exactly as the panel sends it.
///
/// Nothing is validated here; see [`Directive::parse`] for the typed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDirective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub action: String,
    /// Domains, IPs, ports or protocol names depending on `action`.
    #[serde(default, rename = "match", deserialize_with = "deserialize_patterns")]
    pub patterns: Vec<String>,
    /// DNS server address or JSON-encoded outbound descriptor.
    #[serde(default)]
    pub action_value: Option<String>,
}

impl RouteDirective {
    pub fn new<I, S>(action: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            action: action.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            action_value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.action_value = Some(value.into());
        self
    }
}

/// The panel sends `match` either as an array or as a single string with
/// comma / newline separated entries.
fn deserialize_patterns<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Patterns {
        List(Vec<String>),
        Text(String),
    }

    Ok(match Option::<Patterns>::deserialize(deserializer)? {
        Some(Patterns::List(list)) => list,
        Some(Patterns::Text(text)) => text
            .split(|c: char| c == ',' || c == '\n')
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    })
}

/// Reasons a directive is dropped at parse time.
#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error("action '{action}' requires an action_value")]
    MissingValue { action: &'static str },

    #[error("action '{action}' requires at least one match pattern")]
    EmptyMatch { action: &'static str },

    #[error("invalid port or port range: '{0}'")]
    InvalidPort(String),

    #[error("invalid outbound descriptor: {0}")]
    Outbound(#[from] RegistryError),
}

/// A validated routing directive.
///
/// Each variant carries exactly the payload its action needs, so the rule
/// compiler never re-checks fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Extra name server used for `domains`.
    Dns { server: String, domains: Vec<String> },
    Block { domains: Vec<String> },
    BlockIp { ips: Vec<String> },
    /// Comma-joined port list, e.g. `"80,443,1000-2000"`.
    BlockPort { ports: String },
    Protocol { protocols: Vec<String> },
    Route { domains: Vec<String>, outbound: OutboundDescriptor },
    RouteIp { ips: Vec<String>, outbound: OutboundDescriptor },
    /// Send everything else from this inbound to `outbound`.
    DefaultOut { outbound: OutboundDescriptor },
}

impl Directive {
    /// Parse a raw panel directive.
    ///
    /// Returns `Ok(None)` for actions this compiler does not know about; those
    /// are ignored rather than treated as errors.
    pub fn parse(raw: &RouteDirective) -> Result<Option<Self>, DirectiveError> {
        let patterns = clean_patterns(&raw.patterns);

        let directive = match raw.action.as_str() {
            ACTION_DNS => Directive::Dns {
                server: required_value(raw, ACTION_DNS)?.to_string(),
                domains: patterns,
            },
            ACTION_BLOCK => Directive::Block {
                domains: non_empty(patterns, ACTION_BLOCK)?,
            },
            ACTION_BLOCK_IP => Directive::BlockIp {
                ips: non_empty(patterns, ACTION_BLOCK_IP)?,
            },
            ACTION_BLOCK_PORT => Directive::BlockPort {
                ports: join_ports(&non_empty(patterns, ACTION_BLOCK_PORT)?)?,
            },
            ACTION_PROTOCOL => Directive::Protocol {
                protocols: non_empty(patterns, ACTION_PROTOCOL)?,
            },
            ACTION_ROUTE => Directive::Route {
                domains: non_empty(patterns, ACTION_ROUTE)?,
                outbound: OutboundDescriptor::from_json(required_value(raw, ACTION_ROUTE)?)?,
            },
            ACTION_ROUTE_IP => Directive::RouteIp {
                ips: non_empty(patterns, ACTION_ROUTE_IP)?,
                outbound: OutboundDescriptor::from_json(required_value(raw, ACTION_ROUTE_IP)?)?,
            },
            ACTION_DEFAULT_OUT => Directive::DefaultOut {
                outbound: OutboundDescriptor::from_json(required_value(
                    raw,
                    ACTION_DEFAULT_OUT,
                )?)?,
            },
            _ => return Ok(None),
        };

        Ok(Some(directive))
    }

    /// The panel action name this directive was parsed from.
    pub fn action(&self) -> &'static str {
        match self {
            Directive::Dns { .. } => ACTION_DNS,
            Directive::Block { .. } => ACTION_BLOCK,
            Directive::BlockIp { .. } => ACTION_BLOCK_IP,
            Directive::BlockPort { .. } => ACTION_BLOCK_PORT,
            Directive::Protocol { .. } => ACTION_PROTOCOL,
            Directive::Route { .. } => ACTION_ROUTE,
            Directive::RouteIp { .. } => ACTION_ROUTE_IP,
            Directive::DefaultOut { .. } => ACTION_DEFAULT_OUT,
        }
    }
}

fn clean_patterns(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(patterns: Vec<String>, action: &'static str) -> Result<Vec<String>, DirectiveError> {
    if patterns.is_empty() {
        return Err(DirectiveError::EmptyMatch { action });
    }
    Ok(patterns)
}

fn required_value<'a>(raw: &'a RouteDirective, action: &'static str) -> Result<&'a str, DirectiveError> {
    match raw.action_value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(DirectiveError::MissingValue { action }),
    }
}

/// Validate every entry as a port or `low-high` range and join them with `,`.
/// Entries may themselves contain commas.
fn join_ports(entries: &[String]) -> Result<String, DirectiveError> {
    let mut ports = Vec::new();
    for entry in entries.iter().flat_map(|e| e.split(',')) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let valid = match entry.split_once('-') {
            Some((low, high)) => match (parse_port(low), parse_port(high)) {
                (Some(low), Some(high)) => low <= high,
                _ => false,
            },
            None => parse_port(entry).is_some(),
        };
        if !valid {
            return Err(DirectiveError::InvalidPort(entry.to_string()));
        }
        ports.push(entry);
    }
    if ports.is_empty() {
        return Err(DirectiveError::EmptyMatch {
            action: ACTION_BLOCK_PORT,
        });
    }
    Ok(ports.join(","))
}

fn parse_port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p != 0)
}
