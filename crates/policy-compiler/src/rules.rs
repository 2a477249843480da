use std::collections::VecDeque;

use serde::Serialize;

use crate::outbound::{BLOCK_TAG, DNS_OUT_TAG};
use crate::overrides::DomainStrategy;

/// The single traffic selector a rule carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RuleMatcher {
    #[serde(rename = "domain")]
    Domains(Vec<String>),
    #[serde(rename = "ip")]
    Ips(Vec<String>),
    /// Comma-joined ports / ranges.
    #[serde(rename = "port")]
    Ports(String),
    #[serde(rename = "protocol")]
    Protocols(Vec<String>),
    /// Source address selectors such as `geoip:cn`.
    #[serde(rename = "source")]
    Source(Vec<String>),
}

/// One entry of the engine's first-match routing table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "inboundTag", skip_serializing_if = "Vec::is_empty")]
    pub inbound_tags: Vec<String>,
    pub outbound_tag: String,
    #[serde(flatten)]
    pub matcher: Option<RuleMatcher>,
    /// Transport filter, e.g. `"udp"` or `"tcp,udp"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl RoutingRule {
    pub fn new(inbound_tag: &str, outbound_tag: impl Into<String>, matcher: RuleMatcher) -> Self {
        Self {
            inbound_tags: vec![inbound_tag.to_string()],
            outbound_tag: outbound_tag.into(),
            matcher: Some(matcher),
            network: None,
        }
    }

    /// Drop traffic entering `inbound_tag` from `source` (a geo selector).
    pub fn block_source(inbound_tag: &str, source: &str) -> Self {
        Self::new(
            inbound_tag,
            BLOCK_TAG,
            RuleMatcher::Source(vec![source.to_string()]),
        )
    }

    /// Send UDP port 53 from any inbound to the DNS egress.
    pub fn dns_hijack() -> Self {
        Self {
            inbound_tags: Vec::new(),
            outbound_tag: DNS_OUT_TAG.to_string(),
            matcher: Some(RuleMatcher::Ports("53".to_string())),
            network: Some("udp".to_string()),
        }
    }

    /// Catch-all for every TCP and UDP flow entering `inbound_tag`.
    pub fn default_out(inbound_tag: &str, outbound_tag: impl Into<String>) -> Self {
        Self {
            inbound_tags: vec![inbound_tag.to_string()],
            outbound_tag: outbound_tag.into(),
            matcher: None,
            network: Some("tcp,udp".to_string()),
        }
    }
}

/// Accumulates rules where both ends are significant.
///
/// [`insert_at_head`](Self::insert_at_head) places a rule before everything
/// already collected, so a run of head insertions ends up in reverse call
/// order. [`append`](Self::append) keeps call order.
#[derive(Debug, Default)]
pub struct RuleListBuilder {
    rules: VecDeque<RoutingRule>,
}

impl RuleListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_at_head(&mut self, rule: RoutingRule) {
        self.rules.push_front(rule);
    }

    pub fn append(&mut self, rule: RoutingRule) {
        self.rules.push_back(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn build(self, domain_strategy: DomainStrategy) -> CompiledRouting {
        CompiledRouting {
            domain_strategy,
            rules: self.rules.into(),
        }
    }
}

/// The routing section handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledRouting {
    pub domain_strategy: DomainStrategy,
    pub rules: Vec<RoutingRule>,
}
