use thiserror::Error;

use crate::dns::DnsPolicy;
use crate::outbound::OutboundRegistry;
use crate::rules::CompiledRouting;

/// The assembled configuration was rejected; nothing may be published.
#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("DNS server #{index} has an empty address")]
    EmptyServerAddress { index: usize },

    #[error("routing rule #{index} targets unknown outbound '{tag}'")]
    UnknownOutbound { index: usize, tag: String },

    #[error("routing rule #{index} has no match condition")]
    RuleWithoutCondition { index: usize },
}

/// Check the DNS section the way the engine does before accepting it.
pub fn validate_dns(dns: &DnsPolicy) -> Result<(), CompileError> {
    for (index, server) in dns.servers.iter().enumerate() {
        if server.address.trim().is_empty() {
            return Err(CompileError::EmptyServerAddress { index });
        }
    }
    Ok(())
}

/// Check that every rule is routable and selects some traffic.
pub fn validate_routing(routing: &CompiledRouting, registry: &OutboundRegistry) -> Result<(), CompileError> {
    for (index, rule) in routing.rules.iter().enumerate() {
        if !registry.contains(&rule.outbound_tag) {
            return Err(CompileError::UnknownOutbound {
                index,
                tag: rule.outbound_tag.clone(),
            });
        }
        if rule.matcher.is_none() && rule.network.is_none() {
            return Err(CompileError::RuleWithoutCondition { index });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{NameServer, QueryStrategy};
    use crate::overrides::DomainStrategy;
    use crate::rules::{RoutingRule, RuleMatcher};
    use serde_json::Map;

    fn dns(servers: &[&str]) -> DnsPolicy {
        DnsPolicy {
            servers: servers.iter().map(|s| NameServer::new(*s)).collect(),
            query_strategy: QueryStrategy::UseIPv4,
            extra: Map::new(),
        }
    }

    fn routing(rules: Vec<RoutingRule>) -> CompiledRouting {
        CompiledRouting {
            domain_strategy: DomainStrategy::AsIs,
            rules,
        }
    }

    #[test]
    fn accepts_default_dns() {
        assert!(validate_dns(&dns(&["localhost"])).is_ok());
    }

    #[test]
    fn rejects_blank_server() {
        let err = validate_dns(&dns(&["localhost", "  "])).unwrap_err();
        assert_eq!(err, CompileError::EmptyServerAddress { index: 1 });
    }

    #[test]
    fn accepts_seeded_routing() {
        let registry = OutboundRegistry::seeded();
        assert!(validate_routing(&routing(vec![RoutingRule::dns_hijack()]), &registry).is_ok());
    }

    #[test]
    fn rejects_unknown_outbound() {
        let registry = OutboundRegistry::seeded();
        let rule = RoutingRule::new("a", "nowhere", RuleMatcher::Domains(vec!["x.com".into()]));
        let err = validate_routing(&routing(vec![RoutingRule::dns_hijack(), rule]), &registry).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownOutbound {
                index: 1,
                tag: "nowhere".into()
            }
        );
        assert!(err.to_string().contains("unknown outbound"));
    }

    #[test]
    fn rejects_rule_without_condition() {
        let registry = OutboundRegistry::seeded();
        let mut rule = RoutingRule::default_out("a", "direct");
        rule.network = None;
        let err = validate_routing(&routing(vec![rule]), &registry).unwrap_err();
        assert_eq!(err, CompileError::RuleWithoutCondition { index: 0 });
    }
}
