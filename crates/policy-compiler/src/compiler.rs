use tracing::{debug, info, warn};

use crate::node::{Directive, NodeDescriptor, ACTION_DNS};
use crate::outbound::{OutboundDescriptor, OutboundRegistry, BLOCK_TAG};
use crate::overrides::OverridePolicy;
use crate::rules::{CompiledRouting, RoutingRule, RuleListBuilder, RuleMatcher};

/// Source selector used for override block rules unless configured otherwise.
pub const DEFAULT_GEO_SOURCE: &str = "geoip:cn";

/// Turns panel nodes and operator overrides into the engine routing table.
///
/// The output order is fixed:
///
/// 1. override block rules, one per blocked node, in *reverse* node order
///    (each is inserted at the head of the list);
/// 2. the UDP/53 rule sending DNS to `dns_out`;
/// 3. panel directive rules in node order, then directive order.
#[derive(Debug, Clone)]
pub struct RuleCompiler {
    geo_source: String,
    legacy_block_matching: bool,
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self {
            geo_source: DEFAULT_GEO_SOURCE.to_string(),
            legacy_block_matching: false,
        }
    }
}

impl RuleCompiler {
    pub fn new(geo_source: impl Into<String>) -> Self {
        Self {
            geo_source: geo_source.into(),
            ..Self::default()
        }
    }

    /// Also honor the legacy tag-suffix block-list schema.
    pub fn with_legacy_block_matching(mut self, enabled: bool) -> Self {
        self.legacy_block_matching = enabled;
        self
    }

    /// Compile the routing table, registering directive outbounds in
    /// `registry` as they are first referenced.
    ///
    /// Malformed directives are logged and skipped; this never fails.
    pub fn compile(
        &self,
        nodes: &[NodeDescriptor],
        overrides: &OverridePolicy,
        registry: &mut OutboundRegistry,
    ) -> CompiledRouting {
        let mut builder = RuleListBuilder::new();

        self.inject_override_blocks(nodes, overrides, &mut builder);
        builder.append(RoutingRule::dns_hijack());
        for node in nodes {
            self.compile_node(node, registry, &mut builder);
        }

        debug!(rules = builder.len(), "routing table compiled");
        builder.build(overrides.domain_strategy)
    }

    // -- Phase A ----------------------------------------------------------

    fn inject_override_blocks(
        &self,
        nodes: &[NodeDescriptor],
        overrides: &OverridePolicy,
        builder: &mut RuleListBuilder,
    ) {
        if !self.legacy_block_matching && overrides.has_legacy_entries() {
            warn!("route overrides contain legacy block_cn_ports/block_cn_tags entries; ignored");
        }

        for node in nodes {
            if overrides.blocks(node, self.legacy_block_matching) {
                info!(node = %node.tag, id = node.id, source = %self.geo_source, "injecting source block rule");
                builder.insert_at_head(RoutingRule::block_source(&node.tag, &self.geo_source));
            }
        }
    }

    // -- Phase C ----------------------------------------------------------

    fn compile_node(
        &self,
        node: &NodeDescriptor,
        registry: &mut OutboundRegistry,
        builder: &mut RuleListBuilder,
    ) {
        for raw in &node.routes {
            // Name servers are collected by the DNS resolver.
            if raw.action == ACTION_DNS {
                continue;
            }

            let directive = match Directive::parse(raw) {
                Ok(Some(d)) => d,
                Ok(None) => {
                    debug!(node = %node.tag, action = %raw.action, "ignoring unknown action");
                    continue;
                }
                Err(e) => {
                    warn!(node = %node.tag, action = %raw.action, error = %e, "dropping directive");
                    continue;
                }
            };

            if let Some(rule) = compile_directive(&node.tag, directive, registry) {
                builder.append(rule);
            }
        }
    }
}

/// Map one directive onto a rule. `None` when the directive produces no rule
/// or its outbound could not be registered.
fn compile_directive(
    tag: &str,
    directive: Directive,
    registry: &mut OutboundRegistry,
) -> Option<RoutingRule> {
    match directive {
        Directive::Dns { .. } => None,
        Directive::Block { domains } => Some(RoutingRule::new(tag, BLOCK_TAG, RuleMatcher::Domains(domains))),
        Directive::BlockIp { ips } => Some(RoutingRule::new(tag, BLOCK_TAG, RuleMatcher::Ips(ips))),
        Directive::BlockPort { ports } => Some(RoutingRule::new(tag, BLOCK_TAG, RuleMatcher::Ports(ports))),
        Directive::Protocol { protocols } => {
            Some(RoutingRule::new(tag, BLOCK_TAG, RuleMatcher::Protocols(protocols)))
        }
        Directive::Route { domains, outbound } => {
            let out = register(tag, &outbound, registry)?;
            Some(RoutingRule::new(tag, out, RuleMatcher::Domains(domains)))
        }
        Directive::RouteIp { ips, outbound } => {
            let out = register(tag, &outbound, registry)?;
            Some(RoutingRule::new(tag, out, RuleMatcher::Ips(ips)))
        }
        Directive::DefaultOut { outbound } => {
            let out = register(tag, &outbound, registry)?;
            Some(RoutingRule::default_out(tag, out))
        }
    }
}

fn register(
    node_tag: &str,
    outbound: &OutboundDescriptor,
    registry: &mut OutboundRegistry,
) -> Option<String> {
    match registry.register(outbound) {
        Ok(tag) => Some(tag),
        Err(e) => {
            warn!(node = %node_tag, outbound = %outbound.tag, error = %e, "dropping rule for unbuildable outbound");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RouteDirective;
    use crate::outbound::{DIRECT_TAG, DNS_OUT_TAG};
    use crate::overrides::{load_overrides_from_str, DomainStrategy};
    use serde_json::json;

    fn outbound(tag: &str) -> String {
        json!({
            "tag": tag,
            "protocol": "vmess",
            "settings": {"vnext": [{"address": "relay.example", "port": 443}]}
        })
        .to_string()
    }

    fn compile(nodes: &[NodeDescriptor], overrides: &OverridePolicy) -> (CompiledRouting, OutboundRegistry) {
        let mut registry = OutboundRegistry::seeded();
        let routing = RuleCompiler::default().compile(nodes, overrides, &mut registry);
        (routing, registry)
    }

    fn block_list(ids: &str) -> OverridePolicy {
        load_overrides_from_str(&format!(r#"{{"block_cn_nodes": {ids}}}"#)).unwrap()
    }

    // -- Ordering --

    #[test]
    fn dns_rule_first_without_overrides() {
        let nodes = vec![NodeDescriptor::new(1, "a").with_route(RouteDirective::new("block", ["ads.com"]))];
        let (routing, _) = compile(&nodes, &OverridePolicy::default());

        assert_eq!(routing.rules[0], RoutingRule::dns_hijack());
        assert_eq!(routing.rules[0].outbound_tag, DNS_OUT_TAG);
        assert_eq!(
            routing.rules.iter().filter(|r| r.outbound_tag == DNS_OUT_TAG).count(),
            1
        );
        assert_eq!(routing.domain_strategy, DomainStrategy::AsIs);
    }

    #[test]
    fn empty_input_yields_only_dns_rule() {
        let (routing, registry) = compile(&[], &OverridePolicy::default());
        assert_eq!(routing.rules, vec![RoutingRule::dns_hijack()]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn blocked_node_rule_comes_first() {
        let nodes = vec![NodeDescriptor::new(5, "t5")];
        let (routing, _) = compile(&nodes, &block_list("[5]"));

        assert_eq!(routing.rules.len(), 2);
        let first = &routing.rules[0];
        assert_eq!(first.inbound_tags, vec!["t5"]);
        assert_eq!(first.outbound_tag, BLOCK_TAG);
        assert_eq!(first.matcher, Some(RuleMatcher::Source(vec!["geoip:cn".into()])));
        assert_eq!(routing.rules[1], RoutingRule::dns_hijack());
    }

    #[test]
    fn block_rules_in_reverse_match_order() {
        let nodes = vec![
            NodeDescriptor::new(3, "t3"),
            NodeDescriptor::new(4, "t4"),
            NodeDescriptor::new(7, "t7"),
        ];
        let (routing, _) = compile(&nodes, &block_list("[3, 7]"));

        let tags: Vec<&str> = routing.rules[..2]
            .iter()
            .map(|r| r.inbound_tags[0].as_str())
            .collect();
        assert_eq!(tags, vec!["t7", "t3"]);
        assert_eq!(routing.rules[2], RoutingRule::dns_hijack());
        assert_eq!(routing.rules.len(), 3);
    }

    #[test]
    fn phases_are_ordered() {
        let nodes = vec![
            NodeDescriptor::new(1, "a").with_route(RouteDirective::new("block", ["a.com"])),
            NodeDescriptor::new(2, "b")
                .with_route(RouteDirective::new("block_ip", ["1.2.3.4"]))
                .with_route(RouteDirective::new("protocol", ["bittorrent"])),
        ];
        let (routing, _) = compile(&nodes, &block_list("[2]"));

        assert_eq!(routing.rules.len(), 5);
        assert_eq!(routing.rules[0].matcher, Some(RuleMatcher::Source(vec!["geoip:cn".into()])));
        assert_eq!(routing.rules[1], RoutingRule::dns_hijack());
        assert_eq!(routing.rules[2].matcher, Some(RuleMatcher::Domains(vec!["a.com".into()])));
        assert_eq!(routing.rules[3].matcher, Some(RuleMatcher::Ips(vec!["1.2.3.4".into()])));
        assert_eq!(routing.rules[4].matcher, Some(RuleMatcher::Protocols(vec!["bittorrent".into()])));
        assert!(routing.rules[2..].iter().all(|r| r.outbound_tag == BLOCK_TAG));
    }

    #[test]
    fn legacy_port_suffix_ignored_by_default() {
        let overrides = load_overrides_from_str(r#"{"block_cn_ports": [443]}"#).unwrap();
        let nodes = vec![NodeDescriptor::new(1, "vless_443")];

        let (routing, _) = compile(&nodes, &overrides);
        assert_eq!(routing.rules, vec![RoutingRule::dns_hijack()]);

        let mut registry = OutboundRegistry::seeded();
        let routing = RuleCompiler::default()
            .with_legacy_block_matching(true)
            .compile(&nodes, &overrides, &mut registry);
        assert_eq!(routing.rules.len(), 2);
        assert_eq!(routing.rules[0].inbound_tags, vec!["vless_443"]);
    }

    #[test]
    fn custom_geo_source() {
        let mut registry = OutboundRegistry::seeded();
        let routing = RuleCompiler::new("geoip:ir").compile(
            &[NodeDescriptor::new(9, "t9")],
            &block_list("[9]"),
            &mut registry,
        );
        assert_eq!(routing.rules[0].matcher, Some(RuleMatcher::Source(vec!["geoip:ir".into()])));
    }

    // -- Directive dispatch --

    #[test]
    fn block_port_joined() {
        let nodes = vec![NodeDescriptor::new(1, "a").with_route(RouteDirective::new("block_port", ["80", "443"]))];
        let (routing, _) = compile(&nodes, &OverridePolicy::default());
        assert_eq!(routing.rules[1].matcher, Some(RuleMatcher::Ports("80,443".into())));
        assert_eq!(routing.rules[1].outbound_tag, BLOCK_TAG);
    }

    #[test]
    fn route_registers_outbound_once() {
        let nodes = vec![
            NodeDescriptor::new(1, "a")
                .with_route(RouteDirective::new("route", ["example.com"]).with_value(outbound("x"))),
            NodeDescriptor::new(2, "b")
                .with_route(RouteDirective::new("route_ip", ["geoip:us"]).with_value(outbound("x"))),
        ];
        let (routing, registry) = compile(&nodes, &OverridePolicy::default());

        assert_eq!(
            routing.rules[1],
            RoutingRule::new("a", "x", RuleMatcher::Domains(vec!["example.com".into()]))
        );
        assert_eq!(
            routing.rules[2],
            RoutingRule::new("b", "x", RuleMatcher::Ips(vec!["geoip:us".into()]))
        );
        assert_eq!(registry.tags().filter(|t| *t == "x").count(), 1);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn default_out_uses_network_filter() {
        let nodes = vec![NodeDescriptor::new(1, "a")
            .with_route(RouteDirective::new("default_out", Vec::<String>::new()).with_value(outbound("warp")))];
        let (routing, registry) = compile(&nodes, &OverridePolicy::default());

        assert_eq!(routing.rules[1], RoutingRule::default_out("a", "warp"));
        assert!(registry.contains("warp"));
    }

    #[test]
    fn route_to_builtin_reuses_it() {
        let direct = json!({"tag": DIRECT_TAG, "protocol": "freedom"}).to_string();
        let nodes = vec![NodeDescriptor::new(1, "a")
            .with_route(RouteDirective::new("route", ["cn.example"]).with_value(direct))];
        let (routing, registry) = compile(&nodes, &OverridePolicy::default());

        assert_eq!(routing.rules[1].outbound_tag, DIRECT_TAG);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn tag_only_route_to_builtin_keeps_rule() {
        let nodes = vec![NodeDescriptor::new(1, "a")
            .with_route(RouteDirective::new("route", ["cn.example"]).with_value(r#"{"tag":"direct"}"#))
            .with_route(RouteDirective::new("default_out", Vec::<String>::new()).with_value(r#"{"tag":"block"}"#))];
        let (routing, registry) = compile(&nodes, &OverridePolicy::default());

        assert_eq!(
            routing.rules,
            vec![
                RoutingRule::dns_hijack(),
                RoutingRule::new("a", DIRECT_TAG, RuleMatcher::Domains(vec!["cn.example".into()])),
                RoutingRule::default_out("a", BLOCK_TAG),
            ]
        );
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn malformed_route_value_is_skipped() {
        let nodes = vec![NodeDescriptor::new(1, "a")
            .with_route(RouteDirective::new("route", ["example.com"]).with_value("{\"tag\": \"x\""))
            .with_route(RouteDirective::new("route", ["example.com"]))
            .with_route(RouteDirective::new("block", ["ads.com"]))];
        let (routing, registry) = compile(&nodes, &OverridePolicy::default());

        assert_eq!(routing.rules.len(), 2);
        assert_eq!(routing.rules[1].matcher, Some(RuleMatcher::Domains(vec!["ads.com".into()])));
        assert_eq!(registry.len(), 3);
        assert!(!registry.contains("x"));
    }

    #[test]
    fn unsupported_protocol_drops_rule() {
        let bad = json!({"tag": "odd", "protocol": "smoke-signal"}).to_string();
        let nodes = vec![NodeDescriptor::new(1, "a")
            .with_route(RouteDirective::new("route_ip", ["10.0.0.0/8"]).with_value(bad))];
        let (routing, registry) = compile(&nodes, &OverridePolicy::default());

        assert_eq!(routing.rules, vec![RoutingRule::dns_hijack()]);
        assert!(!registry.contains("odd"));
    }

    #[test]
    fn dns_and_unknown_actions_produce_no_rules() {
        let nodes = vec![NodeDescriptor::new(1, "a")
            .with_route(RouteDirective::new("dns", ["x.com"]).with_value("8.8.8.8"))
            .with_route(RouteDirective::new("warp_everything", ["x.com"]))];
        let (routing, _) = compile(&nodes, &OverridePolicy::default());
        assert_eq!(routing.rules, vec![RoutingRule::dns_hijack()]);
    }

    #[test]
    fn every_rule_references_registered_outbound() {
        let nodes = vec![
            NodeDescriptor::new(1, "a")
                .with_route(RouteDirective::new("route", ["a.com"]).with_value(outbound("p")))
                .with_route(RouteDirective::new("default_out", Vec::<String>::new()).with_value(outbound("q"))),
            NodeDescriptor::new(2, "b").with_route(RouteDirective::new("block_port", ["22"])),
        ];
        let (routing, registry) = compile(&nodes, &block_list("[1, 2]"));
        assert!(routing.rules.iter().all(|r| registry.contains(&r.outbound_tag)));
    }

    #[test]
    fn domain_strategy_carried_from_overrides() {
        let overrides = load_overrides_from_str(r#"{"domainStrategy": "IPOnDemand"}"#).unwrap();
        let (routing, _) = compile(&[], &overrides);
        assert_eq!(routing.domain_strategy, DomainStrategy::IPOnDemand);
    }
}
