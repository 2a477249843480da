use net_probe::{CapabilityProbe, SystemProbe};
use serde::Serialize;
use tracing::{error, info};

use crate::compiler::RuleCompiler;
use crate::config::CompilerConfig;
use crate::dns::{DnsPolicy, DnsPolicyResolver};
use crate::node::NodeDescriptor;
use crate::outbound::{OutboundRegistry, OutboundTarget};
use crate::overrides::load_overrides;
use crate::rules::CompiledRouting;
use crate::validate::{validate_dns, validate_routing, CompileError};

/// Everything one compilation cycle produces. The caller swaps it into the
/// running engine as a whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledConfig {
    pub dns: DnsPolicy,
    pub outbounds: Vec<OutboundTarget>,
    pub routing: CompiledRouting,
}

/// Runs full compilation cycles against a fixed configuration.
///
/// Holds no state between calls: override files are re-read and the host is
/// re-probed every time.
pub struct PolicyCompiler {
    config: CompilerConfig,
    probe: Box<dyn CapabilityProbe>,
}

impl std::fmt::Debug for PolicyCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCompiler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolicyCompiler {
    /// A compiler that probes the host's interfaces.
    pub fn new(config: CompilerConfig) -> Self {
        Self::with_probe(config, SystemProbe)
    }

    pub fn with_probe(config: CompilerConfig, probe: impl CapabilityProbe + 'static) -> Self {
        Self {
            config,
            probe: Box::new(probe),
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile `nodes` into DNS, outbound and routing sections.
    ///
    /// Soft failures (missing or malformed override files, bad directives)
    /// are logged and absorbed. An error means the assembled result was
    /// rejected and must not replace the active configuration.
    pub fn compile(&self, nodes: &[NodeDescriptor]) -> Result<CompiledConfig, CompileError> {
        let dns = DnsPolicyResolver::new(self.probe.as_ref(), &self.config.fallback_dns)
            .resolve(&self.config.dns_override_path, nodes);

        let overrides = load_overrides(&self.config.route_override_path);

        let mut registry = OutboundRegistry::seeded();
        let routing = RuleCompiler::new(self.config.geo_source.as_str())
            .with_legacy_block_matching(self.config.legacy_block_matching)
            .compile(nodes, &overrides, &mut registry);

        if let Err(e) = validate_dns(&dns).and_then(|()| validate_routing(&routing, &registry)) {
            error!(error = %e, "compiled configuration rejected");
            return Err(e);
        }

        info!(
            nodes = nodes.len(),
            dns_servers = dns.servers.len(),
            outbounds = registry.len(),
            rules = routing.rules.len(),
            "compiled proxy configuration"
        );

        Ok(CompiledConfig {
            dns,
            outbounds: registry.into_targets(),
            routing,
        })
    }
}
