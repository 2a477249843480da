//! # policy-compiler
//!
//! Compiles panel node descriptors and local operator overrides into the
//! three configuration sections a proxy engine consumes: the DNS policy, the
//! ordered outbound list, and the first-match routing table.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use policy_compiler::{CompilerConfig, NodeDescriptor, PolicyCompiler};
//!
//! let compiler = PolicyCompiler::new(CompilerConfig::default());
//! let nodes: Vec<NodeDescriptor> = serde_json::from_str("[]").unwrap();
//! let compiled = compiler.compile(&nodes).unwrap();
//! println!("{}", serde_json::to_string_pretty(&compiled).unwrap());
//! ```

mod compiler;
mod config;
pub mod dns;
mod engine;
pub mod node;
pub mod outbound;
pub mod overrides;
mod rules;
mod validate;

// Re-export primary public API at crate root.
pub use compiler::{RuleCompiler, DEFAULT_GEO_SOURCE};
pub use config::CompilerConfig;
pub use dns::{DnsPolicy, DnsPolicyResolver, NameServer, QueryStrategy, UnknownQueryStrategy};
pub use engine::{CompiledConfig, PolicyCompiler};
pub use node::{Directive, DirectiveError, NodeDescriptor, RouteDirective};
pub use outbound::{OutboundDescriptor, OutboundRegistry, OutboundTarget, RegistryError};
pub use overrides::{load_overrides, DomainStrategy, OverridePolicy, UnknownDomainStrategy};
pub use rules::{CompiledRouting, RoutingRule, RuleListBuilder, RuleMatcher};
pub use validate::{validate_dns, validate_routing, CompileError};
