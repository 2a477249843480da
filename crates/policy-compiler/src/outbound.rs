use std::collections::HashSet;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

/// Tag of the built-in direct egress.
pub const DIRECT_TAG: &str = "direct";
/// Tag of the built-in blackhole sink.
pub const BLOCK_TAG: &str = "block";
/// Tag of the built-in DNS egress.
pub const DNS_OUT_TAG: &str = "dns_out";

/// Outbound protocols the proxy engine can build.
const SUPPORTED_PROTOCOLS: &[&str] = &[
    "freedom",
    "blackhole",
    "dns",
    "vmess",
    "vless",
    "trojan",
    "shadowsocks",
    "socks",
    "http",
    "wireguard",
    "hysteria",
    "loopback",
];

/// Errors raised while turning an outbound descriptor into a target.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("malformed outbound descriptor: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("outbound descriptor has no tag")]
    MissingTag,

    #[error("outbound '{tag}' uses unsupported protocol '{protocol}'")]
    UnsupportedProtocol { tag: String, protocol: String },
}

/// An outbound as declared by a panel directive.
///
/// Only `tag` and `protocol` are interpreted; every other field is carried
/// through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundDescriptor {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundDescriptor {
    /// Parse a JSON-encoded descriptor. Only the tag is required here; the
    /// protocol is checked when a new target is actually built, so a bare
    /// `{"tag": "direct"}` can reference an existing outbound.
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let descriptor: OutboundDescriptor = serde_json::from_str(json)?;
        descriptor.check_tag()?;
        Ok(descriptor)
    }

    fn check_tag(&self) -> Result<(), RegistryError> {
        if self.tag.trim().is_empty() {
            return Err(RegistryError::MissingTag);
        }
        Ok(())
    }

    fn check_protocol(&self) -> Result<(), RegistryError> {
        let protocol = self.protocol.to_ascii_lowercase();
        if !SUPPORTED_PROTOCOLS.contains(&protocol.as_str()) {
            return Err(RegistryError::UnsupportedProtocol {
                tag: self.tag.clone(),
                protocol: self.protocol.clone(),
            });
        }
        Ok(())
    }
}

/// A named egress ready to hand to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundTarget {
    pub tag: String,
    /// Engine payload; always contains `tag` and `protocol`.
    pub definition: Value,
}

impl OutboundTarget {
    /// Build a target from a descriptor, rejecting unknown protocols.
    pub fn build(descriptor: &OutboundDescriptor) -> Result<Self, RegistryError> {
        descriptor.check_tag()?;
        descriptor.check_protocol()?;

        let mut definition = descriptor.extra.clone();
        definition.insert("tag".into(), Value::String(descriptor.tag.clone()));
        definition.insert(
            "protocol".into(),
            Value::String(descriptor.protocol.to_ascii_lowercase()),
        );

        Ok(Self {
            tag: descriptor.tag.clone(),
            definition: Value::Object(definition),
        })
    }

    fn builtin(tag: &str, definition: Value) -> Self {
        Self {
            tag: tag.to_string(),
            definition,
        }
    }

    pub fn protocol(&self) -> Option<&str> {
        self.definition.get("protocol").and_then(Value::as_str)
    }
}

impl Serialize for OutboundTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.definition.serialize(serializer)
    }
}

/// Insertion-ordered, tag-unique set of outbound targets.
#[derive(Debug, Clone, Default)]
pub struct OutboundRegistry {
    targets: Vec<OutboundTarget>,
    tags: HashSet<String>,
}

impl OutboundRegistry {
    /// An empty registry. Most callers want [`OutboundRegistry::seeded`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the three built-ins.
    pub fn seeded() -> Self {
        let mut registry = Self::new();
        registry.seed();
        registry
    }

    /// Append the built-ins in fixed order: direct, block, dns_out.
    pub fn seed(&mut self) {
        let builtins = [
            OutboundTarget::builtin(
                DIRECT_TAG,
                json!({"tag": DIRECT_TAG, "protocol": "freedom", "settings": {}}),
            ),
            OutboundTarget::builtin(
                BLOCK_TAG,
                json!({"tag": BLOCK_TAG, "protocol": "blackhole", "settings": {}}),
            ),
            OutboundTarget::builtin(
                DNS_OUT_TAG,
                json!({"tag": DNS_OUT_TAG, "protocol": "dns", "settings": {}}),
            ),
        ];
        for target in builtins {
            self.insert(target);
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn get(&self, tag: &str) -> Option<&OutboundTarget> {
        self.targets.iter().find(|t| t.tag == tag)
    }

    /// Register a descriptor unless its tag is already present.
    ///
    /// Returns the tag in both cases. An existing target is never replaced,
    /// even if the new descriptor differs, and the descriptor's protocol is
    /// only checked when a new target is built.
    pub fn register(&mut self, descriptor: &OutboundDescriptor) -> Result<String, RegistryError> {
        if self.contains(&descriptor.tag) {
            return Ok(descriptor.tag.clone());
        }
        let target = OutboundTarget::build(descriptor)?;
        let tag = target.tag.clone();
        debug!(tag = %tag, protocol = ?target.protocol(), "registered custom outbound");
        self.insert(target);
        Ok(tag)
    }

    /// Parse a JSON descriptor and register it unless its tag is present.
    pub fn register_if_absent(&mut self, descriptor_json: &str) -> Result<String, RegistryError> {
        let descriptor = OutboundDescriptor::from_json(descriptor_json)?;
        self.register(&descriptor)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.tag.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn into_targets(self) -> Vec<OutboundTarget> {
        self.targets
    }

    fn insert(&mut self, target: OutboundTarget) {
        if self.tags.insert(target.tag.clone()) {
            self.targets.push(target);
        }
    }
}
