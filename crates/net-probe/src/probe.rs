use std::net::{IpAddr, Ipv6Addr};

use sysinfo::Networks;
use tracing::{debug, trace};

/// Source of host capability facts consulted during compilation.
///
/// Implementations must be cheap enough to call once per compilation cycle
/// and must never fail: when the host cannot be inspected they report the
/// conservative answer.
pub trait CapabilityProbe: Send + Sync {
    /// Returns `true` when at least one local interface carries a public
    /// IPv6 address.
    fn has_public_ipv6(&self) -> bool;
}

/// Probe backed by the operating system's interface table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl CapabilityProbe for SystemProbe {
    fn has_public_ipv6(&self) -> bool {
        detect_public_ipv6()
    }
}

/// Probe returning a fixed answer. Used where the host must not be consulted,
/// e.g. in tests or when the operator pins the DNS strategy.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub bool);

impl CapabilityProbe for FixedProbe {
    fn has_public_ipv6(&self) -> bool {
        self.0
    }
}

/// Enumerates every local interface address and reports whether any of them
/// is a public IPv6 address.
///
/// An empty interface table (enumeration unavailable or failed) yields
/// `false`, i.e. an IPv4-only host.
pub fn detect_public_ipv6() -> bool {
    let networks = Networks::new_with_refreshed_list();

    if networks.list().is_empty() {
        debug!("no network interfaces reported; assuming IPv4-only host");
        return false;
    }

    for (name, data) in networks.list() {
        for net in data.ip_networks() {
            if is_public_ipv6(net.addr) {
                debug!(interface = %name, addr = %net.addr, "found public IPv6 address");
                return true;
            }
            trace!(interface = %name, addr = %net.addr, "address is not public IPv6");
        }
    }

    false
}

/// Returns `true` for an IPv6 address that is not loopback, unspecified,
/// link-local (`fe80::/10`), unique-local (`fc00::/7`) or IPv4-mapped.
pub fn is_public_ipv6(addr: IpAddr) -> bool {
    let v6 = match addr {
        IpAddr::V4(_) => return false,
        IpAddr::V6(v6) => v6,
    };

    if v6.to_ipv4_mapped().is_some() {
        return false;
    }

    !(v6.is_loopback() || v6.is_unspecified() || is_link_local(&v6) || is_unique_local(&v6))
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn is_unique_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}
