//! # net-probe
//!
//! Host capability detection for the policy compiler. The only capability
//! consulted today is whether the machine owns a globally routable IPv6
//! address, which decides the default DNS query strategy.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use net_probe::{CapabilityProbe, SystemProbe};
//!
//! let probe = SystemProbe;
//! if probe.has_public_ipv6() {
//!     println!("dual-stack host");
//! }
//! ```

mod probe;

pub use probe::{detect_public_ipv6, is_public_ipv6, CapabilityProbe, FixedProbe, SystemProbe};
