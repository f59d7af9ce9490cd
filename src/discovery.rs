//! Address discovery: which address should clients be pointed at.

use crate::config::OverrideConfig;
use crate::error::{OverrideError, Result};
use crate::host::Host;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// The routable IPv4 address advertised for the overridden hostname.
///
/// Discovered fresh on every run, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAddress(Ipv4Addr);

impl HostAddress {
    /// Wraps `addr` if it can be advertised to other machines.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::InvalidConfig`] for loopback, unspecified,
    /// broadcast, link-local or multicast addresses.
    pub fn new(addr: Ipv4Addr) -> Result<Self> {
        if is_advertisable(addr) {
            Ok(Self(addr))
        } else {
            Err(OverrideError::InvalidConfig(format!(
                "{addr} cannot be advertised to other devices"
            )))
        }
    }

    /// The wrapped address.
    #[must_use]
    pub const fn addr(self) -> Ipv4Addr {
        self.0
    }
}

impl FromStr for HostAddress {
    type Err = OverrideError;

    fn from_str(s: &str) -> Result<Self> {
        let addr = s
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| OverrideError::InvalidConfig(format!("{s:?} is not an IPv4 address")))?;
        Self::new(addr)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

const fn is_advertisable(addr: Ipv4Addr) -> bool {
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_link_local()
        || addr.is_multicast())
}

/// Finds the address to advertise.
///
/// Named interfaces are probed in configured order; if none has a usable
/// address, every interface is scanned and the first private-range address
/// wins. Probe errors are logged and treated as "no address".
///
/// # Errors
///
/// Returns [`OverrideError::AddressNotFound`] when nothing qualifies.
pub fn discover<H: Host>(host: &H, config: &OverrideConfig) -> Result<HostAddress> {
    for name in &config.interfaces {
        match host.interface_address(name) {
            Ok(Some(addr)) => match HostAddress::new(addr) {
                Ok(address) => {
                    tracing::info!(interface = %name, %address, "Discovered host address");
                    return Ok(address);
                }
                Err(_) => tracing::debug!(interface = %name, %addr, "Skipping unusable address"),
            },
            Ok(None) => tracing::debug!(interface = %name, "No IPv4 address on interface"),
            Err(e) => tracing::debug!(interface = %name, error = %e, "Interface probe failed"),
        }
    }

    match host.interface_addresses() {
        Ok(all) => {
            if let Some(found) = all
                .iter()
                .find(|a| a.addr.is_private() && is_advertisable(a.addr))
            {
                tracing::info!(
                    interface = %found.name,
                    address = %found.addr,
                    "Discovered host address by private-range scan"
                );
                return Ok(HostAddress(found.addr));
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not enumerate interfaces"),
    }

    Err(OverrideError::AddressNotFound {
        probed: config.interfaces.join(", "),
    })
}
