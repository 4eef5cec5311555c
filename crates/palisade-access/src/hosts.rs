//! Client host restrictions.
//!
//! Every address is compared in its IPv6 form, IPv4 addresses being mapped
//! into `::ffff:0:0/96`, so `10.0.0.1` and `::ffff:10.0.0.1` are the same
//! client.
//!
//! Matching runs cheapest first: exact addresses, subnets, then host names
//! (forward DNS), then regexps and LIKE patterns (reverse DNS). A DNS failure
//! does not stop the search; it is reported only when no rule matched.

use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv6Addr, ToSocketAddrs};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AccessError, Result};

const LOCALHOST: &str = "localhost";

fn to_v6(address: IpAddr) -> Ipv6Addr {
    match address {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn is_loopback(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

// ============================================================================
// Subnets
// ============================================================================

/// An IP subnet, stored as an IPv6 prefix and mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpSubnet {
    prefix: Ipv6Addr,
    mask: Ipv6Addr,
}

impl IpSubnet {
    /// `prefix/prefix_len`, the length counted in the address's own family.
    pub fn new(prefix: IpAddr, prefix_len: u32) -> Result<Self> {
        let (max, offset) = match prefix {
            IpAddr::V4(_) => (32, 96),
            IpAddr::V6(_) => (128, 0),
        };
        if prefix_len > max {
            return Err(AccessError::InvalidHostPattern(format!("{prefix}/{prefix_len}")));
        }
        let len = prefix_len + offset;
        let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
        Ok(Self::from_bits(to_v6(prefix), mask))
    }

    /// `prefix/mask`; the mask must be of the prefix's family.
    pub fn with_mask(prefix: IpAddr, mask: IpAddr) -> Result<Self> {
        let mask = match (prefix, mask) {
            (IpAddr::V4(_), IpAddr::V4(mask)) => (u128::MAX << 32) | u128::from(u32::from(mask)),
            (IpAddr::V6(_), IpAddr::V6(mask)) => u128::from(mask),
            _ => {
                return Err(AccessError::InvalidHostPattern(format!("{prefix}/{mask}")));
            }
        };
        Ok(Self::from_bits(to_v6(prefix), mask))
    }

    fn from_bits(prefix: Ipv6Addr, mask: u128) -> Self {
        Self {
            prefix: Ipv6Addr::from(u128::from(prefix) & mask),
            mask: Ipv6Addr::from(mask),
        }
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        u128::from(to_v6(address)) & u128::from(self.mask) == u128::from(self.prefix)
    }

    fn is_single_address(&self) -> bool {
        u128::from(self.mask) == u128::MAX
    }
}

impl FromStr for IpSubnet {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AccessError::InvalidHostPattern(s.to_string());
        let (prefix, suffix) = s.split_once('/').ok_or_else(invalid)?;
        let prefix: IpAddr = prefix.trim().parse().map_err(|_| invalid())?;
        let suffix = suffix.trim();
        if let Ok(len) = suffix.parse::<u32>() {
            return IpSubnet::new(prefix, len);
        }
        let mask: IpAddr = suffix.parse().map_err(|_| invalid())?;
        IpSubnet::with_mask(prefix, mask)
    }
}

impl Display for IpSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = u128::from(self.mask).leading_ones();
        match self.prefix.to_ipv4_mapped() {
            Some(v4) if len >= 96 => write!(f, "{v4}/{}", len - 96),
            _ => write!(f, "{}/{len}", self.prefix),
        }
    }
}

// ============================================================================
// Resolvers
// ============================================================================

/// Name resolution used by host-name, regexp and LIKE rules.
pub trait HostResolver: Send + Sync {
    /// Addresses a host name resolves to.
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;

    /// Host name an address reverse-resolves to.
    fn reverse(&self, address: IpAddr) -> Result<String>;
}

/// Resolves through the operating system.
///
/// The standard library exposes no reverse lookup, so regexp and LIKE rules
/// never match through this resolver; they report a DNS error instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addresses = (host, 0).to_socket_addrs().map_err(|e| AccessError::Dns {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        Ok(addresses.map(|address| address.ip()).collect())
    }

    fn reverse(&self, address: IpAddr) -> Result<String> {
        Err(AccessError::Dns {
            host: address.to_string(),
            reason: "reverse lookup is not available".to_string(),
        })
    }
}

/// A fixed table of names and addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    forward: HashMap<String, Vec<IpAddr>>,
    reverse: HashMap<IpAddr, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` in both directions. An address keeps the first name
    /// registered for it.
    pub fn with_host(mut self, name: impl Into<String>, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        let name = name.into();
        let addresses: Vec<IpAddr> = addresses.into_iter().collect();
        for address in &addresses {
            self.reverse.entry(*address).or_insert_with(|| name.clone());
        }
        self.forward.entry(name).or_default().extend(addresses);
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.forward.get(host).cloned().ok_or_else(|| AccessError::Dns {
            host: host.to_string(),
            reason: "host not found".to_string(),
        })
    }

    fn reverse(&self, address: IpAddr) -> Result<String> {
        self.reverse.get(&address).cloned().ok_or_else(|| AccessError::Dns {
            host: address.to_string(),
            reason: "no name for address".to_string(),
        })
    }
}

// ============================================================================
// Allowed client hosts
// ============================================================================

/// The set of client hosts a user may connect from.
///
/// The default value allows nothing; [`AllowedClientHosts::any`] allows
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowedClientHosts {
    any_host: bool,
    local_host: bool,
    addresses: BTreeSet<Ipv6Addr>,
    subnets: BTreeSet<IpSubnet>,
    names: BTreeSet<String>,
    name_regexps: BTreeSet<String>,
    like_patterns: BTreeSet<String>,
}

impl AllowedClientHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn any() -> Self {
        Self {
            any_host: true,
            ..Self::default()
        }
    }

    pub fn is_any(&self) -> bool {
        self.any_host
    }

    pub fn is_empty(&self) -> bool {
        !self.any_host
            && !self.local_host
            && self.addresses.is_empty()
            && self.subnets.is_empty()
            && self.names.is_empty()
            && self.name_regexps.is_empty()
            && self.like_patterns.is_empty()
    }

    pub fn add_any_host(&mut self) {
        self.any_host = true;
    }

    pub fn add_local_host(&mut self) {
        self.local_host = true;
    }

    pub fn add_address(&mut self, address: IpAddr) {
        self.addresses.insert(to_v6(address));
    }

    pub fn add_subnet(&mut self, subnet: IpSubnet) {
        if subnet.is_single_address() {
            self.addresses.insert(subnet.prefix);
        } else {
            self.subnets.insert(subnet);
        }
    }

    pub fn add_name(&mut self, name: &str) {
        if name.eq_ignore_ascii_case(LOCALHOST) {
            self.local_host = true;
        } else {
            self.names.insert(name.to_string());
        }
    }

    /// Adds a regexp that must match the whole reverse-resolved host name.
    pub fn add_name_regexp(&mut self, pattern: &str) -> Result<()> {
        compile_anchored(pattern)?;
        self.name_regexps.insert(pattern.to_string());
        Ok(())
    }

    /// Adds a LIKE pattern: `%` matches any run of characters, `_` exactly
    /// one, `\` escapes. A pattern that is a bare IP or subnet is stored as
    /// such, and `%` alone allows any host.
    pub fn add_like_pattern(&mut self, pattern: &str) -> Result<()> {
        if pattern == "%" {
            self.any_host = true;
            return Ok(());
        }
        if let Ok(address) = pattern.parse::<IpAddr>() {
            self.add_address(address);
            return Ok(());
        }
        if let Ok(subnet) = pattern.parse::<IpSubnet>() {
            self.add_subnet(subnet);
            return Ok(());
        }
        compile_anchored(&like_to_regex(pattern))?;
        self.like_patterns.insert(pattern.to_string());
        Ok(())
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.add_address(address);
        self
    }

    pub fn with_subnet(mut self, subnet: IpSubnet) -> Self {
        self.add_subnet(subnet);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.add_name(name);
        self
    }

    /// Whether `address` is allowed. DNS failures count as no match.
    pub fn contains(&self, address: IpAddr, resolver: &dyn HostResolver) -> bool {
        self.matches(address, resolver).unwrap_or(false)
    }

    /// Whether `address` is allowed.
    ///
    /// Returns the first DNS error seen when no rule matched and some rule
    /// could not be evaluated.
    pub fn matches(&self, address: IpAddr, resolver: &dyn HostResolver) -> Result<bool> {
        if self.any_host {
            return Ok(true);
        }
        if self.local_host && is_loopback(address) {
            return Ok(true);
        }

        let address_v6 = to_v6(address);
        if self.addresses.contains(&address_v6) {
            return Ok(true);
        }
        if self.subnets.iter().any(|subnet| subnet.contains(address)) {
            return Ok(true);
        }

        let mut first_error = None;
        for name in &self.names {
            match resolver.resolve(name) {
                Ok(resolved) if resolved.iter().any(|a| to_v6(*a) == address_v6) => {
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(host = %name, error = %e, "host name rule could not be resolved");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !self.name_regexps.is_empty() || !self.like_patterns.is_empty() {
            match self.reverse_confirmed(address, resolver) {
                Ok(host) => {
                    let patterns = self
                        .name_regexps
                        .iter()
                        .cloned()
                        .chain(self.like_patterns.iter().map(|p| like_to_regex(p)));
                    for pattern in patterns {
                        match compile_anchored(&pattern) {
                            Ok(regex) if regex.is_match(&host) => return Ok(true),
                            Ok(_) => {}
                            Err(e) => {
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(address = %address, error = %e, "reverse lookup failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Reverse-resolves `address` and checks the name resolves back to it.
    fn reverse_confirmed(&self, address: IpAddr, resolver: &dyn HostResolver) -> Result<String> {
        let host = resolver.reverse(address)?;
        let address_v6 = to_v6(address);
        let confirmed = resolver
            .resolve(&host)?
            .into_iter()
            .any(|a| to_v6(a) == address_v6);
        if confirmed {
            Ok(host)
        } else {
            Err(AccessError::Dns {
                reason: format!("host isn't resolved back to {address}"),
                host,
            })
        }
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| AccessError::InvalidHostPattern(format!("{pattern}: {e}")))
}

fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4])));
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out
}
