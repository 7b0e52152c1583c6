//! Caller address resolution.
//!
//! The address is taken from the first configured source that yields a
//! non-empty value. Sources are tried in the configured order.

use std::str::FromStr;

use tracing::trace;

use super::request::InboundRequest;
use crate::error::TollgateError;

pub const CF_CONNECTING_IP: &str = "CF-Connecting-IP";
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_REAL_IP: &str = "X-Real-IP";
pub const REMOTE_ADDR: &str = "RemoteAddr";

/// Prefix selecting an arbitrary single-value header, e.g. `header:Fly-Client-IP`.
const HEADER_PREFIX: &str = "header:";

/// Default number of forwarded-for entries skipped from the end.
///
/// Large enough that realistic chains resolve to their left-most entry.
pub const DEFAULT_FORWARDED_FOR_HOPS: usize = 100;

/// One place to look for the caller's address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IpLookup {
    /// CDN-injected connecting address, trusted verbatim
    CfConnectingIp,
    /// Comma-separated proxy chain
    XForwardedFor,
    /// Socket peer address
    RemoteAddr,
    /// Reverse-proxy single-value header
    XRealIp,
    /// Any other single-value header
    Header(String),
}

impl IpLookup {
    pub fn name(&self) -> &str {
        match self {
            IpLookup::CfConnectingIp => CF_CONNECTING_IP,
            IpLookup::XForwardedFor => X_FORWARDED_FOR,
            IpLookup::RemoteAddr => REMOTE_ADDR,
            IpLookup::XRealIp => X_REAL_IP,
            IpLookup::Header(name) => name.as_str(),
        }
    }

    fn lookup<R: InboundRequest + ?Sized>(
        &self,
        forwarded_for_hops: usize,
        req: &R,
    ) -> Option<String> {
        match self {
            IpLookup::CfConnectingIp => non_empty_header(req, CF_CONNECTING_IP),
            IpLookup::XRealIp => non_empty_header(req, X_REAL_IP),
            IpLookup::Header(name) => non_empty_header(req, name),
            IpLookup::XForwardedFor => req
                .header(X_FORWARDED_FOR)
                .filter(|chain| !chain.is_empty())
                .map(|chain| select_forwarded_for(chain, forwarded_for_hops))
                .filter(|ip| !ip.is_empty()),
            IpLookup::RemoteAddr => req
                .remote_addr()
                .filter(|addr| !addr.is_empty())
                .map(|addr| split_host(&addr).map(str::to_string).unwrap_or(addr))
                .filter(|ip| !ip.is_empty()),
        }
    }
}

impl FromStr for IpLookup {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix(HEADER_PREFIX) {
            let name = name.trim();
            if name.is_empty() || http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(TollgateError::Config(format!(
                    "Invalid IP lookup header: {:?}",
                    name
                )));
            }
            return Ok(IpLookup::Header(name.to_string()));
        }

        if s.eq_ignore_ascii_case(CF_CONNECTING_IP) {
            Ok(IpLookup::CfConnectingIp)
        } else if s.eq_ignore_ascii_case(X_FORWARDED_FOR) {
            Ok(IpLookup::XForwardedFor)
        } else if s.eq_ignore_ascii_case(REMOTE_ADDR) {
            Ok(IpLookup::RemoteAddr)
        } else if s.eq_ignore_ascii_case(X_REAL_IP) {
            Ok(IpLookup::XRealIp)
        } else {
            Err(TollgateError::Config(format!("Unknown IP lookup source: {:?}", s)))
        }
    }
}

impl std::fmt::Display for IpLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpLookup::Header(name) => write!(f, "{}{}", HEADER_PREFIX, name),
            other => f.write_str(other.name()),
        }
    }
}

pub fn default_ip_lookups() -> Vec<IpLookup> {
    vec![
        IpLookup::CfConnectingIp,
        IpLookup::XForwardedFor,
        IpLookup::RemoteAddr,
        IpLookup::XRealIp,
    ]
}

/// Resolve the caller's address.
///
/// Returns an empty string when no source yields a value, meaning the
/// caller cannot be identified by address.
pub fn remote_ip<R: InboundRequest + ?Sized>(
    lookups: &[IpLookup],
    forwarded_for_hops: usize,
    req: &R,
) -> String {
    for lookup in lookups {
        if let Some(ip) = lookup.lookup(forwarded_for_hops, req) {
            trace!(source = %lookup, ip = %ip, "Resolved caller address");
            return ip;
        }
    }
    String::new()
}

/// Pick the entry `hops` positions before the end of the chain.
///
/// Chains shorter than `hops + 1` clamp to the first entry.
fn select_forwarded_for(chain: &str, hops: usize) -> String {
    let parts: Vec<&str> = chain.split(',').map(str::trim).collect();
    let index = (parts.len() - 1).saturating_sub(hops);
    parts[index].to_string()
}

/// Host part of `host:port`, or `None` when the value is not of that form.
///
/// The port may be empty.
fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return (!port.contains(':')).then_some(host);
    }

    let (host, _port) = addr.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some(host)
}

fn non_empty_header<R: InboundRequest + ?Sized>(req: &R, name: &str) -> Option<String> {
    req.header(name)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
