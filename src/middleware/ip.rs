//! Client IP extraction and IP/CIDR allowlists.
//!
//! The webhook authenticator, the rate-limit policies, and the admin
//! brute-force guard all key on the same client IP, so extraction lives here.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **Extraction trusts client-provided headers.** Deploy behind a reverse
//! proxy that overwrites `X-Forwarded-For` / `X-Real-IP`, and block direct
//! access to the service. Otherwise a sender can spoof an allowlisted
//! marketplace IP or rotate IPs to dodge per-IP rate limits.
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
//! ```
//!
//! ## The "unknown" Fallback
//!
//! Requests without IP headers all share the [`UNKNOWN_IP`] key. They are
//! collectively rate-limited and never match an allowlist.

use std::borrow::Cow;
use std::net::IpAddr;

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Fallback IP value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Where the client IP was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    /// First non-empty entry of `X-Forwarded-For`.
    FromXff(&'a str),
    /// `X-Real-IP`.
    FromRealIp(&'a str),
    NotFound,
}

#[inline]
fn extract_ip_from_headers(headers: &HeaderMap) -> ExtractedIp<'_> {
    // "client, proxy1, proxy2": the originating client comes first
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first_ip) = value.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(value) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return ExtractedIp::FromRealIp(value);
        }
    }

    ExtractedIp::NotFound
}

/// Extract the client IP from the forwarded-for header chain.
///
/// # Header Priority
///
/// 1. `X-Forwarded-For` (first non-empty entry)
/// 2. `X-Real-IP`
/// 3. Falls back to [`UNKNOWN_IP`]
///
/// Returns a borrowed `Cow` for the fallback so the common miss path does not allocate.
#[inline]
pub fn extract_client_ip(headers: &HeaderMap) -> Cow<'static, str> {
    match extract_ip_from_headers(headers) {
        ExtractedIp::FromXff(ip) => Cow::Owned(ip.to_string()),
        ExtractedIp::FromRealIp(ip) => {
            debug!(client_ip = %ip, "Client IP taken from X-Real-IP");
            Cow::Owned(ip.to_string())
        }
        ExtractedIp::NotFound => Cow::Borrowed(UNKNOWN_IP),
    }
}

// =============================================================================
// CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"`, or a bare IP (implicit /32 or /128).
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// A set of IPs and CIDR ranges.
///
/// An empty list matches nothing.
#[derive(Debug, Clone, Default)]
pub struct IpAllowlist {
    ranges: Vec<CidrRange>,
}

impl IpAllowlist {
    /// Build from IP/CIDR strings. Invalid entries are logged and skipped.
    pub fn new(entries: &[String]) -> Self {
        let ranges = entries
            .iter()
            .filter_map(|entry| {
                let parsed = CidrRange::parse(entry);
                if parsed.is_none() {
                    warn!(entry = %entry, "Invalid IP or CIDR in allowlist, skipping");
                }
                parsed
            })
            .collect();

        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether `ip_str` parses as an IP inside any configured range.
    pub fn contains(&self, ip_str: &str) -> bool {
        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            return false;
        };
        self.ranges.iter().any(|range| range.contains(&ip))
    }
}
