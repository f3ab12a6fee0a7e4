//! HTTP middleware for security and client identification.
//!
//! - **Client IP**: forwarded-header extraction and IP/CIDR allowlists
//! - **API Key Authentication**: constant-time comparison with a brute-force guard
//! - **Rate Limiting**: per-IP and per-(endpoint, IP) sliding windows
//!
//! # Architecture
//!
//! ```text
//! Admin request → Rate Limiter → API Key Auth → Handler → Response
//!                      ↓               ↓
//!                 429 Too Many    401 Unauthorized / 429 brute force
//! ```
//!
//! The webhook route applies its own rate-limit and authentication steps in
//! the handler, because the order of checks and the rejection bodies are
//! part of the marketplace contract.

pub mod auth;
pub mod ip;
pub mod rate_limit;

pub use auth::{API_KEY_HEADER, ApiKeyAuth};
pub use ip::{CidrRange, IpAllowlist, UNKNOWN_IP, extract_client_ip};
pub use rate_limit::{RateLimitLayer, rate_limited_response};
