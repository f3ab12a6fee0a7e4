//! Webhook sender authentication.
//!
//! A delivery is authenticated by **either**:
//!
//! - an HMAC-SHA256 of the raw body keyed with the shared secret,
//!   base64url-encoded (no padding) in `X-Signature`, or
//! - the shared secret itself in `X-Webhook-Secret` (legacy senders).
//!
//! Independently of credentials, when IP enforcement is on the client IP must
//! be in the sender allowlist. An allowlist miss is reported as
//! [`AuthError::UnauthorizedIp`] even if the signature is valid.
//!
//! Validation is pure CPU work with no I/O, so it fits inside the webhook
//! deadline.

use axum::http::{HeaderMap, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::middleware::{IpAllowlist, extract_client_ip};

/// Header carrying the base64url HMAC of the body.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Header carrying the raw shared secret.
pub const SECRET_HEADER: &str = "x-webhook-secret";

type HmacSha256 = Hmac<Sha256>;

/// Which credential was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Signature,
    SharedSecret,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Signature => "signature",
            AuthMethod::SharedSecret => "shared_secret",
        }
    }
}

/// A delivery that passed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub client_ip: String,
    pub method: AuthMethod,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Missing or invalid credential (401).
    #[error("unauthorized: {reason}")]
    Unauthorized {
        client_ip: String,
        reason: &'static str,
    },

    /// Client IP outside the sender allowlist (403).
    #[error("unauthorized IP {client_ip}")]
    UnauthorizedIp { client_ip: String },
}

impl AuthError {
    pub fn client_ip(&self) -> &str {
        match self {
            AuthError::Unauthorized { client_ip, .. } | AuthError::UnauthorizedIp { client_ip } => {
                client_ip
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AuthError::UnauthorizedIp { .. } => StatusCode::FORBIDDEN,
        }
    }
}

/// Validates webhook deliveries against the shared secret and sender allowlist.
#[derive(Debug, Clone)]
pub struct WebhookAuthenticator {
    secret: Option<String>,
    allowlist: IpAllowlist,
    enforce_ip: bool,
}

impl WebhookAuthenticator {
    pub fn new(secret: Option<String>, allowlist: IpAllowlist, enforce_ip: bool) -> Self {
        Self {
            secret,
            allowlist,
            enforce_ip,
        }
    }

    pub fn enforces_ip(&self) -> bool {
        self.enforce_ip
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Authenticate a delivery from its headers and raw body.
    pub fn validate(&self, headers: &HeaderMap, body: &[u8]) -> Result<Authenticated, AuthError> {
        let client_ip = extract_client_ip(headers).into_owned();

        if self.enforce_ip && !self.allowlist.contains(&client_ip) {
            return Err(AuthError::UnauthorizedIp { client_ip });
        }

        let Some(secret) = self.secret.as_deref() else {
            return Err(AuthError::Unauthorized {
                client_ip,
                reason: "no webhook secret configured",
            });
        };

        let signature = header_str(headers, SIGNATURE_HEADER);
        let shared = header_str(headers, SECRET_HEADER);

        if signature.is_none() && shared.is_none() {
            return Err(AuthError::Unauthorized {
                client_ip,
                reason: "missing credentials",
            });
        }

        if let Some(signature) = signature
            && verify_signature(secret, body, signature)
        {
            return Ok(Authenticated {
                client_ip,
                method: AuthMethod::Signature,
            });
        }

        if let Some(shared) = shared
            && bool::from(shared.as_bytes().ct_eq(secret.as_bytes()))
        {
            return Ok(Authenticated {
                client_ip,
                method: AuthMethod::SharedSecret,
            });
        }

        Err(AuthError::Unauthorized {
            client_ip,
            reason: "invalid credentials",
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Compute the `X-Signature` value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of a base64url signature. A `sha256=` prefix and
/// trailing padding are tolerated.
fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let encoded = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim_end_matches('=');

    let Ok(expected) = URL_SAFE_NO_PAD.decode(encoded) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "s3cr3t";
    const BODY: &[u8] = br#"{"user_id":123,"topic":"items"}"#;

    fn authenticator(enforce_ip: bool) -> WebhookAuthenticator {
        WebhookAuthenticator::new(
            Some(SECRET.to_string()),
            IpAllowlist::new(&["54.88.218.97".to_string()]),
            enforce_ip,
        )
    }

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_valid_signature_without_secret_header() {
        let h = headers(&[(SIGNATURE_HEADER, sign(SECRET, BODY))]);
        let auth = authenticator(false).validate(&h, BODY).unwrap();
        assert_eq!(auth.method, AuthMethod::Signature);
    }

    #[test]
    fn test_valid_secret_without_signature() {
        let h = headers(&[(SECRET_HEADER, SECRET.to_string())]);
        let auth = authenticator(false).validate(&h, BODY).unwrap();
        assert_eq!(auth.method, AuthMethod::SharedSecret);
    }

    #[test]
    fn test_neither_credential_is_unauthorized() {
        let err = authenticator(false)
            .validate(&HeaderMap::new(), BODY)
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_bad_signature_falls_back_to_secret() {
        let h = headers(&[
            (SIGNATURE_HEADER, "bogus".to_string()),
            (SECRET_HEADER, SECRET.to_string()),
        ]);
        let auth = authenticator(false).validate(&h, BODY).unwrap();
        assert_eq!(auth.method, AuthMethod::SharedSecret);
    }

    #[test]
    fn test_signature_over_different_body_rejected() {
        let h = headers(&[(SIGNATURE_HEADER, sign(SECRET, b"other"))]);
        assert!(authenticator(false).validate(&h, BODY).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let h = headers(&[(SECRET_HEADER, "nope".to_string())]);
        let err = authenticator(false).validate(&h, BODY).unwrap_err();
        assert!(matches!(
            err,
            AuthError::Unauthorized {
                reason: "invalid credentials",
                ..
            }
        ));
    }

    #[test]
    fn test_signature_prefix_and_padding_tolerated() {
        let sig = format!("sha256={}=", sign(SECRET, BODY));
        let h = headers(&[(SIGNATURE_HEADER, sig)]);
        assert!(authenticator(false).validate(&h, BODY).is_ok());
    }

    #[test]
    fn test_ip_rejection_independent_of_signature() {
        let h = headers(&[
            (SIGNATURE_HEADER, sign(SECRET, BODY)),
            ("x-forwarded-for", "203.0.113.9".to_string()),
        ]);
        let err = authenticator(true).validate(&h, BODY).unwrap_err();

        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.client_ip(), "203.0.113.9");
    }

    #[test]
    fn test_allowlisted_ip_with_signature_passes() {
        let h = headers(&[
            (SIGNATURE_HEADER, sign(SECRET, BODY)),
            ("x-forwarded-for", "54.88.218.97".to_string()),
        ]);
        let auth = authenticator(true).validate(&h, BODY).unwrap();
        assert_eq!(auth.client_ip, "54.88.218.97");
    }

    #[test]
    fn test_missing_secret_config_rejects_everything() {
        let auth = WebhookAuthenticator::new(None, IpAllowlist::default(), false);
        let h = headers(&[(SECRET_HEADER, "anything".to_string())]);
        assert!(auth.validate(&h, BODY).is_err());
    }
}
