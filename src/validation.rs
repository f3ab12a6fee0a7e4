//! Strict validation of the inbound webhook envelope.
//!
//! The body is first parsed as JSON, then each field is checked for
//! presence and primitive type. A malformed body and a well-formed body
//! with the wrong shape are distinct errors because the sender sees
//! different messages for each.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{Topic, WebhookNotification};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length for the `resource` path.
pub const MAX_RESOURCE_LENGTH: usize = 512;

/// Maximum length for `application_id`.
pub const MAX_APPLICATION_ID_LENGTH: usize = 64;

/// Why an inbound body was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unsupported topic '{0}'")]
    UnsupportedTopic(String),

    #[error("application_id '{0}' does not match this deployment")]
    ApplicationMismatch(String),
}

impl SchemaError {
    /// Message returned to the sender in the `error` field.
    pub fn public_message(&self) -> &'static str {
        match self {
            SchemaError::InvalidJson(_) => "Invalid JSON payload",
            _ => "Invalid payload schema",
        }
    }

    /// Label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SchemaError::InvalidJson(_) => "invalid_json",
            SchemaError::UnsupportedTopic(_) => "unsupported_topic",
            SchemaError::ApplicationMismatch(_) => "application_mismatch",
            _ => "invalid_schema",
        }
    }
}

/// Parse and validate a raw webhook body.
///
/// When `expected_app_id` is set, the envelope's `application_id` must match it.
pub fn parse_notification(
    body: &[u8],
    expected_app_id: Option<&str>,
) -> Result<WebhookNotification, SchemaError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;

    let Value::Object(obj) = value else {
        return Err(SchemaError::InvalidField {
            field: "body",
            reason: "must be a JSON object",
        });
    };

    let user_id = required(&obj, "user_id")?
        .as_u64()
        .ok_or(SchemaError::InvalidField {
            field: "user_id",
            reason: "must be a non-negative integer",
        })?;

    let topic_raw = required_str(&obj, "topic")?;
    let topic: Topic = topic_raw
        .parse()
        .map_err(|_| SchemaError::UnsupportedTopic(topic_raw.to_string()))?;

    let resource = required_str(&obj, "resource")?;
    if !resource.starts_with('/') {
        return Err(SchemaError::InvalidField {
            field: "resource",
            reason: "must be an absolute path",
        });
    }
    if resource.len() > MAX_RESOURCE_LENGTH {
        return Err(SchemaError::InvalidField {
            field: "resource",
            reason: "is too long",
        });
    }
    if resource.chars().any(char::is_control) {
        return Err(SchemaError::InvalidField {
            field: "resource",
            reason: "contains control characters",
        });
    }

    let application_id = match required(&obj, "application_id")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => {
            return Err(SchemaError::InvalidField {
                field: "application_id",
                reason: "must be a non-empty string or integer",
            });
        }
    };
    if application_id.len() > MAX_APPLICATION_ID_LENGTH {
        return Err(SchemaError::InvalidField {
            field: "application_id",
            reason: "is too long",
        });
    }
    if let Some(expected) = expected_app_id
        && application_id != expected
    {
        return Err(SchemaError::ApplicationMismatch(application_id));
    }

    let attempts = required(&obj, "attempts")?
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(SchemaError::InvalidField {
            field: "attempts",
            reason: "must be a non-negative integer",
        })?;

    let sent = required_timestamp(&obj, "sent")?;
    let received = required_timestamp(&obj, "received")?;

    Ok(WebhookNotification {
        user_id,
        topic,
        resource: resource.to_string(),
        application_id,
        attempts,
        sent,
        received,
    })
}

fn required<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, SchemaError> {
    match obj.get(field) {
        Some(Value::Null) | None => Err(SchemaError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, SchemaError> {
    required(obj, field)?
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or(SchemaError::InvalidField {
            field,
            reason: "must be a non-empty string",
        })
}

fn required_timestamp(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, SchemaError> {
    let raw = required_str(obj, field)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SchemaError::InvalidField {
            field,
            reason: "must be an RFC 3339 timestamp",
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_body() -> Value {
        json!({
            "user_id": 123,
            "topic": "items",
            "resource": "/items/MLB123",
            "application_id": "app123",
            "attempts": 1,
            "sent": "2024-05-01T12:00:00.000Z",
            "received": "2024-05-01T12:00:00.050Z"
        })
    }

    fn parse(value: &Value) -> Result<WebhookNotification, SchemaError> {
        parse_notification(value.to_string().as_bytes(), Some("app123"))
    }

    #[test]
    fn test_valid_notification() {
        let n = parse(&valid_body()).unwrap();

        assert_eq!(n.user_id, 123);
        assert_eq!(n.topic, Topic::Items);
        assert_eq!(n.resource, "/items/MLB123");
        assert_eq!(n.attempts, 1);
    }

    #[test]
    fn test_numeric_application_id_accepted() {
        let mut body = valid_body();
        body["application_id"] = json!(5503910054141466u64);

        let n = parse_notification(body.to_string().as_bytes(), None).unwrap();
        assert_eq!(n.application_id, "5503910054141466");
    }

    #[test]
    fn test_malformed_json() {
        let err = parse_notification(b"{not json", None).unwrap_err();

        assert!(matches!(err, SchemaError::InvalidJson(_)));
        assert_eq!(err.public_message(), "Invalid JSON payload");
    }

    #[test]
    fn test_missing_topic_is_schema_error() {
        let mut body = valid_body();
        body.as_object_mut().unwrap().remove("topic");

        let err = parse(&body).unwrap_err();
        assert_eq!(err, SchemaError::MissingField("topic"));
        assert_eq!(err.public_message(), "Invalid payload schema");
    }

    #[test]
    fn test_null_field_counts_as_missing() {
        let mut body = valid_body();
        body["sent"] = Value::Null;

        assert_eq!(parse(&body).unwrap_err(), SchemaError::MissingField("sent"));
    }

    #[test]
    fn test_wrong_primitive_types() {
        let mut body = valid_body();
        body["user_id"] = json!("123");
        assert!(matches!(
            parse(&body).unwrap_err(),
            SchemaError::InvalidField { field: "user_id", .. }
        ));

        let mut body = valid_body();
        body["attempts"] = json!(-1);
        assert!(matches!(
            parse(&body).unwrap_err(),
            SchemaError::InvalidField { field: "attempts", .. }
        ));
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let mut body = valid_body();
        body["topic"] = json!("claims");

        let err = parse(&body).unwrap_err();
        assert_eq!(err, SchemaError::UnsupportedTopic("claims".to_string()));
        assert_eq!(err.public_message(), "Invalid payload schema");
    }

    #[test]
    fn test_application_mismatch() {
        let mut body = valid_body();
        body["application_id"] = json!("other-app");

        assert!(matches!(
            parse(&body).unwrap_err(),
            SchemaError::ApplicationMismatch(_)
        ));
    }

    #[test]
    fn test_relative_resource_rejected() {
        let mut body = valid_body();
        body["resource"] = json!("items/MLB123");

        assert!(matches!(
            parse(&body).unwrap_err(),
            SchemaError::InvalidField { field: "resource", .. }
        ));
    }

    #[test]
    fn test_bad_timestamp() {
        let mut body = valid_body();
        body["received"] = json!("yesterday");

        assert!(matches!(
            parse(&body).unwrap_err(),
            SchemaError::InvalidField { field: "received", .. }
        ));
    }

    #[test]
    fn test_non_object_body() {
        assert!(matches!(
            parse_notification(b"[1,2,3]", None).unwrap_err(),
            SchemaError::InvalidField { field: "body", .. }
        ));
    }
}
