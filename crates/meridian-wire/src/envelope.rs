//! Error envelope parsing and failure classification
//!
//! Meridian services return errors as a JSON object with `errorCode`,
//! `errorMessage`, `messageVars` and `numericErrorCode` fields. Some
//! endpoints (the web portal, overloaded edges) return plain text or
//! HTML instead. [`ServiceError::from_response`] handles both and the
//! classification lives on the parsed error, so retry decisions never
//! re-inspect raw bodies.

use serde::Deserialize;
use serde_json::Value;

use crate::codes;

/// Response body after content-type dispatch: JSON if the service said
/// so, raw text otherwise.
#[derive(Debug, Clone)]
pub enum Body {
    Json(Value),
    Text(String),
}

impl Body {
    /// The JSON value, if this body is JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            Body::Text(_) => None,
        }
    }

    /// Consume into a JSON value, mapping text to `Value::String`.
    pub fn into_json(self) -> Value {
        match self {
            Body::Json(v) => v,
            Body::Text(t) => Value::String(t),
        }
    }
}

/// Retry-relevant classification of a [`ServiceError`].
///
/// The executor keys its retry strategy off this, never off raw status
/// codes or message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Session token invalid or expired; a refresh should fix it.
    InvalidCredential,
    /// Throttled with an explicit Retry-After.
    RateLimited,
    /// Throttled without a Retry-After: the service is out of capacity.
    CapacityThrottled,
    /// Server-side failure worth a bounded retry.
    Transient,
    /// Everything else; propagated to the caller untouched.
    Other,
}

/// Raw envelope as it appears on the wire.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
    #[serde(rename = "messageVars", default)]
    message_vars: Vec<String>,
    #[serde(rename = "numericErrorCode")]
    numeric_error_code: Option<i64>,
    #[serde(default)]
    metadata: Value,
}

/// A failure reported by a Meridian service.
#[derive(Debug, Clone, thiserror::Error)]
#[error("service returned {status}: {message}")]
pub struct ServiceError {
    /// HTTP status of the response carrying the error.
    pub status: u16,
    /// `errorCode` from the envelope, absent for bare non-JSON errors.
    pub error_code: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Positional arguments for the message. The throttle envelope puts
    /// the retry-after seconds in the first slot.
    pub message_vars: Vec<String>,
    /// Numeric companion code, when present.
    pub numeric_code: Option<i64>,
    /// Retry-After from the response headers, in seconds.
    pub retry_after: Option<f64>,
    /// Envelope metadata (second-factor method, corrective action, ...).
    pub metadata: Value,
}

impl ServiceError {
    /// Parse a failed response into a `ServiceError`.
    ///
    /// JSON bodies go through the envelope; a JSON body without envelope
    /// fields and any text body become a code-less error so the status
    /// still classifies (the batch gateway has its own shapes, handled
    /// in [`crate::batch`]).
    pub fn from_response(status: u16, retry_after: Option<f64>, body: &Body) -> Self {
        match body {
            Body::Json(value) => {
                let envelope: Envelope =
                    serde_json::from_value(value.clone()).unwrap_or(Envelope {
                        error_code: None,
                        error_message: None,
                        message_vars: Vec::new(),
                        numeric_error_code: None,
                        metadata: Value::Null,
                    });
                let message = envelope
                    .error_message
                    .unwrap_or_else(|| format!("Unknown {status}"));
                Self {
                    status,
                    error_code: envelope.error_code,
                    message,
                    message_vars: envelope.message_vars,
                    numeric_code: envelope.numeric_error_code,
                    retry_after,
                    metadata: envelope.metadata,
                }
            }
            Body::Text(text) => Self {
                status,
                error_code: None,
                message: if text.is_empty() {
                    format!("Unknown {status}")
                } else {
                    text.clone()
                },
                message_vars: Vec::new(),
                numeric_code: None,
                retry_after,
                metadata: Value::Null,
            },
        }
    }

    /// Whether the envelope carries the given error code.
    pub fn code_is(&self, code: &str) -> bool {
        self.error_code.as_deref() == Some(code)
    }

    /// Retry-After in seconds: the header when present, otherwise the
    /// first message var (the batch gateway strips rate-limit headers
    /// and only reports the wait through the envelope).
    pub fn retry_after_secs(&self) -> Option<f64> {
        if self.retry_after.is_some() {
            return self.retry_after;
        }
        self.message_vars.first()?.parse::<f64>().ok()
    }

    /// Classify this error for the retry loop.
    pub fn class(&self) -> ErrorClass {
        match self.error_code.as_deref() {
            Some(codes::INVALID_TOKEN)
            | Some(codes::TOKEN_VERIFICATION_FAILED)
            | Some(codes::GATEWAY_UNAUTHORIZED) => ErrorClass::InvalidCredential,
            Some(codes::SERVER_ERROR) | Some(codes::CONCURRENT_MODIFICATION) => {
                ErrorClass::Transient
            }
            Some(codes::THROTTLED) => self.throttle_class(),
            _ => match self.status {
                429 => self.throttle_class(),
                500 | 502 | 503 | 504 => ErrorClass::Transient,
                _ => ErrorClass::Other,
            },
        }
    }

    fn throttle_class(&self) -> ErrorClass {
        if self.retry_after_secs().is_some() {
            ErrorClass::RateLimited
        } else {
            ErrorClass::CapacityThrottled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn error_from(status: u16, retry_after: Option<f64>, body: Value) -> ServiceError {
        ServiceError::from_response(status, retry_after, &Body::Json(body))
    }

    #[test]
    fn parses_full_envelope() {
        let err = error_from(
            401,
            None,
            json!({
                "errorCode": "errors.com.meridian.common.oauth.invalid_token",
                "errorMessage": "Sorry the token was invalid",
                "messageVars": [],
                "numericErrorCode": 1014,
            }),
        );
        assert!(err.code_is(codes::INVALID_TOKEN));
        assert_eq!(err.message, "Sorry the token was invalid");
        assert_eq!(err.numeric_code, Some(1014));
        assert_eq!(err.class(), ErrorClass::InvalidCredential);
    }

    #[test]
    fn json_without_envelope_fields_still_classifies_by_status() {
        let err = error_from(503, None, json!({"detail": "down for maintenance"}));
        assert_eq!(err.error_code, None);
        assert_eq!(err.message, "Unknown 503");
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn text_body_keeps_message() {
        let err =
            ServiceError::from_response(500, None, &Body::Text("upstream exploded".to_owned()));
        assert_eq!(err.message, "upstream exploded");
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn throttled_with_header_is_rate_limited() {
        let err = error_from(
            429,
            Some(12.0),
            json!({
                "errorCode": codes::THROTTLED,
                "errorMessage": "Operation access is limited by throttling policy",
                "messageVars": [],
            }),
        );
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after_secs(), Some(12.0));
    }

    #[test]
    fn throttled_retry_after_falls_back_to_message_vars() {
        let err = error_from(
            429,
            None,
            json!({
                "errorCode": codes::THROTTLED,
                "errorMessage": "Operation access is limited by throttling policy, please try again in 7 second(s)",
                "messageVars": ["7"],
            }),
        );
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after_secs(), Some(7.0));
    }

    #[test]
    fn throttled_without_retry_after_is_capacity() {
        let err = error_from(
            429,
            None,
            json!({
                "errorCode": codes::THROTTLED,
                "errorMessage": "No capacity available",
                "messageVars": [],
            }),
        );
        assert_eq!(err.class(), ErrorClass::CapacityThrottled);
    }

    #[test]
    fn concurrent_modification_is_transient() {
        let err = error_from(
            409,
            None,
            json!({
                "errorCode": codes::CONCURRENT_MODIFICATION,
                "errorMessage": "please try your request again",
            }),
        );
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn unknown_code_is_other() {
        let err = error_from(
            404,
            None,
            json!({
                "errorCode": "errors.com.meridian.account.account_not_found",
                "errorMessage": "no such account",
            }),
        );
        assert_eq!(err.class(), ErrorClass::Other);
    }

    #[test]
    fn second_factor_metadata_is_preserved() {
        let err = error_from(
            400,
            None,
            json!({
                "errorCode": codes::SECOND_FACTOR_REQUIRED,
                "errorMessage": "second factor required",
                "metadata": {"twoFactorMethod": "authenticator"},
            }),
        );
        assert_eq!(err.metadata["twoFactorMethod"], "authenticator");
    }
}
