//! Batch gateway request/response shapes
//!
//! The batch gateway accepts an array of named operations and answers
//! with an array of per-operation results. Failures arrive in one of
//! three shapes, dispatched strictly on the body's type:
//!
//! 1. text/HTML - the edge answered before the gateway did; the only
//!    signal is the `<title>` of the error page,
//! 2. a top-level envelope object with `status` and `message`,
//! 3. a result array where individual operations carry an `errors` list
//!    whose `serviceResponse` string embeds a nested envelope.
//!
//! All three normalize into [`ServiceError`] so the executor retries
//! batch failures exactly like plain-endpoint failures.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{Body, ServiceError};

/// `<title>503 Service Unavailable</title>` style error pages.
fn html_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)<title>((\d+)[^<]*)</title>").unwrap())
}

/// Derive the operation name from a query document.
fn operation_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?:mutation|query)\s+(\w+)").unwrap())
}

/// One named operation in a batch request.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOperation {
    #[serde(rename = "operationName")]
    pub operation_name: String,
    pub variables: Value,
    pub query: String,
}

impl BatchOperation {
    /// Build an operation, deriving the name from the query document.
    ///
    /// Returns `None` when the document declares no named operation;
    /// use [`BatchOperation::named`] for anonymous documents.
    pub fn new(query: impl Into<String>, variables: Value) -> Option<Self> {
        let query = query.into();
        let operation_name = operation_name_pattern()
            .captures(&query)?
            .get(1)?
            .as_str()
            .to_owned();
        Some(Self {
            operation_name,
            variables,
            query,
        })
    }

    /// Build an operation with an explicit name.
    pub fn named(name: impl Into<String>, query: impl Into<String>, variables: Value) -> Self {
        Self {
            operation_name: name.into(),
            variables,
            query: query.into(),
        }
    }
}

/// Normalize a batch gateway response.
///
/// On success returns the unwrapped per-operation payloads (the single
/// value under each item's `data`), in request order.
pub fn normalize_batch(status: u16, body: &Body) -> Result<Vec<Value>, ServiceError> {
    match body {
        Body::Text(text) => Err(error_from_text(status, text)),
        Body::Json(Value::Object(envelope)) => Err(error_from_envelope(status, envelope)),
        Body::Json(Value::Array(items)) => {
            if let Some(error) = items
                .iter()
                .find_map(|item| item.get("errors").and_then(Value::as_array))
                .and_then(|errors| errors.first())
            {
                return Err(error_from_operation(status, error));
            }
            Ok(items
                .iter()
                .map(|item| {
                    item.get("data")
                        .and_then(Value::as_object)
                        .and_then(|data| data.values().next().cloned())
                        .unwrap_or(Value::Null)
                })
                .collect())
        }
        Body::Json(other) => Err(ServiceError::from_response(
            status,
            None,
            &Body::Text(other.to_string()),
        )),
    }
}

/// Shape 1: the edge answered with an HTML error page.
fn error_from_text(status: u16, text: &str) -> ServiceError {
    let (message, page_status) = match html_error_pattern().captures(text) {
        Some(captures) => {
            let message = captures.get(1).map_or("Unknown reason", |m| m.as_str());
            let page_status = captures
                .get(2)
                .and_then(|m| m.as_str().parse::<u16>().ok());
            (message.to_owned(), page_status)
        }
        None => ("Unknown reason".to_owned(), None),
    };
    ServiceError {
        status: page_status.unwrap_or(status),
        error_code: None,
        message,
        message_vars: Vec::new(),
        numeric_code: None,
        retry_after: None,
        metadata: Value::Null,
    }
}

/// Shape 2: a top-level `{status, message}` envelope object.
fn error_from_envelope(status: u16, envelope: &serde_json::Map<String, Value>) -> ServiceError {
    let message = envelope
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown reason")
        .to_owned();
    let envelope_status = envelope
        .get("status")
        .and_then(Value::as_u64)
        .map(|s| s as u16);
    // The envelope's message doubles as the error code: the gateway
    // reports upstream envelope codes through this field.
    ServiceError {
        status: envelope_status.unwrap_or(status),
        error_code: Some(message.clone()),
        message,
        message_vars: Vec::new(),
        numeric_code: None,
        retry_after: None,
        metadata: Value::Null,
    }
}

/// Shape 3: a per-operation `errors` entry. Its `serviceResponse` is a
/// JSON-encoded string carrying the real envelope (or, under edge
/// failure, yet another HTML page).
fn error_from_operation(status: u16, error: &Value) -> ServiceError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown reason")
        .to_owned();
    let service_response = error
        .get("serviceResponse")
        .and_then(Value::as_str)
        .unwrap_or("");

    let mut normalized = ServiceError {
        status,
        error_code: None,
        message,
        message_vars: Vec::new(),
        numeric_code: None,
        retry_after: None,
        metadata: Value::Null,
    };

    if service_response.is_empty() {
        return normalized;
    }

    match serde_json::from_str::<Value>(service_response) {
        Ok(Value::Object(payload)) => {
            if let Some(code) = payload.get("errorCode").and_then(Value::as_str) {
                normalized.error_code = Some(code.to_owned());
            }
            if let Some(nested_message) = payload.get("errorMessage").and_then(Value::as_str) {
                normalized.message = nested_message.to_owned();
            }
            if let Some(vars) = payload.get("messageVars").and_then(Value::as_array) {
                normalized.message_vars = vars
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect();
            }
            if let Some(page_status) = payload.get("errorStatus").and_then(Value::as_u64) {
                normalized.status = page_status as u16;
            }
        }
        Ok(Value::String(html)) => {
            let inner = error_from_text(status, &html);
            normalized.message = inner.message;
            normalized.status = inner.status;
        }
        _ => {}
    }

    normalized
}
