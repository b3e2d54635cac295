//! HTTP request surface
//!
//! [`ApiRequest`] describes one call against a [`Route`]; `Session::send`
//! runs it through the resilient executor, resolving the route's
//! authorization slot against the live credential snapshot on every
//! attempt (a retry after a refresh automatically picks up the new
//! token). Responses are json-or-text by content type; error envelopes
//! become [`Error::Service`] so the executor can classify them.

use std::sync::Arc;

use meridian_auth::Credential;
use meridian_auth::constants::{DEVICE_ID_HEADER, exchange_basic, session_basic};
use meridian_wire::{BatchOperation, Body, ServiceError, normalize_batch};
use reqwest::Method;
use reqwest::header::{ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::routes::{AuthSlot, Route, Service};
use crate::session::{Session, SessionInner};

/// One outbound call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub route: Route,
    priority: i32,
    body: Option<Value>,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    send_device_id: bool,
}

impl ApiRequest {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            priority: 0,
            body: None,
            query: Vec::new(),
            headers: Vec::new(),
            send_device_id: false,
        }
    }

    /// JSON request body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a query parameter. Booleans stringify lowercase, matching
    /// what the services expect.
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_owned(), value.to_string()));
        self
    }

    /// Add a request header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Elevated requests skip the refresh-idle wait and may drive a
    /// refresh themselves. Defaults to 0 (ordinary).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Send the device identifier header with this request.
    pub fn with_device_id(mut self) -> Self {
        self.send_device_id = true;
        self
    }
}

impl Session {
    /// Execute a request with retry, refresh and throttle handling.
    pub async fn send(&self, request: ApiRequest) -> Result<Body> {
        let key = request.route.key();
        let priority = request.priority;
        let inner = self.inner.clone();
        let request = Arc::new(request);
        self.execute(key, priority, move |credential| {
            let inner = inner.clone();
            let request = request.clone();
            async move { perform(&inner, &request, credential).await }
        })
        .await
    }

    /// Run a set of named operations against the batch gateway.
    ///
    /// Returns the per-operation payloads in request order. All three
    /// gateway error shapes normalize into the standard classification,
    /// so batch failures retry exactly like plain-endpoint failures.
    pub async fn batch(&self, operations: Vec<BatchOperation>) -> Result<Vec<Value>> {
        self.batch_at(Route::service(Method::POST, Service::Gateway, ""), operations)
            .await
    }

    /// `batch` against an explicit route (custom gateway deployments).
    pub async fn batch_at(
        &self,
        route: Route,
        operations: Vec<BatchOperation>,
    ) -> Result<Vec<Value>> {
        let key = route.key();
        let inner = self.inner.clone();
        let payload = Arc::new(
            operations
                .iter()
                .map(|op| {
                    serde_json::json!({
                        "operationName": op.operation_name,
                        "variables": op.variables,
                        "query": op.query,
                    })
                })
                .collect::<Vec<_>>(),
        );
        let route = Arc::new(route);
        self.execute(key, 0, move |credential| {
            let inner = inner.clone();
            let payload = payload.clone();
            let route = route.clone();
            async move {
                let mut builder = inner
                    .http
                    .request(route.method.clone(), route.url())
                    .header(USER_AGENT, inner.user_agent.as_str())
                    .header(ACCEPT_LANGUAGE, "en-US")
                    .json(payload.as_ref());
                if let Some(slot) = route.auth {
                    builder = builder.header(AUTHORIZATION, authorization(slot, &credential));
                }
                let response = builder.send().await.map_err(map_transport)?;
                let status = response.status().as_u16();
                let body = read_body(response).await?;
                normalize_batch(status, &body).map_err(Error::Service)
            }
        })
        .await
    }
}

/// Build and send one attempt of a plain request.
async fn perform(
    inner: &SessionInner,
    request: &ApiRequest,
    credential: Arc<Credential>,
) -> Result<Body> {
    let mut builder = inner
        .http
        .request(request.route.method.clone(), request.route.url())
        .header(USER_AGENT, inner.user_agent.as_str())
        .header(ACCEPT_LANGUAGE, "en-US");

    if let Some(slot) = request.route.auth {
        builder = builder.header(AUTHORIZATION, authorization(slot, &credential));
    }
    if request.send_device_id {
        builder = builder.header(DEVICE_ID_HEADER, inner.auth.device_id());
    }
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.query.is_empty() {
        builder = builder.query(&request.query);
    }
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let started = std::time::Instant::now();
    let response = builder.send().await.map_err(map_transport)?;
    let status = response.status().as_u16();
    debug!(
        method = %request.route.method,
        url = request.route.url(),
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );

    let retry_after = retry_after_header(&response);
    let body = read_body(response).await?;

    let has_error_code = body
        .as_json()
        .is_some_and(|value| value.get("errorCode").is_some());
    if status >= 400 || has_error_code {
        return Err(Error::Service(ServiceError::from_response(
            status,
            retry_after,
            &body,
        )));
    }
    Ok(body)
}

/// Resolve an authorization slot against the live credential.
fn authorization(slot: AuthSlot, credential: &Credential) -> String {
    match slot {
        AuthSlot::ExchangeBasic => exchange_basic(),
        AuthSlot::SessionBasic => session_basic(),
        AuthSlot::ExchangeBearer => credential.exchange_bearer(),
        AuthSlot::SessionBearer => credential.session_bearer(),
    }
}

fn retry_after_header(response: &reqwest::Response) -> Option<f64> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<f64>().ok())
}

/// Json-or-text by content type.
async fn read_body(response: reqwest::Response) -> Result<Body> {
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("application/json"));
    let text = response.text().await.map_err(map_transport)?;
    if is_json {
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Body::Json(value)),
            Err(_) => Ok(Body::Text(text)),
        }
    } else {
        Ok(Body::Text(text))
    }
}

/// Split connection resets from other transport failures: resets are
/// retried without consuming the attempt budget. Detection walks the
/// error source chain for the platform's reset/abort kinds instead of
/// matching numeric OS error codes.
fn map_transport(err: reqwest::Error) -> Error {
    if is_connection_reset(&err) {
        Error::ConnectionReset(err.to_string())
    } else {
        Error::Transport(err)
    }
}

fn is_connection_reset(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = std::error::Error::source(cause);
    }
    false
}
