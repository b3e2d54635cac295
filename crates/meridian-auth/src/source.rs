//! Credential sources
//!
//! The closed set of strategies that turn starting material into a
//! [`Credential`]. Each variant owns its constructor data; the
//! `Composite` variant chains the others in a fixed fallback order
//! (device-bound, then password login, then one-time code) because each
//! step trades secrecy for interactivity differently.

use common::Secret;
use meridian_wire::codes;
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::{AuthClient, GrantResponse};
use crate::constants::exchange_basic;
use crate::credential::{Credential, DeviceCredentialRecord};
use crate::error::{Error, Result};
use crate::prompt::{CodeSupplier, prompt_line};

/// Which flavor of one-time code a supplier produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Exchange,
    Authorization,
}

impl std::fmt::Display for CodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeKind::Exchange => f.write_str("exchange"),
            CodeKind::Authorization => f.write_str("authorization"),
        }
    }
}

/// Username/password material for the portal login handshake.
pub struct DirectCredentials {
    pub username: String,
    pub password: Secret<String>,
    /// Second-factor code, when the caller already has one.
    pub second_factor_code: Option<String>,
    /// Prompt the console for a missing second-factor code. When false
    /// and the account requires one, authentication fails with
    /// [`Error::SecondFactorRequired`] so the caller can supply the code
    /// and retry.
    pub prompt_second_factor: bool,
}

impl DirectCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<Secret<String>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            second_factor_code: None,
            prompt_second_factor: true,
        }
    }
}

/// Durable device-bound material, persisted by the caller between runs.
/// Revoked server-side when the account secret is reset.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub subject_id: String,
    pub secret: Secret<String>,
}

/// Post-login housekeeping and fallback policy for [`CompositeSource`].
pub struct CompositeOptions {
    /// Revoke every other active session for the account after login.
    pub revoke_other_sessions: bool,
    /// Delete previously issued device credentials before registering
    /// the new one.
    pub delete_existing_device_credentials: bool,
    /// Prompt the console for a code of this kind when no supplier is
    /// configured and the earlier steps fall through.
    pub prompt_for_code: Option<CodeKind>,
    /// Allow falling through to the code step when stored device
    /// credentials are rejected.
    pub prompt_code_if_invalid: bool,
    /// Allow falling through to the code step when the portal throttles
    /// the password login.
    pub prompt_code_if_throttled: bool,
}

impl Default for CompositeOptions {
    fn default() -> Self {
        Self {
            revoke_other_sessions: true,
            delete_existing_device_credentials: false,
            prompt_for_code: None,
            prompt_code_if_invalid: false,
            prompt_code_if_throttled: false,
        }
    }
}

/// Fired once per newly registered device credential so the caller can
/// persist it for future [`CredentialSource::DeviceBound`] logins.
pub type CredentialIssuedCallback = Box<dyn Fn(DeviceCredentialRecord, String) + Send + Sync>;

/// The fallback-chain source used by almost every real deployment.
pub struct CompositeSource {
    pub device: Option<DeviceCredentials>,
    pub direct: Option<DirectCredentials>,
    pub code: Option<(CodeKind, CodeSupplier)>,
    pub options: CompositeOptions,
    pub on_credential_issued: Option<CredentialIssuedCallback>,
}

impl CompositeSource {
    fn has_code_step(&self) -> bool {
        self.code.is_some() || self.options.prompt_for_code.is_some()
    }

    fn device_fallback_allowed(&self) -> bool {
        self.options.prompt_code_if_invalid && self.has_code_step()
    }

    fn identifier(&self) -> String {
        if let Some(direct) = &self.direct {
            direct.username.clone()
        } else if let Some(device) = &self.device {
            device.subject_id.clone()
        } else {
            "this account".to_owned()
        }
    }
}

/// A strategy producing a fresh credential pair.
pub enum CredentialSource {
    /// Username + password (+ optional second factor).
    Direct(DirectCredentials),
    /// A single-use exchange/authorization code.
    OneTimeCode { kind: CodeKind, code: CodeSupplier },
    /// Durable device-bound secret; no interaction required.
    DeviceBound(DeviceCredentials),
    /// Opaque long-lived refresh secret.
    StoredRefresh { refresh_token: Secret<String> },
    /// An existing live access token (token-to-token).
    AccessToken { token: Secret<String> },
    /// Ordered fallback chain over the above.
    Composite(CompositeSource),
}

impl CredentialSource {
    /// Run the strategy to completion, producing the credential pair.
    pub async fn authenticate(&self, auth: &AuthClient) -> Result<Credential> {
        match self {
            Self::Direct(direct) => {
                let grant = direct_exchange_grant(auth, direct).await?;
                auth.mint_session(grant).await
            }
            Self::OneTimeCode { kind, code } => {
                let resolved = code.resolve().await?;
                let grant = one_time_grant(auth, *kind, &resolved).await?;
                auth.mint_session(grant).await
            }
            Self::DeviceBound(device) => {
                let grant = device_exchange_grant(auth, device).await?;
                auth.mint_session(grant).await
            }
            Self::StoredRefresh { refresh_token } => {
                let grant = refresh_secret_grant(auth, refresh_token.expose_str()).await?;
                auth.mint_session(grant).await
            }
            Self::AccessToken { token } => {
                let grant = match auth
                    .grant_access_token(token.expose_str(), &exchange_basic())
                    .await
                {
                    Err(Error::Service(e)) if e.status == 401 => {
                        return Err(Error::InvalidCredentials(
                            "access token rejected".to_owned(),
                        ));
                    }
                    other => other?,
                };
                auth.mint_session(grant).await
            }
            Self::Composite(composite) => authenticate_composite(auth, composite).await,
        }
    }

    /// Human-readable owner of the starting material, for prompts and
    /// logs.
    pub fn identifier(&self) -> String {
        match self {
            Self::Direct(direct) => direct.username.clone(),
            Self::OneTimeCode { kind, .. } => format!("{kind}-code login"),
            Self::DeviceBound(device) => device.subject_id.clone(),
            Self::StoredRefresh { .. } => "stored-refresh login".to_owned(),
            Self::AccessToken { .. } => "access-token login".to_owned(),
            Self::Composite(composite) => composite.identifier(),
        }
    }
}

/// Portal handshake: anti-forgery token, login, optional second factor,
/// redirect, exchange code, exchange grant.
async fn direct_exchange_grant(
    auth: &AuthClient,
    direct: &DirectCredentials,
) -> Result<GrantResponse> {
    debug!(username = %direct.username, "starting portal login");
    let mut antiforgery = auth.portal_antiforgery().await?;

    match auth
        .portal_login(&antiforgery, &direct.username, direct.password.expose_str())
        .await
    {
        Ok(()) => {}
        Err(Error::Service(e)) if e.code_is(codes::INVALID_ACCOUNT_CREDENTIALS) => {
            return Err(Error::InvalidCredentials(
                "invalid account credentials".to_owned(),
            ));
        }
        Err(Error::Service(e)) if e.code_is(codes::THROTTLED) => {
            return Err(Error::ThrottledLogin(e.message.clone()));
        }
        Err(Error::Service(e)) if e.code_is(codes::SECOND_FACTOR_REQUIRED) => {
            let method = e.metadata["twoFactorMethod"]
                .as_str()
                .unwrap_or("unknown")
                .to_owned();
            debug!(method, "login interrupted, second factor required");

            // The anti-forgery token from before the interruption is
            // stale; fetch a fresh one before submitting the code.
            antiforgery = auth.portal_antiforgery().await?;

            let code = match &direct.second_factor_code {
                Some(code) => code.clone(),
                None if direct.prompt_second_factor => {
                    prompt_line(&format!(
                        "Please enter the {method} second-factor code for {}:\n",
                        direct.username
                    ))
                    .await?
                }
                None => return Err(Error::SecondFactorRequired { method }),
            };

            match auth
                .portal_second_factor(&antiforgery, &method, &code)
                .await
            {
                Ok(()) => {}
                Err(Error::Service(e))
                    if e.code_is(codes::SECOND_FACTOR_CODE_INVALID)
                        || e.code_is(codes::PORTAL_VALIDATION) =>
                {
                    return Err(Error::InvalidCredentials(
                        "invalid second-factor code".to_owned(),
                    ));
                }
                Err(other) => return Err(other),
            }
        }
        Err(other) => return Err(other),
    }

    auth.portal_redirect(&antiforgery).await?;

    let antiforgery = auth.portal_antiforgery().await?;
    let code = auth.portal_exchange_code(&antiforgery).await?;
    one_time_grant(auth, CodeKind::Exchange, &code).await
}

/// Trade a one-time code for the exchange credential.
async fn one_time_grant(auth: &AuthClient, kind: CodeKind, code: &str) -> Result<GrantResponse> {
    let result = match kind {
        CodeKind::Exchange => auth.grant_exchange_code(code, &exchange_basic()).await,
        CodeKind::Authorization => auth.grant_authorization_code(code, &exchange_basic()).await,
    };
    match result {
        Err(Error::Service(e))
            if e.code_is(codes::EXCHANGE_CODE_NOT_FOUND)
                || e.code_is(codes::AUTHORIZATION_CODE_NOT_FOUND) =>
        {
            Err(Error::CodeExpiredOrInvalid)
        }
        other => other,
    }
}

/// Device-bound grant, automating the one known corrective action.
async fn device_exchange_grant(
    auth: &AuthClient,
    device: &DeviceCredentials,
) -> Result<GrantResponse> {
    let basic = exchange_basic();
    let grant = auth
        .grant_device(
            &device.device_id,
            &device.subject_id,
            device.secret.expose_str(),
            &basic,
        )
        .await;

    match grant {
        Err(Error::Service(e)) if e.code_is(codes::INVALID_ACCOUNT_CREDENTIALS) => Err(
            Error::InvalidCredentials("invalid device credentials".to_owned()),
        ),
        Err(Error::Service(e)) if e.code_is(codes::CORRECTIVE_ACTION_REQUIRED) => {
            let action = e.metadata["correctiveAction"]
                .as_str()
                .unwrap_or("unknown")
                .to_ascii_lowercase();
            if action != "date_of_birth" {
                return Err(Error::UnsupportedCorrectiveAction(action));
            }
            let continuation = e.metadata["continuation"].as_str().unwrap_or_default();
            info!(action, "performing corrective action before retrying grant");
            auth.submit_date_of_birth_correction(&basic, continuation)
                .await?;

            // One retry of the same grant; a repeated demand is fatal.
            match auth
                .grant_device(
                    &device.device_id,
                    &device.subject_id,
                    device.secret.expose_str(),
                    &basic,
                )
                .await
            {
                Err(Error::Service(e)) if e.code_is(codes::CORRECTIVE_ACTION_REQUIRED) => {
                    Err(Error::UnsupportedCorrectiveAction(action))
                }
                Err(Error::Service(e)) if e.code_is(codes::INVALID_ACCOUNT_CREDENTIALS) => Err(
                    Error::InvalidCredentials("invalid device credentials".to_owned()),
                ),
                other => other,
            }
        }
        other => other,
    }
}

/// Trade a stored refresh secret for the exchange credential.
async fn refresh_secret_grant(auth: &AuthClient, refresh_token: &str) -> Result<GrantResponse> {
    match auth
        .grant_refresh_token(refresh_token, &exchange_basic())
        .await
    {
        Err(Error::Service(e))
            if e.code_is(codes::INVALID_REFRESH_TOKEN) || e.status == 401 =>
        {
            Err(Error::InvalidCredentials(
                "refresh token rejected".to_owned(),
            ))
        }
        other => other,
    }
}

/// The fixed fallback chain: device-bound, then password login, then
/// one-time code. Non-device logins register a fresh device credential
/// afterwards and emit it to the caller.
async fn authenticate_composite(
    auth: &AuthClient,
    composite: &CompositeSource,
) -> Result<Credential> {
    if composite.device.is_none() && composite.direct.is_none() && !composite.has_code_step() {
        return Err(Error::NothingConfigured);
    }

    let mut prompt_prefix = String::new();

    if let Some(device) = &composite.device {
        match device_exchange_grant(auth, device).await {
            Ok(grant) => {
                // Device path: nothing to register, the stored
                // credential stays the live one.
                if composite.options.revoke_other_sessions {
                    let bearer = format!("bearer {}", grant.access_token);
                    auth.revoke_other_sessions(&bearer).await?;
                }
                return auth.mint_session(grant).await;
            }
            Err(Error::InvalidCredentials(_)) if composite.device_fallback_allowed() => {
                info!("stored device credentials rejected, falling back to code login");
                prompt_prefix = "Invalid device credentials passed. ".to_owned();
            }
            Err(other) => return Err(other),
        }
    }

    let mut exchange_grant: Option<GrantResponse> = None;

    if let Some(direct) = &composite.direct {
        match direct_exchange_grant(auth, direct).await {
            Ok(grant) => exchange_grant = Some(grant),
            Err(Error::Service(e)) if e.code_is(codes::CAPTCHA_INVALID) => {
                if !composite.has_code_step() {
                    return Err(Error::CodeRequired("Captcha was enforced. ".to_owned()));
                }
                info!("captcha enforced on password login, falling back to code login");
                prompt_prefix = "Captcha was enforced. ".to_owned();
            }
            Err(Error::ThrottledLogin(_))
                if composite.options.prompt_code_if_throttled && composite.has_code_step() =>
            {
                info!("password login throttled, falling back to code login");
                prompt_prefix = "Login was throttled. ".to_owned();
            }
            Err(other) => return Err(other),
        }
    }

    let exchange_grant = match exchange_grant {
        Some(grant) => grant,
        None => {
            let (kind, code) = match (&composite.code, composite.options.prompt_for_code) {
                (Some((kind, supplier)), _) => (*kind, supplier.resolve().await?),
                (None, Some(kind)) => {
                    let message = format!(
                        "{prompt_prefix}Please enter a valid {kind} code for {}:\n",
                        composite.identifier()
                    );
                    (kind, prompt_line(&message).await?)
                }
                (None, None) => return Err(Error::CodeRequired(prompt_prefix)),
            };
            one_time_grant(auth, kind, &code).await?
        }
    };

    // Non-device login: housekeeping, then register a device credential
    // for next time.
    let bearer = format!("bearer {}", exchange_grant.access_token);

    if composite.options.revoke_other_sessions {
        auth.revoke_other_sessions(&bearer).await?;
    }

    if composite.options.delete_existing_device_credentials {
        let existing = auth
            .list_device_credentials(&bearer, &exchange_grant.account_id)
            .await?;
        for record in existing {
            auth.delete_device_credential(&bearer, &exchange_grant.account_id, &record.device_id)
                .await?;
        }
    }

    let issued = auth
        .create_device_credential(&bearer, &exchange_grant.account_id)
        .await?;
    info!(subject_id = %exchange_grant.account_id, device_id = %issued.device_id, "device credential issued");

    if let Some(callback) = &composite.on_credential_issued {
        let display = auth
            .lookup_account(&bearer, &exchange_grant.account_id)
            .await
            .ok()
            .and_then(|account| {
                account
                    .get("displayName")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| exchange_grant.account_id.clone());
        callback(issued, display);
    }

    auth.mint_session(exchange_grant).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{Endpoints, session_basic};
    use axum::extract::{Form, Path, State};
    use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// How the stub token endpoint treats device grants.
    #[derive(Clone, Copy, PartialEq)]
    enum DeviceMode {
        Accept,
        Invalid,
        CorrectiveOnce,
    }

    struct Stub {
        device_grants: AtomicUsize,
        code_grants: AtomicUsize,
        corrections: AtomicUsize,
        antiforgery: AtomicUsize,
        second_factor: Mutex<Option<(String, String)>>,
        device_mode: Mutex<DeviceMode>,
        device_registry: Mutex<Vec<String>>,
        created: AtomicUsize,
        deleted: AtomicUsize,
    }

    impl Stub {
        fn new(device_mode: DeviceMode) -> Arc<Self> {
            Arc::new(Self {
                device_grants: AtomicUsize::new(0),
                code_grants: AtomicUsize::new(0),
                corrections: AtomicUsize::new(0),
                antiforgery: AtomicUsize::new(0),
                second_factor: Mutex::new(None),
                device_mode: Mutex::new(device_mode),
                device_registry: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
                deleted: AtomicUsize::new(0),
            })
        }
    }

    fn envelope(status: StatusCode, code: &str, metadata: Value) -> Response {
        (
            status,
            Json(json!({
                "errorCode": code,
                "errorMessage": code,
                "messageVars": [],
                "metadata": metadata,
            })),
        )
            .into_response()
    }

    fn grant(prefix: &str) -> Response {
        Json(json!({
            "access_token": format!("{prefix}-token"),
            "expires_in": 7200,
            "refresh_token": format!("{prefix}-refresh"),
            "refresh_expires_in": 28800,
            "account_id": "acct-1",
            "token_type": "mr1",
        }))
        .into_response()
    }

    async fn token_endpoint(
        State(stub): State<Arc<Stub>>,
        headers: HeaderMap,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        let authorization = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        match form.get("grant_type").map(String::as_str) {
            Some("device_auth") => {
                stub.device_grants.fetch_add(1, Ordering::SeqCst);
                let mode = *stub.device_mode.lock().unwrap();
                match mode {
                    DeviceMode::Invalid => envelope(
                        StatusCode::BAD_REQUEST,
                        codes::INVALID_ACCOUNT_CREDENTIALS,
                        Value::Null,
                    ),
                    DeviceMode::CorrectiveOnce if stub.corrections.load(Ordering::SeqCst) == 0 => {
                        envelope(
                            StatusCode::BAD_REQUEST,
                            codes::CORRECTIVE_ACTION_REQUIRED,
                            json!({
                                "correctiveAction": "DATE_OF_BIRTH",
                                "continuation": "cont-1",
                            }),
                        )
                    }
                    _ => grant("device"),
                }
            }
            Some("exchange_code") => {
                stub.code_grants.fetch_add(1, Ordering::SeqCst);
                let code = form.get("exchange_code").map(String::as_str).unwrap_or("");
                if code == "expired" {
                    return envelope(
                        StatusCode::BAD_REQUEST,
                        codes::EXCHANGE_CODE_NOT_FOUND,
                        Value::Null,
                    );
                }
                if authorization == session_basic() {
                    grant("session")
                } else {
                    grant("exchange")
                }
            }
            Some("authorization_code") => {
                stub.code_grants.fetch_add(1, Ordering::SeqCst);
                if form.get("code").map(String::as_str) == Some("expired") {
                    return envelope(
                        StatusCode::BAD_REQUEST,
                        codes::AUTHORIZATION_CODE_NOT_FOUND,
                        Value::Null,
                    );
                }
                grant("exchange")
            }
            Some("refresh_token") => grant("refreshed"),
            Some("token_to_token") => grant("exchange"),
            _ => envelope(StatusCode::BAD_REQUEST, "unsupported_grant", Value::Null),
        }
    }

    async fn exchange_code_endpoint() -> Json<Value> {
        Json(json!({"code": "generated-code"}))
    }

    async fn corrections_endpoint(State(stub): State<Arc<Stub>>) -> StatusCode {
        stub.corrections.fetch_add(1, Ordering::SeqCst);
        StatusCode::NO_CONTENT
    }

    async fn list_devices(State(stub): State<Arc<Stub>>) -> Json<Value> {
        let registry = stub.device_registry.lock().unwrap();
        Json(Value::Array(
            registry
                .iter()
                .map(|id| json!({"deviceId": id, "accountId": "acct-1"}))
                .collect(),
        ))
    }

    async fn create_device(State(stub): State<Arc<Stub>>) -> Json<Value> {
        let n = stub.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("dev-{n}");
        stub.device_registry.lock().unwrap().push(id.clone());
        Json(json!({
            "deviceId": id,
            "accountId": "acct-1",
            "secret": format!("secret-{n}"),
        }))
    }

    async fn delete_device(
        State(stub): State<Arc<Stub>>,
        Path((_account, device)): Path<(String, String)>,
    ) -> StatusCode {
        stub.deleted.fetch_add(1, Ordering::SeqCst);
        stub.device_registry.lock().unwrap().retain(|d| d != &device);
        StatusCode::NO_CONTENT
    }

    async fn lookup_account_endpoint() -> Json<Value> {
        Json(json!({"id": "acct-1", "displayName": "TestPilot"}))
    }

    async fn antiforgery_endpoint(State(stub): State<Arc<Stub>>) -> Json<Value> {
        let n = stub.antiforgery.fetch_add(1, Ordering::SeqCst) + 1;
        Json(json!({"token": format!("af-{n}")}))
    }

    async fn login_endpoint(State(stub): State<Arc<Stub>>) -> Response {
        if stub.second_factor.lock().unwrap().is_some() {
            return StatusCode::NO_CONTENT.into_response();
        }
        envelope(
            StatusCode::BAD_REQUEST,
            codes::SECOND_FACTOR_REQUIRED,
            json!({"twoFactorMethod": "authenticator"}),
        )
    }

    async fn second_factor_endpoint(
        State(stub): State<Arc<Stub>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let antiforgery = headers
            .get(crate::constants::ANTIFORGERY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let code = body["code"].as_str().unwrap_or_default().to_owned();
        *stub.second_factor.lock().unwrap() = Some((antiforgery, code));
        StatusCode::NO_CONTENT
    }

    async fn start_stub(stub: Arc<Stub>) -> String {
        let app = Router::new()
            .route("/account/api/oauth/token", post(token_endpoint))
            .route("/account/api/oauth/exchange", get(exchange_code_endpoint))
            .route(
                "/account/api/oauth/corrections/dateOfBirth",
                post(corrections_endpoint),
            )
            .route(
                "/account/api/oauth/sessions/kill",
                delete(|| async { StatusCode::NO_CONTENT }),
            )
            .route(
                "/account/api/public/account/{account}/deviceAuth",
                get(list_devices).post(create_device),
            )
            .route(
                "/account/api/public/account/{account}/deviceAuth/{device}",
                delete(delete_device),
            )
            .route(
                "/account/api/public/account/{account}",
                get(lookup_account_endpoint),
            )
            .route("/id/api/antiforgery", get(antiforgery_endpoint))
            .route("/id/api/login", post(login_endpoint))
            .route("/id/api/login/second-factor", post(second_factor_endpoint))
            .route("/id/api/redirect", get(|| async { StatusCode::NO_CONTENT }))
            .route(
                "/id/api/exchange/generate",
                post(|| async { Json(json!({"code": "portal-code"})) }),
            )
            .with_state(stub);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn auth_client(base: &str) -> AuthClient {
        AuthClient::new(
            reqwest::Client::new(),
            Endpoints {
                account_base: base.to_owned(),
                portal_base: base.to_owned(),
            },
            Some("test-device".to_owned()),
            "Meridian/1.0 tests".to_owned(),
        )
    }

    fn device_credentials() -> DeviceCredentials {
        DeviceCredentials {
            device_id: "stored-device".to_owned(),
            subject_id: "acct-1".to_owned(),
            secret: "stored-secret".into(),
        }
    }

    #[tokio::test]
    async fn device_bound_authenticates_without_interaction() {
        let stub = Stub::new(DeviceMode::Accept);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let source = CredentialSource::DeviceBound(device_credentials());
        let credential = source.authenticate(&auth).await.unwrap();

        assert_eq!(credential.exchange_token, "device-token");
        assert_eq!(credential.session_token, "session-token");
        assert_eq!(credential.subject_id, "acct-1");
        assert_eq!(stub.device_grants.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn device_bound_invalid_credentials_fail_without_retry() {
        let stub = Stub::new(DeviceMode::Invalid);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let source = CredentialSource::DeviceBound(device_credentials());
        let err = source.authenticate(&auth).await.unwrap_err();

        assert!(matches!(err, Error::InvalidCredentials(_)), "got {err:?}");
        assert_eq!(
            stub.device_grants.load(Ordering::SeqCst),
            1,
            "invalid device credentials must not be retried blindly"
        );
    }

    #[tokio::test]
    async fn device_bound_corrective_action_performed_once_then_retried() {
        let stub = Stub::new(DeviceMode::CorrectiveOnce);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let source = CredentialSource::DeviceBound(device_credentials());
        let credential = source.authenticate(&auth).await.unwrap();

        assert_eq!(credential.session_token, "session-token");
        assert_eq!(stub.corrections.load(Ordering::SeqCst), 1);
        assert_eq!(stub.device_grants.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_time_code_expired_fails_and_resolves_supplier_once() {
        let stub = Stub::new(DeviceMode::Accept);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let resolves = Arc::new(AtomicUsize::new(0));
        let counted = resolves.clone();
        let source = CredentialSource::OneTimeCode {
            kind: CodeKind::Exchange,
            code: CodeSupplier::func(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok("expired".to_owned())
                }
            }),
        };

        let err = source.authenticate(&auth).await.unwrap_err();
        assert!(matches!(err, Error::CodeExpiredOrInvalid), "got {err:?}");
        assert_eq!(resolves.load(Ordering::SeqCst), 1);
        assert_eq!(
            stub.code_grants.load(Ordering::SeqCst),
            1,
            "an expired code must not be re-sent"
        );
    }

    #[tokio::test]
    async fn one_time_code_literal_mints_full_pair() {
        let stub = Stub::new(DeviceMode::Accept);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let source = CredentialSource::OneTimeCode {
            kind: CodeKind::Authorization,
            code: "fresh-code".into(),
        };
        let credential = source.authenticate(&auth).await.unwrap();
        assert_eq!(credential.exchange_token, "exchange-token");
        assert_eq!(credential.session_token, "session-token");
    }

    #[tokio::test]
    async fn direct_refreshes_antiforgery_token_for_second_factor() {
        let stub = Stub::new(DeviceMode::Accept);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let mut direct = DirectCredentials::new("pilot@example.com", "pw");
        direct.second_factor_code = Some("123456".to_owned());
        let source = CredentialSource::Direct(direct);

        let credential = source.authenticate(&auth).await.unwrap();
        assert_eq!(credential.session_token, "session-token");

        let (antiforgery, code) = stub.second_factor.lock().unwrap().clone().unwrap();
        assert_eq!(code, "123456");
        assert_eq!(
            antiforgery, "af-2",
            "second factor must use a fresh anti-forgery token, not the login's"
        );
    }

    #[tokio::test]
    async fn direct_without_code_or_prompt_surfaces_required_method() {
        let stub = Stub::new(DeviceMode::Accept);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let mut direct = DirectCredentials::new("pilot@example.com", "pw");
        direct.prompt_second_factor = false;
        let source = CredentialSource::Direct(direct);

        let err = source.authenticate(&auth).await.unwrap_err();
        assert!(
            matches!(err, Error::SecondFactorRequired { ref method } if method == "authenticator"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn composite_falls_back_from_invalid_device_to_code() {
        let stub = Stub::new(DeviceMode::Invalid);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let source = CredentialSource::Composite(CompositeSource {
            device: Some(device_credentials()),
            direct: None,
            code: Some((CodeKind::Exchange, "fallback-code".into())),
            options: CompositeOptions {
                revoke_other_sessions: false,
                prompt_code_if_invalid: true,
                ..CompositeOptions::default()
            },
            on_credential_issued: None,
        });

        let credential = source.authenticate(&auth).await.unwrap();
        assert_eq!(credential.session_token, "session-token");
        assert_eq!(stub.device_grants.load(Ordering::SeqCst), 1);
        // A fresh device credential was registered for next time.
        assert_eq!(stub.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn composite_without_fallback_propagates_device_failure() {
        let stub = Stub::new(DeviceMode::Invalid);
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let source = CredentialSource::Composite(CompositeSource {
            device: Some(device_credentials()),
            direct: None,
            code: Some((CodeKind::Exchange, "fallback-code".into())),
            options: CompositeOptions {
                revoke_other_sessions: false,
                prompt_code_if_invalid: false,
                ..CompositeOptions::default()
            },
            on_credential_issued: None,
        });

        let err = source.authenticate(&auth).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)), "got {err:?}");
        assert_eq!(stub.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn composite_reauth_with_delete_existing_leaves_one_live_credential() {
        let stub = Stub::new(DeviceMode::Accept);
        stub.device_registry
            .lock()
            .unwrap()
            .push("stale-0".to_owned());
        let base = start_stub(stub.clone()).await;
        let auth = auth_client(&base);

        let issued: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = issued.clone();
        let source = CredentialSource::Composite(CompositeSource {
            device: None,
            direct: None,
            code: Some((CodeKind::Exchange, "good-code".into())),
            options: CompositeOptions {
                revoke_other_sessions: false,
                delete_existing_device_credentials: true,
                ..CompositeOptions::default()
            },
            on_credential_issued: Some(Box::new(move |record, display| {
                sink.lock().unwrap().push((record.device_id, display));
            })),
        });

        source.authenticate(&auth).await.unwrap();
        source.authenticate(&auth).await.unwrap();

        let registry = stub.device_registry.lock().unwrap().clone();
        assert_eq!(
            registry,
            vec!["dev-2".to_owned()],
            "old device credentials must be deleted before the new one is created"
        );
        assert_eq!(stub.deleted.load(Ordering::SeqCst), 2);

        let issued = issued.lock().unwrap();
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0], ("dev-1".to_owned(), "TestPilot".to_owned()));
        assert_eq!(issued[1], ("dev-2".to_owned(), "TestPilot".to_owned()));
    }

    #[tokio::test]
    async fn composite_with_nothing_configured_fails_fast() {
        let source = CredentialSource::Composite(CompositeSource {
            device: None,
            direct: None,
            code: None,
            options: CompositeOptions::default(),
            on_credential_issued: None,
        });
        let auth = auth_client("http://127.0.0.1:9");

        let err = source.authenticate(&auth).await.unwrap_err();
        assert!(matches!(err, Error::NothingConfigured), "got {err:?}");
    }

    #[tokio::test]
    async fn stored_refresh_rejection_maps_to_invalid_credentials() {
        // Stub that rejects every refresh grant.
        async fn reject_refresh(Form(form): Form<HashMap<String, String>>) -> Response {
            assert_eq!(
                form.get("grant_type").map(String::as_str),
                Some("refresh_token")
            );
            envelope(
                StatusCode::BAD_REQUEST,
                codes::INVALID_REFRESH_TOKEN,
                Value::Null,
            )
        }
        let app = Router::new().route("/account/api/oauth/token", post(reject_refresh));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let auth = auth_client(&format!("http://{addr}"));
        let source = CredentialSource::StoredRefresh {
            refresh_token: "rt-stale".into(),
        };
        let err = source.authenticate(&auth).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)), "got {err:?}");
    }
}
