//! Account and portal HTTP operations
//!
//! Low-level calls behind every [`crate::CredentialSource`]: oauth
//! grants, one-time exchange codes, the interactive portal handshake,
//! device-credential management and session revocation. All calls go
//! straight through `reqwest` - the resilient executor in the session
//! runtime never wraps these, so a refresh can never block on the gate
//! it is itself driving.
//!
//! Responses are dispatched on content type (JSON or text) and any
//! response with a 4xx/5xx status or an `errorCode` envelope becomes a
//! [`ServiceError`].

use meridian_wire::{Body, ServiceError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::constants::{
    ANTIFORGERY_HEADER, DEVICE_ID_HEADER, Endpoints, REVOKE_OTHERS_KILL_TYPE, TOKEN_CLASS,
    session_basic,
};
use crate::credential::{Credential, DeviceCredentialRecord};
use crate::error::{Error, Result};

/// Date supplied when the account service demands a date-of-birth
/// correction before issuing tokens.
const SYNTHETIC_DATE_OF_BIRTH: &str = "1990-01-01";

/// Response to any grant at the token endpoint.
///
/// `expires_in` / `refresh_expires_in` are deltas in seconds from the
/// response time; [`Credential::assemble`] converts them to absolute
/// unix-millisecond timestamps.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantResponse {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: String,
    #[serde(default = "default_refresh_expires_in")]
    pub refresh_expires_in: u64,
    pub account_id: String,
    #[serde(rename = "token_type", default = "default_token_class")]
    pub token_class: String,
}

fn default_refresh_expires_in() -> u64 {
    28800
}

fn default_token_class() -> String {
    TOKEN_CLASS.to_owned()
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: String,
}

#[derive(Debug, Deserialize)]
struct AntiforgeryResponse {
    token: String,
}

/// Direct HTTP client for the account service and web portal.
pub struct AuthClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    device_id: String,
    user_agent: String,
}

impl AuthClient {
    /// Build a client. `device_id` defaults to a fresh 32-char hex id
    /// when the caller has not persisted one.
    pub fn new(
        http: reqwest::Client,
        endpoints: Endpoints,
        device_id: Option<String>,
        user_agent: String,
    ) -> Self {
        let device_id =
            device_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        Self {
            http,
            endpoints,
            device_id,
            user_agent,
        }
    }

    /// The device identifier sent on grant requests.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Send a request and normalize the response.
    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<Body> {
        let response = builder
            .header(USER_AGENT, self.user_agent.as_str())
            .send()
            .await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<f64>().ok());
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        let text = response.text().await?;

        let body = if is_json {
            match serde_json::from_str(&text) {
                Ok(value) => Body::Json(value),
                Err(_) => Body::Text(text),
            }
        } else {
            Body::Text(text)
        };

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

    fn parse<T: serde::de::DeserializeOwned>(body: Body) -> Result<T> {
        let value = body.into_json();
        serde_json::from_value(value).map_err(|e| Error::GrantParse(e.to_string()))
    }

    fn account_url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoints.account_base)
    }

    fn portal_url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoints.portal_base)
    }

    // -- token endpoint ---------------------------------------------------

    /// Raw grant against the token endpoint.
    pub async fn oauth_grant(&self, basic: &str, form: &[(&str, &str)]) -> Result<GrantResponse> {
        let body = self
            .execute(
                self.http
                    .post(self.account_url("/account/api/oauth/token"))
                    .header(AUTHORIZATION, basic)
                    .header(DEVICE_ID_HEADER, self.device_id.as_str())
                    .form(form),
            )
            .await?;
        Self::parse(body)
    }

    /// Trade a refresh secret for a fresh token of the same tier.
    pub async fn grant_refresh_token(
        &self,
        refresh_token: &str,
        basic: &str,
    ) -> Result<GrantResponse> {
        self.oauth_grant(
            basic,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("token_type", TOKEN_CLASS),
            ],
        )
        .await
    }

    /// Trade a one-time exchange code for a token.
    pub async fn grant_exchange_code(&self, code: &str, basic: &str) -> Result<GrantResponse> {
        self.oauth_grant(
            basic,
            &[
                ("grant_type", "exchange_code"),
                ("exchange_code", code),
                ("token_type", TOKEN_CLASS),
            ],
        )
        .await
    }

    /// Trade a one-time authorization code for a token.
    pub async fn grant_authorization_code(
        &self,
        code: &str,
        basic: &str,
    ) -> Result<GrantResponse> {
        self.oauth_grant(basic, &[("grant_type", "authorization_code"), ("code", code)])
            .await
    }

    /// Authenticate with a device-bound credential.
    pub async fn grant_device(
        &self,
        device_id: &str,
        account_id: &str,
        secret: &str,
        basic: &str,
    ) -> Result<GrantResponse> {
        self.oauth_grant(
            basic,
            &[
                ("grant_type", "device_auth"),
                ("device_id", device_id),
                ("account_id", account_id),
                ("secret", secret),
                ("token_type", TOKEN_CLASS),
            ],
        )
        .await
    }

    /// Trade a live access token for a token of another tier.
    pub async fn grant_access_token(&self, token: &str, basic: &str) -> Result<GrantResponse> {
        self.oauth_grant(
            basic,
            &[
                ("grant_type", "token_to_token"),
                ("access_token", token),
                ("token_type", TOKEN_CLASS),
            ],
        )
        .await
    }

    /// Generate a one-time exchange code for the bearer's account.
    pub async fn generate_exchange_code(&self, bearer: &str) -> Result<String> {
        let body = self
            .execute(
                self.http
                    .get(self.account_url("/account/api/oauth/exchange"))
                    .header(AUTHORIZATION, bearer),
            )
            .await?;
        Ok(Self::parse::<CodeResponse>(body)?.code)
    }

    /// Finish an authentication cycle: trade the exchange grant for the
    /// session credential and assemble the pair.
    pub async fn mint_session(&self, exchange: GrantResponse) -> Result<Credential> {
        let bearer = format!("bearer {}", exchange.access_token);
        let code = self.generate_exchange_code(&bearer).await?;
        let session = self.grant_exchange_code(&code, &session_basic()).await?;
        debug!(subject_id = %session.account_id, "session credential minted");
        Ok(Credential::assemble(&exchange, &session))
    }

    /// Renew both tokens of a credential via their refresh secrets,
    /// exchange tier first.
    pub async fn refresh_credential(&self, current: &Credential) -> Result<Credential> {
        let exchange = self
            .grant_refresh_token(
                &current.exchange_refresh_token,
                &crate::constants::exchange_basic(),
            )
            .await?;
        let session = self
            .grant_refresh_token(&current.session_refresh_token, &session_basic())
            .await?;
        Ok(Credential::assemble(&exchange, &session))
    }

    // -- sessions ---------------------------------------------------------

    /// Revoke every session of the account except the bearer's own.
    pub async fn revoke_other_sessions(&self, bearer: &str) -> Result<()> {
        self.execute(
            self.http
                .delete(self.account_url("/account/api/oauth/sessions/kill"))
                .query(&[("killType", REVOKE_OTHERS_KILL_TYPE)])
                .header(AUTHORIZATION, bearer),
        )
        .await?;
        debug!("revoked other sessions");
        Ok(())
    }

    /// Revoke a single token (logout).
    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        self.execute(
            self.http
                .delete(self.account_url(&format!("/account/api/oauth/sessions/kill/{token}")))
                .header(AUTHORIZATION, format!("bearer {token}")),
        )
        .await?;
        Ok(())
    }

    // -- device credentials -----------------------------------------------

    /// All device credentials registered for the account.
    pub async fn list_device_credentials(
        &self,
        bearer: &str,
        account_id: &str,
    ) -> Result<Vec<DeviceCredentialRecord>> {
        let body = self
            .execute(
                self.http
                    .get(self.account_url(&format!(
                        "/account/api/public/account/{account_id}/deviceAuth"
                    )))
                    .header(AUTHORIZATION, bearer),
            )
            .await?;
        Self::parse(body)
    }

    /// Register a new device credential for this device. The response is
    /// the only time the secret is revealed.
    pub async fn create_device_credential(
        &self,
        bearer: &str,
        account_id: &str,
    ) -> Result<DeviceCredentialRecord> {
        let body = self
            .execute(
                self.http
                    .post(self.account_url(&format!(
                        "/account/api/public/account/{account_id}/deviceAuth"
                    )))
                    .header(AUTHORIZATION, bearer)
                    .header(DEVICE_ID_HEADER, self.device_id.as_str())
                    .json(&json!({})),
            )
            .await?;
        Self::parse(body)
    }

    /// Delete one device credential.
    pub async fn delete_device_credential(
        &self,
        bearer: &str,
        account_id: &str,
        device_id: &str,
    ) -> Result<()> {
        self.execute(
            self.http
                .delete(self.account_url(&format!(
                    "/account/api/public/account/{account_id}/deviceAuth/{device_id}"
                )))
                .header(AUTHORIZATION, bearer),
        )
        .await?;
        Ok(())
    }

    /// Account record (display name, email) for prompt messages and the
    /// credential-issued callback.
    pub async fn lookup_account(
        &self,
        bearer: &str,
        account_id: &str,
    ) -> Result<serde_json::Value> {
        let body = self
            .execute(
                self.http
                    .get(self.account_url(&format!("/account/api/public/account/{account_id}")))
                    .header(AUTHORIZATION, bearer),
            )
            .await?;
        Ok(body.into_json())
    }

    /// Complete a date-of-birth corrective action and allow the failed
    /// grant to be retried.
    pub async fn submit_date_of_birth_correction(
        &self,
        basic: &str,
        continuation: &str,
    ) -> Result<()> {
        self.execute(
            self.http
                .post(self.account_url("/account/api/oauth/corrections/dateOfBirth"))
                .header(AUTHORIZATION, basic)
                .json(&json!({
                    "continuation": continuation,
                    "dateOfBirth": SYNTHETIC_DATE_OF_BIRTH,
                })),
        )
        .await?;
        Ok(())
    }

    // -- portal handshake -------------------------------------------------

    /// Fetch a fresh anti-forgery token. Required before every portal
    /// mutation, and again after a second-factor interruption.
    pub async fn portal_antiforgery(&self) -> Result<String> {
        let body = self
            .execute(self.http.get(self.portal_url("/id/api/antiforgery")))
            .await?;
        Ok(Self::parse::<AntiforgeryResponse>(body)?.token)
    }

    /// Submit username and password.
    pub async fn portal_login(
        &self,
        antiforgery: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        self.execute(
            self.http
                .post(self.portal_url("/id/api/login"))
                .header(ANTIFORGERY_HEADER, antiforgery)
                .json(&json!({
                    "username": username,
                    "password": password,
                    "rememberMe": false,
                })),
        )
        .await?;
        Ok(())
    }

    /// Submit a second-factor code.
    pub async fn portal_second_factor(
        &self,
        antiforgery: &str,
        method: &str,
        code: &str,
    ) -> Result<()> {
        self.execute(
            self.http
                .post(self.portal_url("/id/api/login/second-factor"))
                .header(ANTIFORGERY_HEADER, antiforgery)
                .json(&json!({
                    "method": method,
                    "code": code,
                    "rememberDevice": false,
                })),
        )
        .await?;
        Ok(())
    }

    /// Follow the post-login redirect (binds the portal session).
    pub async fn portal_redirect(&self, antiforgery: &str) -> Result<()> {
        self.execute(
            self.http
                .get(self.portal_url("/id/api/redirect"))
                .header(ANTIFORGERY_HEADER, antiforgery),
        )
        .await?;
        Ok(())
    }

    /// Generate a one-time exchange code from the portal session.
    pub async fn portal_exchange_code(&self, antiforgery: &str) -> Result<String> {
        let body = self
            .execute(
                self.http
                    .post(self.portal_url("/id/api/exchange/generate"))
                    .header(ANTIFORGERY_HEADER, antiforgery),
            )
            .await?;
        Ok(Self::parse::<CodeResponse>(body)?.code)
    }
}
