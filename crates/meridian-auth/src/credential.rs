//! Credential model
//!
//! A [`Credential`] bundles the exchange credential (short-lived, used
//! only to mint and manage other credentials) and the session credential
//! (presented on API calls), each with its own refresh secret and
//! absolute expiry. Expiries are unix timestamps in milliseconds,
//! computed at grant time from the `expires_in` delta plus the current
//! time.
//!
//! Credentials are immutable once assembled: a refresh produces a brand
//! new value and the runtime swaps the shared `Arc`, so concurrent
//! readers always see a consistent pair.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Deserialize;

use crate::client::GrantResponse;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The authenticated state of one Meridian session.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Exchange-tier access token (mints codes, manages device
    /// credentials and sessions).
    pub exchange_token: String,
    /// Exchange token expiry, unix millis.
    pub exchange_expires_at: u64,
    /// Refresh secret for the exchange token.
    pub exchange_refresh_token: String,
    /// Session-tier access token, presented on API calls.
    pub session_token: String,
    /// Session token expiry, unix millis. The session token is never
    /// presented past this instant.
    pub session_expires_at: u64,
    /// Refresh secret for the session token.
    pub session_refresh_token: String,
    /// Account the pair was minted for.
    pub subject_id: String,
    /// Token class both grants were issued under.
    pub token_class: String,
}

impl Credential {
    /// Assemble a credential from the two grants of one authentication
    /// cycle, stamping absolute expiries.
    pub fn assemble(exchange: &GrantResponse, session: &GrantResponse) -> Self {
        let now = now_millis();
        Self {
            exchange_token: exchange.access_token.clone(),
            exchange_expires_at: now + exchange.expires_in * 1000,
            exchange_refresh_token: exchange.refresh_token.clone(),
            session_token: session.access_token.clone(),
            session_expires_at: now + session.expires_in * 1000,
            session_refresh_token: session.refresh_token.clone(),
            subject_id: session.account_id.clone(),
            token_class: session.token_class.clone(),
        }
    }

    /// The earlier of the two expiries; the refresh scheduler keys off
    /// this.
    pub fn earliest_expiry(&self) -> u64 {
        self.exchange_expires_at.min(self.session_expires_at)
    }

    /// How long until a refresh is due, given the safety margin.
    /// Zero when the deadline has already passed.
    pub fn refresh_due_in(&self, margin: Duration) -> Duration {
        let deadline = self
            .earliest_expiry()
            .saturating_sub(margin.as_millis() as u64);
        Duration::from_millis(deadline.saturating_sub(now_millis()))
    }

    /// `bearer` authorization value for the exchange token.
    pub fn exchange_bearer(&self) -> String {
        format!("bearer {}", self.exchange_token)
    }

    /// `bearer` authorization value for the session token.
    pub fn session_bearer(&self) -> String {
        format!("bearer {}", self.session_token)
    }
}

/// A device-bound credential as reported by the account service.
///
/// `secret` is only present in the response that created the
/// credential; listings omit it.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCredentialRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "accountId")]
    pub account_id: String,
    #[serde(default)]
    pub secret: Option<Secret<String>>,
}
