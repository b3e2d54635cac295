//! Meridian client application constants
//!
//! Public client identifiers matching the first-party launcher. These
//! values are not secrets - they identify the client application tier a
//! token is minted for. The actual secrets (account passwords, device
//! secrets, tokens) never appear here.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Client id/secret pair for the exchange tier (mints other credentials).
pub const EXCHANGE_CLIENT_ID: &str = "f204c6ec88be4aabbdcb0996482bcd8f";
pub const EXCHANGE_CLIENT_SECRET: &str = "9bf31c7ff062936a96d3c8bd1f8f2ff3";

/// Client id/secret pair for the session tier (presented on API calls).
pub const SESSION_CLIENT_ID: &str = "29dbd9f83c2a44dfa9ec4173ba1ae431";
pub const SESSION_CLIENT_SECRET: &str = "6512bd43d9caa6e02c990b0a82652dca";

/// Token class requested on every grant.
pub const TOKEN_CLASS: &str = "mr1";

/// Device identifier header name.
pub const DEVICE_ID_HEADER: &str = "X-Meridian-Device-Id";

/// Anti-forgery token header for portal requests.
pub const ANTIFORGERY_HEADER: &str = "x-mrd-antiforgery";

/// Kill type selecting every session except the current one.
pub const REVOKE_OTHERS_KILL_TYPE: &str = "OTHERS_ACCOUNT_CLIENT_SERVICE";

/// `basic` authorization value for the exchange client.
pub fn exchange_basic() -> String {
    basic(EXCHANGE_CLIENT_ID, EXCHANGE_CLIENT_SECRET)
}

/// `basic` authorization value for the session client.
pub fn session_basic() -> String {
    basic(SESSION_CLIENT_ID, SESSION_CLIENT_SECRET)
}

fn basic(id: &str, secret: &str) -> String {
    format!("basic {}", STANDARD.encode(format!("{id}:{secret}")))
}

/// Base URLs for the services this crate talks to.
///
/// Overridable so tests can point the whole grant flow at a local stub.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Account service (oauth grants, device credentials, sessions).
    pub account_base: String,
    /// Web portal (interactive login handshake).
    pub portal_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            account_base: "https://account.public.meridianhq.com".to_owned(),
            portal_base: "https://www.meridianhq.com".to_owned(),
        }
    }
}
