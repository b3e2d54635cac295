//! Meridian authentication library
//!
//! Produces and renews the credential pair used against the Meridian
//! service family: a short-lived exchange credential (used only to mint
//! other credentials) and the session credential presented on API calls.
//! This crate is a standalone library with no dependency on the session
//! runtime - it performs its own direct HTTP against the account and
//! portal endpoints and can be tested independently.
//!
//! Credential flow:
//! 1. A [`CredentialSource`] variant turns starting material (password,
//!    one-time code, device secret, stored refresh secret) into an
//!    exchange-credential grant
//! 2. The grant is traded for a session credential via a one-time
//!    exchange code ([`AuthClient::mint_session`])
//! 3. The runtime later renews both tokens with
//!    [`AuthClient::grant_refresh_token`]
//! 4. `Composite` sources register a device-bound credential after the
//!    first interactive login and emit it through a callback so the
//!    caller can persist it

pub mod client;
pub mod constants;
pub mod credential;
pub mod error;
pub mod prompt;
pub mod source;

pub use client::{AuthClient, GrantResponse};
pub use constants::Endpoints;
pub use credential::{Credential, DeviceCredentialRecord, now_millis};
pub use error::{Error, Result};
pub use prompt::{CodeSupplier, prompt_line};
pub use source::{
    CodeKind, CompositeOptions, CompositeSource, CredentialSource, DeviceCredentials,
    DirectCredentials,
};
