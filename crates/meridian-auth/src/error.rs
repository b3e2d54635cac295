//! Error types for authentication operations

use meridian_wire::ServiceError;

/// Errors from credential production and renewal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Username/password, device secret or refresh secret was rejected.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Login needs a second factor and no interactive fallback is
    /// configured. `method` names the factor the account requires.
    #[error("second factor required via {method}")]
    SecondFactorRequired { method: String },

    /// The portal throttled this login attempt.
    #[error("login throttled: {0}")]
    ThrottledLogin(String),

    /// One-time code unknown, expired or already consumed. Never retried
    /// with the same code.
    #[error("one-time code expired or invalid")]
    CodeExpiredOrInvalid,

    /// The account requires a corrective action this client cannot
    /// automate.
    #[error("unsupported corrective action: {0}")]
    UnsupportedCorrectiveAction(String),

    /// A composite source was built with no authentication material.
    #[error("no authentication material configured")]
    NothingConfigured,

    /// This account needs a one-time code but none is configured and
    /// prompting is disabled.
    #[error("{0}an exchange or authorization code is required")]
    CodeRequired(String),

    /// Interactive prompt failed (closed stdin, I/O error).
    #[error("code prompt failed: {0}")]
    Prompt(String),

    /// The service rejected a step with an unhandled error envelope.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// A grant response was missing required fields.
    #[error("malformed grant response: {0}")]
    GrantParse(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
