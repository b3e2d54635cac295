//! Error types for the session runtime

use meridian_wire::ServiceError;

/// Errors surfaced by the session runtime.
///
/// Transient classes (`Service` errors classified rate-limited, capacity
/// throttled or transient, plus `ConnectionReset`) are normally absorbed
/// by the executor's retry loop and only appear when a policy budget is
/// exhausted. `SessionFailed` is terminal: the session stops issuing
/// requests and every pending and future caller receives it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A Meridian service rejected the request.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Credential production/renewal failed.
    #[error(transparent)]
    Auth(#[from] meridian_auth::Error),

    /// Transport-level failure other than a connection reset.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The peer closed the connection mid-request. Retried without
    /// consuming the attempt budget.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The session is unusable; no operation will be retried.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// `close()` was called; retry loops short-circuit.
    #[error("client is closed")]
    Closed,

    /// Rejected configuration.
    #[error(transparent)]
    Config(#[from] common::Error),

    /// No credential installed yet.
    #[error("session is not authenticated")]
    NotAuthenticated,

    /// The retry budget ran out. Carries the last underlying error as
    /// its source so callers can still distinguish the cause.
    #[error("retry budget exhausted after waiting {waited_secs:.1}s")]
    PolicyExceeded {
        waited_secs: f64,
        #[source]
        source: Box<Error>,
    },
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The wire-level error beneath this error, if any.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Error::Service(e) => Some(e),
            Error::Auth(meridian_auth::Error::Service(e)) => Some(e),
            Error::PolicyExceeded { source, .. } => source.service_error(),
            _ => None,
        }
    }
}
