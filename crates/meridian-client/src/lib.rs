//! Meridian session runtime
//!
//! A client-side runtime that keeps one authenticated session alive
//! against the Meridian service family and issues requests against it
//! reliably under expiring credentials, rate limits, capacity
//! throttling and transient failures.
//!
//! The moving parts:
//! - [`Session`] owns the live credential, runs the background refresh
//!   scheduler and coordinates refreshes through a [`gate::PriorityGate`]
//!   (exactly one refresh in flight, ordinary requests wait, the request
//!   that discovers a stale credential drives the fix itself)
//! - `Session::execute`/`Session::send` wrap every outbound call with
//!   classification-driven retry, exponential backoff for capacity
//!   throttles and coalesced per-endpoint rate-limit windows
//!   ([`throttle::ThrottleRegistry`])
//! - [`meridian_auth::CredentialSource`] supplies the credential pair;
//!   its `Composite` variant is what real deployments use (device-bound
//!   login with interactive fallbacks, persisting a fresh device
//!   credential via callback)
//!
//! Unrecoverable failure surfaces as [`Error::SessionFailed`] on every
//! pending and future call and as [`SessionState::Failed`] on the state
//! watch; it is never retried internally.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod routes;
pub mod session;
pub mod throttle;

pub use api::ApiRequest;
pub use config::{RetryPolicy, SessionConfig};
pub use error::{Error, Result};
pub use routes::{AuthSlot, EndpointKey, Route, Service};
pub use session::{Session, SessionState};

pub use meridian_auth as auth;
pub use meridian_wire::{BatchOperation, Body, ErrorClass, ServiceError};
