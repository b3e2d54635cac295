//! Wire-level error shapes for the Meridian service family
//!
//! Every Meridian service reports failures through the same JSON envelope
//! (`errorCode` / `errorMessage` / `messageVars` / `numericErrorCode`).
//! This crate parses that envelope into [`ServiceError`], classifies it
//! into the retry-relevant [`ErrorClass`] set, and normalizes the batch
//! gateway's three error shapes into the same classification. It is a
//! standalone leaf crate so both the auth and client crates share one
//! notion of "what kind of failure is this".

pub mod batch;
pub mod codes;
pub mod envelope;

pub use batch::{BatchOperation, normalize_batch};
pub use envelope::{Body, ErrorClass, ServiceError};
