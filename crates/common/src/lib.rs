//! Common types for the Meridian client workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
