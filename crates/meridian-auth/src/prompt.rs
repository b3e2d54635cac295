//! Interactive code prompt and code suppliers
//!
//! One-time codes can be passed literally, produced by a caller-supplied
//! async function, or typed into the console. Console prompts across all
//! sessions in the process share one lock so two sessions never
//! interleave their prompts.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

static PROMPT_LOCK: Mutex<()> = Mutex::const_new(());

/// Future returned by a code supplier function.
pub type CodeFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Where a one-time code comes from.
pub enum CodeSupplier {
    /// A code supplied up front. Single-use: if the service rejects it,
    /// authentication fails rather than re-sending it.
    Literal(String),
    /// A function resolved exactly once per authentication attempt
    /// (e.g. driving a headless browser to fetch a fresh code).
    Func(Box<dyn Fn() -> CodeFuture + Send + Sync>),
}

impl CodeSupplier {
    /// Supplier producing codes from an async function.
    pub fn func<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self::Func(Box::new(move || Box::pin(f())))
    }

    /// Resolve the supplier. Called exactly once per attempt.
    pub async fn resolve(&self) -> Result<String> {
        match self {
            Self::Literal(code) => Ok(code.clone()),
            Self::Func(f) => f().await,
        }
    }
}

impl From<String> for CodeSupplier {
    fn from(code: String) -> Self {
        Self::Literal(code)
    }
}

impl From<&str> for CodeSupplier {
    fn from(code: &str) -> Self {
        Self::Literal(code.to_owned())
    }
}

impl fmt::Debug for CodeSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(_) => f.write_str("CodeSupplier::Literal(..)"),
            Self::Func(_) => f.write_str("CodeSupplier::Func(..)"),
        }
    }
}

/// Prompt the console for one line of input.
///
/// Serialized process-wide: concurrent sessions queue on the prompt
/// lock so only one prompt is visible at a time.
pub async fn prompt_line(message: &str) -> Result<String> {
    let _guard = PROMPT_LOCK.lock().await;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(message.as_bytes())
        .await
        .map_err(|e| Error::Prompt(e.to_string()))?;
    stdout
        .flush()
        .await
        .map_err(|e| Error::Prompt(e.to_string()))?;

    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Prompt(e.to_string()))?;
    if read == 0 {
        return Err(Error::Prompt("stdin closed".to_owned()));
    }
    Ok(line.trim().to_owned())
}
