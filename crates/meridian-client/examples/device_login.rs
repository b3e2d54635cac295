//! Log in with a stored device credential (falling back to an exchange
//! code prompt on first run), issue a request, and shut down cleanly.
//!
//! ```sh
//! cargo run --example device_login
//! ```

use anyhow::Context;
use meridian_client::auth::{
    CodeKind, CompositeOptions, CompositeSource, CredentialSource, DeviceCredentials,
};
use meridian_client::{ApiRequest, Route, Service, Session, SessionConfig};
use reqwest::Method;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // First run: no stored device credential, prompt for an exchange
    // code and persist the credential the service hands back. Later
    // runs: construct `CredentialSource::DeviceBound` from the stored
    // values instead.
    let stored: Option<DeviceCredentials> = None;

    let source = CredentialSource::Composite(CompositeSource {
        device: stored,
        direct: None,
        code: None,
        options: CompositeOptions {
            prompt_for_code: Some(CodeKind::Exchange),
            prompt_code_if_invalid: true,
            delete_existing_device_credentials: true,
            ..CompositeOptions::default()
        },
        on_credential_issued: Some(Box::new(|record, display| {
            // Persist these; they survive restarts until the account
            // secret is reset.
            println!(
                "store device credential for {display}: device_id={} account_id={}",
                record.device_id, record.account_id
            );
        })),
    });

    let session = Session::login(SessionConfig::default(), source)
        .await
        .context("login failed")?;

    let profile = session
        .send(ApiRequest::new(Route::service(
            Method::GET,
            Service::Account,
            "/account/api/public/account/{subject}",
        )
        .param(
            "subject",
            &session.credential().await.expect("authenticated").subject_id,
        )))
        .await
        .context("profile request failed")?;
    println!("profile: {:?}", profile.as_json());

    session.close().await;
    Ok(())
}
