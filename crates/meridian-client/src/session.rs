//! Session lifecycle
//!
//! [`Session`] owns the live credential, the refresh coordination gate,
//! the per-endpoint throttle registry and the background refresh
//! scheduler. State machine:
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated <-> Refreshing
//!                                          |                |
//!                                          +----> Failed <--+
//! ```
//!
//! Refreshes are single-flight: every caller records the credential
//! epoch it observed, and whoever wins the gate re-checks that epoch
//! before touching the network, so N concurrent refresh demands produce
//! one grant cycle. A refresh whose secret is rejected (or that lands on
//! a throttled token endpoint) escalates to a full reauthentication
//! through the configured [`CredentialSource`]; any other failure does
//! the same unless the session is already in a refresh storm, in which
//! case the session fails terminally and the gate releases every waiter
//! with a cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meridian_auth::{AuthClient, Credential, CredentialSource, now_millis};
use meridian_wire::{ErrorClass, codes};
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::gate::PriorityGate;
use crate::throttle::ThrottleRegistry;

/// Priority used by the background scheduler and explicit refresh calls.
pub(crate) const REFRESH_PRIORITY: i32 = 1;

/// Lifecycle state, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    /// Terminal. Observable by every caller as [`Error::SessionFailed`].
    Failed,
}

/// Bounded history of refresh attempts for storm detection.
pub(crate) struct RefreshHistory {
    times: VecDeque<u64>,
    keep: usize,
}

impl RefreshHistory {
    pub(crate) fn new(keep: usize) -> Self {
        Self {
            times: VecDeque::with_capacity(keep),
            keep,
        }
    }

    fn record(&mut self, now: u64) {
        self.times.push_back(now);
        while self.times.len() > self.keep {
            self.times.pop_front();
        }
    }

    /// True when the last `keep` attempts all happened inside `window`.
    fn storming(&self, window: Duration, now: u64) -> bool {
        match self.times.front() {
            Some(oldest) if self.times.len() == self.keep => {
                now.saturating_sub(*oldest) <= window.as_millis() as u64
            }
            _ => false,
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) auth: AuthClient,
    pub(crate) http: reqwest::Client,
    pub(crate) config: SessionConfig,
    pub(crate) user_agent: String,
    source: CredentialSource,
    credential: RwLock<Option<Arc<Credential>>>,
    epoch: AtomicU64,
    refresh_count: AtomicU64,
    state: watch::Sender<SessionState>,
    pub(crate) gate: PriorityGate,
    pub(crate) throttles: ThrottleRegistry,
    refresh_requested: Arc<Notify>,
    closing: AtomicBool,
    history: Mutex<RefreshHistory>,
    failure: Mutex<Option<String>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one authenticated session. Cheap to clone; all clones
/// share the same credential, gate and throttle state.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Authenticate through `source` and start the refresh scheduler.
    pub async fn login(config: SessionConfig, source: CredentialSource) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        let user_agent = config.user_agent();
        let auth = AuthClient::new(
            http.clone(),
            config.endpoints.clone(),
            config.device_id.clone(),
            user_agent.clone(),
        );
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        let history = RefreshHistory::new(config.storm_max_attempts);
        let inner = Arc::new(SessionInner {
            auth,
            http,
            user_agent,
            source,
            credential: RwLock::new(None),
            epoch: AtomicU64::new(0),
            refresh_count: AtomicU64::new(0),
            state,
            gate: PriorityGate::new(),
            throttles: ThrottleRegistry::new(),
            refresh_requested: Arc::new(Notify::new()),
            closing: AtomicBool::new(false),
            history: Mutex::new(history),
            failure: Mutex::new(None),
            refresh_task: Mutex::new(None),
            config,
        });

        inner.set_state(SessionState::Authenticating);
        info!(source = %inner.source.identifier(), "authenticating session");
        let credential = match inner.source.authenticate(&inner.auth).await {
            Ok(credential) => credential,
            Err(err) => {
                inner.set_state(SessionState::Unauthenticated);
                return Err(Error::Auth(err));
            }
        };
        info!(subject_id = %credential.subject_id, "session authenticated");
        inner.install(credential).await;
        inner.set_state(SessionState::Authenticated);

        let session = Session { inner };
        session.spawn_refresh_scheduler();
        Ok(session)
    }

    /// Background loop racing the scheduled deadline (earliest expiry
    /// minus the refresh margin, recomputed from the live credential
    /// each cycle) against explicit refresh requests.
    fn spawn_refresh_scheduler(&self) {
        let weak = Arc::downgrade(&self.inner);
        let margin = self.inner.config.refresh_margin();
        let handle = tokio::spawn(async move {
            loop {
                let (notify, due, epoch) = {
                    let Some(inner) = weak.upgrade() else { break };
                    if inner.is_closing() || inner.state() == SessionState::Failed {
                        break;
                    }
                    let Some(credential) = inner.credential_arc().await else {
                        break;
                    };
                    (
                        inner.refresh_requested.clone(),
                        credential.refresh_due_in(margin),
                        inner.epoch(),
                    )
                };

                tokio::select! {
                    _ = notify.notified() => debug!("explicit refresh requested"),
                    _ = tokio::time::sleep(due) => debug!("scheduled refresh deadline reached"),
                }

                let Some(inner) = weak.upgrade() else { break };
                if inner.is_closing() {
                    break;
                }
                match inner.refresh(REFRESH_PRIORITY, Some(epoch)).await {
                    Ok(()) => {}
                    Err(Error::SessionFailed(cause)) => {
                        warn!(%cause, "session failed, stopping refresh scheduler");
                        break;
                    }
                    Err(err) => warn!(error = %err, "background refresh failed"),
                }
            }
            debug!("refresh scheduler stopped");
        });
        *self.inner.refresh_task.lock().unwrap() = Some(handle);
    }

    /// Coordinated refresh. Returns once a credential newer than the
    /// one currently observed is installed - whether this caller or a
    /// concurrent one did the work.
    pub async fn refresh(&self) -> Result<()> {
        let observed = self.inner.epoch();
        self.inner.refresh(REFRESH_PRIORITY, Some(observed)).await
    }

    /// Nudge the background scheduler to refresh now.
    pub fn request_refresh(&self) {
        self.inner.refresh_requested.notify_one();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Watch lifecycle transitions (e.g. to observe `Failed`).
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Completed refresh cycles.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the live credential.
    pub async fn credential(&self) -> Option<Arc<Credential>> {
        self.inner.credential_arc().await
    }

    /// Cause of the terminal failure, when the session has one.
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closing()
    }

    /// Graceful shutdown: stop the scheduler, best-effort revoke the
    /// live session token, and short-circuit every retry loop.
    pub async fn close(&self) {
        if self.inner.begin_close() {
            return;
        }
        if let Some(handle) = self.inner.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(credential) = self.inner.credential_arc().await {
            if let Err(err) = self.inner.auth.revoke_token(&credential.session_token).await {
                debug!(error = %err, "session token revocation failed during close");
            }
        }
        info!("session closed");
    }
}

impl SessionInner {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_replace(next);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Raise the closing flag. Returns the previous value.
    pub(crate) fn begin_close(&self) -> bool {
        self.closing.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) async fn credential_arc(&self) -> Option<Arc<Credential>> {
        self.credential.read().await.clone()
    }

    /// The live credential and the epoch it belongs to.
    pub(crate) async fn snapshot(&self) -> Result<(u64, Arc<Credential>)> {
        let slot = self.credential.read().await;
        match slot.as_ref() {
            Some(credential) => Ok((self.epoch.load(Ordering::SeqCst), credential.clone())),
            None => Err(Error::NotAuthenticated),
        }
    }

    /// Replace the credential atomically. Readers holding the previous
    /// `Arc` keep a consistent snapshot; new snapshots see the new pair.
    pub(crate) async fn install(&self, credential: Credential) {
        let mut slot = self.credential.write().await;
        *slot = Some(Arc::new(credential));
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// The coordinated refresh cycle. `observed_epoch` makes it
    /// single-flight: when the epoch moved before we won the gate,
    /// someone else already refreshed and this call is a no-op.
    pub(crate) async fn refresh(&self, priority: i32, observed_epoch: Option<u64>) -> Result<()> {
        if self.is_closing() {
            return Err(Error::Closed);
        }

        let guard = match self.gate.acquire(priority).await {
            Ok(guard) => guard,
            Err(_) => return Err(self.session_failed()),
        };

        if let Some(observed) = observed_epoch {
            if self.epoch() != observed {
                debug!("credential already replaced, skipping refresh");
                return Ok(());
            }
        }

        let Some(current) = self.credential_arc().await else {
            return Err(Error::NotAuthenticated);
        };

        self.set_state(SessionState::Refreshing);
        let now = now_millis();
        let storming = {
            let mut history = self.history.lock().unwrap();
            history.record(now);
            history.storming(self.config.storm_window(), now)
        };
        debug!(storming, "refreshing session credential");

        let renewed = match self.auth.refresh_credential(&current).await {
            Ok(credential) => Ok(credential),
            Err(err) if invalid_refresh_secret(&err) => {
                info!("refresh secret rejected, running full reauthentication");
                metrics::counter!("session_refreshes_total", "outcome" => "reauth").increment(1);
                self.source.authenticate(&self.auth).await
            }
            Err(err) if capacity_throttled(&err) => {
                // The token endpoint is shedding load; restart the
                // session outright instead of hammering the refresh
                // grant.
                warn!("token endpoint throttled mid-refresh, restarting session");
                metrics::counter!("session_refreshes_total", "outcome" => "restart").increment(1);
                self.source.authenticate(&self.auth).await
            }
            Err(err) if !storming => {
                warn!(error = %err, "credential refresh failed, attempting full reauthentication");
                metrics::counter!("session_refreshes_total", "outcome" => "restart").increment(1);
                self.source.authenticate(&self.auth).await
            }
            Err(err) => Err(err),
        };

        match renewed {
            Ok(credential) => {
                debug!(subject_id = %credential.subject_id, "installed refreshed credential");
                self.install(credential).await;
                self.refresh_count.fetch_add(1, Ordering::SeqCst);
                self.set_state(SessionState::Authenticated);
                metrics::counter!("session_refreshes_total", "outcome" => "success").increment(1);
                drop(guard);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "session refresh unrecoverable");
                metrics::counter!("session_refreshes_total", "outcome" => "failed").increment(1);
                let failure = self.fail(err.to_string());
                drop(guard);
                Err(failure)
            }
        }
    }

    /// Terminal failure: record the cause, publish `Failed`, and fail
    /// the gate so every queued and future waiter cancels.
    pub(crate) fn fail(&self, cause: String) -> Error {
        *self.failure.lock().unwrap() = Some(cause.clone());
        self.set_state(SessionState::Failed);
        self.gate.fail();
        Error::SessionFailed(cause)
    }

    /// The terminal error callers receive.
    pub(crate) fn session_failed(&self) -> Error {
        let cause = self
            .failure
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "session failed".to_owned());
        Error::SessionFailed(cause)
    }
}

fn invalid_refresh_secret(err: &meridian_auth::Error) -> bool {
    match err {
        meridian_auth::Error::Service(e) => {
            e.code_is(codes::INVALID_REFRESH_TOKEN) || e.status == 401
        }
        _ => false,
    }
}

fn capacity_throttled(err: &meridian_auth::Error) -> bool {
    matches!(err, meridian_auth::Error::Service(e) if e.class() == ErrorClass::CapacityThrottled)
}
