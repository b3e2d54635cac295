//! Resilient request execution
//!
//! Every outbound call goes through [`Session::execute`], which retries
//! per the configured [`crate::RetryPolicy`]:
//!
//! - invalid/expired credential: retry immediately when the credential
//!   was already replaced; otherwise drive the refresh (when the
//!   priority check designates this request) or wait for the active
//!   refresher
//! - rate limited (explicit Retry-After): sleep it out, coalesced
//!   across concurrent callers of the endpoint; not charged to the
//!   attempt budget
//! - capacity throttled (no Retry-After): exponential backoff, capped;
//!   not charged to the attempt budget
//! - transient server / consistency errors: linear backoff, charged
//! - connection reset: linear backoff, never charged (network blips)
//! - anything else propagates untouched
//!
//! Cumulative sleep across all classes is bounded by
//! `max_total_wait_secs`; exceeding it aborts with
//! [`Error::PolicyExceeded`] wrapping the last underlying error.
//! Retries are transparent to the caller except via elapsed time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meridian_auth::Credential;
use meridian_wire::ErrorClass;
use tracing::debug;

use crate::error::{Error, Result};
use crate::routes::EndpointKey;
use crate::session::Session;
use crate::throttle::ThrottleSlot;

/// Retry-relevant view of an executor error.
enum Class {
    InvalidCredential,
    RateLimited(f64),
    CapacityThrottled,
    Transient,
    ConnectionReset,
    Fatal,
}

fn classify(err: &Error) -> Class {
    match err {
        Error::Service(service) => match service.class() {
            ErrorClass::InvalidCredential => Class::InvalidCredential,
            ErrorClass::RateLimited => {
                Class::RateLimited(service.retry_after_secs().unwrap_or(0.0))
            }
            ErrorClass::CapacityThrottled => Class::CapacityThrottled,
            ErrorClass::Transient => Class::Transient,
            ErrorClass::Other => Class::Fatal,
        },
        Error::ConnectionReset(_) => Class::ConnectionReset,
        _ => Class::Fatal,
    }
}

fn count_retry(class: &'static str) {
    metrics::counter!("client_request_retries_total", "class" => class).increment(1);
}

impl Session {
    /// Run `op` against the live credential until it succeeds, a retry
    /// budget runs out, or a non-retryable error appears.
    pub async fn execute<T, F, Fut>(&self, key: EndpointKey, priority: i32, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<Credential>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.inner.config.retry.clone();
        let max_total_wait = policy.max_total_wait();
        let mut tries: u32 = 0;
        let mut resets: u32 = 0;
        let mut total_slept = Duration::ZERO;
        let mut backoff = policy.backoff_start_secs;

        loop {
            if self.inner.is_closing() {
                return Err(Error::Closed);
            }

            // An active throttle window on this endpoint gates every
            // caller, retries included.
            if let Some(window) = self.inner.throttles.active(&key) {
                debug!(
                    endpoint = %key,
                    wait_secs = window.remaining().as_secs_f64(),
                    "waiting for endpoint throttle window"
                );
                window.wait().await;
            }

            // Ordinary requests never run while a refresh is replacing
            // the credential.
            if priority <= 0 && self.inner.gate.wait().await.is_err() {
                return Err(self.inner.session_failed());
            }

            tries += 1;
            let (epoch, credential) = self.inner.snapshot().await?;

            let err = match op(credential).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if self.inner.is_closing() {
                return Err(err);
            }

            let mut sleep_secs = 0.0_f64;
            let mut owns_window = false;

            match classify(&err) {
                Class::InvalidCredential => {
                    count_retry("invalid_credential");
                    if tries >= policy.max_attempts {
                        return Err(err);
                    }
                    if epoch != self.inner.epoch() {
                        // Someone already replaced the credential this
                        // attempt used; retry against the live one.
                        debug!(endpoint = %key, "credential already replaced, retrying");
                        continue;
                    }
                    if self.inner.gate.may_drive(priority) {
                        debug!(endpoint = %key, priority, "stale credential detected, driving refresh");
                        self.inner.refresh(priority, Some(epoch)).await?;
                    } else if self.inner.gate.is_refreshing() {
                        debug!(endpoint = %key, "stale credential detected, waiting for the refresher");
                        if self.inner.gate.wait().await.is_err() {
                            return Err(self.inner.session_failed());
                        }
                    } else if self.inner.gate.failed() {
                        return Err(self.inner.session_failed());
                    }
                    continue;
                }
                Class::RateLimited(retry_after) => {
                    if !policy.handle_rate_limits || retry_after > policy.max_retry_after_secs {
                        return Err(err);
                    }
                    count_retry("rate_limited");
                    tries -= 1; // rate-limit waits do not consume attempts
                    let wait = retry_after + 0.5;
                    if policy.coalesce_rate_limited {
                        match self
                            .inner
                            .throttles
                            .enter(&key, Duration::from_secs_f64(wait))
                        {
                            ThrottleSlot::Owner(_) => {
                                sleep_secs = wait;
                                owns_window = true;
                            }
                            ThrottleSlot::Waiter(window) => {
                                let remaining = window.remaining();
                                total_slept += remaining;
                                if let Some(max) = max_total_wait {
                                    if total_slept > max {
                                        return Err(Error::PolicyExceeded {
                                            waited_secs: total_slept.as_secs_f64(),
                                            source: Box::new(err),
                                        });
                                    }
                                }
                                debug!(endpoint = %key, "joining shared throttle window");
                                window.wait().await;
                                continue;
                            }
                        }
                    } else {
                        sleep_secs = wait;
                    }
                }
                Class::CapacityThrottled => {
                    if !policy.handle_capacity_backoff {
                        return Err(err);
                    }
                    count_retry("capacity_throttled");
                    tries -= 1; // backoff tries are not counted either
                    sleep_secs = backoff.min(policy.backoff_cap_secs);
                    backoff *= policy.backoff_factor;
                }
                Class::Transient => {
                    count_retry("transient");
                    if tries >= policy.max_attempts {
                        return Err(err);
                    }
                    sleep_secs = 0.5 + 2.0 * f64::from(tries - 1);
                }
                Class::ConnectionReset => {
                    count_retry("connection_reset");
                    tries -= 1; // network blips are not counted
                    resets += 1;
                    sleep_secs = 0.5 + 2.0 * f64::from(resets - 1);
                }
                Class::Fatal => return Err(err),
            }

            if sleep_secs > 0.0 {
                let sleep = Duration::from_secs_f64(sleep_secs);
                total_slept += sleep;
                if let Some(max) = max_total_wait {
                    if total_slept > max {
                        if owns_window {
                            self.inner.throttles.release(&key);
                        }
                        return Err(Error::PolicyExceeded {
                            waited_secs: total_slept.as_secs_f64(),
                            source: Box::new(err),
                        });
                    }
                }
                debug!(endpoint = %key, sleep_secs, tries, "retrying request");
                tokio::time::sleep(sleep).await;
                if owns_window {
                    self.inner.throttles.release(&key);
                }
            }
        }
    }
}
