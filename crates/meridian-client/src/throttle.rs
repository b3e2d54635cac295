//! Per-endpoint throttle coalescing
//!
//! When an endpoint answers with a rate limit, the first caller to see
//! it installs a [`ThrottleWindow`] keyed by the endpoint's identity
//! (method + unsubstituted path template, so parameterized routes share
//! one window). Every other caller of that endpoint waits on the same
//! window instead of sleeping independently: N concurrent callers, one
//! wait. Windows are ephemeral - removed by the owner when its sleep
//! ends, or reclaimed lazily once expired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::routes::EndpointKey;

/// A shared wait handle for one throttling episode on one endpoint.
pub struct ThrottleWindow {
    ends_at: Instant,
    released: watch::Sender<bool>,
}

impl ThrottleWindow {
    fn new(duration: Duration) -> Self {
        let (released, _) = watch::channel(false);
        Self {
            ends_at: Instant::now() + duration,
            released,
        }
    }

    /// Wait until the owner releases the window, or until it expires
    /// (covers an owner whose task was cancelled mid-sleep).
    pub async fn wait(&self) {
        let mut rx = self.released.subscribe();
        tokio::select! {
            _ = rx.wait_for(|released| *released) => {}
            _ = tokio::time::sleep_until(self.ends_at) => {}
        }
    }

    /// Time left until the window expires on its own.
    pub fn remaining(&self) -> Duration {
        self.ends_at.saturating_duration_since(Instant::now())
    }

    fn release(&self) {
        let _ = self.released.send(true);
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.ends_at
    }
}

/// Outcome of [`ThrottleRegistry::enter`].
pub enum ThrottleSlot {
    /// This caller installed the window: it sleeps the retry-after and
    /// must call [`ThrottleRegistry::release`] afterwards.
    Owner(Arc<ThrottleWindow>),
    /// Another caller owns the episode; wait on its window.
    Waiter(Arc<ThrottleWindow>),
}

/// Registry of live throttle windows, keyed by endpoint identity.
pub struct ThrottleRegistry {
    windows: Mutex<HashMap<EndpointKey, Arc<ThrottleWindow>>>,
    installs: std::sync::atomic::AtomicU64,
}

impl Default for ThrottleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            installs: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// The live window for this endpoint, if any. Expired windows are
    /// pruned on the way out.
    pub fn active(&self, key: &EndpointKey) -> Option<Arc<ThrottleWindow>> {
        let mut windows = self.windows.lock().unwrap();
        if let Some(window) = windows.get(key) {
            if window.expired() {
                windows.remove(key);
                return None;
            }
            return Some(window.clone());
        }
        None
    }

    /// Join the throttling episode for `key`, installing a window of
    /// `duration` when none is live. First writer wins.
    pub fn enter(&self, key: &EndpointKey, duration: Duration) -> ThrottleSlot {
        let mut windows = self.windows.lock().unwrap();
        if let Some(existing) = windows.get(key) {
            if !existing.expired() {
                return ThrottleSlot::Waiter(existing.clone());
            }
        }
        let window = Arc::new(ThrottleWindow::new(duration));
        windows.insert(key.clone(), window.clone());
        self.installs
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(endpoint = %key, wait_secs = duration.as_secs_f64(), "throttle window installed");
        ThrottleSlot::Owner(window)
    }

    /// End the episode: remove the window and wake all waiters.
    pub fn release(&self, key: &EndpointKey) {
        let removed = self.windows.lock().unwrap().remove(key);
        if let Some(window) = removed {
            window.release();
            debug!(endpoint = %key, "throttle window released");
        }
    }

    /// Windows installed over the registry's lifetime.
    pub fn installs(&self) -> u64 {
        self.installs.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    fn key(template: &str) -> EndpointKey {
        EndpointKey {
            method: Method::GET,
            identity: format!("https://example.test{template}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_callers_share_one_window() {
        let registry = Arc::new(ThrottleRegistry::new());
        let key = key("/catalog/{item}");
        let start = Instant::now();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                match registry.enter(&key, Duration::from_millis(2500)) {
                    ThrottleSlot::Owner(_) => {
                        tokio::time::sleep(Duration::from_millis(2500)).await;
                        registry.release(&key);
                        true
                    }
                    ThrottleSlot::Waiter(window) => {
                        window.wait().await;
                        false
                    }
                }
            }));
        }

        let mut owners = 0;
        for task in tasks {
            if task.await.unwrap() {
                owners += 1;
            }
        }

        assert_eq!(owners, 1, "exactly one caller owns the episode");
        assert_eq!(registry.installs(), 1);
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_resume_on_release() {
        let registry = ThrottleRegistry::new();
        let key = key("/news");

        let ThrottleSlot::Owner(_) = registry.enter(&key, Duration::from_secs(30)) else {
            panic!("fresh key must be owned");
        };
        let ThrottleSlot::Waiter(window) = registry.enter(&key, Duration::from_secs(30)) else {
            panic!("second enter must wait");
        };

        let start = Instant::now();
        registry.release(&key);
        window.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO, "release wakes immediately");
        assert!(registry.active(&key).is_none(), "window pruned on release");
    }

    #[tokio::test(start_paused = true)]
    async fn window_expires_without_release() {
        let registry = ThrottleRegistry::new();
        let key = key("/stats/{subject}");

        let ThrottleSlot::Owner(window) = registry.enter(&key, Duration::from_secs(2)) else {
            panic!("fresh key must be owned");
        };

        // Owner never calls release (cancelled mid-sleep); waiters
        // still resume once the window runs out.
        let start = Instant::now();
        window.wait().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        // And the stale entry is reclaimed lazily.
        assert!(registry.active(&key).is_none());
        assert!(matches!(
            registry.enter(&key, Duration::from_secs(1)),
            ThrottleSlot::Owner(_)
        ));
    }

    #[tokio::test]
    async fn different_endpoints_do_not_share_windows() {
        let registry = ThrottleRegistry::new();
        let first = key("/friends");
        let second = key("/party/{id}");

        assert!(matches!(
            registry.enter(&first, Duration::from_secs(5)),
            ThrottleSlot::Owner(_)
        ));
        assert!(matches!(
            registry.enter(&second, Duration::from_secs(5)),
            ThrottleSlot::Owner(_)
        ));
        assert_eq!(registry.installs(), 2);
    }
}
