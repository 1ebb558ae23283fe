//! Single-flight access token refresh.
//!
//! At most one refresh call is in flight per session. Callers that observe an
//! auth rejection while a refresh is running join it and receive the same
//! outcome. A failed refresh clears the credential store and every waiter
//! gets the failure; nothing retries it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use secrecy::SecretString;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::retry::with_timeout;

/// Why a refresh could not produce a new credential.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The refresh endpoint answered with a non-success status.
    #[error("refresh rejected with status {status}: {detail}")]
    Rejected { status: u16, detail: String },

    /// The refresh call exceeded its deadline.
    #[error("refresh timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The refresh request could not be sent or read.
    #[error("refresh request failed: {0}")]
    Transport(String),

    /// The refresh response did not contain a usable token.
    #[error("refresh response invalid: {0}")]
    Parse(String),

    /// The store holds no credential, so there is nothing to renew.
    #[error("session is signed out")]
    SignedOut,

    /// The refresh task stopped before finishing.
    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

/// Performs the actual refresh call.
///
/// The HTTP implementation lives in [`crate::api::client::HttpTokenRefresher`].
pub trait TokenRefresher: Send + Sync + 'static {
    /// Requests a fresh access token.
    fn refresh(&self) -> BoxFuture<'static, Result<SecretString, RefreshFailure>>;
}

type RefreshOutcome = Result<Credential, RefreshFailure>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Coordinates refreshes so concurrent rejections share one refresh call.
pub struct RefreshCoordinator {
    credentials: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    timeout: Duration,
    in_flight: Arc<Mutex<Option<SharedRefresh>>>,
}

impl RefreshCoordinator {
    /// Creates a coordinator bound to `credentials`.
    ///
    /// `timeout` bounds each refresh call; exceeding it is a hard failure.
    pub fn new(
        credentials: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            refresher,
            timeout,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a credential newer than `rejected_generation`.
    ///
    /// Joins the running refresh when there is one. When the rejected
    /// credential was already replaced, returns the current one without
    /// refreshing again.
    pub async fn refresh_after_rejection(&self, rejected_generation: u64) -> RefreshOutcome {
        let pending = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(pending) => {
                    debug!(event = "token_refresh_joined", rejected_generation);
                    pending.clone()
                }
                None => {
                    match self.credentials.current() {
                        Some(current) if current.generation != rejected_generation => {
                            debug!(
                                event = "token_already_refreshed",
                                rejected_generation,
                                generation = current.generation
                            );
                            return Ok(current);
                        }
                        None => return Err(RefreshFailure::SignedOut),
                        Some(_) => {}
                    }
                    let pending = self.start_refresh(rejected_generation);
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Returns `true` while a refresh call is running.
    pub fn is_refreshing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    fn start_refresh(&self, started_generation: u64) -> SharedRefresh {
        let credentials = Arc::clone(&self.credentials);
        let refresher = Arc::clone(&self.refresher);
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = self.timeout;

        // Runs detached so callers that give up do not cancel it for others.
        let task = tokio::spawn({
            let credentials = Arc::clone(&credentials);
            let in_flight = Arc::clone(&in_flight);
            async move {
                info!(event = "token_refresh_started");
                let outcome = match with_timeout(timeout, refresher.refresh()).await {
                    Ok(Ok(token)) => match credentials.replace_if(started_generation, token) {
                        Some(credential) => Ok(credential),
                        None => {
                            // Logged out, expired or re-logged-in while refreshing.
                            debug!(event = "token_refresh_discarded", started_generation);
                            credentials.current().ok_or(RefreshFailure::SignedOut)
                        }
                    },
                    Ok(Err(failure)) => Err(failure),
                    Err(_) => Err(RefreshFailure::Timeout(timeout)),
                };
                match &outcome {
                    Ok(credential) => {
                        info!(
                            event = "token_refresh_succeeded",
                            generation = credential.generation
                        );
                    }
                    Err(failure) => {
                        warn!(event = "token_refresh_failed", error = %failure);
                        credentials.expire_if(started_generation, failure.to_string());
                    }
                }
                lock(&in_flight).take();
                outcome
            }
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let failure = RefreshFailure::Aborted(err.to_string());
                    credentials.expire_if(started_generation, failure.to_string());
                    lock(&in_flight).take();
                    Err(failure)
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("timeout", &self.timeout)
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::future::{join_all, BoxFuture, FutureExt};
    use secrecy::{ExposeSecret, SecretString};

    use super::{RefreshCoordinator, RefreshFailure, TokenRefresher};
    use crate::credentials::{AuthState, CredentialStore};

    struct FakeRefresher {
        calls: AtomicUsize,
        delay: Duration,
        result: Result<String, RefreshFailure>,
    }

    impl FakeRefresher {
        fn new(delay: Duration, result: Result<&str, RefreshFailure>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                result: result.map(str::to_string),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenRefresher for FakeRefresher {
        fn refresh(&self) -> BoxFuture<'static, Result<SecretString, RefreshFailure>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            let result = self.result.clone();
            async move {
                tokio::time::sleep(delay).await;
                result.map(SecretString::new)
            }
            .boxed()
        }
    }

    fn setup(refresher: Arc<FakeRefresher>) -> (Arc<CredentialStore>, Arc<RefreshCoordinator>) {
        let store = Arc::new(CredentialStore::with_token(SecretString::new(
            "stale".to_string(),
        )));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            refresher,
            Duration::from_secs(5),
        ));
        (store, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_rejections_share_one_refresh() {
        let refresher = FakeRefresher::new(Duration::from_millis(100), Ok("fresh"));
        let (store, coordinator) = setup(Arc::clone(&refresher));
        let stale = store.current().expect("credential").generation;

        let results = join_all(
            (0..8).map(|_| {
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.refresh_after_rejection(stale).await }
            }),
        )
        .await;

        assert_eq!(refresher.calls(), 1);
        for result in results {
            let credential = result.expect("refreshed");
            assert_eq!(credential.token.expose_secret(), "fresh");
            assert!(credential.generation > stale);
        }
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_clears_store_and_fails_all_waiters() {
        let rejected = RefreshFailure::Rejected {
            status: 401,
            detail: "session expired".to_string(),
        };
        let refresher = FakeRefresher::new(Duration::from_millis(50), Err(rejected.clone()));
        let (store, coordinator) = setup(Arc::clone(&refresher));
        let stale = store.current().expect("credential").generation;

        let results = join_all((0..4).map(|_| coordinator.refresh_after_rejection(stale))).await;

        for result in results {
            assert_eq!(result.expect_err("hard failure"), rejected);
        }
        assert!(store.current().is_none());
        assert!(matches!(store.state(), AuthState::Expired { .. }));

        let late = coordinator.refresh_after_rejection(stale).await;
        assert_eq!(late.expect_err("signed out"), RefreshFailure::SignedOut);
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_times_out_as_hard_failure() {
        let refresher = FakeRefresher::new(Duration::from_secs(60), Ok("never"));
        let (store, coordinator) = setup(Arc::clone(&refresher));
        let stale = store.current().expect("credential").generation;

        let result = coordinator.refresh_after_rejection(stale).await;

        assert_eq!(
            result.expect_err("timeout"),
            RefreshFailure::Timeout(Duration::from_secs(5))
        );
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn superseded_credential_skips_refresh() {
        let refresher = FakeRefresher::new(Duration::ZERO, Ok("unused"));
        let (store, coordinator) = setup(Arc::clone(&refresher));
        let stale = store.current().expect("credential").generation;
        store.replace(SecretString::new("newer".to_string()));

        let credential = coordinator
            .refresh_after_rejection(stale)
            .await
            .expect("current credential");

        assert_eq!(credential.token.expose_secret(), "newer");
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_refresh_discards_the_new_token() {
        let refresher = FakeRefresher::new(Duration::from_millis(100), Ok("fresh"));
        let (store, coordinator) = setup(Arc::clone(&refresher));
        let stale = store.current().expect("credential").generation;

        let pending = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.refresh_after_rejection(stale).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.sign_out();

        let result = pending.await.expect("refresh task");
        assert_eq!(result.expect_err("signed out"), RefreshFailure::SignedOut);
        assert!(store.current().is_none());
        assert_eq!(store.state(), AuthState::SignedOut);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_after_logout_keeps_signed_out_state() {
        let refresher = FakeRefresher::new(
            Duration::from_millis(100),
            Err(RefreshFailure::Transport("connection reset".to_string())),
        );
        let (store, coordinator) = setup(Arc::clone(&refresher));
        let stale = store.current().expect("credential").generation;

        let pending = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.refresh_after_rejection(stale).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.sign_out();

        assert!(pending.await.expect("refresh task").is_err());
        assert_eq!(store.state(), AuthState::SignedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn later_burst_triggers_a_new_refresh() {
        let refresher = FakeRefresher::new(Duration::from_millis(10), Ok("fresh"));
        let (store, coordinator) = setup(Arc::clone(&refresher));
        let first = store.current().expect("credential").generation;

        let renewed = coordinator
            .refresh_after_rejection(first)
            .await
            .expect("first refresh");
        coordinator
            .refresh_after_rejection(renewed.generation)
            .await
            .expect("second refresh");

        assert_eq!(refresher.calls(), 2);
    }
}
