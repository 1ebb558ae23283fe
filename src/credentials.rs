//! Access token storage shared by the HTTP and stream surfaces.
//!
//! Every replacement bumps a generation counter so callers can tell whether
//! the token they used has already been superseded by a refresh.

use std::sync::RwLock;

use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{debug, info};

/// Observable authentication state of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// A credential is held.
    Authenticated,
    /// The user logged out, or no login happened yet.
    SignedOut,
    /// Refreshing failed; the caller must send the user back to login.
    Expired {
        /// Why the session could not be renewed.
        reason: String,
    },
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

/// Snapshot of the held access token.
#[derive(Clone, Debug)]
pub struct Credential {
    /// Bearer token attached to outbound calls.
    pub token: SecretString,
    /// Monotonic counter incremented on every replacement.
    pub generation: u64,
}

#[derive(Debug)]
struct StoreInner {
    token: Option<SecretString>,
    generation: u64,
}

/// Holds the current access credential for one session.
#[derive(Debug)]
pub struct CredentialStore {
    inner: RwLock<StoreInner>,
    state: watch::Sender<AuthState>,
}

impl CredentialStore {
    /// Creates an empty store in the signed-out state.
    pub fn new() -> Self {
        let (state, _) = watch::channel(AuthState::SignedOut);
        Self {
            inner: RwLock::new(StoreInner {
                token: None,
                generation: 0,
            }),
            state,
        }
    }

    /// Creates a store already holding `token`.
    pub fn with_token(token: SecretString) -> Self {
        let store = Self::new();
        store.replace(token);
        store
    }

    /// Returns the current credential, if any.
    pub fn current(&self) -> Option<Credential> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        inner.token.as_ref().map(|token| Credential {
            token: token.clone(),
            generation: inner.generation,
        })
    }

    /// Installs a new token and returns the resulting credential.
    pub fn replace(&self, token: SecretString) -> Credential {
        let credential = {
            let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
            inner.generation += 1;
            inner.token = Some(token.clone());
            Credential {
                token,
                generation: inner.generation,
            }
        };
        debug!(
            event = "credential_replaced",
            generation = credential.generation
        );
        self.state.send_if_modified(|state| {
            if state.is_authenticated() {
                return false;
            }
            *state = AuthState::Authenticated;
            true
        });
        credential
    }

    /// Installs `token` only if the store is still at `expected_generation`.
    ///
    /// Returns `None` when a logout, expiry or another replacement happened
    /// in between; the store is left untouched.
    pub fn replace_if(&self, expected_generation: u64, token: SecretString) -> Option<Credential> {
        let credential = {
            let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
            if inner.generation != expected_generation || inner.token.is_none() {
                return None;
            }
            inner.generation += 1;
            inner.token = Some(token.clone());
            Credential {
                token,
                generation: inner.generation,
            }
        };
        debug!(
            event = "credential_replaced",
            generation = credential.generation
        );
        self.state.send_if_modified(|state| {
            if state.is_authenticated() {
                return false;
            }
            *state = AuthState::Authenticated;
            true
        });
        Some(credential)
    }

    /// Drops the token after an explicit logout.
    pub fn sign_out(&self) {
        self.clear(AuthState::SignedOut);
    }

    /// Drops the token after an unrecoverable refresh failure.
    pub fn expire(&self, reason: impl Into<String>) {
        self.clear(AuthState::Expired {
            reason: reason.into(),
        });
    }

    /// Expires the session only if the store is still at `expected_generation`.
    ///
    /// Returns `false` when the credential was already cleared or replaced.
    pub fn expire_if(&self, expected_generation: u64, reason: impl Into<String>) -> bool {
        {
            let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
            if inner.generation != expected_generation || inner.token.is_none() {
                return false;
            }
            inner.token = None;
            inner.generation += 1;
        }
        let next = AuthState::Expired {
            reason: reason.into(),
        };
        info!(event = "credential_cleared", state = ?next);
        self.state.send_replace(next);
        true
    }

    /// Returns the current auth state.
    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Subscribes to auth state changes.
    pub fn watch_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    fn clear(&self, next: AuthState) {
        {
            let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
            inner.token = None;
            inner.generation += 1;
        }
        info!(event = "credential_cleared", state = ?next);
        self.state.send_replace(next);
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{AuthState, CredentialStore};

    #[test]
    fn replace_bumps_generation_and_authenticates() {
        let store = CredentialStore::new();
        assert!(store.current().is_none());
        assert_eq!(store.state(), AuthState::SignedOut);

        let first = store.replace(SecretString::new("one".to_string()));
        let second = store.replace(SecretString::new("two".to_string()));

        assert!(second.generation > first.generation);
        let current = store.current().expect("credential");
        assert_eq!(current.token.expose_secret(), "two");
        assert_eq!(current.generation, second.generation);
        assert_eq!(store.state(), AuthState::Authenticated);
    }

    #[test]
    fn expire_clears_token_and_publishes_reason() {
        let store = CredentialStore::with_token(SecretString::new("token".to_string()));
        let mut watcher = store.watch_state();

        store.expire("refresh rejected");

        assert!(store.current().is_none());
        assert!(watcher.has_changed().expect("sender alive"));
        assert_eq!(
            *watcher.borrow_and_update(),
            AuthState::Expired {
                reason: "refresh rejected".to_string()
            }
        );
    }

    #[test]
    fn replace_if_refuses_after_sign_out() {
        let store = CredentialStore::with_token(SecretString::new("token".to_string()));
        let held = store.current().expect("credential").generation;
        store.sign_out();

        assert!(store
            .replace_if(held, SecretString::new("late".to_string()))
            .is_none());
        assert!(store.current().is_none());
        assert_eq!(store.state(), AuthState::SignedOut);
    }

    #[test]
    fn replace_if_installs_at_expected_generation() {
        let store = CredentialStore::with_token(SecretString::new("token".to_string()));
        let held = store.current().expect("credential").generation;

        let renewed = store
            .replace_if(held, SecretString::new("renewed".to_string()))
            .expect("installed");
        assert_eq!(renewed.generation, held + 1);
        assert!(store
            .replace_if(held, SecretString::new("stale".to_string()))
            .is_none());
        assert_eq!(
            store.current().expect("credential").token.expose_secret(),
            "renewed"
        );
    }

    #[test]
    fn sign_out_moves_to_signed_out() {
        let store = CredentialStore::with_token(SecretString::new("token".to_string()));
        store.sign_out();
        assert!(store.current().is_none());
        assert_eq!(store.state(), AuthState::SignedOut);
    }
}
