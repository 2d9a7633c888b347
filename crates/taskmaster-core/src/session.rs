use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::ProfileStore;
use crate::error::{SessionError, SignInError};
use crate::preference::KeyValueStore;
use crate::task::Identity;

pub const SESSION_KEY: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    Authenticated(Identity),
    Unauthenticated,
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Identity already established for this client, if any.
    async fn resolve(&self) -> Result<Option<Identity>, SignInError>;

    async fn sign_in(&self) -> Result<Identity, SignInError>;

    async fn sign_out(&self) -> Result<(), SignInError>;
}

/// Tracks who is signed in and publishes every change.
pub struct SessionGate {
    provider: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileStore>,
    state: watch::Sender<SessionState>,
}

impl SessionGate {
    pub fn new(provider: Arc<dyn IdentityProvider>, profiles: Arc<dyn ProfileStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Unknown);
        Self {
            provider,
            profiles,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.state.borrow().identity().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn require_identity(&self) -> Result<Identity, SessionError> {
        self.current_identity().ok_or(SessionError::Unauthenticated)
    }

    /// Leaves `Unknown` exactly once. Later calls return the current state.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self) -> SessionState {
        if *self.state.borrow() != SessionState::Unknown {
            return self.state();
        }

        let resolved = match self.provider.resolve().await {
            Ok(Some(identity)) => SessionState::Authenticated(identity),
            Ok(None) => SessionState::Unauthenticated,
            Err(err) => {
                warn!(error = %err, "identity resolution failed; treating as signed out");
                SessionState::Unauthenticated
            }
        };

        // A sign-in may have finished while resolution was suspended.
        self.state.send_if_modified(|current| {
            if *current == SessionState::Unknown {
                *current = resolved;
                true
            } else {
                false
            }
        });
        let state = self.state();
        info!(authenticated = state.identity().is_some(), "session resolved");
        state
    }

    #[tracing::instrument(skip(self))]
    pub async fn sign_in(&self) -> Result<Identity, SessionError> {
        let identity = match self.provider.sign_in().await {
            Ok(identity) => identity,
            Err(err) => {
                error!(error = %err, "sign-in failed");
                return Err(err.into());
            }
        };

        if let Err(err) = self.profiles.upsert_profile(&identity).await {
            warn!(uid = %identity.uid, error = %err, "profile upsert failed");
        }

        info!(uid = %identity.uid, "signed in");
        self.state
            .send_replace(SessionState::Authenticated(identity.clone()));
        Ok(identity)
    }

    /// Drops the session immediately; the provider call runs detached and
    /// the returned handle can be awaited when the caller is about to exit.
    #[tracing::instrument(skip(self))]
    pub fn sign_out(&self) -> JoinHandle<()> {
        let previous = self.state.send_replace(SessionState::Unauthenticated);
        info!(uid = ?previous.identity().map(|identity| &identity.uid), "signed out");

        let provider = self.provider.clone();
        tokio::spawn(async move {
            if let Err(err) = provider.sign_out().await {
                warn!(error = %err, "identity provider sign-out failed");
            }
        })
    }
}

/// Account the local provider signs in with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAccount {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Identity provider backed by a configured account and a persisted
/// session record.
pub struct LocalIdentityProvider {
    storage: Arc<dyn KeyValueStore>,
    account: LocalAccount,
}

impl LocalIdentityProvider {
    pub fn new(storage: Arc<dyn KeyValueStore>, account: LocalAccount) -> Self {
        Self { storage, account }
    }
}

/// Stable uid for an email address.
pub fn uid_for_email(email: &str) -> String {
    let normalized = email.trim().to_ascii_lowercase();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, normalized.as_bytes())
        .simple()
        .to_string()
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn resolve(&self) -> Result<Option<Identity>, SignInError> {
        let Some(raw) = self.storage.get_item(SESSION_KEY) else {
            return Ok(None);
        };
        match serde_json::from_str::<Identity>(&raw) {
            Ok(identity) => Ok(Some(identity)),
            Err(err) => {
                warn!(error = %err, "discarding unreadable session record");
                Ok(None)
            }
        }
    }

    async fn sign_in(&self) -> Result<Identity, SignInError> {
        let Some(email) = self
            .account
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
        else {
            debug!("no account email configured");
            return Err(SignInError::Cancelled);
        };

        let identity = Identity {
            uid: uid_for_email(email),
            display_name: self
                .account
                .name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            email: Some(email.to_string()),
        };

        let record = serde_json::to_string(&identity).map_err(|err| SignInError::Failed {
            message: err.to_string(),
        })?;
        self.storage
            .set_item(SESSION_KEY, &record)
            .map_err(|err| SignInError::Failed {
                message: format!("{err:#}"),
            })?;
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), SignInError> {
        self.storage
            .remove_item(SESSION_KEY)
            .map_err(|err| SignInError::Failed {
                message: format!("{err:#}"),
            })
    }
}
