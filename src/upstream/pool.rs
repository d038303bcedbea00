//! Session pool: one cached authenticated session per credential.
//!
//! The pool fronts the credential manager. `current()` returns the session
//! for the manager's current credential, creating it lazily; `rotate()`
//! advances the manager first. Sessions are discarded and rebuilt with
//! `refresh()` when the upstream rejects them mid-operation.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, instrument};

use super::client::{UpstreamClient, UpstreamSession};
use super::error::UpstreamError;
use crate::auth::{Credential, CredentialError, CredentialManager, ProbeOutcome};

/// Errors from session pool operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The credential manager could not supply a credential.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Creating a session for a credential failed.
    #[error("failed to establish session for '{identity}': {source}")]
    Login {
        /// Identity key of the credential that failed.
        identity: String,
        /// The underlying upstream error.
        #[source]
        source: UpstreamError,
    },

    /// No configured credential has the given identity.
    #[error("no credential with identity '{identity}'")]
    UnknownIdentity {
        /// The identity that was requested.
        identity: String,
    },
}

/// Pool of authenticated sessions keyed by credential identity.
///
/// Logically single-consumer: one operation drives the pool at a time.
#[derive(Debug)]
pub struct SessionPool {
    client: UpstreamClient,
    manager: CredentialManager,
    sessions: HashMap<String, UpstreamSession>,
}

impl SessionPool {
    /// Creates a pool over a client and a credential manager.
    #[must_use]
    pub fn new(client: UpstreamClient, manager: CredentialManager) -> Self {
        Self {
            client,
            manager,
            sessions: HashMap::new(),
        }
    }

    /// Read access to the credential manager.
    #[must_use]
    pub fn manager(&self) -> &CredentialManager {
        &self.manager
    }

    /// Write access to the credential manager (status marking, quota
    /// accounting).
    pub fn manager_mut(&mut self) -> &mut CredentialManager {
        &mut self.manager
    }

    /// Returns the session for the current credential, creating it lazily.
    ///
    /// # Errors
    ///
    /// [`SessionError::Credential`] when no credential is available,
    /// [`SessionError::Login`] when session creation fails.
    #[instrument(skip(self))]
    pub async fn current(&mut self) -> Result<(Credential, UpstreamSession), SessionError> {
        let credential = self.manager.acquire()?;
        let session = self.ensure_session(&credential).await?;
        Ok((credential, session))
    }

    /// Rotates to the next available credential and returns its session.
    ///
    /// # Errors
    ///
    /// Same as [`current`](Self::current); rotation failures surface as
    /// [`SessionError::Credential`].
    #[instrument(skip(self))]
    pub async fn rotate(&mut self) -> Result<(Credential, UpstreamSession), SessionError> {
        let credential = self.manager.rotate()?;
        let session = self.ensure_session(&credential).await?;
        Ok((credential, session))
    }

    /// Discards and recreates the session for a credential.
    ///
    /// Used when the upstream returns an auth error mid-operation.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownIdentity`] when the identity is not
    /// configured, [`SessionError::Login`] when re-login fails.
    #[instrument(skip(self))]
    pub async fn refresh(&mut self, identity: &str) -> Result<UpstreamSession, SessionError> {
        self.sessions.remove(identity);
        let credential = self
            .manager
            .credentials()
            .iter()
            .find(|c| c.identity() == identity)
            .cloned()
            .ok_or_else(|| SessionError::UnknownIdentity {
                identity: identity.to_string(),
            })?;
        debug!(identity, "rebuilding session");
        self.ensure_session(&credential).await
    }

    /// Drops a cached session without recreating it.
    pub fn drop_session(&mut self, identity: &str) {
        self.sessions.remove(identity);
    }

    /// Probes every credential, mirroring the manager's validation table.
    ///
    /// Returns the per-identity outcomes in rotation order.
    #[instrument(skip(self))]
    pub async fn validate_all(&mut self) -> Vec<(String, ProbeOutcome)> {
        let client = self.client.clone();
        self.manager.validate_all(&client).await
    }

    async fn ensure_session(
        &mut self,
        credential: &Credential,
    ) -> Result<UpstreamSession, SessionError> {
        let identity = credential.identity().to_string();
        if let Some(session) = self.sessions.get(&identity) {
            return Ok(session.clone());
        }

        let session =
            self.client
                .login(credential)
                .await
                .map_err(|source| SessionError::Login {
                    identity: identity.clone(),
                    source,
                })?;
        self.sessions.insert(identity, session.clone());
        Ok(session)
    }
}
