//! Credential manager: ordered rotation, validation, quota accounting.
//!
//! The manager owns the credential list in configuration order plus an
//! integer cursor. Rotation advances the cursor to the next available
//! credential, wrapping once; if a full wrap finds nothing the rotation
//! fails and the cursor stays put. State is flushed to the rotation state
//! file after every rotation and status transition.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::state::{CredentialState, RotationState, RotationStateFile};
use super::{Credential, CredentialStatus};

/// Maximum probe attempts per credential during validation.
/// Only network/transport failures are retried.
const MAX_VALIDATION_ATTEMPTS: u32 = 2;

/// Errors from credential management operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The configuration produced no credentials at all.
    #[error("no credentials configured")]
    NoCredentials,

    /// Validation left no credential usable.
    #[error("no valid credentials available")]
    NoValidCredentials,

    /// Every credential is exhausted, invalid, or disabled.
    #[error("all credentials are exhausted or unavailable")]
    AllCredentialsExhausted,
}

/// Result of probing one credential against the upstream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Authentication succeeded.
    Valid {
        /// Remaining daily downloads reported by the probe, when known.
        downloads_left: Option<i64>,
    },
    /// Authentication was rejected.
    Rejected {
        /// Upstream explanation, free of secrets.
        reason: String,
    },
    /// The account is out of downloads for the day.
    Exhausted,
    /// The probe could not reach the service.
    Unreachable {
        /// Transport-level explanation.
        reason: String,
    },
}

/// Seam for issuing lightweight authenticated probes.
///
/// Implemented by the session pool over the real upstream client, and by
/// scripted stubs in tests.
#[async_trait]
pub trait CredentialProbe {
    /// Probes the credential and reports the observed outcome.
    async fn probe(&self, credential: &Credential) -> ProbeOutcome;
}

/// Manages the ordered credential list and the rotation cursor.
#[derive(Debug)]
pub struct CredentialManager {
    credentials: Vec<Credential>,
    current_index: usize,
    last_rotation: Option<DateTime<Utc>>,
    state_file: RotationStateFile,
    /// Unknown top-level state fields, preserved across saves.
    state_extra: serde_json::Map<String, serde_json::Value>,
    /// Unknown per-credential state fields for identities still configured.
    credential_extra: HashMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl CredentialManager {
    /// Creates a manager over the loaded credential list, restoring any
    /// persisted rotation state.
    ///
    /// State entries for identities no longer present in the configuration
    /// are discarded. A stored cursor outside the credential range resets
    /// to 0. Credentials absent from the state start unknown and validate
    /// lazily on first use.
    #[must_use]
    pub fn new(credentials: Vec<Credential>, state_file: RotationStateFile) -> Self {
        let state = state_file.load();
        let mut manager = Self {
            credentials,
            current_index: 0,
            last_rotation: state.last_rotation,
            state_file,
            state_extra: state.extra.clone(),
            credential_extra: HashMap::new(),
        };
        manager.restore(state);
        manager
    }

    fn restore(&mut self, state: RotationState) {
        if state.current_index < self.credentials.len() {
            self.current_index = state.current_index;
        }

        let mut extras = HashMap::new();
        for credential in &mut self.credentials {
            let Some(saved) = state.credentials_status.get(credential.identity()) else {
                continue;
            };
            credential.status = saved.status;
            credential.downloads_left = saved.downloads_left;
            credential.last_used = saved.last_used;
            if !saved.extra.is_empty() {
                extras.insert(credential.identity().to_string(), saved.extra.clone());
            }
        }
        self.credential_extra = extras;
    }

    /// Returns the credentials in rotation order.
    #[must_use]
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Returns the number of configured credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Whether no credentials are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Returns the cursor position.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Returns the credential under the cursor, regardless of availability.
    #[must_use]
    pub fn current(&self) -> Option<&Credential> {
        self.credentials.get(self.current_index)
    }

    /// Whether any credential is currently available.
    #[must_use]
    pub fn has_available(&self) -> bool {
        self.credentials.iter().any(Credential::is_available)
    }

    /// Returns the first available credential at or after the cursor,
    /// moving the cursor onto it.
    ///
    /// Unlike [`rotate`](Self::rotate) this does not advance past an
    /// available current credential; it is how an operation picks the
    /// account it will use.
    ///
    /// # Errors
    ///
    /// [`CredentialError::NoCredentials`] when the list is empty, or
    /// [`CredentialError::AllCredentialsExhausted`] when nothing is
    /// available.
    #[instrument(skip(self))]
    pub fn acquire(&mut self) -> Result<Credential, CredentialError> {
        if self.credentials.is_empty() {
            return Err(CredentialError::NoCredentials);
        }

        let len = self.credentials.len();
        for offset in 0..len {
            let index = (self.current_index + offset) % len;
            if self.credentials[index].is_available() {
                if index != self.current_index {
                    debug!(
                        from = self.current_index,
                        to = index,
                        identity = self.credentials[index].identity(),
                        "cursor moved to next available credential"
                    );
                    self.current_index = index;
                    self.flush();
                }
                return Ok(self.credentials[index].clone());
            }
        }

        Err(CredentialError::AllCredentialsExhausted)
    }

    /// Advances the cursor to the next available credential.
    ///
    /// Wraps modulo the credential count. When a full wrap finds nothing
    /// available the rotation fails and the cursor is left unchanged.
    ///
    /// # Errors
    ///
    /// [`CredentialError::NoCredentials`] when the list is empty, or
    /// [`CredentialError::AllCredentialsExhausted`] after a fruitless wrap.
    #[instrument(skip(self))]
    pub fn rotate(&mut self) -> Result<Credential, CredentialError> {
        if self.credentials.is_empty() {
            return Err(CredentialError::NoCredentials);
        }

        let len = self.credentials.len();
        for offset in 1..=len {
            let index = (self.current_index + offset) % len;
            if self.credentials[index].is_available() {
                self.current_index = index;
                self.last_rotation = Some(Utc::now());
                info!(
                    identity = self.credentials[index].identity(),
                    index, "rotated to next credential"
                );
                self.flush();
                return Ok(self.credentials[index].clone());
            }
        }

        Err(CredentialError::AllCredentialsExhausted)
    }

    /// Records that the identified credential performed an operation.
    pub fn touch(&mut self, identity: &str) {
        if let Some(credential) = self.find_mut(identity) {
            credential.last_used = Some(Utc::now());
            self.flush();
        }
    }

    /// Accounts one successful download against the credential.
    ///
    /// Decrements the known quota and marks the credential exhausted when
    /// it reaches zero. Unknown quotas stay unknown.
    #[instrument(skip(self))]
    pub fn record_download(&mut self, identity: &str) {
        let Some(credential) = self.find_mut(identity) else {
            return;
        };

        credential.last_used = Some(Utc::now());
        if let Some(left) = credential.downloads_left {
            let left = (left - 1).max(0);
            credential.downloads_left = Some(left);
            if left == 0 {
                credential.status = CredentialStatus::Exhausted;
                info!(identity, "credential quota exhausted");
            }
        }
        self.flush();
    }

    /// Applies a probe outcome to the identified credential.
    ///
    /// | Probe result    | Status    | `downloads_left`           |
    /// |-----------------|-----------|----------------------------|
    /// | Valid           | valid     | updated when reported      |
    /// | Rejected        | invalid   | unchanged                  |
    /// | Exhausted       | exhausted | set to 0                   |
    /// | Unreachable     | unknown   | unchanged                  |
    #[instrument(skip(self, outcome), fields(outcome = ?outcome))]
    pub fn apply_outcome(&mut self, identity: &str, outcome: &ProbeOutcome) {
        let Some(credential) = self.find_mut(identity) else {
            return;
        };

        credential.last_validated = Some(Utc::now());
        match outcome {
            ProbeOutcome::Valid { downloads_left } => {
                if let Some(left) = downloads_left {
                    credential.downloads_left = Some(*left);
                }
                if credential.downloads_left == Some(0) {
                    credential.status = CredentialStatus::Exhausted;
                } else {
                    credential.status = CredentialStatus::Valid;
                }
            }
            ProbeOutcome::Rejected { reason } => {
                warn!(identity, reason, "credential rejected by upstream");
                credential.status = CredentialStatus::Invalid;
            }
            ProbeOutcome::Exhausted => {
                credential.status = CredentialStatus::Exhausted;
                credential.downloads_left = Some(0);
            }
            ProbeOutcome::Unreachable { reason } => {
                debug!(identity, reason, "probe could not reach upstream");
                credential.status = CredentialStatus::Unknown;
            }
        }
        self.flush();
    }

    /// Validates one credential, retrying transport failures.
    ///
    /// Issues up to [`MAX_VALIDATION_ATTEMPTS`] probes; only an
    /// [`ProbeOutcome::Unreachable`] result triggers another attempt. The
    /// final outcome is applied to the credential and returned.
    pub async fn validate_credential(
        &mut self,
        identity: &str,
        probe: &dyn CredentialProbe,
    ) -> Option<ProbeOutcome> {
        let credential = self
            .credentials
            .iter()
            .find(|c| c.identity() == identity)?
            .clone();

        let mut outcome = probe.probe(&credential).await;
        let mut attempt = 1;
        while matches!(outcome, ProbeOutcome::Unreachable { .. })
            && attempt < MAX_VALIDATION_ATTEMPTS
        {
            attempt += 1;
            debug!(identity, attempt, "retrying probe after transport error");
            outcome = probe.probe(&credential).await;
        }

        self.apply_outcome(identity, &outcome);
        Some(outcome)
    }

    /// Validates every credential eagerly.
    ///
    /// Returns the per-identity outcomes in rotation order. The caller
    /// decides whether an empty availability set is fatal.
    #[instrument(skip(self, probe))]
    pub async fn validate_all(
        &mut self,
        probe: &dyn CredentialProbe,
    ) -> Vec<(String, ProbeOutcome)> {
        let identities: Vec<String> = self
            .credentials
            .iter()
            .map(|c| c.identity().to_string())
            .collect();

        let mut results = Vec::with_capacity(identities.len());
        for identity in identities {
            if let Some(outcome) = self.validate_credential(&identity, probe).await {
                results.push((identity, outcome));
            }
        }
        results
    }

    fn find_mut(&mut self, identity: &str) -> Option<&mut Credential> {
        self.credentials
            .iter_mut()
            .find(|c| c.identity() == identity)
    }

    /// Writes the current state to the rotation state file, best-effort.
    fn flush(&self) {
        let state = self.snapshot();
        if let Err(error) = self.state_file.save(&state) {
            warn!(%error, "failed to persist rotation state");
        }
    }

    /// Builds the persistable view of the current state.
    #[must_use]
    pub fn snapshot(&self) -> RotationState {
        let credentials_status = self
            .credentials
            .iter()
            .map(|credential| {
                (
                    credential.identity().to_string(),
                    CredentialState {
                        last_used: credential.last_used,
                        downloads_left: credential.downloads_left,
                        status: credential.status,
                        extra: self
                            .credential_extra
                            .get(credential.identity())
                            .cloned()
                            .unwrap_or_default(),
                    },
                )
            })
            .collect();

        RotationState {
            current_index: self.current_index,
            last_rotation: self.last_rotation,
            credentials_status,
            extra: self.state_extra.clone(),
        }
    }
}
