//! Credential domain: account records, configuration loading, rotation
//! state persistence, and the rotating credential manager.
//!
//! # Overview
//!
//! The credential subsystem consists of:
//! - [`Credential`] - A single upstream account with one of two auth shapes
//! - [`store`] - Loading credentials from a structured file or environment
//! - [`state`] - Rotation state persistence across process restarts
//! - [`manager`] - Ordered rotation, validation, and quota accounting

pub mod manager;
pub mod state;
pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::{CredentialError, CredentialManager, CredentialProbe, ProbeOutcome};
pub use state::{CredentialState, RotationState, RotationStateFile, StateError};
pub use store::{ConfigError, CredentialSource, LoadedCredentials};

/// Status of an upstream account credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    /// Validated against the upstream service.
    Valid,
    /// Authentication was rejected.
    Invalid,
    /// Daily download quota is used up.
    Exhausted,
    /// Not yet validated, or last probe was inconclusive.
    #[default]
    Unknown,
}

impl CredentialStatus {
    /// Returns the wire string representation used in the state file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Exhausted => "exhausted",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            "exhausted" => Ok(Self::Exhausted),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("invalid credential status: {s}")),
        }
    }
}

/// Authentication shape for a credential.
///
/// Exactly one shape is populated per credential; the store rejects
/// configuration entries carrying both. The `Debug` impl redacts the
/// secret half of each shape so logs only ever carry identity keys.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialAuth {
    /// Email/password login.
    Password {
        /// Account email address; doubles as the identity key.
        email: String,
        /// Account password.
        password: String,
    },
    /// Token login with a pre-issued user id and key.
    Token {
        /// Numeric user id; doubles as the identity key.
        user_id: String,
        /// User key paired with the id.
        user_key: String,
    },
}

impl fmt::Debug for CredentialAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { email, .. } => f
                .debug_struct("Password")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Self::Token { user_id, .. } => f
                .debug_struct("Token")
                .field("user_id", user_id)
                .field("user_key", &"<redacted>")
                .finish(),
        }
    }
}

/// A single upstream account credential with rotation bookkeeping.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Display name from the configuration file, if any.
    pub name: Option<String>,
    /// Authentication material.
    pub auth: CredentialAuth,
    /// Whether this credential participates in rotation.
    pub enabled: bool,
    /// Last known validation status.
    pub status: CredentialStatus,
    /// Remaining daily downloads; `None` when unknown.
    pub downloads_left: Option<i64>,
    /// When this credential last performed an operation.
    pub last_used: Option<DateTime<Utc>>,
    /// When this credential was last validated.
    pub last_validated: Option<DateTime<Utc>>,
}

impl Credential {
    /// Creates an enabled credential with unknown status.
    #[must_use]
    pub fn new(auth: CredentialAuth) -> Self {
        Self {
            name: None,
            auth,
            enabled: true,
            status: CredentialStatus::Unknown,
            downloads_left: None,
            last_used: None,
            last_validated: None,
        }
    }

    /// Returns the stable identity key for this credential.
    ///
    /// The email address for password credentials, the user id for token
    /// credentials. This key names the credential in the state file and in
    /// logs; secrets never appear there.
    #[must_use]
    pub fn identity(&self) -> &str {
        match &self.auth {
            CredentialAuth::Password { email, .. } => email,
            CredentialAuth::Token { user_id, .. } => user_id,
        }
    }

    /// Whether the credential can be used for the next operation.
    ///
    /// Available means: enabled, status is valid or unknown, and the known
    /// download quota is not zero.
    #[must_use]
    pub fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if !matches!(
            self.status,
            CredentialStatus::Valid | CredentialStatus::Unknown
        ) {
            return false;
        }
        self.downloads_left != Some(0)
    }
}
