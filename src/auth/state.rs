//! Rotation state persistence.
//!
//! The rotation state is a small, human-readable JSON document recording
//! the current credential cursor and per-credential bookkeeping. Saves are
//! atomic (sibling temp file, fsync, rename) and owner-only on POSIX.
//! A corrupt file is reported as a warning and replaced by empty state on
//! the next save; it never fails the caller.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::CredentialStatus;

/// Errors raised while persisting rotation state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem I/O failed.
    #[error("failed to write state file '{path}': {source}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization failed.
    #[error("failed to serialize rotation state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-credential slice of the rotation state, keyed by identity.
///
/// Unknown fields read from disk are preserved on the next save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CredentialState {
    /// When the credential last performed an operation.
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    /// Remaining daily downloads; `null` when unknown.
    #[serde(default)]
    pub downloads_left: Option<i64>,
    /// Last known status.
    #[serde(default)]
    pub status: CredentialStatus,
    /// Fields this version does not understand, carried through verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Persisted rotation state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RotationState {
    /// Index of the current credential. May exceed the configured set size
    /// after credentials are removed; the manager clamps on load.
    #[serde(default)]
    pub current_index: usize,
    /// When the cursor last advanced.
    #[serde(default)]
    pub last_rotation: Option<DateTime<Utc>>,
    /// Per-credential bookkeeping keyed by identity.
    #[serde(default)]
    pub credentials_status: BTreeMap<String, CredentialState>,
    /// Fields this version does not understand, carried through verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Handle on the rotation state file.
#[derive(Debug, Clone)]
pub struct RotationStateFile {
    path: PathBuf,
}

impl RotationStateFile {
    /// Creates a handle for the given path. Nothing is touched on disk.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the state file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the state file currently exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the stored state.
    ///
    /// Returns empty state when the file is absent. When the file exists
    /// but fails parsing, logs a warning and returns empty state; the
    /// caller proceeds as on first run.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    #[must_use]
    pub fn load(&self) -> RotationState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no rotation state file, starting fresh");
                return RotationState::default();
            }
            Err(error) => {
                warn!(%error, "failed to read rotation state, starting fresh");
                return RotationState::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(error) => {
                warn!(%error, "rotation state file is corrupt, starting fresh");
                RotationState::default()
            }
        }
    }

    /// Saves the state atomically.
    ///
    /// Writes a sibling temp file, fsyncs, then renames over the target.
    /// On POSIX the file mode is restricted to the owner; elsewhere the
    /// restriction is best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when serialization or any filesystem step
    /// fails. The temp file is removed on failure.
    #[instrument(skip(self, state), fields(path = %self.path.display()))]
    pub fn save(&self, state: &RotationState) -> Result<(), StateError> {
        let payload = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let temp_path = self.temp_path();
        let result = self.write_temp(&temp_path, &payload);
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
            return result;
        }

        fs::rename(&temp_path, &self.path).map_err(|source| {
            let _ = fs::remove_file(&temp_path);
            StateError::Io {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map_or_else(
            || std::ffi::OsString::from("rotation-state"),
            std::ffi::OsStr::to_os_string,
        );
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_temp(&self, temp_path: &Path, payload: &[u8]) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: temp_path.to_path_buf(),
            source,
        };

        let mut file = fs::File::create(temp_path).map_err(io_err)?;
        file.write_all(payload).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp_path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_state() -> RotationState {
        let mut credentials_status = BTreeMap::new();
        credentials_status.insert(
            "user1@example.com".to_string(),
            CredentialState {
                last_used: Some(Utc.with_ymd_and_hms(2025, 1, 2, 15, 4, 5).unwrap()),
                downloads_left: Some(8),
                status: CredentialStatus::Valid,
                extra: serde_json::Map::new(),
            },
        );
        credentials_status.insert(
            "123456".to_string(),
            CredentialState {
                last_used: Some(Utc.with_ymd_and_hms(2025, 1, 2, 15, 0, 0).unwrap()),
                downloads_left: Some(0),
                status: CredentialStatus::Exhausted,
                extra: serde_json::Map::new(),
            },
        );
        RotationState {
            current_index: 1,
            last_rotation: Some(Utc.with_ymd_and_hms(2025, 1, 2, 15, 4, 5).unwrap()),
            credentials_status,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_load_absent_file_returns_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = RotationStateFile::new(dir.path().join("state.json"));

        let state = file.load();
        assert_eq!(state, RotationState::default());
        assert!(!file.exists());
    }

    #[test]
    fn test_save_then_load_round_trips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let file = RotationStateFile::new(dir.path().join("state.json"));

        let state = sample_state();
        file.save(&state).unwrap();

        let loaded = file.load();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_corrupt_file_returns_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let file = RotationStateFile::new(&path);
        assert_eq!(file.load(), RotationState::default());
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{
                "current_index": 2,
                "future_flag": true,
                "credentials_status": {
                    "a@example.com": {
                        "status": "valid",
                        "downloads_left": 3,
                        "vendor_hint": "keep-me"
                    }
                }
            }"#,
        )
        .unwrap();

        let file = RotationStateFile::new(&path);
        let state = file.load();
        assert_eq!(state.current_index, 2);
        assert_eq!(
            state.extra.get("future_flag"),
            Some(&serde_json::Value::Bool(true))
        );

        file.save(&state).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("future_flag"));
        assert!(raw.contains("vendor_hint"));
    }

    #[test]
    fn test_missing_fields_assume_defaults() {
        let state: RotationState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.current_index, 0);
        assert!(state.last_rotation.is_none());
        assert!(state.credentials_status.is_empty());

        let cred: CredentialState =
            serde_json::from_str(r#"{"downloads_left": 5}"#).unwrap();
        assert_eq!(cred.status, CredentialStatus::Unknown);
        assert_eq!(cred.downloads_left, Some(5));
    }

    #[test]
    fn test_status_uses_lowercase_wire_strings() {
        let state = sample_state();
        let raw = serde_json::to_string(&state).unwrap();
        assert!(raw.contains("\"valid\""));
        assert!(raw.contains("\"exhausted\""));
    }

    #[cfg(unix)]
    #[test]
    fn test_save_restricts_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let file = RotationStateFile::new(&path);
        file.save(&RotationState::default()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let file = RotationStateFile::new(dir.path().join("state.json"));
        file.save(&sample_state()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
