//! Credential configuration loading.
//!
//! Credentials come from exactly one source, chosen deterministically:
//! a structured multi-credential file when present, otherwise a single
//! credential from environment variables. Malformed files fail with a
//! [`ConfigError`] naming the offending line; no partial set is produced.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

use super::{Credential, CredentialAuth};

/// Default structured credential file, looked up in the working directory.
pub const DEFAULT_CREDENTIALS_FILE: &str = "zshelf_credentials.toml";

/// Environment variable for the email of a password credential.
pub const ENV_EMAIL: &str = "ZSHELF_EMAIL";
/// Environment variable for the password of a password credential.
pub const ENV_PASSWORD: &str = "ZSHELF_PASSWORD";
/// Environment variable for the user id of a token credential.
pub const ENV_USER_ID: &str = "ZSHELF_USER_ID";
/// Environment variable for the user key of a token credential.
pub const ENV_USER_KEY: &str = "ZSHELF_USER_KEY";

/// Errors raised while loading credential configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither a structured file nor environment credentials exist.
    #[error(
        "no credential configuration found; create '{DEFAULT_CREDENTIALS_FILE}' or set \
         {ENV_EMAIL}/{ENV_PASSWORD} or {ENV_USER_ID}/{ENV_USER_KEY}"
    )]
    NotFound,

    /// The credential file could not be read.
    #[error("failed to read credential file '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The credential file is malformed.
    #[error("invalid credential file at line {line}: {message}")]
    Parse {
        /// 1-indexed line the problem was detected on.
        line: usize,
        /// What is wrong, naming the field where applicable.
        message: String,
    },

    /// Two enabled entries share the same identity key.
    #[error("duplicate credential identity '{identity}'")]
    Duplicate {
        /// The repeated identity key.
        identity: String,
    },

    /// Environment variables form no complete credential.
    #[error("incomplete environment credentials: {message}")]
    Environment {
        /// Which variable combination is missing.
        message: String,
    },
}

/// Where credentials are loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// A structured multi-credential file.
    Structured(PathBuf),
    /// A single credential from environment variables.
    Environment,
}

/// Result of loading a credential source.
#[derive(Debug, Clone)]
pub struct LoadedCredentials {
    /// Enabled credentials in file order.
    pub credentials: Vec<Credential>,
    /// How many entries were skipped because `enabled = false`.
    pub disabled: usize,
    /// Optional `state_file` override from the structured file.
    pub state_file: Option<PathBuf>,
}

/// Chooses the credential source for the current environment.
///
/// The structured file wins when it exists; otherwise the environment is
/// used when either variable pair is at least partially set. This is a
/// pure decision over observable state, not exception control flow.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] when no source is detectable.
pub fn detect_source(dir: &Path) -> Result<CredentialSource, ConfigError> {
    let file = dir.join(DEFAULT_CREDENTIALS_FILE);
    if file.exists() {
        return Ok(CredentialSource::Structured(file));
    }

    let any_env = [ENV_EMAIL, ENV_PASSWORD, ENV_USER_ID, ENV_USER_KEY]
        .iter()
        .any(|name| env::var_os(name).is_some_and(|v| !v.is_empty()));
    if any_env {
        return Ok(CredentialSource::Environment);
    }

    Err(ConfigError::NotFound)
}

/// Loads credentials from the given source.
///
/// Disabled entries are omitted from the returned list but counted for
/// diagnostics. An empty enabled set is returned without error.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read or parsed, or
/// when the environment holds no complete credential.
#[instrument(skip(source))]
pub fn load(source: &CredentialSource) -> Result<LoadedCredentials, ConfigError> {
    match source {
        CredentialSource::Structured(path) => {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let loaded = parse_credentials_str(&raw)?;
            debug!(
                enabled = loaded.credentials.len(),
                disabled = loaded.disabled,
                "credentials loaded from file"
            );
            Ok(loaded)
        }
        CredentialSource::Environment => {
            let credential = load_from_env()?;
            debug!(identity = credential.identity(), "credential loaded from environment");
            Ok(LoadedCredentials {
                credentials: vec![credential],
                disabled: 0,
                state_file: None,
            })
        }
    }
}

/// Partially-parsed `[[credentials]]` table.
#[derive(Debug, Default)]
struct EntryFields {
    header_line: usize,
    name: Option<String>,
    email: Option<String>,
    password: Option<String>,
    user_id: Option<String>,
    user_key: Option<String>,
    enabled: Option<bool>,
}

/// Parses the structured credential file format.
///
/// Recognized top-level key: `state_file`. Each `[[credentials]]` table
/// accepts `name`, `email`, `password`, `user_id`, `user_key`, `enabled`.
fn parse_credentials_str(raw: &str) -> Result<LoadedCredentials, ConfigError> {
    let mut credentials = Vec::new();
    let mut disabled = 0usize;
    let mut state_file: Option<PathBuf> = None;
    let mut seen: HashSet<String> = HashSet::new();
    let mut entry: Option<EntryFields> = None;

    for (index, raw_line) in raw.lines().enumerate() {
        let line_no = index + 1;
        let line = strip_inline_comment(raw_line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "[[credentials]]" {
            if let Some(done) = entry.take() {
                finish_entry(done, &mut credentials, &mut disabled, &mut seen)?;
            }
            entry = Some(EntryFields {
                header_line: line_no,
                ..EntryFields::default()
            });
            continue;
        }

        if line.starts_with('[') {
            return Err(ConfigError::Parse {
                line: line_no,
                message: format!("unknown section '{line}', expected [[credentials]]"),
            });
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(ConfigError::Parse {
                line: line_no,
                message: "expected key = value".to_string(),
            });
        };
        let key = raw_key.trim();
        let value = raw_value.trim();

        match entry.as_mut() {
            None => match key {
                "state_file" => {
                    state_file = Some(PathBuf::from(parse_string_literal(value, line_no, key)?));
                }
                _ => {
                    return Err(ConfigError::Parse {
                        line: line_no,
                        message: format!("unknown top-level field '{key}'"),
                    });
                }
            },
            Some(fields) => match key {
                "name" => fields.name = Some(parse_string_literal(value, line_no, key)?),
                "email" => fields.email = Some(parse_string_literal(value, line_no, key)?),
                "password" => fields.password = Some(parse_string_literal(value, line_no, key)?),
                "user_id" => fields.user_id = Some(parse_string_literal(value, line_no, key)?),
                "user_key" => fields.user_key = Some(parse_string_literal(value, line_no, key)?),
                "enabled" => fields.enabled = Some(parse_boolean(value, line_no, key)?),
                _ => {
                    return Err(ConfigError::Parse {
                        line: line_no,
                        message: format!("unknown credential field '{key}'"),
                    });
                }
            },
        }
    }

    if let Some(done) = entry.take() {
        finish_entry(done, &mut credentials, &mut disabled, &mut seen)?;
    }

    Ok(LoadedCredentials {
        credentials,
        disabled,
        state_file,
    })
}

/// Validates a completed table and appends the credential when enabled.
fn finish_entry(
    fields: EntryFields,
    credentials: &mut Vec<Credential>,
    disabled: &mut usize,
    seen: &mut HashSet<String>,
) -> Result<(), ConfigError> {
    let line = fields.header_line;

    let password_shape = match (&fields.email, &fields.password) {
        (Some(_), Some(_)) => true,
        (None, None) => false,
        (Some(_), None) => {
            return Err(ConfigError::Parse {
                line,
                message: "field 'email' requires 'password'".to_string(),
            });
        }
        (None, Some(_)) => {
            return Err(ConfigError::Parse {
                line,
                message: "field 'password' requires 'email'".to_string(),
            });
        }
    };
    let token_shape = match (&fields.user_id, &fields.user_key) {
        (Some(_), Some(_)) => true,
        (None, None) => false,
        (Some(_), None) => {
            return Err(ConfigError::Parse {
                line,
                message: "field 'user_id' requires 'user_key'".to_string(),
            });
        }
        (None, Some(_)) => {
            return Err(ConfigError::Parse {
                line,
                message: "field 'user_key' requires 'user_id'".to_string(),
            });
        }
    };

    let auth = match (password_shape, token_shape) {
        (true, true) => {
            return Err(ConfigError::Parse {
                line,
                message: "credential has both email/password and user_id/user_key".to_string(),
            });
        }
        (false, false) => {
            return Err(ConfigError::Parse {
                line,
                message: "credential needs either email/password or user_id/user_key".to_string(),
            });
        }
        (true, false) => CredentialAuth::Password {
            email: fields.email.unwrap_or_default(),
            password: fields.password.unwrap_or_default(),
        },
        (false, true) => CredentialAuth::Token {
            user_id: fields.user_id.unwrap_or_default(),
            user_key: fields.user_key.unwrap_or_default(),
        },
    };

    if !fields.enabled.unwrap_or(true) {
        *disabled += 1;
        return Ok(());
    }

    let mut credential = Credential::new(auth);
    credential.name = fields.name;

    if !seen.insert(credential.identity().to_string()) {
        return Err(ConfigError::Duplicate {
            identity: credential.identity().to_string(),
        });
    }

    credentials.push(credential);
    Ok(())
}

/// Builds a single credential from the environment variable pairs.
///
/// Token variables win when both pairs are fully set.
fn load_from_env() -> Result<Credential, ConfigError> {
    let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());

    if let (Some(user_id), Some(user_key)) = (var(ENV_USER_ID), var(ENV_USER_KEY)) {
        return Ok(Credential::new(CredentialAuth::Token { user_id, user_key }));
    }
    if let (Some(email), Some(password)) = (var(ENV_EMAIL), var(ENV_PASSWORD)) {
        return Ok(Credential::new(CredentialAuth::Password { email, password }));
    }

    Err(ConfigError::Environment {
        message: format!(
            "set both {ENV_EMAIL} and {ENV_PASSWORD}, or both {ENV_USER_ID} and {ENV_USER_KEY}"
        ),
    })
}

/// Removes a trailing `#` comment, honoring quoted strings.
fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (pos, ch) in line.char_indices() {
        match ch {
            '\\' if in_string => escaped = !escaped,
            '"' if !escaped => in_string = !in_string,
            '#' if !in_string => return &line[..pos],
            _ => escaped = false,
        }
    }
    line
}

/// Parses a double-quoted string literal with `\"` and `\\` escapes.
fn parse_string_literal(value: &str, line: usize, field: &str) -> Result<String, ConfigError> {
    let inner = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| ConfigError::Parse {
            line,
            message: format!("field '{field}' expects a quoted string"),
        })?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                other => {
                    return Err(ConfigError::Parse {
                        line,
                        message: format!(
                            "field '{field}' has unsupported escape '\\{}'",
                            other.map_or(String::new(), |c| c.to_string())
                        ),
                    });
                }
            }
        } else {
            out.push(ch);
        }
    }
    Ok(out)
}

/// Parses a bare `true`/`false` literal.
fn parse_boolean(value: &str, line: usize, field: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::Parse {
            line,
            message: format!("field '{field}' expects true or false"),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const GOOD_FILE: &str = r#"
state_file = ".rotation-state"

[[credentials]]
name = "Primary"
email = "user1@example.com"
password = "pw1"
enabled = true

[[credentials]]
name = "Token account"
user_id = "123456"
user_key = "key"
"#;

    #[test]
    fn test_parse_good_file_preserves_order() {
        let loaded = parse_credentials_str(GOOD_FILE).unwrap();
        assert_eq!(loaded.credentials.len(), 2);
        assert_eq!(loaded.credentials[0].identity(), "user1@example.com");
        assert_eq!(loaded.credentials[1].identity(), "123456");
        assert_eq!(loaded.disabled, 0);
        assert_eq!(
            loaded.state_file.as_deref(),
            Some(Path::new(".rotation-state"))
        );
    }

    #[test]
    fn test_parse_disabled_entries_skipped_but_counted() {
        let raw = r#"
[[credentials]]
email = "a@example.com"
password = "pw"
enabled = false

[[credentials]]
email = "b@example.com"
password = "pw"
"#;
        let loaded = parse_credentials_str(raw).unwrap();
        assert_eq!(loaded.credentials.len(), 1);
        assert_eq!(loaded.credentials[0].identity(), "b@example.com");
        assert_eq!(loaded.disabled, 1);
    }

    #[test]
    fn test_parse_empty_file_yields_empty_set() {
        let loaded = parse_credentials_str("").unwrap();
        assert!(loaded.credentials.is_empty());
        assert_eq!(loaded.disabled, 0);
    }

    #[test]
    fn test_parse_both_shapes_rejected() {
        let raw = r#"
[[credentials]]
email = "a@example.com"
password = "pw"
user_id = "1"
user_key = "k"
"#;
        let err = parse_credentials_str(raw).unwrap_err();
        match err {
            ConfigError::Parse { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("both"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_missing_shape_rejected() {
        let raw = "[[credentials]]\nname = \"empty\"\n";
        let err = parse_credentials_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_parse_half_pair_names_field() {
        let raw = "[[credentials]]\nemail = \"a@example.com\"\n";
        let err = parse_credentials_str(raw).unwrap_err();
        match err {
            ConfigError::Parse { message, .. } => assert!(message.contains("'email'")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_bad_syntax_reports_line() {
        let raw = "[[credentials]]\nemail \"a@example.com\"\npassword = \"pw\"\n";
        let err = parse_credentials_str(raw).unwrap_err();
        match err {
            ConfigError::Parse { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("key = value"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_field_rejected() {
        let raw = "[[credentials]]\nemail = \"a@example.com\"\npassword = \"pw\"\ncolor = \"red\"\n";
        let err = parse_credentials_str(raw).unwrap_err();
        match err {
            ConfigError::Parse { line, message } => {
                assert_eq!(line, 4);
                assert!(message.contains("color"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_duplicate_identity_rejected() {
        let raw = r#"
[[credentials]]
email = "a@example.com"
password = "pw"

[[credentials]]
email = "a@example.com"
password = "other"
"#;
        let err = parse_credentials_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { identity } if identity == "a@example.com"));
    }

    #[test]
    fn test_parse_comments_and_escapes() {
        let raw = "[[credentials]]  # primary\nemail = \"a@example.com\"\npassword = \"p#\\\"w\" # trailing\n";
        let loaded = parse_credentials_str(raw).unwrap();
        assert_eq!(loaded.credentials.len(), 1);
        match &loaded.credentials[0].auth {
            CredentialAuth::Password { password, .. } => assert_eq!(password, "p#\"w"),
            CredentialAuth::Token { .. } => panic!("expected password shape"),
        }
    }

    #[test]
    fn test_detect_source_prefers_structured_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CREDENTIALS_FILE), "").unwrap();
        let source = detect_source(dir.path()).unwrap();
        assert!(matches!(source, CredentialSource::Structured(_)));
    }

    #[test]
    fn test_load_structured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CREDENTIALS_FILE);
        std::fs::write(&path, GOOD_FILE).unwrap();

        let loaded = load(&CredentialSource::Structured(path)).unwrap();
        assert_eq!(loaded.credentials.len(), 2);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load(&CredentialSource::Structured(PathBuf::from(
            "/nonexistent/credentials.toml",
        )))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
