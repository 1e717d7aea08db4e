//! Secret reference resolution
//!
//! The manifest never carries literal passwords, only references. The
//! resolver snapshots the process environment at construction, so
//! reconciliation itself performs no ambient lookups. Resolved values are
//! opaque to the rest of the crate and must never be logged.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unsupported secret reference scheme in {0:?}, expected env: or file:")]
    UnsupportedScheme(String),
    #[error("secret {0:?} is not defined")]
    Missing(String),
    #[error("secret {0:?} resolved to an empty value")]
    Empty(String),
    #[error("failed to read secret file {path:?}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Collaborator that turns a password reference into the secret itself.
pub trait SecretStore {
    fn resolve(&self, reference: &str) -> Result<String, SecretError>;
}

/// Resolves `env:NAME` against an environment snapshot and `file:PATH`
/// against secret-file mounts.
pub struct SecretResolver {
    env: HashMap<String, String>,
}

impl SecretResolver {
    /// Snapshot the current process environment.
    pub fn from_env() -> Self {
        Self::with_vars(std::env::vars())
    }

    /// Build a resolver over an explicit set of variables.
    pub fn with_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            env: vars.into_iter().collect(),
        }
    }
}

impl SecretStore for SecretResolver {
    fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        let secret = if let Some(name) = reference.strip_prefix("env:") {
            self.env
                .get(name)
                .cloned()
                .ok_or_else(|| SecretError::Missing(reference.to_string()))?
        } else if let Some(path) = reference.strip_prefix("file:") {
            let content = std::fs::read_to_string(path).map_err(|source| SecretError::Io {
                path: path.to_string(),
                source,
            })?;
            // Secret files commonly end with a newline the secret does not contain
            content.trim_end_matches(['\r', '\n']).to_string()
        } else {
            return Err(SecretError::UnsupportedScheme(reference.to_string()));
        };

        if secret.is_empty() {
            return Err(SecretError::Empty(reference.to_string()));
        }
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SecretResolver {
        SecretResolver::with_vars([
            ("SVC_PASSWORD".to_string(), "hunter2".to_string()),
            ("EMPTY".to_string(), String::new()),
        ])
    }

    #[test]
    fn resolves_env_reference() {
        assert_eq!(resolver().resolve("env:SVC_PASSWORD").unwrap(), "hunter2");
    }

    #[test]
    fn missing_variable_is_an_error() {
        assert!(matches!(
            resolver().resolve("env:NOPE"),
            Err(SecretError::Missing(_))
        ));
    }

    #[test]
    fn empty_secret_is_an_error() {
        assert!(matches!(
            resolver().resolve("env:EMPTY"),
            Err(SecretError::Empty(_))
        ));
    }

    #[test]
    fn bare_reference_is_rejected() {
        assert!(matches!(
            resolver().resolve("hunter2"),
            Err(SecretError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            resolver().resolve("file:/nonexistent/secret"),
            Err(SecretError::Io { .. })
        ));
    }
}
