//! Declarative provisioning manifest
//!
//! The manifest enumerates the databases, users, and role bindings the
//! deployment should end up with. It is loaded once per run, consumed by
//! exactly one reconciliation pass, and discarded.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level manifest: run options plus the desired entries, in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub options: ManifestOptions,
    pub entries: Vec<ManifestEntry>,
}

/// Options recognized at the top of the manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManifestOptions {
    /// Create a missing database namespace explicitly. When false, the
    /// namespace is left to the server's first-write implicit creation.
    #[serde(alias = "createDatabaseIfMissing")]
    pub create_database_if_missing: bool,
    /// Revoke roles the user holds beyond what the manifest declares.
    /// Off by default: the conservative mode only ever adds.
    #[serde(alias = "revokeExtraRoles")]
    pub revoke_extra_roles: bool,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            create_database_if_missing: true,
            revoke_extra_roles: false,
        }
    }
}

/// One desired database/user pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub database: String,
    pub user: String,
    /// Indirection to the password secret (`env:NAME` or `file:PATH`),
    /// never the literal value.
    #[serde(alias = "passwordRef")]
    pub password_ref: String,
    pub roles: Vec<RoleBinding>,
    /// Collections to create inside `database` if absent.
    #[serde(default)]
    pub collections: Vec<String>,
}

/// A role granted to a user on a database scope.
///
/// `db` may be omitted in the manifest, in which case it defaults to the
/// entry's own database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleBinding {
    pub role: String,
    #[serde(default, alias = "databaseScope")]
    pub db: String,
}

impl Manifest {
    /// Load and validate a manifest from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read manifest {}", path))?;
        Self::parse(&content).context(format!("Invalid manifest {}", path))
    }

    /// Parse and validate a manifest from YAML text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut manifest: Manifest =
            serde_yaml::from_str(text).context("Failed to parse manifest YAML")?;
        manifest.normalize();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Fill in defaulted role scopes.
    fn normalize(&mut self) {
        for entry in &mut self.entries {
            for binding in &mut entry.roles {
                if binding.db.is_empty() {
                    binding.db = entry.database.clone();
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.entries.is_empty(), "manifest has no entries");

        for (idx, entry) in self.entries.iter().enumerate() {
            ensure!(!entry.database.is_empty(), "entry {}: database is empty", idx);
            ensure!(!entry.user.is_empty(), "entry {}: user is empty", idx);
            ensure!(
                !entry.password_ref.is_empty(),
                "entry {} ({}): password_ref is empty",
                idx,
                entry.user
            );
            for binding in &entry.roles {
                ensure!(
                    !binding.role.is_empty(),
                    "entry {} ({}): role name is empty",
                    idx,
                    entry.user
                );
            }
            for name in &entry.collections {
                ensure!(
                    !name.is_empty(),
                    "entry {} ({}): collection name is empty",
                    idx,
                    entry.user
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_manifest() {
        let manifest = Manifest::parse(
            r#"
options:
  create_database_if_missing: false
  revoke_extra_roles: true
entries:
  - database: app
    user: svc
    password_ref: env:SVC_PASSWORD
    roles:
      - role: readWrite
        db: app
      - role: read
        db: reporting
    collections:
      - events
"#,
        )
        .unwrap();

        assert!(!manifest.options.create_database_if_missing);
        assert!(manifest.options.revoke_extra_roles);
        assert_eq!(manifest.entries.len(), 1);
        let entry = &manifest.entries[0];
        assert_eq!(entry.user, "svc");
        assert_eq!(entry.roles[1].db, "reporting");
        assert_eq!(entry.collections, vec!["events"]);
    }

    #[test]
    fn options_default_when_absent() {
        let manifest = Manifest::parse(
            r#"
entries:
  - database: app
    user: svc
    password_ref: env:SVC_PASSWORD
    roles:
      - role: readWrite
"#,
        )
        .unwrap();

        assert!(manifest.options.create_database_if_missing);
        assert!(!manifest.options.revoke_extra_roles);
    }

    #[test]
    fn role_scope_defaults_to_entry_database() {
        let manifest = Manifest::parse(
            r#"
entries:
  - database: app
    user: svc
    password_ref: env:SVC_PASSWORD
    roles:
      - role: readWrite
"#,
        )
        .unwrap();

        assert_eq!(manifest.entries[0].roles[0].db, "app");
    }

    #[test]
    fn accepts_camel_case_aliases() {
        let manifest = Manifest::parse(
            r#"
options:
  createDatabaseIfMissing: false
entries:
  - database: app
    user: svc
    passwordRef: env:SVC_PASSWORD
    roles:
      - role: read
        databaseScope: reporting
"#,
        )
        .unwrap();

        assert!(!manifest.options.create_database_if_missing);
        assert_eq!(manifest.entries[0].password_ref, "env:SVC_PASSWORD");
        assert_eq!(manifest.entries[0].roles[0].db, "reporting");
    }

    #[test]
    fn rejects_empty_manifest() {
        assert!(Manifest::parse("entries: []").is_err());
    }

    #[test]
    fn rejects_missing_password_ref() {
        let result = Manifest::parse(
            r#"
entries:
  - database: app
    user: svc
    password_ref: ""
    roles: []
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = Manifest::parse(
            r#"
entries:
  - database: app
    user: svc
    password_ref: env:P
    password: literal-secret
    roles: []
"#,
        );
        assert!(result.is_err());
    }
}
