//! Manifest reconciliation
//!
//! Brings live server state into agreement with the manifest by computing
//! and applying the minimal delta, one entry at a time over one shared
//! connection. Entry-local failures are recorded and processing continues;
//! a lost connection aborts the run since nothing further can be attempted.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::manifest::{Manifest, ManifestEntry, RoleBinding};
use crate::roles;
use crate::secret::{SecretError, SecretStore};
use crate::server::{ServerConnection, ServerError};

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Fatal to the run: the shared connection is gone, remaining entries
    /// cannot be attempted.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("secret {reference:?} could not be resolved")]
    SecretUnresolved {
        reference: String,
        #[source]
        source: SecretError,
    },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unknown role {role:?}")]
    InvalidRole { role: String },
    #[error("failed to create database {database:?}: {reason}")]
    DatabaseCreateFailed { database: String, reason: String },
    /// Server failure outside the taxonomy above. Entry-local.
    #[error("server error: {0}")]
    Unexpected(String),
}

/// Outcome of reconciling one manifest entry.
#[derive(Debug)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Failed(ProvisionError),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Outcome of one entry, tagged with what it applied to.
#[derive(Debug)]
pub struct EntryReport {
    pub database: String,
    pub user: String,
    pub outcome: Outcome,
}

/// Result of a full reconciliation pass: one outcome per attempted entry,
/// in manifest order. Produced even when the run aborts, so partial
/// progress is never lost.
#[derive(Debug)]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub entries: Vec<EntryReport>,
    /// Set when a connection-level failure stopped the run before every
    /// entry could be attempted.
    pub aborted: bool,
}

impl ReconcileReport {
    /// True iff every entry reached Created, Updated, or Unchanged.
    pub fn succeeded(&self) -> bool {
        !self.aborted && self.entries.iter().all(|e| !e.outcome.is_failure())
    }
}

/// Tunables for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Create a missing database namespace explicitly; when false, leave
    /// it to the server's first-write implicit creation.
    pub create_database_if_missing: bool,
    /// Revoke roles the user holds beyond the manifest. Off means the
    /// conservative add-only mode.
    pub revoke_extra_roles: bool,
    /// Upper bound for each individual server call. A call that exceeds
    /// it is treated as a lost connection.
    pub op_timeout: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            create_database_if_missing: true,
            revoke_extra_roles: false,
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Reconciles manifest entries against one shared connection.
pub struct Provisioner<'a, C, S> {
    conn: &'a C,
    secrets: &'a S,
    options: ReconcileOptions,
}

impl<'a, C: ServerConnection, S: SecretStore> Provisioner<'a, C, S> {
    pub fn new(conn: &'a C, secrets: &'a S, options: ReconcileOptions) -> Self {
        Self {
            conn,
            secrets,
            options,
        }
    }

    /// Reconcile every manifest entry, in order.
    ///
    /// Entry-local failures are recorded in the report and processing
    /// continues with the next entry. A lost connection marks the current
    /// entry Failed and stops: entries never attempted are absent from the
    /// report and the report is flagged aborted.
    pub async fn reconcile(&self, manifest: &Manifest) -> ReconcileReport {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut entries = Vec::with_capacity(manifest.entries.len());
        let mut aborted = false;

        for (idx, entry) in manifest.entries.iter().enumerate() {
            info!(database = %entry.database, user = %entry.user, "Reconciling entry");

            let outcome = match self.reconcile_entry(entry).await {
                Ok(outcome) => {
                    info!(
                        database = %entry.database,
                        user = %entry.user,
                        outcome = outcome.label(),
                        "Entry reconciled"
                    );
                    outcome
                }
                Err(error @ ProvisionError::ConnectionLost(_)) => {
                    let remaining = manifest.entries.len() - idx - 1;
                    warn!(
                        database = %entry.database,
                        user = %entry.user,
                        error = %error,
                        remaining,
                        "Connection lost, aborting run"
                    );
                    aborted = true;
                    entries.push(EntryReport {
                        database: entry.database.clone(),
                        user: entry.user.clone(),
                        outcome: Outcome::Failed(error),
                    });
                    break;
                }
                Err(error) => {
                    warn!(
                        database = %entry.database,
                        user = %entry.user,
                        error = %error,
                        "Entry failed"
                    );
                    Outcome::Failed(error)
                }
            };

            entries.push(EntryReport {
                database: entry.database.clone(),
                user: entry.user.clone(),
                outcome,
            });
        }

        ReconcileReport {
            started_at,
            duration: start.elapsed(),
            entries,
            aborted,
        }
    }

    async fn reconcile_entry(&self, entry: &ManifestEntry) -> Result<Outcome, ProvisionError> {
        if let Some(binding) = roles::first_invalid(&entry.roles) {
            return Err(ProvisionError::InvalidRole {
                role: binding.role.clone(),
            });
        }

        let password =
            self.secrets
                .resolve(&entry.password_ref)
                .map_err(|source| ProvisionError::SecretUnresolved {
                    reference: entry.password_ref.clone(),
                    source,
                })?;

        let mut mutated = false;

        let db_exists = self.call(self.conn.database_exists(&entry.database)).await?;
        if !db_exists {
            if self.options.create_database_if_missing {
                let created = self
                    .call(self.conn.create_database(&entry.database))
                    .await
                    .map_err(|e| match e {
                        ProvisionError::Unexpected(reason) => ProvisionError::DatabaseCreateFailed {
                            database: entry.database.clone(),
                            reason,
                        },
                        other => other,
                    })?;
                mutated |= created;
            } else {
                debug!(database = %entry.database, "Database absent, left to implicit creation");
            }
        }

        let user_exists = self
            .call(self.conn.user_exists(&entry.database, &entry.user))
            .await?;

        let created = if !user_exists {
            self.call(self.conn.create_user(
                &entry.database,
                &entry.user,
                &password,
                &entry.roles,
            ))
            .await?;
            true
        } else {
            // Existing user: reconcile bindings only. The password is never
            // touched here.
            let current = self
                .call(self.conn.user_roles(&entry.database, &entry.user))
                .await?;
            let current_set: BTreeSet<&RoleBinding> = current.iter().collect();
            let desired_set: BTreeSet<&RoleBinding> = entry.roles.iter().collect();

            let to_add: Vec<RoleBinding> = entry
                .roles
                .iter()
                .filter(|r| !current_set.contains(r))
                .cloned()
                .collect();
            if !to_add.is_empty() {
                self.call(
                    self.conn
                        .grant_roles(&entry.database, &entry.user, &to_add),
                )
                .await?;
                mutated = true;
            }

            if self.options.revoke_extra_roles {
                let to_remove: Vec<RoleBinding> = current
                    .iter()
                    .filter(|r| !desired_set.contains(r))
                    .cloned()
                    .collect();
                if !to_remove.is_empty() {
                    self.call(self.conn.revoke_roles(
                        &entry.database,
                        &entry.user,
                        &to_remove,
                    ))
                    .await?;
                    mutated = true;
                }
            }

            false
        };

        for name in &entry.collections {
            let created_coll = self
                .call(self.conn.create_collection(&entry.database, name))
                .await?;
            mutated |= created_coll;
        }

        Ok(if created {
            Outcome::Created
        } else if mutated {
            Outcome::Updated
        } else {
            Outcome::Unchanged
        })
    }

    /// Run one server call under the per-call timeout and map its failure
    /// into the provisioning taxonomy.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, ServerError>>,
    ) -> Result<T, ProvisionError> {
        match timeout(self.options.op_timeout, fut).await {
            Err(_) => Err(ProvisionError::ConnectionLost(format!(
                "server call exceeded {:?}",
                self.options.op_timeout
            ))),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ServerError::Unavailable(m))) => Err(ProvisionError::ConnectionLost(m)),
            Ok(Err(ServerError::Denied(m))) => Err(ProvisionError::PermissionDenied(m)),
            Ok(Err(ServerError::UnknownRole(role))) => Err(ProvisionError::InvalidRole { role }),
            Ok(Err(ServerError::Other(m))) => Err(ProvisionError::Unexpected(m)),
        }
    }
}
