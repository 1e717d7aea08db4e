//! Idempotent MongoDB principal and namespace provisioning
//!
//! This crate reconciles a declarative manifest of databases, users, and
//! role bindings against a live deployment:
//! - Parsing and validating the YAML manifest
//! - Resolving password references through a secret collaborator
//! - Computing and applying the minimal delta per entry
//! - Reporting one inspectable outcome per entry

pub mod manifest;
pub mod reconcile;
pub mod roles;
pub mod secret;
pub mod server;

pub use manifest::{Manifest, ManifestEntry, ManifestOptions, RoleBinding};
pub use reconcile::{EntryReport, Outcome, Provisioner, ReconcileOptions, ReconcileReport};
pub use secret::{SecretResolver, SecretStore};
pub use server::{MongoShell, ServerConnection};
