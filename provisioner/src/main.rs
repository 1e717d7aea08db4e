//! Declarative MongoDB user and database provisioning
//!
//! Reads a YAML manifest of desired databases, users, and role bindings,
//! connects to the target deployment, and applies only the missing deltas.
//! Safe to re-run: a converged manifest performs no writes.
//!
//! Exit code is 0 only if every entry reconciled cleanly.

use anyhow::{Context, Result};
use common::{init_logging, ConfigExt};
use provisioner::manifest::Manifest;
use provisioner::reconcile::{Outcome, Provisioner, ReconcileOptions};
use provisioner::secret::SecretResolver;
use provisioner::server::MongoShell;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

struct Config {
    mongo_url: String,
    manifest_path: String,
    op_timeout: Duration,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            mongo_url: String::env_required("MONGO_URL")?,
            manifest_path: String::env_or("MANIFEST_PATH", "manifest.yml"),
            op_timeout: Duration::from_secs(u64::env_parse("PROVISION_OP_TIMEOUT", 30)),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logging("provision");

    let run_id = Uuid::new_v4();
    let config = Config::from_env()?;

    let manifest =
        Manifest::load(&config.manifest_path).context("Failed to load manifest")?;

    info!(
        %run_id,
        path = %config.manifest_path,
        entries = manifest.entries.len(),
        "Manifest loaded"
    );

    let conn = MongoShell::connect(&config.mongo_url)
        .await
        .context("Failed to connect to deployment")?;
    let secrets = SecretResolver::from_env();

    let options = ReconcileOptions {
        create_database_if_missing: manifest.options.create_database_if_missing,
        revoke_extra_roles: manifest.options.revoke_extra_roles,
        op_timeout: config.op_timeout,
    };

    let report = Provisioner::new(&conn, &secrets, options)
        .reconcile(&manifest)
        .await;

    for entry in &report.entries {
        match &entry.outcome {
            Outcome::Failed(e) => {
                error!(database = %entry.database, user = %entry.user, error = %e, "failed")
            }
            outcome => {
                info!(database = %entry.database, user = %entry.user, "{}", outcome.label())
            }
        }
    }

    let duration_ms = report.duration.as_millis() as u64;
    if report.succeeded() {
        info!(%run_id, duration_ms, "Provisioning complete");
        Ok(())
    } else {
        if report.aborted {
            error!("Run aborted before all entries could be attempted");
        }
        error!(%run_id, duration_ms, "Provisioning finished with failures");
        std::process::exit(1);
    }
}
