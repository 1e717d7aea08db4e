//! Database connection collaborator
//!
//! The provisioner talks to the deployment through the `ServerConnection`
//! trait. The production implementation drives `mongosh` as a subprocess,
//! piping scripts over stdin and parsing JSON replies.

use crate::manifest::RoleBinding;
use async_trait::async_trait;
use common::command;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The server could not be reached, or stopped responding mid-call.
    #[error("server unreachable: {0}")]
    Unavailable(String),
    /// The administrative principal lacks the privilege for this operation.
    #[error("not authorized: {0}")]
    Denied(String),
    /// The server does not define the requested role.
    #[error("no such role: {0}")]
    UnknownRole(String),
    /// Any other server-reported failure.
    #[error("server error: {0}")]
    Other(String),
}

/// Request/response surface the reconciler needs from the server.
///
/// Each call is a single exchange; implementations must not cache
/// observed state across calls.
#[async_trait]
pub trait ServerConnection {
    async fn ping(&self) -> Result<(), ServerError>;
    async fn database_exists(&self, name: &str) -> Result<bool, ServerError>;
    /// Materialize the database namespace. Returns false if it already existed.
    async fn create_database(&self, name: &str) -> Result<bool, ServerError>;
    /// Create a collection if absent. Returns false if it already existed.
    async fn create_collection(&self, database: &str, name: &str) -> Result<bool, ServerError>;
    async fn user_exists(&self, database: &str, name: &str) -> Result<bool, ServerError>;
    async fn create_user(
        &self,
        database: &str,
        name: &str,
        password: &str,
        roles: &[RoleBinding],
    ) -> Result<(), ServerError>;
    async fn user_roles(&self, database: &str, name: &str)
        -> Result<Vec<RoleBinding>, ServerError>;
    async fn grant_roles(
        &self,
        database: &str,
        name: &str,
        roles: &[RoleBinding],
    ) -> Result<(), ServerError>;
    async fn revoke_roles(
        &self,
        database: &str,
        name: &str,
        roles: &[RoleBinding],
    ) -> Result<(), ServerError>;
}

/// Marker collection used to materialize a database explicitly; the server
/// only registers a namespace once it holds at least one collection.
const PROVISION_MARKER: &str = "_provisioned";

/// Connection to a deployment via the `mongosh` binary.
pub struct MongoShell {
    url: String,
}

impl MongoShell {
    /// Connect to the deployment and verify it answers a ping.
    pub async fn connect(url: &str) -> Result<Self, ServerError> {
        let shell = Self {
            url: url.to_string(),
        };
        shell.ping().await?;
        Ok(shell)
    }

    /// Run a script through mongosh and return its stdout.
    ///
    /// Scripts go over stdin so credentials never appear in the process
    /// argument list.
    async fn eval(&self, script: &str) -> Result<String, ServerError> {
        debug!("Evaluating mongosh script");

        let output = command::run_with_stdin("mongosh", &["--quiet", "--norc", &self.url], script)
            .await
            .map_err(|e| ServerError::Unavailable(e.to_string()))?;

        if output.success {
            Ok(output.stdout)
        } else {
            let message = if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            Err(classify_failure(&message))
        }
    }

    async fn eval_json(&self, script: &str) -> Result<serde_json::Value, ServerError> {
        let stdout = self.eval(script).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| ServerError::Other(format!("unparseable mongosh reply: {}", e)))
    }

    /// createCollection, tolerating a collection that already exists.
    async fn ensure_collection(&self, database: &str, name: &str) -> Result<bool, ServerError> {
        let script = format!(
            r#"try {{
    db.getSiblingDB({db}).createCollection({coll});
    print("created");
}} catch (e) {{
    if (e.codeName === "NamespaceExists") {{ print("exists"); }} else {{ throw e; }}
}}"#,
            db = js_str(database),
            coll = js_str(name),
        );
        Ok(self.eval(&script).await? == "created")
    }
}

#[async_trait]
impl ServerConnection for MongoShell {
    async fn ping(&self) -> Result<(), ServerError> {
        let value = self
            .eval_json("print(JSON.stringify(db.adminCommand({ ping: 1 }).ok === 1));")
            .await?;
        match value.as_bool() {
            Some(true) => Ok(()),
            _ => Err(ServerError::Unavailable("ping not acknowledged".to_string())),
        }
    }

    async fn database_exists(&self, name: &str) -> Result<bool, ServerError> {
        let script = format!(
            r#"const dbs = db.adminCommand({{ listDatabases: 1, nameOnly: true }}).databases;
print(JSON.stringify(dbs.some(d => d.name === {name})));"#,
            name = js_str(name),
        );
        let value = self.eval_json(&script).await?;
        value
            .as_bool()
            .ok_or_else(|| ServerError::Other("listDatabases reply was not a boolean".to_string()))
    }

    async fn create_database(&self, name: &str) -> Result<bool, ServerError> {
        self.ensure_collection(name, PROVISION_MARKER).await
    }

    async fn create_collection(&self, database: &str, name: &str) -> Result<bool, ServerError> {
        self.ensure_collection(database, name).await
    }

    async fn user_exists(&self, database: &str, name: &str) -> Result<bool, ServerError> {
        let script = format!(
            r#"const u = db.getSiblingDB({db}).getUser({user});
print(JSON.stringify(u !== null));"#,
            db = js_str(database),
            user = js_str(name),
        );
        let value = self.eval_json(&script).await?;
        value
            .as_bool()
            .ok_or_else(|| ServerError::Other("getUser reply was not a boolean".to_string()))
    }

    async fn create_user(
        &self,
        database: &str,
        name: &str,
        password: &str,
        roles: &[RoleBinding],
    ) -> Result<(), ServerError> {
        let script = format!(
            r#"db.getSiblingDB({db}).createUser({{ user: {user}, pwd: {pwd}, roles: {roles} }});
print("ok");"#,
            db = js_str(database),
            user = js_str(name),
            pwd = js_str(password),
            roles = js_roles(roles)?,
        );
        self.eval(&script).await.map(|_| ())
    }

    async fn user_roles(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Vec<RoleBinding>, ServerError> {
        let script = format!(
            r#"const u = db.getSiblingDB({db}).getUser({user});
print(JSON.stringify(u === null ? [] : u.roles.map(r => ({{ role: r.role, db: r.db }}))));"#,
            db = js_str(database),
            user = js_str(name),
        );
        let value = self.eval_json(&script).await?;
        serde_json::from_value(value)
            .map_err(|e| ServerError::Other(format!("unparseable role list: {}", e)))
    }

    async fn grant_roles(
        &self,
        database: &str,
        name: &str,
        roles: &[RoleBinding],
    ) -> Result<(), ServerError> {
        let script = format!(
            r#"db.getSiblingDB({db}).grantRolesToUser({user}, {roles});
print("ok");"#,
            db = js_str(database),
            user = js_str(name),
            roles = js_roles(roles)?,
        );
        self.eval(&script).await.map(|_| ())
    }

    async fn revoke_roles(
        &self,
        database: &str,
        name: &str,
        roles: &[RoleBinding],
    ) -> Result<(), ServerError> {
        let script = format!(
            r#"db.getSiblingDB({db}).revokeRolesFromUser({user}, {roles});
print("ok");"#,
            db = js_str(database),
            user = js_str(name),
            roles = js_roles(roles)?,
        );
        self.eval(&script).await.map(|_| ())
    }
}

/// Encode a value as a JavaScript string literal. JSON string encoding is
/// valid JavaScript, which keeps names and passwords from breaking out of
/// the script.
fn js_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Encode role bindings as a JavaScript array of `{ role, db }` documents.
fn js_roles(roles: &[RoleBinding]) -> Result<String, ServerError> {
    serde_json::to_string(roles).map_err(|e| ServerError::Other(e.to_string()))
}

/// Sort a mongosh failure into the error taxonomy by its message.
fn classify_failure(message: &str) -> ServerError {
    const NETWORK_MARKERS: &[&str] = &[
        "MongoNetworkError",
        "MongoServerSelectionError",
        "ECONNREFUSED",
        "ECONNRESET",
        "ETIMEDOUT",
        "ENOTFOUND",
        "getaddrinfo",
    ];
    const DENIED_MARKERS: &[&str] = &[
        "Unauthorized",
        "not authorized",
        "requires authentication",
        "AuthenticationFailed",
    ];

    let message = message.trim();

    if NETWORK_MARKERS.iter().any(|m| message.contains(m)) {
        return ServerError::Unavailable(message.to_string());
    }

    if let Some(pos) = message.find("No role named ") {
        let role = message[pos + "No role named ".len()..]
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_end_matches(['.', ',', '"']);
        return ServerError::UnknownRole(role.to_string());
    }
    if message.contains("RoleNotFound") {
        return ServerError::UnknownRole(message.to_string());
    }

    if DENIED_MARKERS.iter().any(|m| message.contains(m)) {
        return ServerError::Denied(message.to_string());
    }

    ServerError::Other(message.to_string())
}
