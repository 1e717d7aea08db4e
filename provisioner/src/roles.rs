//! Server-defined role names
//!
//! The server rejects unknown role names only once the grant is attempted.
//! Validating bindings up front keeps a typo in the manifest from touching
//! the server at all.

use crate::manifest::RoleBinding;

/// Built-in roles grantable on any single database.
pub const DATABASE_ROLES: &[&str] = &["read", "readWrite", "dbAdmin", "dbOwner", "userAdmin"];

/// Built-in roles that only exist on the `admin` database.
pub const ADMIN_ROLES: &[&str] = &[
    "readAnyDatabase",
    "readWriteAnyDatabase",
    "dbAdminAnyDatabase",
    "userAdminAnyDatabase",
    "clusterAdmin",
    "clusterManager",
    "clusterMonitor",
    "hostManager",
    "backup",
    "restore",
    "root",
];

/// Whether `name` is a role the server defines.
pub fn is_known(name: &str) -> bool {
    DATABASE_ROLES.contains(&name) || ADMIN_ROLES.contains(&name)
}

/// Returns the first binding the server would reject: an unknown role
/// name, or an admin-only role bound to another database.
pub fn first_invalid(bindings: &[RoleBinding]) -> Option<&RoleBinding> {
    bindings.iter().find(|binding| {
        !is_known(&binding.role) || (ADMIN_ROLES.contains(&binding.role.as_str()) && binding.db != "admin")
    })
}
