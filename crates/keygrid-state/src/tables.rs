//! redb table definitions. Every table maps a `&str` key to a JSON value.

use redb::TableDefinition;

pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Resolved roles keyed by role name.
pub const ROLES: JsonTable = TableDefinition::new("roles");

/// Current boot payload per role, keyed by role name.
pub const PAYLOADS: JsonTable = TableDefinition::new("payloads");

/// Permission grants keyed by [`PermissionGrant::key`](keygrid_core::PermissionGrant::key).
pub const GRANTS: JsonTable = TableDefinition::new("grants");

/// Front specs keyed by front name.
pub const FRONTS: JsonTable = TableDefinition::new("fronts");

/// Deployment progress keyed by cluster name.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

pub(crate) const ALL: [JsonTable; 5] = [ROLES, PAYLOADS, GRANTS, FRONTS, DEPLOYMENTS];
