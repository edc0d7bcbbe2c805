//! StateStore: redb-backed desired-state persistence.
//!
//! Values are JSON-serialized into `&[u8]` columns. Every public method is
//! one redb transaction, so a crash between deployment steps leaves the
//! last committed record intact.

use std::path::Path;
use std::sync::Arc;

use keygrid_core::{BootPayload, FrontSpec, PermissionGrant, Role};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::DeploymentRecord;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Roles ──────────────────────────────────────────────────────

    pub fn put_role(&self, role: &Role) -> StateResult<()> {
        self.put_json(ROLES, &role.name, role)?;
        debug!(role = %role.name, image = %role.image_id, "role stored");
        Ok(())
    }

    pub fn get_role(&self, name: &str) -> StateResult<Option<Role>> {
        self.get_json(ROLES, name)
    }

    pub fn list_roles(&self) -> StateResult<Vec<Role>> {
        self.list_json(ROLES)
    }

    /// Remove a role and its payload. Returns true if the role existed.
    pub fn delete_role(&self, name: &str) -> StateResult<bool> {
        self.delete_key(PAYLOADS, name)?;
        self.delete_key(ROLES, name)
    }

    // ── Payloads ───────────────────────────────────────────────────

    pub fn put_payload(&self, payload: &BootPayload) -> StateResult<()> {
        self.put_json(PAYLOADS, &payload.role, payload)?;
        debug!(role = %payload.role, digest = %payload.digest, "payload stored");
        Ok(())
    }

    pub fn get_payload(&self, role: &str) -> StateResult<Option<BootPayload>> {
        self.get_json(PAYLOADS, role)
    }

    // ── Grants ─────────────────────────────────────────────────────

    pub fn put_grant(&self, grant: &PermissionGrant) -> StateResult<()> {
        self.put_json(GRANTS, &grant.key(), grant)
    }

    pub fn list_grants(&self) -> StateResult<Vec<PermissionGrant>> {
        self.list_json(GRANTS)
    }

    // ── Fronts ─────────────────────────────────────────────────────

    pub fn put_front(&self, spec: &FrontSpec) -> StateResult<()> {
        self.put_json(FRONTS, &spec.name, spec)
    }

    pub fn get_front(&self, name: &str) -> StateResult<Option<FrontSpec>> {
        self.get_json(FRONTS, name)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put_json(DEPLOYMENTS, &record.cluster, record)?;
        debug!(
            cluster = %record.cluster,
            status = ?record.status,
            last_completed = ?record.last_completed,
            "deployment record stored"
        );
        Ok(())
    }

    pub fn get_deployment(&self, cluster: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get_json(DEPLOYMENTS, cluster)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.list_json(DEPLOYMENTS)
    }

    // ── JSON helpers ───────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
