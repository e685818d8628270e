//! StateStore: redb-backed persistence for groups, instances and the
//! request ledger.
//!
//! Single-record writes commit on their own. Anything that must land
//! together (a desired-size change plus the ledger entry that records it,
//! a new member plus the group's updated member list) goes through a
//! [`StateBatch`] so a crash never leaves half of it behind.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
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
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn put_group(&self, group: &GroupRecord) -> StateResult<()> {
        let mut batch = StateBatch::default();
        batch.put_group(group);
        self.commit(batch)
    }

    pub fn get_group(&self, group_id: &str) -> StateResult<Option<GroupRecord>> {
        self.get(GROUPS, group_id)
    }

    pub fn list_groups(&self) -> StateResult<Vec<GroupRecord>> {
        self.scan(GROUPS, "")
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        let mut batch = StateBatch::default();
        batch.put_instance(instance);
        self.commit(batch)
    }

    pub fn get_instance(
        &self,
        group_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, &instance_key(group_id, instance_id))
    }

    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.scan(INSTANCES, "")
    }

    /// All instance records of one group, in key order.
    pub fn list_instances_for_group(&self, group_id: &str) -> StateResult<Vec<InstanceRecord>> {
        self.scan(INSTANCES, &format!("{group_id}:"))
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, group_id: &str, instance_id: &str) -> StateResult<bool> {
        let key = instance_key(group_id, instance_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "instance deleted");
        Ok(existed)
    }

    // ── Requests ───────────────────────────────────────────────────

    pub fn get_request(
        &self,
        group_id: &str,
        request_id: &str,
    ) -> StateResult<Option<RequestRecord>> {
        self.get(REQUESTS, &request_key(group_id, request_id))
    }

    pub fn list_requests_for_group(&self, group_id: &str) -> StateResult<Vec<RequestRecord>> {
        self.scan(REQUESTS, &format!("{group_id}:"))
    }

    // ── Batches ────────────────────────────────────────────────────

    /// Apply every operation in `batch` in one write transaction.
    pub fn commit(&self, batch: StateBatch) -> StateResult<()> {
        if let Some(err) = batch.error {
            return Err(StateError::Serialize(err));
        }
        if batch.ops.is_empty() {
            return Ok(());
        }
        let ops = batch.ops.len();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for op in batch.ops {
            match op {
                BatchOp::Put { table, key, value } => insert(&txn, table, &key, &value)?,
                BatchOp::Remove { table, key } => {
                    let mut t = txn.open_table(table).map_err(map_err!(Table))?;
                    t.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(ops, "state batch committed");
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every record whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }
}

fn insert(txn: &WriteTransaction, table: Table, key: &str, value: &[u8]) -> StateResult<()> {
    let mut t = txn.open_table(table).map_err(map_err!(Table))?;
    t.insert(key, value).map_err(map_err!(Write))?;
    Ok(())
}

enum BatchOp {
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    Remove {
        table: Table,
        key: String,
    },
}

/// A set of writes committed atomically by [`StateStore::commit`].
///
/// Records are serialized when added; a serialization failure is
/// reported by [`StateStore::commit`] before anything is written.
#[derive(Default)]
pub struct StateBatch {
    ops: Vec<BatchOp>,
    error: Option<String>,
}

impl StateBatch {
    pub fn put_group(&mut self, group: &GroupRecord) -> &mut Self {
        self.put(GROUPS, group.table_key(), group)
    }

    pub fn put_instance(&mut self, instance: &InstanceRecord) -> &mut Self {
        self.put(INSTANCES, instance.table_key(), instance)
    }

    pub fn remove_instance(&mut self, group_id: &str, instance_id: &str) -> &mut Self {
        self.ops.push(BatchOp::Remove {
            table: INSTANCES,
            key: instance_key(group_id, instance_id),
        });
        self
    }

    pub fn put_request(&mut self, request: &RequestRecord) -> &mut Self {
        self.put(REQUESTS, request.table_key(), request)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.error.is_none()
    }

    fn put<T: Serialize>(&mut self, table: Table, key: String, record: &T) -> &mut Self {
        match serde_json::to_vec(record) {
            Ok(value) => self.ops.push(BatchOp::Put { table, key, value }),
            Err(e) => {
                self.error.get_or_insert(e.to_string());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperfleet_core::{InstanceTemplate, Resources, VmRef};

    fn group(id: &str, desired: u32) -> GroupRecord {
        GroupRecord {
            id: id.to_string(),
            template: InstanceTemplate::new("ubuntu-24.04.qcow2", Resources::new(2, 4 << 30, 20 << 30)),
            min_size: 0,
            max_size: 10,
            desired_size: desired,
            hosts: vec![],
            members: vec![],
            next_seq: 0,
            created_at: 100,
            updated_at: 100,
        }
    }

    fn instance(group_id: &str, seq: u64) -> InstanceRecord {
        InstanceRecord::new(
            format!("{group_id}-{seq:06}"),
            group_id.to_string(),
            seq,
            Resources::new(2, 4 << 30, 20 << 30),
            100,
        )
    }

    #[test]
    fn group_crud() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_group("web").unwrap().is_none());

        store.put_group(&group("web", 3)).unwrap();
        store.put_group(&group("batch", 1)).unwrap();

        let web = store.get_group("web").unwrap().unwrap();
        assert_eq!(web.desired_size, 3);

        let ids: Vec<_> = store
            .list_groups()
            .unwrap()
            .into_iter()
            .map(|g| g.id)
            .collect();
        assert_eq!(ids, vec!["batch", "web"]);
    }

    #[test]
    fn instance_prefix_scan_is_per_group() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&instance("web", 0)).unwrap();
        store.put_instance(&instance("web", 1)).unwrap();
        store.put_instance(&instance("web-canary", 0)).unwrap();
        store.put_instance(&instance("batch", 0)).unwrap();

        let web = store.list_instances_for_group("web").unwrap();
        assert_eq!(web.len(), 2);
        assert!(web.iter().all(|i| i.group_id == "web"));
        assert_eq!(store.list_instances().unwrap().len(), 4);
    }

    #[test]
    fn delete_instance_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&instance("web", 0)).unwrap();

        assert!(store.delete_instance("web", "web-000000").unwrap());
        assert!(!store.delete_instance("web", "web-000000").unwrap());
        assert!(store.get_instance("web", "web-000000").unwrap().is_none());
    }

    #[test]
    fn batch_commits_together() {
        let store = StateStore::open_in_memory().unwrap();
        let mut g = group("web", 2);
        let inst = instance("web", 0);
        g.members.push(inst.id.clone());

        let mut batch = StateBatch::default();
        batch
            .put_group(&g)
            .put_instance(&inst)
            .put_request(&RequestRecord {
                group_id: "web".into(),
                request_id: "req-1".into(),
                kind: RequestKind::Increase,
                delta: 2,
                resulting_size: 2,
                recorded_at: 100,
            });
        store.commit(batch).unwrap();

        assert_eq!(store.get_group("web").unwrap().unwrap().members.len(), 1);
        assert!(store.get_instance("web", "web-000000").unwrap().is_some());
        let req = store.get_request("web", "req-1").unwrap().unwrap();
        assert_eq!(req.resulting_size, 2);
        assert_eq!(store.list_requests_for_group("web").unwrap().len(), 1);
    }

    #[test]
    fn batch_remove_drops_instance() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&instance("web", 0)).unwrap();

        let mut batch = StateBatch::default();
        batch.remove_instance("web", "web-000000");
        store.commit(batch).unwrap();

        assert!(store.list_instances_for_group("web").unwrap().is_empty());
    }

    #[test]
    fn empty_batch_is_noop() {
        let store = StateStore::open_in_memory().unwrap();
        store.commit(StateBatch::default()).unwrap();
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_group(&group("web", 4)).unwrap();
            let mut inst = instance("web", 0);
            inst.host_id = Some("kvm-1".into());
            inst.vm_ref = Some(VmRef::new("web-000000"));
            inst.state = InstanceState::Running;
            store.put_instance(&inst).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_group("web").unwrap().unwrap().desired_size, 4);
        let inst = store.get_instance("web", "web-000000").unwrap().unwrap();
        assert_eq!(inst.state, InstanceState::Running);
        assert_eq!(inst.host_id.as_deref(), Some("kvm-1"));
    }
}
