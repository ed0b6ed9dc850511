//! StateStore — redb-backed persistence for provgrid.
//!
//! Provides typed CRUD over the catalog (services, templates, partials,
//! tenants) and the runtime entities (clusters, nodes, jobs, tasks, workers,
//! locks). Values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
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

type EntityTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Read-check-write one entry of an open table.
///
/// `apply` mutates the stored value and returns whether the mutation
/// should be persisted. Returns the persisted value, or `None` when the
/// entry is missing or `apply` declined.
fn update_entry<T, F>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    apply: F,
) -> StateResult<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut T) -> bool,
{
    let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
        None => None,
    };
    let Some(mut value) = current else {
        return Ok(None);
    };
    if !apply(&mut value) {
        return Ok(None);
    }
    let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
    table.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
    Ok(Some(value))
}

/// Keep the in-progress index in step with a task just written.
fn index_task(
    index: &mut Table<'_, &'static str, &'static str>,
    task: &ClusterTask,
) -> StateResult<()> {
    if task.status == TaskStatus::InProgress {
        index
            .insert(task.id.as_str(), task.tenant.as_str())
            .map_err(map_err!(Write))?;
    } else {
        index.remove(task.id.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            SERVICES,
            CLUSTER_TEMPLATES,
            PARTIAL_TEMPLATES,
            TENANTS,
            CLUSTERS,
            NODES,
            JOBS,
            TASKS,
            WORKERS,
            CLUSTER_LOCKS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.open_table(TASKS_IN_PROGRESS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic entity access ─────────────────────────────────────

    fn put<T: Serialize>(&self, table: EntityTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_many<T: Serialize>(
        &self,
        table: EntityTable,
        entries: &[(String, &T)],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            for (key, value) in entries {
                let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
                t.insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: EntityTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: EntityTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: EntityTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-check-write a single entity inside one write transaction.
    fn update<T, F>(&self, table: EntityTable, key: &str, apply: F) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            update_entry(&mut t, key, apply)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Counters ───────────────────────────────────────────────────

    /// Allocate the next value of a monotonic counter (starting at 1).
    pub fn next_id(&self, counter: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table
                .get(counter)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(counter, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn put_service(&self, tenant: &str, service: &Service) -> StateResult<()> {
        self.put(SERVICES, &tenant_key(tenant, &service.name), service)?;
        debug!(%tenant, name = %service.name, "service stored");
        Ok(())
    }

    pub fn get_service(&self, tenant: &str, name: &str) -> StateResult<Option<Service>> {
        self.get(SERVICES, &tenant_key(tenant, name))
    }

    pub fn list_services(&self, tenant: &str) -> StateResult<Vec<Service>> {
        self.scan(SERVICES, &format!("{tenant}/"))
    }

    /// All services of a tenant, keyed by name.
    pub fn service_catalog(&self, tenant: &str) -> StateResult<ServiceCatalog> {
        Ok(self
            .list_services(tenant)?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect())
    }

    pub fn delete_service(&self, tenant: &str, name: &str) -> StateResult<bool> {
        self.remove(SERVICES, &tenant_key(tenant, name))
    }

    // ── Cluster templates ──────────────────────────────────────────

    pub fn put_cluster_template(&self, tenant: &str, template: &ClusterTemplate) -> StateResult<()> {
        self.put(
            CLUSTER_TEMPLATES,
            &tenant_key(tenant, &template.name),
            template,
        )?;
        debug!(%tenant, name = %template.name, "cluster template stored");
        Ok(())
    }

    pub fn get_cluster_template(
        &self,
        tenant: &str,
        name: &str,
    ) -> StateResult<Option<ClusterTemplate>> {
        self.get(CLUSTER_TEMPLATES, &tenant_key(tenant, name))
    }

    pub fn list_cluster_templates(&self, tenant: &str) -> StateResult<Vec<ClusterTemplate>> {
        self.scan(CLUSTER_TEMPLATES, &format!("{tenant}/"))
    }

    pub fn delete_cluster_template(&self, tenant: &str, name: &str) -> StateResult<bool> {
        self.remove(CLUSTER_TEMPLATES, &tenant_key(tenant, name))
    }

    // ── Partial templates ──────────────────────────────────────────

    pub fn put_partial_template(&self, tenant: &str, partial: &PartialTemplate) -> StateResult<()> {
        self.put(
            PARTIAL_TEMPLATES,
            &tenant_key(tenant, &partial.name),
            partial,
        )?;
        debug!(%tenant, name = %partial.name, mandatory = partial.mandatory, "partial template stored");
        Ok(())
    }

    pub fn get_partial_template(
        &self,
        tenant: &str,
        name: &str,
    ) -> StateResult<Option<PartialTemplate>> {
        self.get(PARTIAL_TEMPLATES, &tenant_key(tenant, name))
    }

    pub fn list_partial_templates(&self, tenant: &str) -> StateResult<Vec<PartialTemplate>> {
        self.scan(PARTIAL_TEMPLATES, &format!("{tenant}/"))
    }

    /// Mandatory partials of a tenant, in name order.
    pub fn list_mandatory_partials(&self, tenant: &str) -> StateResult<Vec<PartialTemplate>> {
        Ok(self
            .list_partial_templates(tenant)?
            .into_iter()
            .filter(|p| p.mandatory)
            .collect())
    }

    pub fn delete_partial_template(&self, tenant: &str, name: &str) -> StateResult<bool> {
        self.remove(PARTIAL_TEMPLATES, &tenant_key(tenant, name))
    }

    // ── Tenants ────────────────────────────────────────────────────

    pub fn put_tenant(&self, tenant: &Tenant) -> StateResult<()> {
        self.put(TENANTS, &tenant.name, tenant)
    }

    pub fn get_tenant(&self, name: &str) -> StateResult<Option<Tenant>> {
        self.get(TENANTS, name)
    }

    pub fn list_tenants(&self) -> StateResult<Vec<Tenant>> {
        self.scan(TENANTS, "")
    }

    // ── Clusters ───────────────────────────────────────────────────

    pub fn put_cluster(&self, cluster: &Cluster) -> StateResult<()> {
        self.put(CLUSTERS, &cluster.id, cluster)?;
        debug!(cluster_id = %cluster.id, status = ?cluster.status, "cluster stored");
        Ok(())
    }

    pub fn get_cluster(&self, cluster_id: &str) -> StateResult<Option<Cluster>> {
        self.get(CLUSTERS, cluster_id)
    }

    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.scan(CLUSTERS, "")
    }

    pub fn list_clusters_for_tenant(&self, tenant: &str) -> StateResult<Vec<Cluster>> {
        Ok(self
            .list_clusters()?
            .into_iter()
            .filter(|c| c.tenant == tenant)
            .collect())
    }

    pub fn update_cluster<F>(&self, cluster_id: &str, apply: F) -> StateResult<Option<Cluster>>
    where
        F: FnOnce(&mut Cluster) -> bool,
    {
        self.update(CLUSTERS, cluster_id, apply)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put(NODES, &node.id, node)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes_for_cluster(&self, cluster_id: &str) -> StateResult<Vec<Node>> {
        Ok(self
            .scan::<Node>(NODES, &format!("{cluster_id}-n"))?
            .into_iter()
            .filter(|n| n.cluster_id == cluster_id)
            .collect())
    }

    pub fn update_node<F>(&self, node_id: &str, apply: F) -> StateResult<Option<Node>>
    where
        F: FnOnce(&mut Node) -> bool,
    {
        self.update(NODES, node_id, apply)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.put(JOBS, &job.id, job)?;
        debug!(job_id = %job.id, status = ?job.status, "job stored");
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> StateResult<Option<Job>> {
        self.get(JOBS, job_id)
    }

    /// Jobs of a cluster in submission order.
    pub fn list_jobs_for_cluster(&self, cluster_id: &str) -> StateResult<Vec<Job>> {
        Ok(self
            .scan::<Job>(JOBS, &format!("{cluster_id}-"))?
            .into_iter()
            .filter(|j| j.cluster_id == cluster_id)
            .collect())
    }

    /// Every job with the given status.
    pub fn list_jobs_with_status(&self, status: JobStatus) -> StateResult<Vec<Job>> {
        Ok(self
            .scan::<Job>(JOBS, "")?
            .into_iter()
            .filter(|j| j.status == status)
            .collect())
    }

    pub fn update_job<F>(&self, job_id: &str, apply: F) -> StateResult<Option<Job>>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        self.update(JOBS, job_id, apply)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &ClusterTask) -> StateResult<()> {
        self.write_tasks(std::slice::from_ref(task))
    }

    /// Insert a batch of freshly planned tasks in one transaction.
    pub fn put_tasks(&self, tasks: &[ClusterTask]) -> StateResult<()> {
        self.write_tasks(tasks)?;
        debug!(count = tasks.len(), "tasks stored");
        Ok(())
    }

    fn write_tasks(&self, tasks: &[ClusterTask]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut index = txn.open_table(TASKS_IN_PROGRESS).map_err(map_err!(Table))?;
            for task in tasks {
                let bytes = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
                table
                    .insert(task.id.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                index_task(&mut index, task)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<ClusterTask>> {
        self.get(TASKS, task_id)
    }

    /// Tasks of a job in creation order.
    pub fn list_tasks_for_job(&self, job_id: &str) -> StateResult<Vec<ClusterTask>> {
        Ok(self
            .scan::<ClusterTask>(TASKS, &format!("{job_id}-"))?
            .into_iter()
            .filter(|t| t.job_id == job_id)
            .collect())
    }

    /// Every `InProgress` task. Reads only the in-progress index and the
    /// tasks it names, so the cost follows what is in flight rather than
    /// the size of the task history.
    pub fn list_in_progress_tasks(&self) -> StateResult<Vec<ClusterTask>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn
            .open_table(TASKS_IN_PROGRESS)
            .map_err(map_err!(Table))?;
        let tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in index.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(guard) = tasks.get(key.value()).map_err(map_err!(Read))? {
                let task: ClusterTask =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                results.push(task);
            }
        }
        Ok(results)
    }

    /// `InProgress` task count per tenant, from the in-progress index alone.
    pub fn in_progress_by_tenant(&self) -> StateResult<BTreeMap<TenantId, u32>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn
            .open_table(TASKS_IN_PROGRESS)
            .map_err(map_err!(Table))?;
        let mut counts = BTreeMap::new();
        for entry in index.iter().map_err(map_err!(Read))? {
            let (_, tenant) = entry.map_err(map_err!(Read))?;
            *counts.entry(tenant.value().to_string()).or_default() += 1;
        }
        Ok(counts)
    }

    pub fn update_task<F>(&self, task_id: &str, apply: F) -> StateResult<Option<ClusterTask>>
    where
        F: FnOnce(&mut ClusterTask) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut index = txn.open_table(TASKS_IN_PROGRESS).map_err(map_err!(Table))?;
            let updated: Option<ClusterTask> = update_entry(&mut table, task_id, apply)?;
            if let Some(task) = &updated {
                index_task(&mut index, task)?;
            }
            updated
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Workers ────────────────────────────────────────────────────

    pub fn put_worker(&self, worker: &Worker) -> StateResult<()> {
        self.put(WORKERS, &worker.id, worker)
    }

    pub fn get_worker(&self, worker_id: &str) -> StateResult<Option<Worker>> {
        self.get(WORKERS, worker_id)
    }

    pub fn list_workers(&self) -> StateResult<Vec<Worker>> {
        self.scan(WORKERS, "")
    }

    pub fn update_worker<F>(&self, worker_id: &str, apply: F) -> StateResult<Option<Worker>>
    where
        F: FnOnce(&mut Worker) -> bool,
    {
        self.update(WORKERS, worker_id, apply)
    }

    pub fn delete_worker(&self, worker_id: &str) -> StateResult<bool> {
        self.remove(WORKERS, worker_id)
    }

    // ── Cluster locks ──────────────────────────────────────────────

    /// Acquire the cluster's exclusive job lock for `job_id`.
    ///
    /// Returns false if any job (including `job_id`) already holds it.
    pub fn try_lock_cluster(&self, cluster_id: &str, job_id: &str, now: u64) -> StateResult<bool> {
        let lock = ClusterLock {
            cluster_id: cluster_id.to_string(),
            job_id: job_id.to_string(),
            acquired_at: now,
        };
        let bytes = serde_json::to_vec(&lock).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(CLUSTER_LOCKS).map_err(map_err!(Table))?;
            let held = table.get(cluster_id).map_err(map_err!(Read))?.is_some();
            if held {
                acquired = false;
            } else {
                table
                    .insert(cluster_id, bytes.as_slice())
                    .map_err(map_err!(Write))?;
                acquired = true;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if acquired {
            debug!(%cluster_id, %job_id, "cluster lock acquired");
        }
        Ok(acquired)
    }

    /// Release the cluster lock if `job_id` holds it.
    pub fn unlock_cluster(&self, cluster_id: &str, job_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(CLUSTER_LOCKS).map_err(map_err!(Table))?;
            let holder: Option<ClusterLock> = match table.get(cluster_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            released = holder.is_some_and(|l| l.job_id == job_id);
            if released {
                table.remove(cluster_id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if released {
            debug!(%cluster_id, %job_id, "cluster lock released");
        }
        Ok(released)
    }

    pub fn cluster_lock(&self, cluster_id: &str) -> StateResult<Option<ClusterLock>> {
        self.get(CLUSTER_LOCKS, cluster_id)
    }

    /// Every held cluster lock, in cluster id order.
    pub fn list_cluster_locks(&self) -> StateResult<Vec<ClusterLock>> {
        self.scan(CLUSTER_LOCKS, "")
    }
}
