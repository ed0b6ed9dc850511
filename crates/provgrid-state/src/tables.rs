//! redb table definitions for the provgrid state store.
//!
//! Entity tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Catalog keys follow `{tenant}/{name}`; runtime keys are entity ids.

use redb::TableDefinition;

/// Service definitions keyed by `{tenant}/{name}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Cluster templates keyed by `{tenant}/{name}`.
pub const CLUSTER_TEMPLATES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("cluster_templates");

/// Partial templates keyed by `{tenant}/{name}`.
pub const PARTIAL_TEMPLATES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("partial_templates");

/// Tenants keyed by name.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Clusters keyed by cluster id.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Nodes keyed by `{cluster_id}-n{seq}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Jobs keyed by `{cluster_id}-{seq}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Tasks keyed by `{job_id}-{index}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Index of `InProgress` tasks: task id to tenant. Kept in step with
/// `TASKS` inside the same write transaction.
pub const TASKS_IN_PROGRESS: TableDefinition<&str, &str> =
    TableDefinition::new("tasks_in_progress");

/// Provisioner workers keyed by worker id.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Exclusive per-cluster job locks keyed by cluster id.
pub const CLUSTER_LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_locks");

/// Monotonic id counters keyed by entity kind.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
