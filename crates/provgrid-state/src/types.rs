//! Domain types for the provgrid state store.
//!
//! Catalog types (services, templates, partials) mirror the JSON documents
//! operators author, so they use camelCase field names and tolerate missing
//! sections. Ordered collections keep serialization deterministic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use provgrid_core::ProvisionerAction;

pub type TenantId = String;
pub type ClusterId = String;
pub type NodeId = String;
pub type JobId = String;
pub type TaskId = String;
pub type WorkerId = String;

// ── Services ──────────────────────────────────────────────────────

/// Ordering and placement relationships between services.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceDependencies {
    /// Services that must be present in the cluster and started first.
    pub requires: BTreeSet<String>,
    /// Services started first when present, but not required.
    pub uses: BTreeSet<String>,
    /// Services that may never share a node with this one.
    pub conflicts: BTreeSet<String>,
}

impl ServiceDependencies {
    /// Services this one must be ordered after (`requires` ∪ `uses`).
    pub fn ordered_after(&self) -> impl Iterator<Item = &String> {
        self.requires.iter().chain(self.uses.iter())
    }
}

/// Script reference a provisioner runs for one action of one service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAction {
    /// Automator type, e.g. `chef-solo` or `shell`.
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// A service that can be placed on cluster nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: ServiceDependencies,
    #[serde(default)]
    pub provisioner_actions: BTreeMap<ProvisionerAction, ServiceAction>,
}

impl Service {
    pub fn new(
        name: &str,
        dependencies: ServiceDependencies,
        provisioner_actions: BTreeMap<ProvisionerAction, ServiceAction>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            dependencies,
            provisioner_actions,
        }
    }

    pub fn action(&self, action: ProvisionerAction) -> Option<&ServiceAction> {
        self.provisioner_actions.get(&action)
    }
}

/// Service catalog keyed by service name.
pub type ServiceCatalog = BTreeMap<String, Service>;

// ── Templates ─────────────────────────────────────────────────────

/// Default cluster settings contributed by a template layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterDefaults {
    pub services: BTreeSet<String>,
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardwaretype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imagetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_suffix: Option<String>,
}

/// Service groups that must, or must not, share nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutConstraint {
    pub must_coexist: BTreeSet<BTreeSet<String>>,
    pub cant_coexist: BTreeSet<BTreeSet<String>>,
}

/// Placement bounds for a single service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConstraint {
    pub required_hardwaretypes: BTreeSet<String>,
    pub required_imagetypes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
}

impl ServiceConstraint {
    /// Effective `[min, max]` node count for a cluster of `size` nodes.
    ///
    /// A service without explicit bounds lives on at least one node.
    pub fn bounds(&self, size: u32) -> (u32, u32) {
        let min = self.min_count.unwrap_or(1);
        let max = self.max_count.unwrap_or(size).min(size);
        (min, max)
    }
}

/// Bounds on the number of nodes in a cluster.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SizeConstraint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Constraints {
    pub layout: LayoutConstraint,
    pub services: BTreeMap<String, ServiceConstraint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<SizeConstraint>,
}

/// Allowed hardware types, image types and services. An empty set places
/// no restriction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Compatibilities {
    pub hardwaretypes: BTreeSet<String>,
    pub imagetypes: BTreeSet<String>,
    pub services: BTreeSet<String>,
}

impl Compatibilities {
    pub fn allows_hardwaretype(&self, hardwaretype: &str) -> bool {
        self.hardwaretypes.is_empty() || self.hardwaretypes.contains(hardwaretype)
    }

    pub fn allows_imagetype(&self, imagetype: &str) -> bool {
        self.imagetypes.is_empty() || self.imagetypes.contains(imagetype)
    }

    pub fn allows_service(&self, service: &str) -> bool {
        self.services.is_empty() || self.services.contains(service)
    }
}

/// Cluster lease durations in milliseconds; zero means unbounded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaseDuration {
    pub initial: u64,
    pub max: u64,
    pub step: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Administration {
    pub lease_duration: LeaseDuration,
}

/// A (possibly unresolved) cluster template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub cluster_defaults: ClusterDefaults,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub compatibilities: Compatibilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub administration: Option<Administration>,
}

impl ClusterTemplate {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Constraint for `service`, or the unbounded default.
    pub fn service_constraint(&self, service: &str) -> ServiceConstraint {
        self.constraints
            .services
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    pub fn lease(&self) -> LeaseDuration {
        self.administration
            .map(|a| a.lease_duration)
            .unwrap_or_default()
    }
}

/// A reusable template fragment, optionally applied to every template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartialTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Applied to every template of the tenant, included or not.
    #[serde(default)]
    pub mandatory: bool,
    /// Every value this partial sets is pinned against later layers.
    #[serde(default)]
    pub immutable: bool,
    /// Config keys pinned even when the partial is not wholly immutable.
    #[serde(default)]
    pub immutable_config: BTreeSet<String>,
    #[serde(default)]
    pub cluster_defaults: ClusterDefaults,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub compatibilities: Compatibilities,
}

impl PartialTemplate {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

// ── Tenants ───────────────────────────────────────────────────────

/// Per-tenant admission limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub name: TenantId,
    /// Maximum number of tasks in flight on workers at once.
    pub workers: u32,
}

// ── Clusters and nodes ───────────────────────────────────────────

/// Lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    /// A job is acting on the cluster.
    Pending,
    Active,
    /// The last job failed or was cancelled.
    Incomplete,
    Terminated,
}

/// Hardware, image and services of one node slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeLayout {
    pub hardwaretype: String,
    pub imagetype: String,
    pub provider: String,
    pub services: BTreeSet<String>,
}

/// A node slot in a planned layout, with its (possibly pre-assigned) id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedNode {
    pub id: NodeId,
    pub layout: NodeLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub tenant: TenantId,
    pub name: String,
    /// Resolved template snapshot, frozen at creation.
    pub template: ClusterTemplate,
    /// SHA-256 of the snapshot's canonical JSON.
    pub template_fingerprint: String,
    pub nodes: Vec<NodeId>,
    pub services: BTreeSet<String>,
    pub status: ClusterStatus,
    pub created_at: u64,
    /// Lease expiry (epoch ms); `None` never expires.
    pub expire_at: Option<u64>,
    pub latest_job: Option<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Active,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub cluster_id: ClusterId,
    pub layout: NodeLayout,
    pub status: NodeStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Jobs ──────────────────────────────────────────────────────────

/// A cluster-mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterAction {
    Create,
    Delete,
    AddServices { services: BTreeSet<String> },
    RemoveServices { services: BTreeSet<String> },
    Resize { size: u32 },
    /// An empty set acts on every service of the cluster.
    StartServices { services: BTreeSet<String> },
    StopServices { services: BTreeSet<String> },
    RestartServices { services: BTreeSet<String> },
    Configure { restart: bool },
}

impl ClusterAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterAction::Create => "create",
            ClusterAction::Delete => "delete",
            ClusterAction::AddServices { .. } => "add_services",
            ClusterAction::RemoveServices { .. } => "remove_services",
            ClusterAction::Resize { .. } => "resize",
            ClusterAction::StartServices { .. } => "start_services",
            ClusterAction::StopServices { .. } => "stop_services",
            ClusterAction::RestartServices { .. } => "restart_services",
            ClusterAction::Configure { .. } => "configure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub cluster_id: ClusterId,
    pub tenant: TenantId,
    pub action: ClusterAction,
    pub status: JobStatus,
    /// Layout the cluster has once the job completes.
    pub target: Vec<PlannedNode>,
    /// Task ids per stage; empty until the job is dequeued.
    pub stages: Vec<Vec<TaskId>>,
    pub planned: bool,
    pub current_stage: usize,
    pub created_at: u64,
    pub updated_at: u64,
    pub failure: Option<String>,
}

impl Job {
    pub fn current_stage_tasks(&self) -> &[TaskId] {
        self.stages
            .get(self.current_stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotSubmitted,
    InProgress,
    Complete,
    Failed,
    Dropped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Dropped
        )
    }
}

/// One provisioner action on one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub cluster_id: ClusterId,
    pub tenant: TenantId,
    pub node_id: NodeId,
    pub service: Option<String>,
    pub action: ProvisionerAction,
    pub service_action: Option<ServiceAction>,
    /// Node layout the provisioner acts on.
    pub node: NodeLayout,
    pub stage: usize,
    pub status: TaskStatus,
    /// Dispatches made so far; the retry count is `attempts - 1`.
    pub attempts: u32,
    pub worker: Option<WorkerId>,
    pub created_at: u64,
    pub submitted_at: Option<u64>,
    pub updated_at: u64,
    /// Earliest time (epoch ms) the task may be dispatched again.
    pub not_before: u64,
    pub last_error: Option<String>,
}

impl ClusterTask {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

// ── Workers ───────────────────────────────────────────────────────

/// A provisioner worker able to run tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub id: WorkerId,
    /// Base URL the provisioner accepts tasks on.
    pub endpoint: String,
    /// Maximum tasks in flight at once.
    pub capacity: u32,
    /// Tenants served; empty serves every tenant.
    pub tenants: BTreeSet<TenantId>,
    pub in_flight: BTreeSet<TaskId>,
    pub registered_at: u64,
    pub last_heartbeat: u64,
}

impl Worker {
    pub fn new(id: &str, endpoint: &str, capacity: u32, now: u64) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            capacity,
            tenants: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn load(&self) -> u32 {
        self.in_flight.len() as u32
    }

    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.load())
    }

    pub fn serves(&self, tenant: &str) -> bool {
        self.tenants.is_empty() || self.tenants.contains(tenant)
    }
}

/// Holder of a cluster's exclusive job lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterLock {
    pub cluster_id: ClusterId,
    pub job_id: JobId,
    pub acquired_at: u64,
}

// ── Keys ──────────────────────────────────────────────────────────

/// Composite key for tenant-scoped catalog entities.
pub fn tenant_key(tenant: &str, name: &str) -> String {
    format!("{tenant}/{name}")
}

pub fn job_id(cluster_id: &str, seq: u64) -> JobId {
    format!("{cluster_id}-{seq:010}")
}

pub fn task_id(job_id: &str, index: usize) -> TaskId {
    format!("{job_id}-{index:05}")
}

pub fn node_id(cluster_id: &str, seq: u64) -> NodeId {
    format!("{cluster_id}-n{seq}")
}
