//! provgrid-state — entity store for the provgrid control plane.
//!
//! Backed by [redb](https://docs.rs/redb), this crate persists services,
//! cluster and partial templates, tenants, clusters, nodes, jobs, tasks and
//! provisioner workers.
//!
//! # Architecture
//!
//! All entities are JSON-serialized into redb's `&[u8]` value columns.
//! Catalog entities are tenant-scoped (`{tenant}/{name}`); runtime entities
//! are keyed by ids that embed their parent (`{cluster_id}-{seq}` for jobs,
//! `{job_id}-{index}` for tasks) so that prefix scans return children in
//! creation order.
//!
//! Every status transition goes through an `update_*` method, which reads,
//! checks and writes a single entity inside one write transaction. The
//! closure decides whether the write happens, giving compare-and-set
//! semantics: a late or stale update simply returns `None`.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
