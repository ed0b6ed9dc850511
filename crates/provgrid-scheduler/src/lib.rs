//! provgrid-scheduler — cluster job orchestration.
//!
//! Turns cluster requests into jobs, plans each job into staged tasks and
//! drives those tasks through provisioner workers until the job completes,
//! fails or is cancelled.
//!
//! - Every mutating request becomes a queued job; at most one job per
//!   cluster runs at a time, guarded by a lock in the state store
//! - Runnable tasks are placed on the least-loaded live worker, within the
//!   tenant's quota
//! - Failed attempts are retried with exponential backoff; a task out of
//!   retries fails its job exactly once
//! - Job events are delivered to a [`ClusterCallback`] off the scheduling path
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── TemplateResolver ─▶ Solver ─▶ TaskGraphBuilder   (request validation, planning)
//!   ├── JobScheduler      (per-cluster queues, job state machine, cluster lock)
//!   │     └── CallbackDispatcher ─▶ bounded queue ─▶ ClusterCallback
//!   ├── WorkerBalancer    (runnable FIFO, least-loaded + rotating selection)
//!   ├── TaskExecutor      (ProvisionerClient dispatch, retries, timeouts)
//!   └── lease             (expiry, extension, sweep)
//! ```

pub mod callback;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod lease;
pub mod orchestrator;
pub mod workers;

pub use callback::{
    CallbackDispatcher, ClusterCallback, ClusterEvent, ClusterEventKind, LoggingCallback,
};
pub use error::{SchedulerError, SchedulerResult};
pub use executor::{
    AttemptOutcome, ProvisionerClient, ProvisionerError, RetryPolicy, TaskDispatch,
    TaskExecutor, TaskOutcome, TaskReport,
};
pub use jobs::JobScheduler;
pub use orchestrator::{ClusterStatusView, CreateClusterRequest, JobProgress, Orchestrator};
pub use workers::{RotatingSelector, WorkerBalancer, WorkerRegistration};
