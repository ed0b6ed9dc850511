//! provgrid task planning: turns a layout change into staged provisioner tasks.
//!
//! A cluster operation becomes a DAG of tasks (one provisioner action on one
//! node, optionally for one service). The DAG is levelled by longest path
//! into stages: every task of a stage may run concurrently, and stage N+1
//! starts only once stage N has completed.
//!
//! # Components
//!
//! - **`graph`**: [`TaskGraph`] and the DAG levelling
//! - **`builder`**: [`TaskGraphBuilder`] for layout changes and service operations

pub mod builder;
pub mod error;
pub mod graph;

pub use builder::{ServiceOperation, TaskGraphBuilder};
pub use error::{PlannerError, PlannerResult};
pub use graph::{PlannedTask, TaskGraph};
