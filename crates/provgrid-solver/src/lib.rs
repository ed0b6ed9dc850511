//! provgrid layout solver.
//!
//! Turns a resolved template, the service catalog and a cluster request into
//! a target layout: an ordered list of node slots, each with a hardware type,
//! image type, provider and service set.
//!
//! # Components
//!
//! - **`solver`**: greedy placement for create, add/remove services and resize
//! - **`validate`**: constraint checks run over any layout
//! - **`error`**: [`Violation`] names the constraint a request cannot meet

pub mod error;
pub mod solver;
pub mod validate;

pub use error::{Bound, CompatKind, SolverError, SolverResult, Violation};
pub use solver::{SolveRequest, Solver};
pub use validate::validate_layout;
