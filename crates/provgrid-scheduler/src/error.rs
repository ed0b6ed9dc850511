//! Scheduler error types.

use provgrid_core::config::ConfigError;
use provgrid_planner::PlannerError;
use provgrid_solver::SolverError;
use provgrid_state::StateError;
use provgrid_template::TemplateError;
use thiserror::Error;

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The request is malformed; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The entity is in a state that does not allow the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SchedulerError {
    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        SchedulerError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
