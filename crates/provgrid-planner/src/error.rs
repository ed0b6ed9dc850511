//! Error types for task planning.

use thiserror::Error;

pub type PlannerResult<T> = Result<T, PlannerError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("service dependency cycle: {}", services.join(" -> "))]
    DependencyCycle { services: Vec<String> },

    #[error("service {0} is not in the catalog")]
    UnknownService(String),

    #[error("service {0} is not deployed in the cluster")]
    NotInCluster(String),
}
