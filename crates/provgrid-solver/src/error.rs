//! Error types for the layout solver.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

pub type SolverResult<T> = Result<T, SolverError>;

#[derive(Debug, Error)]
pub enum SolverError {
    /// No layout satisfies the template's constraints.
    #[error("unsatisfiable: {0}")]
    Unsatisfiable(Violation),

    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The request itself is incomplete or contradictory.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl From<Violation> for SolverError {
    fn from(violation: Violation) -> Self {
        SolverError::Unsatisfiable(violation)
    }
}

/// Which side of a count constraint was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Min(u32),
    Max(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatKind {
    Hardwaretype,
    Imagetype,
    Service,
}

impl fmt::Display for CompatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompatKind::Hardwaretype => "hardwaretype",
            CompatKind::Imagetype => "imagetype",
            CompatKind::Service => "service",
        })
    }
}

/// The specific constraint a layout breaks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("service {service} needs {bound:?} nodes but {available} are available")]
    ServiceCount {
        service: String,
        bound: Bound,
        available: u32,
    },

    #[error("services {services:?} must share nodes")]
    MustCoexist { services: BTreeSet<String> },

    #[error("services {services:?} cannot share a node")]
    CantCoexist { services: BTreeSet<String> },

    #[error("{kind} {value} is not compatible with the template")]
    Incompatible { kind: CompatKind, value: String },

    #[error("service {service} requires {requires}")]
    MissingDependency { service: String, requires: String },

    #[error("service {service} is not in the catalog")]
    UnknownService { service: String },

    #[error("cluster size {requested} outside [{min}, {max}]")]
    ClusterSize { requested: u32, min: u32, max: u32 },

    #[error("no service can be placed on node {node}")]
    NoPlacement { node: usize },

    #[error("services {services:?} have no hardware or image type in common")]
    HardwareConflict { services: BTreeSet<String> },

    #[error("removing {service} breaks {required_by}")]
    RemovalBreaksDependency { service: String, required_by: String },
}
