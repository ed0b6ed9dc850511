//! Error types for template resolution.

use provgrid_state::StateError;
use thiserror::Error;

pub type TemplateResult<T> = Result<T, TemplateError>;

#[derive(Debug, Error)]
pub enum TemplateError {
    /// The resolved template is incomplete or inconsistent.
    #[error("invalid template: {0}")]
    Validation(String),

    /// A layer tried to change a value pinned by an earlier layer.
    #[error("{attempted_by} cannot change {key}: pinned by {pinned_by}")]
    Immutability {
        key: String,
        pinned_by: String,
        attempted_by: String,
    },

    #[error("cluster template not found: {0}")]
    MissingTemplate(String),

    #[error("partial template not found: {0}")]
    MissingPartial(String),

    #[error("parent cycle: {}", chain.join(" -> "))]
    ParentCycle { chain: Vec<String> },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error(transparent)]
    State(#[from] StateError),
}
