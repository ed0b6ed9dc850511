pub mod config;
pub mod types;

pub use config::{ProvgridConfig, parse_duration};
pub use types::*;
