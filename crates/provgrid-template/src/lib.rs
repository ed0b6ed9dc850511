//! provgrid-template — cluster template resolution.
//!
//! A cluster template may name a parent template and include partial
//! templates; tenants may also mark partials as mandatory so they apply to
//! every template. Resolution flattens all of that into one self-contained
//! [`ClusterTemplate`](provgrid_state::ClusterTemplate):
//!
//! 1. walk the parent chain to its root (cycles are rejected),
//! 2. lay out the layers from least to most specific,
//! 3. fold them left to right, tracking which layer pinned which key,
//! 4. validate the result.
//!
//! Resolution is pure: the same catalog and body always produce the same
//! JSON and therefore the same [`fingerprint`].

pub mod error;
pub mod resolver;
pub mod source;

pub use error::{TemplateError, TemplateResult};
pub use resolver::{TemplateResolver, fingerprint, validate};
pub use source::TemplateSource;
