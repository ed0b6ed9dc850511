//! provd — the provgrid daemon.
//!
//! The binary wires the state store, the orchestrator and an HTTP
//! provisioner client together and runs the background loops. The pieces
//! it needs beyond the library crates live here so they can be tested:
//!
//! - **`catalog`**: loads service, template, partial, tenant and worker
//!   documents from a directory and seeds them into the store
//! - **`provisioner`**: [`HttpProvisioner`], the HTTP/1 JSON
//!   [`ProvisionerClient`](provgrid_scheduler::ProvisionerClient)

pub mod catalog;
pub mod provisioner;

pub use catalog::{Catalog, CatalogError, CatalogResult, ResolvedTemplate};
pub use provisioner::HttpProvisioner;
