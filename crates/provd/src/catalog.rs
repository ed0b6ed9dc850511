//! Catalog documents on disk.
//!
//! ```text
//! catalog/
//!   tenants/<tenant>.json              Tenant
//!   workers/<worker>.json              WorkerRegistration
//!   <tenant>/services/<name>.json      Service
//!   <tenant>/templates/<name>.json     ClusterTemplate
//!   <tenant>/partials/<name>.json      PartialTemplate
//! ```
//!
//! Files that are not `*.json` are skipped. Files are read in path order so
//! seeding is deterministic.

use std::path::{Path, PathBuf};

use provgrid_scheduler::WorkerRegistration;
use provgrid_state::{
    ClusterTemplate, PartialTemplate, Service, StateError, StateStore, Tenant,
};
use provgrid_template::{TemplateError, TemplateResolver, fingerprint};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("walking {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The file is not in a recognised directory.
    #[error("{0}: not under tenants/, workers/ or <tenant>/{{services,templates,partials}}/")]
    Layout(PathBuf),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Every document found under a catalog directory.
#[derive(Debug, Default)]
pub struct Catalog {
    pub tenants: Vec<Tenant>,
    pub workers: Vec<WorkerRegistration>,
    pub services: Vec<(String, Service)>,
    pub templates: Vec<(String, ClusterTemplate)>,
    pub partials: Vec<(String, PartialTemplate)>,
}

/// A resolved template and its fingerprint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolvedTemplate {
    pub fingerprint: String,
    pub template: ClusterTemplate,
}

impl Catalog {
    pub fn load(root: &Path) -> CatalogResult<Self> {
        let mut catalog = Catalog::default();
        let walker = WalkDir::new(root).sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|source| CatalogError::Walk {
                path: root.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().is_none_or(|ext| ext != "json")
            {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(path);
            let parts: Vec<&str> = relative
                .iter()
                .filter_map(|part| part.to_str())
                .collect();
            match parts.as_slice() {
                ["tenants", _] => catalog.tenants.push(read(path)?),
                ["workers", _] => catalog.workers.push(read(path)?),
                [tenant, "services", _] => {
                    catalog.services.push((tenant.to_string(), read(path)?));
                }
                [tenant, "templates", _] => {
                    catalog.templates.push((tenant.to_string(), read(path)?));
                }
                [tenant, "partials", _] => {
                    catalog.partials.push((tenant.to_string(), read(path)?));
                }
                _ => return Err(CatalogError::Layout(relative.to_path_buf())),
            }
            debug!(path = %relative.display(), "catalog document loaded");
        }
        Ok(catalog)
    }

    /// Write tenants, services, templates and partials into `state`.
    ///
    /// Workers are not written here; they go through worker registration.
    pub fn seed(&self, state: &StateStore) -> CatalogResult<()> {
        for tenant in &self.tenants {
            state.put_tenant(tenant)?;
        }
        for (tenant, service) in &self.services {
            state.put_service(tenant, service)?;
        }
        for (tenant, template) in &self.templates {
            state.put_cluster_template(tenant, template)?;
        }
        for (tenant, partial) in &self.partials {
            state.put_partial_template(tenant, partial)?;
        }
        info!(
            tenants = self.tenants.len(),
            services = self.services.len(),
            templates = self.templates.len(),
            partials = self.partials.len(),
            workers = self.workers.len(),
            "catalog seeded"
        );
        Ok(())
    }

    /// Resolve `template` for `tenant` against this catalog alone.
    pub fn resolve(
        &self,
        tenant: &str,
        template: &str,
        mandatory_order: Vec<String>,
    ) -> CatalogResult<ResolvedTemplate> {
        let state = StateStore::open_in_memory()?;
        self.seed(&state)?;
        let template =
            TemplateResolver::new(mandatory_order).resolve_named(&state, tenant, template)?;
        Ok(ResolvedTemplate {
            fingerprint: fingerprint(&template)?,
            template,
        })
    }
}

fn read<T: DeserializeOwned>(path: &Path) -> CatalogResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(root: &Path, relative: &str, value: serde_json::Value) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    #[test]
    fn documents_are_classified_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "tenants/acme.json", json!({"name": "acme", "workers": 4}));
        write(
            dir.path(),
            "workers/w1.json",
            json!({"id": "w1", "endpoint": "http://127.0.0.1:7000", "capacity": 2}),
        );
        write(dir.path(), "acme/services/base.json", json!({"name": "base"}));
        write(
            dir.path(),
            "acme/templates/base.json",
            json!({"name": "base", "clusterDefaults": {"provider": "rackspace"}}),
        );
        write(
            dir.path(),
            "acme/partials/security.json",
            json!({"name": "security", "mandatory": true}),
        );
        std::fs::write(dir.path().join("README.md"), "not a document").unwrap();

        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.tenants[0].workers, 4);
        assert_eq!(catalog.workers[0].id, "w1");
        assert!(catalog.workers[0].tenants.is_empty());
        assert_eq!(catalog.services[0].0, "acme");
        assert_eq!(catalog.templates[0].1.name, "base");
        assert!(catalog.partials[0].1.mandatory);

        let state = StateStore::open_in_memory().unwrap();
        catalog.seed(&state).unwrap();
        assert!(state.get_service("acme", "base").unwrap().is_some());
        assert_eq!(state.list_mandatory_partials("acme").unwrap().len(), 1);
        assert!(state.list_workers().unwrap().is_empty());
    }

    #[test]
    fn misplaced_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "acme/base.json", json!({"name": "base"}));
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::Layout(_))
        ));
    }

    #[test]
    fn malformed_document_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("acme.json"), "{\"name\": ").unwrap();
        match Catalog::load(dir.path()) {
            Err(CatalogError::Parse { path, .. }) => assert!(path.ends_with("acme.json")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
