//! Catalog lookups the resolver needs.

use provgrid_state::{ClusterTemplate, PartialTemplate, StateStore};

use crate::error::TemplateResult;

/// Read access to a tenant's templates and partials.
pub trait TemplateSource {
    fn cluster_template(&self, tenant: &str, name: &str)
    -> TemplateResult<Option<ClusterTemplate>>;

    fn partial_template(&self, tenant: &str, name: &str)
    -> TemplateResult<Option<PartialTemplate>>;

    /// Every mandatory partial of the tenant, in name order.
    fn mandatory_partials(&self, tenant: &str) -> TemplateResult<Vec<PartialTemplate>>;
}

impl TemplateSource for StateStore {
    fn cluster_template(
        &self,
        tenant: &str,
        name: &str,
    ) -> TemplateResult<Option<ClusterTemplate>> {
        Ok(self.get_cluster_template(tenant, name)?)
    }

    fn partial_template(
        &self,
        tenant: &str,
        name: &str,
    ) -> TemplateResult<Option<PartialTemplate>> {
        Ok(self.get_partial_template(tenant, name)?)
    }

    fn mandatory_partials(&self, tenant: &str) -> TemplateResult<Vec<PartialTemplate>> {
        Ok(self.list_mandatory_partials(tenant)?)
    }
}
