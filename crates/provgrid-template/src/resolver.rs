//! Layered template resolution.
//!
//! Layers are applied from least to most specific:
//!
//! ```text
//! for each ancestor (root first): its included partials, then its body
//! mandatory partials (configured order, then name order)
//! the body's included partials
//! the body
//! ```
//!
//! Set-valued fields merge by union. Keyed and scalar fields are overridden
//! by later layers, except keys pinned by an immutable or mandatory layer:
//! a later layer may repeat the pinned value but never change it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use provgrid_state::{
    Administration, ClusterDefaults, ClusterTemplate, Compatibilities, Constraints,
    PartialTemplate,
};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::source::TemplateSource;

/// Which keys a layer pins against later layers.
#[derive(Debug, Clone)]
enum Pinning {
    Nothing,
    Everything,
    ConfigKeys(BTreeSet<String>),
}

/// One unit of the fold.
#[derive(Debug, Clone)]
struct Layer {
    label: String,
    pinning: Pinning,
    defaults: ClusterDefaults,
    constraints: Constraints,
    compatibilities: Compatibilities,
    administration: Option<Administration>,
}

impl Layer {
    fn from_template(template: &ClusterTemplate) -> Self {
        Self {
            label: format!("template {}", template.name),
            pinning: Pinning::Nothing,
            defaults: template.cluster_defaults.clone(),
            constraints: template.constraints.clone(),
            compatibilities: template.compatibilities.clone(),
            administration: template.administration,
        }
    }

    fn from_partial(partial: &PartialTemplate) -> Self {
        let pinning = if partial.immutable || partial.mandatory {
            Pinning::Everything
        } else if !partial.immutable_config.is_empty() {
            Pinning::ConfigKeys(partial.immutable_config.clone())
        } else {
            Pinning::Nothing
        };
        Self {
            label: format!("partial {}", partial.name),
            pinning,
            defaults: partial.cluster_defaults.clone(),
            constraints: partial.constraints.clone(),
            compatibilities: partial.compatibilities.clone(),
            administration: None,
        }
    }

    fn pins(&self, key: &str) -> bool {
        match &self.pinning {
            Pinning::Nothing => false,
            Pinning::Everything => true,
            Pinning::ConfigKeys(keys) => key
                .strip_prefix("config.")
                .is_some_and(|config_key| keys.contains(config_key)),
        }
    }
}

/// Accumulated state of the fold, plus the pin-origin map.
#[derive(Debug, Default)]
struct Fold {
    defaults: ClusterDefaults,
    constraints: Constraints,
    compatibilities: Compatibilities,
    administration: Option<Administration>,
    /// key → label of the layer that pinned it.
    pins: BTreeMap<String, String>,
}

/// Decide whether `layer` may write `value` over `current` at `key`.
///
/// Returns `Ok(false)` when the key is pinned and the value is unchanged.
fn admit<T: PartialEq>(
    pins: &mut BTreeMap<String, String>,
    key: String,
    layer: &Layer,
    current: Option<&T>,
    value: &T,
) -> TemplateResult<bool> {
    if let Some(origin) = pins.get(&key) {
        if current == Some(value) {
            return Ok(false);
        }
        return Err(TemplateError::Immutability {
            key,
            pinned_by: origin.clone(),
            attempted_by: layer.label.clone(),
        });
    }
    if layer.pins(&key) {
        pins.insert(key, layer.label.clone());
    }
    Ok(true)
}

fn fold_scalar(
    pins: &mut BTreeMap<String, String>,
    key: &str,
    layer: &Layer,
    slot: &mut Option<String>,
    value: &Option<String>,
) -> TemplateResult<()> {
    if let Some(value) = value {
        if admit(pins, key.to_string(), layer, slot.as_ref(), value)? {
            *slot = Some(value.clone());
        }
    }
    Ok(())
}

impl Fold {
    fn apply(&mut self, layer: &Layer) -> TemplateResult<()> {
        let defaults = &layer.defaults;

        self.defaults
            .services
            .extend(defaults.services.iter().cloned());

        for (key, value) in &defaults.config {
            if admit(
                &mut self.pins,
                format!("config.{key}"),
                layer,
                self.defaults.config.get(key),
                value,
            )? {
                self.defaults.config.insert(key.clone(), value.clone());
            }
        }

        fold_scalar(
            &mut self.pins,
            "provider",
            layer,
            &mut self.defaults.provider,
            &defaults.provider,
        )?;
        fold_scalar(
            &mut self.pins,
            "hardwaretype",
            layer,
            &mut self.defaults.hardwaretype,
            &defaults.hardwaretype,
        )?;
        fold_scalar(
            &mut self.pins,
            "imagetype",
            layer,
            &mut self.defaults.imagetype,
            &defaults.imagetype,
        )?;
        fold_scalar(
            &mut self.pins,
            "dnsSuffix",
            layer,
            &mut self.defaults.dns_suffix,
            &defaults.dns_suffix,
        )?;

        let constraints = &layer.constraints;
        self.constraints
            .layout
            .must_coexist
            .extend(constraints.layout.must_coexist.iter().cloned());
        self.constraints
            .layout
            .cant_coexist
            .extend(constraints.layout.cant_coexist.iter().cloned());

        for (service, constraint) in &constraints.services {
            if admit(
                &mut self.pins,
                format!("constraints.services.{service}"),
                layer,
                self.constraints.services.get(service),
                constraint,
            )? {
                self.constraints
                    .services
                    .insert(service.clone(), constraint.clone());
            }
        }

        if let Some(size) = &constraints.size {
            if admit(
                &mut self.pins,
                "constraints.size".to_string(),
                layer,
                self.constraints.size.as_ref(),
                size,
            )? {
                self.constraints.size = Some(*size);
            }
        }

        let compat = &layer.compatibilities;
        self.compatibilities
            .hardwaretypes
            .extend(compat.hardwaretypes.iter().cloned());
        self.compatibilities
            .imagetypes
            .extend(compat.imagetypes.iter().cloned());
        self.compatibilities
            .services
            .extend(compat.services.iter().cloned());

        if let Some(admin) = &layer.administration {
            if admit(
                &mut self.pins,
                "administration".to_string(),
                layer,
                self.administration.as_ref(),
                admin,
            )? {
                self.administration = Some(*admin);
            }
        }

        Ok(())
    }
}

/// Resolves cluster templates against a [`TemplateSource`].
#[derive(Debug, Clone, Default)]
pub struct TemplateResolver {
    mandatory_order: Vec<String>,
}

impl TemplateResolver {
    /// `mandatory_order` lists mandatory partials in application order;
    /// unlisted mandatory partials follow in name order.
    pub fn new(mandatory_order: Vec<String>) -> Self {
        Self { mandatory_order }
    }

    /// Resolve a stored template by name.
    pub fn resolve_named<S: TemplateSource + ?Sized>(
        &self,
        source: &S,
        tenant: &str,
        name: &str,
    ) -> TemplateResult<ClusterTemplate> {
        let body = source
            .cluster_template(tenant, name)?
            .ok_or_else(|| TemplateError::MissingTemplate(name.to_string()))?;
        self.resolve(source, tenant, &body)
    }

    /// Resolve `body` (stored or inline) into a self-contained template.
    ///
    /// The result keeps the body's name, description, parent and includes
    /// for provenance; everything else comes from the fold.
    pub fn resolve<S: TemplateSource + ?Sized>(
        &self,
        source: &S,
        tenant: &str,
        body: &ClusterTemplate,
    ) -> TemplateResult<ClusterTemplate> {
        let ancestors = self.ancestors(source, tenant, body)?;
        let mandatory = self.ordered_mandatory(source.mandatory_partials(tenant)?);
        let mandatory_names: BTreeSet<String> =
            mandatory.iter().map(|p| p.name.clone()).collect();

        let mut layers = Vec::new();
        let mut applied = BTreeSet::new();
        for ancestor in &ancestors {
            push_includes(
                source,
                tenant,
                &ancestor.includes,
                &mandatory_names,
                &mut applied,
                &mut layers,
            )?;
            layers.push(Layer::from_template(ancestor));
        }
        // Mandatory partials apply before the body's includes. An included
        // partial that sets a different value for a key a mandatory partial
        // pinned is rejected, not overridden by the mandatory value.
        for partial in &mandatory {
            if applied.insert(partial.name.clone()) {
                layers.push(Layer::from_partial(partial));
            }
        }
        push_includes(
            source,
            tenant,
            &body.includes,
            &mandatory_names,
            &mut applied,
            &mut layers,
        )?;
        layers.push(Layer::from_template(body));

        let mut fold = Fold::default();
        for layer in &layers {
            fold.apply(layer)?;
        }

        let resolved = ClusterTemplate {
            name: body.name.clone(),
            description: body.description.clone(),
            parent: body.parent.clone(),
            includes: body.includes.clone(),
            cluster_defaults: fold.defaults,
            constraints: fold.constraints,
            compatibilities: fold.compatibilities,
            administration: fold.administration,
        };
        validate(&resolved)?;

        debug!(
            %tenant,
            template = %body.name,
            layers = layers.len(),
            pinned = fold.pins.len(),
            "template resolved"
        );
        Ok(resolved)
    }

    /// Parent chain of `body`, root first.
    fn ancestors<S: TemplateSource + ?Sized>(
        &self,
        source: &S,
        tenant: &str,
        body: &ClusterTemplate,
    ) -> TemplateResult<Vec<ClusterTemplate>> {
        let mut chain = Vec::new();
        let mut seen = vec![body.name.clone()];
        let mut next = body.parent.clone();

        while let Some(name) = next {
            if seen.contains(&name) {
                seen.push(name);
                return Err(TemplateError::ParentCycle { chain: seen });
            }
            let parent = source
                .cluster_template(tenant, &name)?
                .ok_or_else(|| TemplateError::MissingTemplate(name.clone()))?;
            seen.push(name);
            next = parent.parent.clone();
            chain.push(parent);
        }

        chain.reverse();
        Ok(chain)
    }

    fn ordered_mandatory(&self, mut partials: Vec<PartialTemplate>) -> Vec<PartialTemplate> {
        partials.sort_by(|a, b| a.name.cmp(&b.name));
        let mut ordered = Vec::with_capacity(partials.len());
        for name in &self.mandatory_order {
            if let Some(pos) = partials.iter().position(|p| &p.name == name) {
                ordered.push(partials.remove(pos));
            }
        }
        ordered.extend(partials);
        ordered
    }
}

fn push_includes<S: TemplateSource + ?Sized>(
    source: &S,
    tenant: &str,
    includes: &[String],
    mandatory: &BTreeSet<String>,
    applied: &mut BTreeSet<String>,
    layers: &mut Vec<Layer>,
) -> TemplateResult<()> {
    for name in includes {
        // Mandatory partials have their own slot in the order.
        if mandatory.contains(name) || !applied.insert(name.clone()) {
            continue;
        }
        let partial = source
            .partial_template(tenant, name)?
            .ok_or_else(|| TemplateError::MissingPartial(name.clone()))?;
        layers.push(Layer::from_partial(&partial));
    }
    Ok(())
}

/// Check that a resolved template is complete and self-consistent.
pub fn validate(template: &ClusterTemplate) -> TemplateResult<()> {
    let defaults = &template.cluster_defaults;

    if defaults.provider.as_deref().is_none_or(str::is_empty) {
        return Err(TemplateError::Validation(format!(
            "template {} has no provider",
            template.name
        )));
    }

    if let Some(suffix) = &defaults.dns_suffix {
        if !is_dns_suffix(suffix) {
            return Err(TemplateError::Validation(format!(
                "invalid dns suffix {suffix:?}"
            )));
        }
    }

    for (service, constraint) in &template.constraints.services {
        if let (Some(min), Some(max)) = (constraint.min_count, constraint.max_count) {
            if min > max {
                return Err(TemplateError::Validation(format!(
                    "service {service}: minCount {min} exceeds maxCount {max}"
                )));
            }
        }
    }

    if let Some(size) = &template.constraints.size {
        if let (Some(min), Some(max)) = (size.min, size.max) {
            if min > max {
                return Err(TemplateError::Validation(format!(
                    "size min {min} exceeds max {max}"
                )));
            }
        }
    }

    let lease = template.lease();
    if lease.max != 0 && lease.initial > lease.max {
        return Err(TemplateError::Validation(format!(
            "initial lease {} exceeds max lease {}",
            lease.initial, lease.max
        )));
    }

    Ok(())
}

/// One DNS label: alphanumerics and inner hyphens, at most 63 characters.
static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")
        .expect("valid DNS label pattern")
});

fn is_dns_suffix(suffix: &str) -> bool {
    let name = suffix.strip_prefix('.').unwrap_or(suffix);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|part| DNS_LABEL.is_match(part))
}

/// Hex SHA-256 of the template's canonical JSON.
pub fn fingerprint(template: &ClusterTemplate) -> TemplateResult<String> {
    let bytes =
        serde_json::to_vec(template).map_err(|e| TemplateError::Serialize(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::{LeaseDuration, ServiceConstraint, SizeConstraint, StateStore};
    use serde_json::json;

    const TENANT: &str = "acme";

    fn template(name: &str, parent: Option<&str>) -> ClusterTemplate {
        let mut t = ClusterTemplate::new(name);
        t.parent = parent.map(str::to_string);
        t
    }

    fn store_with_base() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        let mut base = template("base", None);
        base.cluster_defaults.provider = Some("rackspace".to_string());
        base.cluster_defaults.hardwaretype = Some("medium".to_string());
        base.cluster_defaults.services = ["base".to_string()].into();
        store.put_cluster_template(TENANT, &base).unwrap();
        store
    }

    fn security_partial() -> PartialTemplate {
        let mut security = PartialTemplate::new("security");
        security.mandatory = true;
        security
            .cluster_defaults
            .config
            .insert("tls.enabled".to_string(), json!(true));
        security
    }

    #[test]
    fn mandatory_partial_pins_config_against_body() {
        let store = store_with_base();
        store
            .put_partial_template(TENANT, &security_partial())
            .unwrap();

        let mut web = template("web", Some("base"));
        web.cluster_defaults
            .config
            .insert("tls.enabled".to_string(), json!(false));

        let err = TemplateResolver::default()
            .resolve(&store, TENANT, &web)
            .unwrap_err();
        match err {
            TemplateError::Immutability {
                key,
                pinned_by,
                attempted_by,
            } => {
                assert_eq!(key, "config.tls.enabled");
                assert_eq!(pinned_by, "partial security");
                assert_eq!(attempted_by, "template web");
            }
            other => panic!("expected immutability error, got {other:?}"),
        }
    }

    #[test]
    fn repeating_a_pinned_value_is_allowed() {
        let store = store_with_base();
        store
            .put_partial_template(TENANT, &security_partial())
            .unwrap();

        let mut web = template("web", Some("base"));
        web.cluster_defaults
            .config
            .insert("tls.enabled".to_string(), json!(true));

        let resolved = TemplateResolver::default()
            .resolve(&store, TENANT, &web)
            .unwrap();
        assert_eq!(resolved.cluster_defaults.config["tls.enabled"], json!(true));
    }

    #[test]
    fn immutable_partial_pins_at_any_depth() {
        let store = store_with_base();
        let mut hardened = PartialTemplate::new("hardened");
        hardened.immutable = true;
        hardened.cluster_defaults.imagetype = Some("centos8".to_string());
        store.put_partial_template(TENANT, &hardened).unwrap();

        // base <- mid (includes hardened) <- leaf <- body
        let mut mid = template("mid", Some("base"));
        mid.includes = vec!["hardened".to_string()];
        store.put_cluster_template(TENANT, &mid).unwrap();
        store
            .put_cluster_template(TENANT, &template("leaf", Some("mid")))
            .unwrap();

        let mut body = template("body", Some("leaf"));
        body.cluster_defaults.imagetype = Some("ubuntu24".to_string());

        let err = TemplateResolver::default()
            .resolve(&store, TENANT, &body)
            .unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Immutability { ref key, ref pinned_by, .. }
                if key == "imagetype" && pinned_by == "partial hardened"
        ));
    }

    #[test]
    fn immutable_config_pins_only_listed_keys() {
        let store = store_with_base();
        let mut logging = PartialTemplate::new("logging");
        logging.immutable_config = ["log.level".to_string()].into();
        logging
            .cluster_defaults
            .config
            .insert("log.level".to_string(), json!("info"));
        logging
            .cluster_defaults
            .config
            .insert("log.format".to_string(), json!("text"));
        store.put_partial_template(TENANT, &logging).unwrap();

        let mut body = template("app", Some("base"));
        body.includes = vec!["logging".to_string()];
        body.cluster_defaults
            .config
            .insert("log.format".to_string(), json!("json"));

        let resolver = TemplateResolver::default();
        let resolved = resolver.resolve(&store, TENANT, &body).unwrap();
        assert_eq!(resolved.cluster_defaults.config["log.format"], json!("json"));

        body.cluster_defaults
            .config
            .insert("log.level".to_string(), json!("debug"));
        assert!(matches!(
            resolver.resolve(&store, TENANT, &body),
            Err(TemplateError::Immutability { .. })
        ));
    }

    #[test]
    fn later_layers_override_unpinned_values() {
        let store = store_with_base();
        let mut body = template("big", Some("base"));
        body.cluster_defaults.hardwaretype = Some("large".to_string());
        body.constraints.services.insert(
            "hdfs".to_string(),
            ServiceConstraint {
                min_count: Some(2),
                ..Default::default()
            },
        );

        let resolved = TemplateResolver::default()
            .resolve(&store, TENANT, &body)
            .unwrap();
        assert_eq!(
            resolved.cluster_defaults.hardwaretype.as_deref(),
            Some("large")
        );
        // Inherited from base.
        assert_eq!(
            resolved.cluster_defaults.provider.as_deref(),
            Some("rackspace")
        );
        assert_eq!(resolved.service_constraint("hdfs").min_count, Some(2));
    }

    #[test]
    fn services_are_the_union_of_all_layers() {
        let store = store_with_base();
        let mut monitoring = PartialTemplate::new("monitoring");
        monitoring.cluster_defaults.services =
            ["base".to_string(), "collectd".to_string()].into();
        store.put_partial_template(TENANT, &monitoring).unwrap();

        let mut body = template("hadoop", Some("base"));
        body.includes = vec!["monitoring".to_string()];
        body.cluster_defaults.services = ["hdfs".to_string(), "collectd".to_string()].into();

        let resolved = TemplateResolver::default()
            .resolve(&store, TENANT, &body)
            .unwrap();
        let services: Vec<&str> = resolved
            .cluster_defaults
            .services
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(services, vec!["base", "collectd", "hdfs"]);
    }

    #[test]
    fn mandatory_order_follows_configuration() {
        let store = store_with_base();
        for name in ["alpha", "beta"] {
            let mut p = PartialTemplate::new(name);
            p.mandatory = true;
            p.cluster_defaults
                .config
                .insert(format!("{name}.on"), json!(true));
            store.put_partial_template(TENANT, &p).unwrap();
        }
        let resolver = TemplateResolver::new(vec!["beta".to_string()]);
        let ordered = resolver.ordered_mandatory(store.list_mandatory_partials(TENANT).unwrap());
        let names: Vec<&str> = ordered.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "alpha"]);

        let default_order =
            TemplateResolver::default().ordered_mandatory(store.list_mandatory_partials(TENANT).unwrap());
        assert_eq!(default_order[0].name, "alpha");
    }

    #[test]
    fn included_partial_cannot_change_a_mandatory_key() {
        let store = store_with_base();
        store
            .put_partial_template(TENANT, &security_partial())
            .unwrap();
        let mut legacy = PartialTemplate::new("legacy");
        legacy
            .cluster_defaults
            .config
            .insert("tls.enabled".to_string(), json!(false));
        store.put_partial_template(TENANT, &legacy).unwrap();

        let mut body = template("web", Some("base"));
        body.includes = vec!["legacy".to_string()];
        let err = TemplateResolver::default()
            .resolve(&store, TENANT, &body)
            .unwrap_err();
        match err {
            TemplateError::Immutability {
                pinned_by,
                attempted_by,
                ..
            } => {
                assert_eq!(pinned_by, "partial security");
                assert_eq!(attempted_by, "partial legacy");
            }
            other => panic!("expected immutability error, got {other:?}"),
        }
    }

    #[test]
    fn mandatory_partial_included_explicitly_applies_once() {
        let store = store_with_base();
        store
            .put_partial_template(TENANT, &security_partial())
            .unwrap();
        let mut body = template("web", Some("base"));
        body.includes = vec!["security".to_string()];

        let resolved = TemplateResolver::default()
            .resolve(&store, TENANT, &body)
            .unwrap();
        assert_eq!(resolved.includes, vec!["security".to_string()]);
        assert_eq!(resolved.cluster_defaults.config["tls.enabled"], json!(true));
    }

    #[test]
    fn resolution_is_deterministic() {
        let store = store_with_base();
        store
            .put_partial_template(TENANT, &security_partial())
            .unwrap();
        let mut body = template("web", Some("base"));
        body.cluster_defaults.services = ["nginx".to_string(), "php".to_string()].into();

        let resolver = TemplateResolver::default();
        let a = resolver.resolve(&store, TENANT, &body).unwrap();
        let b = resolver.resolve(&store, TENANT, &body).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);
    }

    #[test]
    fn snapshot_survives_partial_deletion() {
        let store = store_with_base();
        store
            .put_partial_template(TENANT, &security_partial())
            .unwrap();
        let resolver = TemplateResolver::default();
        let snapshot = resolver
            .resolve_named(&store, TENANT, "base")
            .unwrap();
        let before = fingerprint(&snapshot).unwrap();

        store.delete_partial_template(TENANT, "security").unwrap();
        let fresh = resolver.resolve_named(&store, TENANT, "base").unwrap();

        assert_eq!(fingerprint(&snapshot).unwrap(), before);
        assert!(snapshot.cluster_defaults.config.contains_key("tls.enabled"));
        assert!(!fresh.cluster_defaults.config.contains_key("tls.enabled"));
    }

    #[test]
    fn missing_provider_fails_validation() {
        let store = StateStore::open_in_memory().unwrap();
        let err = TemplateResolver::default()
            .resolve(&store, TENANT, &template("bare", None))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Validation(_)));
    }

    #[test]
    fn validation_rejects_inconsistent_bounds() {
        let mut t = template("t", None);
        t.cluster_defaults.provider = Some("aws".to_string());
        validate(&t).unwrap();

        let mut bad_dns = t.clone();
        bad_dns.cluster_defaults.dns_suffix = Some("bad_suffix..com".to_string());
        assert!(matches!(validate(&bad_dns), Err(TemplateError::Validation(_))));

        let mut good_dns = t.clone();
        good_dns.cluster_defaults.dns_suffix = Some(".dev.example.com".to_string());
        validate(&good_dns).unwrap();
        assert!(is_dns_suffix(&format!("{}.example.com", "a".repeat(63))));
        assert!(!is_dns_suffix(&format!("{}.example.com", "a".repeat(64))));
        assert!(!is_dns_suffix("-edge.example.com"));
        assert!(!is_dns_suffix("."));

        let mut bad_count = t.clone();
        bad_count.constraints.services.insert(
            "zk".to_string(),
            ServiceConstraint {
                min_count: Some(5),
                max_count: Some(3),
                ..Default::default()
            },
        );
        assert!(validate(&bad_count).is_err());

        let mut bad_size = t.clone();
        bad_size.constraints.size = Some(SizeConstraint {
            min: Some(10),
            max: Some(2),
        });
        assert!(validate(&bad_size).is_err());

        let mut bad_lease = t;
        bad_lease.administration = Some(Administration {
            lease_duration: LeaseDuration {
                initial: 10_000,
                max: 5_000,
                step: 0,
            },
        });
        assert!(validate(&bad_lease).is_err());
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_cluster_template(TENANT, &template("a", Some("b")))
            .unwrap();
        store
            .put_cluster_template(TENANT, &template("b", Some("a")))
            .unwrap();

        let err = TemplateResolver::default()
            .resolve_named(&store, TENANT, "a")
            .unwrap_err();
        match err {
            TemplateError::ParentCycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn missing_references_are_reported() {
        let store = store_with_base();
        let resolver = TemplateResolver::default();

        let orphan = template("orphan", Some("nowhere"));
        assert!(matches!(
            resolver.resolve(&store, TENANT, &orphan),
            Err(TemplateError::MissingTemplate(name)) if name == "nowhere"
        ));

        let mut includes_missing = template("inc", Some("base"));
        includes_missing.includes = vec!["ghost".to_string()];
        assert!(matches!(
            resolver.resolve(&store, TENANT, &includes_missing),
            Err(TemplateError::MissingPartial(name)) if name == "ghost"
        ));

        // Other tenants' catalogs are invisible.
        assert!(matches!(
            resolver.resolve_named(&store, "globex", "base"),
            Err(TemplateError::MissingTemplate(_))
        ));
    }
}
