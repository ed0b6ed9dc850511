//! Constraint checks over a complete layout.
//!
//! Checks run in a fixed order so the reported violation is stable:
//! compatibility, then layout groups, then per-service counts.

use std::collections::{BTreeMap, BTreeSet};

use provgrid_state::{ClusterTemplate, NodeLayout, ServiceCatalog};

use crate::error::{Bound, CompatKind, Violation};

/// Whether `a` and `b` may never share a node.
pub(crate) fn services_conflict(
    template: &ClusterTemplate,
    catalog: &ServiceCatalog,
    a: &str,
    b: &str,
) -> bool {
    if a == b {
        return false;
    }
    let grouped = template
        .constraints
        .layout
        .cant_coexist
        .iter()
        .any(|group| group.contains(a) && group.contains(b));
    let declared = |x: &str, y: &str| {
        catalog
            .get(x)
            .is_some_and(|svc| svc.dependencies.conflicts.contains(y))
    };
    grouped || declared(a, b) || declared(b, a)
}

/// Check compatibility, layout groups and service counts of `layout`.
pub fn validate_layout(
    template: &ClusterTemplate,
    catalog: &ServiceCatalog,
    layout: &[NodeLayout],
) -> Result<(), Violation> {
    let compat = &template.compatibilities;
    let services: BTreeSet<&String> = layout.iter().flat_map(|n| n.services.iter()).collect();

    // (1) compatibility
    for node in layout {
        if !compat.allows_hardwaretype(&node.hardwaretype) {
            return Err(Violation::Incompatible {
                kind: CompatKind::Hardwaretype,
                value: node.hardwaretype.clone(),
            });
        }
        if !compat.allows_imagetype(&node.imagetype) {
            return Err(Violation::Incompatible {
                kind: CompatKind::Imagetype,
                value: node.imagetype.clone(),
            });
        }
        for service in &node.services {
            let constraint = template.service_constraint(service);
            if !constraint.required_hardwaretypes.is_empty()
                && !constraint.required_hardwaretypes.contains(&node.hardwaretype)
            {
                return Err(Violation::Incompatible {
                    kind: CompatKind::Hardwaretype,
                    value: node.hardwaretype.clone(),
                });
            }
            if !constraint.required_imagetypes.is_empty()
                && !constraint.required_imagetypes.contains(&node.imagetype)
            {
                return Err(Violation::Incompatible {
                    kind: CompatKind::Imagetype,
                    value: node.imagetype.clone(),
                });
            }
        }
    }
    for service in &services {
        let Some(definition) = catalog.get(service.as_str()) else {
            return Err(Violation::UnknownService {
                service: service.to_string(),
            });
        };
        if !compat.allows_service(service) {
            return Err(Violation::Incompatible {
                kind: CompatKind::Service,
                value: service.to_string(),
            });
        }
        if let Some(missing) = definition
            .dependencies
            .requires
            .iter()
            .find(|r| !services.contains(r))
        {
            return Err(Violation::MissingDependency {
                service: service.to_string(),
                requires: missing.clone(),
            });
        }
    }

    // (2) layout groups
    for group in &template.constraints.layout.must_coexist {
        let present: BTreeSet<&String> = group.iter().filter(|s| services.contains(s)).collect();
        let split = layout.iter().any(|node| {
            let hosted = present.iter().filter(|s| node.services.contains(**s)).count();
            hosted > 0 && hosted < present.len()
        });
        if split {
            return Err(Violation::MustCoexist {
                services: group.clone(),
            });
        }
    }
    for node in layout {
        let hosted: Vec<&String> = node.services.iter().collect();
        for (i, a) in hosted.iter().enumerate() {
            for b in &hosted[i + 1..] {
                if services_conflict(template, catalog, a, b) {
                    return Err(Violation::CantCoexist {
                        services: [a.to_string(), b.to_string()].into(),
                    });
                }
            }
        }
    }

    // (3) counts
    let size = layout.len() as u32;
    let mut counts: BTreeMap<&String, u32> = BTreeMap::new();
    for node in layout {
        for service in &node.services {
            *counts.entry(service).or_default() += 1;
        }
    }
    for (service, count) in counts {
        let (min, max) = template.service_constraint(service).bounds(size);
        if count < min {
            return Err(Violation::ServiceCount {
                service: service.clone(),
                bound: Bound::Min(min),
                available: count,
            });
        }
        if count > max {
            return Err(Violation::ServiceCount {
                service: service.clone(),
                bound: Bound::Max(max),
                available: count,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::{Service, ServiceConstraint, ServiceDependencies};

    fn catalog(names: &[&str]) -> ServiceCatalog {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Service::new(n, ServiceDependencies::default(), Default::default()),
                )
            })
            .collect()
    }

    fn node(services: &[&str]) -> NodeLayout {
        NodeLayout {
            hardwaretype: "medium".to_string(),
            imagetype: "ubuntu".to_string(),
            provider: "rackspace".to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn valid_layout_passes() {
        let template = ClusterTemplate::new("t");
        let catalog = catalog(&["base", "web"]);
        validate_layout(&template, &catalog, &[node(&["base", "web"]), node(&["base"])]).unwrap();
    }

    #[test]
    fn split_must_coexist_group_fails() {
        let mut template = ClusterTemplate::new("t");
        template
            .constraints
            .layout
            .must_coexist
            .insert(["hdfs".to_string(), "yarn".to_string()].into());
        let catalog = catalog(&["hdfs", "yarn"]);
        let err = validate_layout(&template, &catalog, &[node(&["hdfs", "yarn"]), node(&["hdfs"])])
            .unwrap_err();
        assert!(matches!(err, Violation::MustCoexist { .. }));
    }

    #[test]
    fn declared_conflicts_fail() {
        let template = ClusterTemplate::new("t");
        let mut catalog = catalog(&["mysql"]);
        let mut deps = ServiceDependencies::default();
        deps.conflicts.insert("mysql".to_string());
        catalog.insert(
            "postgres".to_string(),
            Service::new("postgres", deps, Default::default()),
        );
        let err = validate_layout(&template, &catalog, &[node(&["mysql", "postgres"])]).unwrap_err();
        assert_eq!(
            err,
            Violation::CantCoexist {
                services: ["mysql".to_string(), "postgres".to_string()].into()
            }
        );
    }

    #[test]
    fn count_bounds_are_checked() {
        let mut template = ClusterTemplate::new("t");
        template.constraints.services.insert(
            "zk".to_string(),
            ServiceConstraint {
                max_count: Some(1),
                ..Default::default()
            },
        );
        let catalog = catalog(&["zk"]);
        let err = validate_layout(&template, &catalog, &[node(&["zk"]), node(&["zk"])]).unwrap_err();
        assert_eq!(
            err,
            Violation::ServiceCount {
                service: "zk".to_string(),
                bound: Bound::Max(1),
                available: 2
            }
        );
    }

    #[test]
    fn missing_requirement_fails() {
        let template = ClusterTemplate::new("t");
        let mut catalog = catalog(&["base"]);
        let mut deps = ServiceDependencies::default();
        deps.requires.insert("zookeeper".to_string());
        catalog.insert("hbase".to_string(), Service::new("hbase", deps, Default::default()));
        let err = validate_layout(&template, &catalog, &[node(&["base", "hbase"])]).unwrap_err();
        assert!(matches!(
            err,
            Violation::MissingDependency { ref requires, .. } if requires == "zookeeper"
        ));
    }
}
