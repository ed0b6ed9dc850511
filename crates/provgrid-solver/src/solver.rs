//! Greedy layout solver.
//!
//! Services tied together by `mustCoexist` groups are merged into units
//! (union-find) and always move together. Units are placed most-constrained
//! first: each goes onto the compatible nodes with the fewest services until
//! its minimum count is met. Nodes that are still empty are then filled with
//! every unit that has headroom left.
//!
//! Every solution is checked with [`validate_layout`] before it is returned.

use std::collections::{BTreeMap, BTreeSet};

use provgrid_state::{ClusterTemplate, NodeLayout, PlannedNode, ServiceCatalog};
use tracing::{debug, info};

use crate::error::{Bound, CompatKind, SolverError, SolverResult, Violation};
use crate::validate::{services_conflict, validate_layout};

/// What the caller wants the layout to become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveRequest {
    /// Fields left as `None` come from the template defaults.
    Create {
        size: u32,
        services: Option<BTreeSet<String>>,
        hardwaretype: Option<String>,
        imagetype: Option<String>,
        provider: Option<String>,
    },
    AddServices {
        services: BTreeSet<String>,
    },
    RemoveServices {
        services: BTreeSet<String>,
    },
    Resize {
        size: u32,
    },
}

/// Allowed values of a node attribute; `None` is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Allowed(Option<BTreeSet<String>>);

impl Allowed {
    fn only(value: &str) -> Self {
        Allowed(Some([value.to_string()].into()))
    }

    fn from_required(required: &BTreeSet<String>) -> Self {
        if required.is_empty() {
            Allowed(None)
        } else {
            Allowed(Some(required.clone()))
        }
    }

    /// Intersection, or `None` when nothing is left.
    fn narrow(&self, other: &Allowed) -> Option<Allowed> {
        match (&self.0, &other.0) {
            (None, None) => Some(Allowed(None)),
            (Some(values), None) | (None, Some(values)) => Some(Allowed(Some(values.clone()))),
            (Some(a), Some(b)) => {
                let both: BTreeSet<String> = a.intersection(b).cloned().collect();
                (!both.is_empty()).then_some(Allowed(Some(both)))
            }
        }
    }

    fn contains(&self, value: &str) -> bool {
        self.0.as_ref().is_none_or(|values| values.contains(value))
    }
}

/// Services that always share the same nodes.
#[derive(Debug, Clone)]
struct Unit {
    services: BTreeSet<String>,
    /// Member named when the unit's count bounds are violated.
    lead: String,
    min: u32,
    max: u32,
    hardware: Allowed,
    image: Allowed,
}

/// A node slot under construction.
#[derive(Debug, Clone, Default)]
struct Draft {
    /// Empty for nodes that do not exist yet.
    id: String,
    services: BTreeSet<String>,
    hardware: Allowed,
    image: Allowed,
    provider: Option<String>,
}

impl Draft {
    fn existing(node: &PlannedNode) -> Self {
        Self {
            id: node.id.clone(),
            services: node.layout.services.clone(),
            hardware: Allowed::only(&node.layout.hardwaretype),
            image: Allowed::only(&node.layout.imagetype),
            provider: Some(node.layout.provider.clone()),
        }
    }

    fn hosts(&self, services: &BTreeSet<String>) -> bool {
        services.is_subset(&self.services)
    }

    fn add(&mut self, services: &BTreeSet<String>, hardware: &Allowed, image: &Allowed) {
        self.services.extend(services.iter().cloned());
        if let Some(narrowed) = self.hardware.narrow(hardware) {
            self.hardware = narrowed;
        }
        if let Some(narrowed) = self.image.narrow(image) {
            self.image = narrowed;
        }
    }
}

/// Node attributes used where a slot's services leave a choice.
#[derive(Debug, Clone, Default)]
struct Preference {
    hardwaretype: Option<String>,
    imagetype: Option<String>,
    provider: Option<String>,
}

/// Solves layouts for one resolved template and service catalog.
pub struct Solver<'a> {
    template: &'a ClusterTemplate,
    catalog: &'a ServiceCatalog,
}

impl<'a> Solver<'a> {
    pub fn new(template: &'a ClusterTemplate, catalog: &'a ServiceCatalog) -> Self {
        Self { template, catalog }
    }

    /// Compute the target layout for `request` given the `current` nodes.
    ///
    /// Existing nodes keep their ids; new node slots carry an empty id.
    pub fn solve(
        &self,
        current: &[PlannedNode],
        request: &SolveRequest,
    ) -> SolverResult<Vec<PlannedNode>> {
        let target = match request {
            SolveRequest::Create {
                size,
                services,
                hardwaretype,
                imagetype,
                provider,
            } => {
                let defaults = &self.template.cluster_defaults;
                let preference = Preference {
                    hardwaretype: hardwaretype.clone().or_else(|| defaults.hardwaretype.clone()),
                    imagetype: imagetype.clone().or_else(|| defaults.imagetype.clone()),
                    provider: provider.clone().or_else(|| defaults.provider.clone()),
                };
                self.create(*size, services.as_ref(), preference)?
            }
            SolveRequest::AddServices { services } => self.add_services(current, services)?,
            SolveRequest::RemoveServices { services } => {
                self.remove_services(current, services)?
            }
            SolveRequest::Resize { size } => self.resize(current, *size)?,
        };

        let layout: Vec<NodeLayout> = target.iter().map(|n| n.layout.clone()).collect();
        validate_layout(self.template, self.catalog, &layout)?;

        info!(
            template = %self.template.name,
            nodes = target.len(),
            new_nodes = target.iter().filter(|n| n.id.is_empty()).count(),
            "layout solved"
        );
        Ok(target)
    }

    fn create(
        &self,
        size: u32,
        services: Option<&BTreeSet<String>>,
        preference: Preference,
    ) -> SolverResult<Vec<PlannedNode>> {
        self.check_size(size)?;
        let services = services
            .cloned()
            .unwrap_or_else(|| self.template.cluster_defaults.services.clone());
        if services.is_empty() {
            return Err(SolverError::Invalid("no services requested".to_string()));
        }
        if preference.provider.is_none() {
            return Err(SolverError::Invalid("no provider chosen".to_string()));
        }
        self.check_services(&services)?;

        let compat = &self.template.compatibilities;
        if let Some(hardwaretype) = &preference.hardwaretype {
            if !compat.allows_hardwaretype(hardwaretype) {
                return Err(Violation::Incompatible {
                    kind: CompatKind::Hardwaretype,
                    value: hardwaretype.clone(),
                }
                .into());
            }
        }
        if let Some(imagetype) = &preference.imagetype {
            if !compat.allows_imagetype(imagetype) {
                return Err(Violation::Incompatible {
                    kind: CompatKind::Imagetype,
                    value: imagetype.clone(),
                }
                .into());
            }
        }

        let units = self.units(&services, size)?;
        let mut drafts = vec![Draft::default(); size as usize];
        for unit in &units {
            self.place(&mut drafts, unit)?;
        }
        self.fill(&mut drafts, &units, 0)?;
        self.finalize(drafts, &preference)
    }

    fn add_services(
        &self,
        current: &[PlannedNode],
        requested: &BTreeSet<String>,
    ) -> SolverResult<Vec<PlannedNode>> {
        let existing = cluster_services(current);
        let added: BTreeSet<String> = requested.difference(&existing).cloned().collect();
        if added.is_empty() {
            return Err(SolverError::Invalid(
                "every requested service is already in the cluster".to_string(),
            ));
        }
        let all: BTreeSet<String> = existing.union(&added).cloned().collect();
        self.check_services(&all)?;

        let units = self.units(&all, current.len() as u32)?;
        let mut drafts: Vec<Draft> = current.iter().map(Draft::existing).collect();
        for unit in &units {
            if unit.services.is_disjoint(&added) {
                continue;
            }
            let established: BTreeSet<String> =
                unit.services.intersection(&existing).cloned().collect();
            if established.is_empty() {
                self.place(&mut drafts, unit)?;
                continue;
            }

            // New members join the nodes their group already occupies.
            let joining: BTreeSet<String> = unit.services.difference(&existing).cloned().collect();
            let (hardware, image) = self.requirements(&joining)?;
            for draft in drafts.iter_mut().filter(|d| d.hosts(&established)) {
                if !self.accepts(draft, &joining, &hardware, &image) {
                    return Err(Violation::MustCoexist {
                        services: unit.services.clone(),
                    }
                    .into());
                }
                draft.add(&joining, &hardware, &image);
            }
        }

        self.finalize(drafts, &self.preference_from(current))
    }

    fn remove_services(
        &self,
        current: &[PlannedNode],
        removed: &BTreeSet<String>,
    ) -> SolverResult<Vec<PlannedNode>> {
        let existing = cluster_services(current);
        if let Some(missing) = removed.iter().find(|s| !existing.contains(*s)) {
            return Err(SolverError::Invalid(format!(
                "service {missing} is not in the cluster"
            )));
        }
        let remaining: BTreeSet<&String> = existing.difference(removed).collect();
        if remaining.is_empty() {
            return Err(SolverError::Invalid(
                "cannot remove every service; delete the cluster instead".to_string(),
            ));
        }
        for service in &remaining {
            let Some(definition) = self.catalog.get(service.as_str()) else {
                continue;
            };
            if let Some(required) = definition
                .dependencies
                .requires
                .iter()
                .find(|r| removed.contains(*r))
            {
                return Err(Violation::RemovalBreaksDependency {
                    service: required.clone(),
                    required_by: service.to_string(),
                }
                .into());
            }
        }

        Ok(current
            .iter()
            .map(|node| {
                let mut node = node.clone();
                node.layout.services.retain(|s| !removed.contains(s));
                node
            })
            .collect())
    }

    fn resize(&self, current: &[PlannedNode], size: u32) -> SolverResult<Vec<PlannedNode>> {
        self.check_size(size)?;
        let existing = cluster_services(current);
        let count = current.len() as u32;
        if size == count {
            return Ok(current.to_vec());
        }
        let units = self.units(&existing, size)?;

        if size > count {
            let mut drafts: Vec<Draft> = current.iter().map(Draft::existing).collect();
            drafts.extend((count..size).map(|_| Draft::default()));
            for unit in &units {
                self.place(&mut drafts, unit)?;
            }
            self.fill(&mut drafts, &units, count as usize)?;
            return self.finalize(drafts, &self.preference_from(current));
        }

        // Shrink: drop the newest nodes whose services stay above their minimum.
        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for node in current {
            for service in &node.layout.services {
                *counts.entry(service.as_str()).or_default() += 1;
            }
        }
        let mut keep = vec![true; current.len()];
        let mut excess = (count - size) as usize;
        for (index, node) in current.iter().enumerate().rev() {
            if excess == 0 {
                break;
            }
            let removable = node.layout.services.iter().all(|s| {
                let (min, _) = self.template.service_constraint(s).bounds(size);
                counts.get(s.as_str()).copied().unwrap_or(0) > min
            });
            if removable {
                for service in &node.layout.services {
                    if let Some(c) = counts.get_mut(service.as_str()) {
                        *c -= 1;
                    }
                }
                keep[index] = false;
                excess -= 1;
            }
        }
        if excess > 0 {
            let blocking = counts
                .iter()
                .find(|(s, c)| **c <= self.template.service_constraint(s).bounds(size).0)
                .map(|(s, _)| s.to_string())
                .unwrap_or_default();
            let (min, _) = self.template.service_constraint(&blocking).bounds(size);
            return Err(Violation::ServiceCount {
                service: blocking,
                bound: Bound::Min(min),
                available: size,
            }
            .into());
        }

        Ok(current
            .iter()
            .zip(keep)
            .filter(|(_, keep)| *keep)
            .map(|(node, _)| node.clone())
            .collect())
    }

    // ── Checks ─────────────────────────────────────────────────────

    fn check_size(&self, size: u32) -> SolverResult<()> {
        let (min, max) = self
            .template
            .constraints
            .size
            .map(|s| (s.min.unwrap_or(1), s.max.unwrap_or(u32::MAX)))
            .unwrap_or((1, u32::MAX));
        if size == 0 || size < min || size > max {
            return Err(Violation::ClusterSize {
                requested: size,
                min,
                max,
            }
            .into());
        }
        Ok(())
    }

    fn check_services(&self, services: &BTreeSet<String>) -> SolverResult<()> {
        for service in services {
            let definition = self
                .catalog
                .get(service)
                .ok_or_else(|| SolverError::UnknownService(service.clone()))?;
            if !self.template.compatibilities.allows_service(service) {
                return Err(Violation::Incompatible {
                    kind: CompatKind::Service,
                    value: service.clone(),
                }
                .into());
            }
            if let Some(missing) = definition
                .dependencies
                .requires
                .iter()
                .find(|r| !services.contains(*r))
            {
                return Err(Violation::MissingDependency {
                    service: service.clone(),
                    requires: missing.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    // ── Units ──────────────────────────────────────────────────────

    /// Hardware and image types acceptable to every one of `services`.
    fn requirements(&self, services: &BTreeSet<String>) -> SolverResult<(Allowed, Allowed)> {
        let mut hardware = Allowed(None);
        let mut image = Allowed(None);
        for service in services {
            let constraint = self.template.service_constraint(service);
            let conflict = || Violation::HardwareConflict {
                services: services.clone(),
            };
            hardware = hardware
                .narrow(&Allowed::from_required(&constraint.required_hardwaretypes))
                .ok_or_else(conflict)?;
            image = image
                .narrow(&Allowed::from_required(&constraint.required_imagetypes))
                .ok_or_else(conflict)?;
        }
        Ok((hardware, image))
    }

    /// Group `services` into mustCoexist units, most constrained first.
    fn units(&self, services: &BTreeSet<String>, size: u32) -> SolverResult<Vec<Unit>> {
        let names: Vec<&String> = services.iter().collect();
        let index: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut parent: Vec<usize> = (0..names.len()).collect();
        for group in &self.template.constraints.layout.must_coexist {
            let members: Vec<usize> = group
                .iter()
                .filter_map(|s| index.get(s.as_str()).copied())
                .collect();
            for pair in members.windows(2) {
                let a = find_root(&mut parent, pair[0]);
                let b = find_root(&mut parent, pair[1]);
                if a != b {
                    parent[b] = a;
                }
            }
        }

        let mut grouped: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            let root = find_root(&mut parent, i);
            grouped.entry(root).or_default().insert((*name).clone());
        }

        let mut units = Vec::with_capacity(grouped.len());
        for members in grouped.into_values() {
            units.push(self.unit(members, size)?);
        }
        units.sort_by(|a, b| {
            b.min
                .cmp(&a.min)
                .then(a.max.cmp(&b.max))
                .then(b.services.len().cmp(&a.services.len()))
                .then(a.services.cmp(&b.services))
        });
        Ok(units)
    }

    fn unit(&self, services: BTreeSet<String>, size: u32) -> SolverResult<Unit> {
        let mut lead = services.first().cloned().unwrap_or_default();
        let mut min = 0;
        let mut max = size;
        for service in &services {
            let (lo, hi) = self.template.service_constraint(service).bounds(size);
            if lo > min {
                min = lo;
                lead = service.clone();
            }
            max = max.min(hi);
        }

        let members: Vec<&String> = services.iter().collect();
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                if services_conflict(self.template, self.catalog, a, b) {
                    return Err(Violation::CantCoexist {
                        services: [a.to_string(), b.to_string()].into(),
                    }
                    .into());
                }
            }
        }

        if min > max {
            return Err(Violation::ServiceCount {
                service: lead,
                bound: Bound::Min(min),
                available: max,
            }
            .into());
        }

        let (hardware, image) = self.requirements(&services)?;
        Ok(Unit {
            services,
            lead,
            min,
            max,
            hardware,
            image,
        })
    }

    // ── Placement ──────────────────────────────────────────────────

    fn accepts(
        &self,
        draft: &Draft,
        services: &BTreeSet<String>,
        hardware: &Allowed,
        image: &Allowed,
    ) -> bool {
        draft.hardware.narrow(hardware).is_some()
            && draft.image.narrow(image).is_some()
            && !services.iter().any(|s| {
                draft
                    .services
                    .iter()
                    .any(|t| services_conflict(self.template, self.catalog, s, t))
            })
    }

    /// Put `unit` on enough nodes to meet its minimum count.
    fn place(&self, drafts: &mut [Draft], unit: &Unit) -> SolverResult<()> {
        let hosting = drafts.iter().filter(|d| d.hosts(&unit.services)).count();
        let needed = (unit.min as usize).saturating_sub(hosting);
        if needed == 0 {
            return Ok(());
        }

        let mut candidates: Vec<usize> = (0..drafts.len())
            .filter(|&i| {
                !drafts[i].hosts(&unit.services)
                    && self.accepts(&drafts[i], &unit.services, &unit.hardware, &unit.image)
            })
            .collect();
        if candidates.len() < needed {
            return Err(Violation::ServiceCount {
                service: unit.lead.clone(),
                bound: Bound::Min(unit.min),
                available: (hosting + candidates.len()) as u32,
            }
            .into());
        }

        candidates.sort_by_key(|&i| (drafts[i].services.len(), i));
        for &i in candidates.iter().take(needed) {
            drafts[i].add(&unit.services, &unit.hardware, &unit.image);
            debug!(node = i, services = ?unit.services, "placed unit");
        }
        Ok(())
    }

    /// Give every still-empty node from `start` on each unit with headroom.
    fn fill(&self, drafts: &mut [Draft], units: &[Unit], start: usize) -> SolverResult<()> {
        for i in start..drafts.len() {
            if !drafts[i].services.is_empty() {
                continue;
            }
            for unit in units {
                let hosting = drafts.iter().filter(|d| d.hosts(&unit.services)).count() as u32;
                if hosting < unit.max
                    && self.accepts(&drafts[i], &unit.services, &unit.hardware, &unit.image)
                {
                    drafts[i].add(&unit.services, &unit.hardware, &unit.image);
                }
            }
            if drafts[i].services.is_empty() {
                return Err(Violation::NoPlacement { node: i }.into());
            }
        }
        Ok(())
    }

    fn finalize(
        &self,
        drafts: Vec<Draft>,
        preference: &Preference,
    ) -> SolverResult<Vec<PlannedNode>> {
        let compat = &self.template.compatibilities;
        drafts
            .into_iter()
            .map(|draft| {
                let hardwaretype = pick(
                    &draft.hardware,
                    preference.hardwaretype.as_deref(),
                    &compat.hardwaretypes,
                    CompatKind::Hardwaretype,
                )?;
                let imagetype = pick(
                    &draft.image,
                    preference.imagetype.as_deref(),
                    &compat.imagetypes,
                    CompatKind::Imagetype,
                )?;
                let provider = draft
                    .provider
                    .or_else(|| preference.provider.clone())
                    .ok_or_else(|| SolverError::Invalid("no provider chosen".to_string()))?;
                Ok(PlannedNode {
                    id: draft.id,
                    layout: NodeLayout {
                        hardwaretype,
                        imagetype,
                        provider,
                        services: draft.services,
                    },
                })
            })
            .collect()
    }

    /// Attributes for new nodes of an existing cluster.
    fn preference_from(&self, current: &[PlannedNode]) -> Preference {
        let defaults = &self.template.cluster_defaults;
        match current.first() {
            Some(node) => Preference {
                hardwaretype: Some(node.layout.hardwaretype.clone()),
                imagetype: Some(node.layout.imagetype.clone()),
                provider: Some(node.layout.provider.clone()),
            },
            None => Preference {
                hardwaretype: defaults.hardwaretype.clone(),
                imagetype: defaults.imagetype.clone(),
                provider: defaults.provider.clone(),
            },
        }
    }
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn cluster_services(nodes: &[PlannedNode]) -> BTreeSet<String> {
    nodes
        .iter()
        .flat_map(|n| n.layout.services.iter().cloned())
        .collect()
}

/// Choose the preferred value when allowed, else the first allowed one.
fn pick(
    allowed: &Allowed,
    preferred: Option<&str>,
    compat: &BTreeSet<String>,
    kind: CompatKind,
) -> SolverResult<String> {
    if let Some(preferred) = preferred {
        if allowed.contains(preferred) {
            return Ok(preferred.to_string());
        }
    }
    match &allowed.0 {
        Some(values) => values
            .iter()
            .find(|v| compat.is_empty() || compat.contains(*v))
            .cloned()
            .ok_or_else(|| {
                Violation::Incompatible {
                    kind,
                    value: values.iter().cloned().collect::<Vec<_>>().join(","),
                }
                .into()
            }),
        None => Err(SolverError::Invalid(format!("no {kind} chosen"))),
    }
}
