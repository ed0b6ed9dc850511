//! Builds task graphs from layout changes and service operations.
//!
//! Ordering rules:
//!
//! - a new node runs `Create → Confirm → Bootstrap` before any service action;
//! - a service runs `Install → Configure → Initialize → Start`, skipping the
//!   actions it does not map;
//! - when A requires or uses B, A's `Initialize`/`Start` wait for B to be
//!   started on every node;
//! - removal runs `Stop → Remove`, dependents first, and a node is deleted
//!   only after all of its services are removed.

use std::collections::{BTreeMap, BTreeSet};

use provgrid_state::{NodeId, NodeLayout, ProvisionerAction, Service, ServiceCatalog};
use tracing::debug;

use crate::error::{PlannerError, PlannerResult};
use crate::graph::{Dag, PlannedTask, TaskGraph};

/// An action on the services of an existing cluster. An empty service set
/// means every service in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOperation {
    Start(BTreeSet<String>),
    Stop(BTreeSet<String>),
    Restart(BTreeSet<String>),
    Configure { restart: bool },
}

/// Task ids recorded per service while the DAG is built.
#[derive(Debug, Default)]
struct ServiceTasks {
    /// First task of each chain on each node.
    heads: BTreeMap<String, Vec<usize>>,
    /// Last task of each chain on each node.
    tails: BTreeMap<String, Vec<usize>>,
    /// `Initialize`/`Start` tasks, which wait on dependencies.
    gated: BTreeMap<String, Vec<usize>>,
}

impl ServiceTasks {
    fn record(&mut self, service: &str, chain: &[(ProvisionerAction, usize)]) {
        let (Some(&(_, head)), Some(&(_, tail))) = (chain.first(), chain.last()) else {
            return;
        };
        self.heads.entry(service.to_string()).or_default().push(head);
        self.tails.entry(service.to_string()).or_default().push(tail);
        let gated = self.gated.entry(service.to_string()).or_default();
        gated.extend(chain.iter().filter_map(|&(action, id)| {
            matches!(
                action,
                ProvisionerAction::Initialize | ProvisionerAction::Start
            )
            .then_some(id)
        }));
    }
}

/// Plans tasks against one service catalog.
pub struct TaskGraphBuilder<'a> {
    catalog: &'a ServiceCatalog,
}

impl<'a> TaskGraphBuilder<'a> {
    pub fn new(catalog: &'a ServiceCatalog) -> Self {
        Self { catalog }
    }

    /// Plan the tasks that turn `current` into `target`.
    ///
    /// Nodes only in `target` are created, nodes only in `current` are
    /// deleted, and nodes in both get their service difference installed
    /// or removed.
    pub fn converge(
        &self,
        current: &BTreeMap<NodeId, NodeLayout>,
        target: &BTreeMap<NodeId, NodeLayout>,
    ) -> PlannerResult<TaskGraph> {
        let involved: BTreeSet<String> = current
            .values()
            .chain(target.values())
            .flat_map(|n| n.services.iter().cloned())
            .collect();
        self.check_acyclic(&involved)?;

        let mut dag = Dag::default();
        let mut installs = ServiceTasks::default();
        let mut removals = ServiceTasks::default();

        for (node_id, layout) in target {
            let (bootstrap, added) = match current.get(node_id) {
                None => {
                    let chain = self.node_chain(&mut dag, node_id, layout);
                    (chain.last().copied(), layout.services.clone())
                }
                Some(existing) => {
                    let removed: BTreeSet<String> =
                        existing.services.difference(&layout.services).cloned().collect();
                    for service in &removed {
                        let chain = self.service_chain(
                            &mut dag,
                            node_id,
                            existing,
                            service,
                            &ProvisionerAction::SERVICE_REMOVAL,
                            None,
                        )?;
                        removals.record(service, &chain);
                    }
                    let added = layout.services.difference(&existing.services).cloned().collect();
                    (None, added)
                }
            };
            for service in &added {
                let chain = self.service_chain(
                    &mut dag,
                    node_id,
                    layout,
                    service,
                    &ProvisionerAction::SERVICE_INSTALL,
                    bootstrap,
                )?;
                installs.record(service, &chain);
            }
        }

        for (node_id, layout) in current {
            if target.contains_key(node_id) {
                continue;
            }
            let mut tails = Vec::new();
            for service in &layout.services {
                let chain = self.service_chain(
                    &mut dag,
                    node_id,
                    layout,
                    service,
                    &ProvisionerAction::SERVICE_REMOVAL,
                    None,
                )?;
                removals.record(service, &chain);
                tails.extend(chain.last().map(|&(_, id)| id));
            }
            let delete = dag.add(node_task(node_id, layout, ProvisionerAction::Delete));
            dag.edges_from_all(&tails, &[delete]);
        }

        self.order_installs(&mut dag, &installs);
        self.order_removals(&mut dag, &removals);

        let graph = dag.into_graph()?;
        debug!(
            stages = graph.stages.len(),
            tasks = graph.task_count(),
            "converge graph built"
        );
        Ok(graph)
    }

    /// Plan a start, stop, restart or configure of services on `nodes`.
    pub fn service_operation(
        &self,
        nodes: &BTreeMap<NodeId, NodeLayout>,
        operation: &ServiceOperation,
    ) -> PlannerResult<TaskGraph> {
        let deployed: BTreeSet<String> = nodes
            .values()
            .flat_map(|n| n.services.iter().cloned())
            .collect();
        let selected = match operation {
            ServiceOperation::Start(s) | ServiceOperation::Stop(s) | ServiceOperation::Restart(s) => {
                if let Some(missing) = s.iter().find(|svc| !deployed.contains(*svc)) {
                    return Err(PlannerError::NotInCluster(missing.clone()));
                }
                if s.is_empty() { deployed.clone() } else { s.clone() }
            }
            ServiceOperation::Configure { .. } => deployed.clone(),
        };
        self.check_acyclic(&selected)?;

        let (configure, stop, start) = match operation {
            ServiceOperation::Start(_) => (false, false, true),
            ServiceOperation::Stop(_) => (false, true, false),
            ServiceOperation::Restart(_) => (false, true, true),
            ServiceOperation::Configure { restart } => (true, *restart, *restart),
        };

        let mut dag = Dag::default();
        let mut configured = Vec::new();
        let mut stops = ServiceTasks::default();
        let mut starts = ServiceTasks::default();

        for (node_id, layout) in nodes {
            for service in layout.services.iter().filter(|s| selected.contains(*s)) {
                if configure {
                    let chain = self.service_chain(
                        &mut dag,
                        node_id,
                        layout,
                        service,
                        &[ProvisionerAction::Configure],
                        None,
                    )?;
                    configured.extend(chain.iter().map(|&(_, id)| id));
                }
                if stop {
                    let chain = self.service_chain(
                        &mut dag,
                        node_id,
                        layout,
                        service,
                        &[ProvisionerAction::Stop],
                        None,
                    )?;
                    stops.record(service, &chain);
                }
                if start {
                    let chain = self.service_chain(
                        &mut dag,
                        node_id,
                        layout,
                        service,
                        &[ProvisionerAction::Start],
                        None,
                    )?;
                    starts.record(service, &chain);
                }
            }
        }

        let stop_ids: Vec<usize> = stops.heads.values().flatten().copied().collect();
        let start_ids: Vec<usize> = starts.heads.values().flatten().copied().collect();
        // Configure, then stop everything, then start.
        if stop {
            dag.edges_from_all(&configured, &stop_ids);
            dag.edges_from_all(&stop_ids, &start_ids);
        } else {
            dag.edges_from_all(&configured, &start_ids);
        }
        self.order_installs(&mut dag, &starts);
        self.order_removals(&mut dag, &stops);

        let graph = dag.into_graph()?;
        debug!(
            ?operation,
            stages = graph.stages.len(),
            tasks = graph.task_count(),
            "service operation graph built"
        );
        Ok(graph)
    }

    fn service(&self, name: &str) -> PlannerResult<&Service> {
        self.catalog
            .get(name)
            .ok_or_else(|| PlannerError::UnknownService(name.to_string()))
    }

    /// `Create → Confirm → Bootstrap` for a new node.
    fn node_chain(&self, dag: &mut Dag, node_id: &str, layout: &NodeLayout) -> Vec<usize> {
        let mut chain = Vec::with_capacity(ProvisionerAction::NODE_CREATION.len());
        for action in ProvisionerAction::NODE_CREATION {
            let id = dag.add(node_task(node_id, layout, action));
            if let Some(&previous) = chain.last() {
                dag.edge(previous, id);
            }
            chain.push(id);
        }
        chain
    }

    /// Chain the mapped `actions` of `service` on one node.
    fn service_chain(
        &self,
        dag: &mut Dag,
        node_id: &str,
        layout: &NodeLayout,
        service: &str,
        actions: &[ProvisionerAction],
        after: Option<usize>,
    ) -> PlannerResult<Vec<(ProvisionerAction, usize)>> {
        let definition = self.service(service)?;
        let mut chain: Vec<(ProvisionerAction, usize)> = Vec::new();
        for &action in actions {
            let Some(service_action) = definition.action(action) else {
                continue;
            };
            let id = dag.add(PlannedTask {
                node_id: node_id.to_string(),
                service: Some(service.to_string()),
                action,
                service_action: Some(service_action.clone()),
                node: layout.clone(),
            });
            match chain.last() {
                Some(&(_, previous)) => dag.edge(previous, id),
                None => {
                    if let Some(after) = after {
                        dag.edge(after, id);
                    }
                }
            }
            chain.push((action, id));
        }
        Ok(chain)
    }

    /// Dependents start after what they depend on has started everywhere.
    fn order_installs(&self, dag: &mut Dag, tasks: &ServiceTasks) {
        for (service, gated) in &tasks.gated {
            let Some(definition) = self.catalog.get(service) else {
                continue;
            };
            for dependency in definition.dependencies.ordered_after() {
                if let Some(ready) = tasks.tails.get(dependency) {
                    dag.edges_from_all(ready, gated);
                }
            }
        }
    }

    /// Dependents stop before what they depend on.
    fn order_removals(&self, dag: &mut Dag, tasks: &ServiceTasks) {
        for (service, dependent_heads) in &tasks.heads {
            let Some(definition) = self.catalog.get(service) else {
                continue;
            };
            for dependency in definition.dependencies.ordered_after() {
                if let Some(dependency_heads) = tasks.heads.get(dependency) {
                    dag.edges_from_all(dependent_heads, dependency_heads);
                }
            }
        }
    }

    /// Reject cycles in `requires`/`uses` among `services`.
    fn check_acyclic(&self, services: &BTreeSet<String>) -> PlannerResult<()> {
        #[derive(Clone, Copy)]
        enum Mark {
            Active,
            Done,
        }

        fn visit<'c>(
            catalog: &'c ServiceCatalog,
            scope: &BTreeSet<String>,
            service: &'c str,
            marks: &mut BTreeMap<&'c str, Mark>,
            path: &mut Vec<&'c str>,
        ) -> PlannerResult<()> {
            match marks.get(service) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Active) => {
                    let start = path.iter().position(|s| *s == service).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(service.to_string());
                    return Err(PlannerError::DependencyCycle { services: cycle });
                }
                None => {}
            }
            let Some(definition) = catalog.get(service) else {
                return Err(PlannerError::UnknownService(service.to_string()));
            };
            marks.insert(service, Mark::Active);
            path.push(service);
            for dependency in definition.dependencies.ordered_after() {
                if scope.contains(dependency) {
                    visit(catalog, scope, dependency, marks, path)?;
                }
            }
            path.pop();
            marks.insert(service, Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        let mut path = Vec::new();
        for service in services {
            let Some((name, _)) = self.catalog.get_key_value(service) else {
                return Err(PlannerError::UnknownService(service.clone()));
            };
            visit(self.catalog, services, name, &mut marks, &mut path)?;
        }
        Ok(())
    }
}

fn node_task(node_id: &str, layout: &NodeLayout, action: ProvisionerAction) -> PlannedTask {
    PlannedTask {
        node_id: node_id.to_string(),
        service: None,
        action,
        service_action: None,
        node: layout.clone(),
    }
}
