//! Task DAG and its staged form.

use std::collections::{BTreeMap, BTreeSet};

use provgrid_state::{NodeId, NodeLayout, ProvisionerAction, ServiceAction};
use serde::{Deserialize, Serialize};

use crate::error::{PlannerError, PlannerResult};

/// One provisioner action to run on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub node_id: NodeId,
    /// `None` for node-level actions.
    pub service: Option<String>,
    pub action: ProvisionerAction,
    pub service_action: Option<ServiceAction>,
    /// Layout of the node the action runs against.
    pub node: NodeLayout,
}

/// Tasks grouped into stages that run one after another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub stages: Vec<Vec<PlannedTask>>,
}

impl TaskGraph {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    /// Stage of the task matching `node_id`, `service` and `action`.
    pub fn stage_of(
        &self,
        node_id: &str,
        service: Option<&str>,
        action: ProvisionerAction,
    ) -> Option<usize> {
        self.stages.iter().position(|stage| {
            stage.iter().any(|t| {
                t.node_id == node_id && t.service.as_deref() == service && t.action == action
            })
        })
    }

    /// Stages holding any `action` task for `service`, on any node.
    pub fn stages_of_service(&self, service: &str, action: ProvisionerAction) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| {
                stage
                    .iter()
                    .any(|t| t.service.as_deref() == Some(service) && t.action == action)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

type TaskKey = (NodeId, Option<String>, ProvisionerAction);

/// Tasks plus "must run after" edges.
#[derive(Debug, Default)]
pub(crate) struct Dag {
    tasks: Vec<PlannedTask>,
    deps: Vec<BTreeSet<usize>>,
    index: BTreeMap<TaskKey, usize>,
}

impl Dag {
    /// Add a task, or return the existing one with the same key.
    pub(crate) fn add(&mut self, task: PlannedTask) -> usize {
        let key = (task.node_id.clone(), task.service.clone(), task.action);
        if let Some(&existing) = self.index.get(&key) {
            return existing;
        }
        let id = self.tasks.len();
        self.tasks.push(task);
        self.deps.push(BTreeSet::new());
        self.index.insert(key, id);
        id
    }

    /// `after` may not start before `before` completes.
    pub(crate) fn edge(&mut self, before: usize, after: usize) {
        if before != after {
            self.deps[after].insert(before);
        }
    }

    pub(crate) fn edges_from_all(&mut self, before: &[usize], after: &[usize]) {
        for &b in before {
            for &a in after {
                self.edge(b, a);
            }
        }
    }

    /// Level tasks by longest path from a root.
    pub(crate) fn into_graph(self) -> PlannerResult<TaskGraph> {
        let count = self.tasks.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut pending: Vec<usize> = vec![0; count];
        for (task, deps) in self.deps.iter().enumerate() {
            pending[task] = deps.len();
            for &dep in deps {
                dependents[dep].push(task);
            }
        }

        let mut level = vec![0usize; count];
        let mut ready: Vec<usize> = (0..count).filter(|&t| pending[t] == 0).collect();
        let mut visited = 0;
        while let Some(task) = ready.pop() {
            visited += 1;
            for &next in &dependents[task] {
                level[next] = level[next].max(level[task] + 1);
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push(next);
                }
            }
        }
        if visited < count {
            let services: Vec<String> = (0..count)
                .filter(|&t| pending[t] > 0)
                .filter_map(|t| self.tasks[t].service.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            return Err(PlannerError::DependencyCycle { services });
        }

        let depth = level.iter().max().map_or(0, |m| m + 1);
        let mut stages: Vec<Vec<PlannedTask>> = vec![Vec::new(); depth];
        for (task, planned) in self.tasks.into_iter().enumerate() {
            stages[level[task]].push(planned);
        }
        Ok(TaskGraph { stages })
    }
}
