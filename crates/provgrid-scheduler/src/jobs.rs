//! Per-cluster job queues and the job state machine.
//!
//! ```text
//! QUEUED ──dequeue──▶ RUNNING ──last stage done──▶ COMPLETE
//!   │                   │
//!   │                   ├──task out of retries──▶ FAILED
//!   └──────abort────────┴──────────abort─────────▶ CANCELLED
//! ```
//!
//! A job runs only while it holds its cluster's lock in the store, so at
//! most one job per cluster is ever `RUNNING`. Every transition is a
//! compare-and-set on the stored job; whoever loses the race does nothing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use provgrid_core::epoch_millis;
use provgrid_planner::{ServiceOperation, TaskGraph, TaskGraphBuilder};
use provgrid_solver::{SolveRequest, Solver};
use provgrid_state::{
    Cluster, ClusterAction, ClusterId, ClusterStatus, ClusterTask, Job, JobId, JobStatus, Node,
    NodeId, NodeLayout, NodeStatus, PlannedNode, ServiceCatalog, StateStore, TaskStatus, job_id,
    node_id, task_id,
};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::callback::{CallbackDispatcher, ClusterEvent, ClusterEventKind};
use crate::error::{SchedulerError, SchedulerResult};
use crate::workers::WorkerBalancer;

/// Nodes of `cluster_id` that have not been deleted, in id order.
pub(crate) fn live_nodes(state: &StateStore, cluster_id: &str) -> SchedulerResult<Vec<PlannedNode>> {
    Ok(state
        .list_nodes_for_cluster(cluster_id)?
        .into_iter()
        .filter(|n| n.status != NodeStatus::Deleted)
        .map(|n| PlannedNode {
            id: n.id,
            layout: n.layout,
        })
        .collect())
}

/// Layout the cluster should have after `action`, from `current`.
pub(crate) fn target_layout(
    cluster: &Cluster,
    catalog: &ServiceCatalog,
    action: &ClusterAction,
    current: &[PlannedNode],
) -> SchedulerResult<Vec<PlannedNode>> {
    let solver = Solver::new(&cluster.template, catalog);
    let target = match action {
        ClusterAction::Create => {
            return Err(SchedulerError::Validation(
                "create is only valid for a new cluster".to_string(),
            ));
        }
        ClusterAction::Delete => Vec::new(),
        ClusterAction::AddServices { services } => solver.solve(
            current,
            &SolveRequest::AddServices {
                services: services.clone(),
            },
        )?,
        ClusterAction::RemoveServices { services } => solver.solve(
            current,
            &SolveRequest::RemoveServices {
                services: services.clone(),
            },
        )?,
        ClusterAction::Resize { size } => {
            solver.solve(current, &SolveRequest::Resize { size: *size })?
        }
        ClusterAction::StartServices { .. }
        | ClusterAction::StopServices { .. }
        | ClusterAction::RestartServices { .. }
        | ClusterAction::Configure { .. } => current.to_vec(),
    };
    Ok(target)
}

fn layout_map(nodes: &[PlannedNode]) -> BTreeMap<NodeId, NodeLayout> {
    nodes
        .iter()
        .map(|n| (n.id.clone(), n.layout.clone()))
        .collect()
}

/// Task graph taking the cluster from `current` to `target` for `action`.
pub(crate) fn plan_graph(
    catalog: &ServiceCatalog,
    action: &ClusterAction,
    current: &[PlannedNode],
    target: &[PlannedNode],
) -> SchedulerResult<TaskGraph> {
    let builder = TaskGraphBuilder::new(catalog);
    let current = layout_map(current);
    let operation = match action {
        ClusterAction::StartServices { services } => ServiceOperation::Start(services.clone()),
        ClusterAction::StopServices { services } => ServiceOperation::Stop(services.clone()),
        ClusterAction::RestartServices { services } => {
            ServiceOperation::Restart(services.clone())
        }
        ClusterAction::Configure { restart } => ServiceOperation::Configure { restart: *restart },
        _ => return Ok(builder.converge(&current, &layout_map(target))?),
    };
    Ok(builder.service_operation(&current, &operation)?)
}

/// Queues jobs per cluster and drives them through their stages.
#[derive(Clone)]
pub struct JobScheduler {
    state: StateStore,
    balancer: WorkerBalancer,
    callbacks: CallbackDispatcher,
    /// Queued job ids per cluster, in submission order.
    queues: Arc<Mutex<BTreeMap<ClusterId, VecDeque<JobId>>>>,
    notify: Arc<Notify>,
}

impl JobScheduler {
    pub fn new(state: StateStore, balancer: WorkerBalancer, callbacks: CallbackDispatcher) -> Self {
        Self {
            state,
            balancer,
            callbacks,
            queues: Arc::new(Mutex::new(BTreeMap::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Wakes the dispatch loop when a job is queued or a lock is released.
    pub fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// A new `QUEUED` job for `cluster` with the next submission sequence.
    fn new_job(
        &self,
        cluster: &Cluster,
        action: ClusterAction,
        target: Vec<PlannedNode>,
    ) -> SchedulerResult<Job> {
        let seq = self.state.next_id(&format!("job/{}", cluster.id))?;
        let now = epoch_millis();
        Ok(Job {
            id: job_id(&cluster.id, seq),
            cluster_id: cluster.id.clone(),
            tenant: cluster.tenant.clone(),
            action,
            status: JobStatus::Queued,
            target,
            stages: Vec::new(),
            planned: false,
            current_stage: 0,
            created_at: now,
            updated_at: now,
            failure: None,
        })
    }

    /// Store a new `QUEUED` job for `action` and append it to the cluster's
    /// queue.
    ///
    /// The sequence number is taken under the queue lock, so queue order
    /// and sequence order agree however many submissions race.
    pub async fn submit(
        &self,
        cluster: &Cluster,
        action: ClusterAction,
        target: Vec<PlannedNode>,
    ) -> SchedulerResult<Job> {
        let mut queues = self.queues.lock().await;
        let job = self.new_job(cluster, action, target)?;
        self.state.put_job(&job)?;
        self.state.update_cluster(&job.cluster_id, |c| {
            c.latest_job = Some(job.id.clone());
            true
        })?;
        queues
            .entry(job.cluster_id.clone())
            .or_default()
            .push_back(job.id.clone());
        drop(queues);

        info!(
            cluster_id = %job.cluster_id,
            job_id = %job.id,
            action = job.action.name(),
            "job queued"
        );
        self.notify.notify_one();
        Ok(job)
    }

    /// Jobs waiting behind the running one, per cluster.
    pub async fn queued(&self, cluster_id: &str) -> Vec<JobId> {
        self.queues
            .lock()
            .await
            .get(cluster_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-drive running jobs, then start the head job of every cluster
    /// whose lock is free.
    pub async fn dispatch_ready(&self) -> SchedulerResult<usize> {
        let mut queues = self.queues.lock().await;
        self.reconcile_running(&queues).await?;

        let clusters: Vec<ClusterId> = queues.keys().cloned().collect();
        let mut started = 0;

        for cluster_id in clusters {
            let Some(job_id) = queues.get(&cluster_id).and_then(|q| q.front()).cloned() else {
                queues.remove(&cluster_id);
                continue;
            };
            match self.acquire(&cluster_id, &job_id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(%cluster_id, %job_id, error = %e, "cluster lock check failed");
                    continue;
                }
            }
            if let Some(queue) = queues.get_mut(&cluster_id) {
                queue.pop_front();
                if queue.is_empty() {
                    queues.remove(&cluster_id);
                }
            }
            match self.start_job(&cluster_id, &job_id).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    // Keep the lock and retry on the next pass.
                    error!(%cluster_id, %job_id, error = %e, "failed to start job");
                    queues.entry(cluster_id).or_default().push_front(job_id);
                }
            }
        }
        Ok(started)
    }

    /// Pick up running jobs wherever an earlier pass stopped.
    ///
    /// Every job holding a cluster lock is checked against its tasks: a
    /// finished last stage completes the job, a finished stage advances it,
    /// a task out of retries fails it, and undispatched tasks of the current
    /// stage are queued again. Jobs still waiting at the head of a queue are
    /// left to `start_job`.
    async fn reconcile_running(
        &self,
        queues: &BTreeMap<ClusterId, VecDeque<JobId>>,
    ) -> SchedulerResult<()> {
        for lock in self.state.list_cluster_locks()? {
            let starting = queues
                .get(&lock.cluster_id)
                .and_then(|q| q.front())
                .is_some_and(|head| *head == lock.job_id);
            if starting {
                continue;
            }
            if let Err(e) = self.reconcile_job(&lock.job_id).await {
                warn!(
                    cluster_id = %lock.cluster_id,
                    job_id = %lock.job_id,
                    error = %e,
                    "job reconciliation failed"
                );
            }
        }
        Ok(())
    }

    async fn reconcile_job(&self, job_id: &str) -> SchedulerResult<()> {
        let Some(job) = self.state.get_job(job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Running || !job.planned {
            return Ok(());
        }
        if job.current_stage >= job.stages.len() {
            return self.complete_job(job_id);
        }

        let mut waiting = Vec::new();
        let mut done = true;
        for id in job.current_stage_tasks() {
            let Some(task) = self.state.get_task(id)? else {
                continue;
            };
            match task.status {
                TaskStatus::Complete => {}
                TaskStatus::Failed => return self.task_failed(&task),
                TaskStatus::NotSubmitted => {
                    done = false;
                    waiting.push(task.id);
                }
                _ => done = false,
            }
        }
        if done {
            self.advance_if_done(job_id, job.current_stage).await?;
        } else if !waiting.is_empty() {
            self.balancer.enqueue(waiting).await;
        }
        Ok(())
    }

    /// Take the cluster lock for `job_id`, clearing locks left by finished jobs.
    fn acquire(&self, cluster_id: &str, job_id: &str) -> SchedulerResult<bool> {
        if self.state.try_lock_cluster(cluster_id, job_id, epoch_millis())? {
            return Ok(true);
        }
        let Some(lock) = self.state.cluster_lock(cluster_id)? else {
            return Ok(false);
        };
        if lock.job_id == job_id {
            return Ok(true);
        }
        let holder_done = self
            .state
            .get_job(&lock.job_id)?
            .is_none_or(|j| j.status.is_terminal());
        if holder_done {
            debug!(%cluster_id, holder = %lock.job_id, "releasing stale cluster lock");
            self.state.unlock_cluster(cluster_id, &lock.job_id)?;
            self.notify.notify_one();
        }
        Ok(false)
    }

    /// Plan and start a locked job. Returns whether it is now running.
    ///
    /// A job already `RUNNING` was started by an earlier pass that failed
    /// part way; it keeps its lock and its persisted plan and is resumed.
    async fn start_job(&self, cluster_id: &str, job_id: &str) -> SchedulerResult<bool> {
        let Some(job) = self.state.get_job(job_id)? else {
            self.state.unlock_cluster(cluster_id, job_id)?;
            return Ok(false);
        };
        match job.status {
            JobStatus::Queued => {}
            JobStatus::Running if job.planned => {
                info!(%cluster_id, %job_id, stage = job.current_stage, "resuming job start");
                self.activate(cluster_id, &job).await?;
                return Ok(true);
            }
            status => {
                debug!(%cluster_id, %job_id, ?status, "skipping job that is no longer queued");
                self.state.unlock_cluster(cluster_id, job_id)?;
                self.notify.notify_one();
                return Ok(false);
            }
        }

        let (target, graph) = match self.prepare(&job) {
            Ok(planned) => planned,
            Err(SchedulerError::State(e)) => return Err(SchedulerError::State(e)),
            Err(e) => {
                warn!(%cluster_id, %job_id, error = %e, "job could not be planned");
                self.fail_job(job_id, &e.to_string())?;
                return Ok(false);
            }
        };

        let now = epoch_millis();
        let mut tasks = Vec::with_capacity(graph.task_count());
        let mut stages = Vec::with_capacity(graph.stages.len());
        for (stage, planned) in graph.stages.into_iter().enumerate() {
            let mut ids = Vec::with_capacity(planned.len());
            for p in planned {
                let id = task_id(&job.id, tasks.len());
                ids.push(id.clone());
                tasks.push(ClusterTask {
                    id,
                    job_id: job.id.clone(),
                    cluster_id: job.cluster_id.clone(),
                    tenant: job.tenant.clone(),
                    node_id: p.node_id,
                    service: p.service,
                    action: p.action,
                    service_action: p.service_action,
                    node: p.node,
                    stage,
                    status: TaskStatus::NotSubmitted,
                    attempts: 0,
                    worker: None,
                    created_at: now,
                    submitted_at: None,
                    updated_at: now,
                    not_before: 0,
                    last_error: None,
                });
            }
            stages.push(ids);
        }
        self.state.put_tasks(&tasks)?;

        let running = self.state.update_job(job_id, |j| {
            if j.status != JobStatus::Queued {
                return false;
            }
            j.status = JobStatus::Running;
            j.stages = stages;
            j.target = target;
            j.planned = true;
            j.current_stage = 0;
            j.updated_at = now;
            true
        })?;
        let Some(job) = running else {
            // Cancelled while planning.
            self.drop_unsubmitted(job_id)?;
            self.state.unlock_cluster(cluster_id, job_id)?;
            return Ok(false);
        };
        info!(
            %cluster_id,
            %job_id,
            action = job.action.name(),
            stages = job.stages.len(),
            tasks = tasks.len(),
            "job started"
        );

        self.activate(cluster_id, &job).await?;
        Ok(true)
    }

    /// Create the job's new nodes, mark the cluster pending and queue the
    /// current stage. Repeatable until it succeeds.
    async fn activate(&self, cluster_id: &str, job: &Job) -> SchedulerResult<()> {
        let now = epoch_millis();
        let existing: BTreeSet<NodeId> = self
            .state
            .list_nodes_for_cluster(cluster_id)?
            .into_iter()
            .map(|n| n.id)
            .collect();
        for planned in job.target.iter().filter(|n| !existing.contains(&n.id)) {
            self.state.put_node(&Node {
                id: planned.id.clone(),
                cluster_id: cluster_id.to_string(),
                layout: planned.layout.clone(),
                status: NodeStatus::Pending,
                created_at: now,
                updated_at: now,
            })?;
        }
        self.state.update_cluster(cluster_id, |c| {
            c.status = ClusterStatus::Pending;
            true
        })?;

        self.callbacks
            .emit(ClusterEvent::for_job(ClusterEventKind::Start, job, now));
        self.run_current_stage(job).await;
        Ok(())
    }

    /// Queue the job's current stage, or complete the job past its last one.
    ///
    /// A failed completion is left to the next dispatch pass.
    async fn run_current_stage(&self, job: &Job) {
        if job.current_stage < job.stages.len() {
            self.balancer
                .enqueue(job.current_stage_tasks().to_vec())
                .await;
            return;
        }
        if let Err(e) = self.complete_job(&job.id) {
            error!(
                cluster_id = %job.cluster_id,
                job_id = %job.id,
                error = %e,
                "failed to complete job"
            );
        }
    }

    /// Target layout (with node ids filled in) and task graph for `job`.
    fn prepare(&self, job: &Job) -> SchedulerResult<(Vec<PlannedNode>, TaskGraph)> {
        let cluster = self
            .state
            .get_cluster(&job.cluster_id)?
            .ok_or_else(|| SchedulerError::not_found("cluster", &job.cluster_id))?;
        let catalog = self.state.service_catalog(&job.tenant)?;
        let current = live_nodes(&self.state, &job.cluster_id)?;

        let mut target = match job.action {
            ClusterAction::Create => job.target.clone(),
            _ => target_layout(&cluster, &catalog, &job.action, &current)?,
        };
        for node in target.iter_mut().filter(|n| n.id.is_empty()) {
            let seq = self.state.next_id(&format!("node/{}", cluster.id))?;
            node.id = node_id(&cluster.id, seq);
        }
        let graph = plan_graph(&catalog, &job.action, &current, &target)?;
        Ok((target, graph))
    }

    /// React to a completed task: advance the stage once all of it is done.
    pub async fn task_completed(&self, task: &ClusterTask) -> SchedulerResult<()> {
        self.advance_if_done(&task.job_id, task.stage).await
    }

    async fn advance_if_done(&self, job_id: &str, stage: usize) -> SchedulerResult<()> {
        let Some(job) = self.state.get_job(job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Running || job.current_stage != stage {
            return Ok(());
        }
        for id in job.current_stage_tasks() {
            let done = self
                .state
                .get_task(id)?
                .is_some_and(|t| t.status == TaskStatus::Complete);
            if !done {
                return Ok(());
            }
        }

        let now = epoch_millis();
        let advanced = self.state.update_job(job_id, |j| {
            if j.status != JobStatus::Running || j.current_stage != stage {
                return false;
            }
            j.current_stage += 1;
            j.updated_at = now;
            true
        })?;
        let Some(job) = advanced else {
            return Ok(());
        };
        debug!(
            cluster_id = %job.cluster_id,
            %job_id,
            stage = job.current_stage,
            "stage advanced"
        );
        self.run_current_stage(&job).await;
        Ok(())
    }

    /// Bring nodes and cluster in line with a running job's target, then
    /// mark it complete.
    ///
    /// The node and cluster writes come first and are repeatable, so a store
    /// error leaves the job `RUNNING` for the next pass to finish.
    fn complete_job(&self, job_id: &str) -> SchedulerResult<()> {
        let now = epoch_millis();
        let Some(job) = self.state.get_job(job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let existing: BTreeMap<NodeId, Node> = self
            .state
            .list_nodes_for_cluster(&job.cluster_id)?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let target_ids: BTreeSet<&NodeId> = job.target.iter().map(|n| &n.id).collect();
        for planned in &job.target {
            self.state.put_node(&Node {
                id: planned.id.clone(),
                cluster_id: job.cluster_id.clone(),
                layout: planned.layout.clone(),
                status: NodeStatus::Active,
                created_at: existing.get(&planned.id).map_or(now, |n| n.created_at),
                updated_at: now,
            })?;
        }
        for node in existing.values() {
            if !target_ids.contains(&node.id) && node.status != NodeStatus::Deleted {
                self.state.update_node(&node.id, |n| {
                    n.status = NodeStatus::Deleted;
                    n.updated_at = now;
                    true
                })?;
            }
        }

        let terminated = job.action == ClusterAction::Delete;
        self.state.update_cluster(&job.cluster_id, |c| {
            c.nodes = job.target.iter().map(|n| n.id.clone()).collect();
            c.services = job
                .target
                .iter()
                .flat_map(|n| n.layout.services.iter().cloned())
                .collect();
            c.status = if terminated {
                ClusterStatus::Terminated
            } else {
                ClusterStatus::Active
            };
            true
        })?;

        let completed = self.state.update_job(job_id, |j| {
            if j.status != JobStatus::Running {
                return false;
            }
            j.status = JobStatus::Complete;
            j.updated_at = now;
            true
        })?;
        let Some(job) = completed else {
            // Failed or cancelled meanwhile; its cluster stays incomplete.
            self.mark_incomplete(&job.cluster_id)?;
            return Ok(());
        };

        info!(cluster_id = %job.cluster_id, %job_id, action = job.action.name(), "job complete");
        self.callbacks
            .emit(ClusterEvent::for_job(ClusterEventKind::Success, &job, now));
        self.release(&job)
    }

    /// React to a task that ran out of retries.
    pub fn task_failed(&self, task: &ClusterTask) -> SchedulerResult<()> {
        if task.action.is_node_action() {
            let now = epoch_millis();
            self.state.update_node(&task.node_id, |n| {
                if n.status == NodeStatus::Deleted {
                    return false;
                }
                n.status = NodeStatus::Failed;
                n.updated_at = now;
                true
            })?;
        }
        let what = match &task.service {
            Some(service) => format!("{} of {service}", task.action),
            None => task.action.to_string(),
        };
        let reason = format!(
            "{what} on node {} failed after {} attempts: {}",
            task.node_id,
            task.attempts,
            task.last_error.as_deref().unwrap_or("unknown error")
        );
        self.fail_job(&task.job_id, &reason)?;
        Ok(())
    }

    /// Fail a job exactly once. Returns whether this call failed it.
    pub fn fail_job(&self, job_id: &str, reason: &str) -> SchedulerResult<bool> {
        let now = epoch_millis();
        let failed = self.state.update_job(job_id, |j| {
            if j.status.is_terminal() {
                return false;
            }
            j.status = JobStatus::Failed;
            j.failure = Some(reason.to_string());
            j.updated_at = now;
            true
        })?;
        let Some(job) = failed else {
            return Ok(false);
        };

        let dropped = self.drop_unsubmitted(job_id)?;
        self.mark_incomplete(&job.cluster_id)?;
        warn!(
            cluster_id = %job.cluster_id,
            %job_id,
            dropped,
            %reason,
            "job failed"
        );
        self.callbacks
            .emit(ClusterEvent::for_job(ClusterEventKind::Failure, &job, now));
        self.release(&job)?;
        Ok(true)
    }

    /// Cancel the running job of `cluster_id`, or else its oldest queued job.
    ///
    /// In-flight tasks are left to finish; their reports are discarded.
    pub async fn cancel(&self, cluster_id: &str) -> SchedulerResult<Job> {
        let now = epoch_millis();
        let cancel = |j: &mut Job| {
            if j.status.is_terminal() {
                return false;
            }
            j.status = JobStatus::Cancelled;
            j.failure = Some("cancelled".to_string());
            j.updated_at = now;
            true
        };

        if let Some(lock) = self.state.cluster_lock(cluster_id)?
            && let Some(job) = self.state.update_job(&lock.job_id, cancel)?
        {
            let dropped = self.drop_unsubmitted(&job.id)?;
            self.mark_incomplete(cluster_id)?;
            info!(%cluster_id, job_id = %job.id, dropped, "running job cancelled");
            self.callbacks
                .emit(ClusterEvent::for_job(ClusterEventKind::Failure, &job, now));
            self.release(&job)?;
            return Ok(job);
        }

        let mut queues = self.queues.lock().await;
        while let Some(job_id) = queues.get_mut(cluster_id).and_then(|q| q.pop_front()) {
            if let Some(job) = self.state.update_job(&job_id, cancel)? {
                info!(%cluster_id, job_id = %job.id, "queued job cancelled");
                return Ok(job);
            }
        }
        queues.remove(cluster_id);
        Err(SchedulerError::not_found("active job for cluster", cluster_id))
    }

    /// Mark every not-yet-dispatched task of the job `DROPPED`.
    fn drop_unsubmitted(&self, job_id: &str) -> SchedulerResult<usize> {
        let now = epoch_millis();
        let mut dropped = 0;
        for task in self.state.list_tasks_for_job(job_id)? {
            if task.status != TaskStatus::NotSubmitted {
                continue;
            }
            let updated = self.state.update_task(&task.id, |t| {
                if t.status != TaskStatus::NotSubmitted {
                    return false;
                }
                t.status = TaskStatus::Dropped;
                t.updated_at = now;
                true
            })?;
            if updated.is_some() {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    fn mark_incomplete(&self, cluster_id: &str) -> SchedulerResult<()> {
        self.state.update_cluster(cluster_id, |c| {
            if c.status == ClusterStatus::Terminated {
                return false;
            }
            c.status = ClusterStatus::Incomplete;
            true
        })?;
        Ok(())
    }

    fn release(&self, job: &Job) -> SchedulerResult<()> {
        self.state.unlock_cluster(&job.cluster_id, &job.id)?;
        self.notify.notify_one();
        Ok(())
    }

    /// Rebuild in-memory queues after a restart.
    ///
    /// Queued jobs return to their queues in submission order. Running jobs
    /// get their undispatched current-stage tasks queued again; attempts that
    /// were in flight are left to the timeout sweep.
    pub async fn recover(&self) -> SchedulerResult<()> {
        let mut queued = self.state.list_jobs_with_status(JobStatus::Queued)?;
        queued.sort_by(|a, b| a.id.cmp(&b.id));
        {
            let mut queues = self.queues.lock().await;
            for job in &queued {
                let queue = queues.entry(job.cluster_id.clone()).or_default();
                if !queue.contains(&job.id) {
                    queue.push_back(job.id.clone());
                }
            }
        }

        let running = self.state.list_jobs_with_status(JobStatus::Running)?;
        for job in &running {
            let mut pending = Vec::new();
            for id in job.current_stage_tasks() {
                if let Some(task) = self.state.get_task(id)?
                    && task.status == TaskStatus::NotSubmitted
                {
                    pending.push(task.id);
                }
            }
            self.balancer.enqueue(pending).await;
            self.advance_if_done(&job.id, job.current_stage).await?;
        }

        info!(
            queued = queued.len(),
            running = running.len(),
            "job queues recovered"
        );
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::{ClusterTemplate, ProvisionerAction};
    use std::time::Duration;

    fn scheduler() -> (JobScheduler, StateStore) {
        let state = StateStore::open_in_memory().unwrap();
        let balancer = WorkerBalancer::new(state.clone(), Duration::from_secs(30));
        let (callbacks, _rx) = CallbackDispatcher::new(16);
        (JobScheduler::new(state.clone(), balancer, callbacks), state)
    }

    fn cluster(state: &StateStore, id: &str) -> Cluster {
        let cluster = Cluster {
            id: id.to_string(),
            tenant: "acme".to_string(),
            name: format!("cluster-{id}"),
            template: ClusterTemplate::new("t"),
            template_fingerprint: String::new(),
            nodes: Vec::new(),
            services: BTreeSet::new(),
            status: ClusterStatus::Active,
            created_at: 1,
            expire_at: None,
            latest_job: None,
        };
        state.put_cluster(&cluster).unwrap();
        cluster
    }

    #[tokio::test]
    async fn one_running_job_per_cluster() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");
        let first = jobs.new_job(&c, ClusterAction::Delete, Vec::new()).unwrap();

        // Hold the lock as if `first` were running.
        assert!(state.try_lock_cluster("1", &first.id, 1).unwrap());
        state
            .put_job(&Job {
                status: JobStatus::Running,
                ..first.clone()
            })
            .unwrap();
        let second = jobs
            .submit(&c, ClusterAction::Resize { size: 2 }, Vec::new())
            .await
            .unwrap();
        assert!(first.id < second.id);

        assert_eq!(jobs.dispatch_ready().await.unwrap(), 0);
        assert_eq!(jobs.queued("1").await, vec![second.id.clone()]);
        assert_eq!(
            state.get_cluster("1").unwrap().unwrap().latest_job,
            Some(second.id.clone())
        );
    }

    #[tokio::test]
    async fn empty_graph_completes_immediately() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");
        let job = jobs
            .submit(&c, ClusterAction::Delete, Vec::new())
            .await
            .unwrap();

        assert_eq!(jobs.dispatch_ready().await.unwrap(), 1);
        let job = state.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(state.cluster_lock("1").unwrap().is_none());
        assert_eq!(
            state.get_cluster("1").unwrap().unwrap().status,
            ClusterStatus::Terminated
        );
    }

    #[tokio::test]
    async fn fail_job_happens_once() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");
        let job = jobs.new_job(&c, ClusterAction::Delete, Vec::new()).unwrap();
        state
            .put_job(&Job {
                status: JobStatus::Running,
                ..job.clone()
            })
            .unwrap();
        assert!(state.try_lock_cluster("1", &job.id, 1).unwrap());

        assert!(jobs.fail_job(&job.id, "boom").unwrap());
        assert!(!jobs.fail_job(&job.id, "boom again").unwrap());

        let stored = state.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.failure.as_deref(), Some("boom"));
        assert_eq!(
            state.get_cluster("1").unwrap().unwrap().status,
            ClusterStatus::Incomplete
        );
        assert!(state.cluster_lock("1").unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_takes_oldest_queued_job() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");
        let first = jobs
            .submit(&c, ClusterAction::Delete, Vec::new())
            .await
            .unwrap();

        let cancelled = jobs.cancel("1").await.unwrap();
        assert_eq!(cancelled.id, first.id);
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(jobs.queued("1").await.is_empty());
        assert!(matches!(
            jobs.cancel("1").await,
            Err(SchedulerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stale_lock_is_cleared() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");
        let old = jobs.new_job(&c, ClusterAction::Delete, Vec::new()).unwrap();
        state
            .put_job(&Job {
                status: JobStatus::Complete,
                ..old.clone()
            })
            .unwrap();
        assert!(state.try_lock_cluster("1", &old.id, 1).unwrap());

        jobs.submit(&c, ClusterAction::Delete, Vec::new())
            .await
            .unwrap();
        assert_eq!(jobs.dispatch_ready().await.unwrap(), 0);
        assert_eq!(jobs.dispatch_ready().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recover_requeues_in_submission_order() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");
        let a = jobs.new_job(&c, ClusterAction::Delete, Vec::new()).unwrap();
        let b = jobs.new_job(&c, ClusterAction::Delete, Vec::new()).unwrap();
        state.put_job(&b).unwrap();
        state.put_job(&a).unwrap();

        jobs.recover().await.unwrap();
        assert_eq!(jobs.queued("1").await, vec![a.id, b.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_submissions_queue_in_sequence_order() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");

        let mut handles = Vec::new();
        for size in 1..=16 {
            let jobs = jobs.clone();
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                jobs.submit(&c, ClusterAction::Resize { size }, Vec::new())
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();

        assert_eq!(jobs.queued("1").await, ids);
        assert_eq!(
            state.get_cluster("1").unwrap().unwrap().latest_job.as_ref(),
            ids.last()
        );

        // A restart rebuilds the same order from the store.
        let balancer = WorkerBalancer::new(state.clone(), Duration::from_secs(30));
        let (callbacks, _rx) = CallbackDispatcher::new(16);
        let restarted = JobScheduler::new(state.clone(), balancer, callbacks);
        restarted.recover().await.unwrap();
        assert_eq!(restarted.queued("1").await, ids);
    }

    fn stage_task(job: &Job, status: TaskStatus) -> ClusterTask {
        ClusterTask {
            id: task_id(&job.id, 0),
            job_id: job.id.clone(),
            cluster_id: job.cluster_id.clone(),
            tenant: job.tenant.clone(),
            node_id: node_id(&job.cluster_id, 1),
            service: None,
            action: ProvisionerAction::Create,
            service_action: None,
            node: NodeLayout::default(),
            stage: 0,
            status,
            attempts: 1,
            worker: None,
            created_at: 1,
            submitted_at: None,
            updated_at: 1,
            not_before: 0,
            last_error: None,
        }
    }

    /// Store `job` as running one single-task stage, at `current_stage`.
    fn mark_running(state: &StateStore, job: &Job, task: &ClusterTask, current_stage: usize) {
        state.put_tasks(std::slice::from_ref(task)).unwrap();
        state
            .put_job(&Job {
                status: JobStatus::Running,
                planned: true,
                stages: vec![vec![task.id.clone()]],
                current_stage,
                target: vec![PlannedNode {
                    id: task.node_id.clone(),
                    layout: NodeLayout::default(),
                }],
                ..job.clone()
            })
            .unwrap();
    }

    #[tokio::test]
    async fn interrupted_start_resumes_under_the_same_lock() {
        let (jobs, state) = scheduler();
        let c = cluster(&state, "1");
        let job = jobs
            .submit(&c, ClusterAction::Resize { size: 1 }, Vec::new())
            .await
            .unwrap();
        let later = jobs
            .submit(&c, ClusterAction::Delete, Vec::new())
            .await
            .unwrap();

        // The plan was committed but the nodes were never written; the job
        // is back at the head of its queue with the lock still held.
        assert!(state.try_lock_cluster("1", &job.id, 1).unwrap());
        let task = stage_task(&job, TaskStatus::NotSubmitted);
        mark_running(&state, &job, &task, 0);

        assert_eq!(jobs.dispatch_ready().await.unwrap(), 1);
        assert_eq!(
            state.cluster_lock("1").unwrap().map(|l| l.job_id),
            Some(job.id.clone())
        );
        assert_eq!(jobs.queued("1").await, vec![later.id.clone()]);
        assert_eq!(jobs.balancer.queued().await, 1);
        assert_eq!(
            state.get_node(&task.node_id).unwrap().unwrap().status,
            NodeStatus::Pending
        );
        assert_eq!(
            state.get_cluster("1").unwrap().unwrap().status,
            ClusterStatus::Pending
        );

        // The later job keeps waiting behind it.
        assert_eq!(jobs.dispatch_ready().await.unwrap(), 0);
        assert_eq!(jobs.queued("1").await, vec![later.id]);
        assert_eq!(jobs.balancer.queued().await, 1);
    }

    #[tokio::test]
    async fn dispatch_pass_settles_jobs_left_running() {
        let (jobs, state) = scheduler();

        // Stage advanced past the last one, completion never happened.
        let c1 = cluster(&state, "1");
        let advanced = jobs.new_job(&c1, ClusterAction::Resize { size: 1 }, Vec::new()).unwrap();
        mark_running(&state, &advanced, &stage_task(&advanced, TaskStatus::Complete), 1);
        assert!(state.try_lock_cluster("1", &advanced.id, 1).unwrap());

        // Every task of the stage done, the advance itself lost.
        let c2 = cluster(&state, "2");
        let stalled = jobs.new_job(&c2, ClusterAction::Resize { size: 1 }, Vec::new()).unwrap();
        mark_running(&state, &stalled, &stage_task(&stalled, TaskStatus::Complete), 0);
        assert!(state.try_lock_cluster("2", &stalled.id, 1).unwrap());

        // A task out of retries whose job never failed.
        let c3 = cluster(&state, "3");
        let broken = jobs.new_job(&c3, ClusterAction::Resize { size: 1 }, Vec::new()).unwrap();
        mark_running(&state, &broken, &stage_task(&broken, TaskStatus::Failed), 0);
        assert!(state.try_lock_cluster("3", &broken.id, 1).unwrap());

        assert_eq!(jobs.dispatch_ready().await.unwrap(), 0);

        for (cluster_id, job) in [("1", &advanced), ("2", &stalled)] {
            assert_eq!(
                state.get_job(&job.id).unwrap().unwrap().status,
                JobStatus::Complete
            );
            let stored = state.get_cluster(cluster_id).unwrap().unwrap();
            assert_eq!(stored.status, ClusterStatus::Active);
            assert_eq!(stored.nodes, vec![node_id(cluster_id, 1)]);
            assert!(state.cluster_lock(cluster_id).unwrap().is_none());
        }
        assert_eq!(
            state.get_job(&broken.id).unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(
            state.get_cluster("3").unwrap().unwrap().status,
            ClusterStatus::Incomplete
        );
        assert!(state.cluster_lock("3").unwrap().is_none());
    }
}
