//! The orchestrator: inbound operations and the background loops.
//!
//! Inbound calls only validate, persist and enqueue. All progress happens
//! in the loops started by [`Orchestrator::run`]:
//!
//! | loop            | wakes on                      | does                               |
//! |-----------------|-------------------------------|------------------------------------|
//! | job dispatch    | job notify, dispatch interval | starts head jobs of free clusters  |
//! | balance         | task notify, dispatch interval| places runnable tasks on workers   |
//! | reports         | report channel                | applies rejections as failures     |
//! | timeout sweep   | sweep interval                | fails attempts past `task_timeout` |
//! | worker reaper   | reap interval                 | drops silent workers               |
//! | lease sweep     | lease interval                | queues delete jobs for expired leases |
//! | callbacks       | callback queue                | delivers job events                |

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use provgrid_core::{ProvgridConfig, epoch_millis};
use provgrid_solver::{SolveRequest, Solver};
use provgrid_state::{
    Cluster, ClusterAction, ClusterStatus, ClusterTask, Job, JobId, Node, StateStore, TaskStatus,
    Worker, node_id,
};
use provgrid_template::{TemplateError, TemplateResolver, fingerprint};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::callback::{
    CallbackDispatcher, ClusterCallback, ClusterEvent, run_callback_worker,
};
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{
    AttemptOutcome, ProvisionerClient, RetryPolicy, TaskExecutor, TaskReport,
};
use crate::jobs::{JobScheduler, live_nodes, plan_graph, target_layout};
use crate::lease::{expired_clusters, extended_expiry, initial_expiry};
use crate::workers::{WorkerBalancer, WorkerRegistration};

/// Request to create a cluster from a stored template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    pub name: String,
    /// Name of the cluster template to resolve.
    pub template: String,
    pub size: u32,
    /// Services to place; the template defaults when absent.
    #[serde(default)]
    pub services: Option<BTreeSet<String>>,
    #[serde(default)]
    pub hardwaretype: Option<String>,
    #[serde(default)]
    pub imagetype: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Config overrides applied on top of the template body.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// Task counts of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: usize,
    pub not_submitted: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl JobProgress {
    fn from_tasks(tasks: &[ClusterTask]) -> Self {
        let mut progress = JobProgress {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::NotSubmitted => progress.not_submitted += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Complete => progress.complete += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Dropped => progress.dropped += 1,
            }
        }
        progress
    }
}

/// A cluster with its nodes and latest job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatusView {
    pub cluster: Cluster,
    pub nodes: Vec<Node>,
    pub latest_job: Option<Job>,
    pub progress: Option<JobProgress>,
    /// Jobs waiting behind the running one.
    pub queued: Vec<JobId>,
}

#[derive(Debug, Clone, Copy)]
struct LoopIntervals {
    dispatch: Duration,
    timeout_sweep: Duration,
    reap: Duration,
    lease_sweep: Duration,
}

/// Composition root of the control plane.
#[derive(Clone)]
pub struct Orchestrator {
    state: StateStore,
    resolver: TemplateResolver,
    jobs: JobScheduler,
    balancer: WorkerBalancer,
    executor: TaskExecutor,
    callback: Arc<dyn ClusterCallback>,
    callback_rx: Arc<Mutex<Option<mpsc::Receiver<ClusterEvent>>>>,
    reports_rx: Arc<Mutex<mpsc::UnboundedReceiver<TaskReport>>>,
    intervals: LoopIntervals,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        config: &ProvgridConfig,
        provisioner: Arc<dyn ProvisionerClient>,
        callback: Arc<dyn ClusterCallback>,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let (callbacks, callback_rx) =
            CallbackDispatcher::new(config.scheduler.callback_queue_depth);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let balancer = WorkerBalancer::new(state.clone(), config.workers.heartbeat_timeout()?);
        let executor = TaskExecutor::new(
            state.clone(),
            provisioner,
            RetryPolicy::from_config(config)?,
            config.scheduler.task_timeout()?,
            reports_tx,
        );
        let jobs = JobScheduler::new(state.clone(), balancer.clone(), callbacks);

        Ok(Self {
            state,
            resolver: TemplateResolver::new(config.template.mandatory_order.clone()),
            jobs,
            balancer,
            executor,
            callback,
            callback_rx: Arc::new(Mutex::new(Some(callback_rx))),
            reports_rx: Arc::new(Mutex::new(reports_rx)),
            intervals: LoopIntervals {
                dispatch: config.scheduler.dispatch_interval()?,
                timeout_sweep: config.scheduler.timeout_sweep_interval()?,
                reap: config.workers.reap_interval()?,
                lease_sweep: config.lease.sweep_interval()?,
            },
        })
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    // ── Clusters ──────────────────────────────────────────────────

    /// Resolve, solve and plan a new cluster, then queue its create job.
    ///
    /// A request that fails validation leaves the store untouched, id
    /// counters included.
    pub async fn create_cluster(
        &self,
        tenant: &str,
        request: CreateClusterRequest,
    ) -> SchedulerResult<Cluster> {
        if tenant.is_empty() || request.name.is_empty() || request.template.is_empty() {
            return Err(SchedulerError::Validation(
                "tenant, cluster name and template are required".to_string(),
            ));
        }
        if request.size == 0 {
            return Err(SchedulerError::Validation(
                "cluster size must be at least 1".to_string(),
            ));
        }

        let mut body = self
            .state
            .get_cluster_template(tenant, &request.template)?
            .ok_or_else(|| TemplateError::MissingTemplate(request.template.clone()))?;
        body.cluster_defaults.config.extend(request.config);
        let template = self.resolver.resolve(&self.state, tenant, &body)?;

        let catalog = self.state.service_catalog(tenant)?;
        let mut target = Solver::new(&template, &catalog).solve(
            &[],
            &SolveRequest::Create {
                size: request.size,
                services: request.services,
                hardwaretype: request.hardwaretype,
                imagetype: request.imagetype,
                provider: request.provider,
            },
        )?;

        // Placeholder ids keep the node slots distinct while planning.
        for (seq, node) in (1..).zip(target.iter_mut()) {
            node.id = node_id("0", seq);
        }
        plan_graph(&catalog, &ClusterAction::Create, &[], &target)?;

        let cluster_id = self.state.next_id("cluster")?.to_string();
        for node in target.iter_mut() {
            let seq = self.state.next_id(&format!("node/{cluster_id}"))?;
            node.id = node_id(&cluster_id, seq);
        }

        let now = epoch_millis();
        let mut cluster = Cluster {
            id: cluster_id,
            tenant: tenant.to_string(),
            name: request.name,
            template_fingerprint: fingerprint(&template)?,
            expire_at: initial_expiry(&template.lease(), now),
            template,
            nodes: Vec::new(),
            services: BTreeSet::new(),
            status: ClusterStatus::Pending,
            created_at: now,
            latest_job: None,
        };
        self.state.put_cluster(&cluster)?;

        let job = self
            .jobs
            .submit(&cluster, ClusterAction::Create, target)
            .await?;
        cluster.latest_job = Some(job.id);

        info!(
            %tenant,
            cluster_id = %cluster.id,
            template = %cluster.template.name,
            fingerprint = %cluster.template_fingerprint,
            "cluster created"
        );
        Ok(cluster)
    }

    /// Queue a mutating operation on an existing cluster.
    ///
    /// When the cluster is idle the operation is solved and planned up front
    /// so that unsatisfiable requests fail here instead of in the job.
    pub async fn submit_cluster_operation(
        &self,
        cluster_id: &str,
        action: ClusterAction,
    ) -> SchedulerResult<Job> {
        let cluster = self.cluster(cluster_id)?;
        if cluster.status == ClusterStatus::Terminated {
            return Err(SchedulerError::Conflict(format!(
                "cluster {cluster_id} is terminated"
            )));
        }
        match &action {
            ClusterAction::Create => {
                return Err(SchedulerError::Validation(
                    "create is only valid for a new cluster".to_string(),
                ));
            }
            ClusterAction::AddServices { services } | ClusterAction::RemoveServices { services }
                if services.is_empty() =>
            {
                return Err(SchedulerError::Validation(
                    "no services given".to_string(),
                ));
            }
            ClusterAction::Resize { size: 0 } => {
                return Err(SchedulerError::Validation(
                    "cluster size must be at least 1".to_string(),
                ));
            }
            _ => {}
        }

        if self.is_idle(&cluster)? {
            let catalog = self.state.service_catalog(&cluster.tenant)?;
            let current = live_nodes(&self.state, cluster_id)?;
            let target = target_layout(&cluster, &catalog, &action, &current)?;
            plan_graph(&catalog, &action, &current, &target)?;
        }

        self.jobs.submit(&cluster, action, Vec::new()).await
    }

    fn is_idle(&self, cluster: &Cluster) -> SchedulerResult<bool> {
        Ok(match &cluster.latest_job {
            None => true,
            Some(job_id) => self
                .state
                .get_job(job_id)?
                .is_none_or(|j| j.status.is_terminal()),
        })
    }

    fn cluster(&self, cluster_id: &str) -> SchedulerResult<Cluster> {
        self.state
            .get_cluster(cluster_id)?
            .ok_or_else(|| SchedulerError::not_found("cluster", cluster_id))
    }

    pub async fn cluster_status(&self, cluster_id: &str) -> SchedulerResult<ClusterStatusView> {
        let cluster = self.cluster(cluster_id)?;
        let nodes = self.state.list_nodes_for_cluster(cluster_id)?;
        let latest_job = match &cluster.latest_job {
            Some(job_id) => self.state.get_job(job_id)?,
            None => None,
        };
        let progress = match &latest_job {
            Some(job) if job.planned => Some(JobProgress::from_tasks(
                &self.state.list_tasks_for_job(&job.id)?,
            )),
            _ => None,
        };
        Ok(ClusterStatusView {
            cluster,
            nodes,
            latest_job,
            progress,
            queued: self.jobs.queued(cluster_id).await,
        })
    }

    pub fn get_task(&self, task_id: &str) -> SchedulerResult<ClusterTask> {
        self.state
            .get_task(task_id)?
            .ok_or_else(|| SchedulerError::not_found("task", task_id))
    }

    pub fn get_job(&self, job_id: &str) -> SchedulerResult<Job> {
        self.state
            .get_job(job_id)?
            .ok_or_else(|| SchedulerError::not_found("job", job_id))
    }

    /// Cancel the cluster's running job, or its oldest queued one.
    pub async fn abort_job(&self, cluster_id: &str) -> SchedulerResult<Job> {
        self.cluster(cluster_id)?;
        let job = self.jobs.cancel(cluster_id).await?;
        self.balancer.notify().notify_one();
        Ok(job)
    }

    /// Extend a cluster's lease by up to `duration_ms`.
    pub fn extend_lease(&self, cluster_id: &str, duration_ms: u64) -> SchedulerResult<Cluster> {
        let cluster = self.cluster(cluster_id)?;
        let expire_at = extended_expiry(&cluster, duration_ms)?;
        let previous = cluster.expire_at;
        let updated = self
            .state
            .update_cluster(cluster_id, |c| {
                if c.expire_at != previous {
                    return false;
                }
                c.expire_at = Some(expire_at);
                true
            })?
            .ok_or_else(|| {
                SchedulerError::Conflict(format!("lease of cluster {cluster_id} changed"))
            })?;
        info!(%cluster_id, expire_at, "lease extended");
        Ok(updated)
    }

    // ── Workers and reports ──────────────────────────────────────

    pub fn register_worker(&self, registration: WorkerRegistration) -> SchedulerResult<Worker> {
        self.balancer.register(registration)
    }

    pub fn heartbeat(&self, worker_id: &str) -> SchedulerResult<Worker> {
        self.balancer.heartbeat(worker_id)
    }

    /// Apply a provisioner's report and move the job along.
    pub async fn report_task(&self, report: &TaskReport) -> SchedulerResult<AttemptOutcome> {
        let outcome = self.executor.apply_report(report)?;
        self.settle(&outcome).await?;
        Ok(outcome)
    }

    async fn settle(&self, outcome: &AttemptOutcome) -> SchedulerResult<()> {
        match outcome {
            AttemptOutcome::Completed(task) => self.jobs.task_completed(task).await?,
            AttemptOutcome::Retrying(task) => self.balancer.enqueue([task.id.clone()]).await,
            AttemptOutcome::Failed(task) => self.jobs.task_failed(task)?,
            AttemptOutcome::Discarded(_) | AttemptOutcome::Ignored => return Ok(()),
        }
        // A worker slot was freed.
        self.balancer.notify().notify_one();
        Ok(())
    }

    async fn settle_all(&self, reports: Vec<TaskReport>) -> usize {
        let mut applied = 0;
        for report in reports {
            match self.report_task(&report).await {
                Ok(AttemptOutcome::Ignored) => {}
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(task_id = %report.task_id, error = %e, "failed to apply report");
                }
            }
        }
        applied
    }

    // ── Loop bodies ──────────────────────────────────────────────

    /// Apply queued dispatch rejections.
    pub async fn drain_reports(&self) -> usize {
        let mut reports = Vec::new();
        {
            let mut rx = self.reports_rx.lock().await;
            while let Ok(report) = rx.try_recv() {
                reports.push(report);
            }
        }
        self.settle_all(reports).await
    }

    /// Fail in-flight attempts that outlived the task timeout.
    pub async fn sweep_timeouts(&self) -> SchedulerResult<usize> {
        let reports = self.executor.timed_out(epoch_millis())?;
        Ok(self.settle_all(reports).await)
    }

    /// Drop silent workers and fail what they had in flight.
    pub async fn reap_workers(&self) -> SchedulerResult<usize> {
        let reports = self.balancer.reap(epoch_millis())?;
        Ok(self.settle_all(reports).await)
    }

    /// Queue delete jobs for expired clusters.
    pub async fn sweep_leases(&self) -> SchedulerResult<usize> {
        let expired = expired_clusters(&self.state, epoch_millis())?;
        let mut queued = 0;
        for cluster in expired {
            info!(cluster_id = %cluster.id, expire_at = ?cluster.expire_at, "lease expired");
            self.jobs
                .submit(&cluster, ClusterAction::Delete, Vec::new())
                .await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// One pass of job dispatch, report handling and balancing.
    pub async fn step(&self) -> SchedulerResult<usize> {
        self.jobs.dispatch_ready().await?;
        self.drain_reports().await;
        self.balancer.balance(&self.executor).await
    }

    /// Rebuild in-memory queues from the store. Call once before [`run`](Self::run).
    pub async fn recover(&self) -> SchedulerResult<()> {
        self.jobs.recover().await
    }

    /// Run every background loop until `shutdown` flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            dispatch_ms = self.intervals.dispatch.as_millis() as u64,
            "orchestrator started"
        );
        let mut handles = Vec::new();

        let this = self.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { this.dispatch_loop(rx).await }));

        let this = self.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { this.balance_loop(rx).await }));

        let this = self.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { this.report_loop(rx).await }));

        let this = self.clone();
        let rx = shutdown.clone();
        let every = self.intervals.timeout_sweep;
        handles.push(tokio::spawn(async move {
            periodic("timeout sweep", every, rx, || this.sweep_timeouts()).await
        }));

        let this = self.clone();
        let rx = shutdown.clone();
        let every = self.intervals.reap;
        handles.push(tokio::spawn(async move {
            periodic("worker reaper", every, rx, || this.reap_workers()).await
        }));

        let this = self.clone();
        let rx = shutdown.clone();
        let every = self.intervals.lease_sweep;
        handles.push(tokio::spawn(async move {
            periodic("lease sweep", every, rx, || this.sweep_leases()).await
        }));

        if let Some(callback_rx) = self.callback_rx.lock().await.take() {
            let callback = self.callback.clone();
            let rx = shutdown.clone();
            handles.push(tokio::spawn(run_callback_worker(callback_rx, callback, rx)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "orchestrator loop panicked");
            }
        }
        info!("orchestrator stopped");
    }

    async fn dispatch_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let notify = self.jobs.notify();
        let mut tick = tokio::time::interval(self.intervals.dispatch);
        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.jobs.dispatch_ready().await {
                Ok(started) if started > 0 => debug!(started, "jobs started"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "job dispatch pass failed"),
            }
        }
        debug!("job dispatch loop stopped");
    }

    async fn balance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let notify = self.balancer.notify();
        let mut tick = tokio::time::interval(self.intervals.dispatch);
        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.balancer.balance(&self.executor).await {
                warn!(error = %e, "balance pass failed");
            }
        }
        debug!("balance loop stopped");
    }

    async fn report_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let report = {
                let mut rx = self.reports_rx.lock().await;
                tokio::select! {
                    report = rx.recv() => report,
                    _ = shutdown.changed() => None,
                }
            };
            let Some(report) = report else { break };
            self.settle_all(vec![report]).await;
        }
        debug!("report loop stopped");
    }
}

/// Run `pass` every `every` until shutdown, logging failures.
async fn periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SchedulerResult<usize>>,
{
    let mut tick = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match pass().await {
                    Ok(n) if n > 0 => info!(loop_name = name, count = n, "pass applied"),
                    Ok(_) => {}
                    Err(e) => warn!(loop_name = name, error = %e, "pass failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(loop_name = name, "loop stopped");
}
