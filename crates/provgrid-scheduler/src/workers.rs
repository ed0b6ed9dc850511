//! Worker registry and task balancing.
//!
//! Runnable tasks wait in one FIFO queue. Each balancing pass walks the
//! queue in order and places every task it can:
//!
//! - the worker must serve the task's tenant, be alive and have a free slot;
//! - among those, the least-loaded worker wins, and ties rotate through a
//!   shared counter so equal workers take turns;
//! - a tenant already at its `workers` quota keeps its tasks queued.
//!
//! Tasks that cannot be placed stay queued for the next pass. Workers that
//! stop heartbeating are reaped and their in-flight attempts fail.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use provgrid_core::epoch_millis;
use provgrid_state::{
    ClusterTask, JobStatus, StateStore, TaskId, TaskStatus, TenantId, Worker, WorkerId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{TaskExecutor, TaskReport};

/// Registration sent by a provisioner worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: WorkerId,
    pub endpoint: String,
    pub capacity: u32,
    #[serde(default)]
    pub tenants: BTreeSet<TenantId>,
}

/// Rotating tie-break among equally loaded workers.
#[derive(Debug, Default)]
pub struct RotatingSelector {
    counter: AtomicUsize,
}

impl RotatingSelector {
    /// Next index below `count`, or `None` when `count` is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }
}

/// Places runnable tasks onto live workers.
#[derive(Clone)]
pub struct WorkerBalancer {
    state: StateStore,
    runnable: Arc<Mutex<VecDeque<TaskId>>>,
    selector: Arc<RotatingSelector>,
    notify: Arc<Notify>,
    heartbeat_timeout: Duration,
}

impl WorkerBalancer {
    pub fn new(state: StateStore, heartbeat_timeout: Duration) -> Self {
        Self {
            state,
            runnable: Arc::new(Mutex::new(VecDeque::new())),
            selector: Arc::new(RotatingSelector::default()),
            notify: Arc::new(Notify::new()),
            heartbeat_timeout,
        }
    }

    /// Wakes the balancing loop when tasks are queued or slots free up.
    pub fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Register a worker, or refresh an existing registration.
    ///
    /// Re-registering keeps the worker's in-flight tasks.
    pub fn register(&self, registration: WorkerRegistration) -> SchedulerResult<Worker> {
        if registration.id.is_empty() {
            return Err(SchedulerError::Validation("worker id is empty".to_string()));
        }
        if registration.capacity == 0 {
            return Err(SchedulerError::Validation(format!(
                "worker {} declares no capacity",
                registration.id
            )));
        }
        let now = epoch_millis();
        let mut worker = Worker::new(
            &registration.id,
            &registration.endpoint,
            registration.capacity,
            now,
        );
        worker.tenants = registration.tenants;
        if let Some(existing) = self.state.get_worker(&worker.id)? {
            worker.in_flight = existing.in_flight;
            worker.registered_at = existing.registered_at;
        }
        self.state.put_worker(&worker)?;
        info!(
            worker_id = %worker.id,
            endpoint = %worker.endpoint,
            capacity = worker.capacity,
            "worker registered"
        );
        self.notify.notify_one();
        Ok(worker)
    }

    pub fn heartbeat(&self, worker_id: &str) -> SchedulerResult<Worker> {
        let now = epoch_millis();
        let worker = self
            .state
            .update_worker(worker_id, |w| {
                w.last_heartbeat = now;
                true
            })?
            .ok_or_else(|| SchedulerError::not_found("worker", worker_id))?;
        debug!(%worker_id, load = worker.load(), "worker heartbeat");
        Ok(worker)
    }

    pub fn is_alive(&self, worker: &Worker, now: u64) -> bool {
        now.saturating_sub(worker.last_heartbeat) <= self.heartbeat_timeout.as_millis() as u64
    }

    /// Queue tasks for placement, after anything already queued.
    pub async fn enqueue<I>(&self, task_ids: I)
    where
        I: IntoIterator<Item = TaskId>,
    {
        let mut runnable = self.runnable.lock().await;
        let before = runnable.len();
        for id in task_ids {
            if !runnable.contains(&id) {
                runnable.push_back(id);
            }
        }
        if runnable.len() > before {
            self.notify.notify_one();
        }
    }

    pub async fn queued(&self) -> usize {
        self.runnable.lock().await.len()
    }

    /// One placement pass over the runnable queue. Returns tasks dispatched.
    pub async fn balance(&self, executor: &TaskExecutor) -> SchedulerResult<usize> {
        let mut runnable = self.runnable.lock().await;
        if runnable.is_empty() {
            return Ok(0);
        }

        let now = epoch_millis();
        let mut workers: Vec<Worker> = self
            .state
            .list_workers()?
            .into_iter()
            .filter(|w| self.is_alive(w, now))
            .collect();
        let mut in_flight = self.tenant_load()?;
        let mut quotas: BTreeMap<TenantId, Option<u32>> = BTreeMap::new();

        let mut kept = VecDeque::with_capacity(runnable.len());
        let mut dispatched = 0;
        while let Some(task_id) = runnable.pop_front() {
            let Some(task) = self.state.get_task(&task_id)? else {
                continue;
            };
            if task.status != TaskStatus::NotSubmitted || !self.job_running(&task)? {
                debug!(%task_id, status = ?task.status, "task no longer runnable");
                continue;
            }
            if task.not_before > now {
                kept.push_back(task_id);
                continue;
            }

            let quota = match quotas.get(&task.tenant) {
                Some(q) => *q,
                None => {
                    let q = self.state.get_tenant(&task.tenant)?.map(|t| t.workers);
                    quotas.insert(task.tenant.clone(), q);
                    q
                }
            };
            let load = in_flight.get(&task.tenant).copied().unwrap_or(0);
            if quota.is_some_and(|q| load >= q) {
                debug!(%task_id, tenant = %task.tenant, load, "tenant at quota");
                kept.push_back(task_id);
                continue;
            }

            let Some(slot) = self.select(&workers, &task.tenant) else {
                kept.push_back(task_id);
                continue;
            };
            match self.assign(&task, &workers[slot].id, now)? {
                Some((task, worker)) => {
                    executor.dispatch(&task, &worker);
                    *in_flight.entry(task.tenant.clone()).or_default() += 1;
                    workers[slot] = worker;
                    dispatched += 1;
                }
                None => kept.push_back(task_id),
            }
        }
        *runnable = kept;

        if dispatched > 0 {
            debug!(dispatched, queued = runnable.len(), "balance pass");
        }
        Ok(dispatched)
    }

    /// Least-loaded eligible worker, rotating among ties.
    fn select(&self, workers: &[Worker], tenant: &str) -> Option<usize> {
        let eligible: Vec<usize> = (0..workers.len())
            .filter(|&i| workers[i].serves(tenant) && workers[i].free_slots() > 0)
            .collect();
        let least = eligible.iter().map(|&i| workers[i].load()).min()?;
        let tied: Vec<usize> = eligible
            .into_iter()
            .filter(|&i| workers[i].load() == least)
            .collect();
        self.selector.next(tied.len()).map(|n| tied[n])
    }

    /// Reserve a slot on `worker_id`, then move the task to `InProgress`.
    fn assign(
        &self,
        task: &ClusterTask,
        worker_id: &str,
        now: u64,
    ) -> SchedulerResult<Option<(ClusterTask, Worker)>> {
        let Some(worker) = self.state.update_worker(worker_id, |w| {
            if w.free_slots() == 0 {
                return false;
            }
            w.in_flight.insert(task.id.clone())
        })?
        else {
            return Ok(None);
        };

        let assigned = self.state.update_task(&task.id, |t| {
            if t.status != TaskStatus::NotSubmitted {
                return false;
            }
            t.status = TaskStatus::InProgress;
            t.attempts += 1;
            t.worker = Some(worker_id.to_string());
            t.submitted_at = Some(now);
            t.updated_at = now;
            true
        })?;

        match assigned {
            Some(task) => {
                debug!(
                    task_id = %task.id,
                    %worker_id,
                    attempt = task.attempts,
                    "task assigned"
                );
                Ok(Some((task, worker)))
            }
            None => {
                self.state
                    .update_worker(worker_id, |w| w.in_flight.remove(&task.id))?;
                Ok(None)
            }
        }
    }

    fn job_running(&self, task: &ClusterTask) -> SchedulerResult<bool> {
        Ok(self
            .state
            .get_job(&task.job_id)?
            .is_some_and(|j| j.status == JobStatus::Running))
    }

    /// In-flight task count per tenant.
    fn tenant_load(&self) -> SchedulerResult<BTreeMap<TenantId, u32>> {
        Ok(self.state.in_progress_by_tenant()?)
    }

    /// Remove workers silent past the heartbeat timeout.
    ///
    /// Returns a failure report for every attempt they had in flight.
    pub fn reap(&self, now: u64) -> SchedulerResult<Vec<TaskReport>> {
        let mut reports = Vec::new();
        for worker in self.state.list_workers()? {
            if self.is_alive(&worker, now) {
                continue;
            }
            warn!(
                worker_id = %worker.id,
                last_heartbeat = worker.last_heartbeat,
                in_flight = worker.in_flight.len(),
                "worker lost"
            );
            for task_id in &worker.in_flight {
                let Some(task) = self.state.get_task(task_id)? else {
                    continue;
                };
                if task.status == TaskStatus::InProgress
                    && task.worker.as_deref() == Some(worker.id.as_str())
                {
                    reports.push(TaskReport::failure(
                        &task.id,
                        task.attempts,
                        format!("worker {} lost", worker.id),
                    ));
                }
            }
            self.state.delete_worker(&worker.id)?;
        }
        Ok(reports)
    }
}
