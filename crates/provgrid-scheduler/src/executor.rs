//! Task dispatch, attempt bookkeeping and retries.
//!
//! A dispatch is fire-and-forget: the provisioner accepts or rejects the
//! task right away and reports the terminal outcome later through
//! [`TaskExecutor::apply_report`]. A rejection is fed back as a failed
//! report on the same attempt.
//!
//! Every attempt carries the task's `attempts` counter. A report is applied
//! only while the task is `InProgress` on that same attempt, so late or
//! duplicated reports are dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provgrid_core::{ProvgridConfig, epoch_millis};
use provgrid_state::{
    ClusterId, ClusterTask, JobStatus, NodeId, NodeLayout, ProvisionerAction, ServiceAction,
    StateStore, TaskId, TaskStatus, TenantId, Worker,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;

/// Failure to hand a task to a provisioner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionerError {
    /// The provisioner refused the task.
    #[error("task rejected: {0}")]
    Rejected(String),

    #[error("provisioner unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected provisioner response: {0}")]
    Protocol(String),
}

/// Payload sent to a provisioner for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDispatch {
    pub task_id: TaskId,
    pub attempt: u32,
    pub tenant: TenantId,
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub action: ProvisionerAction,
    pub service: Option<String>,
    pub service_action: Option<ServiceAction>,
    pub node: NodeLayout,
}

impl TaskDispatch {
    pub fn from_task(task: &ClusterTask) -> Self {
        Self {
            task_id: task.id.clone(),
            attempt: task.attempts,
            tenant: task.tenant.clone(),
            cluster_id: task.cluster_id.clone(),
            node_id: task.node_id.clone(),
            action: task.action,
            service: task.service.clone(),
            service_action: task.service_action.clone(),
            node: task.node.clone(),
        }
    }
}

/// Transport to the provisioner workers.
#[async_trait]
pub trait ProvisionerClient: Send + Sync {
    /// Hand `dispatch` to `worker`. `Ok` means the task was accepted.
    async fn submit(
        &self,
        worker: &Worker,
        dispatch: &TaskDispatch,
    ) -> Result<(), ProvisionerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure { error: String },
}

/// Terminal outcome of one attempt, as reported by a provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: TaskId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn failure(task_id: &str, attempt: u32, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            attempt,
            outcome: TaskOutcome::Failure {
                error: error.into(),
            },
        }
    }
}

/// What applying a report did to its task.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Unknown task, or a stale or duplicate attempt.
    Ignored,
    Completed(ClusterTask),
    /// Back to `NotSubmitted`, dispatchable after `not_before`.
    Retrying(ClusterTask),
    /// Retry budget exhausted.
    Failed(ClusterTask),
    /// The job stopped running while the attempt was in flight.
    Discarded(ClusterTask),
}

/// Exponential backoff with a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProvgridConfig) -> SchedulerResult<Self> {
        Ok(Self {
            max_retries: config.scheduler.max_retries,
            base_delay: config.scheduler.retry_base_delay()?,
            max_delay: config.scheduler.retry_max_delay()?,
        })
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Sends tasks to provisioners and applies their reports.
#[derive(Clone)]
pub struct TaskExecutor {
    state: StateStore,
    provisioner: Arc<dyn ProvisionerClient>,
    policy: RetryPolicy,
    task_timeout: Duration,
    /// Rejections are routed back as failure reports.
    reports: mpsc::UnboundedSender<TaskReport>,
}

impl TaskExecutor {
    pub fn new(
        state: StateStore,
        provisioner: Arc<dyn ProvisionerClient>,
        policy: RetryPolicy,
        task_timeout: Duration,
        reports: mpsc::UnboundedSender<TaskReport>,
    ) -> Self {
        Self {
            state,
            provisioner,
            policy,
            task_timeout,
            reports,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submit `task` to `worker` in the background.
    ///
    /// The task must already be `InProgress` on `worker`.
    pub fn dispatch(&self, task: &ClusterTask, worker: &Worker) {
        let dispatch = TaskDispatch::from_task(task);
        let worker = worker.clone();
        let provisioner = self.provisioner.clone();
        let reports = self.reports.clone();

        tokio::spawn(async move {
            match provisioner.submit(&worker, &dispatch).await {
                Ok(()) => {
                    debug!(
                        task_id = %dispatch.task_id,
                        attempt = dispatch.attempt,
                        worker_id = %worker.id,
                        "task accepted"
                    );
                }
                Err(e) => {
                    warn!(
                        task_id = %dispatch.task_id,
                        attempt = dispatch.attempt,
                        worker_id = %worker.id,
                        error = %e,
                        "task dispatch failed"
                    );
                    let report =
                        TaskReport::failure(&dispatch.task_id, dispatch.attempt, e.to_string());
                    if reports.send(report).is_err() {
                        debug!(task_id = %dispatch.task_id, "report channel closed");
                    }
                }
            }
        });
    }

    /// Apply a reported outcome to its task and free the worker slot.
    pub fn apply_report(&self, report: &TaskReport) -> SchedulerResult<AttemptOutcome> {
        let Some(task) = self.state.get_task(&report.task_id)? else {
            debug!(task_id = %report.task_id, "report for unknown task");
            return Ok(AttemptOutcome::Ignored);
        };
        if task.status != TaskStatus::InProgress || task.attempts != report.attempt {
            debug!(
                task_id = %task.id,
                attempt = report.attempt,
                current = task.attempts,
                status = ?task.status,
                "stale report ignored"
            );
            return Ok(AttemptOutcome::Ignored);
        }

        let job_status = self.state.get_job(&task.job_id)?.map(|j| j.status);
        let now = epoch_millis();
        let policy = self.policy;

        let mut kind = OutcomeKind::Ignored;
        let updated = self.state.update_task(&task.id, |t| {
            if t.status != TaskStatus::InProgress || t.attempts != report.attempt {
                return false;
            }
            kind = match (&report.outcome, job_status) {
                (_, Some(JobStatus::Cancelled)) => {
                    t.status = TaskStatus::Dropped;
                    OutcomeKind::Discarded
                }
                (TaskOutcome::Success, Some(JobStatus::Running)) => {
                    t.status = TaskStatus::Complete;
                    OutcomeKind::Completed
                }
                (TaskOutcome::Success, _) => {
                    t.status = TaskStatus::Complete;
                    OutcomeKind::Discarded
                }
                (TaskOutcome::Failure { error }, status) => {
                    t.last_error = Some(error.clone());
                    if status != Some(JobStatus::Running) {
                        t.status = TaskStatus::Failed;
                        OutcomeKind::Discarded
                    } else if t.retries() < policy.max_retries {
                        t.status = TaskStatus::NotSubmitted;
                        t.worker = None;
                        let delay = policy.delay_for(t.attempts);
                        t.not_before = now + delay.as_millis() as u64;
                        OutcomeKind::Retrying
                    } else {
                        t.status = TaskStatus::Failed;
                        OutcomeKind::Failed
                    }
                }
            };
            t.updated_at = now;
            true
        })?;

        if let Some(worker_id) = &task.worker {
            self.release_slot(worker_id, &task.id)?;
        }

        let Some(updated) = updated else {
            return Ok(AttemptOutcome::Ignored);
        };
        let outcome = match kind {
            OutcomeKind::Ignored => AttemptOutcome::Ignored,
            OutcomeKind::Completed => AttemptOutcome::Completed(updated),
            OutcomeKind::Retrying => self.settle_retry(updated)?,
            OutcomeKind::Failed => AttemptOutcome::Failed(updated),
            OutcomeKind::Discarded => AttemptOutcome::Discarded(updated),
        };
        match &outcome {
            AttemptOutcome::Completed(t) => {
                debug!(task_id = %t.id, attempt = t.attempts, "task complete");
            }
            AttemptOutcome::Retrying(t) => info!(
                task_id = %t.id,
                attempt = t.attempts,
                not_before = t.not_before,
                error = t.last_error.as_deref().unwrap_or(""),
                "task failed, retry scheduled"
            ),
            AttemptOutcome::Failed(t) => warn!(
                task_id = %t.id,
                attempts = t.attempts,
                error = t.last_error.as_deref().unwrap_or(""),
                "task failed permanently"
            ),
            AttemptOutcome::Discarded(t) => debug!(
                task_id = %t.id,
                status = ?t.status,
                "report recorded for stopped job"
            ),
            AttemptOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Confirm a scheduled retry against the job as it is now.
    ///
    /// The job is read before the task CAS, so it may have failed or been
    /// cancelled in between, with its drop pass running while this task was
    /// still `InProgress`. Such a retry is dropped here instead.
    fn settle_retry(&self, task: ClusterTask) -> SchedulerResult<AttemptOutcome> {
        let running = self
            .state
            .get_job(&task.job_id)?
            .is_some_and(|j| j.status == JobStatus::Running);
        if running {
            return Ok(AttemptOutcome::Retrying(task));
        }

        let attempt = task.attempts;
        let now = epoch_millis();
        let dropped = self.state.update_task(&task.id, |t| {
            if t.status != TaskStatus::NotSubmitted || t.attempts != attempt {
                return false;
            }
            t.status = TaskStatus::Dropped;
            t.updated_at = now;
            true
        })?;
        let task = match dropped {
            Some(task) => task,
            None => self.state.get_task(&task.id)?.unwrap_or(task),
        };
        Ok(AttemptOutcome::Discarded(task))
    }

    /// In-flight attempts older than the task timeout, as failure reports.
    pub fn timed_out(&self, now: u64) -> SchedulerResult<Vec<TaskReport>> {
        let timeout = self.task_timeout.as_millis() as u64;
        let reports = self
            .state
            .list_in_progress_tasks()?
            .into_iter()
            .filter(|t| {
                t.submitted_at
                    .is_some_and(|at| now.saturating_sub(at) > timeout)
            })
            .map(|t| {
                warn!(task_id = %t.id, attempt = t.attempts, "task timed out");
                TaskReport::failure(&t.id, t.attempts, "timed out waiting for provisioner")
            })
            .collect();
        Ok(reports)
    }

    fn release_slot(&self, worker_id: &str, task_id: &str) -> SchedulerResult<()> {
        self.state
            .update_worker(worker_id, |w| w.in_flight.remove(task_id))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum OutcomeKind {
    Ignored,
    Completed,
    Retrying,
    Failed,
    Discarded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::{ClusterAction, Job};

    struct Accepting;

    #[async_trait]
    impl ProvisionerClient for Accepting {
        async fn submit(
            &self,
            _worker: &Worker,
            _dispatch: &TaskDispatch,
        ) -> Result<(), ProvisionerError> {
            Ok(())
        }
    }

    fn executor(max_retries: u32) -> (TaskExecutor, StateStore) {
        let state = StateStore::open_in_memory().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let executor = TaskExecutor::new(
            state.clone(),
            Arc::new(Accepting),
            policy,
            Duration::from_secs(60),
            tx,
        );
        (executor, state)
    }

    fn seed(state: &StateStore, job_status: JobStatus, attempts: u32) -> ClusterTask {
        state
            .put_job(&Job {
                id: "1-0000000001".to_string(),
                cluster_id: "1".to_string(),
                tenant: "acme".to_string(),
                action: ClusterAction::Create,
                status: job_status,
                target: Vec::new(),
                stages: vec![vec!["1-0000000001-00000".to_string()]],
                planned: true,
                current_stage: 0,
                created_at: 1,
                updated_at: 1,
                failure: None,
            })
            .unwrap();
        let mut worker = Worker::new("w1", "http://w1", 2, 1);
        worker.in_flight.insert("1-0000000001-00000".to_string());
        state.put_worker(&worker).unwrap();
        let task = ClusterTask {
            id: "1-0000000001-00000".to_string(),
            job_id: "1-0000000001".to_string(),
            cluster_id: "1".to_string(),
            tenant: "acme".to_string(),
            node_id: "1-n1".to_string(),
            service: None,
            action: ProvisionerAction::Create,
            service_action: None,
            node: NodeLayout::default(),
            stage: 0,
            status: TaskStatus::InProgress,
            attempts,
            worker: Some("w1".to_string()),
            created_at: 1,
            submitted_at: Some(1),
            updated_at: 1,
            not_before: 0,
            last_error: None,
        };
        state.put_task(&task).unwrap();
        task
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn success_completes_and_frees_slot() {
        let (executor, state) = executor(3);
        let task = seed(&state, JobStatus::Running, 1);

        let outcome = executor
            .apply_report(&TaskReport {
                task_id: task.id.clone(),
                attempt: 1,
                outcome: TaskOutcome::Success,
            })
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Completed(ref t) if t.status == TaskStatus::Complete));
        assert!(state.get_worker("w1").unwrap().unwrap().in_flight.is_empty());
    }

    #[test]
    fn failure_retries_until_budget_is_spent() {
        let (executor, state) = executor(1);
        let task = seed(&state, JobStatus::Running, 1);

        let outcome = executor
            .apply_report(&TaskReport::failure(&task.id, 1, "boom"))
            .unwrap();
        let AttemptOutcome::Retrying(retrying) = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(retrying.status, TaskStatus::NotSubmitted);
        assert!(retrying.not_before > 0);
        assert_eq!(retrying.worker, None);

        state
            .update_task(&task.id, |t| {
                t.status = TaskStatus::InProgress;
                t.attempts = 2;
                true
            })
            .unwrap();
        let outcome = executor
            .apply_report(&TaskReport::failure(&task.id, 2, "boom again"))
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Failed(ref t) if t.status == TaskStatus::Failed));
    }

    #[test]
    fn retry_is_dropped_when_the_job_stopped_meanwhile() {
        let (executor, state) = executor(3);
        let task = seed(&state, JobStatus::Running, 1);

        // The retry CAS landed after the job failed and dropped its
        // unsubmitted tasks.
        let retried = state
            .update_task(&task.id, |t| {
                t.status = TaskStatus::NotSubmitted;
                t.worker = None;
                true
            })
            .unwrap()
            .unwrap();
        state
            .update_job(&task.job_id, |j| {
                j.status = JobStatus::Failed;
                true
            })
            .unwrap();

        let outcome = executor.settle_retry(retried).unwrap();
        assert!(matches!(outcome, AttemptOutcome::Discarded(ref t) if t.status == TaskStatus::Dropped));
        assert_eq!(
            state.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Dropped
        );
    }

    #[test]
    fn retry_stands_while_the_job_runs() {
        let (executor, state) = executor(3);
        let task = seed(&state, JobStatus::Running, 1);
        let retried = state
            .update_task(&task.id, |t| {
                t.status = TaskStatus::NotSubmitted;
                true
            })
            .unwrap()
            .unwrap();

        let outcome = executor.settle_retry(retried).unwrap();
        assert!(matches!(outcome, AttemptOutcome::Retrying(ref t) if t.status == TaskStatus::NotSubmitted));
    }

    #[test]
    fn stale_attempts_are_ignored() {
        let (executor, state) = executor(3);
        let task = seed(&state, JobStatus::Running, 2);

        let outcome = executor
            .apply_report(&TaskReport {
                task_id: task.id.clone(),
                attempt: 1,
                outcome: TaskOutcome::Success,
            })
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Ignored);
        assert_eq!(
            state.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::InProgress
        );
        assert_eq!(
            executor
                .apply_report(&TaskReport::failure("missing", 1, "x"))
                .unwrap(),
            AttemptOutcome::Ignored
        );
    }

    #[test]
    fn cancelled_job_drops_reported_task() {
        let (executor, state) = executor(3);
        let task = seed(&state, JobStatus::Cancelled, 1);

        let outcome = executor
            .apply_report(&TaskReport {
                task_id: task.id.clone(),
                attempt: 1,
                outcome: TaskOutcome::Success,
            })
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::Discarded(ref t) if t.status == TaskStatus::Dropped));
    }

    #[test]
    fn old_attempts_time_out() {
        let (executor, state) = executor(3);
        let task = seed(&state, JobStatus::Running, 1);

        assert!(executor.timed_out(30_000).unwrap().is_empty());
        let reports = executor.timed_out(120_000).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task_id, task.id);
        assert_eq!(reports[0].attempt, 1);
    }

    #[test]
    fn reports_use_camel_case() {
        let report: TaskReport = serde_json::from_str(
            r#"{"taskId":"t","attempt":2,"outcome":{"status":"failure","error":"disk full"}}"#,
        )
        .unwrap();
        assert_eq!(report, TaskReport::failure("t", 2, "disk full"));
    }
}
