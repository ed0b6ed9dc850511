//! Cluster job notifications.
//!
//! The scheduler never calls a [`ClusterCallback`] itself. It pushes a
//! [`ClusterEvent`] into a bounded queue and a separate worker task drains
//! it, so a slow callback cannot stall scheduling.

use std::sync::Arc;

use async_trait::async_trait;
use provgrid_state::{ClusterId, Job, JobId, JobStatus, TenantId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEventKind {
    Start,
    Success,
    Failure,
}

/// A job lifecycle change handed to the callback worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub kind: ClusterEventKind,
    pub cluster_id: ClusterId,
    pub tenant: TenantId,
    pub job_id: JobId,
    pub action: String,
    pub status: JobStatus,
    pub failure: Option<String>,
    pub at: u64,
}

impl ClusterEvent {
    pub fn for_job(kind: ClusterEventKind, job: &Job, at: u64) -> Self {
        Self {
            kind,
            cluster_id: job.cluster_id.clone(),
            tenant: job.tenant.clone(),
            job_id: job.id.clone(),
            action: job.action.name().to_string(),
            status: job.status,
            failure: job.failure.clone(),
            at,
        }
    }
}

/// Receives job lifecycle events.
#[async_trait]
pub trait ClusterCallback: Send + Sync {
    async fn on_start(&self, event: &ClusterEvent);

    async fn on_success(&self, event: &ClusterEvent);

    /// Raised for failed and cancelled jobs.
    async fn on_failure(&self, event: &ClusterEvent);
}

/// Logs every event and does nothing else.
#[derive(Debug, Default, Clone)]
pub struct LoggingCallback;

#[async_trait]
impl ClusterCallback for LoggingCallback {
    async fn on_start(&self, event: &ClusterEvent) {
        info!(
            cluster_id = %event.cluster_id,
            job_id = %event.job_id,
            action = %event.action,
            "cluster job started"
        );
    }

    async fn on_success(&self, event: &ClusterEvent) {
        info!(
            cluster_id = %event.cluster_id,
            job_id = %event.job_id,
            action = %event.action,
            "cluster job succeeded"
        );
    }

    async fn on_failure(&self, event: &ClusterEvent) {
        warn!(
            cluster_id = %event.cluster_id,
            job_id = %event.job_id,
            action = %event.action,
            status = ?event.status,
            failure = event.failure.as_deref().unwrap_or(""),
            "cluster job did not succeed"
        );
    }
}

/// Sending half of the callback queue.
#[derive(Debug, Clone)]
pub struct CallbackDispatcher {
    tx: mpsc::Sender<ClusterEvent>,
}

impl CallbackDispatcher {
    /// Create a dispatcher with room for `depth` pending events.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<ClusterEvent>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event without waiting. A full queue drops the event.
    pub fn emit(&self, event: ClusterEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    cluster_id = %event.cluster_id,
                    job_id = %event.job_id,
                    kind = ?event.kind,
                    "callback queue full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("callback worker stopped, event dropped");
            }
        }
    }
}

/// Deliver one event to the matching callback method.
pub async fn deliver(callback: &dyn ClusterCallback, event: &ClusterEvent) {
    match event.kind {
        ClusterEventKind::Start => callback.on_start(event).await,
        ClusterEventKind::Success => callback.on_success(event).await,
        ClusterEventKind::Failure => callback.on_failure(event).await,
    }
}

/// Drain the callback queue until shutdown or until every sender is gone.
pub async fn run_callback_worker(
    mut rx: mpsc::Receiver<ClusterEvent>,
    callback: Arc<dyn ClusterCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                deliver(callback.as_ref(), &event).await;
            }
            _ = shutdown.changed() => {
                debug!("callback worker shutting down");
                break;
            }
        }
    }
}
