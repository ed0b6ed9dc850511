//! Cluster leases.
//!
//! A cluster created from a template with a non-zero `initial` lease
//! expires `initial` ms after creation. Extensions add at most `step` ms
//! each and never push the expiry past `created_at + max`. Zero `step` or
//! `max` leaves that side unbounded.

use provgrid_state::{Cluster, ClusterStatus, LeaseDuration, StateStore};

use crate::error::{SchedulerError, SchedulerResult};

/// Expiry of a cluster created at `created_at`, or `None` if it never expires.
pub fn initial_expiry(lease: &LeaseDuration, created_at: u64) -> Option<u64> {
    (lease.initial > 0).then(|| created_at.saturating_add(lease.initial))
}

/// New expiry after asking to extend `cluster`'s lease by `requested` ms.
pub fn extended_expiry(cluster: &Cluster, requested: u64) -> SchedulerResult<u64> {
    let Some(expire_at) = cluster.expire_at else {
        return Err(SchedulerError::Conflict(format!(
            "cluster {} has no lease to extend",
            cluster.id
        )));
    };
    if cluster.status == ClusterStatus::Terminated {
        return Err(SchedulerError::Conflict(format!(
            "cluster {} is terminated",
            cluster.id
        )));
    }
    if requested == 0 {
        return Err(SchedulerError::Validation(
            "lease extension must be positive".to_string(),
        ));
    }

    let lease = cluster.template.lease();
    let increment = if lease.step > 0 {
        requested.min(lease.step)
    } else {
        requested
    };
    let mut extended = expire_at.saturating_add(increment);
    if lease.max > 0 {
        extended = extended.min(cluster.created_at.saturating_add(lease.max));
    }
    Ok(extended.max(expire_at))
}

/// Live clusters past their expiry with no job running or queued.
pub fn expired_clusters(state: &StateStore, now: u64) -> SchedulerResult<Vec<Cluster>> {
    let mut expired = Vec::new();
    for cluster in state.list_clusters()? {
        if cluster.status == ClusterStatus::Terminated
            || cluster.expire_at.is_none_or(|at| at > now)
        {
            continue;
        }
        let idle = match &cluster.latest_job {
            None => true,
            Some(job_id) => state
                .get_job(job_id)?
                .is_none_or(|j| j.status.is_terminal()),
        };
        if idle {
            expired.push(cluster);
        }
    }
    Ok(expired)
}
