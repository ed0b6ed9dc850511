//! The daemon's pieces against a real socket and an on-disk catalog.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use provd::{Catalog, HttpProvisioner};
use provgrid_core::ProvgridConfig;
use provgrid_scheduler::{
    CreateClusterRequest, LoggingCallback, Orchestrator, ProvisionerClient, ProvisionerError,
    TaskDispatch, TaskOutcome, TaskReport,
};
use provgrid_state::{
    ClusterStatus, JobStatus, NodeLayout, ProvisionerAction, StateStore, Worker,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Reads one HTTP/1 request and returns its body.
async fn read_request(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    assert!(headers.starts_with("post /v1/tasks "), "{headers}");
    let length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before body");
        buf.extend_from_slice(&chunk[..n]);
    }
    buf[header_end..header_end + length].to_vec()
}

/// A worker agent that answers every dispatch with `status` and forwards the
/// decoded dispatch.
async fn spawn_agent(
    status: &'static str,
    reply: &'static str,
) -> (String, mpsc::UnboundedReceiver<TaskDispatch>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let body = read_request(&mut stream).await;
                let dispatch: TaskDispatch = serde_json::from_slice(&body).unwrap();
                let _ = tx.send(dispatch);
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                    reply.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            });
        }
    });
    (endpoint, rx)
}

fn dispatch() -> TaskDispatch {
    TaskDispatch {
        task_id: "1-0000000001-00000".to_string(),
        attempt: 1,
        tenant: "acme".to_string(),
        cluster_id: "1".to_string(),
        node_id: "1-n1".to_string(),
        action: ProvisionerAction::Create,
        service: None,
        service_action: None,
        node: NodeLayout {
            hardwaretype: "medium".to_string(),
            imagetype: "ubuntu".to_string(),
            provider: "rackspace".to_string(),
            services: BTreeSet::new(),
        },
    }
}

#[tokio::test]
async fn accepted_dispatch_arrives_as_json() {
    let (endpoint, mut seen) = spawn_agent("202 Accepted", "").await;
    let worker = Worker::new("w1", &endpoint, 1, 0);
    let provisioner = HttpProvisioner::new(Duration::from_secs(5));

    provisioner.submit(&worker, &dispatch()).await.unwrap();
    assert_eq!(seen.recv().await.unwrap(), dispatch());
}

#[tokio::test]
async fn refused_dispatch_quotes_the_worker() {
    let (endpoint, _seen) = spawn_agent("503 Service Unavailable", "draining").await;
    let worker = Worker::new("w1", &endpoint, 1, 0);
    let provisioner = HttpProvisioner::new(Duration::from_secs(5));

    match provisioner.submit(&worker, &dispatch()).await {
        Err(ProvisionerError::Rejected(reason)) => {
            assert!(reason.contains("503"), "{reason}");
            assert!(reason.contains("draining"), "{reason}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let worker = Worker::new("w1", &endpoint, 1, 0);

    let result = HttpProvisioner::new(Duration::from_secs(5))
        .submit(&worker, &dispatch())
        .await;
    assert!(matches!(result, Err(ProvisionerError::Unreachable(_))));
}

fn write(root: &Path, relative: &str, value: serde_json::Value) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

fn write_catalog(root: &Path, worker_endpoint: &str) {
    write(root, "tenants/acme.json", json!({"name": "acme", "workers": 8}));
    write(
        root,
        "workers/w1.json",
        json!({"id": "w1", "endpoint": worker_endpoint, "capacity": 4}),
    );
    write(
        root,
        "acme/services/base.json",
        json!({
            "name": "base",
            "provisionerActions": {
                "install": {"type": "shell", "fields": {"script": "install-base.sh"}},
                "start": {"type": "shell", "fields": {"script": "start-base.sh"}}
            }
        }),
    );
    write(
        root,
        "acme/templates/base.json",
        json!({
            "name": "base",
            "clusterDefaults": {
                "services": ["base"],
                "provider": "rackspace",
                "hardwaretype": "medium",
                "imagetype": "ubuntu",
                "config": {"tls.enabled": false}
            }
        }),
    );
    write(
        root,
        "acme/partials/security.json",
        json!({
            "name": "security",
            "mandatory": true,
            "clusterDefaults": {"config": {"tls.enabled": true}}
        }),
    );
}

#[test]
fn resolve_applies_mandatory_partials_from_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(dir.path(), "http://127.0.0.1:1");
    write(
        dir.path(),
        "acme/templates/plain.json",
        json!({
            "name": "plain",
            "clusterDefaults": {"services": ["base"], "provider": "rackspace"}
        }),
    );
    let catalog = Catalog::load(dir.path()).unwrap();

    let resolved = catalog.resolve("acme", "plain", Vec::new()).unwrap();
    assert_eq!(
        resolved.template.cluster_defaults.config["tls.enabled"],
        json!(true)
    );
    assert_eq!(resolved.fingerprint.len(), 64);
    let again = catalog.resolve("acme", "plain", Vec::new()).unwrap();
    assert_eq!(resolved.fingerprint, again.fingerprint);

    // base sets tls.enabled=false against the mandatory partial.
    assert!(catalog.resolve("acme", "base", Vec::new()).is_err());
}

#[tokio::test]
async fn seeded_daemon_provisions_over_http_and_survives_restart() {
    let (endpoint, mut seen) = spawn_agent("202 Accepted", "").await;
    let dir = tempfile::tempdir().unwrap();
    let catalog_dir = dir.path().join("catalog");
    write_catalog(&catalog_dir, &endpoint);
    write(
        &catalog_dir,
        "acme/templates/plain.json",
        json!({
            "name": "plain",
            "clusterDefaults": {"services": ["base"], "provider": "rackspace",
                                "hardwaretype": "medium", "imagetype": "ubuntu"}
        }),
    );
    let store_path = dir.path().join("provgrid.redb");

    let mut config = ProvgridConfig::default();
    config.scheduler.retry_base_delay = "0ms".to_string();
    config.store.path = store_path.clone();

    let catalog = Catalog::load(&catalog_dir).unwrap();
    let state = StateStore::open(&store_path).unwrap();
    catalog.seed(&state).unwrap();

    let orchestrator = Orchestrator::new(
        state.clone(),
        &config,
        Arc::new(HttpProvisioner::new(Duration::from_secs(5))),
        Arc::new(LoggingCallback),
    )
    .unwrap();
    for registration in catalog.workers.clone() {
        orchestrator.register_worker(registration).unwrap();
    }

    let cluster = orchestrator
        .create_cluster(
            "acme",
            CreateClusterRequest {
                name: "edge".to_string(),
                template: "plain".to_string(),
                size: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let job_id = cluster.latest_job.clone().unwrap();

    // First stage goes out; then the control plane "restarts" with only the
    // store surviving.
    assert_eq!(orchestrator.step().await.unwrap(), 1);
    let first = seen.recv().await.unwrap();
    assert_eq!(first.action, ProvisionerAction::Create);
    drop(orchestrator);

    let orchestrator = Orchestrator::new(
        state.clone(),
        &config,
        Arc::new(HttpProvisioner::new(Duration::from_secs(5))),
        Arc::new(LoggingCallback),
    )
    .unwrap();
    orchestrator.recover().await.unwrap();

    orchestrator
        .report_task(&TaskReport {
            task_id: first.task_id.clone(),
            attempt: first.attempt,
            outcome: TaskOutcome::Success,
        })
        .await
        .unwrap();

    for _ in 0..50 {
        if state.get_job(&job_id).unwrap().unwrap().status.is_terminal() {
            break;
        }
        let sent = orchestrator.step().await.unwrap();
        for _ in 0..sent {
            let dispatch = seen.recv().await.unwrap();
            orchestrator
                .report_task(&TaskReport {
                    task_id: dispatch.task_id,
                    attempt: dispatch.attempt,
                    outcome: TaskOutcome::Success,
                })
                .await
                .unwrap();
        }
    }

    assert_eq!(
        state.get_job(&job_id).unwrap().unwrap().status,
        JobStatus::Complete
    );
    assert_eq!(
        state.get_cluster(&cluster.id).unwrap().unwrap().status,
        ClusterStatus::Active
    );
}
