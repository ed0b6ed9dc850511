//! HTTP provisioner client.
//!
//! Each dispatch is one `POST {endpoint}/v1/tasks` with the JSON-encoded
//! [`TaskDispatch`]. Any 2xx means the worker accepted the attempt; its
//! outcome arrives later as a task report.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use provgrid_scheduler::{ProvisionerClient, ProvisionerError, TaskDispatch};
use provgrid_state::Worker;
use tracing::debug;

const TASKS_PATH: &str = "/v1/tasks";
const USER_AGENT: &str = concat!("provd/", env!("CARGO_PKG_VERSION"));
/// Longest response body quoted back in a rejection.
const MAX_QUOTED_BODY: usize = 512;

/// Posts task dispatches to plain-HTTP worker endpoints.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    timeout: Duration,
}

impl HttpProvisioner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpProvisioner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// `http://host:port/prefix` split into the connect address and request URI.
fn tasks_target(endpoint: &str) -> Result<(String, String), ProvisionerError> {
    let rest = endpoint.strip_prefix("http://").ok_or_else(|| {
        ProvisionerError::Protocol(format!("unsupported endpoint {endpoint}: expected http://"))
    })?;
    let rest = rest.trim_end_matches('/');
    let (address, prefix) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if address.is_empty() {
        return Err(ProvisionerError::Protocol(format!(
            "endpoint {endpoint} has no host"
        )));
    }
    Ok((
        address.to_string(),
        format!("http://{address}{prefix}{TASKS_PATH}"),
    ))
}

#[async_trait]
impl ProvisionerClient for HttpProvisioner {
    async fn submit(&self, worker: &Worker, dispatch: &TaskDispatch) -> Result<(), ProvisionerError> {
        let (address, uri) = tasks_target(&worker.endpoint)?;
        let body = serde_json::to_vec(dispatch)
            .map_err(|e| ProvisionerError::Protocol(format!("encoding dispatch: {e}")))?;

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| ProvisionerError::Unreachable(format!("{address}: {e}")))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProvisionerError::Unreachable(format!("{address}: {e}")))?;

            tokio::spawn(async move {
                let _ = conn.await;
            });

            let request = http::Request::builder()
                .method(http::Method::POST)
                .uri(&uri)
                .header(http::header::HOST, &address)
                .header(http::header::USER_AGENT, USER_AGENT)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body)))
                .map_err(|e| ProvisionerError::Protocol(e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ProvisionerError::Unreachable(format!("{uri}: {e}")))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let body = match response.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => Bytes::new(),
            };
            let text = String::from_utf8_lossy(&body);
            let quoted: String = text.trim().chars().take(MAX_QUOTED_BODY).collect();
            debug!(%uri, %status, "worker refused task");
            Err(ProvisionerError::Rejected(if quoted.is_empty() {
                status.to_string()
            } else {
                format!("{status}: {quoted}")
            }))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionerError::Unreachable(format!(
                "{uri}: timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
