//! HTTP lifecycle hook. Asks a remote endpoint about each checkpoint.
//!
//! The checkpoint and shift context are POSTed as JSON. A 2xx answer
//! allows the checkpoint; any other status, or a connection failure,
//! rejects it. The overall deadline is enforced by the shifter's hook
//! timeout.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use serde::Serialize;
use tracing::debug;

use crate::hooks::{HookContext, HookDecision, LifecycleCheckpoint, LifecycleValidator};

#[derive(Serialize)]
struct HookRequest<'a> {
    checkpoint: LifecycleCheckpoint,
    #[serde(flatten)]
    context: &'a HookContext,
}

/// Validator that calls `http://{address}{path}`.
#[derive(Debug, Clone)]
pub struct HttpHookValidator {
    address: String,
    path: String,
}

impl HttpHookValidator {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
        }
    }

    async fn call(&self, body: Vec<u8>) -> Result<http::StatusCode, String> {
        let uri = format!("http://{}{}", self.address, self.path);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| format!("connect {uri}: {e}"))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| format!("handshake {uri}: {e}"))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "cutover-hook/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| format!("request {uri}: {e}"))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| format!("request {uri}: {e}"))?;
        Ok(resp.status())
    }
}

#[async_trait]
impl LifecycleValidator for HttpHookValidator {
    async fn validate(&self, checkpoint: LifecycleCheckpoint, ctx: &HookContext) -> HookDecision {
        let body = match serde_json::to_vec(&HookRequest {
            checkpoint,
            context: ctx,
        }) {
            Ok(body) => body,
            Err(e) => return HookDecision::reject(format!("encoding hook request: {e}")),
        };

        match self.call(body).await {
            Ok(status) if status.is_success() => HookDecision::Allow,
            Ok(status) => {
                debug!(%status, address = %self.address, %checkpoint, "hook answered non-2xx");
                HookDecision::reject(format!("hook answered {status}"))
            }
            Err(e) => {
                debug!(error = %e, %checkpoint, "hook call failed");
                HookDecision::reject(e)
            }
        }
    }
}
