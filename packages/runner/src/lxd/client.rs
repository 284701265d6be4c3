// ABOUTME: LXD REST API client with TLS client-certificate auth
// ABOUTME: Drives container lifecycle calls, async-operation waits, and exec websocket channels

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, warn};

use super::{
    ByteChannel, ChannelFd, ContainerDriver, ContainerSpec, DriverError, ExecHandle, Result,
};
use crate::config::LxdConfig;
use crate::job::ImageSource;

/// Request timeout for plain API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operation waits cover container creation, which may download an image.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Every LXD response is wrapped in this envelope; `type` distinguishes
/// sync results, async operations, and errors.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: Value,
}

/// LXD REST client. One instance is shared by every session.
pub struct LxdClient {
    http: reqwest::Client,
    endpoint: String,
    ws_endpoint: String,
    tls: native_tls::TlsConnector,
}

impl LxdClient {
    pub fn new(config: &LxdConfig) -> Result<Self> {
        let cert = std::fs::read(config.cert_path())?;
        let key = std::fs::read(config.key_path())?;

        let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key)?;
        let http = reqwest::Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(!config.verify)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let ws_identity = native_tls::Identity::from_pkcs8(&cert, &key)
            .map_err(|err| DriverError::Tls(err.to_string()))?;
        let tls = native_tls::TlsConnector::builder()
            .identity(ws_identity)
            .danger_accept_invalid_certs(!config.verify)
            .build()
            .map_err(|err| DriverError::Tls(err.to_string()))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            ws_endpoint: websocket_endpoint(&config.endpoint),
            tls,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    /// Parse a response envelope, turning LXD error envelopes into errors.
    async fn envelope(&self, response: reqwest::Response) -> Result<Envelope> {
        let body = response.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&body).map_err(|err| {
            DriverError::UnexpectedResponse(format!("response is not a valid envelope: {err}"))
        })?;
        if envelope.kind == "error" {
            return Err(DriverError::Api {
                code: envelope.error_code,
                message: envelope.error,
            });
        }
        Ok(envelope)
    }

    /// Wait for an async operation to finish, returning its operation object.
    async fn wait(&self, operation_id: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.url(&format!("/1.0/operations/{operation_id}/wait")))
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await?;
        let envelope = self.envelope(response).await?;

        let operation = envelope.metadata;
        let status_code = operation
            .get("status_code")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if status_code >= 400 {
            let message = operation
                .get("err")
                .and_then(Value::as_str)
                .unwrap_or("operation failed")
                .to_string();
            return Err(DriverError::Api {
                code: status_code as u16,
                message,
            });
        }
        Ok(operation)
    }

    /// Issue an async request and block until its operation completes.
    async fn run_operation(&self, envelope: Envelope) -> Result<()> {
        let operation_id = operation_id(&envelope.operation)?;
        self.wait(operation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for LxdClient {
    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let source = match &spec.source {
            ImageSource::Fingerprint(fingerprint) => {
                json!({"type": "image", "fingerprint": fingerprint})
            }
            ImageSource::Alias(alias) => json!({"type": "image", "alias": alias}),
        };
        let body = json!({
            "name": spec.name,
            "profiles": spec.profiles,
            "source": source,
            "devices": {
                "kiln_repository": {
                    "type": "disk",
                    "path": spec.repository.container_path,
                    "source": spec.repository.host_path,
                },
            },
        });

        debug!(container = %spec.name, "creating container");
        let response = self
            .http
            .post(self.url("/1.0/containers"))
            .json(&body)
            .send()
            .await?;
        let envelope = self.envelope(response).await?;
        self.run_operation(envelope).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        debug!(container = %name, "starting container");
        let response = self
            .http
            .put(self.url(&format!("/1.0/containers/{name}/state")))
            .json(&json!({"action": "start", "timeout": 30}))
            .send()
            .await?;
        let envelope = self.envelope(response).await?;
        self.run_operation(envelope).await
    }

    async fn exec(
        &self,
        name: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<ExecHandle> {
        let body = json!({
            "command": command,
            "environment": env,
            "wait-for-websocket": true,
            "interactive": false,
        });

        let response = self
            .http
            .post(self.url(&format!("/1.0/containers/{name}/exec")))
            .json(&body)
            .send()
            .await?;
        let envelope = self.envelope(response).await?;

        let operation_id = operation_id(&envelope.operation)?.to_string();
        let fds: HashMap<String, String> =
            serde_json::from_value(envelope.metadata["metadata"]["fds"].clone()).map_err(
                |err| {
                    DriverError::UnexpectedResponse(format!(
                        "exec operation has no websocket fds: {err}"
                    ))
                },
            )?;

        debug!(container = %name, operation = %operation_id, "exec operation created");
        Ok(ExecHandle { operation_id, fds })
    }

    async fn open_channel(&self, exec: &ExecHandle, fd: ChannelFd) -> Result<ByteChannel> {
        let secret = exec.secret(fd)?;
        let url = format!(
            "{}/1.0/operations/{}/websocket?secret={}",
            self.ws_endpoint, exec.operation_id, secret
        );

        let connector = Connector::NativeTls(self.tls.clone());
        let (mut socket, _) = connect_async_tls_with_config(url, None, false, Some(connector))
            .await
            .map_err(|err| DriverError::WebSocket(err.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel();
        let operation_id = exec.operation_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = socket.close(None).await;
                        break;
                    }
                    frame = socket.next() => match frame {
                        // LXD signals end-of-stream with a zero-length frame.
                        Some(Ok(Message::Binary(data))) => {
                            if data.is_empty() {
                                let _ = socket.close(None).await;
                                break;
                            }
                            if tx.send(data).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            if text.is_empty() {
                                let _ = socket.close(None).await;
                                break;
                            }
                            if tx.send(text.into_bytes()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(operation = %operation_id, error = %err, "channel read failed");
                            break;
                        }
                    },
                }
            }
        });

        Ok(ByteChannel::new(rx, close_tx))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        debug!(container = %name, "stopping container");
        let response = self
            .http
            .put(self.url(&format!("/1.0/containers/{name}/state")))
            .json(&json!({"action": "stop", "timeout": 30, "force": true}))
            .send()
            .await?;
        let envelope = self.envelope(response).await?;
        self.run_operation(envelope).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        debug!(container = %name, "deleting container");
        let response = self
            .http
            .delete(self.url(&format!("/1.0/containers/{name}")))
            .send()
            .await?;
        let envelope = self.envelope(response).await?;
        self.run_operation(envelope).await
    }

    async fn wait_operation(&self, operation_id: &str) -> Result<i64> {
        let operation = self.wait(operation_id).await?;
        operation["metadata"]["return"].as_i64().ok_or_else(|| {
            DriverError::UnexpectedResponse(
                "exec operation has no return code".to_string(),
            )
        })
    }
}

/// Extract the operation id from an envelope's `/1.0/operations/<id>` path.
fn operation_id(operation: &str) -> Result<&str> {
    operation
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            DriverError::UnexpectedResponse(format!(
                "response carries no operation path: `{operation}`"
            ))
        })
}

/// The websocket endpoint is the API endpoint with the scheme swapped.
fn websocket_endpoint(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_id_takes_last_path_segment() {
        assert_eq!(
            operation_id("/1.0/operations/op-123").unwrap(),
            "op-123"
        );
    }

    #[test]
    fn operation_id_rejects_empty_paths() {
        assert!(operation_id("").is_err());
        assert!(operation_id("/1.0/operations/").is_err());
    }

    #[test]
    fn websocket_endpoint_swaps_scheme() {
        assert_eq!(
            websocket_endpoint("https://lxd.example:8443"),
            "wss://lxd.example:8443"
        );
        assert_eq!(
            websocket_endpoint("http://localhost:8443"),
            "ws://localhost:8443"
        );
    }
}
