//! Host-side client for the in-guest agent.
//!
//! The agent speaks line-delimited JSON-RPC over vsock (see
//! `fc_cri_shared::protocol`). The primary dial goes through the host vsock
//! driver; if that fails we fall back to the Unix socket Firecracker exposes
//! for the guest's vsock device. One request is in flight at a time and
//! request ids are strictly increasing for the life of the client.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fc_cri_shared::protocol::{
    methods, ContainerStatsResult, CreateContainerParams, ExecSyncParams, ExecSyncResult,
    GetStatsParams, RemoveContainerParams, Request, Response, StartContainerParams,
    StartContainerResult, StopContainerParams, METHOD_NOT_FOUND,
};
use fc_cri_shared::{FcError, FcResult};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::config::AgentConfig;

/// Per-probe deadline during the readiness loop.
const PING_TIMEOUT: Duration = Duration::from_millis(500);

trait AgentStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentStream for T {}

struct Connection {
    stream: BufStream<Box<dyn AgentStream>>,
}

/// Client for one sandbox's guest agent.
pub struct AgentClient {
    config: AgentConfig,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("request_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Connect to the agent and probe it until it answers a ping.
    ///
    /// Dial order: vsock `(cid, port)` first, then the Unix socket at
    /// `vsock_path` under the connect timeout. After the transport is up,
    /// pings run every `dial_retry_interval` for up to `dial_retries`
    /// attempts; exhaustion tears the connection down and yields
    /// `Unavailable`.
    pub async fn connect(&self, vsock_path: &Path, cid: u32, port: u32) -> FcResult<()> {
        tracing::debug!(vsock_path = %vsock_path.display(), cid, port, "connecting to guest agent");

        let stream = self.dial(vsock_path, cid, port).await?;
        {
            let mut guard = self.conn.lock().await;
            *guard = Some(Connection {
                stream: BufStream::new(stream),
            });
        }

        for attempt in 0..self.config.dial_retries {
            match self.call(methods::PING, None, PING_TIMEOUT).await {
                Ok(_) => {
                    tracing::debug!(cid, attempt, "guest agent is ready");
                    return Ok(());
                }
                Err(err) => {
                    tracing::trace!(cid, attempt, %err, "agent not ready yet");
                }
            }
            tokio::time::sleep(self.config.dial_retry_interval()).await;
        }

        self.close().await;
        Err(FcError::Unavailable(format!(
            "agent at cid {} did not answer after {} probes",
            cid, self.config.dial_retries
        )))
    }

    async fn dial(&self, vsock_path: &Path, cid: u32, port: u32) -> FcResult<Box<dyn AgentStream>> {
        #[cfg(target_os = "linux")]
        {
            use tokio_vsock::{VsockAddr, VsockStream};
            match VsockStream::connect(VsockAddr::new(cid, port)).await {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(err) => {
                    tracing::debug!(cid, port, %err, "vsock dial failed, trying unix socket");
                }
            }
        }

        let connect = UnixStream::connect(vsock_path);
        match tokio::time::timeout(self.config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(err)) => Err(FcError::Unavailable(format!(
                "dial agent socket {}: {}",
                vsock_path.display(),
                err
            ))),
            Err(_) => Err(FcError::Unavailable(format!(
                "dial agent socket {} timed out",
                vsock_path.display()
            ))),
        }
    }

    /// Drop the connection. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            let mut stream = conn.stream;
            let _ = stream.shutdown().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    // -- agent methods ------------------------------------------------------

    pub async fn ping(&self) -> FcResult<()> {
        self.call(methods::PING, None, self.config.command_timeout())
            .await?;
        Ok(())
    }

    pub async fn create_container(&self, params: &CreateContainerParams) -> FcResult<()> {
        self.call(
            methods::CREATE_CONTAINER,
            Some(serde_json::to_value(params)?),
            self.config.command_timeout(),
        )
        .await?;
        Ok(())
    }

    /// Start a created container; returns the guest-side pid.
    pub async fn start_container(&self, id: &str) -> FcResult<u32> {
        let params = StartContainerParams { id: id.to_string() };
        let result = self
            .call(
                methods::START_CONTAINER,
                Some(serde_json::to_value(&params)?),
                self.config.command_timeout(),
            )
            .await?;
        let result: StartContainerResult = serde_json::from_value(result.unwrap_or(Value::Null))
            .map_err(|e| FcError::Internal(format!("decode start_container result: {}", e)))?;
        Ok(result.pid)
    }

    pub async fn stop_container(&self, id: &str, timeout: Duration) -> FcResult<()> {
        let params = StopContainerParams {
            id: id.to_string(),
            timeout_seconds: timeout.as_secs(),
        };
        // Give the agent the stop window plus the usual command budget.
        let deadline = self.config.command_timeout() + timeout;
        self.call(
            methods::STOP_CONTAINER,
            Some(serde_json::to_value(&params)?),
            deadline,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_container(&self, id: &str) -> FcResult<()> {
        let params = RemoveContainerParams { id: id.to_string() };
        self.call(
            methods::REMOVE_CONTAINER,
            Some(serde_json::to_value(&params)?),
            self.config.command_timeout(),
        )
        .await?;
        Ok(())
    }

    pub async fn exec_sync(
        &self,
        id: &str,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> FcResult<ExecSyncResult> {
        let params = ExecSyncParams {
            id: id.to_string(),
            cmd,
            timeout_seconds: timeout.as_secs(),
        };
        let deadline = self.config.command_timeout() + timeout;
        let result = self
            .call(
                methods::EXEC_SYNC,
                Some(serde_json::to_value(&params)?),
                deadline,
            )
            .await?;
        serde_json::from_value(result.unwrap_or(Value::Null))
            .map_err(|e| FcError::Internal(format!("decode exec_sync result: {}", e)))
    }

    pub async fn get_stats(&self, id: &str) -> FcResult<ContainerStatsResult> {
        let params = GetStatsParams { id: id.to_string() };
        let result = self
            .call(
                methods::GET_STATS,
                Some(serde_json::to_value(&params)?),
                self.config.command_timeout(),
            )
            .await?;
        serde_json::from_value(result.unwrap_or(Value::Null))
            .map_err(|e| FcError::Internal(format!("decode get_stats result: {}", e)))
    }

    // -- transport ----------------------------------------------------------

    /// One request, one response, correlated by id, under `deadline`.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> FcResult<Option<Value>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| FcError::Unavailable("agent not connected".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Request {
            id,
            method: method.to_string(),
            params,
        };

        let exchange = async {
            let mut frame = serde_json::to_vec(&request)?;
            frame.push(b'\n');
            conn.stream.write_all(&frame).await?;
            conn.stream.flush().await?;

            let mut line = String::new();
            let n = conn.stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(FcError::Unavailable("agent closed the connection".into()));
            }
            let response: Response = serde_json::from_str(line.trim_end())
                .map_err(|e| FcError::Internal(format!("decode agent response: {}", e)))?;
            Ok(response)
        };

        let response = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| FcError::DeadlineExceeded(format!("agent call {} timed out", method)))??;

        if response.id != id {
            return Err(FcError::Internal(format!(
                "agent response id mismatch: sent {}, got {}",
                id, response.id
            )));
        }

        if let Some(err) = response.error {
            if err.code == METHOD_NOT_FOUND {
                return Err(FcError::NotImplemented(format!(
                    "agent method {}",
                    method
                )));
            }
            return Err(FcError::Internal(format!(
                "{} failed: {}",
                method, err.message
            )));
        }

        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn test_config() -> AgentConfig {
        AgentConfig {
            dial_retries: 3,
            dial_retry_interval_ms: 10,
            connect_timeout_secs: 1,
            command_timeout_secs: 1,
            ..AgentConfig::default()
        }
    }

    /// Minimal in-process agent: answers ping and a couple of methods.
    fn spawn_fake_agent(listener: UnixListener) {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Request = serde_json::from_str(&line).unwrap();
                let response = match req.method.as_str() {
                    "ping" => json!({"id": req.id, "result": {}}),
                    "start_container" => json!({"id": req.id, "result": {"pid": 4242}}),
                    "get_stats" => json!({
                        "id": req.id,
                        "result": {"cpu_usage": 100, "memory_usage": 2048, "read_bytes": 1, "write_bytes": 2}
                    }),
                    "boom" => json!({
                        "id": req.id,
                        "error": {"code": 1, "message": "container exploded"}
                    }),
                    _ => json!({
                        "id": req.id,
                        "error": {"code": METHOD_NOT_FOUND, "message": "unknown method"}
                    }),
                };
                let mut frame = serde_json::to_vec(&response).unwrap();
                frame.push(b'\n');
                write.write_all(&frame).await.unwrap();
            }
        });
    }

    async fn connected_client() -> (AgentClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        spawn_fake_agent(listener);

        let client = AgentClient::new(test_config());
        // CID 0 is reserved, so the vsock dial always fails over to the
        // Unix socket in tests.
        client.connect(&sock, 0, 1024).await.unwrap();
        (client, dir)
    }

    #[tokio::test]
    async fn connect_probes_until_ready() {
        let (client, _dir) = connected_client().await;
        assert!(client.is_connected().await);
        client.ping().await.unwrap();
        client.close().await;
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn start_container_returns_pid() {
        let (client, _dir) = connected_client().await;
        assert_eq!(client.start_container("task-1").await.unwrap(), 4242);
    }

    #[tokio::test]
    async fn request_ids_strictly_increase() {
        let (client, _dir) = connected_client().await;
        let before = client.next_id.load(Ordering::SeqCst);
        client.ping().await.unwrap();
        client.ping().await.unwrap();
        assert_eq!(client.next_id.load(Ordering::SeqCst), before + 2);
    }

    #[tokio::test]
    async fn unknown_method_maps_to_not_implemented() {
        let (client, _dir) = connected_client().await;
        let err = client
            .call("resize_pty", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FcError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn application_error_maps_to_internal() {
        let (client, _dir) = connected_client().await;
        let err = client
            .call("boom", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("container exploded"), "got: {msg}");
    }

    #[tokio::test]
    async fn stats_decode() {
        let (client, _dir) = connected_client().await;
        let stats = client.get_stats("task-1").await.unwrap();
        assert_eq!(stats.cpu_usage, 100);
        assert_eq!(stats.memory_usage, 2048);
    }

    #[tokio::test]
    async fn silent_agent_exhausts_probes() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        // Accept but never answer.
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = AgentClient::new(test_config());
        let err = client.connect(&sock, 0, 1024).await.unwrap_err();
        assert!(matches!(err, FcError::Unavailable(_)));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn call_without_connection_is_unavailable() {
        let client = AgentClient::new(test_config());
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, FcError::Unavailable(_)));
    }
}
