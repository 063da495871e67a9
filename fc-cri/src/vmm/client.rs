//! HTTP client for the Firecracker API socket.
//!
//! The API is plain HTTP/1.0 over a Unix socket with tiny JSON bodies, so
//! requests are written straight onto the stream and responses parsed with
//! `httparse`. One connection per request; Firecracker closes after
//! answering an HTTP/1.0 exchange.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fc_cri_shared::{FcError, FcResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::models::{
    ActionType, ApiFault, BootSource, Drive, InstanceActionInfo, InstanceInfo,
    MachineConfiguration, PartialDrive, SnapshotCreateParams, SnapshotLoadParams, Vm, VmState,
    Vsock,
};

const HTTP_VERSION: &str = "HTTP/1.0";

/// Client bound to one VMM's API socket.
#[derive(Debug, Clone)]
pub struct VmmApiClient {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl VmmApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    // -- typed endpoints ----------------------------------------------------

    pub async fn put_boot_source(&self, body: &BootSource) -> FcResult<()> {
        self.send_json("PUT", "/boot-source", body).await
    }

    pub async fn put_machine_config(&self, body: &MachineConfiguration) -> FcResult<()> {
        self.send_json("PUT", "/machine-config", body).await
    }

    pub async fn put_drive(&self, body: &Drive) -> FcResult<()> {
        let path = format!("/drives/{}", body.drive_id);
        self.send_json("PUT", &path, body).await
    }

    pub async fn patch_drive(&self, body: &PartialDrive) -> FcResult<()> {
        let path = format!("/drives/{}", body.drive_id);
        self.send_json("PATCH", &path, body).await
    }

    pub async fn put_vsock(&self, body: &Vsock) -> FcResult<()> {
        self.send_json("PUT", "/vsock", body).await
    }

    pub async fn instance_start(&self) -> FcResult<()> {
        self.action(ActionType::InstanceStart).await
    }

    pub async fn send_ctrl_alt_del(&self) -> FcResult<()> {
        self.action(ActionType::SendCtrlAltDel).await
    }

    pub async fn pause(&self) -> FcResult<()> {
        self.send_json(
            "PATCH",
            "/vm",
            &Vm {
                state: VmState::Paused,
            },
        )
        .await
    }

    pub async fn resume(&self) -> FcResult<()> {
        self.send_json(
            "PATCH",
            "/vm",
            &Vm {
                state: VmState::Resumed,
            },
        )
        .await
    }

    pub async fn create_snapshot(&self, body: &SnapshotCreateParams) -> FcResult<()> {
        self.send_json("PUT", "/snapshot/create", body).await
    }

    pub async fn load_snapshot(&self, body: &SnapshotLoadParams) -> FcResult<()> {
        self.send_json("PUT", "/snapshot/load", body).await
    }

    pub async fn describe_instance(&self) -> FcResult<InstanceInfo> {
        let body = self.request("GET", "/", None).await?;
        serde_json::from_slice(&body)
            .map_err(|e| FcError::Internal(format!("decode instance info: {}", e)))
    }

    async fn action(&self, action_type: ActionType) -> FcResult<()> {
        self.send_json("PUT", "/actions", &InstanceActionInfo { action_type })
            .await
    }

    async fn send_json<T: serde::Serialize>(
        &self,
        method: &str,
        path: &str,
        body: &T,
    ) -> FcResult<()> {
        let payload = serde_json::to_string(body)?;
        self.request(method, path, Some(payload)).await?;
        Ok(())
    }

    // -- transport ----------------------------------------------------------

    /// Send one request and return the response body. Non-2xx responses
    /// surface the VMM's fault message as `Internal`.
    async fn request(&self, method: &str, path: &str, body: Option<String>) -> FcResult<Vec<u8>> {
        let raw = encode_request(method, path, body.as_deref());

        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                FcError::Unavailable(format!(
                    "vmm api socket {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;
            stream.write_all(&raw).await?;
            stream.flush().await?;
            read_response(&mut stream).await
        };

        let (status, response_body) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                FcError::DeadlineExceeded(format!("vmm api {} {} timed out", method, path))
            })??;

        if !(200..300).contains(&status) {
            let fault: ApiFault = serde_json::from_slice(&response_body).unwrap_or(ApiFault {
                fault_message: String::from_utf8_lossy(&response_body).into_owned(),
            });
            return Err(FcError::Internal(format!(
                "vmm api {} {} returned {}: {}",
                method, path, status, fault.fault_message
            )));
        }

        Ok(response_body)
    }
}

fn encode_request(method: &str, path: &str, body: Option<&str>) -> Vec<u8> {
    let mut request = format!("{} {} {}\r\n", method, path, HTTP_VERSION);
    match body {
        Some(body) => {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            request.push_str(body);
        }
        None => request.push_str("\r\n"),
    }
    request.into_bytes()
}

/// Read until the response is complete: headers parsed and, when a
/// Content-Length is present, that many body bytes received.
async fn read_response(stream: &mut UnixStream) -> FcResult<(u16, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        let eof = n == 0;
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(body_start)) => {
                let status = response
                    .code
                    .ok_or_else(|| FcError::Internal("vmm api response missing status".into()))?;

                let content_length = response
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok());

                let body_len = buf.len() - body_start;
                match content_length {
                    Some(want) if body_len < want && !eof => continue,
                    Some(want) => {
                        let end = body_start + want.min(body_len);
                        return Ok((status, buf[body_start..end].to_vec()));
                    }
                    None if eof => return Ok((status, buf[body_start..].to_vec())),
                    None => continue,
                }
            }
            Ok(httparse::Status::Partial) if eof => {
                return Err(FcError::Internal("vmm api closed mid-response".into()))
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(FcError::Internal(format!("vmm api bad response: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    /// One-shot server: accept a connection, read the request, reply with a
    /// canned response, and hand the captured request back.
    async fn one_shot_server(
        response: &'static str,
    ) -> (PathBuf, tokio::task::JoinHandle<Vec<u8>>) {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let handle = tokio::spawn(async move {
            let _dir = dir; // keep alive
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let n = stream.read(&mut request).await.unwrap();
            request.truncate(n);
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });
        (sock, handle)
    }

    #[tokio::test]
    async fn put_sends_json_and_accepts_204() {
        let (sock, server) = one_shot_server("HTTP/1.1 204 No Content\r\n\r\n").await;

        let client = VmmApiClient::new(&sock);
        client
            .put_machine_config(&MachineConfiguration {
                vcpu_count: 1,
                mem_size_mib: 128,
                smt: Some(false),
            })
            .await
            .unwrap();

        let request = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(request.starts_with("PUT /machine-config HTTP/1.0\r\n"));
        assert!(request.contains(r#""vcpu_count":1"#));
        assert!(request.contains("Content-Length:"));
    }

    #[tokio::test]
    async fn fault_message_surfaces_as_internal() {
        let body = r#"{"fault_message":"no boot source configured"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (sock, _server) = one_shot_server(response).await;

        let err = VmmApiClient::new(&sock).instance_start().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no boot source configured"), "got: {msg}");
        assert!(msg.contains("400"));
    }

    #[tokio::test]
    async fn get_decodes_instance_info() {
        let body = r#"{"id":"sb-1","state":"Running","vmm_version":"1.7.0","app_name":"Firecracker"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (sock, _server) = one_shot_server(response).await;

        let info = VmmApiClient::new(&sock).describe_instance().await.unwrap();
        assert_eq!(info.id, "sb-1");
        assert_eq!(info.state, "Running");
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let client = VmmApiClient::new("/nonexistent/api.sock");
        let err = client.instance_start().await.unwrap_err();
        assert!(matches!(err, FcError::Unavailable(_)));
    }

    #[test]
    fn encode_request_without_body() {
        let raw = encode_request("GET", "/", None);
        assert_eq!(raw, b"GET / HTTP/1.0\r\n\r\n");
    }
}
