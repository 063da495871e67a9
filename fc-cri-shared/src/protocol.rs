//! Agent wire protocol.
//!
//! The host talks to the in-guest agent over vsock with a minimal JSON-RPC:
//! one JSON value per line, one response per request, correlated by id.
//!
//! ```text
//! -> {"id":1,"method":"create_container","params":{...}}
//! <- {"id":1,"result":{}}
//! ```
//!
//! Error codes: `-32601` means the agent does not know the method;
//! non-negative codes are application errors with a human-readable message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// Method names understood by the agent.
pub mod methods {
    pub const PING: &str = "ping";
    pub const CREATE_CONTAINER: &str = "create_container";
    pub const START_CONTAINER: &str = "start_container";
    pub const STOP_CONTAINER: &str = "stop_container";
    pub const REMOVE_CONTAINER: &str = "remove_container";
    pub const EXEC_SYNC: &str = "exec_sync";
    pub const GET_STATS: &str = "get_stats";
}

/// A single request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A single response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Error payload inside a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Typed method payloads
// ---------------------------------------------------------------------------

/// `create_container` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerParams {
    pub id: String,
    pub bundle: String,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub terminal: bool,
}

/// `start_container` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartContainerParams {
    pub id: String,
}

/// `start_container` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartContainerResult {
    pub pid: u32,
}

/// `stop_container` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopContainerParams {
    pub id: String,
    pub timeout_seconds: u64,
}

/// `remove_container` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveContainerParams {
    pub id: String,
}

/// `exec_sync` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSyncParams {
    pub id: String,
    pub cmd: Vec<String>,
    pub timeout_seconds: u64,
}

/// `exec_sync` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSyncResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// `get_stats` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStatsParams {
    pub id: String,
}

/// `get_stats` result. CPU usage is cumulative nanoseconds, memory is bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatsResult {
    #[serde(default)]
    pub cpu_usage: u64,
    #[serde(default)]
    pub memory_usage: u64,
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub write_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_missing_params() {
        let req = Request {
            id: 7,
            method: methods::PING.into(),
            params: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"id":7,"method":"ping"}"#);
    }

    #[test]
    fn request_with_params_round_trips() {
        let params = CreateContainerParams {
            id: "task-1".into(),
            bundle: "/run/bundle".into(),
            stdin: false,
            stdout: true,
            stderr: true,
            terminal: false,
        };
        let req = Request {
            id: 1,
            method: methods::CREATE_CONTAINER.into(),
            params: Some(serde_json::to_value(&params).unwrap()),
        };

        let decoded: Request = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(decoded.method, "create_container");
        let decoded_params: CreateContainerParams =
            serde_json::from_value(decoded.params.unwrap()).unwrap();
        assert_eq!(decoded_params.id, "task-1");
        assert!(decoded_params.stdout);
    }

    #[test]
    fn response_error_decodes() {
        let raw = r#"{"id":3,"error":{"code":-32601,"message":"unknown method"}}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, 3);
        assert!(resp.result.is_none());
        let err = resp.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.message, "unknown method");
    }

    #[test]
    fn stats_result_defaults_missing_fields() {
        let stats: ContainerStatsResult =
            serde_json::from_str(r#"{"cpu_usage":120,"memory_usage":4096}"#).unwrap();
        assert_eq!(stats.cpu_usage, 120);
        assert_eq!(stats.read_bytes, 0);
        assert_eq!(stats.write_bytes, 0);
    }
}
