//! Task service tests: the full create → start → kill → delete flow against
//! a mock VM lifecycle and an in-process fake guest agent speaking the real
//! wire protocol over a Unix socket.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use fc_cri::config::{AgentConfig, PoolConfig};
use fc_cri::domain::{generate_sandbox_id, Sandbox, SandboxRef, SandboxState, VmConfig};
use fc_cri::metrics::RuntimeMetrics;
use fc_cri::shim::{
    CreateTaskRequest, DeleteRequest, EventPublisher, KillRequest, StartRequest, StateRequest,
    StatsRequest, TaskEvent, TaskService, TaskStatus, WaitRequest,
};
use fc_cri::vm::{HotplugManager, Pool, VmLifecycle};
use fc_cri::{FcError, FcResult};
use fc_cri_shared::protocol::{Request, METHOD_NOT_FOUND};

// ============================================================================
// FAKE GUEST AGENT
// ============================================================================

/// Serve the agent protocol on a Unix socket, accepting any number of
/// connections. Lives as long as the returned guard.
fn spawn_fake_agent(dir: &tempfile::TempDir) -> PathBuf {
    let sock = dir.path().join("vsock.sock");
    let listener = UnixListener::bind(&sock).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let req: Request = serde_json::from_str(&line).unwrap();
                    let response = match req.method.as_str() {
                        "ping" => json!({"id": req.id, "result": {}}),
                        "create_container" => json!({"id": req.id, "result": {}}),
                        "start_container" => json!({"id": req.id, "result": {"pid": 4242}}),
                        "stop_container" => json!({"id": req.id, "result": {}}),
                        "remove_container" => json!({"id": req.id, "result": {}}),
                        "get_stats" => json!({
                            "id": req.id,
                            "result": {
                                "cpu_usage": 1_000_000u64,
                                "memory_usage": 8_388_608u64,
                                "read_bytes": 512u64,
                                "write_bytes": 1024u64
                            }
                        }),
                        _ => json!({
                            "id": req.id,
                            "error": {"code": METHOD_NOT_FOUND, "message": "unknown method"}
                        }),
                    };
                    let mut frame = serde_json::to_vec(&response).unwrap();
                    frame.push(b'\n');
                    if write.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    sock
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

/// Lifecycle mock whose sandboxes point at a given agent socket.
struct MockLifecycle {
    vsock_path: PathBuf,
    created: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
    next_cid: AtomicU32,
}

impl MockLifecycle {
    fn new(vsock_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            vsock_path,
            created: AtomicUsize::new(0),
            destroyed: Mutex::new(Vec::new()),
            next_cid: AtomicU32::new(3),
        })
    }
}

#[async_trait]
impl VmLifecycle for MockLifecycle {
    async fn create_vm(&self, config: VmConfig) -> FcResult<SandboxRef> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut sandbox = Sandbox::new(generate_sandbox_id());
        sandbox.pid = 1234;
        sandbox.vsock_cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
        sandbox.vsock_path = self.vsock_path.clone();
        sandbox.vm_config = config;
        sandbox.state = SandboxState::Ready;
        Ok(sandbox.into_ref())
    }

    async fn stop_vm(&self, _sandbox: &SandboxRef) -> FcResult<()> {
        Ok(())
    }

    async fn destroy_vm(&self, sandbox: &SandboxRef) -> FcResult<()> {
        let id = sandbox.lock().unwrap().id.clone();
        self.destroyed.lock().unwrap().push(id);
        Ok(())
    }

    async fn pause_vm(&self, _sandbox: &SandboxRef) -> FcResult<()> {
        Ok(())
    }

    async fn resume_vm(&self, _sandbox: &SandboxRef) -> FcResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    topics: Mutex<Vec<String>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, _event: &TaskEvent) -> FcResult<()> {
        self.topics.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

struct Fixture {
    service: Arc<TaskService>,
    pool: Arc<Pool>,
    lifecycle: Arc<MockLifecycle>,
    publisher: Arc<RecordingPublisher>,
    shutdown_calls: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let vsock_path = spawn_fake_agent(&dir);
    fixture_with_vsock(dir, vsock_path)
}

fn fixture_with_vsock(dir: tempfile::TempDir, vsock_path: PathBuf) -> Fixture {
    let lifecycle = MockLifecycle::new(vsock_path);

    let pool_config = PoolConfig {
        enabled: true,
        max_size: 5,
        min_size: 0,
        max_idle_time_secs: 300,
        warm_concurrency: 2,
        replenish_interval_secs: 3600,
        prewarm_on_start: false,
    };
    let pool = Pool::new(
        pool_config,
        VmConfig::default(),
        lifecycle.clone(),
        Arc::new(HotplugManager::new()),
        None,
    );

    let agent_config = AgentConfig {
        dial_retries: 3,
        dial_retry_interval_ms: 10,
        connect_timeout_secs: 1,
        command_timeout_secs: 2,
        ..AgentConfig::default()
    };

    let publisher = Arc::new(RecordingPublisher::default());
    let shutdown_calls = Arc::new(AtomicUsize::new(0));
    let shutdown_counter = shutdown_calls.clone();

    let service = TaskService::new(
        "task-1",
        "k8s.io",
        pool.clone(),
        lifecycle.clone(),
        agent_config,
        VmConfig::default(),
        publisher.clone(),
        Box::new(move || {
            shutdown_counter.fetch_add(1, Ordering::SeqCst);
        }),
        RuntimeMetrics::new(),
    );

    Fixture {
        service,
        pool,
        lifecycle,
        publisher,
        shutdown_calls,
        _dir: dir,
    }
}

fn create_request(task_id: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        task_id: task_id.into(),
        bundle: "/run/containerd/bundle".into(),
        rootfs: vec![],
        stdin: String::new(),
        stdout: "/logs/stdout".into(),
        stderr: "/logs/stderr".into(),
        terminal: false,
    }
}

// ============================================================================
// LIFECYCLE FLOW
// ============================================================================

#[tokio::test]
async fn create_returns_vmm_pid_and_counts_a_miss() {
    let f = fixture();

    let response = f.service.create(create_request("task-1")).await.unwrap();
    assert_eq!(response.pid, 1234);

    let stats = f.pool.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.total_served, 1);
    assert_eq!(stats.in_use, 1);
}

#[tokio::test]
async fn full_task_lifecycle() {
    let f = fixture();

    f.service.create(create_request("task-1")).await.unwrap();

    // Created until started.
    let state = f
        .service
        .state(StateRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
        })
        .unwrap();
    assert_eq!(state.status, TaskStatus::Created);

    let started = f
        .service
        .start(StartRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(started.pid, 4242, "guest-reported pid");

    let state = f
        .service
        .state(StateRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
        })
        .unwrap();
    assert_eq!(state.status, TaskStatus::Running);
    assert_eq!(state.pid, 4242);
    assert_eq!(state.bundle, "/run/containerd/bundle");

    f.service
        .kill(KillRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
            signal: 9,
            all: false,
        })
        .await
        .unwrap();

    let waited = f
        .service
        .wait(WaitRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(waited.exit_status, 137);
    assert!(waited.exited_at.is_some());

    let deleted = f
        .service
        .delete(DeleteRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(deleted.exit_status, 137);

    // Deleting the init process released the sandbox back to the pool.
    let stats = f.pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 1);
}

#[tokio::test]
async fn wait_blocks_until_exit() {
    let f = fixture();
    f.service.create(create_request("task-1")).await.unwrap();

    let service = f.service.clone();
    let waiter = tokio::spawn(async move {
        service
            .wait(WaitRequest {
                task_id: "task-1".into(),
                exec_id: String::new(),
            })
            .await
    });

    // Give the waiter a chance to block.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    f.service
        .kill(KillRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
            signal: 15,
            all: false,
        })
        .await
        .unwrap();

    let waited = waiter.await.unwrap().unwrap();
    assert_eq!(waited.exit_status, 143);
}

#[tokio::test]
async fn stats_aggregate_agent_numbers() {
    let f = fixture();
    f.service.create(create_request("task-1")).await.unwrap();

    let stats = f
        .service
        .stats(StatsRequest {
            task_id: "task-1".into(),
        })
        .await
        .unwrap();
    assert_eq!(stats.cpu_usage_ns, 1_000_000);
    assert_eq!(stats.memory_usage_bytes, 8_388_608);
    assert_eq!(stats.read_bytes, 512);
    assert_eq!(stats.write_bytes, 1024);
}

#[tokio::test]
async fn events_are_published_in_order() {
    let f = fixture();
    f.service.create(create_request("task-1")).await.unwrap();
    f.service
        .start(StartRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
        })
        .await
        .unwrap();
    f.service
        .delete(DeleteRequest {
            task_id: "task-1".into(),
            exec_id: String::new(),
        })
        .await
        .unwrap();

    // Let the forwarder drain.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let topics = f.publisher.topics.lock().unwrap().clone();
    assert_eq!(topics, vec!["/tasks/create", "/tasks/start", "/tasks/delete"]);
}

// ============================================================================
// ERROR PATHS
// ============================================================================

#[tokio::test]
async fn unknown_process_is_not_found() {
    let f = fixture();
    let err = f
        .service
        .start(StartRequest {
            task_id: "nope".into(),
            exec_id: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FcError::NotFound(_)));

    let err = f
        .service
        .state(StateRequest {
            task_id: "nope".into(),
            exec_id: String::new(),
        })
        .unwrap_err();
    assert!(matches!(err, FcError::NotFound(_)));
}

#[tokio::test]
async fn unreachable_agent_destroys_sandbox_and_returns_unavailable() {
    // No agent listening at the socket the sandboxes point to.
    let dir = tempfile::tempdir().unwrap();
    let dead_socket = dir.path().join("vsock.sock");
    let f = fixture_with_vsock(dir, dead_socket);

    let err = f.service.create(create_request("task-1")).await.unwrap_err();
    assert!(matches!(err, FcError::Unavailable(_)));

    // No leaked sandbox: the acquired VM was destroyed, not pooled.
    let stats = f.pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 0);
    assert_eq!(f.lifecycle.destroyed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn v1_gaps_are_not_implemented() {
    let f = fixture();
    assert!(matches!(f.service.exec(), Err(FcError::NotImplemented(_))));
    assert!(matches!(
        f.service.checkpoint(),
        Err(FcError::NotImplemented(_))
    ));
    assert!(matches!(f.service.update(), Err(FcError::NotImplemented(_))));
    assert!(matches!(
        f.service.resize_pty(),
        Err(FcError::NotImplemented(_))
    ));
    assert!(matches!(
        f.service.close_io(),
        Err(FcError::NotImplemented(_))
    ));
}

#[tokio::test]
async fn pause_without_sandbox_is_not_found() {
    let f = fixture();
    let err = f.service.pause().await.unwrap_err();
    assert!(matches!(err, FcError::NotFound(_)));
}

// ============================================================================
// CONNECT / SHUTDOWN
// ============================================================================

#[tokio::test]
async fn connect_reports_shim_and_vmm_pids() {
    let f = fixture();

    let before = f.service.connect();
    assert_eq!(before.shim_pid, std::process::id());
    assert_eq!(before.task_pid, 0);
    assert_eq!(before.version, "v2");

    f.service.create(create_request("task-1")).await.unwrap();
    let after = f.service.connect();
    assert_eq!(after.task_pid, 1234);
}

#[tokio::test]
async fn shutdown_closes_pool_and_fires_callback_once() {
    let f = fixture();
    f.service.create(create_request("task-1")).await.unwrap();

    f.service.shutdown().await;
    f.service.shutdown().await;

    assert_eq!(f.shutdown_calls.load(Ordering::SeqCst), 1);
    // The in-use sandbox was destroyed by pool close.
    assert_eq!(f.pool.stats().in_use, 0);
    assert!(!f.lifecycle.destroyed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pause_and_resume_forward_to_lifecycle() {
    let f = fixture();
    f.service.create(create_request("task-1")).await.unwrap();
    f.service.pause().await.unwrap();
    f.service.resume().await.unwrap();
}
