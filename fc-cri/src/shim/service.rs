//! The per-sandbox task service.
//!
//! One instance per shim process. Maps task operations onto pool
//! acquisition, agent RPCs, and release:
//!
//! ```text
//! Create -> pool.acquire -> agent.connect -> agent.create_container
//! Start  -> agent.start_container
//! Kill   -> agent.stop_container
//! Delete -> agent.remove_container -> pool.release (init only)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fc_cri_shared::protocol::CreateContainerParams;
use fc_cri_shared::{FcError, FcResult};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentClient;
use crate::config::AgentConfig;
use crate::domain::{DriveSpec, SandboxRef, VmConfig};
use crate::metrics::RuntimeMetrics;
use crate::shim::events::{spawn_forwarder, EventPublisher, EventQueue, TaskEvent, EVENT_BUFFER};
use crate::shim::task::*;
use crate::vm::{Pool, VmLifecycle};

/// Stop window handed to the agent when killing the init process.
const KILL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Task API version reported by `connect`.
const TASK_API_VERSION: &str = "v2";

/// State of one process (init or exec) owned by the shim.
pub(crate) struct ProcessState {
    id: String,
    container_id: String,
    stdin: String,
    stdout: String,
    stderr: String,
    terminal: bool,
    pid: AtomicU32,
    exit_status: AtomicU32,
    exited_at: Mutex<Option<DateTime<Utc>>>,
    exit_notify: Notify,
}

impl ProcessState {
    fn new(id: String, container_id: String, request: &CreateTaskRequest) -> Self {
        Self {
            id,
            container_id,
            stdin: request.stdin.clone(),
            stdout: request.stdout.clone(),
            stderr: request.stderr.clone(),
            terminal: request.terminal,
            pid: AtomicU32::new(0),
            exit_status: AtomicU32::new(0),
            exited_at: Mutex::new(None),
            exit_notify: Notify::new(),
        }
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn exited_at(&self) -> Option<DateTime<Utc>> {
        *self.exited_at.lock().unwrap()
    }

    fn exit_status(&self) -> u32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    /// Record an exit exactly once and wake waiters.
    fn set_exited(&self, exit_status: u32) {
        {
            let mut exited = self.exited_at.lock().unwrap();
            if exited.is_some() {
                return;
            }
            // Status must be visible before the timestamp that waiters poll.
            self.exit_status.store(exit_status, Ordering::SeqCst);
            *exited = Some(Utc::now());
        }
        self.exit_notify.notify_waiters();
    }

    /// exited ⇒ Stopped; running pid ⇒ Running; otherwise Created.
    fn status(&self) -> TaskStatus {
        if self.exited_at().is_some() {
            TaskStatus::Stopped
        } else if self.pid() > 0 {
            TaskStatus::Running
        } else {
            TaskStatus::Created
        }
    }
}

/// The task service backing one shim process.
pub struct TaskService {
    id: String,
    namespace: String,
    bundle: Mutex<String>,

    pool: Arc<Pool>,
    lifecycle: Arc<dyn VmLifecycle>,
    agent_config: AgentConfig,
    default_vm_config: VmConfig,

    sandbox: Mutex<Option<SandboxRef>>,
    agent: Mutex<Option<Arc<AgentClient>>>,
    processes: Mutex<HashMap<String, Arc<ProcessState>>>,

    events: Arc<EventQueue>,
    cancel: CancellationToken,
    shutdown_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    metrics: RuntimeMetrics,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        pool: Arc<Pool>,
        lifecycle: Arc<dyn VmLifecycle>,
        agent_config: AgentConfig,
        default_vm_config: VmConfig,
        publisher: Arc<dyn EventPublisher>,
        shutdown: Box<dyn FnOnce() + Send>,
        metrics: RuntimeMetrics,
    ) -> Arc<Self> {
        let id = id.into();
        let namespace = namespace.into();
        tracing::info!(shim_id = %id, namespace = %namespace, "creating task service");

        let events = Arc::new(EventQueue::new(EVENT_BUFFER));
        let cancel = CancellationToken::new();
        spawn_forwarder(events.clone(), publisher, cancel.child_token());
        pool.maybe_prewarm();

        Arc::new(Self {
            id,
            namespace,
            bundle: Mutex::new(String::new()),
            pool,
            lifecycle,
            agent_config,
            default_vm_config,
            sandbox: Mutex::new(None),
            agent: Mutex::new(None),
            processes: Mutex::new(HashMap::new()),
            events,
            cancel,
            shutdown_cb: Mutex::new(Some(shutdown)),
            metrics,
        })
    }

    pub fn shim_id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create the task: acquire a VM, connect the agent, create the init
    /// container inside the guest. Returns the VMM pid.
    pub async fn create(&self, request: CreateTaskRequest) -> FcResult<CreateTaskResponse> {
        tracing::info!(task_id = %request.task_id, bundle = %request.bundle, "creating task");

        let mut vm_config = self.default_vm_config.clone();
        if let Some(rootfs) = request.rootfs.first() {
            vm_config.root_drive = Some(DriveSpec::root(rootfs.clone()));
        }

        let sandbox = self.pool.acquire(vm_config).await?;
        let (sandbox_pid, vsock_path, cid) = {
            let sb = sandbox.lock().unwrap();
            (sb.pid, sb.vsock_path.clone(), sb.vsock_cid)
        };

        let agent = Arc::new(AgentClient::new(self.agent_config.clone()));
        if let Err(err) = agent
            .connect(&vsock_path, cid, self.agent_config.vsock_port)
            .await
        {
            // No leaked VM behind an unreachable agent.
            self.metrics.inc_agent_connect_errors();
            self.pool.discard(&sandbox).await;
            return Err(err);
        }

        let created = agent
            .create_container(&CreateContainerParams {
                id: request.task_id.clone(),
                bundle: request.bundle.clone(),
                stdin: !request.stdin.is_empty(),
                stdout: !request.stdout.is_empty(),
                stderr: !request.stderr.is_empty(),
                terminal: request.terminal,
            })
            .await;
        if let Err(err) = created {
            agent.close().await;
            self.pool.discard(&sandbox).await;
            return Err(err);
        }
        self.metrics.inc_containers_created();

        sandbox.lock().unwrap().agent = Some(agent.clone());
        *self.sandbox.lock().unwrap() = Some(sandbox);
        *self.agent.lock().unwrap() = Some(agent);
        *self.bundle.lock().unwrap() = request.bundle.clone();

        let process = Arc::new(ProcessState::new(
            request.task_id.clone(),
            request.task_id.clone(),
            &request,
        ));
        self.processes
            .lock()
            .unwrap()
            .insert(request.task_id.clone(), process);

        self.events.push(TaskEvent::Created {
            task_id: request.task_id,
            pid: sandbox_pid,
        });
        Ok(CreateTaskResponse { pid: sandbox_pid })
    }

    /// Start a created process; returns the guest-side pid.
    pub async fn start(&self, request: StartRequest) -> FcResult<StartResponse> {
        tracing::info!(task_id = %request.task_id, exec_id = %request.exec_id, "starting task");

        let process = self.process(&request.task_id, &request.exec_id)?;
        let agent = self.agent()?;

        let pid = agent.start_container(&process.container_id).await?;
        process.pid.store(pid, Ordering::SeqCst);

        self.events.push(TaskEvent::Started {
            task_id: process.id.clone(),
            pid,
        });
        Ok(StartResponse { pid })
    }

    /// Signal a process. Maps onto a guest-side container stop with a 30 s
    /// window; the agent returns once the process is gone.
    pub async fn kill(&self, request: KillRequest) -> FcResult<()> {
        tracing::info!(task_id = %request.task_id, signal = request.signal, "killing task");

        let process = self.process(&request.task_id, &request.exec_id)?;
        let agent = self.agent()?;

        agent
            .stop_container(&process.container_id, KILL_STOP_TIMEOUT)
            .await?;

        // stop_container returns after the guest process is gone.
        let exit_status = if request.signal != 0 {
            128 + request.signal
        } else {
            0
        };
        process.set_exited(exit_status);
        self.events.push(TaskEvent::Exited {
            task_id: process.id.clone(),
            exit_status,
        });
        Ok(())
    }

    /// Remove a process. Deleting the init process releases the sandbox
    /// back to the pool.
    pub async fn delete(&self, request: DeleteRequest) -> FcResult<DeleteResponse> {
        tracing::info!(task_id = %request.task_id, exec_id = %request.exec_id, "deleting task");

        let process = self.process(&request.task_id, &request.exec_id)?;

        if let Ok(agent) = self.agent() {
            if let Err(err) = agent.remove_container(&process.container_id).await {
                tracing::warn!(error = %err, "error removing container");
            }
        }

        let key = self.process_key(&request.task_id, &request.exec_id);
        self.processes.lock().unwrap().remove(&key);

        if request.exec_id.is_empty() {
            let sandbox = self.sandbox.lock().unwrap().take();
            if let Some(sandbox) = sandbox {
                self.pool.release(&sandbox).await;
            }
            *self.agent.lock().unwrap() = None;
        }

        self.events.push(TaskEvent::Deleted {
            task_id: process.id.clone(),
        });
        Ok(DeleteResponse {
            pid: process.pid(),
            exit_status: process.exit_status(),
            exited_at: process.exited_at(),
        })
    }

    pub fn state(&self, request: StateRequest) -> FcResult<StateResponse> {
        let process = self.process(&request.task_id, &request.exec_id)?;
        Ok(StateResponse {
            id: process.id.clone(),
            bundle: self.bundle.lock().unwrap().clone(),
            pid: process.pid(),
            status: process.status(),
            stdin: process.stdin.clone(),
            stdout: process.stdout.clone(),
            stderr: process.stderr.clone(),
            terminal: process.terminal,
            exit_status: process.exit_status(),
            exited_at: process.exited_at(),
        })
    }

    /// Block until the process exits. Dropping the future cancels the wait.
    pub async fn wait(&self, request: WaitRequest) -> FcResult<WaitResponse> {
        let process = self.process(&request.task_id, &request.exec_id)?;
        loop {
            let notified = process.exit_notify.notified();
            if let Some(exited_at) = process.exited_at() {
                return Ok(WaitResponse {
                    exit_status: process.exit_status(),
                    exited_at: Some(exited_at),
                });
            }
            notified.await;
        }
    }

    pub async fn stats(&self, request: StatsRequest) -> FcResult<StatsResponse> {
        let agent = self.agent()?;
        let stats = agent.get_stats(&request.task_id).await?;
        Ok(StatsResponse {
            cpu_usage_ns: stats.cpu_usage,
            memory_usage_bytes: stats.memory_usage,
            read_bytes: stats.read_bytes,
            write_bytes: stats.write_bytes,
        })
    }

    pub fn pids(&self, task_id: &str) -> FcResult<PidsResponse> {
        let processes = self.processes.lock().unwrap();
        let pids = processes
            .values()
            .filter(|p| p.container_id == task_id)
            .map(|p| p.pid())
            .collect();
        Ok(PidsResponse { pids })
    }

    pub async fn pause(&self) -> FcResult<()> {
        let sandbox = self.current_sandbox()?;
        self.lifecycle.pause_vm(&sandbox).await
    }

    pub async fn resume(&self) -> FcResult<()> {
        let sandbox = self.current_sandbox()?;
        self.lifecycle.resume_vm(&sandbox).await
    }

    pub fn connect(&self) -> ConnectResponse {
        let task_pid = self
            .sandbox
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.lock().unwrap().pid)
            .unwrap_or(0);
        ConnectResponse {
            shim_pid: std::process::id(),
            task_pid,
            version: TASK_API_VERSION,
        }
    }

    /// Tear the service down: stop loops, close the pool, and fire the
    /// embedding shim's shutdown callback (at most once).
    pub async fn shutdown(&self) {
        tracing::info!(shim_id = %self.id, "shutdown requested");
        self.cancel.cancel();
        self.pool.close().await;

        let callback = self.shutdown_cb.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    // Not supported in v1; the agent protocol has no counterpart yet.

    pub fn exec(&self) -> FcResult<()> {
        Err(FcError::NotImplemented("exec".into()))
    }

    pub fn checkpoint(&self) -> FcResult<()> {
        Err(FcError::NotImplemented("checkpoint".into()))
    }

    pub fn update(&self) -> FcResult<()> {
        Err(FcError::NotImplemented("update".into()))
    }

    pub fn resize_pty(&self) -> FcResult<()> {
        Err(FcError::NotImplemented("resize_pty".into()))
    }

    pub fn close_io(&self) -> FcResult<()> {
        Err(FcError::NotImplemented("close_io".into()))
    }

    // -- internals ----------------------------------------------------------

    fn process_key(&self, task_id: &str, exec_id: &str) -> String {
        if exec_id.is_empty() {
            task_id.to_string()
        } else {
            exec_id.to_string()
        }
    }

    fn process(&self, task_id: &str, exec_id: &str) -> FcResult<Arc<ProcessState>> {
        let key = self.process_key(task_id, exec_id);
        self.processes
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| FcError::NotFound(format!("process {}", key)))
    }

    fn agent(&self) -> FcResult<Arc<AgentClient>> {
        self.agent
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FcError::NotFound("no agent connection".into()))
    }

    fn current_sandbox(&self) -> FcResult<SandboxRef> {
        self.sandbox
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FcError::NotFound("no sandbox".into()))
    }
}
