// SPDX-License-Identifier: MIT
//! The backend lifecycle pool.
//!
//! Each configured backend is one [`BackendInstance`] moving through
//! Idle → Starting → Running → Stopping → Stopped, with Failed reachable
//! from anywhere and restartable on the next demand. At most one start is
//! in flight per instance; concurrent demanders wait on the same outcome.
//! The instance lock is never held across external I/O — the Starting
//! marker is what excludes a second start while the lock is released for
//! the build, the spawn, and the initialize handshake.

use crate::config::BackendSpec;
use crate::jsonrpc::session::{Handler, Session};
use crate::lsp::{methods, InitializeResult, ServerCapabilities};
use crate::nix::{self, Executor, ProcessHandle};
use crate::transport::LspTransport;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a backend gets to answer `shutdown` and exit before being
/// killed.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
/// Poll interval for demanders waiting on another task's start.
const START_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::Idle => "idle",
            BackendState::Starting => "starting",
            BackendState::Running => "running",
            BackendState::Stopping => "stopping",
            BackendState::Stopped => "stopped",
            BackendState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("backend {0} is not running")]
    NotRunning(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub flake: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct InstanceInner {
    state: BackendState,
    session: Option<Arc<Session>>,
    handle: Option<ProcessHandle>,
    capabilities: Option<ServerCapabilities>,
    started_at: Option<Instant>,
    last_error: Option<String>,
    start_token: Option<CancellationToken>,
}

#[derive(Debug)]
pub struct BackendInstance {
    spec: BackendSpec,
    inner: Mutex<InstanceInner>,
}

impl BackendInstance {
    fn new(spec: BackendSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            inner: Mutex::new(InstanceInner {
                state: BackendState::Idle,
                session: None,
                handle: None,
                capabilities: None,
                started_at: None,
                last_error: None,
                start_token: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    pub async fn state(&self) -> BackendState {
        self.inner.lock().await.state
    }

    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        self.inner.lock().await.capabilities.clone()
    }

    /// The live session, or `NotRunning`.
    pub async fn session(&self) -> Result<Arc<Session>, PoolError> {
        let inner = self.inner.lock().await;
        if inner.state != BackendState::Running {
            return Err(PoolError::NotRunning(self.spec.name.clone()));
        }
        inner
            .session
            .clone()
            .ok_or_else(|| PoolError::NotRunning(self.spec.name.clone()))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let session = self.session().await?;
        session
            .notify(method, params)
            .await
            .with_context(|| format!("notifying {}", self.spec.name))
    }

    fn status_row(&self, inner: &InstanceInner) -> BackendStatus {
        BackendStatus {
            name: self.spec.name.clone(),
            flake: self.spec.flake.clone(),
            state: inner.state.to_string(),
            uptime_secs: inner.started_at.map(|t| t.elapsed().as_secs()),
            error: inner.last_error.clone(),
        }
    }
}

pub struct Pool {
    executor: Arc<dyn Executor>,
    /// Installed by the router; receives every backend-initiated request
    /// and notification for relaying to the client.
    handler: Arc<dyn Handler>,
    registry: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    order: Vec<String>,
    instances: HashMap<String, Arc<BackendInstance>>,
}

impl Pool {
    pub fn new(executor: Arc<dyn Executor>, handler: Arc<dyn Handler>) -> Self {
        Self {
            executor,
            handler,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Register a backend as Idle. Never starts a process.
    pub async fn register(&self, spec: BackendSpec) {
        let mut registry = self.registry.write().await;
        let name = spec.name.clone();
        if registry.instances.insert(name.clone(), BackendInstance::new(spec)).is_none() {
            registry.order.push(name);
        }
    }

    pub async fn get(&self, name: &str) -> Result<Arc<BackendInstance>, PoolError> {
        self.registry
            .read()
            .await
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))
    }

    /// Backend names in registration order.
    pub async fn names(&self) -> Vec<String> {
        self.registry.read().await.order.clone()
    }

    /// Registered instances in registration order.
    pub async fn instances(&self) -> Vec<Arc<BackendInstance>> {
        let registry = self.registry.read().await;
        registry
            .order
            .iter()
            .filter_map(|n| registry.instances.get(n).cloned())
            .collect()
    }

    pub async fn status(&self) -> Vec<BackendStatus> {
        let mut rows = Vec::new();
        for inst in self.instances().await {
            let inner = inst.inner.lock().await;
            rows.push(inst.status_row(&inner));
        }
        rows
    }

    /// The hot path: return the Running instance, waiting on a start
    /// already in flight or performing one if this caller gets there
    /// first. `init_params` drives the LSP initialize handshake; `None`
    /// skips it (the caller takes over the handshake).
    pub async fn get_or_start(
        &self,
        name: &str,
        init_params: Option<Value>,
    ) -> Result<Arc<BackendInstance>> {
        let inst = self.get(name).await?;

        enum Action {
            AlreadyRunning,
            WaitForStart,
            Claimed,
        }

        let action = {
            let mut inner = inst.inner.lock().await;
            match inner.state {
                BackendState::Running => Action::AlreadyRunning,
                BackendState::Starting | BackendState::Stopping => Action::WaitForStart,
                BackendState::Idle | BackendState::Stopped | BackendState::Failed => {
                    inner.state = BackendState::Starting;
                    inner.last_error = None;
                    Action::Claimed
                }
            }
        };

        match action {
            Action::AlreadyRunning => return Ok(inst),
            Action::WaitForStart => {
                self.wait_for_start(&inst).await?;
                return Ok(inst);
            }
            Action::Claimed => {}
        }

        match self.start(&inst, init_params).await {
            Ok(()) => Ok(inst),
            Err(e) => {
                let mut inner = inst.inner.lock().await;
                inner.state = BackendState::Failed;
                inner.last_error = Some(format!("{e:#}"));
                if let Some(handle) = inner.handle.as_mut() {
                    handle.kill();
                }
                if let Some(token) = inner.start_token.take() {
                    token.cancel();
                }
                inner.session = None;
                inner.handle = None;
                Err(e)
            }
        }
    }

    /// Wait for a start owned by another task. All waiters observe the
    /// same outcome: the Running instance or the recorded failure.
    async fn wait_for_start(&self, inst: &Arc<BackendInstance>) -> Result<()> {
        loop {
            tokio::time::sleep(START_POLL).await;
            let inner = inst.inner.lock().await;
            match inner.state {
                BackendState::Running => return Ok(()),
                BackendState::Failed => {
                    let cause = inner
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "start failed".to_string());
                    return Err(anyhow!("starting {}: {cause}", inst.spec.name));
                }
                BackendState::Starting | BackendState::Stopping => continue,
                BackendState::Idle | BackendState::Stopped => {
                    return Err(anyhow!("backend {} was stopped", inst.spec.name));
                }
            }
        }
    }

    /// The start sequence. The caller holds the Starting claim; the
    /// instance lock is only taken for brief field updates.
    async fn start(&self, inst: &Arc<BackendInstance>, init_params: Option<Value>) -> Result<()> {
        let spec = inst.spec.clone();
        let token = CancellationToken::new();
        inst.inner.lock().await.start_token = Some(token.clone());

        let bin = self
            .executor
            .build(&spec.flake, &spec.binary)
            .await
            .with_context(|| format!("building {}", spec.name))?;

        let mut proc = self
            .executor
            .execute(&bin, &spec.args)
            .await
            .with_context(|| format!("executing {}", spec.name))?;

        if let Some(stderr) = proc.stderr.take() {
            nix::spawn_stderr_logger(spec.name.clone(), stderr);
        }

        let transport = Arc::new(LspTransport::new(proc.stdout, proc.stdin));
        let session = Session::new(transport, Some(self.handler.clone()));

        {
            let mut inner = inst.inner.lock().await;
            inner.session = Some(session.clone());
            inner.handle = Some(proc.handle);
        }

        // Supervise the read loop for the lifetime of the instance. The
        // token outlives the first demander on purpose: it is cancelled
        // only when the instance stops.
        let run_session = session.clone();
        let run_inst = inst.clone();
        tokio::spawn(async move {
            // Exits on backend EOF, a read error, or session close (stop).
            let result = run_session.run().await;
            let mut inner = run_inst.inner.lock().await;
            if matches!(inner.state, BackendState::Starting | BackendState::Running) {
                warn!(backend = %run_inst.spec.name, "backend exited unexpectedly");
                inner.state = BackendState::Failed;
                inner.last_error = Some(match result {
                    Ok(()) => "backend exited".to_string(),
                    Err(e) => format!("{e:#}"),
                });
                if let Some(handle) = inner.handle.as_mut() {
                    handle.kill();
                }
                inner.session = None;
                inner.handle = None;
            }
        });

        if let Some(params) = init_params {
            let result = session
                .call_as(session.next_id(), methods::INITIALIZE, Some(params), Some(&token))
                .await
                .with_context(|| format!("initializing {}", spec.name))?;
            let init: InitializeResult = serde_json::from_value(result)
                .with_context(|| format!("parsing initialize result from {}", spec.name))?;
            inst.inner.lock().await.capabilities = Some(init.capabilities);
            session
                .notify(methods::INITIALIZED, Some(json!({})))
                .await
                .with_context(|| format!("sending initialized to {}", spec.name))?;
        }

        let mut inner = inst.inner.lock().await;
        inner.state = BackendState::Running;
        inner.started_at = Some(Instant::now());
        info!(backend = %spec.name, "running");
        Ok(())
    }

    /// Orderly stop: shutdown request (bounded), exit notification, close,
    /// then wait for the process with the same bound before killing it.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let inst = self.get(name).await?;

        let (session, handle, token) = {
            let mut inner = inst.inner.lock().await;
            if inner.state != BackendState::Running {
                return Ok(());
            }
            inner.state = BackendState::Stopping;
            (
                inner.session.clone(),
                inner.handle.take(),
                inner.start_token.take(),
            )
        };

        if let Some(session) = &session {
            let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, session.call(methods::SHUTDOWN, None))
                .await;
            let _ = session.notify(methods::EXIT, None).await;
            session.close().await;
        }
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(mut handle) = handle {
            if !handle.wait_timeout(SHUTDOWN_DEADLINE).await {
                warn!(backend = name, "did not exit after shutdown; killing");
                handle.kill();
            }
        }

        let mut inner = inst.inner.lock().await;
        inner.state = BackendState::Stopped;
        inner.session = None;
        inner.handle = None;
        inner.capabilities = None;
        inner.started_at = None;
        info!(backend = name, "stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        for name in self.names().await {
            if let Err(e) = self.stop(&name).await {
                warn!(backend = %name, err = %format!("{e:#}"), "stop failed");
            }
        }
    }

    /// Instances currently in the Running state, registration order.
    pub async fn running(&self) -> Vec<Arc<BackendInstance>> {
        let mut out = Vec::new();
        for inst in self.instances().await {
            if inst.state().await == BackendState::Running {
                out.push(inst);
            }
        }
        out
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::Message;
    use crate::nix::Process;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncRead, AsyncWrite};

    fn spec(name: &str) -> BackendSpec {
        BackendSpec {
            name: name.into(),
            flake: format!("nixpkgs#{name}"),
            binary: String::new(),
            args: vec![],
            extensions: vec![],
            patterns: vec![],
            language_ids: vec![],
        }
    }

    struct DropHandler;

    #[async_trait]
    impl Handler for DropHandler {
        async fn handle(&self, _msg: Message) -> Result<Option<Message>> {
            Ok(None)
        }
    }

    /// Executor whose "processes" are in-memory pipes served by a minimal
    /// scripted LSP server.
    struct FakeExecutor {
        builds: AtomicUsize,
        spawns: AtomicUsize,
        fail_build: bool,
    }

    impl FakeExecutor {
        fn new() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                spawns: AtomicUsize::new(0),
                fail_build: false,
            }
        }

        fn failing() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                spawns: AtomicUsize::new(0),
                fail_build: true,
            }
        }
    }

    fn boxed<T: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
        io: T,
    ) -> (
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    ) {
        let (r, w) = tokio::io::split(io);
        (Box::new(r), Box::new(w))
    }

    /// Serve a minimal LSP server on one end of a pipe: answers
    /// `initialize` and `shutdown`, ignores everything else.
    fn serve_fake_lsp(io: tokio::io::DuplexStream) {
        let (r, w) = boxed(io);
        let transport = Arc::new(LspTransport::new(r, w));
        tokio::spawn(async move {
            loop {
                let msg = match transport.read().await {
                    Ok(m) => m,
                    Err(_) => return,
                };
                if !msg.is_request() {
                    continue;
                }
                let id = msg.id.clone().unwrap();
                let reply = match msg.method() {
                    "initialize" => Message::response(
                        id,
                        json!({ "capabilities": { "hoverProvider": true } }),
                    ),
                    "shutdown" => Message::response(id, Value::Null),
                    _ => Message::response(id, Value::Null),
                };
                if transport.write(&reply).await.is_err() {
                    return;
                }
            }
        });
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn build(&self, flake: &str, _binary: &str) -> Result<std::path::PathBuf> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_build {
                anyhow::bail!("nix build {flake} failed: no such flake");
            }
            // Simulate build latency so concurrent demanders overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(std::path::PathBuf::from("/nix/store/fake/bin/lsp"))
        }

        async fn execute(&self, _bin: &std::path::Path, _args: &[String]) -> Result<Process> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let (ours, theirs) = duplex(64 * 1024);
            serve_fake_lsp(theirs);
            let (stdout, stdin) = boxed(ours);
            Ok(Process {
                stdin,
                stdout,
                stderr: None,
                handle: ProcessHandle::detached(),
            })
        }
    }

    fn pool_with(executor: FakeExecutor) -> (Arc<Pool>, Arc<FakeExecutor>) {
        let executor = Arc::new(executor);
        let pool = Arc::new(Pool::new(executor.clone(), Arc::new(DropHandler)));
        (pool, executor)
    }

    #[tokio::test]
    async fn get_or_start_runs_the_handshake() {
        let (pool, executor) = pool_with(FakeExecutor::new());
        pool.register(spec("gopls")).await;

        let inst = pool
            .get_or_start("gopls", Some(json!({ "processId": 1 })))
            .await
            .unwrap();

        assert_eq!(inst.state().await, BackendState::Running);
        let caps = inst.capabilities().await.unwrap();
        assert_eq!(caps.hover_provider, Some(Value::Bool(true)));
        assert_eq!(executor.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_demands_spawn_exactly_once() {
        let (pool, executor) = pool_with(FakeExecutor::new());
        pool.register(spec("gopls")).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.get_or_start("gopls", Some(json!({ "processId": 1 })))
                    .await
                    .map(|i| i.name().to_string())
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "gopls");
        }
        assert_eq!(executor.builds.load(Ordering::SeqCst), 1);
        assert_eq!(executor.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn build_failure_marks_failed_and_is_restartable() {
        let (pool, _executor) = pool_with(FakeExecutor::failing());
        pool.register(spec("gopls")).await;

        let err = pool.get_or_start("gopls", None).await.unwrap_err();
        assert!(format!("{err:#}").contains("no such flake"));

        let inst = pool.get("gopls").await.unwrap();
        assert_eq!(inst.state().await, BackendState::Failed);
        // Failed is re-demandable: the next attempt claims the start again
        // (and fails the same way with this executor).
        assert!(pool.get_or_start("gopls", None).await.is_err());
    }

    #[tokio::test]
    async fn unknown_backend_is_an_error() {
        let (pool, _executor) = pool_with(FakeExecutor::new());
        let err = pool.get_or_start("nope", None).await.unwrap_err();
        assert!(err.to_string().contains("unknown backend"));
    }

    #[tokio::test]
    async fn stop_clears_resources_and_allows_restart() {
        let (pool, executor) = pool_with(FakeExecutor::new());
        pool.register(spec("gopls")).await;

        pool.get_or_start("gopls", Some(json!({ "processId": 1 })))
            .await
            .unwrap();
        pool.stop("gopls").await.unwrap();

        let inst = pool.get("gopls").await.unwrap();
        assert_eq!(inst.state().await, BackendState::Stopped);
        assert!(inst.capabilities().await.is_none());
        assert!(inst.session().await.is_err());

        pool.get_or_start("gopls", Some(json!({ "processId": 1 })))
            .await
            .unwrap();
        assert_eq!(inst.state().await, BackendState::Running);
        assert_eq!(executor.spawns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_on_idle_backend_is_a_no_op() {
        let (pool, _executor) = pool_with(FakeExecutor::new());
        pool.register(spec("gopls")).await;
        pool.stop("gopls").await.unwrap();
        let inst = pool.get("gopls").await.unwrap();
        assert_eq!(inst.state().await, BackendState::Idle);
    }

    #[tokio::test]
    async fn status_reports_registration_order() {
        let (pool, _executor) = pool_with(FakeExecutor::new());
        pool.register(spec("gopls")).await;
        pool.register(spec("pyright")).await;

        let rows = pool.status().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "gopls");
        assert_eq!(rows[0].state, "idle");
        assert_eq!(rows[1].name, "pyright");
    }

    #[tokio::test]
    async fn session_on_non_running_instance_is_not_running_error() {
        let (pool, _executor) = pool_with(FakeExecutor::new());
        pool.register(spec("gopls")).await;
        let inst = pool.get("gopls").await.unwrap();
        match inst.session().await {
            Err(PoolError::NotRunning(name)) => assert_eq!(name, "gopls"),
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }
}
