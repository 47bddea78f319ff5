// SPDX-License-Identifier: MIT
//! Building backend executables from Nix flakes and spawning them.
//!
//! The pool talks to an [`Executor`]: `build` turns a flake reference into
//! an absolute executable path and `execute` spawns it with piped stdio.
//! [`NixExecutor`] shells out to `nix build`; tests substitute their own
//! executor and hand back in-memory pipes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait Executor: Send + Sync {
    /// Resolve a flake reference to an absolute executable path. `binary`
    /// selects among multiple executables in the built artifact; empty
    /// means the first one found under `bin/`.
    async fn build(&self, flake: &str, binary: &str) -> Result<PathBuf>;

    /// Spawn the executable with piped stdio.
    async fn execute(&self, bin: &Path, args: &[String]) -> Result<Process>;
}

/// A spawned backend process. The streams are boxed so the pool is
/// indifferent to whether they come from a real child or an in-memory pair.
pub struct Process {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub handle: ProcessHandle,
}

/// Kill/wait handle, detached from the stdio streams.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Option<tokio::process::Child>,
}

impl ProcessHandle {
    pub fn detached() -> Self {
        Self { child: None }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn kill(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
    }

    /// Wait for exit, up to `deadline`. Returns true if the process exited
    /// in time (or there is no real process to wait for).
    pub async fn wait_timeout(&mut self, deadline: Duration) -> bool {
        let Some(child) = &mut self.child else {
            return true;
        };
        tokio::time::timeout(deadline, child.wait()).await.is_ok()
    }
}

// ─── NixExecutor ─────────────────────────────────────────────────────────────

/// Production executor: `nix build --no-link --print-out-paths <flake>`,
/// with the resolved path memoized per (flake, binary).
pub struct NixExecutor {
    cache: Mutex<HashMap<(String, String), PathBuf>>,
}

impl NixExecutor {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for NixExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for NixExecutor {
    async fn build(&self, flake: &str, binary: &str) -> Result<PathBuf> {
        let key = (flake.to_string(), binary.to_string());
        if let Some(path) = self.cache.lock().await.get(&key) {
            debug!(flake, path = %path.display(), "build cache hit");
            return Ok(path.clone());
        }

        info!(flake, "building");
        let output = tokio::process::Command::new("nix")
            .args(["build", "--no-link", "--print-out-paths", flake])
            .output()
            .await
            .context("running nix build")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("nix build {flake} failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let store_path = stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .with_context(|| format!("nix build {flake} printed no out path"))?;

        let bin = find_executable(Path::new(store_path), binary)?;
        self.cache.lock().await.insert(key, bin.clone());
        Ok(bin)
    }

    async fn execute(&self, bin: &Path, args: &[String]) -> Result<Process> {
        let mut child = tokio::process::Command::new(bin)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", bin.display()))?;

        let stdin = child.stdin.take().context("child stdin not piped")?;
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        debug!(bin = %bin.display(), pid = child.id(), "spawned");
        Ok(Process {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Some(Box::new(stderr)),
            handle: ProcessHandle { child: Some(child) },
        })
    }
}

/// Resolve which executable to run inside a built store path.
///
/// Empty `binary` picks the first executable regular file in
/// `<store>/bin/`; a name resolves under `bin/`; a name containing `/`
/// resolves relative to the store path. `..` segments are rejected.
pub fn find_executable(store_path: &Path, binary: &str) -> Result<PathBuf> {
    if binary.is_empty() {
        let bin_dir = store_path.join("bin");
        let entries = std::fs::read_dir(&bin_dir)
            .with_context(|| format!("reading {}", bin_dir.display()))?;
        let mut names: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        names.sort();
        for path in names {
            if is_executable_file(&path) {
                return Ok(path);
            }
        }
        bail!("no executable found in {}", bin_dir.display());
    }

    let rel = Path::new(binary);
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("binary {binary:?} contains a path traversal");
    }

    let candidate = if binary.contains('/') {
        store_path.join(rel)
    } else {
        store_path.join("bin").join(rel)
    };

    let meta = std::fs::metadata(&candidate)
        .with_context(|| format!("binary {binary:?} not found"))?;
    if meta.is_dir() {
        bail!("binary {binary:?} is a directory");
    }
    if !is_executable_file(&candidate) {
        bail!("binary {binary:?} is not executable");
    }
    Ok(candidate)
}

/// Drain a backend's stderr, re-logging each line prefixed with the
/// backend name. Runs until the stream closes.
pub fn spawn_stderr_logger(name: String, stderr: Box<dyn AsyncRead + Send + Unpin>) {
    use tokio::io::AsyncBufReadExt;
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "backend", "[{name}] {line}");
        }
    });
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
