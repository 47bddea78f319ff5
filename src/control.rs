// SPDX-License-Identifier: MIT
//! The control plane: a Unix-domain socket beside the LSP stdio channel.
//!
//! One JSON command object per line in, one JSON response per line out.
//! The CLI subcommands (`list`, `status`, `start`, `stop`) are thin
//! wrappers over [`ControlClient`].

use crate::config::Config;
use crate::router::Router;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(data: Option<Value>) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Bind the control socket. Failure here is a startup failure — the caller
/// must not serve without a control plane.
pub fn bind(path: &Path) -> Result<UnixListener> {
    // A previous run may have left the socket file behind.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding control socket {}", path.display()))
}

/// Serve an already-bound control socket until `shutdown`.
pub async fn serve(
    listener: UnixListener,
    path: PathBuf,
    config: Arc<Config>,
    router: Arc<Router>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(socket = %path.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            conn = listener.accept() => {
                let (stream, _) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "control accept error");
                        continue;
                    }
                };
                let config = config.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, config, router).await {
                        debug!(err = %format!("{e:#}"), "control connection ended");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    info!("control socket stopped");
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    config: Arc<Config>,
    router: Arc<Router>,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(cmd) => dispatch(cmd, &config, &router).await,
            Err(e) => Response::err(format!("invalid command: {e}")),
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        write.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(cmd: Command, config: &Config, router: &Router) -> Response {
    debug!(kind = %cmd.kind, name = ?cmd.name, "control command");
    match cmd.kind.as_str() {
        "list" => match serde_json::to_value(&config.lsps) {
            Ok(data) => Response::ok(Some(data)),
            Err(e) => Response::err(e.to_string()),
        },
        "status" => {
            let rows = router.pool().status().await;
            match serde_json::to_value(rows) {
                Ok(data) => Response::ok(Some(data)),
                Err(e) => Response::err(e.to_string()),
            }
        }
        "start" => {
            let Some(name) = cmd.name else {
                return Response::err("start requires a name");
            };
            let init = router.backend_init_params().await;
            match router.pool().get_or_start(&name, Some(init)).await {
                Ok(_) => Response::ok(None),
                Err(e) => Response::err(format!("{e:#}")),
            }
        }
        "stop" => {
            let Some(name) = cmd.name else {
                return Response::err("stop requires a name");
            };
            match router.pool().stop(&name).await {
                Ok(()) => Response::ok(None),
                Err(e) => Response::err(format!("{e:#}")),
            }
        }
        other => Response::err(format!("unknown command type: {other}")),
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// CLI-side connection to a running `lux serve`.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to {} (is `lux serve` running?)", path.display()))?;
        Ok(Self { stream })
    }

    pub async fn request(&mut self, cmd: &Command) -> Result<Response> {
        let mut line = serde_json::to_string(cmd)?;
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;

        let (read, _) = self.stream.split();
        let mut lines = BufReader::new(read).lines();
        let reply = lines
            .next_line()
            .await?
            .context("server closed the control connection")?;
        serde_json::from_str(&reply).context("parsing control response")
    }

    pub async fn status(&mut self) -> Result<Value> {
        self.expect_data(Command {
            kind: "status".into(),
            name: None,
        })
        .await
    }

    pub async fn list(&mut self) -> Result<Value> {
        self.expect_data(Command {
            kind: "list".into(),
            name: None,
        })
        .await
    }

    pub async fn start(&mut self, name: &str) -> Result<()> {
        self.expect_ok(Command {
            kind: "start".into(),
            name: Some(name.to_string()),
        })
        .await
    }

    pub async fn stop(&mut self, name: &str) -> Result<()> {
        self.expect_ok(Command {
            kind: "stop".into(),
            name: Some(name.to_string()),
        })
        .await
    }

    async fn expect_ok(&mut self, cmd: Command) -> Result<()> {
        let resp = self.request(&cmd).await?;
        if !resp.ok {
            anyhow::bail!("{}", resp.error.unwrap_or_else(|| "command failed".into()));
        }
        Ok(())
    }

    async fn expect_data(&mut self, cmd: Command) -> Result<Value> {
        let resp = self.request(&cmd).await?;
        if !resp.ok {
            anyhow::bail!("{}", resp.error.unwrap_or_else(|| "command failed".into()));
        }
        Ok(resp.data.unwrap_or(Value::Null))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let cmd = Command {
            kind: "start".into(),
            name: Some("gopls".into()),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"type":"start","name":"gopls"}"#);

        let back: Command = serde_json::from_str(r#"{"type":"status"}"#).unwrap();
        assert_eq!(back.kind, "status");
        assert!(back.name.is_none());
    }

    #[test]
    fn response_wire_format() {
        let ok = serde_json::to_string(&Response::ok(None)).unwrap();
        assert_eq!(ok, r#"{"ok":true}"#);
        let err = serde_json::to_string(&Response::err("boom")).unwrap();
        assert_eq!(err, r#"{"ok":false,"error":"boom"}"#);
    }
}
