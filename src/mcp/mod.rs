// SPDX-License-Identifier: MIT
//! `lux mcp`: the LSP fleet re-exposed as MCP tools over stdio.
//!
//! MCP uses newline-delimited JSON-RPC rather than LSP's header framing;
//! otherwise the envelope is the same. The server answers `initialize`,
//! `tools/list`, and `tools/call`, and drives backends through the same
//! pool and matcher set as the LSP surface.

pub mod bridge;
pub mod tools;

use crate::config::Config;
use crate::filematch::MatcherSet;
use crate::jsonrpc::session::Handler;
use crate::jsonrpc::{Id, Message, RpcError, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::nix::NixExecutor;
use crate::pool::Pool;
use crate::transport::{McpTransport, Transport, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bridge::Bridge;
use serde_json::{json, Value};
use std::sync::Arc;
use tools::ToolRegistry;
use tracing::{debug, info};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Backend-initiated traffic has no editor to go to on this surface;
/// notifications are dropped and requests get a MethodNotFound.
struct NoClient;

#[async_trait]
impl Handler for NoClient {
    async fn handle(&self, msg: Message) -> Result<Option<Message>> {
        if msg.is_request() {
            let id = msg.id.clone().unwrap_or(Id::Null);
            return Ok(Some(Message::error_response(
                id,
                RpcError::new(METHOD_NOT_FOUND, "no client on the MCP surface"),
            )));
        }
        Ok(None)
    }
}

pub struct McpServer {
    transport: McpTransport,
    registry: ToolRegistry,
    bridge: Bridge,
}

impl McpServer {
    pub async fn new(config: &Config) -> Result<McpServer> {
        let mut matchers = MatcherSet::new();
        for spec in &config.lsps {
            matchers
                .add(&spec.name, &spec.extensions, &spec.patterns, &spec.language_ids)
                .with_context(|| format!("configuring {}", spec.name))?;
        }

        let pool = Arc::new(Pool::new(Arc::new(NixExecutor::new()), Arc::new(NoClient)));
        for spec in &config.lsps {
            pool.register(spec.clone()).await;
        }

        let transport = McpTransport::new(
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        );

        Ok(McpServer {
            transport,
            registry: ToolRegistry::new(),
            bridge: Bridge::new(pool, matchers),
        })
    }

    pub async fn run(&self) -> Result<()> {
        info!(version = env!("CARGO_PKG_VERSION"), "lux serving MCP on stdio");
        loop {
            let msg = match self.transport.read().await {
                Ok(msg) => msg,
                Err(TransportError::Eof) => break,
                Err(e) => return Err(anyhow::Error::new(e).context("reading MCP message")),
            };

            if msg.is_notification() {
                debug!(method = msg.method(), "mcp notification");
                continue;
            }
            if !msg.is_request() {
                continue;
            }

            let id = msg.id.clone().unwrap_or(Id::Null);
            let reply = self.dispatch(msg).await;
            let out = match reply {
                Ok(result) => Message::response(id, result),
                Err(err) => Message::error_response(id, err),
            };
            self.transport.write(&out).await?;
        }

        self.bridge.shutdown().await;
        info!("mcp stopped");
        Ok(())
    }

    async fn dispatch(&self, msg: Message) -> Result<Value, RpcError> {
        match msg.method() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "lux", "version": env!("CARGO_PKG_VERSION") },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.registry.list() })),
            "tools/call" => {
                let params = msg.params.unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::new(INVALID_PARAMS, "missing tool name"))?
                    .to_string();
                let args = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let result = self.registry.call(&self.bridge, &name, args).await;
                serde_json::to_value(result)
                    .map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }
}

/// Entry point for `lux mcp`.
pub async fn serve(config: Config) -> Result<()> {
    let server = McpServer::new(&config).await?;
    server.run().await
}
