// SPDX-License-Identifier: MIT
//! Wire framings for JSON-RPC messages.
//!
//! Two framings exist: LSP stdio (`Content-Length` headers, CRLF-terminated,
//! used between the editor and the multiplexer and between the multiplexer
//! and each backend) and MCP stdio (one JSON value per line, used only on
//! the MCP tool surface). Both are interchangeable behind the [`Transport`]
//! trait, which the session layer consumes.

use crate::jsonrpc::Message;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Default cap on a single newline-delimited MCP message.
const DEFAULT_MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid framing: {0}")]
    InvalidFraming(String),
    #[error("truncated message")]
    Truncated,
    #[error("parsing message: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("end of stream")]
    Eof,
    #[error("transport closed")]
    Closed,
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional message stream. Writes from concurrent producers are
/// serialized internally; reads are expected from a single task.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read(&self) -> Result<Message, TransportError>;
    async fn write(&self, msg: &Message) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── LSP framing ─────────────────────────────────────────────────────────────

/// `Content-Length`-framed stream, per the LSP base protocol. Header names
/// are case-insensitive and unknown headers are ignored.
pub struct LspTransport {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl LspTransport {
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for LspTransport {
    async fn read(&self) -> Result<Message, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut content_length: Option<usize> = None;
        let mut saw_header = false;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                // EOF between messages is the normal shutdown signal; EOF
                // inside a header block is not.
                if saw_header {
                    return Err(TransportError::Truncated);
                }
                return Err(TransportError::Eof);
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            saw_header = true;

            let Some((name, value)) = line.split_once(':') else {
                return Err(TransportError::InvalidFraming(format!(
                    "invalid header line: {line}"
                )));
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let n: usize = value.trim().parse().map_err(|_| {
                    TransportError::InvalidFraming(format!(
                        "invalid Content-Length: {}",
                        value.trim()
                    ))
                })?;
                content_length = Some(n);
            }
        }

        let Some(len) = content_length else {
            return Err(TransportError::InvalidFraming(
                "missing Content-Length header".to_string(),
            ));
        };

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Truncated
            } else {
                TransportError::Io(e)
            }
        })?;

        Ok(serde_json::from_slice(&body)?)
    }

    async fn write(&self, msg: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let body = serde_json::to_vec(msg)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        let mut writer = self.writer.lock().await;
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
        Ok(())
    }
}

// ─── MCP framing ─────────────────────────────────────────────────────────────

/// Newline-delimited JSON stream, per the MCP stdio transport. Empty lines
/// are skipped on read; every write is a single line.
pub struct McpTransport {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    max_line: usize,
    closed: AtomicBool,
}

impl McpTransport {
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            max_line: DEFAULT_MAX_LINE,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }
}

#[async_trait]
impl Transport for McpTransport {
    async fn read(&self) -> Result<Message, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(TransportError::Eof);
            }
            if n > self.max_line {
                return Err(TransportError::InvalidFraming(format!(
                    "line exceeds {} bytes",
                    self.max_line
                )));
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(line)?);
        }
    }

    async fn write(&self, msg: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
