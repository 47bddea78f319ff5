//! The LSP side of the MCP surface.
//!
//! Tools operate on file URIs with no editor in the loop, so the bridge
//! re-creates the minimum of editor behavior: match the URI to a backend,
//! start it on demand, and send `didOpen` (text read from disk) before the
//! first real request on each document.

use crate::filematch::MatcherSet;
use crate::jsonrpc::session::Session;
use crate::lsp::types::minimal_initialize_params;
use crate::lsp::{methods, DocumentUri};
use crate::pool::Pool;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Bridge {
    pool: Arc<Pool>,
    matchers: MatcherSet,
    /// Documents already `didOpen`ed, so repeat tool calls do not re-open.
    open: Mutex<HashSet<String>>,
}

impl Bridge {
    pub fn new(pool: Arc<Pool>, matchers: MatcherSet) -> Self {
        Self {
            pool,
            matchers,
            open: Mutex::new(HashSet::new()),
        }
    }

    async fn session_for(&self, doc: &DocumentUri) -> Result<Arc<Session>> {
        let Some(name) = self
            .matchers
            .match_document(&doc.path(), &doc.extension(), "")
        else {
            bail!("no language server configured for {doc}");
        };
        let root = std::env::current_dir()
            .ok()
            .map(|d| DocumentUri::from_path(&d));
        let init = minimal_initialize_params(root.as_ref().map(|u| u.as_str()));
        let inst = self.pool.get_or_start(name, Some(init)).await?;
        Ok(inst.session().await?)
    }

    async fn ensure_open(&self, session: &Session, doc: &DocumentUri) -> Result<()> {
        if self.open.lock().await.contains(doc.as_str()) {
            return Ok(());
        }
        let path = doc.path();
        let text = tokio::fs::read_to_string(Path::new(&path))
            .await
            .with_context(|| format!("reading {path}"))?;
        // Language servers key mostly off the URI; the extension is a good
        // enough language id for a one-shot tool call.
        let language_id = doc.extension().trim_start_matches('.').to_string();
        session
            .notify(
                methods::DID_OPEN,
                Some(json!({
                    "textDocument": {
                        "uri": doc.as_str(),
                        "languageId": language_id,
                        "version": 1,
                        "text": text,
                    }
                })),
            )
            .await?;
        self.open.lock().await.insert(doc.as_str().to_string());
        Ok(())
    }

    /// Forward one `textDocument/*` request for `uri`, opening the
    /// document first if needed.
    pub async fn request(&self, uri: &str, method: &str, params: Value) -> Result<Value> {
        let doc = DocumentUri::from(uri);
        let session = self.session_for(&doc).await?;
        self.ensure_open(&session, &doc).await?;
        session
            .call(method, Some(params))
            .await
            .with_context(|| format!("calling {method}"))
    }

    pub async fn shutdown(&self) {
        self.pool.stop_all().await;
    }
}
