// SPDX-License-Identifier: MIT
//! The multiplexer core: one editor-facing session in front, a pool of
//! backend sessions behind.
//!
//! The router is the client session's [`Handler`]. Lifecycle methods are
//! answered locally; everything under `textDocument/` is routed to a
//! backend chosen by the matcher set, sticky per URI from `didOpen` to
//! `didClose`. Backend-initiated traffic arrives through [`BackendRelay`],
//! which the pool holds as its shared handler — a dependency-injection
//! edge, not a cycle: the router owns the pool, the pool closes over a
//! relay the router installs itself into.

use crate::capabilities;
use crate::filematch::MatcherSet;
use crate::jsonrpc::session::{CallError, Handler, Session};
use crate::jsonrpc::{
    Id, Message, RpcError, INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND, REQUEST_CANCELLED,
};
use crate::lsp::types::minimal_initialize_params;
use crate::lsp::{message_type, methods, uri, ServerCapabilities};
use crate::pool::{BackendInstance, Pool};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A document the client has routed to a backend. The choice is sticky
/// until `didClose`. Language id and version are recorded for diagnostics;
/// routing itself only consumes the backend name.
#[derive(Debug, Clone)]
#[allow(dead_code)]
struct OpenDoc {
    backend: String,
    language_id: String,
    version: i64,
}

/// An in-flight request forwarded to a backend, keyed by the client's id.
struct ForwardEntry {
    backend: String,
    backend_id: Id,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RouterState {
    open_docs: HashMap<String, OpenDoc>,
    pending: HashMap<String, ForwardEntry>,
    /// Initialize params rewritten for backends, captured at client
    /// `initialize`.
    backend_init: Option<Value>,
}

pub struct Router {
    pool: Arc<Pool>,
    matchers: MatcherSet,
    caps_dir: PathBuf,
    client: OnceLock<Arc<Session>>,
    state: Mutex<RouterState>,
    shutting_down: AtomicBool,
    exited: CancellationToken,
}

impl Router {
    pub fn new(pool: Arc<Pool>, matchers: MatcherSet, caps_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            pool,
            matchers,
            caps_dir,
            client: OnceLock::new(),
            state: Mutex::new(RouterState::default()),
            shutting_down: AtomicBool::new(false),
            exited: CancellationToken::new(),
        })
    }

    /// Install the client-facing session. Called once at wiring time.
    pub fn set_client(&self, client: Arc<Session>) {
        let _ = self.client.set(client);
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Resolves when the client has sent `exit`.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    /// Initialize params for backends: the client's cached ones, else the
    /// minimal set (used by eager control-plane starts).
    pub async fn backend_init_params(&self) -> Value {
        self.state
            .lock()
            .await
            .backend_init
            .clone()
            .unwrap_or_else(|| minimal_initialize_params(None))
    }

    fn client(&self) -> Option<&Arc<Session>> {
        self.client.get()
    }

    // ─── Lifecycle methods ───────────────────────────────────────────────

    async fn on_initialize(&self, msg: Message) -> Result<Option<Message>> {
        let id = msg.id.clone().unwrap_or(Id::Null);
        let params = msg.params.unwrap_or(Value::Null);

        // Backends get our pid (they watch it for liveness), the client's
        // workspace layout, and the client's declared capabilities.
        let backend_init = json!({
            "processId": std::process::id(),
            "rootUri": params.get("rootUri").cloned().unwrap_or(Value::Null),
            "workspaceFolders": params.get("workspaceFolders").cloned().unwrap_or(Value::Null),
            "capabilities": params.get("capabilities").cloned().unwrap_or(json!({})),
        });
        self.state.lock().await.backend_init = Some(backend_init);

        let advertised = self.aggregate_capabilities().await;
        Ok(Some(Message::response(
            id,
            json!({
                "capabilities": advertised,
                "serverInfo": { "name": "lux", "version": env!("CARGO_PKG_VERSION") },
            }),
        )))
    }

    async fn aggregate_capabilities(&self) -> ServerCapabilities {
        let names = self.pool.names().await;
        capabilities::aggregate(&self.caps_dir, &names)
    }

    async fn on_shutdown(&self, msg: Message) -> Result<Option<Message>> {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Forward shutdown to every running backend; their exits happen at
        // client `exit` via the pool.
        for inst in self.pool.running().await {
            if let Ok(session) = inst.session().await {
                let name = inst.name().to_string();
                tokio::spawn(async move {
                    if let Err(e) = session.call(methods::SHUTDOWN, None).await {
                        debug!(backend = %name, err = %e, "shutdown call failed");
                    }
                });
            }
        }
        let id = msg.id.clone().unwrap_or(Id::Null);
        Ok(Some(Message::response(id, Value::Null)))
    }

    async fn on_exit(&self) -> Result<Option<Message>> {
        self.pool.stop_all().await;
        if let Some(client) = self.client() {
            client.close().await;
        }
        self.exited.cancel();
        Ok(None)
    }

    // ─── Cancellation ────────────────────────────────────────────────────

    /// Map a client `$/cancelRequest` onto the backend's id space.
    /// Unknown ids are a silent no-op.
    async fn on_cancel(&self, msg: Message) -> Result<Option<Message>> {
        let Some(id) = msg.params.as_ref().and_then(|p| p.get("id")) else {
            return Ok(None);
        };
        let Ok(client_id) = serde_json::from_value::<Id>(id.clone()) else {
            return Ok(None);
        };

        // Held across the backend notify so the cancel precedes any later
        // outbound message to that backend.
        let mut state = self.state.lock().await;
        let Some(entry) = state.pending.remove(&client_id.key()) else {
            return Ok(None);
        };
        if let Ok(inst) = self.pool.get(&entry.backend).await {
            if let Ok(session) = inst.session().await {
                let _ = session
                    .notify(
                        methods::CANCEL_REQUEST,
                        Some(json!({ "id": entry.backend_id })),
                    )
                    .await;
            }
        }
        entry.cancel.cancel();
        Ok(None)
    }

    // ─── Document routing ────────────────────────────────────────────────

    /// Backend for a URI: the sticky `didOpen` choice, else
    /// match-and-memoize (the editor skipped `didOpen`).
    async fn resolve_backend(
        &self,
        doc: &uri::DocumentUri,
        language_id: &str,
    ) -> Option<String> {
        let key = doc.as_str().to_string();
        {
            let state = self.state.lock().await;
            if let Some(open) = state.open_docs.get(&key) {
                return Some(open.backend.clone());
            }
        }
        let name = self
            .matchers
            .match_document(&doc.path(), &doc.extension(), language_id)?
            .to_string();
        self.state.lock().await.open_docs.insert(
            key,
            OpenDoc {
                backend: name.clone(),
                language_id: language_id.to_string(),
                version: 0,
            },
        );
        Some(name)
    }

    async fn on_did_open(&self, msg: Message) -> Result<Option<Message>> {
        let Some(doc) = uri::extract_uri(methods::DID_OPEN, msg.params.as_ref()) else {
            return Ok(None);
        };
        let language_id = uri::extract_language_id(msg.params.as_ref());

        let Some(name) = self
            .matchers
            .match_document(&doc.path(), &doc.extension(), &language_id)
            .map(str::to_string)
        else {
            debug!(uri = %doc, "no backend matches; ignoring didOpen");
            return Ok(None);
        };

        let init = self.backend_init_params().await;
        let inst = match self.pool.get_or_start(&name, Some(init)).await {
            Ok(inst) => inst,
            Err(e) => {
                self.warn_client(format!("starting {name} failed: {e:#}")).await;
                return Ok(None);
            }
        };

        let version = msg
            .params
            .as_ref()
            .and_then(|p| p.get("textDocument"))
            .and_then(|td| td.get("version"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        self.state.lock().await.open_docs.insert(
            doc.as_str().to_string(),
            OpenDoc {
                backend: name.clone(),
                language_id,
                version,
            },
        );
        self.verify_capabilities(&inst).await;

        if let Err(e) = inst.notify(methods::DID_OPEN, msg.params).await {
            warn!(backend = %name, uri = %doc, err = %format!("{e:#}"), "didOpen forward failed");
        }
        Ok(None)
    }

    async fn verify_capabilities(&self, inst: &Arc<BackendInstance>) {
        if let Some(live) = inst.capabilities().await {
            for warning in capabilities::verify(&self.caps_dir, inst.name(), &live) {
                warn!(backend = %inst.name(), "{warning}");
            }
        }
    }

    async fn on_document_notification(&self, method: &str, msg: Message) -> Result<Option<Message>> {
        let Some(doc) = uri::extract_uri(method, msg.params.as_ref()) else {
            return Ok(None);
        };
        let key = doc.as_str().to_string();

        let backend = {
            let mut state = self.state.lock().await;
            if method == methods::DID_CLOSE {
                state.open_docs.remove(&key).map(|o| o.backend)
            } else {
                state.open_docs.get(&key).map(|o| o.backend.clone())
            }
        };
        let Some(name) = backend else {
            debug!(uri = %doc, method = %method, "notification for unrouted document; dropping");
            return Ok(None);
        };

        if let Ok(inst) = self.pool.get(&name).await {
            if let Err(e) = inst.notify(method, msg.params).await {
                debug!(backend = %name, method = %method, err = %format!("{e:#}"), "notification forward failed");
            }
        }
        Ok(None)
    }

    async fn on_document_request(&self, msg: Message) -> Result<Option<Message>> {
        let method = msg.method().to_string();
        let id = msg.id.clone().unwrap_or(Id::Null);

        let Some(doc) = uri::extract_uri(&method, msg.params.as_ref()) else {
            return Ok(Some(Message::error_response(
                id,
                RpcError::new(INVALID_REQUEST, "missing textDocument.uri"),
            )));
        };

        let Some(backend) = self.resolve_backend(&doc, "").await else {
            return Ok(Some(Message::error_response(
                id,
                RpcError::with_data(
                    METHOD_NOT_FOUND,
                    "no language server for document",
                    json!({ "message": format!("no language server configured for {doc}") }),
                ),
            )));
        };

        self.forward_request(&backend, msg).await
    }

    // ─── Request forwarding ──────────────────────────────────────────────

    /// Forward a client request to a backend and relay the outcome. The
    /// backend id is minted before the call and recorded so a client
    /// cancellation can be mapped while the call is in flight.
    async fn forward_request(&self, backend: &str, msg: Message) -> Result<Option<Message>> {
        let client_id = msg.id.clone().unwrap_or(Id::Null);
        let method = msg.method().to_string();

        let init = self.backend_init_params().await;
        let inst = match self.pool.get_or_start(backend, Some(init)).await {
            Ok(inst) => inst,
            Err(e) => return Ok(Some(self.backend_failure(&client_id, backend, &e.to_string()).await)),
        };
        let session = match inst.session().await {
            Ok(s) => s,
            Err(e) => return Ok(Some(self.backend_failure(&client_id, backend, &e.to_string()).await)),
        };

        let backend_id = session.next_id();
        let cancel = CancellationToken::new();
        self.state.lock().await.pending.insert(
            client_id.key(),
            ForwardEntry {
                backend: backend.to_string(),
                backend_id: backend_id.clone(),
                cancel: cancel.clone(),
            },
        );

        let call = session.call_as(backend_id.clone(), &method, msg.params, None);
        tokio::pin!(call);

        let outcome = tokio::select! {
            res = &mut call => res,
            _ = cancel.cancelled() => {
                // The cancel path already told the backend; a late response
                // must not be delivered.
                session.forget(&backend_id).await;
                return Ok(Some(Message::error_response(
                    client_id,
                    RpcError::new(REQUEST_CANCELLED, "request cancelled"),
                )));
            }
        };

        // A response racing a cancellation: whoever removes the entry
        // first wins; losing means the reply was already cancelled.
        if self
            .state
            .lock()
            .await
            .pending
            .remove(&client_id.key())
            .is_none()
        {
            return Ok(Some(Message::error_response(
                client_id,
                RpcError::new(REQUEST_CANCELLED, "request cancelled"),
            )));
        }

        match outcome {
            Ok(result) => Ok(Some(Message::response(client_id, result))),
            Err(CallError::Rpc(err)) => Ok(Some(Message::error_response(client_id, err))),
            Err(e) => Ok(Some(self.backend_failure(&client_id, backend, &e.to_string()).await)),
        }
    }

    /// InternalError reply for a broken backend, plus a visible warning in
    /// the editor.
    async fn backend_failure(&self, client_id: &Id, backend: &str, cause: &str) -> Message {
        self.warn_client(format!("language server {backend} failed: {cause}"))
            .await;
        Message::error_response(
            client_id.clone(),
            RpcError::with_data(
                INTERNAL_ERROR,
                "backend request failed",
                json!({ "backend": backend, "cause": cause }),
            ),
        )
    }

    async fn warn_client(&self, text: String) {
        if let Some(client) = self.client() {
            let _ = client
                .notify(
                    methods::SHOW_MESSAGE,
                    Some(json!({ "type": message_type::WARNING, "message": text })),
                )
                .await;
        }
    }

    // ─── Workspace-wide operations ───────────────────────────────────────

    /// Broadcast to every running backend and concatenate the results in
    /// registration order. Backends that error are skipped.
    async fn on_workspace_symbol(&self, msg: Message) -> Result<Option<Message>> {
        let id = msg.id.clone().unwrap_or(Id::Null);
        let mut combined = Vec::new();
        for inst in self.pool.running().await {
            let Ok(session) = inst.session().await else {
                continue;
            };
            match session.call(methods::WORKSPACE_SYMBOL, msg.params.clone()).await {
                Ok(Value::Array(items)) => combined.extend(items),
                Ok(_) => {}
                Err(e) => {
                    debug!(backend = %inst.name(), err = %e, "workspace/symbol failed");
                }
            }
        }
        Ok(Some(Message::response(id, Value::Array(combined))))
    }

    /// Route to the single backend advertising the command.
    async fn on_execute_command(&self, msg: Message) -> Result<Option<Message>> {
        let id = msg.id.clone().unwrap_or(Id::Null);
        let command = msg
            .params
            .as_ref()
            .and_then(|p| p.get("command"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut owners = Vec::new();
        for inst in self.pool.instances().await {
            let caps = match inst.capabilities().await {
                Some(live) => Some(live),
                None => capabilities::load(&self.caps_dir, inst.name())
                    .ok()
                    .map(|c| c.capabilities),
            };
            if caps.map(|c| c.advertises_command(&command)).unwrap_or(false) {
                owners.push(inst.name().to_string());
            }
        }

        match owners.as_slice() {
            [] => Ok(Some(Message::error_response(
                id,
                RpcError::new(
                    INVALID_REQUEST,
                    format!("no backend advertises command {command:?}"),
                ),
            ))),
            [owner] => {
                let owner = owner.clone();
                self.forward_request(&owner, msg).await
            }
            many => Ok(Some(Message::error_response(
                id,
                RpcError::new(
                    INVALID_REQUEST,
                    format!("command {command:?} is ambiguous across {}", many.join(", ")),
                ),
            ))),
        }
    }

    // ─── Backend → client relay ──────────────────────────────────────────

    /// Handle traffic a backend initiates: notifications are forwarded
    /// verbatim; requests are re-minted on the client session (whose
    /// pending map provides the reverse correlation) and the client's
    /// answer is returned under the backend's original id.
    async fn relay_from_backend(&self, msg: Message) -> Result<Option<Message>> {
        let Some(client) = self.client() else {
            return Ok(None);
        };

        if msg.is_notification() {
            client.forward(&msg).await.ok();
            return Ok(None);
        }

        let backend_id = msg.id.clone().unwrap_or(Id::Null);
        let method = msg.method().to_string();
        match client.call(&method, msg.params).await {
            Ok(result) => Ok(Some(Message::response(backend_id, result))),
            Err(CallError::Rpc(err)) => Ok(Some(Message::error_response(backend_id, err))),
            Err(e) => Ok(Some(Message::error_response(
                backend_id,
                RpcError::new(INTERNAL_ERROR, format!("relaying to client: {e}")),
            ))),
        }
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, msg: Message) -> Result<Option<Message>> {
        let method = msg.method().to_string();

        if self.shutting_down.load(Ordering::SeqCst)
            && msg.is_request()
            && method != methods::EXIT
        {
            let id = msg.id.clone().unwrap_or(Id::Null);
            return Ok(Some(Message::error_response(
                id,
                RpcError::new(INVALID_REQUEST, "server is shutting down"),
            )));
        }

        match method.as_str() {
            methods::INITIALIZE => self.on_initialize(msg).await,
            methods::INITIALIZED => Ok(None),
            methods::SHUTDOWN => self.on_shutdown(msg).await,
            methods::EXIT => self.on_exit().await,
            methods::CANCEL_REQUEST => self.on_cancel(msg).await,
            methods::WORKSPACE_SYMBOL => self.on_workspace_symbol(msg).await,
            methods::EXECUTE_COMMAND => self.on_execute_command(msg).await,
            methods::DID_OPEN => self.on_did_open(msg).await,
            m if m.starts_with(methods::TEXT_DOCUMENT_PREFIX) => {
                if msg.is_notification() {
                    self.on_document_notification(&method, msg).await
                } else {
                    self.on_document_request(msg).await
                }
            }
            _ => {
                if msg.is_request() {
                    let id = msg.id.clone().unwrap_or(Id::Null);
                    return Ok(Some(Message::error_response(
                        id,
                        RpcError::new(
                            METHOD_NOT_FOUND,
                            format!("method not handled: {method}"),
                        ),
                    )));
                }
                // Workspace-level notifications (configuration changes,
                // watched-file events) are of interest to every backend.
                for inst in self.pool.running().await {
                    if let Err(e) = inst.notify(&method, msg.params.clone()).await {
                        debug!(backend = %inst.name(), method = %method, err = %format!("{e:#}"), "broadcast failed");
                    }
                }
                Ok(None)
            }
        }
    }
}

// ─── BackendRelay ────────────────────────────────────────────────────────────

/// The pool's shared inbound handler. It is created before the router (the
/// pool needs it at construction) and the router is installed afterwards;
/// traffic arriving in between is dropped.
#[derive(Default)]
pub struct BackendRelay {
    router: OnceLock<Arc<Router>>,
}

impl BackendRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, router: Arc<Router>) {
        let _ = self.router.set(router);
    }
}

#[async_trait]
impl Handler for BackendRelay {
    async fn handle(&self, msg: Message) -> Result<Option<Message>> {
        match self.router.get() {
            Some(router) => router.relay_from_backend(msg).await,
            None => Ok(None),
        }
    }
}
