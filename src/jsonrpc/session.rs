// SPDX-License-Identifier: MIT
//! Request/response correlation over a [`Transport`].
//!
//! A [`Session`] owns one transport and provides outbound `call`/`notify`
//! plus a `run` read loop that delivers responses to waiting callers and
//! hands requests and notifications to an optional [`Handler`].
//!
//! Ordering contract: notifications from the peer are handed to the handler
//! inline, in arrival order (their handling is cheap forwarding). Requests
//! are dispatched on their own task so a slow handler never stalls ingress.
//! Responses are matched by id regardless of arrival order.

use crate::jsonrpc::{Id, Message, RpcError, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::lsp::methods;
use crate::transport::{Transport, TransportError};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Inbound message sink. Returning `Ok(Some(msg))` writes `msg` back to the
/// peer (the reply to a request); `Ok(None)` writes nothing. An `Err` on a
/// request becomes an InternalError reply.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, msg: Message) -> Result<Option<Message>>;
}

#[derive(Debug, Error)]
pub enum CallError {
    /// The peer answered with an error payload.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The call was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,
    /// The session ended before a response arrived.
    #[error("session closed before response")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Session {
    transport: Arc<dyn Transport>,
    handler: Option<Arc<dyn Handler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    next_id: AtomicI64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, handler: Option<Arc<dyn Handler>>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handler,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Mint the next outbound request id.
    pub fn next_id(&self) -> Id {
        Id::Number(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Send a request and wait for its response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.call_as(self.next_id(), method, params, None).await
    }

    /// Send a request and wait for its response or for `cancel`. On
    /// cancellation the pending slot is dropped, a `$/cancelRequest` is sent
    /// for the minted id, and [`CallError::Cancelled`] is returned.
    pub async fn call_cancellable(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, CallError> {
        self.call_as(self.next_id(), method, params, Some(cancel))
            .await
    }

    /// Full-control variant: the caller supplies the id (so it can record
    /// the id elsewhere before the request is on the wire) and optionally a
    /// cancellation token.
    pub async fn call_as(
        &self,
        id: Id,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, CallError> {
        let key = id.key();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        let msg = Message::request(id.clone(), method, params);
        if let Err(e) = self.transport.write(&msg).await {
            self.pending.lock().await.remove(&key);
            return Err(e.into());
        }
        trace!(id = %id, method, "request sent");

        let resp = match cancel {
            None => rx.await.map_err(|_| CallError::Closed)?,
            Some(token) => {
                tokio::select! {
                    resp = rx => resp.map_err(|_| CallError::Closed)?,
                    _ = token.cancelled() => {
                        self.pending.lock().await.remove(&key);
                        let _ = self
                            .notify(methods::CANCEL_REQUEST, Some(json!({ "id": id })))
                            .await;
                        return Err(CallError::Cancelled);
                    }
                }
            }
        };

        match resp.error {
            Some(err) => Err(CallError::Rpc(err)),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        }
    }

    /// Drop the pending slot for an id minted via [`Session::next_id`].
    /// A response arriving later is discarded by the read loop.
    pub async fn forget(&self, id: &Id) {
        self.pending.lock().await.remove(&id.key());
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.transport.write(&Message::notification(method, params)).await
    }

    pub async fn reply(&self, id: Id, result: Value) -> Result<(), TransportError> {
        self.transport.write(&Message::response(id, result)).await
    }

    pub async fn reply_error(
        &self,
        id: Id,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), TransportError> {
        let mut err = RpcError::new(code, message);
        err.data = data;
        self.transport
            .write(&Message::error_response(id, err))
            .await
    }

    /// Forward a peer-bound message as-is (used to relay backend
    /// notifications to the client without re-framing their content).
    pub async fn forward(&self, msg: &Message) -> Result<(), TransportError> {
        self.transport.write(msg).await
    }

    /// Mark the session as deliberately closed. The read loop reports an
    /// orderly end instead of surfacing the underlying read error.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.transport.close().await.ok();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The read loop. Exits with `Ok(())` on orderly shutdown (close or
    /// peer EOF) and with the read error otherwise. In-flight callers are
    /// woken with [`CallError::Closed`] when the loop exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let result = Self::read_loop(&self).await;
        // Wake every caller still waiting on a response.
        self.pending.lock().await.clear();
        result
    }

    async fn read_loop(this: &Arc<Self>) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = this.shutdown.cancelled() => return Ok(()),
                res = this.transport.read() => match res {
                    Ok(msg) => msg,
                    Err(TransportError::Eof) => return Ok(()),
                    Err(e) => {
                        if this.is_closed() {
                            return Ok(());
                        }
                        return Err(anyhow::Error::new(e).context("reading message"));
                    }
                },
            };

            if msg.is_response() {
                this.deliver_response(msg).await;
                continue;
            }

            if msg.is_notification() {
                // Inline: preserves per-peer arrival order. Notification
                // handling is cheap forwarding, so ingress is not stalled.
                if let Some(handler) = &this.handler {
                    if let Err(e) = handler.handle(msg).await {
                        warn!(err = %format!("{e:#}"), "notification handler failed");
                    }
                }
                continue;
            }

            if !msg.is_request() {
                // Neither request, notification, nor response (e.g. a
                // null-id error response): nothing to correlate it with.
                debug!("dropping unclassifiable message");
                continue;
            }

            // Request: dispatch on its own task so slow handlers never
            // block the read loop.
            let session = this.clone();
            tokio::spawn(async move {
                session.dispatch_request(msg).await;
            });
        }
    }

    async fn deliver_response(&self, msg: Message) {
        let Some(id) = &msg.id else { return };
        let slot = self.pending.lock().await.remove(&id.key());
        match slot {
            Some(tx) => {
                // A dropped receiver means the caller gave up; that is fine.
                let _ = tx.send(msg);
            }
            None => debug!(id = %id, "dropping response for unknown id"),
        }
    }

    async fn dispatch_request(self: Arc<Self>, msg: Message) {
        let id = msg.id.clone().unwrap_or(Id::Null);
        let method = msg.method().to_string();

        let Some(handler) = &self.handler else {
            let _ = self
                .reply_error(id, METHOD_NOT_FOUND, format!("method not found: {method}"), None)
                .await;
            return;
        };

        match handler.handle(msg).await {
            Ok(Some(reply)) => {
                if let Err(e) = self.forward(&reply).await {
                    if !self.is_closed() {
                        warn!(method = %method, err = %e, "writing reply failed");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(method = %method, err = %format!("{e:#}"), "request handler failed");
                let _ = self
                    .reply_error(id, INTERNAL_ERROR, format!("{e:#}"), None)
                    .await;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LspTransport;
    use tokio::io::{duplex, AsyncRead, AsyncWrite};

    fn pair() -> (Arc<LspTransport>, Arc<LspTransport>) {
        fn boxed<T: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
            io: T,
        ) -> (
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        ) {
            let (r, w) = tokio::io::split(io);
            (Box::new(r), Box::new(w))
        }
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = boxed(a);
        let (br, bw) = boxed(b);
        (
            Arc::new(LspTransport::new(ar, aw)),
            Arc::new(LspTransport::new(br, bw)),
        )
    }

    /// Handler that echoes request params back as the result.
    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, msg: Message) -> Result<Option<Message>> {
            if msg.is_request() {
                let id = msg.id.clone().unwrap();
                return Ok(Some(Message::response(
                    id,
                    msg.params.unwrap_or(Value::Null),
                )));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn call_receives_matching_response() {
        let (ta, tb) = pair();
        let caller = Session::new(ta, None);
        let echo = Session::new(tb, Some(Arc::new(Echo)));

        let caller2 = caller.clone();
        let echo2 = echo.clone();
        tokio::spawn(async move { caller2.run().await });
        tokio::spawn(async move { echo2.run().await });

        let result = caller
            .call("test/echo", Some(json!({"n": 5})))
            .await
            .unwrap();
        assert_eq!(result["n"], 5);
    }

    #[tokio::test]
    async fn concurrent_calls_correlate_by_id() {
        let (ta, tb) = pair();
        let caller = Session::new(ta, None);
        let echo = Session::new(tb, Some(Arc::new(Echo)));

        let c = caller.clone();
        let e = echo.clone();
        tokio::spawn(async move { c.run().await });
        tokio::spawn(async move { e.run().await });

        let mut handles = Vec::new();
        for i in 0..32i64 {
            let caller = caller.clone();
            handles.push(tokio::spawn(async move {
                let result = caller
                    .call("test/echo", Some(json!({"n": i})))
                    .await
                    .unwrap();
                assert_eq!(result["n"], i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn response_to_unknown_id_is_dropped() {
        let (ta, tb) = pair();
        let caller = Session::new(ta, None);
        let c = caller.clone();
        tokio::spawn(async move { c.run().await });

        // An uncorrelated response must not break subsequent calls.
        tb.write(&Message::response(Id::Number(999), json!("stray")))
            .await
            .unwrap();

        let peer_read = tokio::spawn({
            let tb = tb.clone();
            async move {
                let req = tb.read().await.unwrap();
                let id = req.id.clone().unwrap();
                tb.write(&Message::response(id, json!("real"))).await.unwrap();
            }
        });

        let result = caller.call("test/ping", None).await.unwrap();
        assert_eq!(result, json!("real"));
        peer_read.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_call_sends_cancel_request() {
        let (ta, tb) = pair();
        let caller = Session::new(ta, None);
        let c = caller.clone();
        tokio::spawn(async move { c.run().await });

        let token = CancellationToken::new();
        let token2 = token.clone();
        let call = tokio::spawn({
            let caller = caller.clone();
            async move {
                caller
                    .call_cancellable("test/slow", None, &token2)
                    .await
            }
        });

        // Peer sees the request but never answers; the caller cancels.
        let req = tb.read().await.unwrap();
        let req_id = req.id.unwrap();
        token.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Cancelled));

        let cancel_msg = tb.read().await.unwrap();
        assert_eq!(cancel_msg.method.as_deref(), Some("$/cancelRequest"));
        assert_eq!(
            cancel_msg.params.unwrap()["id"],
            serde_json::to_value(&req_id).unwrap()
        );
    }

    #[tokio::test]
    async fn error_payload_surfaces_as_rpc_error() {
        let (ta, tb) = pair();
        let caller = Session::new(ta, None);
        let c = caller.clone();
        tokio::spawn(async move { c.run().await });

        tokio::spawn({
            let tb = tb.clone();
            async move {
                let req = tb.read().await.unwrap();
                let id = req.id.unwrap();
                tb.write(&Message::error_response(
                    id,
                    RpcError::new(METHOD_NOT_FOUND, "nope"),
                ))
                .await
                .unwrap();
            }
        });

        match caller.call("test/missing", None).await {
            Err(CallError::Rpc(e)) => assert_eq!(e.code, METHOD_NOT_FOUND),
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_eof_wakes_pending_callers() {
        let (ta, tb) = pair();
        let caller = Session::new(ta, None);
        let c = caller.clone();
        let run = tokio::spawn(async move { c.run().await });

        let call = tokio::spawn({
            let caller = caller.clone();
            async move { caller.call("test/hang", None).await }
        });

        // Peer reads the request then disappears.
        let _ = tb.read().await.unwrap();
        tb.close().await.unwrap();
        drop(tb);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Closed), "got {err:?}");
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_makes_run_exit_cleanly() {
        let (ta, _tb) = pair();
        let session = Session::new(ta, None);
        let s = session.clone();
        let run = tokio::spawn(async move { s.run().await });
        session.close().await;
        assert!(run.await.unwrap().is_ok());
    }
}
