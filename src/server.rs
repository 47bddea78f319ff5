// SPDX-License-Identifier: MIT
//! `lux serve`: the editor-facing LSP server over stdio.
//!
//! Wires config → matchers → pool → router → client session, spawns the
//! control socket, and runs the client read loop until the editor's
//! `exit` (or a dropped stdin).

use crate::config::{self, Config};
use crate::control;
use crate::filematch::MatcherSet;
use crate::jsonrpc::session::Session;
use crate::nix::NixExecutor;
use crate::pool::Pool;
use crate::router::{BackendRelay, Router};
use crate::transport::LspTransport;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Server {
    config: Arc<Config>,
    router: Arc<Router>,
    client: Arc<Session>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Server> {
        let mut matchers = MatcherSet::new();
        for spec in &config.lsps {
            matchers
                .add(&spec.name, &spec.extensions, &spec.patterns, &spec.language_ids)
                .with_context(|| format!("configuring {}", spec.name))?;
        }

        let relay = BackendRelay::new();
        let pool = Arc::new(Pool::new(Arc::new(NixExecutor::new()), relay.clone()));
        for spec in &config.lsps {
            pool.register(spec.clone()).await;
        }

        let router = Router::new(pool, matchers, config::capabilities_dir());
        relay.install(router.clone());

        let transport = Arc::new(LspTransport::new(
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        ));
        let client = Session::new(transport, Some(router.clone()));
        router.set_client(client.clone());

        Ok(Server {
            config: Arc::new(config),
            router,
            client,
        })
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            backends = self.config.lsps.len(),
            "lux serving LSP on stdio"
        );

        let socket_path = self.config.socket_path();
        let listener = control::bind(&socket_path)?;

        let shutdown = CancellationToken::new();
        let control_task = tokio::spawn(control::serve(
            listener,
            socket_path,
            self.config.clone(),
            self.router.clone(),
            shutdown.clone(),
        ));

        let result = tokio::select! {
            r = self.client.clone().run() => r,
            _ = self.router.exited() => Ok(()),
        };

        // The editor may have vanished without `exit`; children must not
        // outlive the session either way.
        self.router.pool().stop_all().await;
        shutdown.cancel();
        let _ = control_task.await;

        info!("lux stopped");
        result
    }
}
