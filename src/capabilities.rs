// SPDX-License-Identifier: MIT
//! Per-backend capability cache and the advertised-capability aggregation.
//!
//! Backends are started lazily, but the client needs a capability set at
//! `initialize` time — before any backend exists. The answer is a cache:
//! one JSON file per backend under the config directory, written when a
//! backend is bootstrapped (`lux add`) or first initialized, and read at
//! client-initialize time to synthesize the advertised union.

use crate::config::{self, BackendSpec};
use crate::jsonrpc::session::Session;
use crate::lsp::types::minimal_initialize_params;
use crate::lsp::{methods, CompletionOptions, InitializeResult, ServerCapabilities};
use crate::nix::Executor;
use crate::transport::LspTransport;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCapabilities {
    pub flake: String,
    pub capabilities: ServerCapabilities,
}

fn cache_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

pub fn load(dir: &Path, name: &str) -> Result<CachedCapabilities> {
    let path = cache_path(dir, name);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn save(dir: &Path, name: &str, cached: &CachedCapabilities) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = cache_path(dir, name);
    let raw = serde_json::to_string_pretty(cached).context("serializing capabilities")?;
    std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))
}

/// Every cached capability set in the directory, keyed by backend name.
/// Unreadable entries are skipped.
pub fn load_all(dir: &Path) -> HashMap<String, CachedCapabilities> {
    let mut result = HashMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return result;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match load(dir, name) {
            Ok(cached) => {
                result.insert(name.to_string(), cached);
            }
            Err(e) => debug!(name, err = %format!("{e:#}"), "skipping unreadable capability cache"),
        }
    }
    result
}

/// The single capability set advertised to the client: the pointwise union
/// of every named backend's cached capabilities, or the default set when
/// nothing is cached.
pub fn aggregate(dir: &Path, names: &[String]) -> ServerCapabilities {
    let mut all = Vec::new();
    for name in names {
        match load(dir, name) {
            Ok(cached) => all.push(cached.capabilities),
            Err(e) => debug!(name, err = %format!("{e:#}"), "no cached capabilities"),
        }
    }
    if all.is_empty() {
        return default_capabilities();
    }
    ServerCapabilities::merge(&all)
}

/// Advertised when no backend has a cache yet: full-document sync plus the
/// core feature set, so editors enable their LSP integrations and the real
/// capability check happens per-request.
pub fn default_capabilities() -> ServerCapabilities {
    let yes = || Some(serde_json::Value::Bool(true));
    ServerCapabilities {
        text_document_sync: Some(json!(1)),
        hover_provider: yes(),
        completion_provider: Some(CompletionOptions {
            trigger_characters: vec![".".to_string()],
            ..Default::default()
        }),
        definition_provider: yes(),
        type_definition_provider: yes(),
        implementation_provider: yes(),
        references_provider: yes(),
        document_symbol_provider: yes(),
        code_action_provider: yes(),
        document_formatting_provider: yes(),
        document_range_formatting_provider: yes(),
        rename_provider: yes(),
        folding_range_provider: yes(),
        selection_range_provider: yes(),
        workspace_symbol_provider: yes(),
        ..Default::default()
    }
}

/// Compare a live capability set against the cache. Drift produces
/// warnings, never failures — the cache is advisory.
pub fn verify(dir: &Path, name: &str, actual: &ServerCapabilities) -> Vec<String> {
    let Ok(cached) = load(dir, name) else {
        return Vec::new();
    };
    if &cached.capabilities == actual {
        return Vec::new();
    }
    vec![format!(
        "capabilities of {name} differ from the cached set; run `lux add` to refresh"
    )]
}

// ─── Bootstrap ───────────────────────────────────────────────────────────────

/// Derive a backend name from a flake reference: the last segment of the
/// attribute after `#` when present, else the last path segment.
pub fn backend_name_from_flake(flake: &str) -> String {
    let tail = flake.rsplit_once('#').map(|(_, a)| a).unwrap_or(flake);
    let tail = tail.rsplit(['/', '.']).next().unwrap_or(tail);
    tail.to_string()
}

/// `lux add <flake>`: build the flake, run the server once through the
/// initialize handshake to discover its capabilities, cache them, and
/// record the backend in the config (matchers left for the user to fill
/// in if the name alone is not enough).
pub async fn bootstrap(executor: Arc<dyn Executor>, flake: &str) -> Result<String> {
    let name = backend_name_from_flake(flake);
    info!(name = %name, flake, "bootstrapping");

    let bin = executor.build(flake, "").await?;
    let mut proc = executor.execute(&bin, &[]).await?;
    if let Some(stderr) = proc.stderr.take() {
        crate::nix::spawn_stderr_logger(name.clone(), stderr);
    }
    let transport = Arc::new(LspTransport::new(proc.stdout, proc.stdin));
    let session = Session::new(transport, None);

    let run_session = session.clone();
    let run = tokio::spawn(async move { run_session.run().await });

    let handshake = async {
        let result = session
            .call(methods::INITIALIZE, Some(minimal_initialize_params(None)))
            .await
            .context("initialize handshake")?;
        let init: InitializeResult =
            serde_json::from_value(result).context("parsing initialize result")?;
        session.notify(methods::INITIALIZED, Some(json!({}))).await?;
        anyhow::Ok(init.capabilities)
    };

    let discovered = tokio::time::timeout(Duration::from_secs(60), handshake)
        .await
        .context("initialize handshake timed out")??;

    // Orderly teardown; the process is killed if it lingers.
    let _ = tokio::time::timeout(Duration::from_secs(5), session.call(methods::SHUTDOWN, None)).await;
    let _ = session.notify(methods::EXIT, None).await;
    session.close().await;
    if !proc.handle.wait_timeout(Duration::from_secs(5)).await {
        warn!(name = %name, "backend did not exit after shutdown; killing");
        proc.handle.kill();
    }
    run.abort();

    save(
        &config::capabilities_dir(),
        &name,
        &CachedCapabilities {
            flake: flake.to_string(),
            capabilities: discovered,
        },
    )?;

    config::add_backend(BackendSpec {
        name: name.clone(),
        flake: flake.to_string(),
        binary: String::new(),
        args: Vec::new(),
        extensions: Vec::new(),
        patterns: Vec::new(),
        language_ids: Vec::new(),
    })?;

    info!(name = %name, "capabilities cached and config updated");
    Ok(name)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn caps(raw: Value) -> ServerCapabilities {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cached = CachedCapabilities {
            flake: "nixpkgs#gopls".into(),
            capabilities: caps(json!({ "hoverProvider": true })),
        };
        save(dir.path(), "gopls", &cached).unwrap();

        let loaded = load(dir.path(), "gopls").unwrap();
        assert_eq!(loaded.flake, "nixpkgs#gopls");
        assert_eq!(loaded.capabilities.hover_provider, Some(Value::Bool(true)));
    }

    #[test]
    fn load_all_skips_non_json_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        save(
            dir.path(),
            "gopls",
            &CachedCapabilities {
                flake: "nixpkgs#gopls".into(),
                capabilities: caps(json!({})),
            },
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{nope").unwrap();

        let all = load_all(dir.path());
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("gopls"));
    }

    #[test]
    fn aggregate_merges_cached_sets() {
        let dir = tempfile::tempdir().unwrap();
        save(
            dir.path(),
            "gopls",
            &CachedCapabilities {
                flake: "f1".into(),
                capabilities: caps(json!({ "hoverProvider": true })),
            },
        )
        .unwrap();
        save(
            dir.path(),
            "pyright",
            &CachedCapabilities {
                flake: "f2".into(),
                capabilities: caps(
                    json!({ "completionProvider": { "triggerCharacters": ["."] } }),
                ),
            },
        )
        .unwrap();

        let merged = aggregate(dir.path(), &["gopls".into(), "pyright".into()]);
        assert_eq!(merged.hover_provider, Some(Value::Bool(true)));
        assert_eq!(
            merged.completion_provider.unwrap().trigger_characters,
            vec!["."]
        );
    }

    #[test]
    fn aggregate_without_caches_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let merged = aggregate(dir.path(), &["nothing".into()]);
        assert_eq!(merged.hover_provider, Some(Value::Bool(true)));
        assert_eq!(merged.text_document_sync, Some(json!(1)));
        assert_eq!(
            merged.completion_provider.unwrap().trigger_characters,
            vec!["."]
        );
        assert_eq!(merged.workspace_symbol_provider, Some(Value::Bool(true)));
    }

    #[test]
    fn verify_reports_drift_and_tolerates_missing_cache() {
        let dir = tempfile::tempdir().unwrap();
        // No cache: no warnings.
        assert!(verify(dir.path(), "gopls", &caps(json!({}))).is_empty());

        save(
            dir.path(),
            "gopls",
            &CachedCapabilities {
                flake: "f".into(),
                capabilities: caps(json!({ "hoverProvider": true })),
            },
        )
        .unwrap();
        assert!(verify(dir.path(), "gopls", &caps(json!({ "hoverProvider": true }))).is_empty());
        let warnings = verify(dir.path(), "gopls", &caps(json!({ "hoverProvider": false })));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn backend_name_derivation() {
        assert_eq!(backend_name_from_flake("nixpkgs#gopls"), "gopls");
        assert_eq!(
            backend_name_from_flake("github:owner/repo#packages.x.rust-analyzer"),
            "rust-analyzer"
        );
        assert_eq!(backend_name_from_flake("github:owner/some-lsp"), "some-lsp");
    }
}
