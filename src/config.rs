// SPDX-License-Identifier: MIT
//! Configuration: the TOML backend table and the on-disk layout.
//!
//! Everything lives under `$XDG_CONFIG_HOME/lux` (default `~/.config/lux`):
//! `lsps.toml` enumerates the configured backends and `capabilities/` holds
//! the per-backend capability cache. The control socket defaults to
//! `$XDG_RUNTIME_DIR/lux.sock`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One configured backend language server. Read-only at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    /// Nix flake reference the executable is built from,
    /// e.g. `nixpkgs#gopls`.
    pub flake: String,
    /// Which executable to pick from the built artifact; empty means the
    /// first entry in `<store>/bin/`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub binary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub language_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Control socket path override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lsps: Vec<BackendSpec>,
}

impl Config {
    pub fn load() -> Result<Config> {
        load_from(&config_path())
    }

    pub fn save(&self) -> Result<()> {
        save_to(&config_path(), self)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(default_socket_path)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendSpec> {
        self.lsps.iter().find(|l| l.name == name)
    }

    /// Insert or replace a backend entry by name.
    pub fn upsert(&mut self, spec: BackendSpec) {
        match self.lsps.iter_mut().find(|l| l.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.lsps.push(spec),
        }
    }
}

pub fn load_from(path: &Path) -> Result<Config> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn save_to(path: &Path, config: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let raw = toml::to_string_pretty(config).context("serializing config")?;
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
}

/// Add or update a backend in the on-disk config.
pub fn add_backend(spec: BackendSpec) -> Result<()> {
    let mut config = Config::load()?;
    config.upsert(spec);
    config.save()
}

pub fn config_dir() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("lux")
}

pub fn config_path() -> PathBuf {
    config_dir().join("lsps.toml")
}

pub fn capabilities_dir() -> PathBuf {
    config_dir().join("capabilities")
}

fn default_socket_path() -> PathBuf {
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime.is_empty() {
            return PathBuf::from(runtime).join("lux.sock");
        }
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    PathBuf::from(format!("/tmp/lux-{user}.sock"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
