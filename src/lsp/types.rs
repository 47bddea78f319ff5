//! The slice of LSP 3.x wire types the multiplexer actually interprets.
//!
//! Capability fields it merges are typed; provider fields whose shape varies
//! between servers (bool vs. options object) stay as raw JSON, and anything
//! unmodeled rides along in a flattened map so nothing a backend advertises
//! is lost on the way to the client.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none", rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_characters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_provider: Option<bool>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandOptions {
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_document_sync: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hover_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_provider: Option<CompletionOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_definition_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_symbol_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_action_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_formatting_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_range_formatting_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rename_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folding_range_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_range_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_symbol_provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_command_provider: Option<ExecuteCommandOptions>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ServerCapabilities {
    /// Pointwise union of several capability sets. Provider fields are
    /// truthy-OR (an options object beats a bare `true`, which beats
    /// `false`/absent); trigger characters and commands are element unions;
    /// unmodeled fields keep the first backend's value.
    pub fn merge(all: &[ServerCapabilities]) -> ServerCapabilities {
        let mut out = ServerCapabilities::default();
        for caps in all {
            out.text_document_sync = merge_provider(out.text_document_sync.take(), &caps.text_document_sync);
            out.hover_provider = merge_provider(out.hover_provider.take(), &caps.hover_provider);
            out.definition_provider = merge_provider(out.definition_provider.take(), &caps.definition_provider);
            out.type_definition_provider = merge_provider(out.type_definition_provider.take(), &caps.type_definition_provider);
            out.implementation_provider = merge_provider(out.implementation_provider.take(), &caps.implementation_provider);
            out.references_provider = merge_provider(out.references_provider.take(), &caps.references_provider);
            out.document_symbol_provider = merge_provider(out.document_symbol_provider.take(), &caps.document_symbol_provider);
            out.code_action_provider = merge_provider(out.code_action_provider.take(), &caps.code_action_provider);
            out.document_formatting_provider = merge_provider(out.document_formatting_provider.take(), &caps.document_formatting_provider);
            out.document_range_formatting_provider = merge_provider(out.document_range_formatting_provider.take(), &caps.document_range_formatting_provider);
            out.rename_provider = merge_provider(out.rename_provider.take(), &caps.rename_provider);
            out.folding_range_provider = merge_provider(out.folding_range_provider.take(), &caps.folding_range_provider);
            out.selection_range_provider = merge_provider(out.selection_range_provider.take(), &caps.selection_range_provider);
            out.workspace_symbol_provider = merge_provider(out.workspace_symbol_provider.take(), &caps.workspace_symbol_provider);

            if let Some(completion) = &caps.completion_provider {
                let merged = out.completion_provider.get_or_insert_with(Default::default);
                for c in &completion.trigger_characters {
                    if !merged.trigger_characters.contains(c) {
                        merged.trigger_characters.push(c.clone());
                    }
                }
                if completion.resolve_provider == Some(true) {
                    merged.resolve_provider = Some(true);
                }
                for (k, v) in &completion.other {
                    merged.other.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }

            if let Some(exec) = &caps.execute_command_provider {
                let merged = out
                    .execute_command_provider
                    .get_or_insert_with(Default::default);
                for c in &exec.commands {
                    if !merged.commands.contains(c) {
                        merged.commands.push(c.clone());
                    }
                }
            }

            for (k, v) in &caps.other {
                out.other.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        out
    }

    /// Whether this set advertises the given `workspace/executeCommand`
    /// command.
    pub fn advertises_command(&self, command: &str) -> bool {
        self.execute_command_provider
            .as_ref()
            .map(|e| e.commands.iter().any(|c| c == command))
            .unwrap_or(false)
    }
}

/// Union for a provider field that may be absent, `false`, `true`, or an
/// options object. A declared value wins over undeclared; an object wins
/// over a plain `true`.
fn merge_provider(current: Option<Value>, incoming: &Option<Value>) -> Option<Value> {
    let incoming = match incoming {
        Some(v) if !is_falsy(v) => v,
        _ => return current,
    };
    match &current {
        Some(Value::Object(_)) => current,
        Some(v) if !is_falsy(v) && !incoming.is_object() => current,
        _ => Some(incoming.clone()),
    }
}

fn is_falsy(v: &Value) -> bool {
    matches!(v, Value::Null | Value::Bool(false))
}

/// Initialize params used when no client session exists yet (eager starts
/// from the control plane, capability bootstrap, the MCP surface).
pub fn minimal_initialize_params(root_uri: Option<&str>) -> Value {
    json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {},
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
