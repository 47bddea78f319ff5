//! The MCP tool registry: LSP operations re-exposed as tools.

use super::bridge::Bridge;
use crate::lsp::methods;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, serde::Serialize)]
pub struct Tool {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A tool call outcome in MCP shape: text content plus an error flag.
/// Tool failures are results, not protocol errors.
#[derive(Debug, serde::Serialize)]
pub struct ToolResult {
    pub content: Vec<Value>,
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    fn text(value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message.into() })],
            is_error: true,
        }
    }
}

// ─── Argument shapes ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PositionArgs {
    uri: String,
    line: u32,
    character: u32,
}

#[derive(Deserialize)]
struct ReferencesArgs {
    uri: String,
    line: u32,
    character: u32,
    #[serde(default = "default_true")]
    include_declaration: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct DocumentArgs {
    uri: String,
}

#[derive(Deserialize)]
struct RangeArgs {
    uri: String,
    start_line: u32,
    start_character: u32,
    end_line: u32,
    end_character: u32,
}

#[derive(Deserialize)]
struct RenameArgs {
    uri: String,
    line: u32,
    character: u32,
    new_name: String,
}

fn position_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "uri": { "type": "string", "description": "File URI (e.g. file:///path/to/file.go)" },
            "line": { "type": "integer", "description": "0-indexed line number" },
            "character": { "type": "integer", "description": "0-indexed character offset" }
        },
        "required": ["uri", "line", "character"]
    })
}

fn document_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "uri": { "type": "string", "description": "File URI (e.g. file:///path/to/file.go)" }
        },
        "required": ["uri"]
    })
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut schema_refs = position_schema();
        if let Some(props) = schema_refs["properties"].as_object_mut() {
            props.insert(
                "include_declaration".into(),
                json!({ "type": "boolean", "description": "Include the declaration in results", "default": true }),
            );
        }
        let mut schema_rename = position_schema();
        if let Some(props) = schema_rename["properties"].as_object_mut() {
            props.insert(
                "new_name".into(),
                json!({ "type": "string", "description": "New name for the symbol" }),
            );
        }
        schema_rename["required"] = json!(["uri", "line", "character", "new_name"]);

        let tools = vec![
            Tool {
                name: "lsp_hover",
                description:
                    "Get hover information (type info, documentation) at a position in a file",
                input_schema: position_schema(),
            },
            Tool {
                name: "lsp_definition",
                description: "Go to definition of a symbol at a position",
                input_schema: position_schema(),
            },
            Tool {
                name: "lsp_references",
                description: "Find all references to a symbol at a position",
                input_schema: schema_refs,
            },
            Tool {
                name: "lsp_completion",
                description: "Get code completions at a position",
                input_schema: position_schema(),
            },
            Tool {
                name: "lsp_format",
                description: "Format a document",
                input_schema: document_schema(),
            },
            Tool {
                name: "lsp_document_symbols",
                description: "Get all symbols (functions, classes, variables) in a document",
                input_schema: document_schema(),
            },
            Tool {
                name: "lsp_code_action",
                description:
                    "Get available code actions (quick fixes, refactorings) for a range",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "uri": { "type": "string", "description": "File URI (e.g. file:///path/to/file.go)" },
                        "start_line": { "type": "integer", "description": "0-indexed start line" },
                        "start_character": { "type": "integer", "description": "0-indexed start character" },
                        "end_line": { "type": "integer", "description": "0-indexed end line" },
                        "end_character": { "type": "integer", "description": "0-indexed end character" }
                    },
                    "required": ["uri", "start_line", "start_character", "end_line", "end_character"]
                }),
            },
            Tool {
                name: "lsp_rename",
                description: "Rename a symbol across all files",
                input_schema: schema_rename,
            },
        ];
        Self { tools }
    }

    pub fn list(&self) -> &[Tool] {
        &self.tools
    }

    pub async fn call(&self, bridge: &Bridge, name: &str, args: Value) -> ToolResult {
        match name {
            "lsp_hover" => self.positional(bridge, methods::HOVER, args).await,
            "lsp_definition" => self.positional(bridge, methods::DEFINITION, args).await,
            "lsp_references" => self.references(bridge, args).await,
            "lsp_completion" => self.positional(bridge, methods::COMPLETION, args).await,
            "lsp_format" => self.format(bridge, args).await,
            "lsp_document_symbols" => self.document_symbols(bridge, args).await,
            "lsp_code_action" => self.code_action(bridge, args).await,
            "lsp_rename" => self.rename(bridge, args).await,
            other => ToolResult::error(format!("unknown tool: {other}")),
        }
    }

    async fn positional(&self, bridge: &Bridge, method: &str, args: Value) -> ToolResult {
        let a: PositionArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let params = json!({
            "textDocument": { "uri": a.uri },
            "position": { "line": a.line, "character": a.character }
        });
        self.run(bridge, &a.uri, method, params).await
    }

    async fn references(&self, bridge: &Bridge, args: Value) -> ToolResult {
        let a: ReferencesArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let params = json!({
            "textDocument": { "uri": a.uri },
            "position": { "line": a.line, "character": a.character },
            "context": { "includeDeclaration": a.include_declaration }
        });
        self.run(bridge, &a.uri, methods::REFERENCES, params).await
    }

    async fn format(&self, bridge: &Bridge, args: Value) -> ToolResult {
        let a: DocumentArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let params = json!({
            "textDocument": { "uri": a.uri },
            "options": { "tabSize": 4, "insertSpaces": true }
        });
        self.run(bridge, &a.uri, methods::FORMATTING, params).await
    }

    async fn document_symbols(&self, bridge: &Bridge, args: Value) -> ToolResult {
        let a: DocumentArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let params = json!({ "textDocument": { "uri": a.uri } });
        self.run(bridge, &a.uri, methods::DOCUMENT_SYMBOL, params)
            .await
    }

    async fn code_action(&self, bridge: &Bridge, args: Value) -> ToolResult {
        let a: RangeArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let params = json!({
            "textDocument": { "uri": a.uri },
            "range": {
                "start": { "line": a.start_line, "character": a.start_character },
                "end": { "line": a.end_line, "character": a.end_character }
            },
            "context": { "diagnostics": [] }
        });
        self.run(bridge, &a.uri, methods::CODE_ACTION, params).await
    }

    async fn rename(&self, bridge: &Bridge, args: Value) -> ToolResult {
        let a: RenameArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };
        let params = json!({
            "textDocument": { "uri": a.uri },
            "position": { "line": a.line, "character": a.character },
            "newName": a.new_name
        });
        self.run(bridge, &a.uri, methods::RENAME, params).await
    }

    async fn run(&self, bridge: &Bridge, uri: &str, method: &str, params: Value) -> ToolResult {
        match bridge.request(uri, method, params).await {
            Ok(result) => ToolResult::text(&result),
            Err(e) => ToolResult::error(format!("{e:#}")),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_all_lsp_tools() {
        let registry = ToolRegistry::new();
        let names: Vec<&str> = registry.list().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "lsp_hover",
                "lsp_definition",
                "lsp_references",
                "lsp_completion",
                "lsp_format",
                "lsp_document_symbols",
                "lsp_code_action",
                "lsp_rename",
            ]
        );
    }

    #[test]
    fn schemas_require_uri() {
        let registry = ToolRegistry::new();
        for tool in registry.list() {
            let required = tool.input_schema["required"].as_array().unwrap();
            assert!(
                required.iter().any(|r| r == "uri"),
                "{} missing uri requirement",
                tool.name
            );
        }
    }

    #[test]
    fn error_result_is_flagged() {
        let result = ToolResult::error("boom");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["isError"], true);
        assert_eq!(value["content"][0]["text"], "boom");
    }

    #[test]
    fn success_result_omits_error_flag() {
        let result = ToolResult::text(&serde_json::json!({"ok": 1}));
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("isError").is_none());
    }
}
