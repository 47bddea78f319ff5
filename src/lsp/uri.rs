//! Document URIs and the views routing needs from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use url::Url;

/// An opaque document URI as sent by the client. Routing only ever derives
/// views from it (path, filename, extension); the raw string is forwarded to
/// backends untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentUri(pub String);

impl DocumentUri {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The filesystem path for `file://` URIs. Non-file schemes yield an
    /// empty path; an unparseable URI is returned verbatim so globs can
    /// still have a go at it.
    pub fn path(&self) -> String {
        let Ok(url) = Url::parse(&self.0) else {
            return self.0.clone();
        };
        if url.scheme() != "file" {
            return String::new();
        }
        match url.to_file_path() {
            Ok(p) => p.display().to_string(),
            Err(()) => url.path().to_string(),
        }
    }

    /// Base filename, or empty when there is no usable path.
    pub fn filename(&self) -> String {
        let path = self.path();
        if path.is_empty() {
            return String::new();
        }
        Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Lowercased extension including the leading dot, or empty.
    pub fn extension(&self) -> String {
        let filename = self.filename();
        match Path::new(&filename).extension() {
            Some(ext) => format!(".{}", ext.to_string_lossy().to_lowercase()),
            None => String::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        Url::parse(&self.0)
            .map(|u| u.scheme() == "file")
            .unwrap_or(false)
    }

    pub fn from_path(path: &Path) -> DocumentUri {
        let abs = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        match Url::from_file_path(&abs) {
            Ok(url) => DocumentUri(url.to_string()),
            Err(()) => DocumentUri(format!("file://{}", abs.display())),
        }
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentUri {
    fn from(s: &str) -> Self {
        DocumentUri(s.to_string())
    }
}

/// Pull the document URI out of request params. All `textDocument/*`
/// methods carry `params.textDocument.uri`; a few others put `uri` at the
/// top level.
pub fn extract_uri(method: &str, params: Option<&Value>) -> Option<DocumentUri> {
    if !method.starts_with(super::methods::TEXT_DOCUMENT_PREFIX) {
        return None;
    }
    let params = params?;
    if let Some(uri) = params
        .get("textDocument")
        .and_then(|td| td.get("uri"))
        .and_then(Value::as_str)
    {
        return Some(DocumentUri(uri.to_string()));
    }
    params
        .get("uri")
        .and_then(Value::as_str)
        .map(|u| DocumentUri(u.to_string()))
}

/// Pull `params.textDocument.languageId` (present on `didOpen`).
pub fn extract_language_id(params: Option<&Value>) -> String {
    params
        .and_then(|p| p.get("textDocument"))
        .and_then(|td| td.get("languageId"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_uri_views() {
        let uri = DocumentUri::from("file:///home/user/project/main.go");
        assert_eq!(uri.path(), "/home/user/project/main.go");
        assert_eq!(uri.filename(), "main.go");
        assert_eq!(uri.extension(), ".go");
        assert!(uri.is_file());
    }

    #[test]
    fn extension_is_lowercased() {
        let uri = DocumentUri::from("file:///tmp/Makefile.MK");
        assert_eq!(uri.extension(), ".mk");
    }

    #[test]
    fn no_extension_is_empty() {
        let uri = DocumentUri::from("file:///tmp/Makefile");
        assert_eq!(uri.extension(), "");
        assert_eq!(uri.filename(), "Makefile");
    }

    #[test]
    fn non_file_scheme_has_empty_path() {
        let uri = DocumentUri::from("untitled:Untitled-1");
        assert_eq!(uri.path(), "");
        assert_eq!(uri.filename(), "");
        assert!(!uri.is_file());
    }

    #[test]
    fn percent_encoded_path_is_decoded() {
        let uri = DocumentUri::from("file:///tmp/with%20space/a.rs");
        assert_eq!(uri.path(), "/tmp/with space/a.rs");
    }

    #[test]
    fn extract_uri_from_text_document_params() {
        let params = json!({ "textDocument": { "uri": "file:///x.go" } });
        let uri = extract_uri("textDocument/hover", Some(&params)).unwrap();
        assert_eq!(uri.as_str(), "file:///x.go");
    }

    #[test]
    fn extract_uri_ignores_other_methods() {
        let params = json!({ "textDocument": { "uri": "file:///x.go" } });
        assert!(extract_uri("workspace/symbol", Some(&params)).is_none());
    }

    #[test]
    fn extract_language_id_from_did_open() {
        let params = json!({ "textDocument": { "uri": "file:///x.go", "languageId": "go" } });
        assert_eq!(extract_language_id(Some(&params)), "go");
        assert_eq!(extract_language_id(None), "");
    }
}
