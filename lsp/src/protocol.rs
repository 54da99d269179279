//! JSON-RPC envelopes, initialize parameters, and URI helpers.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use lsp_types::{
    CodeActionContext, CodeActionParams, CompletionParams, DocumentSymbolParams,
    GotoDefinitionParams, HoverParams, OneOf, Position, Range, ReferenceContext, ReferenceParams,
    RenameParams, SignatureHelpParams, SymbolInformation, TextDocumentIdentifier,
    TextDocumentPositionParams, Uri, WorkspaceSymbolResponse,
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::LspError;

pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Reply to a server-initiated request.
pub(crate) fn reply(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub(crate) fn reply_error(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// `initialize` parameters advertising what this client understands.
pub(crate) fn initialize_params(root: &Path, root_uri: &Uri) -> Value {
    let dynamic = json!({ "dynamicRegistration": true });
    let markup = json!(["markdown", "plaintext"]);
    // SymbolKind values 1 (File) through 26 (TypeParameter).
    let symbol_kinds: Vec<u32> = (1..=26).collect();

    json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "swarm", "version": env!("CARGO_PKG_VERSION") },
        "rootUri": root_uri.as_str(),
        "rootPath": root.to_string_lossy(),
        "workspaceFolders": [{
            "uri": root_uri.as_str(),
            "name": root
                .file_name()
                .map_or_else(|| root.to_string_lossy(), |n| n.to_string_lossy()),
        }],
        "capabilities": {
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "symbol": {
                    "dynamicRegistration": true,
                    "symbolKind": { "valueSet": symbol_kinds },
                },
            },
            "window": { "workDoneProgress": true },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": true,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false,
                },
                "completion": {
                    "dynamicRegistration": true,
                    "completionItem": {
                        "snippetSupport": true,
                        "commitCharactersSupport": true,
                        "documentationFormat": markup,
                        "deprecatedSupport": true,
                        "tagSupport": { "valueSet": [1] },
                    },
                    "contextSupport": true,
                },
                "hover": {
                    "dynamicRegistration": true,
                    "contentFormat": markup,
                },
                "signatureHelp": {
                    "dynamicRegistration": true,
                    "signatureInformation": { "documentationFormat": markup },
                },
                "definition": dynamic,
                "references": dynamic,
                "documentSymbol": {
                    "dynamicRegistration": true,
                    "symbolKind": { "valueSet": symbol_kinds },
                    "hierarchicalDocumentSymbolSupport": true,
                },
                "codeAction": dynamic,
                "rename": {
                    "dynamicRegistration": true,
                    "prepareSupport": true,
                },
                "publishDiagnostics": {
                    "relatedInformation": true,
                    "versionSupport": true,
                },
            },
        },
    })
}

/// Absolute `file://` URI for a filesystem path, with `.` and `..` resolved.
pub fn path_to_uri(path: &Path) -> Result<Uri, LspError> {
    let invalid = || LspError::InvalidPath {
        path: path.to_path_buf(),
    };
    let absolute = std::path::absolute(path).map_err(|_| invalid())?;
    let absolute = crate::workspace::normalize(&absolute);
    let url = url::Url::from_file_path(&absolute).map_err(|()| invalid())?;
    Uri::from_str(url.as_str()).map_err(|_| invalid())
}

/// Filesystem path for a `file://` URI.
#[must_use]
pub fn uri_to_path(uri: &Uri) -> Option<PathBuf> {
    url::Url::parse(uri.as_str())
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

pub(crate) fn position_params(uri: Uri, position: Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri },
        position,
    }
}

pub(crate) fn hover_params(uri: Uri, position: Position) -> HoverParams {
    HoverParams {
        text_document_position_params: position_params(uri, position),
        work_done_progress_params: Default::default(),
    }
}

pub(crate) fn completion_params(uri: Uri, position: Position) -> CompletionParams {
    CompletionParams {
        text_document_position: position_params(uri, position),
        work_done_progress_params: Default::default(),
        partial_result_params: Default::default(),
        context: None,
    }
}

pub(crate) fn definition_params(uri: Uri, position: Position) -> GotoDefinitionParams {
    GotoDefinitionParams {
        text_document_position_params: position_params(uri, position),
        work_done_progress_params: Default::default(),
        partial_result_params: Default::default(),
    }
}

pub(crate) fn signature_help_params(uri: Uri, position: Position) -> SignatureHelpParams {
    SignatureHelpParams {
        context: None,
        text_document_position_params: position_params(uri, position),
        work_done_progress_params: Default::default(),
    }
}

pub(crate) fn reference_params(
    uri: Uri,
    position: Position,
    include_declaration: bool,
) -> ReferenceParams {
    ReferenceParams {
        text_document_position: position_params(uri, position),
        work_done_progress_params: Default::default(),
        partial_result_params: Default::default(),
        context: ReferenceContext {
            include_declaration,
        },
    }
}

pub(crate) fn document_symbol_params(uri: Uri) -> DocumentSymbolParams {
    DocumentSymbolParams {
        text_document: TextDocumentIdentifier { uri },
        work_done_progress_params: Default::default(),
        partial_result_params: Default::default(),
    }
}

pub(crate) fn code_action_params(
    uri: Uri,
    range: Range,
    context: CodeActionContext,
) -> CodeActionParams {
    CodeActionParams {
        text_document: TextDocumentIdentifier { uri },
        range,
        context,
        work_done_progress_params: Default::default(),
        partial_result_params: Default::default(),
    }
}

pub(crate) fn rename_params(uri: Uri, position: Position, new_name: String) -> RenameParams {
    RenameParams {
        text_document_position: position_params(uri, position),
        new_name,
        work_done_progress_params: Default::default(),
    }
}

/// Flatten a `workspace/symbol` result into `SymbolInformation`.
///
/// `WorkspaceSymbol`s whose location is only a URI (no range) are dropped.
pub(crate) fn flatten_workspace_symbols(
    response: Option<WorkspaceSymbolResponse>,
) -> Vec<SymbolInformation> {
    match response {
        None => Vec::new(),
        Some(WorkspaceSymbolResponse::Flat(symbols)) => symbols,
        Some(WorkspaceSymbolResponse::Nested(symbols)) => symbols
            .into_iter()
            .filter_map(|symbol| {
                let OneOf::Left(location) = symbol.location else {
                    return None;
                };
                #[allow(deprecated)]
                let information = SymbolInformation {
                    name: symbol.name,
                    kind: symbol.kind,
                    tags: symbol.tags,
                    deprecated: None,
                    location,
                    container_name: symbol.container_name,
                };
                Some(information)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use lsp_types::{Location, SymbolKind, WorkspaceLocation, WorkspaceSymbol};

    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::from_str(s).unwrap()
    }

    #[test]
    fn request_omits_absent_params() {
        let json = serde_json::to_value(Request::new(3, "shutdown", None)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 3);
        assert_eq!(json["method"], "shutdown");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn notification_has_no_id() {
        let json =
            serde_json::to_value(Notification::new("initialized", Some(json!({})))).unwrap();
        assert_eq!(json["method"], "initialized");
        assert!(json.get("id").is_none());
        assert!(json["params"].is_object());
    }

    #[test]
    fn replies_echo_the_request_id() {
        let id = json!("req-7");
        let ok = reply(&id, Value::Null);
        assert_eq!(ok["id"], "req-7");
        assert!(ok["result"].is_null());
        assert!(ok.get("error").is_none());

        let err = reply_error(&id, METHOD_NOT_FOUND, "nope");
        assert_eq!(err["error"]["code"], -32601);
        assert_eq!(err["error"]["message"], "nope");
    }

    #[cfg(not(windows))]
    #[test]
    fn initialize_params_carry_root_and_capabilities() {
        let root = Path::new("/ws/app");
        let root_uri = path_to_uri(root).unwrap();
        let params = initialize_params(root, &root_uri);

        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///ws/app");
        assert_eq!(params["rootPath"], "/ws/app");
        assert_eq!(params["workspaceFolders"][0]["name"], "app");

        let text = &params["capabilities"]["textDocument"];
        assert_eq!(text["completion"]["completionItem"]["snippetSupport"], true);
        assert_eq!(
            text["completion"]["completionItem"]["commitCharactersSupport"],
            true
        );
        assert_eq!(text["hover"]["contentFormat"][0], "markdown");
        assert_eq!(text["hover"]["contentFormat"][1], "plaintext");
        assert_eq!(text["rename"]["prepareSupport"], true);
        assert_eq!(text["definition"]["dynamicRegistration"], true);
        assert_eq!(
            params["capabilities"]["workspace"]["symbol"]["symbolKind"]["valueSet"]
                .as_array()
                .unwrap()
                .len(),
            26
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn path_uri_conversion() {
        let uri = path_to_uri(Path::new("/ws/My Project/a.cs")).unwrap();
        assert_eq!(uri.as_str(), "file:///ws/My%20Project/a.cs");
        assert_eq!(
            uri_to_path(&uri).unwrap(),
            PathBuf::from("/ws/My Project/a.cs")
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn path_to_uri_resolves_dot_segments() {
        let direct = path_to_uri(Path::new("/ws/A.cs")).unwrap();
        let dotted = path_to_uri(Path::new("/ws/src/../A.cs")).unwrap();
        assert_eq!(dotted, direct);
        assert_eq!(
            path_to_uri(Path::new("/ws/./src/B.cs")).unwrap().as_str(),
            "file:///ws/src/B.cs"
        );
    }

    #[test]
    fn uri_to_path_rejects_other_schemes() {
        assert!(uri_to_path(&uri("https://example.com/a.cs")).is_none());
    }

    #[test]
    fn typed_params_serialize_to_lsp_shape() {
        let params = reference_params(uri("file:///ws/a.cs"), Position::new(3, 9), true);
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["textDocument"]["uri"], "file:///ws/a.cs");
        assert_eq!(json["position"]["line"], 3);
        assert_eq!(json["position"]["character"], 9);
        assert_eq!(json["context"]["includeDeclaration"], true);

        let rename = serde_json::to_value(rename_params(
            uri("file:///ws/a.cs"),
            Position::new(0, 6),
            "Renamed".to_string(),
        ))
        .unwrap();
        assert_eq!(rename["newName"], "Renamed");
    }

    #[test]
    fn nested_workspace_symbols_are_flattened() {
        let located = WorkspaceSymbol {
            name: "Widget".to_string(),
            kind: SymbolKind::CLASS,
            tags: None,
            container_name: Some("App".to_string()),
            location: OneOf::Left(Location::new(
                uri("file:///ws/Widget.cs"),
                Range::new(Position::new(2, 0), Position::new(10, 1)),
            )),
            data: None,
        };
        let uri_only = WorkspaceSymbol {
            name: "Lazy".to_string(),
            kind: SymbolKind::CLASS,
            tags: None,
            container_name: None,
            location: OneOf::Right(WorkspaceLocation {
                uri: uri("file:///ws/Lazy.cs"),
            }),
            data: None,
        };

        let flat =
            flatten_workspace_symbols(Some(WorkspaceSymbolResponse::Nested(vec![
                located, uri_only,
            ])));
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].name, "Widget");
        assert_eq!(flat[0].container_name.as_deref(), Some("App"));
        assert_eq!(flat[0].location.range.start.line, 2);
    }

    #[test]
    fn empty_workspace_symbol_response() {
        assert!(flatten_workspace_symbols(None).is_empty());
    }
}
