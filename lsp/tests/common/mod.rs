//! Shared fixtures for integration tests.
//!
//! A scripted in-memory language server behind [`FakeLauncher`], and small
//! archive builders for installer tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use swarm_lsp::codec::{MessageReader, MessageWriter};
use swarm_lsp::{
    Arch, CancellationToken, Installer, LaunchSpec, LaunchedServer, Os, PlatformBinary,
    PlatformKey, RootMarkers, ServerCatalog, ServerDescriptor, ServerLauncher, ServerProcess,
    SessionManager, SessionTimeouts,
};
use tokio::io::DuplexStream;
use tokio::sync::watch;

pub const LANGUAGE: &str = "csharp";
pub const SERVER: &str = "fake-ls";
pub const EXECUTABLE: &str = "bin/fake-ls";
pub const TEST_PLATFORM: PlatformKey = PlatformKey::new(Os::Linux, Arch::X64);

pub fn descriptor(download_url: &str) -> ServerDescriptor {
    let mut platforms = BTreeMap::new();
    platforms.insert(
        TEST_PLATFORM,
        PlatformBinary {
            download_url: download_url.to_string(),
            executable: EXECUTABLE.to_string(),
        },
    );
    ServerDescriptor {
        name: SERVER.to_string(),
        version: "1.0.0".to_string(),
        language_ids: vec![LANGUAGE.to_string()],
        enabled: true,
        arguments: r#"-s "{WorkspaceRoot}" --hostPID {HostProcessId}"#.to_string(),
        platforms,
    }
}

pub fn installer(install_dir: &Path, download_url: &str) -> Installer {
    Installer::new(
        Arc::new(ServerCatalog::new(vec![descriptor(download_url)])),
        install_dir,
    )
    .with_platform(TEST_PLATFORM)
}

/// Put the executable where the installer expects it so no download happens.
pub fn preinstall(install_dir: &Path) {
    let exe = install_dir
        .join(SERVER)
        .join("1.0.0")
        .join(TEST_PLATFORM.to_string())
        .join(EXECUTABLE);
    std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
    std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
}

pub fn timeouts() -> SessionTimeouts {
    SessionTimeouts {
        handshake: Duration::from_secs(5),
        request: Duration::from_secs(5),
    }
}

/// Manager over a preinstalled fake server. Workspaces are marked by `.git`.
pub fn manager(install_dir: &Path, launcher: Arc<FakeLauncher>) -> SessionManager {
    preinstall(install_dir);
    SessionManager::new(
        installer(install_dir, "https://example.invalid/fake-ls.zip"),
        launcher,
        RootMarkers::new(&[".git"]).unwrap(),
        timeouts(),
    )
}

/// Create `root/.git` and return `root/<file>` with its parent directories.
pub fn workspace_file(root: &Path, file: &str) -> PathBuf {
    std::fs::create_dir_all(root.join(".git")).unwrap();
    let path = root.join(file);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "class C {}").unwrap();
    path
}

/// How fake servers answer.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Publish one error diagnostic for every opened document.
    pub publish_diagnostics: bool,
    /// Fail `workspace/symbol` in servers whose root ends with this name.
    pub failing_symbols_root: Option<String>,
    /// Requests that never get a response.
    pub unanswered: Vec<String>,
}

/// One launched fake server, as seen by the test.
#[derive(Clone)]
pub struct FakeServer {
    pub spec: LaunchSpec,
    messages: Arc<Mutex<Vec<Value>>>,
    stop: CancellationToken,
}

impl FakeServer {
    /// Every frame the server received, in arrival order.
    pub fn messages(&self) -> Vec<Value> {
        self.messages.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(String::from))
            .collect()
    }

    /// Simulate the process dying.
    pub fn crash(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    script: Script,
    launches: AtomicUsize,
    servers: Mutex<Vec<FakeServer>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Self::default()
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn server(&self, index: usize) -> FakeServer {
        self.servers.lock().unwrap()[index].clone()
    }

    pub fn servers(&self) -> Vec<FakeServer> {
        self.servers.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<LaunchedServer> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to race.
        tokio::task::yield_now().await;

        let (client_stdin, server_stdin) = tokio::io::duplex(64 * 1024);
        let (server_stdout, client_stdout) = tokio::io::duplex(64 * 1024);
        let (exited_tx, exited_rx) = watch::channel(false);

        let server = FakeServer {
            spec: spec.clone(),
            messages: Arc::new(Mutex::new(Vec::new())),
            stop: CancellationToken::new(),
        };
        self.servers.lock().unwrap().push(server.clone());

        tokio::spawn(serve(
            server.clone(),
            self.script.clone(),
            server_stdin,
            server_stdout,
            exited_tx,
        ));

        Ok(LaunchedServer {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            process: Box::new(FakeProcess {
                exited: exited_rx,
                stop: server.stop.clone(),
            }),
        })
    }
}

struct FakeProcess {
    exited: watch::Receiver<bool>,
    stop: CancellationToken,
}

#[async_trait]
impl ServerProcess for FakeProcess {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let _ = self.exited.wait_for(|exited| *exited).await;
        Ok(Some(0))
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.stop.cancel();
        Ok(())
    }
}

async fn serve(
    server: FakeServer,
    script: Script,
    stdin: DuplexStream,
    stdout: DuplexStream,
    exited: watch::Sender<bool>,
) {
    let mut reader = MessageReader::new(stdin);
    let mut writer = MessageWriter::new(stdout);
    let root = server.spec.working_dir.clone();

    loop {
        let frame = tokio::select! {
            () = server.stop.cancelled() => break,
            frame = reader.next_message() => match frame {
                Ok(Some(frame)) => frame,
                _ => break,
            },
        };
        server.messages.lock().unwrap().push(frame.clone());

        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = frame.get("id").cloned() else {
            if method == "exit" {
                break;
            }
            if method == "textDocument/didOpen" && script.publish_diagnostics {
                let uri = frame["params"]["textDocument"]["uri"].clone();
                let publish = json!({
                    "jsonrpc": "2.0",
                    "method": "textDocument/publishDiagnostics",
                    "params": {
                        "uri": uri,
                        "diagnostics": [{
                            "range": {
                                "start": {"line": 0, "character": 0},
                                "end": {"line": 0, "character": 5}
                            },
                            "severity": 1,
                            "message": "CS0246: type not found"
                        }]
                    }
                });
                if writer.send(&publish).await.is_err() {
                    break;
                }
            }
            continue;
        };

        let reply = match method {
            m if script.unanswered.iter().any(|u| u == m) => continue,
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "capabilities": {"hoverProvider": true, "workspaceSymbolProvider": true},
                    "serverInfo": {"name": SERVER}
                }
            }),
            "textDocument/hover" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "contents": {
                        "kind": "markdown",
                        "value": format!("hover from {}", root.display())
                    }
                }
            }),
            "workspace/symbol"
                if script
                    .failing_symbols_root
                    .as_deref()
                    .is_some_and(|name| root.ends_with(name)) =>
            {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32603, "message": "index not ready"}
                })
            }
            "workspace/symbol" => {
                let file = url::Url::from_file_path(root.join("Program.cs"))
                    .map(String::from)
                    .unwrap_or_default();
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": [{
                        "name": format!("Symbol@{}", root.file_name().unwrap_or_default().to_string_lossy()),
                        "kind": 5,
                        "location": {
                            "uri": file,
                            "range": {
                                "start": {"line": 0, "character": 6},
                                "end": {"line": 0, "character": 7}
                            }
                        }
                    }]
                })
            }
            other => match language_feature(other, &frame["params"]) {
                Some(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                None => json!({"jsonrpc": "2.0", "id": id, "result": null}),
            },
        };
        if writer.send(&reply).await.is_err() {
            break;
        }
    }

    server.stop.cancel();
    let _ = writer.close().await;
    exited.send_replace(true);
}

fn range(line: u32, start: u32, end: u32) -> Value {
    json!({
        "start": {"line": line, "character": start},
        "end": {"line": line, "character": end}
    })
}

/// Canned answers for the document requests, shaped by their params.
fn language_feature(method: &str, params: &Value) -> Option<Value> {
    let uri = params["textDocument"]["uri"].clone();
    let result = match method {
        "textDocument/completion" => json!({
            "isIncomplete": false,
            "items": [
                {"label": "WriteLine", "kind": 2, "detail": "void Console.WriteLine(string)"},
                {"label": "Write", "kind": 2}
            ]
        }),
        "textDocument/definition" => json!({"uri": uri, "range": range(0, 6, 7)}),
        "textDocument/signatureHelp" => json!({
            "signatures": [{
                "label": "WriteLine(string value)",
                "parameters": [{"label": "string value"}]
            }],
            "activeSignature": 0,
            "activeParameter": 0
        }),
        "textDocument/references" => {
            let mut locations = vec![json!({"uri": uri, "range": range(4, 8, 9)})];
            if params["context"]["includeDeclaration"] == true {
                locations.insert(0, json!({"uri": uri, "range": range(0, 6, 7)}));
            }
            Value::Array(locations)
        }
        "textDocument/documentSymbol" => json!([{
            "name": "C",
            "kind": 5,
            "range": range(0, 0, 10),
            "selectionRange": range(0, 6, 7),
            "children": [{
                "name": "Run",
                "kind": 6,
                "range": range(0, 8, 9),
                "selectionRange": range(0, 8, 9)
            }]
        }]),
        "textDocument/codeAction" => {
            let diagnostics = params["context"]["diagnostics"]
                .as_array()
                .map_or(0, Vec::len);
            json!([{
                "title": format!("Fix {diagnostics} problem(s)"),
                "kind": "quickfix"
            }])
        }
        "textDocument/rename" => {
            let mut changes = serde_json::Map::new();
            changes.insert(
                uri.as_str().unwrap_or_default().to_string(),
                json!([{"range": range(0, 6, 7), "newText": params["newName"]}]),
            );
            json!({"changes": changes})
        }
        _ => return None,
    };
    Some(result)
}

/// Zip archive holding `(name, contents)` entries.
pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Gzipped tarball holding `(name, contents)` entries.
pub fn tar_gz_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, *name, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
