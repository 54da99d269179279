use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::json;
use swarm_lsp::lsp_types::{CodeActionContext, Diagnostic, Position, Range, Uri};
use swarm_lsp::protocol;
use swarm_lsp::{CancellationToken, LspConfig, PlatformKey, SessionManager};
use tokio::sync::broadcast::error::RecvError;

use crate::{Command, DocumentArgs, PositionArgs};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Language id for a file extension.
pub(crate) fn infer_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let language = match ext.as_str() {
        "cs" | "csx" => "csharp",
        "rs" => "rust",
        "py" | "pyi" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        "go" => "go",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "java" => "java",
        _ => return None,
    };
    Some(language)
}

fn language_for(doc: &DocumentArgs) -> Result<String> {
    if let Some(language) = &doc.language {
        return Ok(language.clone());
    }
    infer_language(&doc.file)
        .map(str::to_string)
        .with_context(|| {
            format!(
                "cannot infer a language for {}; pass --language",
                doc.file.display()
            )
        })
}

fn position(pos: PositionArgs) -> Position {
    Position::new(pos.line, pos.character)
}

/// Read the document and open it in its workspace session.
async fn open(manager: &SessionManager, doc: &DocumentArgs) -> Result<()> {
    let language = language_for(doc)?;
    let text = tokio::fs::read_to_string(&doc.file)
        .await
        .with_context(|| format!("reading {}", doc.file.display()))?;
    manager
        .ensure_session(&doc.file, &language, &text)
        .await
        .with_context(|| format!("starting a {language} session for {}", doc.file.display()))?;
    Ok(())
}

pub(crate) async fn run(command: Command, config: &LspConfig) -> Result<()> {
    let manager = SessionManager::from_config(config).context("invalid root_markers")?;
    let result = execute(&manager, command).await;
    manager.shutdown().await;
    result
}

async fn execute(manager: &SessionManager, command: Command) -> Result<()> {
    let cancel = CancellationToken::new();
    match command {
        Command::Servers => list_servers(manager),
        Command::Platform => match PlatformKey::current() {
            Some(key) => {
                println!("{key}");
                Ok(())
            }
            None => bail!(
                "unsupported platform {}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        },
        Command::Install { language } => {
            let path = manager.installer().ensure_installed(&language).await?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Hover { doc, pos } => {
            open(manager, &doc).await?;
            print_json(
                &manager
                    .request_hover(&doc.file, position(pos), &cancel)
                    .await?,
            )
        }
        Command::Completion { doc, pos } => {
            open(manager, &doc).await?;
            print_json(
                &manager
                    .request_completion(&doc.file, position(pos), &cancel)
                    .await?,
            )
        }
        Command::Definition { doc, pos } => {
            open(manager, &doc).await?;
            print_json(
                &manager
                    .request_definition(&doc.file, position(pos), &cancel)
                    .await?,
            )
        }
        Command::SignatureHelp { doc, pos } => {
            open(manager, &doc).await?;
            print_json(
                &manager
                    .request_signature_help(&doc.file, position(pos), &cancel)
                    .await?,
            )
        }
        Command::References {
            doc,
            pos,
            include_declaration,
        } => {
            open(manager, &doc).await?;
            print_json(
                &manager
                    .request_references(&doc.file, position(pos), include_declaration, &cancel)
                    .await?,
            )
        }
        Command::Symbols { doc } => {
            open(manager, &doc).await?;
            print_json(&manager.request_document_symbols(&doc.file, &cancel).await?)
        }
        Command::CodeActions {
            doc,
            pos,
            end_line,
            end_character,
        } => {
            open(manager, &doc).await?;
            let start = position(pos);
            let end = Position::new(
                end_line.unwrap_or(start.line),
                end_character.unwrap_or(start.character),
            );
            let range = Range::new(start, end);
            let uri = protocol::path_to_uri(&doc.file)?;
            let snapshot = manager.diagnostics().snapshot();
            let context = CodeActionContext {
                diagnostics: diagnostics_in_range(snapshot.documents(), &uri, range),
                only: None,
                trigger_kind: None,
            };
            print_json(
                &manager
                    .request_code_actions(&doc.file, range, context, &cancel)
                    .await?,
            )
        }
        Command::Rename { doc, pos, new_name } => {
            open(manager, &doc).await?;
            print_json(
                &manager
                    .request_rename(&doc.file, position(pos), &new_name, &cancel)
                    .await?,
            )
        }
        Command::WorkspaceSymbols { doc, query } => {
            open(manager, &doc).await?;
            print_json(&manager.request_workspace_symbols(&query, &cancel).await)
        }
        Command::Diagnostics { doc, wait } => wait_for_diagnostics(manager, &doc, wait).await,
    }
}

/// Diagnostics published for `uri` whose lines overlap `range`.
fn diagnostics_in_range(
    documents: &[(Uri, Vec<Diagnostic>)],
    uri: &Uri,
    range: Range,
) -> Vec<Diagnostic> {
    documents
        .iter()
        .filter(|(doc, _)| doc == uri)
        .flat_map(|(_, items)| items.iter())
        .filter(|d| d.range.start.line <= range.end.line && d.range.end.line >= range.start.line)
        .cloned()
        .collect()
}

fn list_servers(manager: &SessionManager) -> Result<()> {
    let platform = PlatformKey::current();
    let installer = manager.installer();
    let servers: Vec<_> = manager
        .catalog()
        .descriptors()
        .iter()
        .map(|d| {
            let installed = platform.and_then(|p| {
                d.binary_for(p)
                    .map(|b| installer.version_dir(d, p).join(&b.executable).is_file())
            });
            json!({
                "name": d.name,
                "version": d.version,
                "languages": d.language_ids,
                "enabled": d.enabled,
                "platforms": d.platforms.keys().map(ToString::to_string).collect::<Vec<_>>(),
                "installed": installed,
            })
        })
        .collect();
    print_json(&servers)
}

async fn wait_for_diagnostics(
    manager: &SessionManager,
    doc: &DocumentArgs,
    wait_secs: u64,
) -> Result<()> {
    let mut events = manager.subscribe_diagnostics();
    open(manager, doc).await?;
    let target = protocol::path_to_uri(&doc.file)?;

    let waited = tokio::time::timeout(Duration::from_secs(wait_secs), async {
        loop {
            match events.recv().await {
                Ok(event) if event.uri == target => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    if waited.is_err() {
        tracing::info!(uri = target.as_str(), "No diagnostics published before timeout");
    }

    let diagnostics = manager.diagnostics().diagnostics_for(&target);
    print_json(&json!({
        "uri": target.as_str(),
        "diagnostics": diagnostics,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_common_languages() {
        assert_eq!(infer_language(Path::new("src/Program.cs")), Some("csharp"));
        assert_eq!(infer_language(Path::new("lib.RS")), Some("rust"));
        assert_eq!(infer_language(Path::new("a/b/c.hpp")), Some("cpp"));
        assert_eq!(infer_language(Path::new("README")), None);
        assert_eq!(infer_language(Path::new("notes.txt")), None);
    }

    fn diagnostic(line: u32, message: &str) -> Diagnostic {
        Diagnostic {
            range: Range::new(Position::new(line, 0), Position::new(line, 4)),
            message: message.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn code_action_diagnostics_come_from_the_requested_file_only() {
        use std::str::FromStr;

        let here = Uri::from_str("file:///ws/A.cs").unwrap();
        let elsewhere = Uri::from_str("file:///ws/B.cs").unwrap();
        let documents = vec![
            (
                elsewhere,
                vec![diagnostic(3, "other file"), diagnostic(4, "other file")],
            ),
            (
                here.clone(),
                vec![diagnostic(1, "above"), diagnostic(3, "inside"), diagnostic(9, "below")],
            ),
        ];

        let range = Range::new(Position::new(2, 0), Position::new(5, 0));
        let picked = diagnostics_in_range(&documents, &here, range);

        let messages: Vec<_> = picked.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["inside"]);
    }
}
