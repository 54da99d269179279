//! Session manager: one protocol session per (workspace root, language).
//!
//! Sessions are created lazily by [`SessionManager::ensure_session`] and
//! looked up by document path for every later notification and request.
//! Creation is single-flight per key: concurrent callers for the same key
//! share one install + launch + handshake.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use lsp_types::request::{
    CodeActionRequest, Completion, DocumentSymbolRequest, GotoDefinition, HoverRequest,
    References, Rename, SignatureHelpRequest, WorkspaceSymbolRequest,
};
use lsp_types::{
    CodeActionContext, CodeActionResponse, CompletionResponse, DocumentSymbolResponse,
    GotoDefinitionResponse, Hover, Location, Position, Range, SignatureHelp, SymbolInformation,
    Uri, WorkspaceEdit, WorkspaceSymbolParams,
};
use tokio::sync::{OnceCell, broadcast};
use tokio_util::sync::CancellationToken;

use crate::catalog::ServerCatalog;
use crate::config::LspConfig;
use crate::diagnostics::DiagnosticsHub;
use crate::error::LspError;
use crate::installer::Installer;
use crate::launcher::{LaunchSpec, ProcessLauncher, ServerLauncher};
use crate::protocol;
use crate::session::{Session, SessionState, SessionTimeouts};
use crate::types::{DiagnosticsEvent, SessionKey};
use crate::workspace::{self, RootMarkers};

type Slot = Arc<OnceCell<Arc<Session>>>;

pub struct SessionManager {
    installer: Arc<Installer>,
    launcher: Arc<dyn ServerLauncher>,
    hub: Arc<DiagnosticsHub>,
    markers: RootMarkers,
    timeouts: SessionTimeouts,
    sessions: Mutex<HashMap<SessionKey, Slot>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        installer: Installer,
        launcher: Arc<dyn ServerLauncher>,
        markers: RootMarkers,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            installer: Arc::new(installer),
            launcher,
            hub: Arc::new(DiagnosticsHub::new()),
            markers,
            timeouts,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Manager for `[lsp]` settings, launching real processes.
    pub fn from_config(config: &LspConfig) -> Result<Self, globset::Error> {
        let catalog = Arc::new(ServerCatalog::from_config(config));
        let installer = Installer::new(catalog, config.resolved_install_dir());
        Ok(Self::new(
            installer,
            Arc::new(ProcessLauncher),
            RootMarkers::new(&config.root_markers)?,
            SessionTimeouts {
                handshake: config.handshake_timeout(),
                request: config.request_timeout(),
            },
        ))
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    #[must_use]
    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    #[must_use]
    pub fn catalog(&self) -> &ServerCatalog {
        self.installer.catalog()
    }

    /// The diagnostics fan-in shared by every session of this manager.
    #[must_use]
    pub fn diagnostics(&self) -> Arc<DiagnosticsHub> {
        self.hub.clone()
    }

    #[must_use]
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticsEvent> {
        self.hub.subscribe()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Slot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure a session exists for the document's workspace and language,
    /// then mark the document open in it.
    pub async fn ensure_session(
        &self,
        path: &Path,
        language_id: &str,
        initial_content: &str,
    ) -> Result<(), LspError> {
        let path = workspace::absolute(path);
        let uri = protocol::path_to_uri(&path)?;
        let root = workspace::find_workspace_root(&path, &self.markers).await;
        let key = SessionKey::new(root, language_id);

        let session = self.session_for_key(&key).await?;
        session
            .open_document(&uri, language_id, initial_content)
            .await
    }

    async fn session_for_key(&self, key: &SessionKey) -> Result<Arc<Session>, LspError> {
        let (slot, replaced) = {
            let mut table = self.table();
            let current = table.entry(key.clone()).or_default().clone();
            match current.get() {
                Some(session) if session.state().is_terminal() => {
                    let fresh: Slot = Arc::default();
                    table.insert(key.clone(), fresh.clone());
                    (fresh, Some(session.clone()))
                }
                _ => (current, None),
            }
        };

        if let Some(old) = replaced {
            tracing::info!(key = %key, state = ?old.state(), "Replacing stopped session");
            old.dispose().await;
        }

        match slot.get_or_try_init(|| self.create_session(key)).await {
            Ok(session) => Ok(session.clone()),
            Err(e) => {
                let mut table = self.table();
                if table
                    .get(key)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && s.get().is_none())
                {
                    table.remove(key);
                }
                Err(e)
            }
        }
    }

    async fn create_session(&self, key: &SessionKey) -> Result<Arc<Session>, LspError> {
        let language_id = key.language_id();
        let descriptor = self
            .catalog()
            .resolve(language_id)
            .ok_or_else(|| LspError::NotConfigured {
                language_id: language_id.to_string(),
            })?
            .clone();

        let executable = self.installer.ensure_installed(language_id).await?;
        let spec = LaunchSpec::from_template(
            &descriptor.name,
            executable.clone(),
            &descriptor.arguments,
            key.root(),
        )
        .map_err(|e| LspError::LaunchFailed {
            executable: executable.clone(),
            reason: format!("bad argument template: {e}"),
        })?;

        tracing::info!(
            server = %descriptor.name,
            language = language_id,
            root = %key.root().display(),
            "Starting language server"
        );
        let launched = self
            .launcher
            .launch(&spec)
            .await
            .map_err(|e| LspError::LaunchFailed {
                executable,
                reason: e.to_string(),
            })?;

        Session::start(
            key.clone(),
            &descriptor.name,
            launched,
            self.hub.clone(),
            self.timeouts,
        )
        .await
    }

    /// Pick the session owning `path`.
    ///
    /// Among sessions whose root contains the path: one with the document
    /// open wins, then the deepest root, then the lowest language id.
    async fn session_for_document(&self, path: &Path) -> Result<(Arc<Session>, Uri), LspError> {
        let path = workspace::absolute(path);
        let uri = protocol::path_to_uri(&path)?;

        let candidates: Vec<Arc<Session>> = self
            .table()
            .iter()
            .filter(|(key, _)| workspace::path_within(&path, key.root()))
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();

        let mut ranked = Vec::with_capacity(candidates.len());
        for session in candidates {
            let open = session.has_document(&uri).await;
            ranked.push((open, session));
        }
        ranked.sort_by(|(a_open, a), (b_open, b)| {
            b_open
                .cmp(a_open)
                .then_with(|| b.key().depth().cmp(&a.key().depth()))
                .then_with(|| a.key().language_id().cmp(b.key().language_id()))
        });

        ranked
            .into_iter()
            .next()
            .map(|(_, session)| (session, uri))
            .ok_or(LspError::SessionNotFound { path })
    }

    /// Send the whole new text to the owning session.
    pub async fn notify_changed(&self, path: &Path, content: &str) -> Result<(), LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session.change_document(&uri, content).await
    }

    /// Close the document. The session stays up.
    pub async fn notify_closed(&self, path: &Path) -> Result<(), LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session.close_document(&uri).await
    }

    pub async fn request_completion(
        &self,
        path: &Path,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<Option<CompletionResponse>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<Completion>(protocol::completion_params(uri, position), cancel)
            .await
    }

    pub async fn request_hover(
        &self,
        path: &Path,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<Option<Hover>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<HoverRequest>(protocol::hover_params(uri, position), cancel)
            .await
    }

    pub async fn request_definition(
        &self,
        path: &Path,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<Option<GotoDefinitionResponse>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<GotoDefinition>(protocol::definition_params(uri, position), cancel)
            .await
    }

    pub async fn request_signature_help(
        &self,
        path: &Path,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<Option<SignatureHelp>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<SignatureHelpRequest>(protocol::signature_help_params(uri, position), cancel)
            .await
    }

    pub async fn request_references(
        &self,
        path: &Path,
        position: Position,
        include_declaration: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Location>>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<References>(
                protocol::reference_params(uri, position, include_declaration),
                cancel,
            )
            .await
    }

    pub async fn request_document_symbols(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<DocumentSymbolResponse>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<DocumentSymbolRequest>(protocol::document_symbol_params(uri), cancel)
            .await
    }

    pub async fn request_code_actions(
        &self,
        path: &Path,
        range: Range,
        context: CodeActionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<CodeActionResponse>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<CodeActionRequest>(protocol::code_action_params(uri, range, context), cancel)
            .await
    }

    pub async fn request_rename(
        &self,
        path: &Path,
        position: Position,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkspaceEdit>, LspError> {
        let (session, uri) = self.session_for_document(path).await?;
        session
            .request::<Rename>(
                protocol::rename_params(uri, position, new_name.to_string()),
                cancel,
            )
            .await
    }

    /// Query every ready session concurrently and merge what succeeds.
    /// Failing sessions are logged and left out.
    pub async fn request_workspace_symbols(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Vec<SymbolInformation> {
        let sessions: Vec<Arc<Session>> = self
            .table()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .filter(|session| session.state() == SessionState::Ready)
            .collect();

        let queries = sessions.iter().map(|session| async move {
            let params = WorkspaceSymbolParams {
                query: query.to_string(),
                work_done_progress_params: Default::default(),
                partial_result_params: Default::default(),
            };
            (
                session,
                session
                    .request::<WorkspaceSymbolRequest>(params, cancel)
                    .await,
            )
        });

        let mut merged = Vec::new();
        for (session, result) in join_all(queries).await {
            match result {
                Ok(response) => merged.extend(protocol::flatten_workspace_symbols(response)),
                Err(e) => {
                    tracing::warn!(key = %session.key(), "Workspace symbol query failed: {e}");
                }
            }
        }
        merged
    }

    /// Every registered session and its state, ordered by key.
    #[must_use]
    pub fn session_states(&self) -> Vec<(SessionKey, SessionState)> {
        let mut states: Vec<(SessionKey, SessionState)> = self
            .table()
            .iter()
            .filter_map(|(key, slot)| slot.get().map(|s| (key.clone(), s.state())))
            .collect();
        states.sort_by_cached_key(|(key, _)| key.to_string());
        states
    }

    /// Dispose every session and empty the table. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.table().drain().map(|(_, slot)| slot).collect();
        let sessions: Vec<Arc<Session>> = slots
            .iter()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Shutting down language server sessions");
        join_all(sessions.iter().map(|session| session.dispose())).await;
    }
}
