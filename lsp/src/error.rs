//! Error taxonomy for the orchestration core.
//!
//! [`InstallError`] is what the installer can report on its own;
//! [`LspError`] is what every public session-manager operation returns.

use std::path::PathBuf;

use crate::types::SessionKey;

/// Failures of [`crate::Installer::ensure_installed`].
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("no enabled language server configured for language '{language_id}'")]
    NotConfigured { language_id: String },

    #[error("server '{server}' has no binary for platform {platform}")]
    UnsupportedPlatform { server: String, platform: String },

    #[error("downloading {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("extracting archive into {} failed: {reason}", target.display())]
    ExtractionFailed { target: PathBuf, reason: String },

    #[error("expected executable {} is missing after extraction", path.display())]
    ExecutableMissing { path: PathBuf },
}

/// Failures of session-manager and protocol-session operations.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("no enabled language server configured for language '{language_id}'")]
    NotConfigured { language_id: String },

    #[error("installing language server failed")]
    InstallFailed(#[source] InstallError),

    #[error("launching {} failed: {reason}", executable.display())]
    LaunchFailed { executable: PathBuf, reason: String },

    #[error("handshake with '{server}' failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    #[error("no language server session owns {}", path.display())]
    SessionNotFound { path: PathBuf },

    #[error("language server session {key} is no longer running")]
    SessionDegraded { key: SessionKey },

    #[error("{method} request failed: {reason}")]
    RequestFailed { method: String, reason: String },

    #[error("{method} request was cancelled")]
    Cancelled { method: String },

    #[error("cannot express {} as a file URI", path.display())]
    InvalidPath { path: PathBuf },
}

impl From<InstallError> for LspError {
    fn from(err: InstallError) -> Self {
        match err {
            InstallError::NotConfigured { language_id } => Self::NotConfigured { language_id },
            other => Self::InstallFailed(other),
        }
    }
}

impl LspError {
    pub(crate) fn request_failed(method: &str, reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}
