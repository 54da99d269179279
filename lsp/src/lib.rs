//! Language server orchestration for Swarm.
//!
//! Resolves a server for a language from the [`ServerCatalog`], installs it
//! with the [`Installer`], runs one [`Session`] per (workspace root,
//! language) under the [`SessionManager`], and fans diagnostics from every
//! session into one [`DiagnosticsHub`].

pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod installer;
pub mod launcher;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod types;
pub mod workspace;

pub(crate) mod diagnostics;

mod manager;

pub use catalog::{PlatformBinary, ServerCatalog, ServerDescriptor};
pub use config::{ConfigError, LspConfig, SwarmConfig};
pub use diagnostics::DiagnosticsHub;
pub use error::{InstallError, LspError};
pub use installer::Installer;
pub use launcher::{
    LaunchSpec, LaunchedServer, ProcessLauncher, ServerLauncher, ServerProcess, build_arguments,
};
pub use manager::SessionManager;
pub use platform::{Arch, Os, PlatformKey};
pub use session::{Session, SessionState, SessionTimeouts};
pub use types::{DiagnosticsEvent, DiagnosticsSnapshot, SessionKey};
pub use workspace::{RootMarkers, find_workspace_root};

pub use lsp_types;
pub use tokio_util::sync::CancellationToken;
