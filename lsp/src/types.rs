//! Public value types shared by the session manager and its callers.
//!
//! [`SessionKey`] identifies a live protocol session, [`DiagnosticsEvent`] is
//! what the fan-in broadcasts, and [`DiagnosticsSnapshot`] is the read-side
//! view over the latest diagnostics per document.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use lsp_types::{Diagnostic, DiagnosticSeverity, Uri};

/// Identity of one protocol session: a workspace root and a language id.
///
/// Roots compare case-insensitively; the language id compares exactly.
#[derive(Debug, Clone)]
pub struct SessionKey {
    root: PathBuf,
    folded_root: String,
    language_id: String,
}

impl SessionKey {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, language_id: impl Into<String>) -> Self {
        let root = root.into();
        let folded_root = fold_path(&root);
        Self {
            root,
            folded_root,
            language_id: language_id.into(),
        }
    }

    /// The workspace root as it was first observed.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    /// Number of path components in the root; deeper roots win lookups.
    pub(crate) fn depth(&self) -> usize {
        self.root.components().count()
    }
}

fn fold_path(path: &Path) -> String {
    path.to_string_lossy()
        .trim_end_matches(['/', '\\'])
        .to_lowercase()
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded_root == other.folded_root && self.language_id == other.language_id
    }
}

impl Eq for SessionKey {}

impl Hash for SessionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded_root.hash(state);
        self.language_id.hash(state);
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.language_id, self.root.display())
    }
}

/// Diagnostics pushed by a server for one document.
#[derive(Debug, Clone)]
pub struct DiagnosticsEvent {
    pub uri: Uri,
    pub version: Option<i32>,
    pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticsEvent {
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        crate::protocol::uri_to_path(&self.uri)
    }
}

/// Immutable snapshot of all diagnostics.
///
/// Documents with at least one error come first, then ordering is by URI.
/// Counts are derived from `documents` on demand.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    documents: Vec<(Uri, Vec<Diagnostic>)>,
}

fn is_error(diagnostic: &Diagnostic) -> bool {
    diagnostic.severity == Some(DiagnosticSeverity::ERROR)
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(mut documents: Vec<(Uri, Vec<Diagnostic>)>) -> Self {
        documents.sort_by(|a, b| {
            let a_errors = a.1.iter().any(is_error);
            let b_errors = b.1.iter().any(is_error);
            b_errors
                .cmp(&a_errors)
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });
        Self { documents }
    }

    #[must_use]
    pub fn documents(&self) -> &[(Uri, Vec<Diagnostic>)] {
        &self.documents
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn count(&self, severity: DiagnosticSeverity) -> usize {
        self.documents
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity == Some(severity))
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count(DiagnosticSeverity::ERROR)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count(DiagnosticSeverity::WARNING)
    }

    #[must_use]
    pub fn info_count(&self) -> usize {
        self.count(DiagnosticSeverity::INFORMATION)
    }

    #[must_use]
    pub fn hint_count(&self) -> usize {
        self.count(DiagnosticSeverity::HINT)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.documents.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status like `"E:3 W:5"`, empty when there is nothing to show.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
