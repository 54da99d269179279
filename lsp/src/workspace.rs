//! Workspace root discovery and path containment.

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

/// File or directory name patterns that mark a workspace root.
#[derive(Debug, Clone)]
pub struct RootMarkers {
    set: GlobSet,
}

impl RootMarkers {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern.as_ref())?);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    fn matches(&self, name: &std::ffi::OsStr) -> bool {
        self.set.is_match(Path::new(name))
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Absolute, normalized form of `path`.
pub(crate) fn absolute(path: &Path) -> PathBuf {
    normalize(&std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()))
}

/// Walk upward from the document's directory to the first directory that
/// contains an entry matching `markers`. Falls back to the document's own
/// directory.
pub async fn find_workspace_root(document: &Path, markers: &RootMarkers) -> PathBuf {
    let document = absolute(document);
    let start = document
        .parent()
        .map_or_else(|| document.clone(), Path::to_path_buf);

    for dir in start.ancestors() {
        if contains_marker(dir, markers).await {
            tracing::trace!(root = %dir.display(), "Found workspace root");
            return dir.to_path_buf();
        }
    }
    start
}

async fn contains_marker(dir: &Path, markers: &RootMarkers) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if markers.matches(&entry.file_name()) {
            return true;
        }
    }
    false
}

/// Whether `path` equals or lies under `root`, comparing components
/// case-insensitively.
pub(crate) fn path_within(path: &Path, root: &Path) -> bool {
    let mut path_components = path.components();
    root.components().all(|r| {
        path_components.next().is_some_and(|p| {
            p.as_os_str()
                .to_string_lossy()
                .to_lowercase()
                .eq(&r.as_os_str().to_string_lossy().to_lowercase())
        })
    })
}
