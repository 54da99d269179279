//! Installer: makes sure a language server's executable exists on disk.
//!
//! Layout is `<base>/<server>/<version>/<platform>/<executable>`. Presence of
//! the executable is the only install record; nothing else is persisted and
//! nothing is verified beyond existence.

mod archive;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::catalog::{ServerCatalog, ServerDescriptor};
use crate::error::InstallError;
use crate::platform::PlatformKey;

use archive::ArchiveKind;

pub struct Installer {
    catalog: Arc<ServerCatalog>,
    base_dir: PathBuf,
    platform: Option<PlatformKey>,
    client: reqwest::Client,
    /// One lock per version directory; installs of the same server version
    /// run one at a time.
    install_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Installer {
    #[must_use]
    pub fn new(catalog: Arc<ServerCatalog>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            base_dir: base_dir.into(),
            platform: PlatformKey::current(),
            client: reqwest::Client::new(),
            install_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Install for `platform` instead of the host.
    pub fn with_platform(mut self, platform: PlatformKey) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn catalog(&self) -> &ServerCatalog {
        &self.catalog
    }

    /// Directory a server version is extracted into for a platform.
    #[must_use]
    pub fn version_dir(&self, descriptor: &ServerDescriptor, platform: PlatformKey) -> PathBuf {
        self.base_dir
            .join(&descriptor.name)
            .join(&descriptor.version)
            .join(platform.to_string())
    }

    /// Where the executable for `language_id` lives (or would live) on this
    /// installer's platform. No I/O.
    pub fn install_location(&self, language_id: &str) -> Result<PathBuf, InstallError> {
        let descriptor = self.resolve(language_id)?;
        let (platform, binary) = self.binary(descriptor)?;
        Ok(self
            .version_dir(descriptor, platform)
            .join(&binary.executable))
    }

    fn resolve(&self, language_id: &str) -> Result<&ServerDescriptor, InstallError> {
        self.catalog
            .resolve(language_id)
            .ok_or_else(|| InstallError::NotConfigured {
                language_id: language_id.to_string(),
            })
    }

    fn binary<'a>(
        &self,
        descriptor: &'a ServerDescriptor,
    ) -> Result<(PlatformKey, &'a crate::catalog::PlatformBinary), InstallError> {
        let unsupported = |platform: String| InstallError::UnsupportedPlatform {
            server: descriptor.name.clone(),
            platform,
        };
        let platform = self.platform.ok_or_else(|| {
            unsupported(format!(
                "{}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
        })?;
        let binary = descriptor
            .binary_for(platform)
            .ok_or_else(|| unsupported(platform.to_string()))?;
        Ok((platform, binary))
    }

    /// Return the executable path for `language_id`, downloading and
    /// extracting the server first if it is not already present.
    pub async fn ensure_installed(&self, language_id: &str) -> Result<PathBuf, InstallError> {
        let descriptor = self.resolve(language_id)?;
        let (platform, binary) = self.binary(descriptor)?;

        let version_dir = self.version_dir(descriptor, platform);
        let executable = version_dir.join(&binary.executable);
        if tokio::fs::try_exists(&executable).await.unwrap_or(false) {
            tracing::debug!(
                server = %descriptor.name,
                path = %executable.display(),
                "Language server already installed"
            );
            return Ok(executable);
        }

        let lock = self.install_lock(&version_dir);
        let _guard = lock.lock().await;
        if tokio::fs::try_exists(&executable).await.unwrap_or(false) {
            tracing::debug!(
                server = %descriptor.name,
                path = %executable.display(),
                "Language server installed by a concurrent caller"
            );
            return Ok(executable);
        }

        let extraction_failed = |reason: String| InstallError::ExtractionFailed {
            target: version_dir.clone(),
            reason,
        };

        let Some(kind) = ArchiveKind::from_url(&binary.download_url) else {
            return Err(extraction_failed(format!(
                "unsupported archive type: {}",
                binary.download_url
            )));
        };

        tracing::info!(
            server = %descriptor.name,
            version = %descriptor.version,
            %platform,
            url = %binary.download_url,
            "Downloading language server"
        );

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| extraction_failed(format!("creating install directory: {e}")))?;

        // Removed when dropped, on every return path below.
        let download = tempfile::Builder::new()
            .prefix(&format!(
                "{}-{}-{}-download",
                descriptor.name, descriptor.version, platform
            ))
            .tempfile()
            .map_err(|e| InstallError::DownloadFailed {
                url: binary.download_url.clone(),
                reason: format!("creating temporary file: {e}"),
            })?;

        self.download(&binary.download_url, download.path()).await?;

        if tokio::fs::try_exists(&version_dir).await.unwrap_or(false) {
            tracing::debug!(path = %version_dir.display(), "Clearing incomplete install");
            tokio::fs::remove_dir_all(&version_dir)
                .await
                .map_err(|e| extraction_failed(format!("clearing previous install: {e}")))?;
        }
        tokio::fs::create_dir_all(&version_dir)
            .await
            .map_err(|e| extraction_failed(format!("creating version directory: {e}")))?;

        let archive_path = download.path().to_path_buf();
        let target = version_dir.clone();
        let extracted =
            tokio::task::spawn_blocking(move || archive::extract(kind, &archive_path, &target))
                .await;
        let extracted = match extracted {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(e) => Err(format!("extraction task failed: {e}")),
        };
        if let Err(reason) = extracted {
            remove_quietly(&version_dir).await;
            return Err(extraction_failed(reason));
        }

        if !tokio::fs::try_exists(&executable).await.unwrap_or(false) {
            remove_quietly(&version_dir).await;
            return Err(InstallError::ExecutableMissing { path: executable });
        }

        if !platform.is_windows() {
            mark_executable(&executable).await;
        }

        drop(download);
        tracing::info!(
            server = %descriptor.name,
            path = %executable.display(),
            "Language server installed"
        );
        Ok(executable)
    }

    fn install_lock(&self, version_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.install_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(version_dir.to_path_buf())
            .or_default()
            .clone()
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), InstallError> {
        let failed = |reason: String| InstallError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| failed(format!("opening temporary file: {e}")))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(format!("response stream error: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| failed(format!("writing temporary file: {e}")))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| failed(format!("flushing temporary file: {e}")))?;

        tracing::debug!(url, bytes = written, "Download complete");
        Ok(())
    }
}

async fn remove_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        tracing::debug!(path = %dir.display(), "Failed to remove partial install: {e}");
    }
}

#[cfg(unix)]
async fn mark_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let result = async {
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        tokio::fs::set_permissions(path, perms).await
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), "Failed to mark server executable: {e}");
    }
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) {}
