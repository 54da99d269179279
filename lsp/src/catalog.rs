//! Server catalog: which language server handles which language.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::LspConfig;
use crate::platform::{Arch, Os, PlatformKey};

const fn default_true() -> bool {
    true
}

/// Where to fetch a server for one platform, and which file inside the
/// extracted archive to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformBinary {
    pub download_url: String,
    /// Path of the executable relative to the extraction directory.
    pub executable: String,
}

/// Static description of one installable language server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub version: String,
    pub language_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Launch argument template with `{WorkspaceRoot}` and `{HostProcessId}`
    /// placeholders.
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub platforms: BTreeMap<PlatformKey, PlatformBinary>,
}

impl ServerDescriptor {
    #[must_use]
    pub fn handles(&self, language_id: &str) -> bool {
        self.language_ids
            .iter()
            .any(|id| id.eq_ignore_ascii_case(language_id))
    }

    #[must_use]
    pub fn binary_for(&self, platform: PlatformKey) -> Option<&PlatformBinary> {
        self.platforms.get(&platform)
    }
}

/// Ordered, read-only list of descriptors.
///
/// Lookup returns the first enabled descriptor for a language, so entries
/// earlier in the list shadow later ones.
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    descriptors: Vec<ServerDescriptor>,
}

impl ServerCatalog {
    #[must_use]
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Self {
        Self { descriptors }
    }

    /// The servers shipped with Swarm.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(vec![omnisharp()])
    }

    /// User-declared servers first, then the built-ins unless disabled.
    #[must_use]
    pub fn from_config(config: &LspConfig) -> Self {
        let mut descriptors = config.servers.clone();
        if config.builtin_servers {
            descriptors.extend(Self::builtin().descriptors);
        }
        Self::new(descriptors)
    }

    #[must_use]
    pub fn resolve(&self, language_id: &str) -> Option<&ServerDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.enabled && d.handles(language_id))
    }

    #[must_use]
    pub fn descriptors(&self) -> &[ServerDescriptor] {
        &self.descriptors
    }
}

fn omnisharp() -> ServerDescriptor {
    const VERSION: &str = "1.39.13";
    let release = |asset: &str| {
        format!(
            "https://github.com/OmniSharp/omnisharp-roslyn/releases/download/v{VERSION}/omnisharp-{asset}"
        )
    };

    let mut platforms = BTreeMap::new();
    platforms.insert(
        PlatformKey::new(Os::Windows, Arch::X64),
        PlatformBinary {
            download_url: release("win-x64-net6.0.zip"),
            executable: "OmniSharp.exe".to_string(),
        },
    );
    for (key, asset) in [
        (PlatformKey::new(Os::Linux, Arch::X64), "linux-x64-net6.0.tar.gz"),
        (PlatformKey::new(Os::MacOs, Arch::X64), "osx-x64-net6.0.tar.gz"),
        (PlatformKey::new(Os::MacOs, Arch::Arm64), "osx-arm64-net6.0.tar.gz"),
    ] {
        platforms.insert(
            key,
            PlatformBinary {
                download_url: release(asset),
                executable: "run".to_string(),
            },
        );
    }

    ServerDescriptor {
        name: "omnisharp".to_string(),
        version: VERSION.to_string(),
        language_ids: vec!["csharp".to_string()],
        enabled: true,
        arguments: r#"-s "{WorkspaceRoot}" --hostPID {HostProcessId}"#.to_string(),
        platforms,
    }
}
