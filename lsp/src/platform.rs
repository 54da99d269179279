//! Host platform identification.
//!
//! Platform keys render as runtime identifiers (`linux-x64`, `osx-arm64`,
//! `win-x64`). The same string is the catalog lookup key and the install
//! path segment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Os {
    Windows,
    Linux,
    MacOs,
}

impl Os {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "win",
            Self::Linux => "linux",
            Self::MacOs => "osx",
        }
    }

    #[must_use]
    pub fn current() -> Option<Self> {
        match std::env::consts::OS {
            "windows" => Some(Self::Windows),
            "linux" => Some(Self::Linux),
            "macos" => Some(Self::MacOs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
        }
    }

    #[must_use]
    pub fn current() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Self::X64),
            "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

/// An (os, arch) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformKey {
    pub os: Os,
    pub arch: Arch,
}

impl PlatformKey {
    #[must_use]
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// The platform this process runs on, or `None` for an OS/arch
    /// combination no catalog can describe.
    #[must_use]
    pub fn current() -> Option<Self> {
        Some(Self::new(Os::current()?, Arch::current()?))
    }

    #[must_use]
    pub fn is_windows(self) -> bool {
        self.os == Os::Windows
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os.as_str(), self.arch.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognised platform key '{0}'")]
pub struct ParsePlatformError(String);

impl FromStr for PlatformKey {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let Some((os, arch)) = lower.split_once('-') else {
            return Err(ParsePlatformError(s.to_string()));
        };
        let os = match os {
            "win" | "windows" => Os::Windows,
            "linux" => Os::Linux,
            "osx" | "macos" => Os::MacOs,
            _ => return Err(ParsePlatformError(s.to_string())),
        };
        let arch = match arch {
            "x64" | "x86_64" => Arch::X64,
            "arm64" | "aarch64" => Arch::Arm64,
            _ => return Err(ParsePlatformError(s.to_string())),
        };
        Ok(Self::new(os, arch))
    }
}

impl TryFrom<String> for PlatformKey {
    type Error = ParsePlatformError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlatformKey> for String {
    fn from(key: PlatformKey) -> Self {
        key.to_string()
    }
}
