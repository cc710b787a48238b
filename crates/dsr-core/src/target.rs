//! Build target identity: an (OS, architecture) pair.
//!
//! Targets are immutable values with the canonical string form
//! `os/arch` (e.g. `linux/amd64`). They serialize as that string so
//! config maps and manifests stay human-readable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DsrError, Result};

/// Operating system family of a build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

impl Os {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Os {
    type Err = DsrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linux" => Ok(Os::Linux),
            "darwin" | "macos" => Ok(Os::Darwin),
            "windows" => Ok(Os::Windows),
            other => Err(DsrError::Config(format!("unsupported os: {other}"))),
        }
    }
}

/// CPU architecture of a build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = DsrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(DsrError::Config(format!("unsupported arch: {other}"))),
        }
    }
}

/// An (OS, architecture) pair a tool is built for.
///
/// `Ord` follows (os, arch) declaration order, which gives manifests a
/// deterministic target order regardless of completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    pub os: Os,
    pub arch: Arch,
}

impl Target {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Canonical `os/arch` form, e.g. `linux/amd64`.
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }

    /// Filesystem-safe form, e.g. `linux-amd64`.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Target {
    type Err = DsrError;

    fn from_str(s: &str) -> Result<Self> {
        let (os, arch) = s
            .split_once('/')
            .ok_or_else(|| DsrError::Config(format!("invalid target (want os/arch): {s}")))?;
        Ok(Target {
            os: os.parse()?,
            arch: arch.parse()?,
        })
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
