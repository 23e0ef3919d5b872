//! Remote platform detection and agent binary selection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::SshError;

/// OS family as reported by `uname -s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Linux kernel.
    Linux,
    /// macOS.
    Darwin,
}

impl OsFamily {
    /// Parse `uname -s` output.
    ///
    /// # Errors
    /// Returns [`SshError::UnsupportedOs`] for anything else.
    pub fn parse(uname_s: &str) -> Result<Self, SshError> {
        match uname_s.trim().to_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "darwin" => Ok(Self::Darwin),
            other => Err(SshError::UnsupportedOs(other.to_string())),
        }
    }

    /// Name used in staged binary file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized architecture class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// `amd64`, `x86_64`, `x86-64`.
    Amd64,
    /// `aarch64`, `arm64`.
    Arm64,
}

impl Arch {
    /// Parse any known spelling.
    ///
    /// # Errors
    /// Returns [`SshError::UnsupportedArch`] for unknown spellings.
    pub fn parse(raw: &str) -> Result<Self, SshError> {
        let lowered = raw.trim().to_lowercase();
        [Self::Amd64, Self::Arm64]
            .into_iter()
            .find(|arch| arch.aliases().contains(&lowered.as_str()))
            .ok_or(SshError::UnsupportedArch(lowered))
    }

    /// Every spelling accepted for this class, canonical first.
    #[must_use]
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Amd64 => &["amd64", "x86_64", "x86-64"],
            Self::Arm64 => &["arm64", "aarch64"],
        }
    }

    /// Canonical spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.aliases()[0]
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What we learned about a host over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// OS family.
    pub os: OsFamily,
    /// Normalized architecture.
    pub arch: Arch,
    /// Architecture exactly as reported.
    pub raw_arch: String,
    /// First package manager found on `PATH`.
    pub package_manager: Option<String>,
}

/// Shell probe printing the first available package manager.
pub const PACKAGE_MANAGER_PROBE: &str = "for pm in apt-get dnf yum zypper pacman; do \
     if command -v \"$pm\" >/dev/null 2>&1; then echo \"$pm\"; break; fi; done";

/// Find the locally staged agent binary for a platform.
///
/// Binaries are named `<prefix>-<os>-<arch>`; any alias of the architecture
/// class is accepted, so `agent-linux-x86_64` serves an `amd64` host.
///
/// # Errors
/// Returns [`SshError::AgentBinaryNotFound`] when no candidate exists.
pub fn select_agent_binary(
    dir: &Path,
    prefix: &str,
    os: OsFamily,
    arch: Arch,
) -> Result<PathBuf, SshError> {
    arch.aliases()
        .iter()
        .map(|alias| dir.join(format!("{prefix}-{os}-{alias}")))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| SshError::AgentBinaryNotFound {
            os: os.to_string(),
            arch: arch.to_string(),
            dir: dir.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_aliases_normalize() {
        for raw in ["amd64", "x86_64", "X86-64", " x86_64\n"] {
            assert_eq!(Arch::parse(raw).unwrap(), Arch::Amd64, "{raw}");
        }
        for raw in ["aarch64", "arm64"] {
            assert_eq!(Arch::parse(raw).unwrap(), Arch::Arm64, "{raw}");
        }
        assert!(matches!(
            Arch::parse("riscv64"),
            Err(SshError::UnsupportedArch(a)) if a == "riscv64"
        ));
    }

    #[test]
    fn test_os_family() {
        assert_eq!(OsFamily::parse("Linux\n").unwrap(), OsFamily::Linux);
        assert!(OsFamily::parse("FreeBSD").is_err());
    }

    #[test]
    fn test_select_agent_binary_accepts_any_alias() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent-linux-x86_64"), b"bin").unwrap();
        std::fs::write(dir.path().join("agent-linux-aarch64"), b"bin").unwrap();

        let amd = select_agent_binary(dir.path(), "agent", OsFamily::Linux, Arch::Amd64).unwrap();
        assert!(amd.ends_with("agent-linux-x86_64"));

        let arm = select_agent_binary(dir.path(), "agent", OsFamily::Linux, Arch::Arm64).unwrap();
        assert!(arm.ends_with("agent-linux-aarch64"));
    }

    #[test]
    fn test_select_agent_binary_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent-linux-amd64"), b"bin").unwrap();

        let err = select_agent_binary(dir.path(), "agent", OsFamily::Darwin, Arch::Arm64)
            .unwrap_err();
        assert!(matches!(err, SshError::AgentBinaryNotFound { .. }));
    }
}
