//! Package manager command templates.
//!
//! Every rendered command is a single idempotent `sh` one-liner.

use serde::{Deserialize, Serialize};

use super::SshDeployError;
use crate::ssh::quote;

/// Supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian, Ubuntu.
    Apt,
    /// Fedora, RHEL 8+, openEuler.
    Dnf,
    /// CentOS 7 and older RHEL.
    Yum,
    /// openSUSE, SLES.
    Zypper,
    /// Arch.
    Pacman,
}

impl PackageManager {
    /// Parse a detected manager identifier (`apt-get`, `dnf`, ...).
    ///
    /// # Errors
    /// Returns [`SshDeployError::UnsupportedPackageManager`] for anything else.
    pub fn parse(id: &str) -> Result<Self, SshDeployError> {
        match id.trim().to_lowercase().as_str() {
            "apt" | "apt-get" => Ok(Self::Apt),
            "dnf" => Ok(Self::Dnf),
            "yum" => Ok(Self::Yum),
            "zypper" => Ok(Self::Zypper),
            "pacman" => Ok(Self::Pacman),
            other => Err(SshDeployError::UnsupportedPackageManager(other.to_string())),
        }
    }

    /// Default manager of a distribution id.
    #[must_use]
    pub fn for_distro(distro: &str) -> Option<Self> {
        match distro.trim().to_lowercase().as_str() {
            "ubuntu" | "debian" | "kylin" | "uos" => Some(Self::Apt),
            "fedora" | "rhel" | "rocky" | "almalinux" | "openeuler" | "centos-stream" => {
                Some(Self::Dnf)
            }
            "centos" => Some(Self::Yum),
            "opensuse" | "opensuse-leap" | "sles" => Some(Self::Zypper),
            "arch" | "archlinux" => Some(Self::Pacman),
            _ => None,
        }
    }

    fn joined(packages: &[&str]) -> String {
        packages.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ")
    }

    /// Install packages; already-installed packages are a no-op.
    #[must_use]
    pub fn install(self, packages: &[&str]) -> String {
        let pkgs = Self::joined(packages);
        match self {
            Self::Apt => format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {pkgs}"),
            Self::Dnf => format!("dnf install -y {pkgs}"),
            Self::Yum => format!("yum install -y {pkgs}"),
            Self::Zypper => format!("zypper --non-interactive install {pkgs}"),
            Self::Pacman => format!("pacman -S --noconfirm --needed {pkgs}"),
        }
    }

    /// Remove packages that are installed; missing ones are skipped.
    #[must_use]
    pub fn uninstall(self, packages: &[&str]) -> String {
        let (query, remove) = match self {
            Self::Apt => ("dpkg -s", "DEBIAN_FRONTEND=noninteractive apt-get remove -y"),
            Self::Dnf => ("rpm -q", "dnf remove -y"),
            Self::Yum => ("rpm -q", "yum remove -y"),
            Self::Zypper => ("rpm -q", "zypper --non-interactive remove"),
            Self::Pacman => ("pacman -Q", "pacman -R --noconfirm"),
        };
        format!(
            "for p in {}; do if {query} \"$p\" >/dev/null 2>&1; then {remove} \"$p\"; fi; done",
            Self::joined(packages)
        )
    }

    /// Refresh package indexes.
    #[must_use]
    pub fn refresh(self) -> &'static str {
        match self {
            Self::Apt => "apt-get update",
            Self::Dnf => "dnf makecache",
            Self::Yum => "yum makecache",
            Self::Zypper => "zypper --non-interactive refresh",
            Self::Pacman => "pacman -Sy --noconfirm",
        }
    }

    /// Point repository definitions under `root` at `mirror`.
    ///
    /// `root` is empty for the running system or a mount point such as
    /// `/mnt/target` for a freshly extracted one.
    #[must_use]
    pub fn rewrite_sources(self, mirror: &str, root: &str) -> String {
        let mirror = mirror.trim_end_matches('/');
        let root = root.trim_end_matches('/');
        match self {
            Self::Apt => format!(
                "for f in {root}/etc/apt/sources.list {root}/etc/apt/sources.list.d/*.list; do \
                 [ -f \"$f\" ] || continue; \
                 sed -i -E 's#^(deb(-src)? (\\[[^]]*\\] )?)https?://[^ ]+#\\1{mirror}#' \"$f\"; done; \
                 for f in {root}/etc/apt/sources.list.d/*.sources; do \
                 [ -f \"$f\" ] || continue; \
                 sed -i -E 's#^URIs: .*#URIs: {mirror}#' \"$f\"; done"
            ),
            Self::Dnf | Self::Yum => format!(
                "for f in {root}/etc/yum.repos.d/*.repo; do \
                 [ -f \"$f\" ] || continue; \
                 sed -i -E -e 's/^(mirrorlist|metalink)=/#\\1=/' \
                 -e 's#^\\#?baseurl=https?://[^/]+#baseurl={mirror}#' \"$f\"; done"
            ),
            Self::Zypper => format!(
                "for f in {root}/etc/zypp/repos.d/*.repo; do \
                 [ -f \"$f\" ] || continue; \
                 sed -i -E 's#^baseurl=https?://[^/]+#baseurl={mirror}#' \"$f\"; done"
            ),
            Self::Pacman => format!(
                "echo 'Server = {mirror}/$repo/os/$arch' > {root}/etc/pacman.d/mirrorlist"
            ),
        }
    }

    /// Optionally rewrite sources, then refresh indexes.
    #[must_use]
    pub fn update_sources(self, mirror: Option<&str>) -> String {
        match mirror {
            Some(m) => format!("{} && {}", self.rewrite_sources(m, ""), self.refresh()),
            None => self.refresh().to_string(),
        }
    }

    /// Install and start Docker unless it is already present.
    #[must_use]
    pub fn install_docker(self) -> String {
        let package = match self {
            Self::Apt => "docker.io",
            Self::Dnf | Self::Yum | Self::Zypper | Self::Pacman => "docker",
        };
        format!(
            "if ! command -v docker >/dev/null 2>&1; then {} && {}; fi; \
             systemctl enable --now docker",
            self.refresh(),
            self.install(&[package])
        )
    }

    /// Tools the agent and installer scripts rely on.
    #[must_use]
    pub fn base_dependencies(self) -> String {
        let mut packages = vec!["curl", "ca-certificates", "tar", "gzip", "parted"];
        match self {
            Self::Apt => packages.extend(["dosfstools", "e2fsprogs", "gnupg"]),
            Self::Dnf | Self::Yum | Self::Zypper => packages.extend(["dosfstools", "e2fsprogs"]),
            Self::Pacman => packages.extend(["dosfstools", "e2fsprogs", "gnupg"]),
        }
        format!("{} && {}", self.refresh(), self.install(&packages))
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Pacman => "pacman",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detected_identifiers() {
        assert_eq!(PackageManager::parse("apt-get\n").unwrap(), PackageManager::Apt);
        assert_eq!(PackageManager::parse("DNF").unwrap(), PackageManager::Dnf);
        assert!(matches!(
            PackageManager::parse("emerge"),
            Err(SshDeployError::UnsupportedPackageManager(m)) if m == "emerge"
        ));
    }

    #[test]
    fn test_install_quotes_packages() {
        assert_eq!(
            PackageManager::Apt.install(&["curl", "jq"]),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y 'curl' 'jq'"
        );
        assert_eq!(
            PackageManager::Pacman.install(&["docker"]),
            "pacman -S --noconfirm --needed 'docker'"
        );
    }

    #[test]
    fn test_uninstall_skips_missing_packages() {
        let cmd = PackageManager::Dnf.uninstall(&["podman"]);
        assert!(cmd.contains("if rpm -q \"$p\""));
        assert!(cmd.contains("dnf remove -y \"$p\""));
    }

    #[test]
    fn test_docker_install_is_guarded() {
        let cmd = PackageManager::Yum.install_docker();
        assert!(cmd.starts_with("if ! command -v docker"));
        assert!(cmd.contains("yum install -y 'docker'"));
    }

    #[test]
    fn test_update_sources_rewrites_then_refreshes() {
        let cmd = PackageManager::Apt.update_sources(Some("http://mirror.local/ubuntu/"));
        assert!(cmd.contains("/etc/apt/sources.list"));
        assert!(cmd.contains("http://mirror.local/ubuntu#"));
        assert!(cmd.ends_with("&& apt-get update"));

        assert_eq!(PackageManager::Zypper.update_sources(None), "zypper --non-interactive refresh");
    }

    #[test]
    fn test_rewrite_under_target_root() {
        let cmd = PackageManager::Dnf.rewrite_sources("https://repo.example", "/mnt/target/");
        assert!(cmd.contains("/mnt/target/etc/yum.repos.d/*.repo"));
        assert!(cmd.contains("baseurl=https://repo.example#"));
    }

    #[test]
    fn test_distro_defaults() {
        assert_eq!(PackageManager::for_distro("Ubuntu"), Some(PackageManager::Apt));
        assert_eq!(PackageManager::for_distro("openEuler"), Some(PackageManager::Dnf));
        assert_eq!(PackageManager::for_distro("plan9"), None);
    }
}
