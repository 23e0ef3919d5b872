//! Run description: target hosts, shared account/network config and system metadata.
//!
//! These types are loaded once from a YAML run file (or built by a caller) and
//! stay read-only for the lifetime of a run. Per-host mutable state lives in
//! the deployment manager's host handles.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Errors raised while loading or validating a run description.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The run file could not be read.
    #[error("Failed to read run file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run file is not valid YAML for this schema.
    #[error("Failed to parse run file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The run description is internally inconsistent.
    #[error("Invalid run configuration: {0}")]
    Invalid(String),
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Resource,
            Self::Yaml(_) | Self::Invalid(_) => ErrorKind::Validation,
        }
    }
}

// ============================================================================
// Hosts
// ============================================================================

/// A machine to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTarget {
    /// Agent session id as known to the controller. Changes across reboots.
    pub host_id: String,
    /// Install disk (e.g. `/dev/nvme0n1`).
    pub disk: String,
    /// Hostname to configure.
    pub hostname: String,
    /// Static addresses, bound to NICs by MAC address.
    #[serde(default)]
    pub addresses: Vec<InterfaceAddress>,
    /// SSH access, for hosts reached without an agent.
    #[serde(default)]
    pub ssh: Option<SshAccess>,
}

/// A static address assigned to the NIC with the given MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// NIC MAC address (`aa:bb:cc:dd:ee:ff`).
    pub mac: String,
    /// Address in CIDR notation; IPv4 or IPv6.
    pub cidr: String,
}

impl InterfaceAddress {
    /// Whether this is an IPv6 address.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.cidr.contains(':')
    }
}

/// SSH access configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshAccess {
    /// Address or DNS name.
    pub address: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password (also used for sudo).
    #[serde(default)]
    pub password: Option<String>,
    /// Private key file.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

impl std::fmt::Debug for SshAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAccess")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

// ============================================================================
// Shared config
// ============================================================================

/// Account created on every host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Login name.
    pub username: String,
    /// Password; when absent the account is created locked.
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How an address family (or DNS) is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// Learned from DHCP.
    #[default]
    Dhcp,
    /// Configured explicitly.
    Static,
}

/// IPv4 configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ipv4Config {
    /// Address mode.
    #[serde(default)]
    pub mode: AddressMode,
    /// Default gateway, required for static mode.
    #[serde(default)]
    pub gateway: Option<String>,
}

/// DNS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DnsConfig {
    /// DNS mode.
    #[serde(default)]
    pub mode: AddressMode,
    /// Name servers, required for static mode.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Search domains.
    #[serde(default)]
    pub search: Vec<String>,
}

/// IPv6 configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ipv6Config {
    /// Address mode.
    #[serde(default)]
    pub mode: AddressMode,
    /// Default gateway for static mode.
    #[serde(default)]
    pub gateway: Option<String>,
}

/// Network configuration applied to every host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    /// IPv4 settings.
    #[serde(default)]
    pub ipv4: Ipv4Config,
    /// DNS settings.
    #[serde(default)]
    pub dns: DnsConfig,
    /// IPv6 settings; IPv6 is left unconfigured when absent.
    #[serde(default)]
    pub ipv6: Option<Ipv6Config>,
}

/// Account and network config shared by all hosts of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Account to create.
    pub account: Account,
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
}

// ============================================================================
// System metadata
// ============================================================================

/// Base OS descriptor of the image being installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsBase {
    /// Distribution id (`ubuntu`, `debian`, `openeuler`, ...).
    pub distro: String,
    /// Release version (`22.04`).
    pub version: String,
    /// Architecture (`amd64`, `arm64`).
    pub arch: String,
    /// Package mirror base URL; distro default when absent.
    #[serde(default)]
    pub mirror: Option<String>,
}

/// A driver or tool package installed after the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverPackage {
    /// Package name; also its step name in the driver pipeline.
    pub name: String,
    /// Local source file.
    pub source: PathBuf,
}

/// OS base and package list of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMeta {
    /// OS base descriptor.
    pub os_base: OsBase,
    /// Ordered driver/tool packages.
    #[serde(default)]
    pub packages: Vec<DriverPackage>,
}

// ============================================================================
// Run spec
// ============================================================================

/// Everything needed to start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Target hosts.
    pub hosts: Vec<HostTarget>,
    /// Local path of the rootfs image.
    pub os_image_path: PathBuf,
    /// Account and network.
    #[serde(flatten)]
    pub shared: SharedConfig,
    /// OS base and packages.
    #[serde(flatten)]
    pub system: SystemMeta,
}

impl RunSpec {
    /// Parse and validate a run description from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or the description is invalid.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let spec: Self = serde_yaml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load and validate a run description from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid("no hosts configured".into()));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.host_id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "host '{}' has an empty host_id",
                    host.hostname
                )));
            }
            if !seen.insert(host.host_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate host_id '{}'",
                    host.host_id
                )));
            }
            if !is_valid_hostname(&host.hostname) {
                return Err(ConfigError::Invalid(format!(
                    "invalid hostname '{}' for host '{}'",
                    host.hostname, host.host_id
                )));
            }
            if !host.disk.starts_with("/dev/") {
                return Err(ConfigError::Invalid(format!(
                    "install disk '{}' of host '{}' is not a device path",
                    host.disk, host.host_id
                )));
            }
        }

        let net = &self.shared.network;
        if net.ipv4.mode == AddressMode::Static {
            if net.ipv4.gateway.is_none() {
                return Err(ConfigError::Invalid(
                    "static IPv4 requires a gateway".into(),
                ));
            }
            if let Some(host) = self
                .hosts
                .iter()
                .find(|h| !h.addresses.iter().any(|a| !a.is_ipv6()))
            {
                return Err(ConfigError::Invalid(format!(
                    "static IPv4 requires an IPv4 address for host '{}'",
                    host.host_id
                )));
            }
        }
        if net.dns.mode == AddressMode::Static && net.dns.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "static DNS requires at least one server".into(),
            ));
        }
        if self.shared.account.username.trim().is_empty() {
            return Err(ConfigError::Invalid("account username is empty".into()));
        }

        Ok(())
    }
}

/// RFC 1123 host name: dot-separated labels of letters, digits and inner hyphens.
fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN_YAML: &str = r"
hosts:
  - host_id: 0b6c0f5e-4f1f-4e43-9c6b-2b8b1f1d2a10
    disk: /dev/nvme0n1
    hostname: node-1
    addresses:
      - mac: 52:54:00:12:34:56
        cidr: 10.0.0.11/24
os_image_path: /srv/images/ubuntu-22.04.tar.gz
account:
  username: ops
  password: s3cret
network:
  ipv4:
    mode: static
    gateway: 10.0.0.1
  dns:
    mode: dhcp
os_base:
  distro: ubuntu
  version: '22.04'
  arch: amd64
packages:
  - name: nvidia-driver
    source: /srv/pkgs/nvidia.run
";

    #[test]
    fn test_parse_run_yaml() {
        let spec = RunSpec::from_yaml_str(RUN_YAML).unwrap();
        assert_eq!(spec.hosts.len(), 1);
        assert_eq!(spec.hosts[0].hostname, "node-1");
        assert_eq!(spec.shared.network.ipv4.mode, AddressMode::Static);
        assert_eq!(spec.shared.network.dns.mode, AddressMode::Dhcp);
        assert!(spec.shared.network.ipv6.is_none());
        assert_eq!(spec.system.packages[0].name, "nvidia-driver");
    }

    #[test]
    fn test_static_ipv4_requires_gateway() {
        let yaml = RUN_YAML.replace("    gateway: 10.0.0.1\n", "");
        let err = RunSpec::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("gateway"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_duplicate_host_ids_rejected() {
        let mut spec = RunSpec::from_yaml_str(RUN_YAML).unwrap();
        let dup = spec.hosts[0].clone();
        spec.hosts.push(dup);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_hostname_and_disk_checked() {
        for bad in ["node_1", "-node", "", "a..b"] {
            let yaml = RUN_YAML.replace("hostname: node-1", &format!("hostname: '{bad}'"));
            let err = RunSpec::from_yaml_str(&yaml).unwrap_err();
            assert!(err.to_string().contains("hostname"), "{bad}");
        }
        assert!(is_valid_hostname("node-1.rack2.example"));

        let yaml = RUN_YAML.replace("disk: /dev/nvme0n1", "disk: nvme0n1");
        assert!(RunSpec::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_passwords_redacted_in_debug() {
        let spec = RunSpec::from_yaml_str(RUN_YAML).unwrap();
        let rendered = format!("{:?}", spec.shared.account);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
