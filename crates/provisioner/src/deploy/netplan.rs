//! Netplan rendering for the installed system.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::agent::NicInfo;
use crate::model::{AddressMode, HostTarget, NetworkConfig};

/// Path of the rendered file, relative to the target root.
pub const NETPLAN_PATH: &str = "etc/netplan/01-provisioner.yaml";

/// Top-level netplan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetplanDocument {
    /// The `network:` section.
    pub network: NetplanNetwork,
}

/// Body of the `network:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetplanNetwork {
    /// Always 2.
    pub version: u8,
    /// Always `networkd`.
    pub renderer: String,
    /// One entry per hardware NIC, keyed by interface name.
    pub ethernets: BTreeMap<String, Ethernet>,
}

/// One ethernet entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ethernet {
    /// Binds the entry to a MAC.
    #[serde(rename = "match")]
    pub match_mac: MacMatch,
    /// Whether DHCPv4 is enabled.
    pub dhcp4: bool,
    /// Whether DHCPv6 is enabled; omitted without IPv6 config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp6: Option<bool>,
    /// Static routes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    /// What to ignore from the DHCPv4 lease.
    #[serde(rename = "dhcp4-overrides", skip_serializing_if = "Option::is_none")]
    pub dhcp4_overrides: Option<Dhcp4Overrides>,
    /// Static addresses as `{cidr: {lifetime}}` maps.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<BTreeMap<String, AddressOptions>>,
    /// Static name servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Nameservers>,
}

/// `match:` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacMatch {
    /// Lowercase MAC.
    pub macaddress: String,
}

/// Route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Destination.
    pub to: String,
    /// Gateway.
    pub via: String,
}

/// `dhcp4-overrides:` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dhcp4Overrides {
    /// Ignore DNS from DHCP.
    #[serde(rename = "use-dns", skip_serializing_if = "Option::is_none")]
    pub use_dns: Option<bool>,
    /// Ignore routes from DHCP.
    #[serde(rename = "use-routes", skip_serializing_if = "Option::is_none")]
    pub use_routes: Option<bool>,
}

/// Per-address options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressOptions {
    /// Address lifetime.
    pub lifetime: String,
}

/// `nameservers:` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Nameservers {
    /// Server addresses.
    pub addresses: Vec<String>,
    /// Search domains.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
}

fn overrides(network: &NetworkConfig) -> Option<Dhcp4Overrides> {
    match (network.ipv4.mode, network.dns.mode) {
        (AddressMode::Dhcp, AddressMode::Static) => Some(Dhcp4Overrides {
            use_dns: Some(false),
            use_routes: None,
        }),
        (AddressMode::Static, AddressMode::Dhcp) => Some(Dhcp4Overrides {
            use_dns: None,
            use_routes: Some(false),
        }),
        _ => None,
    }
}

fn address(cidr: &str) -> BTreeMap<String, AddressOptions> {
    BTreeMap::from([(
        cidr.to_string(),
        AddressOptions {
            lifetime: "forever".to_string(),
        },
    )])
}

/// Build the netplan document for one host.
///
/// Only NICs with a non-zero MAC get an entry. Static addresses are taken from
/// the host's configured addresses with a matching MAC.
#[must_use]
pub fn build_netplan(nics: &[NicInfo], host: &HostTarget, network: &NetworkConfig) -> NetplanDocument {
    let mut ethernets = BTreeMap::new();

    for nic in nics.iter().filter(|n| n.has_hardware_mac()) {
        let mac = nic.mac.to_lowercase();
        let assigned: Vec<_> = host
            .addresses
            .iter()
            .filter(|a| a.mac.eq_ignore_ascii_case(&mac))
            .collect();

        let mut routes = Vec::new();
        let mut addresses = Vec::new();

        let dhcp4 = network.ipv4.mode == AddressMode::Dhcp;
        let v4: Vec<_> = assigned.iter().filter(|a| !a.is_ipv6()).collect();
        if !dhcp4 && !v4.is_empty() {
            addresses.extend(v4.iter().map(|a| address(&a.cidr)));
            if let Some(gateway) = &network.ipv4.gateway {
                routes.push(Route {
                    to: "default".to_string(),
                    via: gateway.clone(),
                });
            }
        }

        let dhcp6 = network.ipv6.as_ref().map(|v6| {
            let dhcp = v6.mode == AddressMode::Dhcp;
            let v6_addrs: Vec<_> = assigned.iter().filter(|a| a.is_ipv6()).collect();
            if !dhcp && !v6_addrs.is_empty() {
                addresses.extend(v6_addrs.iter().map(|a| address(&a.cidr)));
                if let Some(gateway) = &v6.gateway {
                    routes.push(Route {
                        to: "::/0".to_string(),
                        via: gateway.clone(),
                    });
                }
            }
            dhcp
        });

        let nameservers = (network.dns.mode == AddressMode::Static).then(|| Nameservers {
            addresses: network.dns.servers.clone(),
            search: network.dns.search.clone(),
        });

        ethernets.insert(
            nic.name.clone(),
            Ethernet {
                match_mac: MacMatch { macaddress: mac },
                dhcp4,
                dhcp6,
                routes,
                dhcp4_overrides: overrides(network),
                addresses,
                nameservers,
            },
        );
    }

    NetplanDocument {
        network: NetplanNetwork {
            version: 2,
            renderer: "networkd".to_string(),
            ethernets,
        },
    }
}

/// Render the netplan YAML for one host.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_netplan(
    nics: &[NicInfo],
    host: &HostTarget,
    network: &NetworkConfig,
) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&build_netplan(nics, host, network))
}
