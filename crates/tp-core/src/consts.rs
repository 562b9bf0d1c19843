use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub const DNS_PORT: u16 = 53;

pub const LOCALHOST_CIDR_IPV4: &str = "127.0.0.1/32";
pub const LOCALHOST_CIDR_IPV6: &str = "::1/128";

/// Source address the proxy uses when forwarding inbound passthrough traffic
/// to the application, so the outbound chain can recognise it.
pub const INBOUND_PASSTHROUGH_SOURCE_CIDR_IPV4: &str = "127.0.0.6/32";
pub const INBOUND_PASSTHROUGH_SOURCE_CIDR_IPV6: &str = "::6/128";

pub const CHAIN_DOCKER_OUTPUT: &str = "DOCKER_OUTPUT";

pub const FLAG_VERSION: &str = "--version";
pub const FLAG_NO_FLUSH: &str = "--noflush";
pub const FLAG_TEST: &str = "--test";
pub const FLAG_WAIT: &str = "--wait";
pub const FLAG_WAIT_INTERVAL: &str = "--wait-interval";

pub const FALLBACK_EXECUTABLE_LOCATIONS: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

pub const OUTPUT_LOG_PREFIX: &str = "OUTPUT:";
pub const PREROUTING_LOG_PREFIX: &str = "PREROUTING:";

pub const DEFAULT_NAME_PREFIX: &str = "TPROXY_MESH_";
pub const DEFAULT_COMMENT_PREFIX: &str = "tproxy/mesh/transparent/proxy";
pub const DEFAULT_INBOUND_CHAIN: &str = "INBOUND";
pub const DEFAULT_INBOUND_REDIRECT_CHAIN: &str = "INBOUND_REDIRECT";
pub const DEFAULT_OUTBOUND_CHAIN: &str = "OUTBOUND";
pub const DEFAULT_OUTBOUND_REDIRECT_CHAIN: &str = "OUTBOUND_REDIRECT";

pub const DEFAULT_INBOUND_PORT: u16 = 15006;
pub const DEFAULT_INBOUND_PORT_IPV6: u16 = 15010;
pub const DEFAULT_OUTBOUND_PORT: u16 = 15001;
pub const DEFAULT_DNS_PORT: u16 = 15053;
pub const DEFAULT_OWNER_UID: &str = "5678";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Binary name prefix (`iptables` / `ip6tables`).
    pub fn command_prefix(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    pub fn localhost(self) -> &'static str {
        match self {
            IpFamily::V4 => LOCALHOST_CIDR_IPV4,
            IpFamily::V6 => LOCALHOST_CIDR_IPV6,
        }
    }

    pub fn inbound_passthrough_source(self) -> &'static str {
        match self {
            IpFamily::V4 => INBOUND_PASSTHROUGH_SOURCE_CIDR_IPV4,
            IpFamily::V6 => INBOUND_PASSTHROUGH_SOURCE_CIDR_IPV6,
        }
    }

    pub fn contains(self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (IpFamily::V4, IpAddr::V4(_)) | (IpFamily::V6, IpAddr::V6(_))
        )
    }

    pub fn is_ipv6(self) -> bool {
        self == IpFamily::V6
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Rule-engine flavor of the packet-filter binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IptablesMode {
    Nft,
    Legacy,
}

impl IptablesMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IptablesMode::Nft => "nft",
            IptablesMode::Legacy => "legacy",
        }
    }

    /// Map the backend marker printed by `--version` (e.g. `nf_tables`).
    pub fn from_version_marker(marker: &str) -> Option<Self> {
        match marker {
            "nf_tables" => Some(IptablesMode::Nft),
            "legacy" => Some(IptablesMode::Legacy),
            _ => None,
        }
    }
}

impl fmt::Display for IptablesMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolL4 {
    Tcp,
    Udp,
}

impl ProtocolL4 {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolL4::Tcp => "tcp",
            ProtocolL4::Udp => "udp",
        }
    }
}

impl FromStr for ProtocolL4 {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProtocolL4::Tcp),
            "udp" => Ok(ProtocolL4::Udp),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ProtocolL4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
