use crate::consts::*;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// User-supplied redirection configuration, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub owner: Owner,
    pub redirect: Redirect,
    pub ebpf: Ebpf,
    pub drop_invalid_packets: bool,
    pub ip_family_mode: IpFamilyMode,
    pub log: LogConfig,
    pub retry: RetryConfig,
    /// Seconds legacy restore waits for the xtables lock (0 disables).
    pub wait: u32,
    pub wait_interval: u32,
    pub comment: CommentConfig,
    /// Present when invoked as a CNI plugin against a workload namespace.
    pub cni: Option<CniConfig>,
    pub dry_run: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Owner {
    /// Numeric uid or user name of the proxy process.
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Redirect {
    pub name_prefix: String,
    pub inbound: TrafficFlow,
    pub outbound: TrafficFlow,
    pub dns: DnsConfig,
    pub vnet: VNet,
}

/// One redirected direction. Zero ports and empty chain names fall back to
/// the direction's defaults during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficFlow {
    pub enabled: bool,
    pub port: u16,
    /// Inbound only: redirect port for IPv6 traffic.
    pub port_ipv6: u16,
    pub chain_name: String,
    pub redirect_chain_name: String,
    pub include_ports: Vec<u16>,
    pub exclude_ports: Vec<u16>,
    /// Outbound only, `<protocol:>?<ports:>?<uids>` entries.
    pub exclude_ports_for_uids: Vec<String>,
    pub exclude_ports_for_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub capture_all: bool,
    pub port: u16,
    pub servers: Vec<String>,
    pub conntrack_zone_split: bool,
    pub upstream_target_chain: String,
    pub resolv_config_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VNet {
    /// `<iface>:<cidr>` entries.
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ebpf {
    pub enabled: bool,
    pub instance_ip: Option<String>,
    pub instance_ip_env_var_name: String,
    pub bpffs_path: PathBuf,
    pub cgroup_path: PathBuf,
    /// Directory holding the prebuilt program binaries.
    pub bundle_path: PathBuf,
    /// Working directory the programs are materialized into before running.
    pub programs_source_path: PathBuf,
    pub tc_attach_iface: Option<String>,
    pub status_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamilyMode {
    #[default]
    Dualstack,
    Ipv4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub sleep_between_retries_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentConfig {
    pub disabled: bool,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniConfig {
    /// Network namespace of the workload, e.g. `/var/run/netns/cni-1234`.
    pub netns_path: PathBuf,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse configuration")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner: Owner::default(),
            redirect: Redirect::default(),
            ebpf: Ebpf::default(),
            drop_invalid_packets: false,
            ip_family_mode: IpFamilyMode::default(),
            log: LogConfig::default(),
            retry: RetryConfig::default(),
            wait: 5,
            wait_interval: 0,
            comment: CommentConfig::default(),
            cni: None,
            dry_run: false,
            verbose: false,
        }
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self {
            uid: DEFAULT_OWNER_UID.to_string(),
        }
    }
}

impl Default for Redirect {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            inbound: TrafficFlow::inbound(),
            outbound: TrafficFlow::outbound(),
            dns: DnsConfig::default(),
            vnet: VNet::default(),
        }
    }
}

impl TrafficFlow {
    pub fn inbound() -> Self {
        Self {
            port: DEFAULT_INBOUND_PORT,
            port_ipv6: DEFAULT_INBOUND_PORT_IPV6,
            chain_name: DEFAULT_INBOUND_CHAIN.to_string(),
            redirect_chain_name: DEFAULT_INBOUND_REDIRECT_CHAIN.to_string(),
            ..Self::default()
        }
    }

    pub fn outbound() -> Self {
        Self {
            port: DEFAULT_OUTBOUND_PORT,
            chain_name: DEFAULT_OUTBOUND_CHAIN.to_string(),
            redirect_chain_name: DEFAULT_OUTBOUND_REDIRECT_CHAIN.to_string(),
            ..Self::default()
        }
    }
}

impl Default for TrafficFlow {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 0,
            port_ipv6: 0,
            chain_name: String::new(),
            redirect_chain_name: String::new(),
            include_ports: vec![],
            exclude_ports: vec![],
            exclude_ports_for_uids: vec![],
            exclude_ports_for_ips: vec![],
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capture_all: true,
            port: DEFAULT_DNS_PORT,
            servers: vec![],
            conntrack_zone_split: true,
            upstream_target_chain: "RETURN".to_string(),
            resolv_config_path: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

impl Default for Ebpf {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_ip: None,
            instance_ip_env_var_name: "INSTANCE_IP".to_string(),
            bpffs_path: PathBuf::from("/run/tproxy/bpf"),
            cgroup_path: PathBuf::from("/sys/fs/cgroup"),
            bundle_path: PathBuf::from("/usr/lib/tproxy/ebpf"),
            programs_source_path: PathBuf::from("/tmp/tproxy-ebpf"),
            tc_attach_iface: None,
            status_port: 9901,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 7,
        }
    }
}

impl RetryConfig {
    pub fn sleep_between_retries(&self) -> Duration {
        Duration::from_millis(self.sleep_between_retries_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            sleep_between_retries_ms: 2000,
        }
    }
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            prefix: DEFAULT_COMMENT_PREFIX.to_string(),
        }
    }
}
