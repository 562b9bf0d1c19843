use crate::config::*;
use crate::consts::*;
use crate::error::Error;
use crate::executables::{InitializedExecutables, resolve_executables};
use crate::logger::Logger;
use crate::parse::*;
use anyhow::{Context, Result};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tp_netns::{LinkInspector, SandboxConfig};

const DEFAULT_LOOPBACK: &str = "lo";

/// A redirected direction with defaults applied and chain names prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedTrafficFlow {
    pub enabled: bool,
    pub port: u16,
    pub chain_name: String,
    pub redirect_chain_name: String,
    pub include_ports: Vec<u16>,
    pub exclude_ports: Vec<u16>,
    pub exclude_ports_for_uids: Vec<Exclusion>,
    pub exclude_ips: Vec<IpNet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

impl InitializedTrafficFlow {
    fn new(
        flow: &TrafficFlow,
        direction: Direction,
        name_prefix: &str,
        family: IpFamily,
    ) -> Result<Self> {
        let defaults = match direction {
            Direction::Inbound => TrafficFlow::inbound(),
            Direction::Outbound => TrafficFlow::outbound(),
        };

        let mut port = non_zero_or(flow.port, defaults.port);
        if family.is_ipv6() {
            port = non_zero_or(flow.port_ipv6, port);
        }

        let chain_name = non_empty_or(&flow.chain_name, &defaults.chain_name);
        let redirect_chain_name =
            non_empty_or(&flow.redirect_chain_name, &defaults.redirect_chain_name);

        let exclude_ports_for_uids = match direction {
            Direction::Outbound => parse_exclude_ports_for_uids(&flow.exclude_ports_for_uids)?,
            Direction::Inbound => vec![],
        };

        Ok(Self {
            enabled: flow.enabled,
            port,
            chain_name: format!("{}{}", name_prefix, chain_name),
            redirect_chain_name: format!("{}{}", name_prefix, redirect_chain_name),
            include_ports: flow.include_ports.clone(),
            exclude_ports: flow.exclude_ports.clone(),
            exclude_ports_for_uids,
            exclude_ips: parse_exclude_ports_for_ips(&flow.exclude_ports_for_ips, family)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedDns {
    pub enabled: bool,
    pub capture_all: bool,
    pub port: u16,
    /// Only addresses of this family.
    pub servers: Vec<IpAddr>,
    pub conntrack_zone_split: bool,
    pub upstream_target_chain: String,
}

impl InitializedDns {
    fn new(
        dns: &DnsConfig,
        family: IpFamily,
        executables: &InitializedExecutables,
        nameservers: &[IpAddr],
    ) -> Self {
        let functionality = &executables.functionality;

        let upstream_target_chain = if executables.has_docker_output_chain() {
            CHAIN_DOCKER_OUTPUT.to_string()
        } else {
            non_empty_or(&dns.upstream_target_chain, "RETURN")
        };

        Self {
            enabled: dns.enabled,
            capture_all: dns.capture_all,
            port: non_zero_or(dns.port, DEFAULT_DNS_PORT),
            servers: nameservers
                .iter()
                .filter(|ip| family.contains(ip))
                .copied()
                .collect(),
            conntrack_zone_split: dns.enabled
                && dns.conntrack_zone_split
                && functionality.tables.raw
                && functionality.modules.conntrack,
            upstream_target_chain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedRedirect {
    pub name_prefix: String,
    pub inbound: InitializedTrafficFlow,
    pub outbound: InitializedTrafficFlow,
    pub dns: InitializedDns,
    /// Interface to CIDR, sorted by interface name.
    pub vnet: BTreeMap<String, IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedComment {
    pub enabled: bool,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedLog {
    pub enabled: bool,
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedRetry {
    pub max_retries: usize,
    pub sleep_between_retries: Duration,
}

impl InitializedRetry {
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Everything one address family needs to build and apply its rules.
#[derive(Debug, Clone)]
pub struct InitializedConfigIPvX {
    pub family: IpFamily,
    pub executables: InitializedExecutables,
    pub loopback: String,
    pub redirect: InitializedRedirect,
    pub owner_uid: String,
    pub drop_invalid_packets: bool,
    pub comment: InitializedComment,
    pub log: InitializedLog,
    pub retry: InitializedRetry,
    pub dry_run: bool,
    pub verbose: bool,
    pub logger: Arc<Logger>,
}

impl InitializedConfigIPvX {
    pub fn new(
        cfg: &Config,
        family: IpFamily,
        executables: InitializedExecutables,
        loopback: impl Into<String>,
        owner_uid: impl Into<String>,
        nameservers: &[IpAddr],
        logger: Arc<Logger>,
    ) -> Result<Self> {
        let redirect = &cfg.redirect;
        let name_prefix = redirect.name_prefix.clone();

        let inbound =
            InitializedTrafficFlow::new(&redirect.inbound, Direction::Inbound, &name_prefix, family)
                .context("invalid inbound redirect configuration")?;
        let outbound = InitializedTrafficFlow::new(
            &redirect.outbound,
            Direction::Outbound,
            &name_prefix,
            family,
        )
        .context("invalid outbound redirect configuration")?;
        let vnet = parse_vnet(&redirect.vnet.networks, family)
            .context("invalid virtual network configuration")?;

        let dns = InitializedDns::new(&redirect.dns, family, &executables, nameservers);
        let modules = &executables.functionality.modules;

        Ok(Self {
            family,
            loopback: loopback.into(),
            redirect: InitializedRedirect {
                name_prefix,
                inbound,
                outbound,
                dns,
                vnet,
            },
            owner_uid: owner_uid.into(),
            drop_invalid_packets: cfg.drop_invalid_packets && modules.conntrack,
            comment: InitializedComment {
                enabled: !cfg.comment.disabled && modules.comment,
                prefix: cfg.comment.prefix.clone(),
            },
            log: InitializedLog {
                enabled: cfg.log.enabled,
                level: cfg.log.level,
            },
            retry: InitializedRetry {
                max_retries: cfg.retry.max_retries,
                sleep_between_retries: cfg.retry.sleep_between_retries(),
            },
            dry_run: cfg.dry_run,
            verbose: cfg.verbose,
            logger,
            executables,
        })
    }
}

/// Kernel-program settings with the defaults resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedEbpf {
    pub enabled: bool,
    pub instance_ip: Option<String>,
    pub instance_ip_env_var_name: String,
    pub bpffs_path: PathBuf,
    pub cgroup_path: PathBuf,
    pub bundle_path: PathBuf,
    pub programs_source_path: PathBuf,
    pub tc_attach_iface: Option<String>,
    pub status_port: u16,
    pub inbound_port: u16,
    pub outbound_port: u16,
    pub dns_port: u16,
    pub include_inbound_ports: Vec<u16>,
    pub exclude_inbound_ports: Vec<u16>,
    pub exclude_outbound_ports: Vec<u16>,
    pub exclude_outbound_ips: Vec<IpNet>,
}

#[derive(Debug, Clone)]
pub struct InitializedConfig {
    pub ipv4: InitializedConfigIPvX,
    pub ipv6: Option<InitializedConfigIPvX>,
    pub ebpf: InitializedEbpf,
    pub owner_uid: String,
    pub sandbox: Option<SandboxConfig>,
    pub dry_run: bool,
    pub verbose: bool,
    pub logger: Arc<Logger>,
}

impl InitializedConfig {
    /// Per-family configs in processing order.
    pub fn families(&self) -> impl Iterator<Item = &InitializedConfigIPvX> {
        std::iter::once(&self.ipv4).chain(self.ipv6.as_ref())
    }
}

impl Config {
    /// Resolve binaries, the owner and the host facts the builders need.
    pub async fn initialize(&self) -> Result<InitializedConfig> {
        let logger = Arc::new(Logger::new(self.retry.max_retries + 1));

        let owner_uid = resolve_owner_uid(&self.owner.uid)?;
        let sandbox = self
            .cni
            .as_ref()
            .map(|cni| SandboxConfig::new(cni.netns_path.clone()));

        // Outside a sandbox the links are best effort; inside one, guessing
        // from the host's links would be wrong.
        let inspector = match LinkInspector::for_sandbox(sandbox.as_ref()).await {
            Ok(inspector) => Some(inspector),
            Err(err) if sandbox.is_some() => {
                return Err(err.context("unable to query the links of the workload namespace"));
            }
            Err(err) => {
                logger.warn(format!("unable to query network links: {:#}", err));
                None
            }
        };

        let loopback = match &inspector {
            Some(inspector) => match inspector.loopback_name().await {
                Ok(name) => name,
                Err(err) => {
                    logger.warn(format!(
                        "unable to find the loopback interface, using '{}': {:#}",
                        DEFAULT_LOOPBACK, err
                    ));
                    DEFAULT_LOOPBACK.to_string()
                }
            },
            None => DEFAULT_LOOPBACK.to_string(),
        };

        let nameservers = self.nameservers()?;
        let ebpf = self.initialize_ebpf().context("invalid eBPF configuration")?;

        let executables_v4 = if self.ebpf.enabled {
            InitializedExecutables::assumed(IpFamily::V4, IptablesMode::Nft)
        } else {
            resolve_executables(IpFamily::V4, self, &logger)
                .await
                .context("unable to resolve IPv4 executables")?
        };

        let ipv4 = InitializedConfigIPvX::new(
            self,
            IpFamily::V4,
            executables_v4,
            loopback.clone(),
            owner_uid.clone(),
            &nameservers,
            logger.clone(),
        )?;

        let ipv6 = if self.ebpf.enabled || self.ip_family_mode != IpFamilyMode::Dualstack {
            None
        } else {
            self.initialize_ipv6(inspector.as_ref(), &loopback, &owner_uid, &nameservers, &logger)
                .await?
        };

        Ok(InitializedConfig {
            ipv4,
            ipv6,
            ebpf,
            owner_uid,
            sandbox,
            dry_run: self.dry_run,
            verbose: self.verbose,
            logger,
        })
    }

    async fn initialize_ipv6(
        &self,
        inspector: Option<&LinkInspector>,
        loopback: &str,
        owner_uid: &str,
        nameservers: &[IpAddr],
        logger: &Arc<Logger>,
    ) -> Result<Option<InitializedConfigIPvX>> {
        let Some(inspector) = inspector else {
            return Ok(None);
        };

        match inspector.has_local_ipv6().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("no local IPv6 address found, skipping IPv6 rules");
                return Ok(None);
            }
            Err(err) => {
                logger.warn(format!("unable to list IPv6 addresses, skipping IPv6 rules: {:#}", err));
                return Ok(None);
            }
        }

        if !self.dry_run {
            if let Err(err) = inspector.add_ipv6_passthrough_address(loopback).await {
                logger.warn(format!(
                    "failed to add the IPv6 passthrough address to {}, IPv6 rules will not be \
                     applied: {:#}",
                    loopback, err
                ));
                return Ok(None);
            }
        }

        let executables = match resolve_executables(IpFamily::V6, self, logger).await {
            Ok(executables) => executables,
            Err(err) => {
                logger.warn(format!(
                    "unable to resolve IPv6 executables, IPv6 rules will not be applied: {:#}",
                    err
                ));
                return Ok(None);
            }
        };

        InitializedConfigIPvX::new(
            self,
            IpFamily::V6,
            executables,
            loopback,
            owner_uid,
            nameservers,
            logger.clone(),
        )
        .map(Some)
    }

    /// DNS servers to redirect individually; empty unless DNS redirect is on
    /// and capture-all is off.
    fn nameservers(&self) -> Result<Vec<IpAddr>> {
        let dns = &self.redirect.dns;
        if !dns.enabled || dns.capture_all {
            return Ok(vec![]);
        }

        if !dns.servers.is_empty() {
            return dns
                .servers
                .iter()
                .map(|s| {
                    s.trim()
                        .parse::<IpAddr>()
                        .map_err(|_| anyhow::Error::from(Error::InvalidAddress(s.clone())))
                })
                .collect();
        }

        let content = std::fs::read_to_string(&dns.resolv_config_path).with_context(|| {
            format!(
                "unable to read DNS servers from {}",
                dns.resolv_config_path.display()
            )
        })?;
        Ok(parse_nameservers(&content))
    }

    /// eBPF settings with direction defaults applied; needs no host access.
    pub fn initialize_ebpf(&self) -> Result<InitializedEbpf> {
        let ebpf = &self.ebpf;
        let inbound = &self.redirect.inbound;
        let outbound = &self.redirect.outbound;

        // The kernel programs only handle IPv4.
        let exclude_outbound_ips =
            parse_exclude_ports_for_ips(&outbound.exclude_ports_for_ips, IpFamily::V4)
                .context("invalid outbound IP exclusions")?;

        Ok(InitializedEbpf {
            enabled: ebpf.enabled,
            instance_ip: ebpf.instance_ip.clone().filter(|ip| !ip.is_empty()),
            instance_ip_env_var_name: ebpf.instance_ip_env_var_name.clone(),
            bpffs_path: ebpf.bpffs_path.clone(),
            cgroup_path: ebpf.cgroup_path.clone(),
            bundle_path: ebpf.bundle_path.clone(),
            programs_source_path: ebpf.programs_source_path.clone(),
            tc_attach_iface: ebpf.tc_attach_iface.clone().filter(|i| !i.is_empty()),
            status_port: ebpf.status_port,
            inbound_port: non_zero_or(inbound.port, DEFAULT_INBOUND_PORT),
            outbound_port: non_zero_or(outbound.port, DEFAULT_OUTBOUND_PORT),
            dns_port: non_zero_or(self.redirect.dns.port, DEFAULT_DNS_PORT),
            include_inbound_ports: inbound.include_ports.clone(),
            exclude_inbound_ports: inbound.exclude_ports.clone(),
            exclude_outbound_ports: outbound.exclude_ports.clone(),
            exclude_outbound_ips,
        })
    }
}

/// Numeric uids pass through; names go through the user database.
pub fn resolve_owner_uid(owner: &str) -> Result<String> {
    let owner = owner.trim();
    if owner.parse::<u32>().is_ok() {
        return Ok(owner.to_string());
    }

    let user = nix::unistd::User::from_name(owner)
        .with_context(|| format!("failed to look up user '{}'", owner))?
        .ok_or_else(|| Error::UnknownUser(owner.to_string()))?;

    Ok(user.uid.to_string())
}

fn non_zero_or(value: u16, default: u16) -> u16 {
    if value == 0 { default } else { value }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}
