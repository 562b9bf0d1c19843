use crate::blobs::{BlobSource, DirectorySource, materialize};
use crate::maps::{PodConfig, update_pod_maps};
use crate::mounts::{BPF_FS, CGROUP2_FS, ensure_mount, read_mountinfo};
use crate::programs::{Attach, FlagContext, Programs};
use anyhow::{Context, Result};
use nix::unistd::Uid;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tp_core::{Error, InitializedConfig, InitializedEbpf, exec_cmd};
use tp_netns::{LinkInspector, SandboxConfig};

const SELF_NETNS_PATH: &str = "/proc/self/ns/net";

/// Load the default programs from the configured bundle directory and
/// register this instance in the pinned maps.
pub async fn setup(cfg: &InitializedConfig) -> Result<String> {
    let source = DirectorySource::new(&cfg.ebpf.bundle_path);
    setup_with(cfg, &Programs::default(), &source).await
}

pub async fn setup_with(
    cfg: &InitializedConfig,
    programs: &Programs,
    source: &dyn BlobSource,
) -> Result<String> {
    let ebpf = &cfg.ebpf;
    let logger = &cfg.logger;

    let instance_ip = resolve_instance_ip(ebpf, |name| std::env::var(name).ok())?;
    let iface = resolve_tc_iface(ebpf, instance_ip, cfg.sandbox.as_ref()).await;

    if cfg.dry_run {
        let ctx = FlagContext {
            ebpf,
            cgroup: &ebpf.cgroup_path,
            bpffs: &ebpf.bpffs_path,
            uid: &cfg.owner_uid,
            iface: iface.as_deref(),
        };
        let commands = programs
            .iter()
            .map(|program| {
                format!(
                    "{} {}",
                    ebpf.programs_source_path.join(program.name).display(),
                    program.flags(&ctx).join(" ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        logger.info("dry-run: eBPF programs that would be loaded:");
        logger.info_raw(&commands);
        return Ok(commands);
    }

    require_root()?;

    let mounts = read_mountinfo()?;
    let cgroup = ensure_mount(&mounts, CGROUP2_FS, &ebpf.cgroup_path)
        .context("a cgroup2 filesystem is required")?;
    let bpffs = ensure_mount(&mounts, BPF_FS, &ebpf.bpffs_path)
        .context("a bpf filesystem is required")?;

    let ctx = FlagContext {
        ebpf,
        cgroup: &cgroup,
        bpffs: &bpffs,
        uid: &cfg.owner_uid,
        iface: iface.as_deref(),
    };

    let mut outputs = Vec::new();
    for program in programs.iter() {
        if program.attach == Attach::TrafficControl && ctx.iface.is_none() {
            logger.warn(format!(
                "no interface carries {}, not loading {}",
                instance_ip, program.name
            ));
            continue;
        }

        let path = materialize(source, program.name, &ebpf.programs_source_path)?;
        let output = exec_cmd(&path, &program.flags(&ctx), cfg.sandbox.as_ref())
            .await
            .with_context(|| format!("failed to load {}", program.name))?;

        logger.info(format!("loaded {}", program.name));
        for text in [output.stdout, output.stderr] {
            let text = text.trim_end();
            if !text.is_empty() {
                outputs.push(text.to_string());
            }
        }
    }

    let netns = cfg
        .sandbox
        .as_ref()
        .map(|s| s.netns_path.as_path())
        .unwrap_or_else(|| Path::new(SELF_NETNS_PATH));
    let inode = netns_inode(netns)?;

    update_pod_maps(&bpffs, inode, instance_ip, &PodConfig::from_ebpf(ebpf))
        .context("failed to register the instance in the pinned maps")?;
    logger.info(format!("eBPF redirection set up for {}", instance_ip));

    Ok(outputs.join("\n"))
}

/// Configured instance IP, else the value of the configured env var.
pub fn resolve_instance_ip(
    ebpf: &InitializedEbpf,
    lookup_env: impl Fn(&str) -> Option<String>,
) -> Result<Ipv4Addr> {
    let raw = match &ebpf.instance_ip {
        Some(ip) => ip.clone(),
        None => lookup_env(&ebpf.instance_ip_env_var_name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::MissingInstanceIp(ebpf.instance_ip_env_var_name.clone()))?,
    };

    match raw.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(ip),
        _ => Err(Error::InvalidAddress(raw).into()),
    }
}

/// The links are read from the workload's namespace when sandboxed.
async fn resolve_tc_iface(
    ebpf: &InitializedEbpf,
    ip: Ipv4Addr,
    sandbox: Option<&SandboxConfig>,
) -> Option<String> {
    if let Some(iface) = &ebpf.tc_attach_iface {
        return Some(iface.clone());
    }

    let lookup = async {
        let links = LinkInspector::for_sandbox(sandbox).await?;
        links.interface_with_address(IpAddr::V4(ip)).await
    };
    match lookup.await {
        Ok(iface) => iface,
        Err(err) => {
            tracing::warn!("[tproxy] unable to find the interface of {}: {:#}", ip, err);
            None
        }
    }
}

fn netns_inode(path: &Path) -> Result<u32> {
    let inode = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .ino();
    u32::try_from(inode).with_context(|| format!("inode {} of {} does not fit 32 bits", inode, path.display()))
}

pub fn require_root() -> Result<()> {
    check_root(nix::unistd::geteuid())
}

fn check_root(euid: Uid) -> Result<()> {
    if euid.is_root() {
        Ok(())
    } else {
        Err(Error::NotRoot.into())
    }
}
