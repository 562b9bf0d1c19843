use anyhow::{Context, Result};
use aya::maps::{HashMap, Map, MapData};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::Path;
use tp_core::InitializedEbpf;

/// Maximum entries of every list in [`PodConfig`].
pub const MAX_ITEM_LEN: usize = 10;

pub const NETNS_POD_IPS_MAP: &str = "netns_pod_ips";
pub const LOCAL_POD_IPS_MAP: &str = "local_pod_ips";

/// IPv4 stored in the last word of an IPv6-sized key, network byte order.
pub type IpKey = [u32; 4];

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cidr {
    pub net: u32,
    pub mask: u8,
    pub _pad: [u8; 3],
}

unsafe impl aya::Pod for Cidr {}

/// Per-instance policy read by the kernel programs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PodConfig {
    pub status_port: u16,
    pub _pad: u16,
    pub exclude_out_ranges: [Cidr; MAX_ITEM_LEN],
    pub include_out_ranges: [Cidr; MAX_ITEM_LEN],
    pub include_in_ports: [u16; MAX_ITEM_LEN],
    pub include_out_ports: [u16; MAX_ITEM_LEN],
    pub exclude_in_ports: [u16; MAX_ITEM_LEN],
    pub exclude_out_ports: [u16; MAX_ITEM_LEN],
}

unsafe impl aya::Pod for PodConfig {}

impl PodConfig {
    pub fn from_ebpf(ebpf: &InitializedEbpf) -> Self {
        let mut pod = PodConfig {
            status_port: ebpf.status_port,
            ..Default::default()
        };

        fill_ports(&mut pod.include_in_ports, &ebpf.include_inbound_ports, "included inbound");
        fill_ports(&mut pod.exclude_in_ports, &ebpf.exclude_inbound_ports, "excluded inbound");
        fill_ports(&mut pod.exclude_out_ports, &ebpf.exclude_outbound_ports, "excluded outbound");

        let ranges: Vec<Cidr> = ebpf
            .exclude_outbound_ips
            .iter()
            .filter_map(|net| match net {
                ipnet::IpNet::V4(net) => Some(cidr(net)),
                ipnet::IpNet::V6(_) => None,
            })
            .collect();
        if ranges.len() > MAX_ITEM_LEN {
            tracing::warn!(
                "[tproxy] only the first {} of {} excluded outbound ranges are used",
                MAX_ITEM_LEN,
                ranges.len()
            );
        }
        for (slot, range) in pod.exclude_out_ranges.iter_mut().zip(ranges) {
            *slot = range;
        }

        pod
    }
}

fn fill_ports(slots: &mut [u16; MAX_ITEM_LEN], ports: &[u16], what: &str) {
    if ports.len() > MAX_ITEM_LEN {
        tracing::warn!(
            "[tproxy] only the first {} of {} {} ports are used",
            MAX_ITEM_LEN,
            ports.len(),
            what
        );
    }
    for (slot, port) in slots.iter_mut().zip(ports) {
        *slot = *port;
    }
}

fn cidr(net: &Ipv4Net) -> Cidr {
    Cidr {
        net: u32::from_ne_bytes(net.network().octets()),
        mask: net.prefix_len(),
        _pad: [0; 3],
    }
}

pub fn ip_key(ip: Ipv4Addr) -> IpKey {
    [0, 0, 0, u32::from_ne_bytes(ip.octets())]
}

/// Point both pinned lookup tables at this instance. Existing entries
/// are overwritten.
pub fn update_pod_maps(bpffs: &Path, netns_inode: u32, ip: Ipv4Addr, pod: &PodConfig) -> Result<()> {
    let key = ip_key(ip);

    let mut netns_pod_ips: HashMap<MapData, u32, IpKey> = open_pinned(bpffs, NETNS_POD_IPS_MAP)?;
    netns_pod_ips
        .insert(netns_inode, key, 0)
        .with_context(|| format!("failed to update {}", NETNS_POD_IPS_MAP))?;

    let mut local_pod_ips: HashMap<MapData, IpKey, PodConfig> = open_pinned(bpffs, LOCAL_POD_IPS_MAP)?;
    local_pod_ips
        .insert(key, *pod, 0)
        .with_context(|| format!("failed to update {}", LOCAL_POD_IPS_MAP))?;

    tracing::debug!("pinned maps updated for {} (netns inode {})", ip, netns_inode);
    Ok(())
}

fn open_pinned<K: aya::Pod, V: aya::Pod>(bpffs: &Path, name: &str) -> Result<HashMap<MapData, K, V>> {
    let path = bpffs.join(name);
    let data = MapData::from_pin(&path)
        .with_context(|| format!("failed to open pinned map {}", path.display()))?;
    HashMap::try_from(Map::HashMap(data))
        .with_context(|| format!("pinned map {} has an unexpected layout", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_core::Config;

    #[test]
    fn test_layout_matches_kernel_struct() {
        assert_eq!(std::mem::size_of::<Cidr>(), 8);
        assert_eq!(std::mem::size_of::<PodConfig>(), 4 + 2 * 8 * MAX_ITEM_LEN + 4 * 2 * MAX_ITEM_LEN);
    }

    #[test]
    fn test_pod_config_caps_lists() {
        let mut cfg = Config::default();
        cfg.redirect.inbound.exclude_ports = (1..=12).collect();
        cfg.redirect.outbound.exclude_ports = vec![22];
        cfg.redirect.outbound.exclude_ports_for_ips = vec!["10.0.0.0/8,192.168.1.1".to_string(), "fd00::/8".to_string()];

        let pod = PodConfig::from_ebpf(&cfg.initialize_ebpf().expect("valid eBPF config"));
        assert_eq!(pod.status_port, 9901);
        assert_eq!(pod.exclude_in_ports, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(pod.exclude_out_ports[0], 22);
        assert_eq!(pod.exclude_out_ports[1], 0);

        assert_eq!(pod.exclude_out_ranges[0].mask, 8);
        assert_eq!(pod.exclude_out_ranges[0].net, u32::from_ne_bytes([10, 0, 0, 0]));
        assert_eq!(pod.exclude_out_ranges[1].mask, 32);
        assert_eq!(pod.exclude_out_ranges[2], Cidr::default());
    }

    #[test]
    fn test_ip_key() {
        assert_eq!(
            ip_key(Ipv4Addr::new(10, 1, 2, 3)),
            [0, 0, 0, u32::from_ne_bytes([10, 1, 2, 3])]
        );
    }
}
