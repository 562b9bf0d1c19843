use crate::consts::{IpFamily, ProtocolL4};
use crate::error::Error;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::ops::RangeInclusive;

/// Ports or UIDs excluded from outbound redirection for matching owners.
///
/// `ports` and `uids` are already in packet-filter notation: comma separated
/// values and `start:end` ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub protocol: ProtocolL4,
    pub ports: String,
    pub uids: String,
}

/// Parse `<protocol:>?<ports:>?<uids>` entries.
///
/// `tcp:22:1000-2000`, `udp:53:1001`, `80:1002` and `1003` are all valid.
/// A missing or `*` protocol expands to one exclusion per protocol.
pub fn parse_exclude_ports_for_uids(rules: &[String]) -> Result<Vec<Exclusion>, Error> {
    let mut result = Vec::new();

    for rule in rules {
        let invalid = |reason: &str| Error::InvalidExclusion {
            rule: rule.clone(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = rule.split(':').collect();
        let (protocols, ports, uids) = match parts.as_slice() {
            [uids] => ("*", "*", *uids),
            [ports, uids] => ("*", *ports, *uids),
            [protocols, ports, uids] => (*protocols, *ports, *uids),
            _ => return Err(invalid("expected format <protocol:>?<ports:>?<uids>")),
        };

        if uids == "*" {
            return Err(invalid("wildcard '*' is not allowed for UIDs"));
        }
        if uids.contains(',') {
            return Err(invalid("UIDs should either be a single item or a range"));
        }

        let ports = if ports.is_empty() || ports == "*" {
            "1-65535"
        } else {
            ports
        };

        validate_value_or_range(ports, 1..=u16::MAX as u32)
            .map_err(|_| invalid("invalid port range"))?;
        validate_value_or_range(uids, 0..=u32::MAX).map_err(|_| invalid("invalid UID range"))?;

        let protocols = if protocols.is_empty() || protocols == "*" {
            vec![ProtocolL4::Tcp, ProtocolL4::Udp]
        } else {
            protocols
                .split(',')
                .map(|p| {
                    p.parse::<ProtocolL4>()
                        .map_err(|_| invalid(&format!("invalid or unsupported protocol '{}'", p)))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        for protocol in protocols {
            result.push(Exclusion {
                protocol,
                ports: ports.replace('-', ":"),
                uids: uids.replace('-', ":"),
            });
        }
    }

    Ok(result)
}

/// Parse comma separated IPs or CIDRs, keeping only those of `family`.
pub fn parse_exclude_ports_for_ips(rules: &[String], family: IpFamily) -> Result<Vec<IpNet>, Error> {
    let mut result = Vec::new();

    for rule in rules {
        if rule.trim().is_empty() {
            return Err(Error::InvalidAddress(rule.clone()));
        }

        for address in rule.split(',') {
            let net = parse_ip_or_cidr(address)?;
            if family.contains(&net.addr()) {
                result.push(net);
            }
        }
    }

    Ok(result)
}

pub fn parse_ip_or_cidr(address: &str) -> Result<IpNet, Error> {
    let address = address.trim();
    if let Ok(net) = address.parse::<IpNet>() {
        return Ok(net);
    }
    address
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// Parse `<iface>:<cidr>` entries into a map sorted by interface name.
///
/// Only the first `:` separates the interface, so IPv6 CIDRs are accepted.
/// Entries of the other address family are dropped.
pub fn parse_vnet(networks: &[String], family: IpFamily) -> Result<BTreeMap<String, IpNet>, Error> {
    let mut result = BTreeMap::new();

    for network in networks {
        let (iface, cidr) = network
            .split_once(':')
            .filter(|(iface, _)| !iface.is_empty())
            .ok_or_else(|| Error::InvalidVnet(network.clone()))?;

        let net: IpNet = cidr
            .parse()
            .map_err(|_| Error::InvalidVnet(network.clone()))?;

        if family.contains(&net.addr()) {
            result.insert(iface.to_string(), net);
        }
    }

    Ok(result)
}

/// Extract `nameserver` addresses from resolv.conf content.
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(address)) => {
                    // Scoped link-local addresses carry a zone suffix.
                    address.split('%').next()?.parse().ok()
                }
                _ => None,
            }
        })
        .collect()
}

/// Comma separated values within `bounds`, or `start-end` ranges with
/// `start <= end`.
fn validate_value_or_range(value: &str, bounds: RangeInclusive<u32>) -> Result<(), ()> {
    let parse = |item: &str| match item.parse::<u32>() {
        Ok(n) if bounds.contains(&n) => Ok(n),
        _ => Err(()),
    };

    for element in value.split(',') {
        match element.split_once('-') {
            None => {
                parse(element)?;
            }
            Some((start, end)) => {
                if parse(start)? > parse(end)? {
                    return Err(());
                }
            }
        }
    }
    Ok(())
}
