use super::rule_comment;
use crate::chain::Chain;
use crate::parameters::*;
use crate::params;
use crate::table::Table;
use anyhow::Result;
use tp_core::{
    DNS_PORT, InitializedConfigIPvX, InitializedTrafficFlow, OUTPUT_LOG_PREFIX,
    PREROUTING_LOG_PREFIX, ProtocolL4,
};

const NAT: &str = "nat";

pub fn build_nat_table(cfg: &InitializedConfigIPvX) -> Result<Table> {
    let redirect = &cfg.redirect;

    Ok(Table::nat()
        .with_chain(build_prerouting(cfg)?)
        .with_chain(build_output(cfg)?)
        .with_chain(build_mesh_inbound(cfg)?)
        .with_chain(build_mesh_outbound(cfg)?)
        .with_chain(build_mesh_redirect(cfg, &redirect.inbound, "inbound")?)
        .with_chain(build_mesh_redirect(cfg, &redirect.outbound, "outbound")?))
}

/// OUTPUT: per-uid exclusions and DNS handling are inserted at the head, in
/// order, ahead of anything already in the chain; the jump to the outbound
/// chain is appended.
fn build_output(cfg: &InitializedConfigIPvX) -> Result<Chain> {
    let redirect = &cfg.redirect;
    let dns = &redirect.dns;
    let mut position = 1;
    let mut output = Chain::new(NAT, "OUTPUT")?;

    if cfg.log.enabled {
        output = output.add_rule_at_position(
            position,
            params![log(OUTPUT_LOG_PREFIX, cfg.log.level), rule_comment(cfg, "output/log")],
        );
        position += 1;
    }

    for exclusion in &redirect.outbound.exclude_ports_for_uids {
        let protocol = match exclusion.protocol {
            ProtocolL4::Tcp => tcp(),
            ProtocolL4::Udp => udp(),
        };

        output = output.add_rule_at_position(
            position,
            params![
                multiport(),
                protocol.with(destination_ports(&exclusion.ports)),
                owner().with(uid_owner(&exclusion.uids)),
                jump_return(),
                rule_comment(cfg, "output/exclude-ports-for-uids"),
            ],
        );
        position += 1;
    }

    if dns.enabled {
        output = output.add_rule_at_position(
            position,
            params![
                udp().with(destination_port(DNS_PORT)),
                owner().with(uid_owner(&cfg.owner_uid)),
                jump_chain(&dns.upstream_target_chain),
                rule_comment(cfg, "output/dns/upstream"),
            ],
        );
        position += 1;

        if dns.capture_all {
            output = output.add_rule_at_position(
                position,
                params![
                    udp().with(destination_port(DNS_PORT)),
                    redirect_to_port(dns.port),
                    rule_comment(cfg, "output/dns/capture-all"),
                ],
            );
        } else {
            for server in &dns.servers {
                output = output.add_rule_at_position(
                    position,
                    params![
                        destination(server),
                        udp().with(destination_port(DNS_PORT)),
                        redirect_to_port(dns.port),
                        rule_comment(cfg, "output/dns/server"),
                    ],
                );
                position += 1;
            }
        }
    }

    Ok(output.add_rule(params![
        tcp(),
        jump_chain(&redirect.outbound.chain_name),
        rule_comment(cfg, "output/outbound"),
    ]))
}

/// PREROUTING: with virtual networks, the per-interface rules and the jump to
/// the inbound chain are inserted at the head.
fn build_prerouting(cfg: &InitializedConfigIPvX) -> Result<Chain> {
    let redirect = &cfg.redirect;
    let mut prerouting = Chain::new(NAT, "PREROUTING")?;

    if cfg.log.enabled {
        prerouting = prerouting.add_rule(params![
            log(PREROUTING_LOG_PREFIX, cfg.log.level),
            rule_comment(cfg, "prerouting/log"),
        ]);
    }

    let to_inbound = params![
        tcp(),
        jump_chain(&redirect.inbound.chain_name),
        rule_comment(cfg, "prerouting/inbound"),
    ];

    if redirect.vnet.is_empty() {
        return Ok(prerouting.add_rule(to_inbound));
    }

    let mut position = 1;
    for (iface, cidr) in &redirect.vnet {
        prerouting = prerouting
            .add_rule_at_position(
                position,
                params![
                    in_interface(iface),
                    udp_match(),
                    udp().with(destination_port(DNS_PORT)),
                    redirect_to_port(redirect.dns.port),
                    rule_comment(cfg, "prerouting/vnet/dns"),
                ],
            )
            .add_rule_at_position(
                position + 1,
                params![
                    not_destination(cidr),
                    in_interface(iface),
                    tcp(),
                    redirect_to_port(redirect.outbound.port),
                    rule_comment(cfg, "prerouting/vnet/outbound"),
                ],
            );
        position += 2;
    }

    Ok(prerouting.add_rule_at_position(position, to_inbound))
}

fn build_mesh_inbound(cfg: &InitializedConfigIPvX) -> Result<Chain> {
    let inbound = &cfg.redirect.inbound;
    let chain = Chain::new(NAT, &inbound.chain_name)?;

    if !inbound.enabled {
        return Ok(chain.add_rule(params![
            tcp(),
            jump_return(),
            rule_comment(cfg, "inbound/disabled"),
        ]));
    }

    let chain = inbound.exclude_ips.iter().fold(chain, |chain, ip| {
        chain.add_rule(params![
            source(ip),
            jump_return(),
            rule_comment(cfg, "inbound/exclude-ips"),
        ])
    });

    Ok(add_port_rules(cfg, chain, inbound, "inbound"))
}

/// The outbound chain's rule order is what keeps the proxy from redirecting
/// its own traffic into itself.
fn build_mesh_outbound(cfg: &InitializedConfigIPvX) -> Result<Chain> {
    let redirect = &cfg.redirect;
    let outbound = &redirect.outbound;
    let dns = &redirect.dns;
    let family = cfg.family;
    let uid = cfg.owner_uid.as_str();
    let chain = Chain::new(NAT, &outbound.chain_name)?;

    if !outbound.enabled {
        return Ok(chain.add_rule(params![
            tcp(),
            jump_return(),
            rule_comment(cfg, "outbound/disabled"),
        ]));
    }

    let mut chain = chain
        .add_rule(params![
            source(family.inbound_passthrough_source()),
            out_interface(&cfg.loopback),
            jump_return(),
            rule_comment(cfg, "outbound/passthrough"),
        ])
        .add_rule(params![
            tcp().with(not_destination_port_if(dns.enabled, DNS_PORT)),
            out_interface(&cfg.loopback),
            not_destination(family.localhost()),
            owner().with(uid_owner(uid)),
            jump_chain(&redirect.inbound.redirect_chain_name),
            rule_comment(cfg, "outbound/loopback/inbound-redirect"),
        ])
        .add_rule(params![
            tcp().with(not_destination_port_if(dns.enabled, DNS_PORT)),
            out_interface(&cfg.loopback),
            owner().with(uid_owner(uid).negate()),
            jump_return(),
            rule_comment(cfg, "outbound/loopback/return"),
        ])
        .add_rule(params![
            owner().with(uid_owner(uid)),
            jump_return(),
            rule_comment(cfg, "outbound/owner"),
        ]);

    if dns.enabled {
        if dns.capture_all {
            chain = chain.add_rule(params![
                tcp().with(destination_port(DNS_PORT)),
                redirect_to_port(dns.port),
                rule_comment(cfg, "outbound/dns/capture-all"),
            ]);
        } else {
            for server in &dns.servers {
                chain = chain.add_rule(params![
                    destination(server),
                    tcp().with(destination_port(DNS_PORT)),
                    redirect_to_port(dns.port),
                    rule_comment(cfg, "outbound/dns/server"),
                ]);
            }
        }
    }

    let chain = chain.add_rule(params![
        destination(family.localhost()),
        jump_return(),
        rule_comment(cfg, "outbound/localhost"),
    ]);

    let chain = outbound.exclude_ips.iter().fold(chain, |chain, ip| {
        chain.add_rule(params![
            destination(ip),
            jump_return(),
            rule_comment(cfg, "outbound/exclude-ips"),
        ])
    });

    Ok(add_port_rules(cfg, chain, outbound, "outbound"))
}

/// Include ports are exhaustive: when present, exclude ports and the
/// catch-all jump are skipped.
fn add_port_rules(
    cfg: &InitializedConfigIPvX,
    chain: Chain,
    flow: &InitializedTrafficFlow,
    direction: &str,
) -> Chain {
    let redirect_chain = flow.redirect_chain_name.as_str();
    // The outbound catch-all carries no protocol match.
    let catch_all_protocol = (direction == "inbound").then(tcp);

    if !flow.include_ports.is_empty() {
        return flow.include_ports.iter().fold(chain, |chain, port| {
            chain.add_rule(params![
                tcp().with(destination_port(*port)),
                jump_chain(redirect_chain),
                rule_comment(cfg, &format!("{}/include-ports", direction)),
            ])
        });
    }

    flow.exclude_ports
        .iter()
        .fold(chain, |chain, port| {
            chain.add_rule(params![
                tcp().with(destination_port(*port)),
                jump_return(),
                rule_comment(cfg, &format!("{}/exclude-ports", direction)),
            ])
        })
        .add_rule(params![
            catch_all_protocol,
            jump_chain(redirect_chain),
            rule_comment(cfg, &format!("{}/redirect", direction)),
        ])
}

fn build_mesh_redirect(
    cfg: &InitializedConfigIPvX,
    flow: &InitializedTrafficFlow,
    direction: &str,
) -> Result<Chain> {
    Ok(Chain::new(NAT, &flow.redirect_chain_name)?.add_rule(params![
        tcp(),
        redirect_to_port(flow.port),
        rule_comment(cfg, &format!("{}/redirect-port", direction)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use tp_core::*;

    fn render(cfg: &InitializedConfigIPvX) -> Vec<String> {
        build_nat_table(cfg)
            .expect("nat table builds")
            .build_for_restore(false)
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn chain_rules(lines: &[String], chain: &str) -> Vec<String> {
        let append = format!("-A {} ", chain);
        let insert = format!("-I {} ", chain);
        lines
            .iter()
            .filter(|l| l.starts_with(&append) || l.starts_with(&insert))
            .cloned()
            .collect()
    }

    #[test]
    fn test_default_nat_table() {
        let lines = render(&ipvx(&Config::default(), IpFamily::V4));

        assert_eq!(
            &lines[..5],
            &[
                "*nat",
                "-N TPROXY_MESH_INBOUND",
                "-N TPROXY_MESH_OUTBOUND",
                "-N TPROXY_MESH_INBOUND_REDIRECT",
                "-N TPROXY_MESH_OUTBOUND_REDIRECT",
            ]
        );
        assert_eq!(
            chain_rules(&lines, "PREROUTING"),
            vec!["-A PREROUTING -p tcp -j TPROXY_MESH_INBOUND"]
        );
        assert_eq!(
            chain_rules(&lines, "OUTPUT"),
            vec!["-A OUTPUT -p tcp -j TPROXY_MESH_OUTBOUND"]
        );
        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_INBOUND"),
            vec!["-A TPROXY_MESH_INBOUND -p tcp -j TPROXY_MESH_INBOUND_REDIRECT"]
        );
        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_OUTBOUND"),
            vec![
                "-A TPROXY_MESH_OUTBOUND -s 127.0.0.6/32 -o lo -j RETURN",
                "-A TPROXY_MESH_OUTBOUND -p tcp -o lo ! -d 127.0.0.1/32 -m owner --uid-owner 5678 -j TPROXY_MESH_INBOUND_REDIRECT",
                "-A TPROXY_MESH_OUTBOUND -p tcp -o lo -m owner ! --uid-owner 5678 -j RETURN",
                "-A TPROXY_MESH_OUTBOUND -m owner --uid-owner 5678 -j RETURN",
                "-A TPROXY_MESH_OUTBOUND -d 127.0.0.1/32 -j RETURN",
                "-A TPROXY_MESH_OUTBOUND -j TPROXY_MESH_OUTBOUND_REDIRECT",
            ]
        );
        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_INBOUND_REDIRECT"),
            vec!["-A TPROXY_MESH_INBOUND_REDIRECT -p tcp -j REDIRECT --to-ports 15006"]
        );
        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_OUTBOUND_REDIRECT"),
            vec!["-A TPROXY_MESH_OUTBOUND_REDIRECT -p tcp -j REDIRECT --to-ports 15001"]
        );
        assert_eq!(lines.last().map(String::as_str), Some("COMMIT"));
    }

    #[test]
    fn test_ipv6_addresses_and_port() {
        let lines = render(&ipvx(&Config::default(), IpFamily::V6));

        let outbound = chain_rules(&lines, "TPROXY_MESH_OUTBOUND");
        assert_eq!(outbound[0], "-A TPROXY_MESH_OUTBOUND -s ::6/128 -o lo -j RETURN");
        assert!(outbound[1].contains("! -d ::1/128"));
        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_INBOUND_REDIRECT"),
            vec!["-A TPROXY_MESH_INBOUND_REDIRECT -p tcp -j REDIRECT --to-ports 15010"]
        );
    }

    #[test]
    fn test_include_ports_are_exhaustive() {
        let mut cfg = Config::default();
        cfg.redirect.inbound.include_ports = vec![8080, 9090];
        cfg.redirect.inbound.exclude_ports = vec![22];
        cfg.redirect.outbound.include_ports = vec![443];
        cfg.redirect.outbound.exclude_ports = vec![25];

        let lines = render(&ipvx(&cfg, IpFamily::V4));

        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_INBOUND"),
            vec![
                "-A TPROXY_MESH_INBOUND -p tcp --dport 8080 -j TPROXY_MESH_INBOUND_REDIRECT",
                "-A TPROXY_MESH_INBOUND -p tcp --dport 9090 -j TPROXY_MESH_INBOUND_REDIRECT",
            ]
        );

        let outbound = chain_rules(&lines, "TPROXY_MESH_OUTBOUND");
        assert_eq!(
            outbound.last().map(String::as_str),
            Some("-A TPROXY_MESH_OUTBOUND -p tcp --dport 443 -j TPROXY_MESH_OUTBOUND_REDIRECT")
        );
        assert!(!lines.iter().any(|l| l.contains("--dport 22") || l.contains("--dport 25")));
    }

    #[test]
    fn test_exclude_ports_and_ips() {
        let mut cfg = Config::default();
        cfg.redirect.inbound.exclude_ports = vec![22];
        cfg.redirect.inbound.exclude_ports_for_ips = vec!["10.0.0.1".to_string()];
        cfg.redirect.outbound.exclude_ports = vec![25];
        cfg.redirect.outbound.exclude_ports_for_ips =
            vec!["192.168.0.0/16,fd00::/8".to_string()];

        let lines = render(&ipvx(&cfg, IpFamily::V4));

        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_INBOUND"),
            vec![
                "-A TPROXY_MESH_INBOUND -s 10.0.0.1/32 -j RETURN",
                "-A TPROXY_MESH_INBOUND -p tcp --dport 22 -j RETURN",
                "-A TPROXY_MESH_INBOUND -p tcp -j TPROXY_MESH_INBOUND_REDIRECT",
            ]
        );

        let outbound = chain_rules(&lines, "TPROXY_MESH_OUTBOUND");
        let tail: Vec<&str> = outbound.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "-A TPROXY_MESH_OUTBOUND -d 127.0.0.1/32 -j RETURN",
                "-A TPROXY_MESH_OUTBOUND -d 192.168.0.0/16 -j RETURN",
                "-A TPROXY_MESH_OUTBOUND -p tcp --dport 25 -j RETURN",
                "-A TPROXY_MESH_OUTBOUND -j TPROXY_MESH_OUTBOUND_REDIRECT",
            ]
        );
        assert!(!lines.iter().any(|l| l.contains("fd00::/8")));
    }

    #[test]
    fn test_disabled_flows_pass_through() {
        let mut cfg = Config::default();
        cfg.redirect.inbound.enabled = false;
        cfg.redirect.outbound.enabled = false;

        let lines = render(&ipvx(&cfg, IpFamily::V4));
        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_INBOUND"),
            vec!["-A TPROXY_MESH_INBOUND -p tcp -j RETURN"]
        );
        assert_eq!(
            chain_rules(&lines, "TPROXY_MESH_OUTBOUND"),
            vec!["-A TPROXY_MESH_OUTBOUND -p tcp -j RETURN"]
        );
    }

    #[test]
    fn test_exclude_ports_for_uids_go_to_output() {
        let mut cfg = Config::default();
        cfg.redirect.outbound.exclude_ports_for_uids =
            vec!["tcp:22:1000-2000".to_string(), "udp:53:1001".to_string()];
        cfg.log.enabled = true;

        let lines = render(&ipvx(&cfg, IpFamily::V4));
        assert_eq!(
            chain_rules(&lines, "OUTPUT"),
            vec![
                "-I OUTPUT 1 -j LOG --log-prefix \"OUTPUT:\" --log-level 7",
                "-I OUTPUT 2 -m multiport -p tcp --dports 22 -m owner --uid-owner 1000:2000 -j RETURN",
                "-I OUTPUT 3 -m multiport -p udp --dports 53 -m owner --uid-owner 1001 -j RETURN",
                "-A OUTPUT -p tcp -j TPROXY_MESH_OUTBOUND",
            ]
        );
        assert!(!chain_rules(&lines, "TPROXY_MESH_OUTBOUND")
            .iter()
            .any(|l| l.contains("multiport")));
    }

    #[test]
    fn test_dns_capture_all() {
        let mut cfg = Config::default();
        cfg.redirect.dns.enabled = true;

        let lines = render(&ipvx(&cfg, IpFamily::V4));
        assert_eq!(
            chain_rules(&lines, "OUTPUT"),
            vec![
                "-I OUTPUT 1 -p udp --dport 53 -m owner --uid-owner 5678 -j RETURN",
                "-I OUTPUT 2 -p udp --dport 53 -j REDIRECT --to-ports 15053",
                "-A OUTPUT -p tcp -j TPROXY_MESH_OUTBOUND",
            ]
        );

        let outbound = chain_rules(&lines, "TPROXY_MESH_OUTBOUND");
        assert!(outbound[1].starts_with("-A TPROXY_MESH_OUTBOUND -p tcp ! --dport 53 -o lo"));
        assert!(outbound[2].starts_with("-A TPROXY_MESH_OUTBOUND -p tcp ! --dport 53 -o lo"));
        assert_eq!(
            outbound[4],
            "-A TPROXY_MESH_OUTBOUND -p tcp --dport 53 -j REDIRECT --to-ports 15053"
        );
    }

    #[test]
    fn test_dns_per_server_and_docker_upstream() {
        let mut cfg = Config::default();
        cfg.redirect.dns.enabled = true;
        cfg.redirect.dns.capture_all = false;

        let mut executables = InitializedExecutables::assumed(IpFamily::V4, IptablesMode::Nft);
        executables.functionality.chains.docker_output = true;
        let servers: Vec<std::net::IpAddr> =
            vec!["10.0.0.2".parse().expect("ip"), "fd00::2".parse().expect("ip")];

        let lines = render(&ipvx_with(&cfg, IpFamily::V4, executables, &servers));
        assert_eq!(
            chain_rules(&lines, "OUTPUT"),
            vec![
                "-I OUTPUT 1 -p udp --dport 53 -m owner --uid-owner 5678 -j DOCKER_OUTPUT",
                "-I OUTPUT 2 -d 10.0.0.2 -p udp --dport 53 -j REDIRECT --to-ports 15053",
                "-A OUTPUT -p tcp -j TPROXY_MESH_OUTBOUND",
            ]
        );
        assert!(chain_rules(&lines, "TPROXY_MESH_OUTBOUND").contains(
            &"-A TPROXY_MESH_OUTBOUND -d 10.0.0.2 -p tcp --dport 53 -j REDIRECT --to-ports 15053"
                .to_string()
        ));
    }

    #[test]
    fn test_vnet_rules_are_sorted_and_inserted() {
        let mut cfg = Config::default();
        cfg.redirect.vnet.networks = vec![
            "docker1:172.18.0.0/16".to_string(),
            "docker0:172.17.0.0/16".to_string(),
            "br0:fd00::/64".to_string(),
        ];

        let lines = render(&ipvx(&cfg, IpFamily::V4));
        assert_eq!(
            chain_rules(&lines, "PREROUTING"),
            vec![
                "-I PREROUTING 1 -i docker0 -m udp -p udp --dport 53 -j REDIRECT --to-ports 15053",
                "-I PREROUTING 2 ! -d 172.17.0.0/16 -i docker0 -p tcp -j REDIRECT --to-ports 15001",
                "-I PREROUTING 3 -i docker1 -m udp -p udp --dport 53 -j REDIRECT --to-ports 15053",
                "-I PREROUTING 4 ! -d 172.18.0.0/16 -i docker1 -p tcp -j REDIRECT --to-ports 15001",
                "-I PREROUTING 5 -p tcp -j TPROXY_MESH_INBOUND",
            ]
        );

        let lines = render(&ipvx(&cfg, IpFamily::V6));
        assert_eq!(chain_rules(&lines, "PREROUTING").len(), 3);
    }
}
