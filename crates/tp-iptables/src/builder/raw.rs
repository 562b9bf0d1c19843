use super::rule_comment;
use crate::chain::Chain;
use crate::parameters::*;
use crate::params;
use crate::table::Table;
use anyhow::Result;
use tp_core::{DNS_PORT, InitializedConfigIPvX};

const RAW: &str = "raw";
const ZONE_PROXY_TO_UPSTREAM: u16 = 1;
const ZONE_CLIENT_TO_PROXY: u16 = 2;

/// Conntrack zone split for redirected DNS: the proxy's upstream queries
/// live in zone 1, client queries to the DNS proxy port in zone 2.
pub fn build_raw_table(cfg: &InitializedConfigIPvX) -> Result<Table> {
    let dns = &cfg.redirect.dns;
    if !dns.conntrack_zone_split {
        return Ok(Table::raw());
    }

    let uid = cfg.owner_uid.as_str();

    let mut output = Chain::new(RAW, "OUTPUT")?
        .add_rule(params![
            udp().with(destination_port(DNS_PORT)),
            owner().with(uid_owner(uid)),
            ct_zone(ZONE_PROXY_TO_UPSTREAM),
            rule_comment(cfg, "raw/output/dns/upstream-zone"),
        ])
        .add_rule(params![
            udp().with(source_port(dns.port)),
            owner().with(uid_owner(uid)),
            ct_zone(ZONE_CLIENT_TO_PROXY),
            rule_comment(cfg, "raw/output/dns/proxy-reply-zone"),
        ]);
    let mut prerouting = Chain::new(RAW, "PREROUTING")?;

    if dns.capture_all {
        output = output.add_rule(params![
            udp().with(destination_port(DNS_PORT)),
            ct_zone(ZONE_CLIENT_TO_PROXY),
            rule_comment(cfg, "raw/output/dns/client-zone"),
        ]);
        prerouting = prerouting.add_rule(params![
            udp().with(source_port(DNS_PORT)),
            ct_zone(ZONE_PROXY_TO_UPSTREAM),
            rule_comment(cfg, "raw/prerouting/dns/upstream-reply-zone"),
        ]);
    } else {
        for server in &dns.servers {
            output = output.add_rule(params![
                destination(server),
                udp().with(destination_port(DNS_PORT)),
                ct_zone(ZONE_CLIENT_TO_PROXY),
                rule_comment(cfg, "raw/output/dns/client-zone"),
            ]);
            prerouting = prerouting.add_rule(params![
                source(server),
                udp().with(source_port(DNS_PORT)),
                ct_zone(ZONE_PROXY_TO_UPSTREAM),
                rule_comment(cfg, "raw/prerouting/dns/upstream-reply-zone"),
            ]);
        }
    }

    Ok(Table::raw().with_chain(prerouting).with_chain(output))
}
