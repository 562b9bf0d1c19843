use crate::table::TableName;
use anyhow::{Context, Result};

/// One table block of `iptables-save` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedTable {
    pub name: TableName,
    /// Declared chains in order, with the policy of built-in chains.
    pub chains: Vec<SavedChain>,
    pub rules: Vec<SavedRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedChain {
    pub name: String,
    pub policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRule {
    pub chain: String,
    /// `Some` for `-I <chain> <n>` lines.
    pub position: Option<usize>,
    pub line: String,
}

impl SavedTable {
    pub fn rules_in<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a SavedRule> {
        self.rules.iter().filter(move |r| r.chain == chain)
    }
}

/// Parse save-format text (or restore input rendered by this crate).
///
/// Accepts `:CHAIN POLICY [p:b]` and `-N`/`--new-chain` declarations,
/// `-A`/`--append` and `-I`/`--insert` rules, `COMMIT`, and `#` comments.
pub fn parse_save_output(text: &str) -> Result<Vec<SavedTable>> {
    let mut tables = Vec::new();
    let mut current: Option<SavedTable> = None;

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let line_no = index + 1;

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('*') {
            if current.is_some() {
                anyhow::bail!("line {}: table '{}' starts before COMMIT", line_no, name.trim());
            }
            let name = name
                .trim()
                .parse::<TableName>()
                .with_context(|| format!("line {}", line_no))?;
            current = Some(SavedTable {
                name,
                chains: vec![],
                rules: vec![],
            });
            continue;
        }

        if line == "COMMIT" {
            let table = current
                .take()
                .with_context(|| format!("line {}: COMMIT outside of a table block", line_no))?;
            tables.push(table);
            continue;
        }

        let table = current
            .as_mut()
            .with_context(|| format!("line {}: '{}' outside of a table block", line_no, line))?;

        if let Some(declaration) = line.strip_prefix(':') {
            let mut fields = declaration.split_whitespace();
            let name = fields
                .next()
                .with_context(|| format!("line {}: empty chain declaration", line_no))?;
            let policy = fields.next().filter(|p| *p != "-").map(str::to_string);
            table.chains.push(SavedChain {
                name: name.to_string(),
                policy,
            });
            continue;
        }

        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("-N") | Some("--new-chain") => {
                let name = fields
                    .next()
                    .with_context(|| format!("line {}: missing chain name", line_no))?;
                table.chains.push(SavedChain {
                    name: name.to_string(),
                    policy: None,
                });
            }
            Some("-A") | Some("--append") => {
                let chain = fields
                    .next()
                    .with_context(|| format!("line {}: missing chain name", line_no))?;
                table.rules.push(SavedRule {
                    chain: chain.to_string(),
                    position: None,
                    line: line.to_string(),
                });
            }
            Some("-I") | Some("--insert") => {
                let chain = fields
                    .next()
                    .with_context(|| format!("line {}: missing chain name", line_no))?;
                let position = fields.next().and_then(|p| p.parse::<usize>().ok());
                table.rules.push(SavedRule {
                    chain: chain.to_string(),
                    position,
                    line: line.to_string(),
                });
            }
            _ => anyhow::bail!("line {}: unexpected '{}'", line_no, line),
        }
    }

    if let Some(table) = current {
        anyhow::bail!("table {} is missing COMMIT", table.name);
    }

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_iptables_for_restore;
    use crate::builder::testing::ipvx;
    use proptest::prelude::*;
    use tp_core::{Config, IpFamily};

    const SAVED: &str = "# Generated by iptables-nft-save v1.8.7 on Tue Oct 14 10:00:00 2026
*nat
:PREROUTING ACCEPT [0:0]
:INPUT ACCEPT [0:0]
:OUTPUT ACCEPT [4:240]
:POSTROUTING ACCEPT [4:240]
:TPROXY_MESH_OUTBOUND - [0:0]
-A OUTPUT -p tcp -m comment --comment \"tproxy/mesh/transparent/proxy/output/outbound\" -j TPROXY_MESH_OUTBOUND
-A TPROXY_MESH_OUTBOUND -d 127.0.0.1/32 -j RETURN
COMMIT
# Completed on Tue Oct 14 10:00:00 2026
";

    #[test]
    fn test_parse_live_save_output() {
        let tables = parse_save_output(SAVED).expect("valid save output");
        assert_eq!(tables.len(), 1);

        let nat = &tables[0];
        assert_eq!(nat.name, TableName::Nat);
        assert_eq!(nat.chains.len(), 5);
        assert_eq!(nat.chains[2].policy.as_deref(), Some("ACCEPT"));
        assert_eq!(nat.chains[4].policy, None);
        assert!(nat.chains.iter().any(|c| c.name == "TPROXY_MESH_OUTBOUND"));
        assert_eq!(nat.rules_in("OUTPUT").count(), 1);
        assert_eq!(nat.rules_in("TPROXY_MESH_OUTBOUND").count(), 1);
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(parse_save_output("*filter\nCOMMIT\n").is_err());
        assert!(parse_save_output("*nat\n-A OUTPUT -j RETURN\n").is_err());
        assert!(parse_save_output("-A OUTPUT -j RETURN\n").is_err());
        assert!(parse_save_output("*nat\n-X OUTPUT\nCOMMIT\n").is_err());
    }

    #[test]
    fn test_insert_positions() {
        let tables = parse_save_output("*nat\n--insert OUTPUT 3 --jump RETURN\nCOMMIT\n")
            .expect("valid input");
        assert_eq!(tables[0].rules[0].position, Some(3));
    }

    proptest! {
        #[test]
        fn rendered_rules_parse_back(
            exclude in prop::collection::vec(1u16..65535, 0..5),
            include in prop::collection::vec(1u16..65535, 0..3),
            dns in any::<bool>(),
            drop_invalid in any::<bool>(),
            verbose in any::<bool>(),
        ) {
            let mut cfg = Config::default();
            cfg.redirect.inbound.exclude_ports = exclude.clone();
            cfg.redirect.outbound.include_ports = include;
            cfg.redirect.dns.enabled = dns;
            cfg.drop_invalid_packets = drop_invalid;
            cfg.verbose = verbose;

            let rendered = build_iptables_for_restore(&ipvx(&cfg, IpFamily::V4)).expect("rules build");
            let tables = parse_save_output(&rendered).expect("rendered rules parse");

            let rule_lines = rendered
                .lines()
                .filter(|l| l.starts_with("-A") || l.starts_with("-I") || l.starts_with("--append") || l.starts_with("--insert"))
                .count();
            prop_assert_eq!(tables.iter().map(|t| t.rules.len()).sum::<usize>(), rule_lines);

            let nat = tables.iter().find(|t| t.name == TableName::Nat).expect("nat table");
            prop_assert_eq!(nat.chains.len(), 4);
            prop_assert_eq!(nat.rules_in("TPROXY_MESH_INBOUND").count(), exclude.len() + 1);
            prop_assert_eq!(tables.iter().any(|t| t.name == TableName::Mangle), drop_invalid);
        }
    }
}
