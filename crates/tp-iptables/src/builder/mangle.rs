use super::rule_comment;
use crate::chain::Chain;
use crate::parameters::*;
use crate::params;
use crate::table::Table;
use anyhow::Result;
use tp_core::InitializedConfigIPvX;

pub fn build_mangle_table(cfg: &InitializedConfigIPvX) -> Result<Table> {
    let table = Table::mangle();
    if !cfg.drop_invalid_packets {
        return Ok(table);
    }

    Ok(table.with_chain(Chain::new("mangle", "PREROUTING")?.add_rule(params![
        conntrack().with(ctstate("INVALID")),
        jump_drop(),
        rule_comment(cfg, "mangle/prerouting/drop-invalid"),
    ])))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use tp_core::*;

    #[test]
    fn test_drop_invalid_packets() {
        let mut cfg = Config::default();
        assert_eq!(
            build_mangle_table(&ipvx(&cfg, IpFamily::V4))
                .expect("builds")
                .build_for_restore(false),
            ""
        );

        cfg.drop_invalid_packets = true;
        assert_eq!(
            build_mangle_table(&ipvx(&cfg, IpFamily::V4))
                .expect("builds")
                .build_for_restore(true),
            "*mangle\n\
             # Rules:\n\
             --append PREROUTING --match conntrack --ctstate INVALID --jump DROP\n\
             COMMIT"
        );
    }
}
