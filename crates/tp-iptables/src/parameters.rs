use std::fmt::Display;

/// Short and long spelling of a command-line flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag {
    pub long: &'static str,
    pub short: Option<&'static str>,
}

impl Flag {
    pub const fn new(long: &'static str, short: &'static str) -> Self {
        Self {
            long,
            short: Some(short),
        }
    }

    pub const fn long_only(long: &'static str) -> Self {
        Self { long, short: None }
    }

    pub fn render(&self, verbose: bool) -> &'static str {
        match (verbose, self.short) {
            (false, Some(short)) => short,
            _ => self.long,
        }
    }
}

pub const SOURCE: Flag = Flag::new("--source", "-s");
pub const DESTINATION: Flag = Flag::new("--destination", "-d");
pub const IN_INTERFACE: Flag = Flag::new("--in-interface", "-i");
pub const OUT_INTERFACE: Flag = Flag::new("--out-interface", "-o");
pub const PROTOCOL: Flag = Flag::new("--protocol", "-p");
pub const MATCH: Flag = Flag::new("--match", "-m");
pub const JUMP: Flag = Flag::new("--jump", "-j");
pub const DESTINATION_PORT: Flag = Flag::new("--destination-port", "--dport");
pub const SOURCE_PORT: Flag = Flag::new("--source-port", "--sport");
pub const DESTINATION_PORTS: Flag = Flag::new("--destination-ports", "--dports");
pub const UID_OWNER: Flag = Flag::long_only("--uid-owner");
pub const COMMENT: Flag = Flag::long_only("--comment");
pub const CTSTATE: Flag = Flag::long_only("--ctstate");
pub const TO_PORTS: Flag = Flag::long_only("--to-ports");
pub const ZONE: Flag = Flag::long_only("--zone");
pub const LOG_PREFIX: Flag = Flag::long_only("--log-prefix");
pub const LOG_LEVEL: Flag = Flag::long_only("--log-level");

/// Where a negation lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Negation {
    /// `! <flag> <values>`
    #[default]
    Own,
    /// Every nested parameter is negated instead, e.g. `-m owner ! --uid-owner 0`.
    Nested,
}

/// One flag with its values and the parameters nested under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    flag: Flag,
    values: Vec<String>,
    parameters: Vec<Parameter>,
    negated: bool,
    negation: Negation,
}

impl Parameter {
    pub fn new(flag: Flag) -> Self {
        Self {
            flag,
            values: vec![],
            parameters: vec![],
            negated: false,
            negation: Negation::Own,
        }
    }

    pub fn with_value(mut self, value: impl Display) -> Self {
        self.values.push(value.to_string());
        self
    }

    /// Nest a parameter; `None` is skipped.
    pub fn with(mut self, parameter: impl Into<Option<Parameter>>) -> Self {
        if let Some(parameter) = parameter.into() {
            self.parameters.push(parameter);
        }
        self
    }

    fn negate_nested(mut self) -> Self {
        self.negation = Negation::Nested;
        self
    }

    pub fn negate(mut self) -> Self {
        match self.negation {
            Negation::Own => self.negated = !self.negated,
            Negation::Nested => {
                self.parameters = self.parameters.into_iter().map(Parameter::negate).collect();
            }
        }
        self
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn flag(&self) -> Flag {
        self.flag
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn build(&self, verbose: bool) -> Vec<String> {
        let mut args = Vec::new();
        if self.negated {
            args.push("!".to_string());
        }
        args.push(self.flag.render(verbose).to_string());
        args.extend(self.values.iter().cloned());
        for parameter in &self.parameters {
            args.extend(parameter.build(verbose));
        }
        args
    }
}

/// Collect parameters, dropping absent optional ones.
///
/// Accepts both `Parameter` and `Option<Parameter>` expressions.
#[macro_export]
macro_rules! params {
    ($($parameter:expr),+ $(,)?) => {
        [$(::std::option::Option::<$crate::Parameter>::from($parameter)),+]
            .into_iter()
            .flatten()
            .collect::<::std::vec::Vec<$crate::Parameter>>()
    };
}

pub fn source(address: impl Display) -> Parameter {
    Parameter::new(SOURCE).with_value(address)
}

pub fn destination(address: impl Display) -> Parameter {
    Parameter::new(DESTINATION).with_value(address)
}

pub fn not_destination(address: impl Display) -> Parameter {
    destination(address).negate()
}

pub fn in_interface(name: impl Display) -> Parameter {
    Parameter::new(IN_INTERFACE).with_value(name)
}

pub fn out_interface(name: impl Display) -> Parameter {
    Parameter::new(OUT_INTERFACE).with_value(name)
}

// protocols

pub fn tcp() -> Parameter {
    Parameter::new(PROTOCOL).with_value("tcp").negate_nested()
}

pub fn udp() -> Parameter {
    Parameter::new(PROTOCOL).with_value("udp").negate_nested()
}

pub fn destination_port(port: u16) -> Parameter {
    Parameter::new(DESTINATION_PORT).with_value(port)
}

pub fn not_destination_port_if(predicate: bool, port: u16) -> Option<Parameter> {
    predicate.then(|| destination_port(port).negate())
}

pub fn source_port(port: u16) -> Parameter {
    Parameter::new(SOURCE_PORT).with_value(port)
}

/// Multiport list or range in packet-filter notation (`80,443` or `1:1024`).
pub fn destination_ports(ports: impl Display) -> Parameter {
    Parameter::new(DESTINATION_PORTS).with_value(ports)
}

// match extensions

fn match_extension(name: &str) -> Parameter {
    Parameter::new(MATCH).with_value(name).negate_nested()
}

pub fn owner() -> Parameter {
    match_extension("owner")
}

/// Single uid or `start:end` range.
pub fn uid_owner(uid: impl Display) -> Parameter {
    Parameter::new(UID_OWNER).with_value(uid)
}

pub fn multiport() -> Parameter {
    match_extension("multiport")
}

pub fn udp_match() -> Parameter {
    match_extension("udp")
}

pub fn conntrack() -> Parameter {
    match_extension("conntrack")
}

pub fn ctstate(state: &str) -> Parameter {
    Parameter::new(CTSTATE).with_value(state)
}

pub fn comment(text: impl Display) -> Parameter {
    match_extension("comment").with(Parameter::new(COMMENT).with_value(format!("\"{}\"", text)))
}

// jump targets

fn jump(target: &str) -> Parameter {
    Parameter::new(JUMP).with_value(target)
}

pub fn jump_return() -> Parameter {
    jump("RETURN")
}

pub fn jump_drop() -> Parameter {
    jump("DROP")
}

pub fn jump_chain(name: &str) -> Parameter {
    jump(name)
}

pub fn redirect_to_port(port: u16) -> Parameter {
    jump("REDIRECT").with(Parameter::new(TO_PORTS).with_value(port))
}

pub fn ct_zone(zone: u16) -> Parameter {
    jump("CT").with(Parameter::new(ZONE).with_value(zone))
}

pub fn log(prefix: &str, level: u8) -> Parameter {
    jump("LOG")
        .with(Parameter::new(LOG_PREFIX).with_value(format!("\"{}\"", prefix)))
        .with(Parameter::new(LOG_LEVEL).with_value(level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn render(parameter: &Parameter, verbose: bool) -> String {
        parameter.build(verbose).join(" ")
    }

    #[test]
    fn test_short_and_long_forms() {
        let p = tcp().with(destination_port(80));
        assert_eq!(render(&p, false), "-p tcp --dport 80");
        assert_eq!(render(&p, true), "--protocol tcp --destination-port 80");

        let p = redirect_to_port(15001);
        assert_eq!(render(&p, false), "-j REDIRECT --to-ports 15001");
        assert_eq!(render(&p, true), "--jump REDIRECT --to-ports 15001");
    }

    #[test]
    fn test_own_negation() {
        assert_eq!(render(&not_destination("127.0.0.1/32"), false), "! -d 127.0.0.1/32");
        assert_eq!(
            render(&not_destination("127.0.0.1/32"), true),
            "! --destination 127.0.0.1/32"
        );
    }

    #[test]
    fn test_compound_negation_hits_leaves() {
        let p = owner().with(uid_owner(5678)).negate();
        assert!(!p.is_negated());
        assert_eq!(render(&p, false), "-m owner ! --uid-owner 5678");

        let p = tcp().with(not_destination_port_if(true, 53));
        assert_eq!(render(&p, false), "-p tcp ! --dport 53");
        let p = tcp().with(not_destination_port_if(false, 53));
        assert_eq!(render(&p, false), "-p tcp");
    }

    #[test]
    fn test_params_macro_skips_absent() {
        let rule = params![
            tcp(),
            None::<Parameter>,
            not_destination_port_if(false, 53),
            out_interface("lo"),
            jump_return(),
        ];
        assert_eq!(rule.len(), 3);
    }

    #[test]
    fn test_comment_and_log_are_quoted() {
        assert_eq!(
            render(&comment("tproxy/mesh/transparent/proxy/outbound"), false),
            "-m comment --comment \"tproxy/mesh/transparent/proxy/outbound\""
        );
        assert_eq!(
            render(&log("OUTPUT:", 7), false),
            "-j LOG --log-prefix \"OUTPUT:\" --log-level 7"
        );
    }

    fn leaf() -> impl Strategy<Value = Parameter> {
        prop_oneof![
            any::<u16>().prop_map(destination_port),
            any::<u16>().prop_map(source_port),
            any::<u32>().prop_map(uid_owner),
            "[a-z]{1,8}".prop_map(out_interface),
        ]
    }

    fn parameter() -> impl Strategy<Value = Parameter> {
        prop_oneof![
            leaf(),
            prop::collection::vec(leaf(), 0..4).prop_map(|leaves| {
                leaves.into_iter().fold(tcp(), |p, l| p.with(l))
            }),
            prop::collection::vec(leaf(), 0..4).prop_map(|leaves| {
                leaves.into_iter().fold(owner(), |p, l| p.with(l))
            }),
        ]
    }

    proptest! {
        #[test]
        fn negation_is_an_involution(p in parameter(), verbose in any::<bool>()) {
            let twice = p.clone().negate().negate();
            prop_assert_eq!(&twice, &p);
            prop_assert_eq!(twice.build(verbose), p.build(verbose));
        }

        #[test]
        fn compound_negation_never_negates_the_clause(leaves in prop::collection::vec(leaf(), 1..4)) {
            let clause = leaves.into_iter().fold(owner(), |p, l| p.with(l)).negate();
            prop_assert!(!clause.is_negated());
            prop_assert!(clause.parameters().iter().all(Parameter::is_negated));
        }
    }
}
