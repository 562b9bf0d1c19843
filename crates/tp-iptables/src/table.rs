use crate::chain::Chain;
use std::fmt;
use std::str::FromStr;
use tp_core::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableName {
    Nat,
    Mangle,
    Raw,
}

impl TableName {
    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Nat => "nat",
            TableName::Mangle => "mangle",
            TableName::Raw => "raw",
        }
    }

    /// Built-in chains in the order the kernel lists them.
    pub fn builtin_chains(self) -> &'static [&'static str] {
        match self {
            TableName::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            TableName::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
            TableName::Raw => &["PREROUTING", "OUTPUT"],
        }
    }
}

impl FromStr for TableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nat" => Ok(TableName::Nat),
            "mangle" => Ok(TableName::Mangle),
            "raw" => Ok(TableName::Raw),
            other => Err(Error::InvalidTable(other.to_string())),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `*table ... COMMIT` block of restore input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: TableName,
    builtin: Vec<Chain>,
    custom: Vec<Chain>,
}

impl Table {
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            builtin: vec![],
            custom: vec![],
        }
    }

    pub fn nat() -> Self {
        Self::new(TableName::Nat)
    }

    pub fn mangle() -> Self {
        Self::new(TableName::Mangle)
    }

    pub fn raw() -> Self {
        Self::new(TableName::Raw)
    }

    pub fn name(&self) -> TableName {
        self.name
    }

    /// Add a finished chain. A built-in chain replaces an earlier one of the
    /// same name; custom chains keep their insertion order.
    pub fn with_chain(mut self, chain: Chain) -> Self {
        let chains = if chain.is_builtin() {
            &mut self.builtin
        } else {
            &mut self.custom
        };

        match chains.iter_mut().find(|c| c.name() == chain.name()) {
            Some(existing) => *existing = chain,
            None => chains.push(chain),
        }
        self
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.builtin
            .iter()
            .chain(self.custom.iter())
            .find(|c| c.name() == name)
    }

    pub fn custom_chains(&self) -> &[Chain] {
        &self.custom
    }

    pub fn is_empty(&self) -> bool {
        self.custom.is_empty() && self.builtin.iter().all(|c| c.rules().is_empty())
    }

    pub fn build_for_restore(&self, verbose: bool) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut lines = vec![format!("*{}", self.name)];

        if !self.custom.is_empty() {
            if verbose {
                lines.push("# Custom Chains:".to_string());
            }
            let new_chain = if verbose { "--new-chain" } else { "-N" };
            for chain in &self.custom {
                lines.push(format!("{} {}", new_chain, chain.name()));
            }
        }

        let mut rules: Vec<String> = self
            .ordered_builtin()
            .chain(self.custom.iter())
            .flat_map(|chain| chain.build_for_restore(verbose))
            .collect();

        if !rules.is_empty() {
            if verbose {
                lines.push("# Rules:".to_string());
            }
            lines.append(&mut rules);
        }

        lines.push("COMMIT".to_string());
        lines.join("\n")
    }

    fn ordered_builtin(&self) -> impl Iterator<Item = &Chain> {
        self.name
            .builtin_chains()
            .iter()
            .filter_map(|name| self.builtin.iter().find(|c| c.name() == *name))
    }
}
