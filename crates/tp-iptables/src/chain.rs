use crate::parameters::Parameter;
use crate::rules::Rule;
use crate::table::TableName;
use tp_core::Error;

/// A built-in or user-defined chain of one table.
///
/// Built by value: every `add_rule*` call consumes the chain and hands it
/// back, so a finished chain is passed to its table and never changed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    table: TableName,
    name: String,
    rules: Vec<Rule>,
}

impl Chain {
    pub fn new(table: &str, name: &str) -> Result<Self, Error> {
        let table: TableName = table.parse()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::EmptyName);
        }

        Ok(Self {
            table,
            name: name.to_string(),
            rules: vec![],
        })
    }

    pub fn table(&self) -> TableName {
        self.table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_builtin(&self) -> bool {
        self.table.builtin_chains().contains(&self.name.as_str())
    }

    pub fn add_rule(mut self, parameters: Vec<Parameter>) -> Self {
        self.rules.push(Rule::append(parameters));
        self
    }

    pub fn add_rule_at_position(mut self, position: usize, parameters: Vec<Parameter>) -> Self {
        self.rules.push(Rule::insert(position, parameters));
        self
    }

    pub fn add_rule_if(self, predicate: impl FnOnce() -> bool, parameters: Vec<Parameter>) -> Self {
        if predicate() {
            self.add_rule(parameters)
        } else {
            self
        }
    }

    pub fn build_for_restore(&self, verbose: bool) -> Vec<String> {
        self.rules
            .iter()
            .map(|rule| rule.build(&self.name, verbose))
            .collect()
    }
}
