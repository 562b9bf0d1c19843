use crate::parameters::Parameter;

/// Position 0 appends; any other value inserts at that 1-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    position: usize,
    parameters: Vec<Parameter>,
}

impl Rule {
    pub fn append(parameters: Vec<Parameter>) -> Self {
        Self {
            position: 0,
            parameters,
        }
    }

    pub fn insert(position: usize, parameters: Vec<Parameter>) -> Self {
        Self {
            position,
            parameters,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn build(&self, chain: &str, verbose: bool) -> String {
        let mut args = match (self.position, verbose) {
            (0, false) => vec!["-A".to_string(), chain.to_string()],
            (0, true) => vec!["--append".to_string(), chain.to_string()],
            (position, false) => vec!["-I".to_string(), chain.to_string(), position.to_string()],
            (position, true) => vec![
                "--insert".to_string(),
                chain.to_string(),
                position.to_string(),
            ],
        };

        for parameter in &self.parameters {
            args.extend(parameter.build(verbose));
        }

        args.join(" ")
    }
}
