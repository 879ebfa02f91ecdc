use crate::error::SyntaxError;
use crate::reference::{SEPARATOR, split_fields};

/// How the parameters of an invocation were written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    /// `name`
    Bare,
    /// `name|p1|p2`, empty fields allowed.
    Piped,
    /// `name : p1 p2`, whitespace separated, no empty fields.
    Legacy,
}

/// The target of `#process` or `#loop`: a block name and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub block: String,
    pub parameters: Vec<String>,
    pub form: Form,
}

impl Invocation {
    pub fn parse(spec: &str, max_arguments: usize) -> Result<Invocation, SyntaxError> {
        let spec = spec.trim();
        let separator = spec.find([SEPARATOR, ':']);

        let invocation = match separator {
            None => Invocation {
                block: spec.to_string(),
                parameters: Vec::new(),
                form: Form::Bare,
            },
            Some(at) if spec[at..].starts_with(SEPARATOR) => {
                let mut fields = split_fields(spec).into_iter();
                let block = fields.next().unwrap_or_default().trim().to_string();
                Invocation {
                    block,
                    parameters: fields.collect(),
                    form: Form::Piped,
                }
            }
            Some(at) => Invocation {
                block: spec[..at].trim().to_string(),
                parameters: spec[at + 1..]
                    .split_whitespace()
                    .filter(|word| *word != ":")
                    .map(str::to_string)
                    .collect(),
                form: Form::Legacy,
            },
        };

        if invocation.parameters.len() > max_arguments {
            return Err(SyntaxError::TooManyArguments {
                count: invocation.parameters.len(),
                max: max_arguments,
            });
        }

        Ok(invocation)
    }
}
