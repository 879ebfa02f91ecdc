//! Macro references: `<#name>`, `<#name|arg1|arg2>`, `<#.%n>` and the
//! fenced `<##name>` form.

use std::ops::Range;

use crate::directive::{MARKER, fence};
use crate::error::SyntaxError;

/// The token that opens a macro reference.
pub const OPEN: &str = "<#";

/// Separates a macro name from its arguments and the arguments from each other.
pub const SEPARATOR: char = '|';

/// Prefix of a positional parameter name: `.%1`, `block.%2`.
pub const PARAMETER_MARKER: &str = ".%";

/// Locate the leftmost macro reference in `text`.
///
/// The returned range covers the reference including its brackets. Every
/// `<` and `>` after the opening bracket counts toward the balance, whether
/// or not it belongs to a macro, so `<#x|<b>>` is a single reference.
pub fn find_reference(text: &str) -> Result<Option<Range<usize>>, SyntaxError> {
    let Some(start) = text.find(OPEN) else {
        return Ok(None);
    };

    let mut depth = 0usize;
    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        match byte {
            b'<' => depth += 1,
            b'>' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(start..start + offset + 1));
                }
            }
            _ => {}
        }
    }

    Err(SyntaxError::UnterminatedReference { offset: start })
}

/// The text between the brackets of a reference found by [`find_reference`],
/// leading markers included: `<##x|y>` gives `##x|y`.
pub fn inner_text(reference: &str) -> &str {
    reference
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(reference)
}

/// True when the inner text carries more than one marker and must be left
/// for a later pass.
pub fn is_delayed(inner: &str) -> bool {
    fence(inner) > 1
}

/// A resolved-syntax macro call: the name and its positional arguments.
///
/// Arguments follow the pipe-splitting rules of the reference syntax: an
/// empty field in the middle is kept as an absent argument, empty fields at
/// the end are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroCall {
    pub name: String,
    pub arguments: Vec<String>,
}

impl MacroCall {
    /// Parse the inner text of a reference. A single leading marker is
    /// removed before the name is read.
    pub fn parse(inner: &str, max_arguments: usize) -> Result<MacroCall, SyntaxError> {
        let body = inner.strip_prefix(MARKER).unwrap_or(inner);
        let mut fields = split_fields(body).into_iter();
        let name = fields.next().unwrap_or_default();
        let arguments: Vec<String> = fields.collect();

        if arguments.len() > max_arguments {
            return Err(SyntaxError::TooManyArguments {
                count: arguments.len(),
                max: max_arguments,
            });
        }

        Ok(MacroCall { name, arguments })
    }

    /// The 1-based positional argument `index`, `None` when absent or empty.
    pub fn argument(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.arguments.get(i))
            .map(String::as_str)
            .filter(|arg| !arg.is_empty())
    }

    /// Like [`MacroCall::argument`] but an absent argument reads as `""`.
    pub fn argument_or_empty(&self, index: usize) -> &str {
        self.argument(index).unwrap_or("")
    }
}

/// Split on `|`, keeping empty fields in the middle and dropping the empty
/// fields at the end.
pub fn split_fields(text: &str) -> Vec<String> {
    let mut fields: Vec<String> = text.split(SEPARATOR).map(str::to_string).collect();
    while fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }
    fields
}

/// Replace `<#.%n>` in `body` with the `n`th argument (1-based). Placeholders
/// whose argument is absent or empty stay in place. Inserted arguments are
/// not scanned again.
pub fn substitute_placeholders(body: &str, arguments: &[String]) -> String {
    let open = format!("{OPEN}{PARAMETER_MARKER}");
    let mut result = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find(&open) {
        result.push_str(&rest[..start]);
        let after = &rest[start + open.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let closed = digits > 0 && after[digits..].starts_with('>');
        let argument = closed
            .then(|| after[..digits].parse::<usize>().ok())
            .flatten()
            .and_then(|index| index.checked_sub(1))
            .and_then(|i| arguments.get(i))
            .filter(|argument| !argument.is_empty());

        match argument {
            Some(argument) => {
                result.push_str(argument);
                rest = &after[digits + 1..];
            }
            None => {
                result.push_str(&open);
                rest = after;
            }
        }
    }

    result.push_str(rest);
    result
}

/// Remove every `<#.…>` placeholder from `text`. Used to normalize operands
/// that still carry unbound parameters before they are compared.
pub fn strip_placeholders(text: &str) -> String {
    let open = format!("{OPEN}.");
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(&open) {
        result.push_str(&rest[..start]);
        match rest[start..].find('>') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = &rest[start..];
                break;
            }
        }
    }

    result.push_str(rest);
    result
}

/// The key of a block parameter: `block.%3`, or `.%3` for whichever block is
/// running innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterKey<'a> {
    pub block: Option<&'a str>,
    pub index: usize,
}

impl<'a> ParameterKey<'a> {
    pub fn parse(name: &'a str) -> Option<ParameterKey<'a>> {
        let (block, index) = name.rsplit_once(PARAMETER_MARKER)?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: usize = index.parse().ok()?;
        if index == 0 {
            return None;
        }
        let block = if block.is_empty() { None } else { Some(block) };
        Some(ParameterKey { block, index })
    }
}
