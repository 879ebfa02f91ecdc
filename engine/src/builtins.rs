//! The pseudo-macros that take precedence over user macros of the same name.

use mht::MacroCall;
use mht::reference::strip_placeholders;

use crate::environment::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `<#ifequal|a|b|then|else>`
    IfEqual,
    /// `<#ifdef|name|then|else>`
    IfDef,
    /// `<#isin|needle|haystack|then|else>`
    IsIn,
    /// `<#ifblock|name|then|else>`
    IfBlock,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        match name {
            "ifequal" => Some(Builtin::IfEqual),
            "ifdef" => Some(Builtin::IfDef),
            "isin" => Some(Builtin::IsIn),
            "ifblock" => Some(Builtin::IfBlock),
            _ => None,
        }
    }

    /// Pick a branch. Always succeeds; a missing branch is the empty string.
    pub fn apply(self, call: &MacroCall, env: &Environment) -> String {
        let chosen = match self {
            Builtin::IfEqual => {
                let left = call.argument(1).map(strip_placeholders);
                let right = call.argument(2).map(strip_placeholders);
                compare(left.as_deref(), right.as_deref(), |a, b| a == b)
            }
            Builtin::IsIn => compare(call.argument(1), call.argument(2), |needle, haystack| {
                haystack.contains(needle)
            }),
            Builtin::IfDef => match call.argument(1) {
                None => return String::new(),
                Some(name) => env.is_defined(name),
            },
            Builtin::IfBlock => match call.argument(1) {
                None => return String::new(),
                Some(name) => env.has_block(name),
            },
        };

        let (then_index, else_index) = match self {
            Builtin::IfEqual | Builtin::IsIn => (3, 4),
            Builtin::IfDef | Builtin::IfBlock => (2, 3),
        };
        let index = if chosen { then_index } else { else_index };
        call.argument_or_empty(index).to_string()
    }
}

/// Two absent operands count as a match, exactly one absent as a mismatch.
fn compare(left: Option<&str>, right: Option<&str>, test: impl Fn(&str, &str) -> bool) -> bool {
    let left = left.filter(|s| !s.is_empty());
    let right = right.filter(|s| !s.is_empty());
    match (left, right) {
        (None, None) => true,
        (Some(a), Some(b)) => test(a, b),
        _ => false,
    }
}
