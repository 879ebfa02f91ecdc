use mht::reference::{find_reference, inner_text, is_delayed, substitute_placeholders};
use mht::{MacroCall, SyntaxError};
use tracing::warn;

use crate::builtins::Builtin;
use crate::environment::Environment;
use crate::error::{DiagnosticError, EngineError};
use crate::settings::Limits;

/// Expand every macro reference in `input`.
///
/// References are resolved innermost first: the text between the brackets
/// is expanded before the reference itself is looked up. A reference that
/// cannot be resolved is copied to the output unchanged. An unterminated
/// reference stops expansion; the rest of the input is kept verbatim and a
/// warning is pushed to `diagnostics`.
pub fn expand(
    input: &str,
    env: &Environment,
    limits: &Limits,
    diagnostics: &mut Vec<DiagnosticError>,
) -> Result<String, EngineError> {
    expand_at(input, env, limits, 0, diagnostics)
}

fn expand_at(
    input: &str,
    env: &Environment,
    limits: &Limits,
    depth: usize,
    diagnostics: &mut Vec<DiagnosticError>,
) -> Result<String, EngineError> {
    if depth > limits.max_expansion_depth {
        return Err(EngineError::RecursionOverflow(limits.max_expansion_depth));
    }

    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    loop {
        let range = match find_reference(rest) {
            Ok(Some(range)) => range,
            Ok(None) => break,
            Err(SyntaxError::UnterminatedReference { offset }) => {
                warn!(remainder = &rest[offset..], "unterminated macro reference");
                diagnostics.push(DiagnosticError::warning(EngineError::UnterminatedMacro));
                break;
            }
            Err(other) => return Err(other.into()),
        };

        output.push_str(&rest[..range.start]);
        let inner = expand_at(inner_text(&rest[range.clone()]), env, limits, depth + 1, diagnostics)?;
        let resolved = resolve(&inner, env, limits, depth, diagnostics)?;
        output.push_str(&resolved);
        rest = &rest[range.end..];
    }

    output.push_str(rest);
    Ok(output)
}

/// Resolve one reference whose inner text has already been expanded.
fn resolve(
    inner: &str,
    env: &Environment,
    limits: &Limits,
    depth: usize,
    diagnostics: &mut Vec<DiagnosticError>,
) -> Result<String, EngineError> {
    if is_delayed(inner) {
        // drop one marker, the next pass sees an ordinary reference
        return Ok(format!("<{}>", &inner[1..]));
    }

    let call = MacroCall::parse(inner, limits.max_arguments)?;

    if let Some(builtin) = Builtin::lookup(&call.name) {
        return Ok(builtin.apply(&call, env));
    }

    if let Some(definition) = env.get_macro(&call.name) {
        let body = if call.arguments.is_empty() {
            definition.to_string()
        } else {
            substitute_placeholders(definition, &call.arguments)
        };
        return expand_at(&body, env, limits, depth + 1, diagnostics);
    }

    if let Some(value) = env.get_parameter(&call.name) {
        return expand_at(value, env, limits, depth + 1, diagnostics);
    }

    Ok(format!("<{inner}>"))
}
