use thiserror::Error;

/// Malformed macro syntax found while scanning a line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    /// A `<#` whose brackets never balance before the end of the text.
    #[error("unterminated macro reference at offset {offset}")]
    UnterminatedReference { offset: usize },

    #[error("too many macro arguments: {count} (at most {max} allowed)")]
    TooManyArguments { count: usize, max: usize },
}
