use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use mht::{Keyword, SyntaxError};
use thiserror::Error;

/// Every way an engine operation can fail. Each kind has a stable numeric
/// code, surfaced as the process exit status and in `mht_err_code`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("block definitions cannot be nested: #begin {0} inside an open block")]
    NestedBlockCapture(String),

    #[error("output files must be closed before #begin")]
    OpenSinkAtBegin,

    #[error("output files must be closed before #end")]
    OpenSinkAtEnd,

    #[error("#end {found} does not match #begin {expected}")]
    MismatchedBlockEnd { expected: String, found: String },

    #[error("unrecognized value for #mhtvar: {0}")]
    SettingValueUnrecognized(String),

    #[error("unknown #mhtvar setting: {0}")]
    UnknownSetting(String),

    #[error("#mhtfile needs an action (type, open or close)")]
    SinkOperationMissing,

    #[error("unrecognized #mhtfile action: {0}")]
    SinkOperationUnrecognized(String),

    #[error("#mhtfile open needs a file name")]
    SinkFilenameMissing,

    #[error("disk full while opening {}", .0.display())]
    DiskFull(PathBuf),

    #[error("cannot open {} for writing: write protected", .0.display())]
    WriteProtected(PathBuf),

    #[error("cannot open {}: {source}", path.display())]
    GeneralIoError { path: PathBuf, source: io::Error },

    #[error("#file needs an output type")]
    SinkSelectorMissing,

    #[error("unknown output type: {0}")]
    SinkUnknownType(String),

    #[error("too many nested #if levels (at most {0})")]
    TooManyConditionalLevels(usize),

    #[error("missing argument after {0}")]
    MissingConditionArgument(Keyword),

    #[error("#endif without #if")]
    TooManyEndif,

    #[error("{0} without #if")]
    DanglingElseOrElif(Keyword),

    #[error("invalid condition '{0}': expected true, false, 1 or 0")]
    InvalidConditionArgument(String),

    #[error("#if without matching #endif")]
    UnterminatedConditional,

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("missing argument after {0}")]
    MissingArgument(Keyword),

    #[error("missing definition after {0}")]
    MissingDefinition(Keyword),

    #[error("#loop needs a block, a variable, a start and an end")]
    InsufficientLoopParameters,

    #[error("loop bound is not a non-negative integer: '{0}'")]
    NonIntegerLoopBound(String),

    #[error("files included too deeply (at most {0} levels)")]
    TooDeepFileInclusion(usize),

    #[error("#end {0} without #begin")]
    UnmatchedBlockEnd(String),

    #[error("expansion nested too deeply (at most {0} levels); is a macro or block recursive?")]
    RecursionOverflow(usize),

    #[error("too many arguments: {count} (at most {max} allowed)")]
    TooManyArguments { count: usize, max: usize },

    #[error("#begin {0} without matching #end")]
    UnterminatedBlock(String),

    #[error("too many output types (at most {0})")]
    TooManySinks(usize),

    #[error("unterminated macro reference")]
    UnterminatedMacro,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn code(&self) -> i32 {
        match self {
            EngineError::FileNotFound(_) => 1,
            EngineError::NestedBlockCapture(_) => 2,
            EngineError::OpenSinkAtBegin => 3,
            EngineError::OpenSinkAtEnd => 4,
            EngineError::MismatchedBlockEnd { .. } => 5,
            EngineError::SettingValueUnrecognized(_) => 7,
            EngineError::UnknownSetting(_) => 8,
            EngineError::SinkOperationMissing => 9,
            EngineError::SinkOperationUnrecognized(_) => 10,
            EngineError::SinkFilenameMissing => 11,
            EngineError::DiskFull(_) => 12,
            EngineError::WriteProtected(_) => 13,
            EngineError::GeneralIoError { .. } => 14,
            EngineError::SinkSelectorMissing => 16,
            EngineError::SinkUnknownType(_) => 18,
            EngineError::TooManyConditionalLevels(_) => 19,
            EngineError::MissingConditionArgument(_) => 20,
            EngineError::TooManyEndif => 21,
            EngineError::DanglingElseOrElif(_) => 22,
            EngineError::InvalidConditionArgument(_) => 23,
            EngineError::UnterminatedConditional => 24,
            EngineError::BlockNotFound(_) => 25,
            EngineError::MissingArgument(keyword) => match keyword {
                Keyword::Def => 27,
                Keyword::Defex => 29,
                Keyword::Undef => 31,
                Keyword::Undefblock => 32,
                Keyword::Include => 33,
                Keyword::Mhtvar => 34,
                Keyword::Loop => 35,
                _ => 26,
            },
            EngineError::MissingDefinition(keyword) => match keyword {
                Keyword::Defex => 30,
                _ => 28,
            },
            EngineError::InsufficientLoopParameters => 36,
            EngineError::NonIntegerLoopBound(_) => 37,
            EngineError::TooDeepFileInclusion(_) => 38,
            EngineError::UnmatchedBlockEnd(_) => 39,
            EngineError::RecursionOverflow(_) => 40,
            EngineError::TooManyArguments { .. } => 41,
            EngineError::UnterminatedBlock(_) => 42,
            EngineError::TooManySinks(_) => 43,
            EngineError::UnterminatedMacro => 44,
            EngineError::Io(_) => 45,
        }
    }
}

impl From<SyntaxError> for EngineError {
    fn from(error: SyntaxError) -> Self {
        match error {
            SyntaxError::UnterminatedReference { .. } => EngineError::UnterminatedMacro,
            SyntaxError::TooManyArguments { count, max } => {
                EngineError::TooManyArguments { count, max }
            }
        }
    }
}

/// An engine error or warning together with where it happened: the source
/// file, the 1-based line number and the text of the offending line.
#[derive(Debug)]
pub struct DiagnosticError {
    pub error: EngineError,
    pub path: Option<PathBuf>,
    pub line_number: Option<usize>,
    pub line: Option<String>,
    pub is_warning: bool,
}

impl DiagnosticError {
    pub fn warning(error: EngineError) -> Self {
        DiagnosticError {
            is_warning: true,
            ..DiagnosticError::from(error)
        }
    }

    pub fn code(&self) -> i32 {
        self.error.code()
    }

    /// Attach a location unless an inner layer already did.
    pub fn located(mut self, path: Option<&Path>, line_number: usize, line: &str) -> Self {
        if self.line_number.is_none() && self.path.is_none() {
            self.path = path.map(Path::to_path_buf);
            self.line_number = Some(line_number);
            self.line = Some(line.trim_end_matches(['\n', '\r']).to_string());
        }
        self
    }
}

impl From<EngineError> for DiagnosticError {
    fn from(error: EngineError) -> Self {
        DiagnosticError {
            error,
            path: None,
            line_number: None,
            line: None,
            is_warning: false,
        }
    }
}

impl From<SyntaxError> for DiagnosticError {
    fn from(error: SyntaxError) -> Self {
        DiagnosticError::from(EngineError::from(error))
    }
}

impl From<io::Error> for DiagnosticError {
    fn from(error: io::Error) -> Self {
        DiagnosticError::from(EngineError::Io(error))
    }
}

impl fmt::Display for DiagnosticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, self.line_number) {
            (Some(path), Some(number)) => {
                write!(f, "{}:{}: {}", path.display(), number, self.error)
            }
            (None, Some(number)) => write!(f, "line {}: {}", number, self.error),
            _ => self.error.fmt(f),
        }
    }
}

impl std::error::Error for DiagnosticError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
