use mht::Keyword;

use crate::error::EngineError;

/// State of one `#if ... #endif` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Lines in the current branch are acted on.
    pub is_true: bool,
    /// Some branch of this level has already been taken.
    pub was_true: bool,
    /// The level was opened by `#if`; false only for a scope's base frame.
    pub has_if: bool,
}

impl Frame {
    const BASE: Frame = Frame {
        is_true: true,
        was_true: true,
        has_if: false,
    };
}

/// The frame stack of one file (or one externally triggered invocation).
#[derive(Debug, Clone)]
pub struct Scope {
    frames: Vec<Frame>,
}

impl Scope {
    fn new() -> Self {
        Scope {
            frames: vec![Frame::BASE],
        }
    }

    fn current(&self) -> Frame {
        self.frames.last().copied().unwrap_or(Frame::BASE)
    }

    fn enclosing(&self) -> Frame {
        match self.frames.len() {
            0 | 1 => Frame::BASE,
            n => self.frames[n - 2],
        }
    }

    fn is_balanced(&self) -> bool {
        self.frames.len() == 1
    }
}

/// One conditional scope per file-inclusion level.
#[derive(Debug, Clone)]
pub struct ConditionalStack {
    scopes: Vec<Scope>,
    max_depth: usize,
}

impl ConditionalStack {
    pub fn new(max_depth: usize) -> Self {
        ConditionalStack {
            scopes: Vec::new(),
            max_depth,
        }
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Close the current scope. The scope is removed even when it still has
    /// open `#if` levels, so that the stack stays in step with the callers.
    pub fn exit_scope(&mut self) -> Result<(), EngineError> {
        match self.scopes.pop() {
            Some(scope) if !scope.is_balanced() => Err(EngineError::UnterminatedConditional),
            _ => Ok(()),
        }
    }

    pub fn has_scope(&self) -> bool {
        !self.scopes.is_empty()
    }

    /// Whether non-conditional lines are currently acted on. Outside of
    /// any scope everything is.
    pub fn is_active(&self) -> bool {
        self.scopes
            .last()
            .is_none_or(|scope| scope.current().is_true)
    }

    /// Number of open `#if` levels in the current scope.
    pub fn depth(&self) -> usize {
        self.scopes
            .last()
            .map_or(0, |scope| scope.frames.len().saturating_sub(1))
    }

    /// Apply `#if`, `#elif`, `#else` or `#endif`. `argument` is the already
    /// expanded, lower-cased first word of the directive.
    pub fn evaluate(&mut self, keyword: Keyword, argument: Option<&str>) -> Result<(), EngineError> {
        if self.scopes.is_empty() {
            self.enter_scope();
        }
        let max_depth = self.max_depth;
        let Some(scope) = self.scopes.last_mut() else {
            return Ok(());
        };

        match keyword {
            Keyword::If => {
                let argument = argument.ok_or(EngineError::MissingConditionArgument(keyword))?;
                if scope.frames.len() > max_depth {
                    return Err(EngineError::TooManyConditionalLevels(max_depth));
                }
                let is_true = scope.current().is_true && parse_condition(argument)?;
                scope.frames.push(Frame {
                    is_true,
                    was_true: is_true,
                    has_if: true,
                });
            }
            Keyword::Elif => {
                let argument = argument.ok_or(EngineError::MissingConditionArgument(keyword))?;
                let frame = scope.current();
                if !frame.has_if {
                    return Err(EngineError::DanglingElseOrElif(keyword));
                }
                let is_true = if scope.enclosing().is_true && !frame.was_true {
                    parse_condition(argument)?
                } else {
                    false
                };
                set_current(scope, is_true);
            }
            Keyword::Else => {
                let frame = scope.current();
                if !frame.has_if {
                    return Err(EngineError::DanglingElseOrElif(keyword));
                }
                let is_true = scope.enclosing().is_true && !frame.was_true;
                set_current(scope, is_true);
            }
            Keyword::Endif => {
                if !scope.current().has_if {
                    return Err(EngineError::TooManyEndif);
                }
                scope.frames.pop();
            }
            _ => {}
        }
        Ok(())
    }
}

fn set_current(scope: &mut Scope, is_true: bool) {
    if let Some(frame) = scope.frames.last_mut() {
        frame.is_true = is_true;
        frame.was_true |= is_true;
    }
}

fn parse_condition(argument: &str) -> Result<bool, EngineError> {
    match argument {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(EngineError::InvalidConditionArgument(other.to_string())),
    }
}
