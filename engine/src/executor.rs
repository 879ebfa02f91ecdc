use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use mht::directive::{first_word, remainder, text_argument};
use mht::{Invocation, Keyword, Line};
use tracing::{debug, trace};

use crate::conditional::ConditionalStack;
use crate::environment::{Block, Environment};
use crate::error::{DiagnosticError, EngineError};
use crate::evaluator;
use crate::input::standard_macros;
use crate::output::OutputRouter;
use crate::settings::{EngineConfig, Limits, Settings, kill_space};

const PAUSE_PROMPT: &str = "\nMHT paused: press return to continue...\n";

/// How a load or invocation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Continue,
    /// `#mhtexit` was executed; the caller should flush, close its sinks and
    /// stop.
    Exit,
}

/// A `#begin` whose `#end` has not been read yet.
struct Capture {
    name: String,
    lines: Vec<String>,
    begin_line: usize,
    begin_text: String,
}

/// All state of one template run: symbol stores, conditional scopes,
/// output sinks and settings. Independent engines share nothing.
pub struct Engine {
    env: Environment,
    conditionals: ConditionalStack,
    router: OutputRouter,
    settings: Settings,
    limits: Limits,
    include_depth: usize,
    invocation_depth: usize,
    error_latched: bool,
    diagnostics: Vec<DiagnosticError>,
    /// Target of `#echo` and the `#pause` prompt.
    console: Box<dyn Write>,
    /// Source of the line `#pause` waits for.
    terminal: Box<dyn BufRead>,
    /// Directory relative includes and output files are resolved against
    /// when no including file gives a better anchor.
    base_dir: PathBuf,
    /// Files currently being loaded, innermost last.
    file_stack: Vec<PathBuf>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut engine = Engine {
            env: Environment::new(),
            conditionals: ConditionalStack::new(config.limits.max_conditional_depth),
            router: OutputRouter::new(config.limits.max_sinks),
            settings: config.settings,
            limits: config.limits,
            include_depth: 0,
            invocation_depth: 0,
            error_latched: false,
            diagnostics: Vec::new(),
            console: Box::new(io::stdout()),
            terminal: Box::new(BufReader::new(io::stdin())),
            base_dir: PathBuf::from("."),
            file_stack: Vec::new(),
        };
        for (name, value) in standard_macros(Local::now().naive_local()) {
            engine.env.define_macro(name, &value);
        }
        for (name, value) in &config.macros {
            engine.env.define_macro(name, value);
        }
        engine
    }

    pub fn with_console(mut self, console: Box<dyn Write>) -> Self {
        self.console = console;
        self
    }

    pub fn with_terminal(mut self, terminal: Box<dyn BufRead>) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn with_base_dir(mut self, base_dir: PathBuf) -> Self {
        self.base_dir = base_dir;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn define_macro(&mut self, name: &str, definition: &str) {
        self.env.define_macro(name, definition);
    }

    pub fn lookup_macro(&self, name: &str) -> Option<&str> {
        self.env.get_macro(name)
    }

    pub fn undef_macro(&mut self, name: &str) -> bool {
        self.env.undef_macro(name)
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.env.has_block(name)
    }

    pub fn block_names(&self) -> Vec<&str> {
        self.env.block_names()
    }

    pub fn undef_block(&mut self, name: &str) -> bool {
        self.env.undef_block(name)
    }

    /// Expand macro references in `text` against the current definitions.
    pub fn expand(&mut self, text: &str) -> Result<String, DiagnosticError> {
        let result = self.expand_text(text).map_err(DiagnosticError::from);
        self.latch(result)
    }

    /// Warnings collected so far, oldest first.
    pub fn take_diagnostics(&mut self) -> Vec<DiagnosticError> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Load a template file: execute its directives, write its content to
    /// `out` and keep every macro and block it defines.
    pub fn load_file(&mut self, path: impl AsRef<Path>, out: &mut dyn Write) -> Result<Status, DiagnosticError> {
        let result = self.load_path(path.as_ref(), out);
        self.latch(result)
    }

    /// Like [`Engine::load_file`] for a template held in memory. `origin`
    /// names it in diagnostics and anchors relative includes.
    pub fn load_source(
        &mut self,
        source: &str,
        origin: Option<&Path>,
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        let result = self.load_reader(&mut source.as_bytes(), origin, out);
        self.latch(result)
    }

    /// Dispatch a single line as if it had been read from a file.
    ///
    /// Block capture belongs to the file loader: a `#begin` or `#end` passed
    /// here defines nothing and is ignored.
    pub fn process_line(&mut self, line: &str, out: &mut dyn Write) -> Result<Status, DiagnosticError> {
        let result = self.dispatch(line, out);
        self.latch(result)
    }

    /// Run block `name`, binding `parameters` to `.%1`, `.%2`, ...
    pub fn invoke(
        &mut self,
        name: &str,
        parameters: &[String],
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        let result = self.invoke_block(name, parameters, out);
        self.latch(result)
    }

    /// Run block `name` once for every integer in `start..=end`, with the
    /// macro `variable` set to the counter. `parameters` is
    /// `[variable, start, end]`.
    pub fn run_loop(
        &mut self,
        name: &str,
        parameters: &[String],
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        let result = self.loop_block(name, parameters, out);
        self.latch(result)
    }

    /// Close every open output file and route output back to the primary
    /// stream.
    pub fn close_sinks(&mut self) -> Result<(), DiagnosticError> {
        self.router.close_all().map_err(DiagnosticError::from)
    }

    pub fn flush(&mut self, out: &mut dyn Write) -> Result<(), DiagnosticError> {
        self.router.flush()?;
        self.console.flush()?;
        out.flush()?;
        Ok(())
    }

    /// Record the first failure of the run in `mht_err_msg`,
    /// `mht_err_line` and `mht_err_code`.
    fn latch<T>(&mut self, result: Result<T, DiagnosticError>) -> Result<T, DiagnosticError> {
        if let Err(err) = &result {
            if !self.error_latched && !err.is_warning {
                self.error_latched = true;
                self.env.define_macro("mht_err_msg", &err.error.to_string());
                self.env
                    .define_macro("mht_err_line", err.line.as_deref().unwrap_or(""));
                self.env.define_macro("mht_err_code", &err.code().to_string());
            }
        }
        result
    }

    fn expand_text(&mut self, text: &str) -> Result<String, EngineError> {
        evaluator::expand(text, &self.env, &self.limits, &mut self.diagnostics)
    }

    fn expand_word(&mut self, rest: &str) -> Result<Option<String>, EngineError> {
        match first_word(rest) {
            Some((word, _)) => Ok(Some(self.expand_text(word)?)),
            None => Ok(None),
        }
    }

    fn locate_warnings(&mut self, from: usize, origin: Option<&Path>, number: usize, text: &str) {
        let pending: Vec<DiagnosticError> = self.diagnostics.drain(from..).collect();
        self.diagnostics.extend(
            pending
                .into_iter()
                .map(|warning| warning.located(origin, number, text)),
        );
    }

    // --- File loading ---

    fn load_path(&mut self, path: &Path, out: &mut dyn Write) -> Result<Status, DiagnosticError> {
        let file = File::open(path).map_err(|_| EngineError::FileNotFound(path.to_path_buf()))?;
        debug!(path = %path.display(), depth = self.include_depth, "loading file");
        self.load_reader(&mut BufReader::new(file), Some(path), out)
    }

    fn load_reader(
        &mut self,
        reader: &mut dyn BufRead,
        origin: Option<&Path>,
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        if self.include_depth >= self.limits.max_include_depth {
            return Err(EngineError::TooDeepFileInclusion(self.limits.max_include_depth).into());
        }

        self.include_depth += 1;
        if let Some(path) = origin {
            self.file_stack.push(path.to_path_buf());
        }
        self.conditionals.enter_scope();

        let result = self.load_lines(reader, origin, out);

        let closed = self.conditionals.exit_scope();
        if origin.is_some() {
            self.file_stack.pop();
        }
        self.include_depth -= 1;

        match result {
            Ok(Status::Continue) => {
                closed.map_err(|e| DiagnosticError {
                    path: origin.map(Path::to_path_buf),
                    ..DiagnosticError::from(e)
                })?;
                Ok(Status::Continue)
            }
            other => other,
        }
    }

    fn load_lines(
        &mut self,
        reader: &mut dyn BufRead,
        origin: Option<&Path>,
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        let mut capture: Option<Capture> = None;
        let mut buf = Vec::new();
        let mut number = 0;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            number += 1;
            let text = String::from_utf8_lossy(&buf).replace('\r', "");

            let warnings = self.diagnostics.len();
            let result = self.load_line(&text, number, &mut capture, origin, out);
            self.locate_warnings(warnings, origin, number, &text);

            if result.map_err(|e| e.located(origin, number, &text))? == Status::Exit {
                return Ok(Status::Exit);
            }
        }

        match capture {
            Some(open) => Err(DiagnosticError::from(EngineError::UnterminatedBlock(open.name))
                .located(origin, open.begin_line, &open.begin_text)),
            None => Ok(Status::Continue),
        }
    }

    /// Block capture happens here, before conditionals are consulted: a
    /// `#begin ... #end` pair is recorded even inside a false `#if`.
    fn load_line(
        &mut self,
        text: &str,
        number: usize,
        capture: &mut Option<Capture>,
        origin: Option<&Path>,
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        match Line::parse(text) {
            Line::Directive {
                keyword: Keyword::Begin,
                rest,
            } => {
                let name = first_word(rest).map_or("", |(word, _)| word).to_string();
                if capture.is_some() {
                    return Err(EngineError::NestedBlockCapture(name).into());
                }
                if self.router.has_open_sink() {
                    return Err(EngineError::OpenSinkAtBegin.into());
                }
                debug!(block = %name, "capturing block");
                *capture = Some(Capture {
                    name,
                    lines: Vec::new(),
                    begin_line: number,
                    begin_text: text.to_string(),
                });
                Ok(Status::Continue)
            }
            Line::Directive {
                keyword: Keyword::End,
                rest,
            } => {
                let name = first_word(rest).map_or("", |(word, _)| word);
                let Some(open) = capture.take() else {
                    return Err(EngineError::UnmatchedBlockEnd(name.to_string()).into());
                };
                if open.name != name {
                    return Err(EngineError::MismatchedBlockEnd {
                        expected: open.name,
                        found: name.to_string(),
                    }
                    .into());
                }
                if self.router.has_open_sink() {
                    return Err(EngineError::OpenSinkAtEnd.into());
                }
                debug!(block = %open.name, lines = open.lines.len(), "registered block");
                self.env.define_block(
                    &open.name,
                    Block {
                        lines: open.lines,
                        origin: origin.map(Path::to_path_buf),
                        first_line: open.begin_line + 1,
                    },
                );
                Ok(Status::Continue)
            }
            _ => match capture {
                Some(open) => {
                    open.lines.push(text.to_string());
                    Ok(Status::Continue)
                }
                None => self.dispatch(text, out),
            },
        }
    }

    fn resolve_include(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.file_stack.last().and_then(|file| file.parent()) {
            Some(dir) => dir.join(path),
            None => self.base_dir.join(path),
        }
    }

    // --- Directive dispatch ---

    fn dispatch(&mut self, text: &str, out: &mut dyn Write) -> Result<Status, DiagnosticError> {
        match Line::parse(text) {
            Line::Literal(content) => {
                self.emit_content(content, out)?;
                Ok(Status::Continue)
            }
            Line::Delayed(content) => {
                self.emit_content(&content, out)?;
                Ok(Status::Continue)
            }
            Line::Directive { keyword, rest } if keyword.is_conditional() => {
                let argument = self
                    .expand_word(rest)?
                    .map(|word| word.to_lowercase());
                trace!(directive = %keyword, argument = ?argument, "conditional");
                self.conditionals.evaluate(keyword, argument.as_deref())?;
                Ok(Status::Continue)
            }
            Line::Directive { keyword, rest } => {
                if !self.conditionals.is_active() {
                    return Ok(Status::Continue);
                }
                trace!(directive = %keyword, "dispatch");
                self.execute(keyword, rest, out)
            }
        }
    }

    fn emit_content(&mut self, content: &str, out: &mut dyn Write) -> Result<(), DiagnosticError> {
        if !self.conditionals.is_active() || !self.settings.write_output {
            return Ok(());
        }
        let expanded = self.expand_text(content)?;
        let processed = self.settings.apply(&expanded);
        self.router.write(out, &processed)?;
        Ok(())
    }

    fn execute(&mut self, keyword: Keyword, rest: &str, out: &mut dyn Write) -> Result<Status, DiagnosticError> {
        match keyword {
            Keyword::Def | Keyword::Defex => {
                let (name, tail) = first_word(rest).ok_or(EngineError::MissingArgument(keyword))?;
                let name = self.expand_text(name)?;
                let definition = remainder(tail).ok_or(EngineError::MissingDefinition(keyword))?;
                let definition = if keyword == Keyword::Defex {
                    self.expand_text(definition)?
                } else {
                    definition.to_string()
                };
                trace!(name = %name, "defined macro");
                self.env.define_macro(&name, &definition);
            }
            Keyword::Undef => {
                let name = self
                    .expand_word(rest)?
                    .ok_or(EngineError::MissingArgument(keyword))?;
                if name.contains(mht::reference::PARAMETER_MARKER) {
                    self.env.undef_parameter(&name);
                } else {
                    self.env.undef_macro(&name);
                }
            }
            Keyword::Undefblock => {
                let name = self
                    .expand_word(rest)?
                    .ok_or(EngineError::MissingArgument(keyword))?;
                debug!(block = %name, "removed block");
                self.env.undef_block(&name);
            }
            Keyword::Process | Keyword::Loop => {
                let spec = match remainder(rest) {
                    Some(spec) => self.expand_text(spec)?,
                    None => String::new(),
                };
                let invocation = Invocation::parse(&spec, self.limits.max_arguments)?;
                if invocation.block.is_empty() {
                    return Err(EngineError::MissingArgument(keyword).into());
                }
                return if keyword == Keyword::Process {
                    self.invoke_block(&invocation.block, &invocation.parameters, out)
                } else {
                    self.loop_block(&invocation.block, &invocation.parameters, out)
                };
            }
            Keyword::Include => {
                let name = self
                    .expand_word(rest)?
                    .ok_or(EngineError::MissingArgument(keyword))?;
                let path = self.resolve_include(&name);
                return self.load_path(&path, out);
            }
            Keyword::Mhtvar => {
                let (name, tail) = first_word(rest).ok_or(EngineError::MissingArgument(keyword))?;
                let value = self
                    .expand_word(tail)?
                    .ok_or(EngineError::MissingArgument(keyword))?;
                let name = self.expand_text(name)?;
                self.settings.set(&name, &value)?;
                debug!(setting = %name, value = %value, "changed setting");
            }
            Keyword::Mhtexit => {
                debug!("exit requested");
                return Ok(Status::Exit);
            }
            Keyword::File => {
                let kind = match remainder(rest) {
                    Some(kind) => self.expand_text(kind)?.trim().to_string(),
                    None => String::new(),
                };
                if kind.is_empty() {
                    return Err(EngineError::SinkSelectorMissing.into());
                }
                self.router.select(&kind)?;
            }
            Keyword::Mhtfile => self.execute_mhtfile(rest)?,
            Keyword::Echo | Keyword::Echoln | Keyword::Write | Keyword::Writeln => {
                let text = match text_argument(rest) {
                    Some(text) => Some(self.expand_text(text)?),
                    None => None,
                };
                let newline = matches!(keyword, Keyword::Echoln | Keyword::Writeln);
                let line = match text {
                    Some(text) if self.settings.kill_space => kill_space(&text),
                    Some(text) if newline => text + "\n",
                    Some(text) => text,
                    None if newline && !self.settings.kill_space => "\n".to_string(),
                    None => String::new(),
                };
                if matches!(keyword, Keyword::Echo | Keyword::Echoln) {
                    self.console.write_all(line.as_bytes())?;
                } else {
                    self.router.write(out, &line)?;
                }
            }
            Keyword::Pause => {
                self.console.write_all(PAUSE_PROMPT.as_bytes())?;
                self.console.flush()?;
                let mut answer = String::new();
                self.terminal.read_line(&mut answer)?;
            }
            Keyword::Begin | Keyword::End => {
                // only meaningful to the file loader
                trace!(directive = %keyword, "ignored outside of a file");
            }
            Keyword::If | Keyword::Elif | Keyword::Else | Keyword::Endif => {
                // evaluated by dispatch before gating
            }
        }
        Ok(Status::Continue)
    }

    /// `#mhtfile close`, `#mhtfile type T`, `#mhtfile open T filename`.
    fn execute_mhtfile(&mut self, rest: &str) -> Result<(), DiagnosticError> {
        let (action, tail) = first_word(rest).ok_or(EngineError::SinkOperationMissing)?;
        match action.to_ascii_lowercase().as_str() {
            "close" => self.router.close_all()?,
            "type" => {
                let kind = self
                    .expand_word(tail)?
                    .ok_or_else(|| EngineError::SinkUnknownType(String::new()))?;
                self.router.register_type(&kind)?;
            }
            "open" => {
                let (kind, tail) = first_word(tail)
                    .ok_or_else(|| EngineError::SinkUnknownType(String::new()))?;
                let kind = self.expand_text(kind)?;
                let filename = match remainder(tail) {
                    Some(name) => self.expand_text(name)?.trim().to_string(),
                    None => String::new(),
                };
                let path = (!filename.is_empty()).then(|| self.base_dir.join(&filename));
                self.router.open(&kind, path.as_deref())?;
            }
            _ => return Err(EngineError::SinkOperationUnrecognized(action.to_string()).into()),
        }
        Ok(())
    }

    // --- Blocks and loops ---

    /// Open a conditional scope for the duration of `f` when the call did not
    /// come from a file that already has one.
    fn with_scope(
        &mut self,
        f: impl FnOnce(&mut Engine) -> Result<Status, DiagnosticError>,
    ) -> Result<Status, DiagnosticError> {
        if self.conditionals.has_scope() {
            return f(self);
        }
        self.conditionals.enter_scope();
        let result = f(self);
        let closed = self.conditionals.exit_scope();
        match result {
            Ok(Status::Continue) => {
                closed?;
                Ok(Status::Continue)
            }
            other => other,
        }
    }

    fn invoke_block(
        &mut self,
        name: &str,
        parameters: &[String],
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        self.with_scope(|engine| {
            if parameters.is_empty() {
                return engine.replay(name, out);
            }
            engine.env.push_parameters(name, parameters);
            let result = engine.replay(name, out);
            engine.env.pop_parameters();
            result
        })
    }

    fn replay(&mut self, name: &str, out: &mut dyn Write) -> Result<Status, DiagnosticError> {
        let block = self
            .env
            .get_block(name)
            .ok_or_else(|| EngineError::BlockNotFound(name.to_string()))?;
        if self.invocation_depth >= self.limits.max_block_depth {
            return Err(EngineError::RecursionOverflow(self.limits.max_block_depth).into());
        }

        debug!(block = name, depth = self.invocation_depth, "processing block");
        self.invocation_depth += 1;
        let result = self.replay_lines(&block, out);
        self.invocation_depth -= 1;
        result
    }

    fn replay_lines(&mut self, block: &Block, out: &mut dyn Write) -> Result<Status, DiagnosticError> {
        let origin = block.origin.as_deref();
        for (offset, line) in block.lines.iter().enumerate() {
            let number = block.first_line + offset;
            let warnings = self.diagnostics.len();
            let result = self.dispatch(line, out);
            self.locate_warnings(warnings, origin, number, line);

            if result.map_err(|e| e.located(origin, number, line))? == Status::Exit {
                return Ok(Status::Exit);
            }
        }
        Ok(Status::Continue)
    }

    fn loop_block(
        &mut self,
        name: &str,
        parameters: &[String],
        out: &mut dyn Write,
    ) -> Result<Status, DiagnosticError> {
        let [variable, start, end, ..] = parameters else {
            return Err(EngineError::InsufficientLoopParameters.into());
        };
        if variable.is_empty() {
            return Err(EngineError::InsufficientLoopParameters.into());
        }
        let start = parse_bound(start)?;
        let end = parse_bound(end)?;
        if start <= end && !self.env.has_block(name) {
            return Err(EngineError::BlockNotFound(name.to_string()).into());
        }

        debug!(block = name, start, end, "looping");
        self.with_scope(|engine| {
            for i in start..=end {
                engine.env.define_macro(variable, &i.to_string());
                if engine.replay(name, out)? == Status::Exit {
                    return Ok(Status::Exit);
                }
            }
            Ok(Status::Continue)
        })
    }
}

fn parse_bound(text: &str) -> Result<u64, EngineError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::NonIntegerLoopBound(text.to_string()));
    }
    text.parse()
        .map_err(|_| EngineError::NonIntegerLoopBound(text.to_string()))
}
