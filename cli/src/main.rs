mod test_runner;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;

use clap::{ArgAction, Parser, Subcommand};
use codespan_reporting::diagnostic::{Diagnostic, Label, Severity};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use engine::{DiagnosticError, Engine, EngineConfig, Status, decode_query};

const SUBCOMMANDS: &[&str] = &["run", "test", "help"];

/// Stack for the thread that runs the engine. Leaves headroom for limits
/// raised through `--config`.
const ENGINE_STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "mht", version, about = "MHT macro/template processor")]
struct Cli {
    /// Disable colored error output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log engine activity to stderr (-v debug, -vv trace). MHT_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a template file
    Run(RunArgs),

    /// Run .test.mht test files
    Test(TestArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Template file to process
    file: PathBuf,

    /// Write the primary output to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Define a macro before processing. Repeatable.
    #[arg(short = 'D', long = "define", value_name = "NAME=VALUE")]
    defines: Vec<String>,

    /// Register form input from a query string (a=1&b=2)
    #[arg(long)]
    query: Option<String>,

    /// Register the CGI request variables and the QUERY_STRING input
    #[arg(long)]
    cgi: bool,

    /// Block to process after the file has been loaded
    #[arg(short, long)]
    block: Option<String>,

    /// List all blocks the file defines instead of printing its output
    #[arg(long)]
    list_blocks: bool,

    /// Suppress template output (just check for errors)
    #[arg(short, long)]
    quiet: bool,

    /// Parameters passed to --block (after --)
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(clap::Args)]
struct TestArgs {
    /// Path to a .test.mht file or directory containing them
    path: String,

    /// Run only tests in these categories (subfolder names). Repeatable.
    #[arg(short, long)]
    category: Vec<String>,

    /// List available categories and exit
    #[arg(long)]
    list_categories: bool,
}

fn main() {
    // `mht page.mht` works like `mht run page.mht`.
    let mut args: Vec<String> = std::env::args().collect();
    if let Some(pos) = args
        .iter()
        .skip(1)
        .position(|a| !a.starts_with('-'))
        .map(|i| i + 1)
    {
        if !SUBCOMMANDS.contains(&args[pos].as_str()) {
            args.insert(pos, "run".to_string());
        }
    }

    let cli = Cli::parse_from(&args);
    init_logging(cli.verbose);

    match cli.command {
        Command::Run(run_args) => {
            let no_color = cli.no_color;
            let worker = thread::Builder::new()
                .name("mht-run".to_string())
                .stack_size(ENGINE_STACK_SIZE)
                .spawn(move || do_run(run_args, no_color));
            let exit_code = match worker.map(|handle| handle.join()) {
                Ok(Ok(code)) => code,
                _ => {
                    eprintln!("error: template processing thread failed");
                    1
                }
            };
            process::exit(exit_code);
        }
        Command::Test(test_args) => {
            let path = Path::new(&test_args.path);
            if test_args.list_categories {
                test_runner::list_categories(path);
                return;
            }
            let exit_code = test_runner::run_tests(path, cli.no_color, &test_args.category);
            process::exit(exit_code);
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "error",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("MHT_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

fn load_config(path: &Path) -> Result<EngineConfig, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    toml::from_str(&text).map_err(|e| format!("invalid config '{}': {}", path.display(), e))
}

fn do_run(args: RunArgs, no_color: bool) -> i32 {
    let color_choice = if no_color {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    };

    let config = match &args.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(message) => {
                eprintln!("error: {}", message);
                return 1;
            }
        },
        None => EngineConfig::default(),
    };
    debug!(?config, "configured engine");

    let mut engine = Engine::with_config(config);
    engine.register_env("USER", "user");
    engine.register_env("MHTUSERPATH", "userpath");
    engine.register_env("MHTSCRIPTPATH", "scriptpath");

    if args.cgi {
        let count = engine.register_cgi_environment();
        debug!(count, "registered CGI variables");
        if let Ok(query) = std::env::var("QUERY_STRING") {
            engine.register_input(decode_query(&query));
        }
    }
    if let Some(query) = &args.query {
        engine.register_input(decode_query(query));
    }
    for define in &args.defines {
        let (name, value) = define.split_once('=').unwrap_or((define.as_str(), ""));
        engine.define_macro(name, value);
    }

    let mut out: Box<dyn Write> = if args.quiet || args.list_blocks {
        Box::new(io::sink())
    } else if let Some(path) = &args.output {
        match File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(e) => {
                eprintln!("error: cannot create '{}': {}", path.display(), e);
                return 1;
            }
        }
    } else {
        Box::new(io::stdout().lock())
    };

    let mut result = engine.load_file(&args.file, &mut *out);
    if let Some(block) = &args.block {
        if matches!(result, Ok(Status::Continue)) {
            result = engine.invoke(block, &args.args, &mut *out);
        }
    }

    // sinks are closed on every path, including #mhtexit and failures
    let finished = engine
        .close_sinks()
        .and_then(|()| engine.flush(&mut *out));

    if args.list_blocks && result.is_ok() {
        for name in engine.block_names() {
            println!("{}", name);
        }
    }

    let writer = StandardStream::stderr(color_choice);
    let config = term::Config::default();
    emit_diagnostics(&writer, &config, &engine.take_diagnostics());

    match result.and(finished.map(|()| Status::Continue)) {
        Ok(_) => 0,
        Err(error) => {
            emit_diagnostic_error(&writer, &config, &error);
            error.code()
        }
    }
}

fn emit_diagnostic_error(writer: &StandardStream, config: &term::Config, error: &DiagnosticError) {
    let severity = if error.is_warning {
        Severity::Warning
    } else {
        Severity::Error
    };

    let located = error.path.as_ref().zip(error.line_number).and_then(|(path, number)| {
        let source = fs::read_to_string(path).ok()?;
        let span = line_span(&source, number)?;
        Some((path, source, span))
    });

    match located {
        Some((path, source, span)) => {
            let mut files = SimpleFiles::new();
            let file_id = files.add(path.display().to_string(), source);
            let diagnostic = Diagnostic::new(severity)
                .with_message(error.error.to_string())
                .with_code(format!("E{:02}", error.code()))
                .with_labels(vec![Label::primary(file_id, span)]);
            let _ = term::emit_to_write_style(&mut writer.lock(), config, &files, &diagnostic);
        }
        None => {
            let prefix = if error.is_warning { "warning" } else { "error" };
            eprintln!("{}[E{:02}]: {}", prefix, error.code(), error);
            if let Some(line) = &error.line {
                eprintln!("  | {}", line);
            }
        }
    }
}

fn emit_diagnostics(writer: &StandardStream, config: &term::Config, diagnostics: &[DiagnosticError]) {
    for diag in diagnostics {
        emit_diagnostic_error(writer, config, diag);
    }
}

/// Byte range of the 1-based line `number` in `source`, terminator excluded.
fn line_span(source: &str, number: usize) -> Option<Range<usize>> {
    let mut start = 0;
    for (index, line) in source.split_inclusive('\n').enumerate() {
        if index + 1 == number {
            let text = line.trim_end_matches(['\n', '\r']);
            return Some(start..start + text.len());
        }
        start += line.len();
    }
    None
}
