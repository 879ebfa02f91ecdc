use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use engine::{DiagnosticError, Engine, EngineConfig, decode_query};

const SUFFIX: &str = ".test.mht";

#[derive(Debug, Deserialize)]
pub struct ExpectedWarning {
    /// Substring that must appear in the warning message.
    pub contains: String,

    /// If set, the warning must point at this 1-based line of the template body.
    #[serde(default)]
    pub line: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub description: Option<String>,

    /// Macros defined before the template is loaded.
    pub macros: BTreeMap<String, String>,

    /// Form input registered as macros, as a query string.
    pub query: Option<String>,

    /// Expected primary output (trimmed comparison).
    pub expect_output: Option<String>,

    /// The error's message must contain this substring.
    pub expect_error: Option<String>,

    /// The error's numeric code.
    pub expect_code: Option<i32>,

    /// Output files, relative to the test's scratch directory, and their
    /// expected contents (trimmed comparison).
    pub expect_files: BTreeMap<String, String>,

    /// If present (even empty), warning count and content are checked.
    pub expect_warnings: Option<Vec<ExpectedWarning>>,
}

/// Split a `.test.mht` file into its TOML frontmatter and template body.
fn parse_test_file(content: &str) -> Result<(TestConfig, &str), String> {
    let content = content.trim_start_matches('\u{feff}');
    let after_open = content
        .strip_prefix("---")
        .ok_or("missing opening --- frontmatter delimiter")?;
    let after_open = after_open
        .strip_prefix('\n')
        .or_else(|| after_open.strip_prefix("\r\n"))
        .unwrap_or(after_open);

    let close = after_open
        .find("\n---")
        .ok_or("missing closing --- frontmatter delimiter")?;
    let frontmatter = after_open[..close].trim_end_matches('\r');
    let rest = &after_open[close + 4..];
    let body = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest);

    let config = toml::from_str(frontmatter).map_err(|e| format!("TOML parse error: {}", e))?;
    Ok((config, body))
}

pub enum TestOutcome {
    Pass,
    Fail(String),
}

pub struct TestResult {
    pub path: PathBuf,
    pub description: Option<String>,
    pub outcome: TestOutcome,
}

impl TestResult {
    fn label(&self) -> &str {
        self.description.as_deref().unwrap_or_else(|| {
            self.path
                .file_name()
                .and_then(|s| s.to_str())
                .map(|s| s.trim_end_matches(SUFFIX))
                .unwrap_or("?")
        })
    }
}

fn run_single_test(path: &Path) -> TestResult {
    let (description, outcome) = match std::fs::read_to_string(path) {
        Err(e) => (None, Err(format!("cannot read file: {}", e))),
        Ok(content) => match parse_test_file(&content) {
            Err(e) => (None, Err(format!("frontmatter error: {}", e))),
            Ok((config, body)) => (config.description.clone(), check_test(path, &config, body)),
        },
    };

    TestResult {
        path: path.to_path_buf(),
        description,
        outcome: match outcome {
            Ok(()) => TestOutcome::Pass,
            Err(reason) => TestOutcome::Fail(reason),
        },
    }
}

fn check_test(path: &Path, config: &TestConfig, body: &str) -> Result<(), String> {
    let scratch = tempfile::tempdir().map_err(|e| format!("cannot create scratch dir: {}", e))?;

    let mut engine = Engine::with_config(EngineConfig::default())
        .with_base_dir(scratch.path().to_path_buf())
        .with_console(Box::new(io::sink()))
        .with_terminal(Box::new(io::empty()));
    for (name, value) in &config.macros {
        engine.define_macro(name, value);
    }
    if let Some(query) = &config.query {
        engine.register_input(decode_query(query));
    }

    let mut output = Vec::new();
    let result = engine.load_source(body, Some(path), &mut output);
    let finished = engine.close_sinks().and_then(|()| engine.flush(&mut output));
    let result = result.and_then(|status| finished.map(|()| status));

    match (&config.expect_error, config.expect_code, result) {
        (None, None, Err(err)) => return Err(format!("unexpected error: {}", err)),
        (None, None, Ok(_)) => {}
        (_, _, Ok(_)) => {
            return Err("expected an error, but processing succeeded".into());
        }
        (expected_error, expected_code, Err(err)) => {
            if let Some(expected) = expected_error {
                let message = err.to_string();
                if !message.contains(expected.as_str()) {
                    return Err(format!(
                        "expected error containing \"{}\", got: {}",
                        expected, message
                    ));
                }
            }
            if let Some(code) = expected_code {
                if err.code() != code {
                    return Err(format!("expected error code {}, got {}: {}", code, err.code(), err));
                }
            }
        }
    }

    if let Some(expected) = &config.expect_output {
        let actual = String::from_utf8_lossy(&output);
        if actual.trim() != expected.trim() {
            return Err(format!(
                "output mismatch\n  expected: {}\n  actual:   {}",
                expected.trim(),
                actual.trim()
            ));
        }
    }

    for (name, expected) in &config.expect_files {
        let actual = std::fs::read_to_string(scratch.path().join(name))
            .map_err(|e| format!("output file {}: {}", name, e))?;
        if actual.trim() != expected.trim() {
            return Err(format!(
                "output file {} mismatch\n  expected: {}\n  actual:   {}",
                name,
                expected.trim(),
                actual.trim()
            ));
        }
    }

    if let Some(expected) = &config.expect_warnings {
        check_warnings(&engine.take_diagnostics(), expected)?;
    }
    Ok(())
}

fn check_warnings(diagnostics: &[DiagnosticError], expected: &[ExpectedWarning]) -> Result<(), String> {
    let warnings: Vec<&DiagnosticError> = diagnostics.iter().filter(|d| d.is_warning).collect();

    if warnings.len() != expected.len() {
        let listed = if warnings.is_empty() {
            "    (none)".to_string()
        } else {
            warnings
                .iter()
                .map(|w| format!("  - {}", w))
                .collect::<Vec<_>>()
                .join("\n")
        };
        return Err(format!(
            "expected {} warning(s), got {}\n  actual warnings:\n{}",
            expected.len(),
            warnings.len(),
            listed
        ));
    }

    for (i, (actual, expected)) in warnings.iter().zip(expected).enumerate() {
        let message = actual.to_string();
        if !message.contains(&expected.contains) {
            return Err(format!(
                "warning[{}]: expected message containing \"{}\", got: {}",
                i, expected.contains, message
            ));
        }
        match (expected.line, actual.line_number) {
            (Some(want), Some(got)) if want != got => {
                return Err(format!("warning[{}]: expected on line {}, but it is on line {}", i, want, got));
            }
            (Some(want), None) => {
                return Err(format!("warning[{}]: expected on line {}, but it has no line", i, want));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Discover `.test.mht` files grouped by category (subfolder relative to
/// root). Files directly in `root` get category "" (uncategorized).
fn discover_categorized(root: &Path) -> BTreeMap<String, Vec<PathBuf>> {
    let mut categories: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    collect_tests(root, root, &mut categories);
    for files in categories.values_mut() {
        files.sort();
    }
    categories
}

fn collect_tests(dir: &Path, root: &Path, out: &mut BTreeMap<String, Vec<PathBuf>>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tests(&path, root, out);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.ends_with(SUFFIX))
        {
            let category = path
                .parent()
                .and_then(|p| p.strip_prefix(root).ok())
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            out.entry(category).or_default().push(path);
        }
    }
}

fn category_label(category: &str) -> &str {
    if category.is_empty() { "(root)" } else { category }
}

pub fn list_categories(path: &Path) {
    if path.is_file() {
        eprintln!("(single file, no categories)");
        return;
    }

    let categories = discover_categorized(path);
    if categories.is_empty() {
        eprintln!("no {} files found in {}", SUFFIX, path.display());
        return;
    }

    eprintln!("available categories:");
    for (category, files) in &categories {
        eprintln!("  {} ({} tests)", category_label(category), files.len());
    }
}

fn paint(text: &str, code: &str, no_color: bool) -> String {
    if no_color {
        text.to_string()
    } else {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    }
}

fn select_categories<'a>(
    all: &'a BTreeMap<String, Vec<PathBuf>>,
    requested: &[String],
) -> BTreeMap<&'a str, &'a [PathBuf]> {
    if requested.is_empty() {
        return all.iter().map(|(k, v)| (k.as_str(), v.as_slice())).collect();
    }

    let mut selected = BTreeMap::new();
    for request in requested {
        let request = request.trim_matches('/');
        let nested = format!("{}/", request);
        let before = selected.len();
        for (category, files) in all {
            if category == request || category.starts_with(&nested) {
                selected.insert(category.as_str(), files.as_slice());
            }
        }
        if selected.len() == before {
            let available: Vec<&str> = all.keys().map(|k| category_label(k)).collect();
            eprintln!(
                "warning: category '{}' not found (available: {})",
                request,
                available.join(", ")
            );
        }
    }
    selected
}

/// Run all `.test.mht` files under `path` (or a single file). If
/// `categories` is non-empty, only run tests in those categories.
/// Returns the exit code: 0 when everything passed, 1 otherwise.
pub fn run_tests(path: &Path, no_color: bool, categories: &[String]) -> i32 {
    let groups: BTreeMap<String, Vec<PathBuf>> = if path.is_file() {
        BTreeMap::from([(String::new(), vec![path.to_path_buf()])])
    } else {
        discover_categorized(path)
    };
    if groups.is_empty() {
        eprintln!("no {} files found in {}", SUFFIX, path.display());
        return 1;
    }

    let selected = if path.is_file() {
        select_categories(&groups, &[])
    } else {
        select_categories(&groups, categories)
    };
    if selected.is_empty() {
        eprintln!("no matching categories found");
        return 1;
    }

    let mut passed = 0usize;
    let mut failures: Vec<TestResult> = Vec::new();

    for (category, files) in &selected {
        if !path.is_file() {
            eprintln!();
            eprintln!("{}", paint(category_label(category), "1", no_color));
        }
        for file in *files {
            let result = run_single_test(file);
            match &result.outcome {
                TestOutcome::Pass => {
                    passed += 1;
                    eprintln!("  {}  {}", paint("PASS", "32", no_color), result.label());
                }
                TestOutcome::Fail(_) => {
                    eprintln!("  {}  {}", paint("FAIL", "31", no_color), result.label());
                    failures.push(result);
                }
            }
        }
    }

    if !failures.is_empty() {
        eprintln!();
        eprintln!("failures:");
        for failure in &failures {
            eprintln!();
            eprintln!("  --- {} ---", failure.path.display());
            if let TestOutcome::Fail(reason) = &failure.outcome {
                for line in reason.lines() {
                    eprintln!("  {}", line);
                }
            }
        }
    }

    eprintln!();
    if failures.is_empty() {
        eprintln!("test result: {}. {} passed, 0 failed", paint("ok", "32", no_color), passed);
        0
    } else {
        let failed = failures.len();
        eprintln!(
            "test result: {}. {} passed, {} failed (of {})",
            paint("FAILED", "31", no_color),
            passed,
            failed,
            passed + failed
        );
        1
    }
}
