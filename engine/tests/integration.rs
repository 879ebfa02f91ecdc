use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;

use engine::{DiagnosticError, Engine, EngineConfig, Limits, Status, decode_query};

/// A writer whose contents stay readable after it has been boxed into an
/// engine.
#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_with(engine: &mut Engine, source: &str) -> Result<String, DiagnosticError> {
    let mut output = Vec::new();
    engine.load_source(source, None, &mut output)?;
    Ok(String::from_utf8(output).unwrap())
}

fn run(source: &str) -> String {
    run_with(&mut Engine::new(), source).expect("template failed")
}

fn run_err(source: &str) -> DiagnosticError {
    run_with(&mut Engine::new(), source).expect_err("template should fail")
}

fn write_file(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn macros_expand_recursively() {
    let source = "\
#def inner deep
#def middle [<#inner>]
#def outer (<#middle>)
<#outer>
";
    assert_eq!(run(source), "([deep])\n");
}

#[test]
fn text_without_markers_passes_through() {
    let text = "<p>1 < 2 && 3 > 2</p>\n# not a directive\n";
    assert_eq!(run(text), text);
}

#[test]
fn builtin_conditionals() {
    let source = "\
#def known 1
<#ifequal|a|a|T|F><#ifequal|a|b|T|F><#ifequal|||T|F>
<#ifdef|known|Y|N><#ifdef|unknown|Y|N>
<#isin|ell|hello|T|F><#ifblock|nav|T|F>
";
    assert_eq!(run(source), "TFT\nYN\nTF\n");
}

#[test]
fn builtins_take_precedence_over_user_macros() {
    assert_eq!(run("#def ifequal shadowed\n<#ifequal|x|x|T|F>\n"), "T\n");
}

#[test]
fn unknown_references_stay_verbatim() {
    assert_eq!(run("a <#missing|x|<b>> z\n"), "a <#missing|x|<b>> z\n");
}

#[test]
fn conditional_nesting_is_balanced() {
    let source = "\
#if true
a
#if false
b
#elif true
c
#else
d
#endif
#elif true
e
#else
f
#endif
g
";
    assert_eq!(run(source), "a\nc\ng\n");
}

#[test]
fn conditional_errors() {
    assert_eq!(run_err("#if true\n#endif\n#endif\n").code(), 21);
    assert_eq!(run_err("#elif true\n").code(), 22);
    assert_eq!(run_err("#else\n").code(), 22);
    assert_eq!(run_err("#if\n").code(), 20);
    assert_eq!(run_err("#if maybe\n").code(), 23);

    let err = run_err("#if true\nunclosed\n");
    assert_eq!(err.code(), 24);
}

#[test]
fn conditional_depth_is_bounded() {
    let config = EngineConfig {
        limits: Limits {
            max_conditional_depth: 2,
            ..Limits::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = Engine::with_config(config);
    let err = run_with(&mut engine, "#if 1\n#if 1\n#if 1\n").unwrap_err();
    assert_eq!(err.code(), 19);
    assert_eq!(err.line_number, Some(3));
}

#[test]
fn loop_replays_block_in_order() {
    let source = "\
#begin item
<li><#i></li>
#end item
#loop item|i|1|3
#loop item|i|5|3
";
    assert_eq!(run(source), "<li>1</li>\n<li>2</li>\n<li>3</li>\n");
}

#[test]
fn loop_leaves_the_counter_defined() {
    let mut engine = Engine::new();
    run_with(&mut engine, "#begin b\n#end b\n#loop b : n 2 4\n").unwrap();
    assert_eq!(engine.lookup_macro("n"), Some("4"));
}

#[test]
fn loop_errors() {
    assert_eq!(run_err("#begin b\n#end b\n#loop b|i|1\n").code(), 36);
    assert_eq!(run_err("#begin b\n#end b\n#loop b|i|one|3\n").code(), 37);
    assert_eq!(run_err("#loop nowhere|i|1|3\n").code(), 25);
    // an empty range never looks the block up
    assert_eq!(run("#loop nowhere|i|5|3\nok\n"), "ok\n");
    assert_eq!(run_err("#loop\n").code(), 35);
}

#[test]
fn block_parameters_are_scoped_to_the_invocation() {
    let source = "\
#begin cell
<td><#.%1>/<#.%2></td>
#end cell
#process cell|x|y
after: <#.%1>
";
    assert_eq!(run(source), "<td>x/y</td>\nafter: <#.%1>\n");
}

#[test]
fn parameters_do_not_leak_into_nested_invocations() {
    let source = "\
#begin show
<#ifequal|<#.%2>||none|<#.%2>>
#end show
#begin wrap
#process show|only
[<#.%2>]
#end wrap
#process wrap|x|y
";
    assert_eq!(run(source), "none\n[y]\n");
}

#[test]
fn named_parameters_reach_outer_blocks() {
    let source = "\
#begin inner
<#outer.%1>-<#.%1>
#end inner
#begin outer
#process inner|in
#end outer
#process outer|out
";
    assert_eq!(run(source), "out-in\n");
}

#[test]
fn empty_parameters_are_unbound() {
    let source = "\
#begin b
<#ifdef|b.%1|set|unset> <#ifdef|b.%2|set|unset>
#end b
#process b||two
";
    assert_eq!(run(source), "unset set\n");
}

#[test]
fn undef_removes_macros_and_parameters() {
    let source = "\
#def x 1
#undef x
<#ifdef|x|y|n>
#begin b
#undef b.%1
<#ifdef|b.%1|y|n>
#end b
#process b|v
";
    assert_eq!(run(source), "n\nn\n");
}

#[test]
fn undefblock_removes_a_block() {
    let err = run_err("#begin b\n#end b\n#undefblock b\n#process b\n");
    assert_eq!(err.code(), 25);
    assert_eq!(err.line_number, Some(4));
}

#[test]
fn block_capture_errors() {
    assert_eq!(run_err("#begin a\n#begin b\n").code(), 2);
    assert_eq!(run_err("#begin a\n#end b\n").code(), 5);
    assert_eq!(run_err("#end a\n").code(), 39);

    let err = run_err("text\n#begin open\nbody\n");
    assert_eq!(err.code(), 42);
    assert_eq!(err.line_number, Some(2));
}

#[test]
fn blocks_are_captured_inside_false_branches() {
    let source = "\
#if false
#begin b
kept
#end b
#endif
#process b
";
    assert_eq!(run(source), "kept\n");
}

#[test]
fn recursive_blocks_overflow() {
    let err = run_err("#begin r\n#process r\n#end r\n#process r\n");
    assert_eq!(err.code(), 40);
    assert_eq!(err.line.as_deref(), Some("#process r"));

    let err = run_err("#begin r\n#process r|<#.%1>x\n#end r\n#process r|x\n");
    assert_eq!(err.code(), 40);
}

#[test]
fn recursion_limits_fit_a_small_thread_stack() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "loop.mht", "#include loop.mht\n");
    let path = dir.path().join("loop.mht");

    let codes = std::thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(move || {
            let blocks = run_err("#begin r\n#process r|a\n#end r\n#process r|a\n").code();
            let mut output = Vec::new();
            let includes = Engine::new()
                .load_file(&path, &mut output)
                .unwrap_err()
                .code();
            (blocks, includes)
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(codes, (40, 38));
}

#[test]
fn limits_can_be_lowered() {
    let config = EngineConfig {
        limits: Limits {
            max_block_depth: 3,
            ..Limits::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = Engine::with_config(config);
    let source = "#begin r\n<#n>\n#defex n <#n>+\n#process r\n#end r\n#def n .\n#process r\n";
    let err = run_with(&mut engine, source).unwrap_err();
    assert_eq!(err.code(), 40);
    assert_eq!(engine.lookup_macro("n"), Some(".+++"));
}

#[test]
fn recursive_macros_overflow() {
    let err = run_err("#def self <#self>\n<#self>\n");
    assert_eq!(err.code(), 40);
}

#[test]
fn too_many_arguments() {
    let config = EngineConfig {
        limits: Limits {
            max_arguments: 2,
            ..Limits::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = Engine::with_config(config);
    let err = run_with(&mut engine, "<#x|1|2|3>\n").unwrap_err();
    assert_eq!(err.code(), 41);
}

#[test]
fn unterminated_macro_degrades_with_a_warning() {
    let mut engine = Engine::new();
    let output = run_with(&mut engine, "fine\nbroken <#x|<y>\n").unwrap();
    assert_eq!(output, "fine\nbroken <#x|<y>\n");
    let warnings = engine.take_diagnostics();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].is_warning);
    assert_eq!(warnings[0].code(), 44);
    assert_eq!(warnings[0].line_number, Some(2));
}

#[test]
fn delayed_directives_and_references() {
    let source = "\
#def v 42
##def x <#v>
<##v>
###if true
";
    assert_eq!(run(source), "#def x 42\n<#v>\n##if true\n");
}

#[test]
fn defex_resolves_delayed_references() {
    let source = "\
#def v first
#defex later <##v>
#def v second
<#later>
";
    // the delayed reference survives definition and resolves on use
    assert_eq!(run(source), "second\n");
}

#[test]
fn directive_argument_errors() {
    assert_eq!(run_err("#def\n").code(), 27);
    assert_eq!(run_err("#def name\n").code(), 28);
    assert_eq!(run_err("#defex\n").code(), 29);
    assert_eq!(run_err("#defex name   \n").code(), 30);
    assert_eq!(run_err("#undef\n").code(), 31);
    assert_eq!(run_err("#undefblock\n").code(), 32);
    assert_eq!(run_err("#include\n").code(), 33);
    assert_eq!(run_err("#mhtvar killspace\n").code(), 34);
    assert_eq!(run_err("#process\n").code(), 26);
}

#[test]
fn settings_change_output() {
    let source = "\
#mhtvar convumlauts true
Grüße
#mhtvar killspace 1
   spaced   out
#mhtvar killspace 0
#mhtvar writeoutput false
hidden
#write shown
#mhtvar writeoutput true
";
    assert_eq!(run(source), "Gr&uuml;&szlig;e\nspaced   out shown");
}

#[test]
fn setting_errors() {
    assert_eq!(run_err("#mhtvar colour 1\n").code(), 8);
    assert_eq!(run_err("#mhtvar killspace maybe\n").code(), 7);
}

#[test]
fn echo_goes_to_the_console() {
    let console = SharedBuffer::default();
    let mut engine = Engine::new().with_console(Box::new(console.clone()));
    let output = run_with(&mut engine, "#def n 7\n#echo n=<#n>\n#echoln !\nbody\n").unwrap();
    assert_eq!(output, "body\n");
    assert_eq!(console.contents(), "n=7!\n");
}

#[test]
fn pause_waits_for_a_line() {
    let console = SharedBuffer::default();
    let mut engine = Engine::new()
        .with_console(Box::new(console.clone()))
        .with_terminal(Box::new(io::Cursor::new(b"\n".to_vec())));
    let output = run_with(&mut engine, "a\n#pause\nb\n").unwrap();
    assert_eq!(output, "a\nb\n");
    assert_eq!(console.contents(), "\nMHT paused: press return to continue...\n");
}

#[test]
fn mhtexit_stops_nested_processing() {
    let mut engine = Engine::new();
    let mut output = Vec::new();
    let status = engine
        .load_source(
            "#begin stop\nlast\n#mhtexit\nnever\n#end stop\nfirst\n#process stop\nafter\n",
            None,
            &mut output,
        )
        .unwrap();
    assert_eq!(status, Status::Exit);
    assert_eq!(String::from_utf8(output).unwrap(), "first\nlast\n");
}

#[test]
fn include_shares_macros_with_its_own_scope() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "header.mht", "#def title Home\n#if true\n<h1><#title></h1>\n#endif\n");
    write_file(
        dir.path(),
        "page.mht",
        "#if true\n#include header.mht\n#endif\n<title><#title></title>\n",
    );

    let mut engine = Engine::new();
    let mut output = Vec::new();
    engine.load_file(dir.path().join("page.mht"), &mut output).unwrap();
    assert_eq!(
        String::from_utf8(output).unwrap(),
        "<h1>Home</h1>\n<title>Home</title>\n"
    );
}

#[test]
fn false_condition_skips_include() {
    assert_eq!(run("#if false\n#include does-not-exist.mht\n#endif\nok\n"), "ok\n");
    assert_eq!(run_err("#include does-not-exist.mht\n").code(), 1);
}

#[test]
fn errors_in_included_files_point_at_the_included_line() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "bad.mht", "line one\n#if true\n");
    write_file(dir.path(), "main.mht", "#include bad.mht\n");

    let mut engine = Engine::new();
    let mut output = Vec::new();
    let err = engine
        .load_file(dir.path().join("main.mht"), &mut output)
        .unwrap_err();
    assert_eq!(err.code(), 24);
    assert_eq!(err.path.as_deref(), Some(dir.path().join("bad.mht").as_path()));
}

#[test]
fn self_inclusion_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "loop.mht", "#include loop.mht\n");

    let mut output = Vec::new();
    let err = Engine::new()
        .load_file(dir.path().join("loop.mht"), &mut output)
        .unwrap_err();
    assert_eq!(err.code(), 38);

    let config = EngineConfig {
        limits: Limits {
            max_include_depth: 5,
            ..Limits::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = Engine::with_config(config);
    let err = engine
        .load_file(dir.path().join("loop.mht"), &mut output)
        .unwrap_err();
    assert_eq!(err.code(), 38);
}

#[test]
fn blocks_survive_the_file_that_defined_them() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "lib.mht", "#begin greet\nHi <#.%1>\n#end greet\n");

    let mut engine = Engine::new();
    let mut output = Vec::new();
    engine.load_file(dir.path().join("lib.mht"), &mut output).unwrap();
    assert_eq!(engine.block_names(), vec!["greet"]);

    engine.invoke("greet", &["Ann".to_string()], &mut output).unwrap();
    assert_eq!(String::from_utf8(output).unwrap(), "Hi Ann\n");
}

#[test]
fn external_invocation_gets_its_own_scope() {
    let mut engine = Engine::new();
    let mut output = Vec::new();
    engine
        .load_source("#begin b\n#if false\nno\n#else\nyes\n#endif\n#end b\n", None, &mut output)
        .unwrap();
    engine.invoke("b", &[], &mut output).unwrap();
    engine
        .run_loop("b", &["k".to_string(), "1".to_string(), "2".to_string()], &mut output)
        .unwrap();
    assert_eq!(String::from_utf8(output.clone()).unwrap(), "yes\nyes\nyes\n");

    engine
        .load_source("#begin open\n#if true\n#end open\n", None, &mut output)
        .unwrap();
    assert_eq!(engine.invoke("open", &[], &mut output).unwrap_err().code(), 24);
}

#[test]
fn output_files() {
    let dir = tempfile::tempdir().unwrap();
    let source = "\
#mhtfile type html
#mhtfile type text
#mhtfile open html page.html
#mhtfile open text page.txt
#file html
<p>only html</p>
#file text
only text
#file all
both
#mhtfile close
primary
";
    let mut engine = Engine::new().with_base_dir(dir.path().to_path_buf());
    let output = run_with(&mut engine, source).unwrap();
    assert_eq!(output, "primary\n");
    assert_eq!(
        fs::read_to_string(dir.path().join("page.html")).unwrap(),
        "<p>only html</p>\nboth\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("page.txt")).unwrap(),
        "only text\nboth\n"
    );
}

#[test]
fn output_file_errors() {
    assert_eq!(run_err("#mhtfile\n").code(), 9);
    assert_eq!(run_err("#mhtfile rename x\n").code(), 10);
    assert_eq!(run_err("#mhtfile type html\n#mhtfile open html\n").code(), 11);
    assert_eq!(run_err("#file\n").code(), 16);
    assert_eq!(run_err("#mhtfile open html x.html\n").code(), 18);
    assert_eq!(run_err("#file html\n").code(), 18);
}

#[test]
fn open_output_file_blocks_capture() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::new().with_base_dir(dir.path().to_path_buf());
    let err = run_with(
        &mut engine,
        "#mhtfile type t\n#mhtfile open t out.txt\n#begin b\n",
    )
    .unwrap_err();
    assert_eq!(err.code(), 3);
}

#[test]
fn first_error_is_latched_into_macros() {
    let mut engine = Engine::new();
    let err = run_with(&mut engine, "#process nothing\n").unwrap_err();
    assert_eq!(err.code(), 25);
    run_with(&mut engine, "#endif\n").unwrap_err();

    let report = run_with(&mut engine, "<#mht_err_code>: <#mht_err_msg> (<#mht_err_line>)\n").unwrap();
    assert_eq!(report, "25: block not found: nothing (#process nothing)\n");
}

#[test]
fn request_input_becomes_macros() {
    let mut engine = Engine::new();
    engine.register_input(decode_query("name=Ann+Lee&tag=a&tag=b&blank="));
    let output = run_with(&mut engine, "<#name> [<#tag>] <#ifdef|blank|set|unset>\n").unwrap();
    assert_eq!(output, "Ann Lee [a,b] unset\n");
}

#[test]
fn configured_macros_and_standard_macros() {
    let config: EngineConfig = toml::from_str("[macros]\nsite = \"example.org\"\n").unwrap();
    let mut engine = Engine::with_config(config);
    let output = run_with(&mut engine, "<#site>|<#space>|<#null>|<#tab>\n").unwrap();
    assert_eq!(output, "example.org| ||\t\n");
    assert!(engine.lookup_macro("short_date").is_some());
    assert!(
        engine
            .lookup_macro("mht_version_msg")
            .is_some_and(|msg| msg.starts_with("MHT macro processor version"))
    );
}

#[test]
fn engines_are_independent() {
    let mut first = Engine::new();
    let mut second = Engine::new();
    run_with(&mut first, "#def only first\n").unwrap();
    assert_eq!(run_with(&mut second, "<#only>\n").unwrap(), "<#only>\n");
}

#[test]
fn arguments_are_substituted_once() {
    let source = "#def m [<#.%1>][<#.%2>]\n<#m|<#.%2>|X>\n";
    assert_eq!(run(source), "[<#.%2>][X]\n");
}

#[test]
fn empty_condition_is_invalid_not_missing() {
    assert_eq!(run_err("#if <#null>\n#endif\n").code(), 23);
    assert_eq!(run_err("#if\n#endif\n").code(), 20);
}

#[test]
fn process_line_does_not_capture_blocks() {
    let mut engine = Engine::new();
    let mut output = Vec::new();
    for line in ["#begin b\n", "inside\n", "#end b\n"] {
        assert_eq!(engine.process_line(line, &mut output).unwrap(), Status::Continue);
    }
    assert!(!engine.has_block("b"));
    assert_eq!(String::from_utf8(output).unwrap(), "inside\n");
}
