use std::path::{Path, PathBuf};
use std::process::Command;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct DragonOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn dragon_run(name: &str) -> DragonOutput {
    let dragon = env!("CARGO_BIN_EXE_dragon");
    let output = Command::new(dragon)
        .arg(fixture(name))
        .output()
        .expect("failed to execute dragon");

    DragonOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

fn assert_run_ok(name: &str, expected_stdout: &str) {
    let out = dragon_run(name);
    assert_eq!(
        out.exit_code, 0,
        "{name}: expected exit 0, got {}.\nstderr: {}",
        out.exit_code, out.stderr,
    );
    assert_eq!(out.stdout, expected_stdout, "{name}: stdout mismatch");
}

// ---------------------------------------------------------------------------
// Language scenarios
// ---------------------------------------------------------------------------

#[test]
fn run_map_squares() {
    assert_run_ok("map_squares.dgn", "[1, 4, 9]\n");
}

#[test]
fn run_varargs() {
    assert_run_ok("varargs.dgn", "[2, 3, 4]\n");
}

#[test]
fn run_class_to_string() {
    assert_run_ok("class_to_string.dgn", "A(7)\n");
}

#[test]
fn run_catch_message() {
    assert_run_ok("catch_message.dgn", "boom\n");
}

#[test]
fn run_loop_concat() {
    assert_run_ok("loop_concat.dgn", "012\n");
}

#[test]
fn run_foreach_string() {
    assert_run_ok("foreach_string.dgn", "a\nb\n");
}

#[test]
fn run_ranges() {
    assert_run_ok("ranges.dgn", "[1, 2, 3, 4, 5]\n[3, 2, 1]\n");
}

#[test]
fn run_switch_patterns() {
    assert_run_ok("switch_patterns.dgn", "num\n");
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

#[test]
fn imports_resolve_relative_to_the_script_and_cache() {
    // The module body runs exactly once; re-imports hit the cache. The
    // importing module keeps its own THIS_MODULE.
    assert_run_ok(
        "import_main.dgn",
        "loading mathlib\n42\n6.28\n4\n$main$\n",
    );
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

#[test]
fn uncaught_exception_exits_122_with_trace() {
    let out = dragon_run("uncaught.dgn");
    assert_eq!(out.exit_code, 122, "stderr: {}", out.stderr);
    assert!(
        out.stderr.contains("Exception: fatal"),
        "missing exception header in stderr: {}",
        out.stderr
    );
    assert!(
        out.stderr.contains("in kaboom"),
        "missing frame line in stderr: {}",
        out.stderr
    );
}

#[test]
fn compile_error_exits_121() {
    let out = dragon_run("syntax_error.dgn");
    assert_eq!(out.exit_code, 121);
    assert!(
        out.stderr.contains("Error"),
        "missing compile diagnostic: {}",
        out.stderr
    );
}

#[test]
fn unreadable_file_exits_120() {
    let dragon = env!("CARGO_BIN_EXE_dragon");
    let output = Command::new(dragon)
        .arg(fixture("no_such_file.dgn"))
        .output()
        .expect("failed to execute dragon");
    assert_eq!(output.status.code(), Some(120));
}

#[test]
fn dump_disassembles_without_running() {
    let dragon = env!("CARGO_BIN_EXE_dragon");
    let output = Command::new(dragon)
        .arg(fixture("loop_concat.dgn"))
        .arg("--dump")
        .output()
        .expect("failed to execute dragon");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout.contains("== <script> =="), "stdout: {}", stdout);
    assert!(stdout.contains("RETURN"), "stdout: {}", stdout);
    // The script itself must not have produced its print output.
    assert!(!stdout.contains("012\n"), "stdout: {}", stdout);
}
