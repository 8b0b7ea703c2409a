//! Process-level tests for the `fidel` binary.
//!
//! Each test writes a script to a temp directory, spawns the real binary,
//! and checks the exit code and output streams against the documented
//! contract (0 ok, 64 usage, 65 compile error, 60 runtime error, 74 I/O).

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

fn fidel() -> Command {
    Command::new(env!("CARGO_BIN_EXE_fidel"))
}

fn run_script(source: &str) -> Output {
    run_script_with_args(source, &[])
}

fn run_script_with_args(source: &str, args: &[&str]) -> Output {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("script.fdl");
    fs::write(&path, source).expect("write script");
    fidel()
        .args(args)
        .arg(&path)
        .output()
        .expect("spawn fidel")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_runs_script_and_exits_zero() {
    let output = run_script("አውጣ 1 + 2 * 3;");
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    assert_eq!(stdout(&output), "7\n");
}

#[test]
fn test_utf8_source_round_trips_to_stdout() {
    let output = run_script("አውጣ \"ሰላም ዓለም\";");
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    assert_eq!(stdout(&output), "ሰላም ዓለም\n");
}

#[test]
fn test_compile_error_exits_65() {
    let output = run_script("አውጣ ;");
    assert_eq!(output.status.code(), Some(65));
    let err = stderr(&output);
    assert!(err.contains("[line 1] Error"), "{err}");
    assert!(err.contains("Expect expression."), "{err}");
}

#[test]
fn test_runtime_error_exits_60_with_trace() {
    let output = run_script("አውጣ x;");
    assert_eq!(output.status.code(), Some(60));
    let err = stderr(&output);
    assert!(err.contains("Undefined variable 'x'."), "{err}");
    assert!(err.contains("[line 1] in script"), "{err}");
}

#[test]
fn test_missing_file_exits_74() {
    let path = PathBuf::from("definitely/not/here.fdl");
    let output = fidel().arg(&path).output().expect("spawn fidel");
    assert_eq!(output.status.code(), Some(74));
    assert!(stderr(&output).contains("Could not read file"));
}

#[test]
fn test_extra_arguments_exit_64() {
    let output = fidel()
        .args(["one.fdl", "two.fdl"])
        .output()
        .expect("spawn fidel");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn test_print_code_flag_dumps_bytecode() {
    let output = run_script_with_args("አውጣ 1;", &["--print-code"]);
    assert_eq!(output.status.code(), Some(0));
    let err = stderr(&output);
    assert!(err.contains("== <script> =="), "{err}");
    assert!(err.contains("Print"), "{err}");
    // Program output stays clean on stdout.
    assert_eq!(stdout(&output), "1\n");
}

#[test]
fn test_stress_gc_flag_still_computes() {
    let output = run_script_with_args(
        "መለያ ሰ = \"\"; ለዚህ (መለያ ቁ = 0; ቁ < 10; ቁ = ቁ + 1) { ሰ = ሰ + \"ab\"; } አውጣ ሰ;",
        &["--stress-gc"],
    );
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    assert_eq!(stdout(&output), format!("{}\n", "ab".repeat(10)));
}

#[test]
fn test_trace_flag_logs_instructions() {
    let output = run_script_with_args("አውጣ 1;", &["--trace"]);
    assert_eq!(output.status.code(), Some(0));
    let err = stderr(&output);
    assert!(err.contains("Constant"), "{err}");
    assert!(err.contains("Print"), "{err}");
}
