//! Driver behavior through the built binary: exit codes, the version
//! flag, and error reporting.

use std::io::Write as _;
use std::process::{Command, Output};

fn raven(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_raven"))
        .args(args)
        .output()
        .expect("binary runs")
}

fn run_script(contents: &str) -> Output {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "{}", contents).expect("write script");
    raven(&[file.path().to_str().expect("utf-8 temp path")])
}

#[test]
fn test_successful_script_exits_zero() {
    let out = run_script("print 1 + 1;");
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "2\n");
}

#[test]
fn test_compile_error_exits_65() {
    let out = run_script("var;");
    assert_eq!(out.status.code(), Some(65));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Expect variable name."));
}

#[test]
fn test_runtime_error_exits_70() {
    let out = run_script("missing();");
    assert_eq!(out.status.code(), Some(70));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Undefined variable 'missing'."));
}

#[test]
fn test_unreadable_file_exits_74() {
    let out = raven(&["/no/such/raven/script.rvn"]);
    assert_eq!(out.status.code(), Some(74));
}

#[test]
fn test_version_flag_prints_and_exits_zero() {
    let out = raven(&["-V"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("raven"));
}

#[test]
fn test_extra_arguments_exit_64() {
    let out = raven(&["a.rvn", "b.rvn"]);
    assert_eq!(out.status.code(), Some(64));
    assert!(!out.stderr.is_empty());
}
