//! Raven CLI
//!
//! `raven` with no arguments starts a line-editing REPL; with one
//! argument it executes the given script. Exit codes follow the sysexits
//! convention: 64 usage, 65 compile error, 70 runtime error, 74 I/O
//! error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser as ClapParser;
use raven_runtime::{InterpretError, Vm};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE: i32 = 65;
const EXIT_RUNTIME: i32 = 70;
const EXIT_IO: i32 = 74;

#[derive(ClapParser)]
#[command(name = "raven")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Raven interpreter - run a script or start a REPL", long_about = None)]
struct Cli {
    /// Script to execute; omit to start the REPL
    script: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            e.print().ok();
            process::exit(0);
        }
        Err(e) => {
            e.print().ok();
            process::exit(EXIT_USAGE);
        }
    };

    match cli.script {
        Some(path) => process::exit(run_file(&path)),
        None => process::exit(run_repl()),
    }
}

fn run_file(path: &Path) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read \"{}\": {}.", path.display(), e);
            return EXIT_IO;
        }
    };
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => 0,
        Err(error) => report(&error),
    }
}

fn report(error: &InterpretError) -> i32 {
    eprintln!("{}", error);
    match error {
        InterpretError::Compile(_) => EXIT_COMPILE,
        InterpretError::Runtime(_) => EXIT_RUNTIME,
    }
}

fn run_repl() -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start line editor: {}.", e);
            return EXIT_IO;
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        // Missing history is fine on first run.
        let _ = editor.load_history(path);
    }

    let mut vm = Vm::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                if let Err(error) = vm.interpret(&line) {
                    eprintln!("{}", error);
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}.", e);
                return EXIT_IO;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    0
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".raven_history"))
}
