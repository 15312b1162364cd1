mod env;
mod error;
mod eval;
mod parser;
mod prims;
mod printer;
mod symbol;
mod value;

use std::io::{IsTerminal, Read};
use std::process::ExitCode;

use error::JoyError;
use eval::Evaluator;

enum Outcome {
    Ok,
    Failed,
    Quit(i64),
}

/// Parse and run one chunk of input, phrase by phrase. Errors abort the
/// offending phrase only; definitions already installed stay installed.
fn run_input(ev: &mut Evaluator, input: &str, file: &str) -> Outcome {
    let phrases = match parser::parse(input, file, &mut ev.syms) {
        Ok(phrases) => phrases,
        Err(e) => {
            eprintln!("{}", e.diagnostic());
            return Outcome::Failed;
        }
    };
    let mut failed = false;
    for phrase in &phrases {
        match ev.run_phrase(phrase) {
            Ok(()) => {}
            Err(JoyError::Quit(code)) => return Outcome::Quit(code),
            Err(e) => {
                eprintln!("{}", e.diagnostic());
                if ev.env.echo >= 2 {
                    eprintln!("stack: {}", ev.stack_dump());
                }
                failed = true;
            }
        }
    }
    if failed {
        Outcome::Failed
    } else {
        Outcome::Ok
    }
}

/// Is this parse error just an unfinished phrase the next line may complete?
fn is_incomplete(input: &str, ev: &mut Evaluator) -> bool {
    match parser::parse(input, "stdin", &mut ev.syms) {
        Err(JoyError::Parse { msg, .. }) => {
            msg.starts_with("missing '.' at end of phrase")
                || msg.starts_with("unterminated list")
                || msg.starts_with("unterminated set")
                || msg.starts_with("unterminated definition block")
                || msg.starts_with("unterminated comment")
        }
        _ => false,
    }
}

fn run_repl(ev: &mut Evaluator) -> ExitCode {
    let mut rl = rustyline::DefaultEditor::new().expect("failed to create readline editor");
    println!("RJoy v0.1.0 — a Joy interpreter");
    println!("  Terms between '.'s make a phrase; DEFINE installs words.");
    println!("  Ctrl-D to exit.\n");

    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { "rjoy> " } else { "....> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if line.trim().is_empty() && pending.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.trim());
                if ev.env.echo >= 1 {
                    println!("{}", line.trim_end());
                }
                pending.push_str(&line);
                pending.push('\n');
                if is_incomplete(&pending, ev) {
                    continue;
                }
                let input = std::mem::take(&mut pending);
                if let Outcome::Quit(code) = run_input(ev, &input, "stdin") {
                    return exit_with(code);
                }
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!();
                return ExitCode::SUCCESS;
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("^C");
                pending.clear();
                continue;
            }
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        }
    }
}

fn exit_with(code: i64) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let mut ev = Evaluator::new();
    ev.args = argv.clone();

    let files: Vec<&str> = argv[1..].iter().map(String::as_str).collect();

    if files.is_empty() || files == ["-"] {
        if std::io::stdin().is_terminal() {
            return run_repl(&mut ev);
        }
        // piped input: read it all, run it
        let mut source = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut source) {
            eprintln!("error: FileError: stdin: {e}");
            return ExitCode::FAILURE;
        }
        return match run_input(&mut ev, &source, "stdin") {
            Outcome::Ok => ExitCode::SUCCESS,
            Outcome::Failed => ExitCode::FAILURE,
            Outcome::Quit(code) => exit_with(code),
        };
    }

    let mut failed = false;
    for path in files {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("error: FileError: {path}: {e}");
                failed = true;
                continue;
            }
        };
        match run_input(&mut ev, &source, path) {
            Outcome::Ok => {}
            Outcome::Failed => failed = true,
            Outcome::Quit(code) => return exit_with(code),
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
