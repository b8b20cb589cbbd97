use std::fs;
use std::process::ExitCode;

use cellsh::interpreter::status_of;
use cellsh::{Cell, Config, Interpreter};
use clap::{Arg, ArgAction, Command};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("cellsh")
        .about("A Lisp-derived shell")
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Reject unresolved names instead of treating them as symbols"),
        )
        .arg(
            Arg::new("command")
                .short('c')
                .value_name("COMMAND")
                .help("Run COMMAND and exit"),
        )
        .arg(Arg::new("script").value_name("SCRIPT").help("Script file to run"))
        .arg(
            Arg::new("args")
                .value_name("ARGS")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true),
        )
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CELLSH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let strict = matches.get_flag("strict");
    let args: Vec<String> = matches
        .get_many::<String>("args")
        .map(|args| args.cloned().collect())
        .unwrap_or_default();

    if let Some(command) = matches.get_one::<String>("command") {
        let mut interpreter = Interpreter::with_config(Config {
            strict,
            script_name: "-c".to_string(),
            args,
            ..Config::default()
        });
        return ExitCode::from(interpreter.run_source("-c", command));
    }

    if let Some(script) = matches.get_one::<String>("script") {
        let text = match fs::read_to_string(script) {
            Ok(text) => text,
            Err(error) => {
                eprintln!("cellsh: {script}: {error}");
                return ExitCode::from(127);
            }
        };
        let mut interpreter = Interpreter::with_config(Config {
            strict,
            script_name: script.clone(),
            args,
            ..Config::default()
        });
        return ExitCode::from(interpreter.run_source(script, &text));
    }

    cellsh::process::ignore_terminal_signals();
    let interpreter = Interpreter::with_config(Config {
        strict,
        args,
        interactive: true,
        ..Config::default()
    });
    ExitCode::from(run_repl(interpreter))
}

fn run_repl(mut interpreter: Interpreter) -> u8 {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(error) => {
            eprintln!("cellsh: can't start line editor: {error}");
            return 1;
        }
    };
    let mut status = 0;

    loop {
        match rl.readline("cellsh> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match line {
                    ":help" => {
                        print_help();
                        continue;
                    }
                    ":env" => {
                        print_environment(&interpreter);
                        continue;
                    }
                    ":quit" | ":exit" => break,
                    _ => {}
                }

                match interpreter.eval_str(line) {
                    Ok(value) => {
                        status = status_of(&value);
                        if !matches!(value, Cell::Status(_)) && !value.is_null() {
                            println!("{value}");
                        }
                    }
                    Err(cellsh::Error::Exit(code)) => return code,
                    Err(error) => {
                        status = error.status();
                        eprintln!("{error}");
                        if !error.is_catchable() {
                            return status;
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("cellsh: {error}");
                return 1;
            }
        }
    }
    status
}

fn print_help() {
    println!("cellsh interactive commands:");
    println!("  :help   - Show this help message");
    println!("  :env    - Show top-level definitions");
    println!("  :quit   - Exit (also :exit or Ctrl+D)");
    println!();
    println!("Examples:");
    println!("  (define greet as (who) (echo hello who))");
    println!("  (greet world)");
    println!("  (if (lt 1 2) yes else no)");
    println!("  (ls -l ~)");
}

fn print_environment(interpreter: &Interpreter) {
    let bindings = interpreter.root().bindings();
    if bindings.is_empty() {
        println!("No top-level definitions.");
        return;
    }
    println!("Top-level definitions ({} total):", bindings.len());
    for (name, value) in bindings {
        println!("  {name} = {value}");
    }
}
