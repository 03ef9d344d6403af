//! Command line driver for cscript.
//!
//! `run` compiles a C file, links it against the host C runtime and calls
//! an entry point; `compile` writes an ELF relocatable object; `check` only
//! reports diagnostics.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use cscript::core::object::SectionKind;
use cscript::host::register_c_runtime;
use cscript::x64::disassemble;
use cscript::{CompileOptions, Diagnostic, Error, OutputKind, Registry, Session, Value};

#[derive(Parser, Debug)]
#[command(name = "cscript", version, about = "Compile and run C in memory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile, link and execute a C file.
    Run {
        file: PathBuf,
        /// Function to call.
        #[arg(long, default_value = "main")]
        entry: String,
        /// Argument passed to the entry function (integer or floating point).
        #[arg(long = "arg", value_name = "VALUE", allow_hyphen_values = true)]
        args: Vec<String>,
        /// Define a macro, as NAME or NAME=VALUE.
        #[arg(short = 'D', value_name = "NAME[=VALUE]")]
        defines: Vec<String>,
        /// Print the disassembly of the loaded code.
        #[arg(long)]
        disasm: bool,
    },
    /// Write an ELF relocatable object.
    Compile {
        file: PathBuf,
        #[arg(short = 'o', value_name = "OUT")]
        output: PathBuf,
        #[arg(short = 'D', value_name = "NAME[=VALUE]")]
        defines: Vec<String>,
    },
    /// Report diagnostics without linking.
    Check {
        file: PathBuf,
        #[arg(short = 'D', value_name = "NAME[=VALUE]")]
        defines: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("cannot write {path}: {source}")]
    Write { path: String, source: std::io::Error },

    #[error("invalid argument '{0}': expected an integer or a floating point number")]
    Argument(String),

    #[error(transparent)]
    Engine(#[from] Error),
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cscript: {err}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Run {
            file,
            entry,
            args,
            defines,
            disasm,
        } => run(&file, &entry, &args, &defines, disasm),
        Command::Compile {
            file,
            output,
            defines,
        } => compile(&file, &output, &defines),
        Command::Check { file, defines } => check(&file, &defines),
    }
}

fn read_source(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn options_with_defines(defines: &[String]) -> CompileOptions {
    defines.iter().fold(CompileOptions::default(), |options, define| {
        match define.split_once('=') {
            Some((name, value)) => options.define(name, value),
            None => options.define(define.as_str(), "1"),
        }
    })
}

fn parse_argument(text: &str) -> Result<Value, CliError> {
    if let Ok(value) = text.parse::<i64>() {
        return Ok(Value::Int(value));
    }
    if let Some(hex) = text.strip_prefix("0x") {
        if let Ok(value) = i64::from_str_radix(hex, 16) {
            return Ok(Value::Int(value));
        }
    }
    text.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| CliError::Argument(text.to_string()))
}

fn print_diagnostics(file: &Path, diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        eprintln!("{}:{}", file.display(), diagnostic);
    }
}

// Diagnostics go to stderr before the error summary.
fn compile_in(session: &mut Session<'_>, file: &Path, options: &CompileOptions) -> Result<(), CliError> {
    let source = read_source(file)?;
    let result = session.compile(&source, options);
    print_diagnostics(file, session.diagnostics());
    result.map_err(|err| CliError::Engine(err.into()))
}

fn run(file: &Path, entry: &str, args: &[String], defines: &[String], disasm: bool) -> Result<(), CliError> {
    let values = args
        .iter()
        .map(|arg| parse_argument(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let registry = Registry::new(false);
    register_c_runtime(&registry).map_err(Error::from)?;

    let mut session = Session::new(&registry);
    compile_in(&mut session, file, &options_with_defines(defines))?;
    session.link_and_load().map_err(Error::from)?;

    if disasm {
        for region in session.regions() {
            if region.kind() == SectionKind::Text {
                for line in disassemble(region.bytes(), region.base() as u64) {
                    println!("{line}");
                }
            }
        }
    }

    let result = session.execute(entry, &values).map_err(Error::from)?;
    log::info!("{} returned {}", entry, result);
    if !result.is_void() {
        println!("{result}");
    }
    session.unload().map_err(Error::from)?;
    Ok(())
}

fn compile(file: &Path, output: &Path, defines: &[String]) -> Result<(), CliError> {
    let registry = Registry::new(false);
    let mut session = Session::new(&registry);
    let options = options_with_defines(defines).with_output_kind(OutputKind::Object);
    compile_in(&mut session, file, &options)?;

    let bytes = session.emit_object().map_err(Error::from)?;
    fs::write(output, &bytes).map_err(|source| CliError::Write {
        path: output.display().to_string(),
        source,
    })?;
    log::info!("wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

fn check(file: &Path, defines: &[String]) -> Result<(), CliError> {
    let registry = Registry::new(false);
    let mut session = Session::new(&registry);
    compile_in(&mut session, file, &options_with_defines(defines))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "cscript", "run", "fib.c", "--entry", "fib", "--arg", "10", "--arg", "-2.5", "-D", "N=3", "--disasm",
        ]);
        match cli.command {
            Command::Run {
                entry,
                args,
                defines,
                disasm,
                ..
            } => {
                assert_eq!(entry, "fib");
                assert_eq!(args, ["10", "-2.5"]);
                assert_eq!(defines, ["N=3"]);
                assert!(disasm);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_argument() {
        assert_eq!(parse_argument("42").unwrap(), Value::Int(42));
        assert_eq!(parse_argument("-7").unwrap(), Value::Int(-7));
        assert_eq!(parse_argument("0x10").unwrap(), Value::Int(16));
        assert_eq!(parse_argument("1.5").unwrap(), Value::Float(1.5));
        assert!(parse_argument("abc").is_err());
    }

    #[test]
    fn test_defines_without_value_default_to_one() {
        let options = options_with_defines(&["A".to_string(), "B=x".to_string()]);
        assert_eq!(
            options.defines,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "x".to_string())]
        );
    }
}
