/// m8rscript CLI.
/// Compiles and runs a script, or just checks it for syntax errors.

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use m8rscript::Runtime;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(
    name = "m8rscript",
    version = "0.1.0",
    about = "The m8rscript runtime",
    long_about = "m8rscript — compile and run m8rscript (.m8r) scripts on the embedded VM."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a script
    Run { path: PathBuf },
    /// Parse only; report syntax errors without executing
    Chk { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { path } => {
            let source = std::fs::read_to_string(&path).into_diagnostic()?;
            let mut runtime = Runtime::new();
            match runtime.compile(&source) {
                Ok(program) => {
                    runtime.spawn(program, None, None);
                    runtime.run_until_idle();
                }
                Err(errors) => {
                    report_errors(&path, &errors);
                    std::process::exit(1);
                }
            }
        }
        Commands::Chk { path } => {
            let source = std::fs::read_to_string(&path).into_diagnostic()?;
            let mut runtime = Runtime::new();
            match runtime.compile(&source) {
                Ok(_) => println!("{} {}", "ok:".green().bold(), path.display()),
                Err(errors) => {
                    report_errors(&path, &errors);
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}

fn report_errors(path: &PathBuf, errors: &m8rscript::ParseErrorList) {
    eprintln!(
        "{} {} ({} error{})",
        "failed:".red().bold(),
        path.display(),
        errors.len(),
        if errors.len() == 1 { "" } else { "s" }
    );
    for error in errors {
        eprintln!("  {}", error);
    }
}
