use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fanio_cli::{run_merge, run_tee, MergeSettings, Named, NamedInput, NamedOutput};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "fanio", version, about = "Merge or broadcast byte streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge inputs into stdout; `-` reads stdin
    Merge {
        #[arg(long = "chunk-size")]
        chunk_size: Option<usize>,
        #[arg(long = "uppercase")]
        uppercase: bool,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Copy stdin to every output and to stdout
    Tee {
        #[arg(long = "no-stdout")]
        no_stdout: bool,
        outputs: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Merge {
            chunk_size,
            uppercase,
            inputs,
        } => {
            let inputs = inputs
                .iter()
                .map(|path| open_input(path))
                .collect::<Result<Vec<_>>>()?;
            let settings = MergeSettings {
                chunk_size,
                uppercase,
            };
            let stdout = io::stdout();
            run_merge(inputs, &settings, &mut stdout.lock())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tee { no_stdout, outputs } => {
            let mut sinks = outputs
                .iter()
                .map(|path| create_output(path))
                .collect::<Result<Vec<_>>>()?;
            if !no_stdout {
                sinks.push(Named::new("stdout", Box::new(io::stdout()) as Box<dyn Write + Send>));
            }
            let report = run_tee(io::stdin().lock(), sinks)?;
            for failed in &report.failed {
                if let Some(error) = &failed.failure {
                    warn!(output = %failed.name, %error, "output did not receive everything");
                }
            }
            Ok(if report.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn open_input(path: &Path) -> Result<NamedInput> {
    if path.as_os_str() == "-" {
        return Ok(Named::new("stdin", Box::new(io::stdin()) as Box<dyn Read + Send>));
    }
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(Named::new(path.display().to_string(), Box::new(file) as Box<dyn Read + Send>))
}

fn create_output(path: &Path) -> Result<NamedOutput> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(Named::new(path.display().to_string(), Box::new(file) as Box<dyn Write + Send>))
}
