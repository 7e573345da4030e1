use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};

mod completion;
mod config;
mod dispatch;
mod render;

use completion::CliCompletionShell;
use dispatch::run_cli;

#[derive(Parser, Debug)]
#[command(name = "hoist")]
#[command(version, about = "Global package installer with in-place self-replacement", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// Global prefix holding the bin directory and module root.
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,
    /// Registry URL, or a directory registry path.
    #[arg(long, global = true)]
    registry: Option<String>,
    /// User config file.
    #[arg(long, global = true)]
    userconfig: Option<PathBuf>,
    /// Tarball cache directory.
    #[arg(long, global = true)]
    cache: Option<PathBuf>,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a package tarball or registry package into the global namespace.
    Install {
        source: String,
        #[arg(short = 'g', long)]
        global: bool,
    },
    /// Write a package tarball for a directory.
    Pack {
        dir: Option<PathBuf>,
        #[arg(long)]
        pack_destination: Option<PathBuf>,
    },
    /// Publish a package directory to the registry.
    Publish {
        dir: Option<PathBuf>,
        #[arg(long, default_value = "latest")]
        tag: String,
    },
    /// Print the file a command resolves to.
    Which { command: String },
    /// List globally installed packages.
    Ls {
        #[arg(short = 'g', long)]
        global: bool,
    },
    /// Check the global namespace for inconsistencies.
    Doctor {
        #[arg(long)]
        fix: bool,
    },
    /// Print the effective global prefix.
    Prefix,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn init_tracing(verbosity: u8) {
    let filter = if verbosity > 0 {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env("HOIST_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests;
