mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kiln_lib::verify::HashAlgorithm;
use tracing_subscriber::EnvFilter;

use crate::cmd::RunArgs;
use crate::output::OutputFormat;

/// kiln - Fetch, verify, build, install and smoke-test packages from recipes
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a recipe through fetch, verify, build, install and self-test
  Run(RunArgs),

  /// Validate a recipe without running it
  Check {
    /// Path to the recipe (.toml or .json)
    recipe: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Print the digest of a file, in the form a recipe expects
  Digest {
    /// File to hash
    file: PathBuf,

    /// Hash algorithm (sha256 or sha512)
    #[arg(short, long, default_value = "sha256")]
    algorithm: HashAlgorithm,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Run(args) => cmd::cmd_run(args, cli.verbose),
    Commands::Check { recipe, output } => cmd::cmd_check(&recipe, output),
    Commands::Digest { file, algorithm } => cmd::cmd_digest(&file, algorithm),
  }
}
