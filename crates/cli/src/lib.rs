use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use texmem::TexMemConfig;

pub mod trace;

use trace::Trace;

#[derive(Debug, Parser)]
#[command(name = "texmem-cli")]
#[command(about = "Texture-memory residency simulator")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a JSON residency trace and print a JSON report.
    Simulate {
        #[arg(value_name = "TRACE")]
        trace: PathBuf,
        /// TOML configuration overriding the trace's own settings.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Exit with an error if any operation failed.
        #[arg(long)]
        strict: bool,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Simulate {
            trace,
            config,
            strict,
        } => run_simulate(&trace, config.as_deref(), strict),
        Commands::Config { file } => run_config(file.as_deref()),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_simulate(path: &Path, config_file: Option<&Path>, strict: bool) -> Result<()> {
    ensure_file_exists(path)?;

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut trace: Trace = serde_json::from_str(&contents).context("failed to parse trace")?;

    let config = match (config_file, trace.config.take()) {
        (Some(file), _) => load_config(file)?,
        (None, Some(config)) => config,
        (None, None) => TexMemConfig::load().context("failed to load configuration")?,
    };

    let report = trace::replay(trace, config)?;
    let json = serde_json::to_string_pretty(&report)?;
    println!("{json}");

    let failed = report.failed_ops();
    if strict && failed > 0 {
        anyhow::bail!("{failed} operation(s) failed");
    }

    Ok(())
}

fn run_config(file: Option<&Path>) -> Result<()> {
    let config = match file {
        Some(file) => load_config(file)?,
        None => TexMemConfig::load().context("failed to load configuration")?,
    };
    print!("{}", config.to_toml()?);
    Ok(())
}

fn load_config(file: &Path) -> Result<TexMemConfig> {
    ensure_file_exists(file)?;
    TexMemConfig::from_file(file)
        .with_context(|| format!("invalid configuration in {}", file.display()))
}

fn ensure_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}
