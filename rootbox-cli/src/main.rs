//! rootbox command-line interface.
//!
//! Thin wrapper over the `rootbox` library: loads a JSON configuration
//! file, sets up the tracing subscriber, and drives the requested
//! lifecycle phase.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rootbox::{Buildroot, BuildrootConfig};

#[derive(Parser, Debug)]
#[command(
    name = "rootbox",
    about = "Rebuild source packages inside an isolated chroot buildroot",
    version
)]
struct Cli {
    /// Path to the buildroot configuration file (JSON)
    #[arg(short, long, env = "ROOTBOX_CONFIG", value_name = "FILE")]
    config: PathBuf,

    /// Wipe the buildroot before doing anything else
    #[arg(long, global = true)]
    clean_first: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remove the buildroot entirely
    Clean,

    /// Construct the chroot and install the bootstrap package set
    Init,

    /// Rebuild a source package into binary packages
    Rebuild {
        /// Source package to rebuild
        #[arg(value_name = "SRPM")]
        srpm: PathBuf,

        /// Per-invocation build timeout in seconds (0 = unlimited)
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Skip clean+init and assume the buildroot is ready
        #[arg(long)]
        no_prep: bool,
    },

    /// Run a command inside the chroot
    Shell {
        /// Command and arguments
        #[arg(
            value_name = "ARGV",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        argv: Vec<String>,
    },
}

fn load_config(path: &PathBuf) -> anyhow::Result<BuildrootConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: BuildrootConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let mut root = Buildroot::new(config).context("constructing buildroot controller")?;

    if cli.clean_first {
        root.clean().context("cleaning buildroot")?;
    }

    match cli.command {
        Command::Clean => {
            if !cli.clean_first {
                root.clean().context("cleaning buildroot")?;
            }
            tracing::info!(basedir = %root.basedir().display(), "buildroot removed");
        }
        Command::Init => {
            root.init().context("initializing buildroot")?;
            tracing::info!(rootdir = %root.rootdir().display(), "buildroot ready");
        }
        Command::Rebuild {
            srpm,
            timeout,
            no_prep,
        } => {
            if !no_prep {
                if !cli.clean_first {
                    root.clean().context("cleaning buildroot")?;
                }
                root.init().context("initializing buildroot")?;
            }
            let timeout = (timeout > 0).then(|| Duration::from_secs(timeout));
            root.build(&srpm, timeout)
                .with_context(|| format!("building {}", srpm.display()))?;
            tracing::info!(resultdir = %root.resultdir().display(), "build finished");
        }
        Command::Shell { argv } => {
            let output = root.chroot_exec(&argv).context("running command in chroot")?;
            print!("{}", output.output);
            if !output.success {
                std::process::exit(output.code.unwrap_or(1));
            }
        }
    }
    Ok(())
}
