//! darch command-line interface.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use darch::driver::{self, ApplyOptions, GcOptions};
use darch::error::{exit_code_for, Error};
use darch::qemu::{self, TestOptions};

#[derive(Parser)]
#[command(name = "darch")]
#[command(author, version, about = "Declarative Arch Linux image builder")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a configuration (fresh or incremental, auto-detected)
    Apply {
        /// Path to the disk image (created if missing)
        #[arg(long)]
        image: PathBuf,

        /// Path to the Lua configuration file
        #[arg(long, default_value = "./config.lua")]
        config: PathBuf,

        /// Size for a newly created image
        #[arg(long, default_value = "10G")]
        size: String,

        /// Force a fresh build even if complete generations exist
        #[arg(long)]
        rebuild: bool,

        /// Also run a full package upgrade
        #[arg(long)]
        upgrade: bool,
    },

    /// List complete generations
    List {
        #[arg(long)]
        image: PathBuf,
    },

    /// Make the previous generation the boot default
    Rollback {
        #[arg(long)]
        image: PathBuf,
    },

    /// Delete incomplete and expired generations
    Gc {
        #[arg(long)]
        image: PathBuf,

        /// Override the maximum number of generations to keep
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Boot an image in QEMU
    Test {
        image: PathBuf,

        /// VM memory
        #[arg(long, default_value = "4G")]
        memory: String,

        /// Number of CPUs
        #[arg(long, default_value_t = 2)]
        cpus: u32,

        /// Graphical display instead of serial console
        #[arg(long)]
        graphics: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(exit_code_for(&err).clamp(0, 255) as u8)
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Apply {
            image,
            config,
            size,
            rebuild,
            upgrade,
        } => {
            require_root()?;
            driver::apply(&ApplyOptions {
                image,
                config,
                size,
                rebuild,
                upgrade,
            })
        }
        Commands::List { image } => {
            require_root()?;
            driver::list(&image)
        }
        Commands::Rollback { image } => {
            require_root()?;
            driver::rollback(&image)
        }
        Commands::Gc { image, keep } => {
            require_root()?;
            driver::run_gc(&GcOptions { image, keep })
        }
        Commands::Test {
            image,
            memory,
            cpus,
            graphics,
        } => qemu::run_test(&TestOptions {
            image,
            memory,
            cpus,
            graphics,
        }),
    }
}

fn require_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    let who = std::env::var("SUDO_USER")
        .map(|u| format!(" (try: sudo, you are '{u}')"))
        .unwrap_or_else(|_| " (try: sudo)".to_string());
    anyhow::bail!("this command must be run as root{who}")
}

/// Framed failure report: the failed command with exit code and stderr for
/// external-tool failures, the plain chain otherwise.
fn report(err: &anyhow::Error) {
    eprintln!();
    eprintln!("{}", style("error:").red().bold());
    for (i, cause) in err.chain().enumerate() {
        let indent = if i == 0 { "  " } else { "  caused by: " };
        for (j, line) in cause.to_string().lines().enumerate() {
            if j == 0 {
                eprintln!("{indent}{line}");
            } else {
                eprintln!("    {line}");
            }
        }
    }

    if let Some(Error::CommandFailed { .. }) = err.downcast_ref::<Error>() {
        eprintln!();
        eprintln!(
            "  {}",
            style("the interrupted generation is incomplete and will be reaped on the next run")
                .dim()
        );
    }
}
