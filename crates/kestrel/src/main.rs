mod commands;
mod nic;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kestrel_tftp::LogFormat;

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Network boot file transfer client (TFTP/MTFTP over raw frames)", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kestrel/config.toml")]
    config: PathBuf,

    /// Generate a default configuration file and exit
    #[arg(long)]
    init_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file from the boot server
    Get {
        /// Remote file name
        file: String,

        /// Local path to write (defaults to the remote file name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Receive over the configured multicast group
        #[arg(long)]
        multicast: bool,
    },

    /// Upload a file to the boot server
    Put {
        /// Local file to send
        file: PathBuf,

        /// Name to store the file under (defaults to the local name)
        #[arg(long)]
        remote_name: Option<String>,
    },

    /// Query the size of a remote file without downloading it
    Size {
        /// Remote file name
        file: String,
    },

    /// Fetch a directory listing from the server
    Dir {
        /// Directory path on the server
        #[arg(default_value = "/")]
        path: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.init_config {
        return commands::transfer::init_config(&cli.config);
    }
    let Some(command) = cli.command else {
        anyhow::bail!("no command given (try --help)");
    };

    let config = kestrel_tftp::load_config(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    kestrel_tftp::validate_config(&config)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("kestrel={}", config.logging.level).into());
    match config.logging.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    match command {
        Commands::Get {
            file,
            output,
            multicast,
        } => commands::transfer::get(&config, &file, output, multicast)?,
        Commands::Put { file, remote_name } => {
            commands::transfer::put(&config, &file, remote_name)?
        }
        Commands::Size { file } => commands::transfer::size(&config, &file)?,
        Commands::Dir { path } => commands::transfer::dir(&config, &path)?,
    }

    Ok(())
}
