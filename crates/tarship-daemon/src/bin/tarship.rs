//! Tarship CLI - pack, ship and unpack directory trees
//!
//! Usage:
//!   tarship pack <src> <archive>              Pack a directory into a tar archive
//!   tarship ship <archive> <remote>           Upload an archive
//!   tarship unpack <remote-archive> <dir>     Extract an archive on the host
//!   tarship send <src> <remote-dir>           Pack, ship and unpack in one go
//!   tarship serve [--root <dir>]              Serve a directory to clients
//!   tarship digest --user <name>              Print a credential digest for [host.users]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tarship_core::crypto::credential_digest;
use tarship_core::progress::format_bytes;
use tarship_core::{
    list, pack, Config, LogProgress, NullProgress, ProgressMode, ProgressSink, ShipOptions,
    TerminalProgress, TransferConfig, TransferTask,
};
use tarship_daemon::{HostConfig, QuicConnector, TarshipHost};

#[derive(Parser)]
#[command(name = "tarship")]
#[command(about = "Ship directory trees to a remote host as a streamed tar archive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a local directory into a tar archive
    Pack {
        source: PathBuf,
        archive: PathBuf,
    },

    /// Upload a local archive to the host
    Ship {
        archive: PathBuf,
        /// Remote path of the uploaded archive
        remote: String,

        #[command(flatten)]
        remote_args: RemoteArgs,
    },

    /// Extract an archive that is already on the host
    Unpack {
        remote_archive: String,
        /// Remote directory to extract into
        destination: String,

        #[command(flatten)]
        remote_args: RemoteArgs,
    },

    /// Pack, ship and unpack a directory
    Send {
        source: PathBuf,
        /// Remote directory to extract into
        destination: String,

        /// Where to stage the archive locally
        #[arg(long)]
        staging: Option<PathBuf>,

        #[command(flatten)]
        remote_args: RemoteArgs,
    },

    /// Serve a directory to tarship clients
    Serve {
        /// Directory to serve (default: [host] root, then the current directory)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the credential digest to put under [host.users]
    Digest {
        #[arg(short, long)]
        user: String,

        #[arg(long, env = "TARSHIP_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Show the active configuration
    Config {
        /// Print a sample configuration instead
        #[arg(long)]
        sample: bool,
    },
}

#[derive(Args)]
struct RemoteArgs {
    /// Host to connect to (default: [remote] host)
    #[arg(long)]
    host: Option<String>,

    /// Port to connect to (default: [remote] port)
    #[arg(long)]
    port: Option<u16>,

    /// User to authenticate as (default: [remote] user)
    #[arg(short, long)]
    user: Option<String>,

    #[arg(long, env = "TARSHIP_PASSWORD", hide_env_values = true)]
    password: String,

    /// Expected host certificate fingerprint (hex)
    #[arg(long)]
    fingerprint: Option<String>,
}

impl RemoteArgs {
    fn task(
        &self,
        config: &Config,
        source: impl Into<PathBuf>,
        destination: impl Into<String>,
    ) -> Result<TransferTask, Box<dyn std::error::Error>> {
        let mut remote = config.remote.clone();
        if let Some(port) = self.port {
            remote.port = port;
        }
        if let Some(fingerprint) = &self.fingerprint {
            remote.fingerprint = Some(fingerprint.clone());
        }

        let target = remote.target(self.host.as_deref(), self.user.as_deref(), &self.password)?;
        Ok(TransferTask::new(source, destination).with_target(target))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let sink = progress_sink(&config.transfer);
    let options = ShipOptions::from(&config.transfer);

    match cli.command {
        Commands::Pack { source, archive } => {
            let archive = pack(&source, &archive, sink.as_ref())?;
            let size = std::fs::metadata(&archive)?.len();
            info!("Packed {:?} into {:?} ({})", source, archive, format_bytes(size));
            if cli.verbose {
                for entry in list(&archive)? {
                    println!("{:?} {:>10} {}", entry.kind, entry.size, entry.path);
                }
            }
        }
        Commands::Ship {
            archive,
            remote,
            remote_args,
        } => {
            let task = remote_args.task(&config, archive, remote)?;
            let connector = QuicConnector::new()?;
            let remote = task.ship(&connector, &options, sink.as_ref())?;
            println!("{}", remote);
        }
        Commands::Unpack {
            remote_archive,
            destination,
            remote_args,
        } => {
            let task = remote_args.task(&config, remote_archive, destination)?;
            let connector = QuicConnector::new()?;
            let destination = task.unpack(&connector, sink.as_ref())?;
            println!("{}", destination);
        }
        Commands::Send {
            source,
            destination,
            staging,
            remote_args,
        } => {
            let staging = staging.unwrap_or_else(|| {
                std::env::temp_dir().join(format!("tarship-{}.tar", std::process::id()))
            });
            let task = remote_args.task(&config, source, destination)?;
            let connector = QuicConnector::new()?;
            let destination = task.send(&connector, &staging, &options, sink.as_ref())?;
            println!("{}", destination);
        }
        Commands::Serve { root, bind, port } => {
            let mut host = HostConfig::from_config(&config.host)?;
            if let Some(root) = root {
                host.root = root;
            }
            if bind.is_some() || port.is_some() {
                host.bind_addr = SocketAddr::new(
                    bind.unwrap_or(host.bind_addr.ip()),
                    port.unwrap_or(host.bind_addr.port()),
                );
            }
            tokio::runtime::Runtime::new()?.block_on(run_serve(host))?;
        }
        Commands::Digest { user, password } => {
            let digest = credential_digest(&user, &password);
            println!("{} = \"{}\"", user, hex::encode(digest));
        }
        Commands::Config { sample } => {
            if sample {
                print!("{}", Config::sample());
            } else {
                match cli.config.clone().or_else(Config::default_path) {
                    Some(path) => info!("Config file: {:?}", path),
                    None => info!("No config directory on this platform"),
                }
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn progress_sink(config: &TransferConfig) -> Box<dyn ProgressSink> {
    match config.progress {
        ProgressMode::Terminal => Box::new(TerminalProgress::new(config.progress_interval())),
        ProgressMode::Log => Box::new(LogProgress::new(config.progress_interval())),
        ProgressMode::None => Box::new(NullProgress),
    }
}

async fn run_serve(config: HostConfig) -> Result<(), Box<dyn std::error::Error>> {
    let users = config.users.len();
    let host = TarshipHost::bind(config)?;

    info!("Starting tarship host...");
    info!("  Serving: {:?}", host.root());
    info!("  Listening on: {}", host.local_addr()?);
    info!("  Users: {}", users);
    info!("  Fingerprint: {}", hex::encode(host.fingerprint()));

    // Handle Ctrl+C
    tokio::select! {
        result = host.serve() => {
            if let Err(e) = result {
                error!("Host error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
            host.shutdown();
        }
    }

    Ok(())
}
