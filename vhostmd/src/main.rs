//! `vhostmd` — the host metrics gathering daemon.
//!
//! Parses CLI flags, optionally daemonizes and drops privileges, wires up
//! the domain source and transports from the configuration file, and runs
//! the publication loop until a shutdown signal arrives.

mod daemon;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use vhostmd_metrics::config;
use vhostmd_metrics::domain::DomainSource;
use vhostmd_metrics::publish::Publisher;
use vhostmd_metrics::virtio::{VirtioConfig, VirtioServer};

#[cfg(feature = "libvirt")]
use vhostmd_metrics::domain::LibvirtDomainSource;
use vhostmd_metrics::domain::NullDomainSource;

const DEFAULT_CONFIG: &str = "/etc/vhostmd/vhostmd.conf";
const DEFAULT_PID_FILE: &str = "/var/run/vhostmd.pid";
const DEFAULT_KV_ROOT: &str = "/var/lib/vhostmd/kv";

/// vhostmd — host metrics gathering daemon.
#[derive(Parser, Debug)]
#[command(name = "vhostmd", version, about, disable_help_flag = true)]
struct Cli {
    /// Configuration file.
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// PID file.
    #[arg(short = 'p', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Drop root privs and run as <user>.
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Set the libvirt URI.
    #[arg(short = 'c', long = "connect")]
    connect: Option<String>,

    /// Process will not daemonize - useful for debugging.
    #[arg(short = 'd', long = "no-daemonize")]
    no_daemonize: bool,

    /// Verbose messages.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Print help.
    #[arg(short = '?', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupError::Usage(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(2)
        }
        Err(StartupError::Fatal(msg)) => {
            error!("{msg}");
            ExitCode::FAILURE
        }
    }
}

enum StartupError {
    Usage(String),
    Fatal(String),
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();
}

fn run(cli: Cli) -> Result<(), StartupError> {
    if cli.no_daemonize {
        info!("running in foreground (--no-daemonize)");
    } else {
        daemon::daemonize().map_err(|e| StartupError::Fatal(format!("failed to fork as daemon: {e}")))?;
    }

    let pid_file = cli.pid_file.or_else(|| {
        (running_as_root() && !DEFAULT_PID_FILE.is_empty()).then(|| PathBuf::from(DEFAULT_PID_FILE))
    });
    if let Some(path) = &pid_file {
        daemon::write_pid_file(path).map_err(|e| StartupError::Fatal(format!("pid file {}: {e}", path.display())))?;
    }

    let shutdown = daemon::install_signal_handlers()
        .map_err(|e| StartupError::Fatal(format!("failed to install signal handlers: {e}")))?;

    let config = config::load(&cli.config)
        .map_err(|e| StartupError::Fatal(format!("configuration file {}: {e}", cli.config.display())))?;

    let virtio = if config.globals.transports.contains(&vhostmd_metrics::config::Transport::Virtio) {
        match VirtioServer::start(VirtioConfig::default()) {
            Ok(server) => Some(server),
            Err(e) => {
                error!("failed to start virtio transport: {e}");
                None
            }
        }
    } else {
        None
    };

    let domain_source: Box<dyn DomainSource> = make_domain_source();

    let mut publisher = Publisher::new(config, cli.connect.clone(), domain_source, virtio)
        .map_err(|e| StartupError::Fatal(format!("failed to initialize publisher: {e}")))?;

    // Dropping privileges happens after every privileged resource (the
    // metrics disk, the virtio channel directory, the hypervisor
    // connection) has been opened, matching `vhostmd.c`'s ordering.
    if let Some(user) = &cli.user {
        daemon::drop_privileges(user).map_err(|e| StartupError::Fatal(format!("dropping privileges to {user}: {e}")))?;
        info!(user, "dropped root privileges");
    }

    let result = publisher.run(&shutdown);

    if let Some(path) = &pid_file {
        daemon::remove_pid_file(path);
    }

    result.map_err(|e| StartupError::Fatal(format!("publication loop failed: {e}")))
}

#[cfg(feature = "libvirt")]
fn make_domain_source() -> Box<dyn DomainSource> {
    Box::new(LibvirtDomainSource::new(PathBuf::from(DEFAULT_KV_ROOT)))
}

#[cfg(not(feature = "libvirt"))]
fn make_domain_source() -> Box<dyn DomainSource> {
    Box::new(NullDomainSource)
}

fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}
