//! `vm-dump-metrics` — the guest-side CLI that retrieves the `<metrics>`
//! document published by the host daemon.
//!
//! Mirrors `vm-dump-metrics/main.c`: without an explicit source flag it
//! tries the metrics disk, then the virtio channel, then the key/value
//! store, in that order, writing whichever one succeeds first to `--dest`
//! or standard output.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, warn};

use vhostmd_metrics::guest;

/// The guest-side key/value mount point this CLI reads from when no disk
/// or virtio source is available. The KV client itself is an external
/// collaborator (spec §1); this is the conventional path it's expected to
/// expose the current domain's metrics key under.
const DEFAULT_KV_PATH: &str = "/var/lib/vhostmd/kv/self";

/// vm-dump-metrics — guest-side vhostmd metrics reader.
#[derive(Parser, Debug)]
#[command(name = "vm-dump-metrics", version, about, disable_help_flag = true)]
struct Cli {
    /// Metrics destination file.
    #[arg(short = 'd', long = "dest")]
    dest: Option<PathBuf>,

    /// Get metrics from the raw metrics block device.
    #[arg(short = 'b', long = "vbd")]
    vbd: bool,

    /// Get metrics from the virtio channel.
    #[arg(short = 'i', long = "virtio")]
    virtio: bool,

    /// Get metrics from xenstore (accepted, not implemented).
    #[arg(short = 'x', long = "xenstore")]
    xenstore: bool,

    /// Verbose messages.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Print help.
    #[arg(short = '?', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}

fn run(cli: &Cli) -> Result<(), ()> {
    if cli.xenstore {
        warn!("--xenstore is accepted but not implemented; no xen control-plane backend is available");
    }

    if cli.vbd {
        return dump_and_write(guest::dump_disk(), cli.dest.as_deref());
    }
    if cli.virtio {
        return dump_and_write(guest::dump_virtio(None), cli.dest.as_deref());
    }

    // No explicit source: disk, then virtio, then kv.
    match guest::dump_disk() {
        Ok(payload) => return write(&payload, cli.dest.as_deref()),
        Err(e) => warn!(error = %e, "disk source unavailable, trying virtio"),
    }
    match guest::dump_virtio(None) {
        Ok(payload) => return write(&payload, cli.dest.as_deref()),
        Err(e) => warn!(error = %e, "virtio source unavailable, trying kv"),
    }
    match guest::dump_kv(std::path::Path::new(DEFAULT_KV_PATH)) {
        Ok(payload) => write(&payload, cli.dest.as_deref()),
        Err(e) => {
            error!(error = %e, "no metrics source available (tried disk, virtio, kv)");
            Err(())
        }
    }
}

fn dump_and_write<E: std::fmt::Display>(result: Result<Vec<u8>, E>, dest: Option<&std::path::Path>) -> Result<(), ()> {
    match result {
        Ok(payload) => write(&payload, dest),
        Err(e) => {
            error!(error = %e, "failed to retrieve metrics");
            Err(())
        }
    }
}

fn write(payload: &[u8], dest: Option<&std::path::Path>) -> Result<(), ()> {
    guest::write_payload(payload, dest).map_err(|e| {
        error!(error = %e, "failed to write metrics output");
    })
}
