//! nslink
//!
//! Runs a network benchmark across two physical interfaces of the same
//! host by isolating each in its own network namespace, so traffic has to
//! cross the cable between them instead of the kernel's local route.
//!
//! - Refuses interfaces that are in use (up, addressed)
//! - Builds the namespace topology, runs iperf3 or a ping flood
//! - Reports interface counter deltas, CRC errors, jitter and loss
//! - Always restores the host, also after a crash (`--cleanup`)

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nslink_core::{CancelFlag, LinkError};
use tracing_subscriber::EnvFilter;

/// Isolated point-to-point link tester.
#[derive(Parser, Debug)]
#[command(
    name = "nslink",
    version,
    about = "Benchmark a cable between two local interfaces via network namespaces"
)]
pub struct Cli {
    /// Source interface (gets the iperf3 client / ping).
    #[arg(long, value_name = "IF")]
    pub src_if: Option<String>,

    /// Destination interface (gets the iperf3 server).
    #[arg(long, value_name = "IF")]
    pub dst_if: Option<String>,

    /// Address for the source interface.
    #[arg(long, value_name = "CIDR")]
    pub src_ip: Option<String>,

    /// Address for the destination interface.
    #[arg(long, value_name = "CIDR")]
    pub dst_ip: Option<String>,

    /// MTU applied to both interfaces.
    #[arg(long)]
    pub mtu: Option<u32>,

    /// Benchmark payload size in bytes.
    #[arg(long)]
    pub size: Option<u32>,

    /// Test duration in seconds.
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Rate-limited UDP test; needs --rate.
    #[arg(long, default_value_t = false, requires = "rate")]
    pub udp: bool,

    /// Target bit-rate for --udp (e.g. 100M, 1G).
    #[arg(long, value_name = "RATE")]
    pub rate: Option<String>,

    /// ICMP echo flood instead of iperf3.
    #[arg(long, default_value_t = false, conflicts_with_all = ["udp", "rate"])]
    pub flood: bool,

    /// Fixed responder port (default: random ephemeral port).
    #[arg(long)]
    pub port: Option<u16>,

    /// Pick two eligible interfaces (up, carrier, no address).
    #[arg(long, default_value_t = false, conflicts_with_all = ["src_if", "dst_if"])]
    pub auto: bool,

    /// Leave the topology in place on exit.
    #[arg(long, default_value_t = false)]
    pub keep: bool,

    /// Restore the host from persisted run records and exit.
    #[arg(long, default_value_t = false, conflicts_with = "detect")]
    pub cleanup: bool,

    /// Only clean up the run owned by this PID.
    #[arg(long, requires = "cleanup")]
    pub pid: Option<u32>,

    /// List candidate interfaces without building anything.
    #[arg(long, default_value_t = false)]
    pub detect: bool,

    /// With --detect, blink each candidate's LED for SECS seconds.
    #[arg(long, value_name = "SECS", requires = "detect")]
    pub blink: Option<u64>,

    /// TOML config file; flags override its values.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for run records.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Namespace name prefix.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Run against a simulated host (no root needed).
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Prefix every external command with sudo.
    #[arg(long, default_value_t = false)]
    pub sudo: bool,

    /// Fail unless both interfaces detect a link after bring-up.
    #[arg(long, default_value_t = false)]
    pub require_carrier: bool,

    /// Accept interfaces whose operational state is "unknown".
    #[arg(long, default_value_t = false)]
    pub accept_unknown: bool,

    /// Pause before the counter baseline, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub warmup: Option<u64>,

    /// Print the report as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Include the raw benchmark output.
    #[arg(long, default_value_t = false)]
    pub show_output: bool,

    /// Run iperf3 without -J.
    #[arg(long, default_value_t = false)]
    pub text_output: bool,

    /// Debug logging (overrides RUST_LOG).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, restoring host");
        handler_flag.cancel();
    }) {
        tracing::warn!(error = %e, "could not install signal handler");
    }

    match commands::dispatch(&cli, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<LinkError>() {
                Some(link) => {
                    if let Some(hint) = link.hint() {
                        eprintln!("hint: {hint}");
                    }
                    ExitCode::from(link.kind().exit_code())
                }
                None => ExitCode::FAILURE,
            }
        }
    }
}
