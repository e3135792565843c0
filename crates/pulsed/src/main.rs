//! pulsed — the PulseGrid controller daemon.
//!
//! Single binary that assembles the controller subsystems:
//! - FSA event loop (inputs, actions, routed messages)
//! - Scheduler invocation subsystem
//! - Cluster information base service
//! - Cluster view (quorum, membership, watchdog)
//!
//! # Usage
//!
//! ```text
//! pulsed standalone --node-id grid-a --data-dir /var/lib/pulsegrid
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod standalone;

#[derive(Parser)]
#[command(name = "pulsed", about = "PulseGrid controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single node, coordinator role assumed, CIB
    /// service and policy engine run in-process).
    Standalone {
        /// Name this node appears under in the cluster state.
        #[arg(long, default_value = "grid-a")]
        node_id: String,

        /// Data directory for crash snapshots.
        #[arg(long, default_value = "/var/lib/pulsegrid")]
        data_dir: PathBuf,

        /// Seconds between placement recomputations.
        #[arg(long, default_value = "30")]
        invoke_interval: u64,

        /// Report a hardware watchdog as present on this node.
        #[arg(long)]
        watchdog: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pulsed=debug,pulsegrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            node_id,
            data_dir,
            invoke_interval,
            watchdog,
        } => standalone::run(node_id, data_dir, invoke_interval, watchdog).await,
    }
}
