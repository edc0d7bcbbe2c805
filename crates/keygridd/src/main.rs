//! keygridd: the keygrid daemon.
//!
//! One binary for both sides of a deployment:
//! - operator side: resolve, render, apply, and keep reconciling
//! - node side: read the boot payload and discover the cluster
//!
//! # Usage
//!
//! ```text
//! keygridd plan   --manifest keygrid.toml
//! keygridd apply  --manifest keygrid.toml --state keygrid.redb --cloud-state cloud.json
//! keygridd run    --manifest keygrid.toml --state keygrid.redb --cloud-state cloud.json
//! keygridd render --manifest keygrid.toml --role vault
//! keygridd boot   --payload payload.json --instance-id i-00000001 --cloud-state cloud.json
//! ```

mod control_plane;
mod node_mode;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use keygrid_core::duration::parse_duration;

#[derive(Parser)]
#[command(name = "keygridd", about = "keygrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve images and render payloads without touching the cloud.
    Plan {
        #[arg(long, default_value = "keygrid.toml")]
        manifest: PathBuf,
    },

    /// Print one role's rendered boot payload.
    Render {
        #[arg(long, default_value = "keygrid.toml")]
        manifest: PathBuf,

        /// Role name as written in the manifest.
        #[arg(long)]
        role: String,

        /// Write the payload here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run the full deployment once.
    Apply {
        #[arg(long, default_value = "keygrid.toml")]
        manifest: PathBuf,

        /// Desired-state store.
        #[arg(long, default_value = "keygrid.redb")]
        state: PathBuf,

        /// Simulated cloud snapshot.
        #[arg(long, default_value = "keygrid-cloud.json")]
        cloud_state: PathBuf,
    },

    /// Apply, then keep both fleets and the front reconciled until Ctrl-C.
    Run {
        #[arg(long, default_value = "keygrid.toml")]
        manifest: PathBuf,

        #[arg(long, default_value = "keygrid.redb")]
        state: PathBuf,

        #[arg(long, default_value = "keygrid-cloud.json")]
        cloud_state: PathBuf,

        /// Interval between reconciliation passes.
        #[arg(long, default_value = "30s", value_parser = duration_arg)]
        interval: Duration,
    },

    /// Node side: discover the cluster named in a boot payload.
    Boot {
        #[arg(long)]
        payload: PathBuf,

        /// This instance's id.
        #[arg(long)]
        instance_id: String,

        #[arg(long, default_value = "keygrid-cloud.json")]
        cloud_state: PathBuf,

        /// Upper bound on total discovery time.
        #[arg(long, value_parser = duration_arg)]
        max_wait: Option<Duration>,
    },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration: {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keygridd=debug,keygrid=debug"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Plan { manifest } => control_plane::run_plan(&manifest),
        Command::Render {
            manifest,
            role,
            out,
        } => control_plane::run_render(&manifest, &role, out.as_deref()),
        Command::Apply {
            manifest,
            state,
            cloud_state,
        } => control_plane::run_apply(&manifest, &state, &cloud_state).await,
        Command::Run {
            manifest,
            state,
            cloud_state,
            interval,
        } => control_plane::run_control_plane(&manifest, &state, &cloud_state, interval).await,
        Command::Boot {
            payload,
            instance_id,
            cloud_state,
            max_wait,
        } => node_mode::run_boot(&payload, &instance_id, &cloud_state, max_wait).await,
    }
}
