use clap::{Parser, Subcommand};
use conduit_core::{JobId, JobStatus};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "conduit", version, about = "Incremental sync scheduler and connector runner")]
pub struct Cli {
    /// SQLite database holding connectors, checkpoints and job history.
    #[arg(long, global = true, env = "CONDUIT_DB_PATH")]
    pub db: Option<PathBuf>,

    /// Directory receiving synced records as JSON lines.
    #[arg(long, global = true, env = "CONDUIT_SINK_DIR", default_value = "./data/records")]
    pub sink_dir: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the cron scheduler until interrupted (default if no subcommand given).
    Serve,

    /// Print a connector's specification.
    Spec { connector_id: String },

    /// Validate a connector's stored configuration.
    Check { connector_id: String },

    /// Discover a connector's catalog (bypasses the catalog cache).
    Discover { connector_id: String },

    /// Run one sync now and print the finished job.
    Trigger { connector_id: String },

    /// Job history, newest first.
    Jobs {
        #[arg(long)]
        connector: Option<String>,
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// The retry chain a job belongs to, oldest first.
    Lineage { job_id: JobId },

    /// Inspect or rewrite a connector's checkpoints.
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Manage connector definitions.
    Connector {
        #[command(subcommand)]
        command: ConnectorCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum StateCommands {
    /// Print the connector's state snapshot, or write it to `--out`.
    Export {
        connector_id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replace the connector's state with a snapshot file.
    Import { connector_id: String, path: PathBuf },

    /// Delete checkpoints so the next sync starts over.
    Clear {
        connector_id: String,
        #[arg(long)]
        stream: Option<String>,
        #[arg(long, requires = "stream")]
        namespace: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConnectorCommands {
    /// Create or replace a connector (and optionally its schedule) from a JSON file.
    Put { path: PathBuf },

    /// List registered connectors.
    List,
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::parse_str(&s.to_ascii_lowercase()).ok_or_else(|| {
        format!("unknown status '{s}' (pending, running, completed, failed, cancelled)")
    })
}
