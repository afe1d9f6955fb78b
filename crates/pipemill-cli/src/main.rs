//! The pipemill CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "pipemill")]
#[command(about = "Pipeline job orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory layout with a default pipeline
    Init {
        /// Data root directory
        #[arg(long, env = "PO_ROOT")]
        root: Option<PathBuf>,
    },
    /// Run the orchestrator and HTTP server
    Start {
        /// Data root directory
        #[arg(long, env = "PO_ROOT")]
        root: Option<PathBuf>,
        /// HTTP port (defaults to PORT, then PO_UI_PORT, then 3000)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Submit a seed file to a running server
    Submit {
        /// Path to the seed JSON file
        seed_file: PathBuf,
        /// API server URL
        #[arg(long, env = "PIPEMILL_API_URL", default_value = "http://localhost:3000")]
        api_url: String,
    },
    /// Show job status (all jobs, or one)
    Status {
        /// Job id
        job_id: Option<String>,
        /// API server URL
        #[arg(long, env = "PIPEMILL_API_URL", default_value = "http://localhost:3000")]
        api_url: String,
    },
    /// Scaffold a new pipeline
    AddPipeline {
        /// Pipeline slug
        slug: String,
        /// Data root directory
        #[arg(long, env = "PO_ROOT")]
        root: Option<PathBuf>,
    },
    /// Add a task to an existing pipeline
    AddPipelineTask {
        /// Pipeline slug
        pipeline_slug: String,
        /// Task slug
        task_slug: String,
        /// Data root directory
        #[arg(long, env = "PO_ROOT")]
        root: Option<PathBuf>,
    },
    /// Run one job's pipeline (spawned by the orchestrator)
    #[command(hide = true)]
    Worker {
        /// Job id
        job_id: String,
    },
}

fn require_root(root: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    root.ok_or_else(|| anyhow::anyhow!("PO_ROOT is not set and --root was not given"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { root } => {
            commands::scaffold::init(&require_root(root)?)?;
        }
        Commands::Start { root, port } => {
            let port = port.unwrap_or_else(pipemill_config::env::ui_port);
            commands::start::start(require_root(root)?, port).await?;
        }
        Commands::Submit { seed_file, api_url } => {
            commands::submit::submit(&api_url, &seed_file).await?;
        }
        Commands::Status { job_id, api_url } => {
            commands::status::status(&api_url, job_id.as_deref()).await?;
        }
        Commands::AddPipeline { slug, root } => {
            commands::scaffold::add_pipeline(&require_root(root)?, &slug)?;
        }
        Commands::AddPipelineTask {
            pipeline_slug,
            task_slug,
            root,
        } => {
            commands::scaffold::add_pipeline_task(&require_root(root)?, &pipeline_slug, &task_slug)?;
        }
        Commands::Worker { job_id } => {
            commands::worker::worker(&job_id).await?;
        }
    }

    Ok(())
}
