mod config_commands;
mod job_commands;
mod storage;

use std::path::PathBuf;

use {
    anyhow::Context,
    cadence_config::CadenceConfig,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence, a recurring job scheduler", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of searching the standard locations.
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted (default when no subcommand is provided).
    Run,
    /// Show the next occurrences of a schedule, e.g. `R5/2025-01-01T09:00:00Z/P1D`.
    Schedule {
        spec: String,
        /// How many occurrences to show.
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Create a job in the configured store.
    ///
    /// Writes to the store only: a daemon that is already running picks the
    /// job up on its next start. With the `file` backend, do not run this
    /// while a daemon uses the same directory.
    Add(job_commands::AddArgs),
    /// List stored jobs.
    Jobs {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show the run history of a job.
    Runs {
        job_id: String,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Remove runs past the retention window, or every run of one job.
    PurgeRuns {
        /// Remove all runs of this job instead.
        #[arg(long)]
        job: Option<String>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CadenceConfig> {
    let config = match path {
        Some(path) => cadence_config::load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => cadence_config::discover_and_load(),
    };
    Ok(cadence_config::apply_env_overrides(config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        None | Some(Commands::Run) => {
            info!(version = env!("CARGO_PKG_VERSION"), "cadence starting");
            let config = load_config(cli.config.as_ref())?;
            job_commands::run_daemon(&config).await
        },
        Some(Commands::Schedule { spec, count }) => job_commands::preview(&spec, count),
        Some(Commands::Add(args)) => {
            let config = load_config(cli.config.as_ref())?;
            job_commands::add(&config, args).await
        },
        Some(Commands::Jobs { json }) => {
            let config = load_config(cli.config.as_ref())?;
            job_commands::list_jobs(&config, json).await
        },
        Some(Commands::Runs { job_id, json }) => {
            let config = load_config(cli.config.as_ref())?;
            job_commands::list_runs(&config, &job_id, json).await
        },
        Some(Commands::PurgeRuns { job }) => {
            let config = load_config(cli.config.as_ref())?;
            job_commands::purge_runs(&config, job.as_deref()).await
        },
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
    }
}
