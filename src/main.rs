use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fanout::agent::{AgentLocator, AgentRunner};
use fanout::config::AppConfig;
use fanout::queue::task::Target;
use fanout::shutdown::{cancel_on_shutdown, Cancellation};
use fanout::workflow::batch::Batch;
use fanout::workflow::prompt::TaskTemplate;
use fanout::workflow::report::{log_report, write_report};
use fanout::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "fanout", about = "Run a coding-agent task across many repositories")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Target as org/repo[@branch]; replaces configured targets (repeatable)
    #[arg(short, long = "target")]
    targets: Vec<String>,

    /// Task template to run against every target
    #[arg(long)]
    task_file: Option<PathBuf>,

    /// Maximum number of agents running at once
    #[arg(short = 'j', long, conflicts_with = "sequential")]
    concurrency: Option<usize>,

    /// Run one target at a time, in order
    #[arg(long)]
    sequential: bool,

    /// Kill an agent that runs longer than this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Batch could not start");
            ExitCode::from(2)
        }
    }
}

/// Returns whether every target succeeded.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli)?;
    config.validate()?;

    tracing::info!(
        targets = config.targets.len(),
        concurrency = config.run.concurrency,
        agent = %config.agent.command,
        "Starting fanout"
    );

    let task_file = config
        .run
        .task_file
        .clone()
        .context("no task file configured")?;
    let template = TaskTemplate::load(&task_file).await?;

    tokio::fs::create_dir_all(&config.run.log_dir)
        .await
        .with_context(|| format!("cannot create log directory {}", config.run.log_dir.display()))?;

    let cancellation = Cancellation::new();
    let cancel = cancellation.token();
    cancel_on_shutdown(cancellation);

    let locator = Arc::new(AgentLocator::new(&config.agent.command));
    let runner = AgentRunner::new(locator, config.agent.args.clone(), &config.run.log_dir)
        .with_timeout(config.agent_timeout())
        .with_cancel_token(cancel.clone());

    let batch = Batch::new(
        Arc::new(WorkspaceManager::from_config(&config)),
        Arc::new(runner),
        template,
        config.run.log_dir.join("tasks"),
        config.run.concurrency,
    )
    .with_cancel_token(cancel);

    let report = batch.run(config.targets.clone()).await?;

    log_report(&report);
    if let Some(path) = &config.run.summary_path {
        // Every unit has already run; a lost summary file only gets logged.
        if let Err(e) = write_report(&report, path).await {
            tracing::error!(path = %path.display(), error = %e, "Failed to write batch report");
        }
    }

    Ok(report.all_succeeded())
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) -> anyhow::Result<()> {
    if !cli.targets.is_empty() {
        config.targets = cli
            .targets
            .iter()
            .map(|spec| Target::parse(spec))
            .collect::<Result<_, _>>()?;
    }
    if let Some(task_file) = &cli.task_file {
        config.run.task_file = Some(task_file.clone());
    }
    if cli.sequential {
        config.run.concurrency = 1;
    } else if let Some(concurrency) = cli.concurrency {
        config.run.concurrency = concurrency;
    }
    if let Some(timeout) = cli.timeout_secs {
        config.agent.timeout_secs = Some(timeout);
    }
    Ok(())
}
