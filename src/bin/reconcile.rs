use clap::{Parser, Subcommand};
use dotenv::dotenv;
use itertools::Itertools;
use report_reconciler::ecs_scheduler::EcsScheduler;
use report_reconciler::opensearch::OpenSearchClient;
use report_reconciler::s3_store::S3Store;
use report_reconciler::{
    ObjectStoreLike, PendingInput, ReconcileConfig, ReconcileError, Reconciler, WorkerLifecycle,
    handle_invocation,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "reconcile")]
#[command(about = "Deletes inbound report files once their reports are indexed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print the status object
    Run,
    /// List the most recently indexed report ids
    Recent {
        /// How many ids to show (defaults to RECONCILE_RECENT_LIMIT)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the subject line and report id extracted from one stored object
    Extract {
        /// Object key in the configured bucket
        key: String,
    },
    /// Show the worker service state and its running tasks
    Worker,
}

fn main() {
    dotenv().ok();
    report_reconciler::init_tracing("report-reconciler");
    let cli = Cli::parse();

    if let Err(e) = run(cli.command.unwrap_or(Commands::Run)) {
        tracing::error!(error = %e, "reconcile failed");
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), ReconcileError> {
    let mut config = ReconcileConfig::from_env()?;
    let runtime = Arc::new(
        tokio::runtime::Runtime::new()
            .map_err(|e| ReconcileError::Other(format!("tokio runtime error: {}", e)))?,
    );

    match command {
        Commands::Run => {
            let store = S3Store::new(&config.store, runtime.clone())?;
            let index = OpenSearchClient::new(&config.index)?;
            let lifecycle = WorkerLifecycle::new(EcsScheduler::new(&config.scheduler, &config.store.region, runtime)?);
            let reconciler = Reconciler::new(config);
            let status = handle_invocation(&reconciler, &store, &index, &lifecycle, (), ())?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Recent { limit } => {
            if let Some(limit) = limit {
                config.index.recent_limit = limit;
            }
            let index = OpenSearchClient::new(&config.index)?;
            let reconciler = Reconciler::new(config);
            for id in reconciler.verifier().recent_identifiers(&index)? {
                println!("{}", id);
            }
        }
        Commands::Extract { key } => {
            let store = S3Store::new(&config.store, runtime)?;
            let input = PendingInput::load(&store, &key)?;
            let reconciler = Reconciler::new(config);
            println!("object:     s3://{}/{}", store.bucket(), input.key);
            println!("subject:    {}", input.raw_subject_line.as_deref().unwrap_or("-"));
            let id = reconciler.extractor().require(input.raw_subject_line.as_deref())?;
            println!("report id:  {}", id);
        }
        Commands::Worker => {
            let lifecycle = WorkerLifecycle::new(EcsScheduler::new(&config.scheduler, &config.store.region, runtime.clone())?);
            let state = lifecycle.state()?;
            println!(
                "service {}: running={} desired={}",
                config.scheduler.service, state.running_count, state.desired_count
            );
            let tasks = lifecycle.task_statuses()?;
            if tasks.is_empty() {
                println!("no running tasks");
            } else {
                println!(
                    "{}",
                    tasks
                        .iter()
                        .map(|(task, status)| format!("{}\t{}", task, status.as_deref().unwrap_or("-")))
                        .join("\n")
                );
            }
            let store = S3Store::new(&config.store, runtime)?;
            let pending = store
                .list(&config.store.prefix)?
                .into_iter()
                .filter(|key| !config.store.is_aggregate_output(key))
                .count();
            println!("pending inputs: {}", pending);
        }
    }

    Ok(())
}
