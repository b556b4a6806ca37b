//! `verdict-fanout` - run every task past every judge backend.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use verdict_fanout::budget::BackendDescriptor;
use verdict_fanout::checkpoint::CheckpointStore;
use verdict_fanout::config::Config;
use verdict_fanout::llm::OpenRouterClient;
use verdict_fanout::orchestrator::{build_execution_order, Orchestrator};
use verdict_fanout::results::FileResultSink;
use verdict_fanout::task::{load_tasks, Task};
use verdict_fanout::tools::{
    DomainBlocklist, FetchRateLimiter, HttpPageSource, SearxngSearch, ToolExecutor,
};
use verdict_fanout::worker::VerificationWorker;

#[derive(Parser, Debug)]
#[command(author, version, about = "Fan verification tasks out to judge backends", long_about = None)]
struct Args {
    /// YAML file of tasks
    #[arg(long)]
    tasks: PathBuf,

    /// Backend ids to use (defaults to every configured backend)
    #[arg(long, num_args = 1..)]
    backends: Vec<String>,

    /// Only process the first N tasks
    #[arg(long)]
    limit: Option<usize>,

    /// List the pairs that would run without calling any backend
    #[arg(long)]
    dry_run: bool,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pairs in flight at once (overrides config)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
        config.validate().context("Invalid --concurrency")?;
    }

    let mut tasks = load_tasks(&args.tasks)
        .with_context(|| format!("Failed to load tasks from {}", args.tasks.display()))?;
    if let Some(limit) = args.limit {
        tasks.truncate(limit);
    }
    let backends = config.resolve_backends(&args.backends);

    let checkpoint = CheckpointStore::load(&config.state_path)
        .await
        .with_context(|| format!("Failed to load checkpoint {}", config.state_path.display()))?;

    if args.dry_run {
        return dry_run(&tasks, &backends, &checkpoint).await;
    }

    let Some(api_key) = config.openrouter_api_key.clone() else {
        bail!("OPENROUTER_API_KEY is not set");
    };

    let client = OpenRouterClient::with_base_url(api_key, config.openrouter_base_url.clone())
        .with_usage_lookup_delay(config.usage_lookup_delay());
    let blocklist = DomainBlocklist::load(&config.blocklist_path).context("Failed to load blocklist")?;
    tracing::info!("{} blocked domains", blocklist.len());

    let tools = ToolExecutor::new(
        Arc::new(SearxngSearch::new(&config.searxng_url, config.search_timeout())),
        Arc::new(HttpPageSource::new(config.fetch_timeout())),
        blocklist,
        Arc::new(FetchRateLimiter::new(config.fetch_min_interval())),
        config.tool_limits(),
    );
    let worker = VerificationWorker::new(
        Arc::new(client),
        Arc::new(tools),
        config.worker_config().context("Failed to load system prompt")?,
    );

    let orchestrator = Orchestrator::new(
        Arc::new(worker),
        Arc::new(checkpoint),
        Arc::new(FileResultSink::new(&config.verdict_dir)),
        config.orchestrator_config(),
    );

    let summary = orchestrator.run(&tasks, &backends).await?;
    println!("{}", summary);
    Ok(())
}

async fn dry_run(
    tasks: &[Task],
    backends: &[BackendDescriptor],
    checkpoint: &CheckpointStore,
) -> Result<()> {
    let order = build_execution_order(tasks, backends);
    let mut pending = 0;
    for pair in &order {
        let key = pair.key();
        if checkpoint.contains(&key).await {
            continue;
        }
        pending += 1;
        println!("{}", key);
    }

    println!(
        "{} of {} pairs pending ({} tasks x {} backends)",
        pending,
        order.len(),
        tasks.len(),
        backends.len()
    );
    for backend in backends {
        match &backend.pricing {
            Some(price) => println!(
                "  {}: {} token window, ${:.2}/${:.2} per M tokens",
                backend.id, backend.context_window, price.prompt_per_million, price.completion_per_million
            ),
            None => println!("  {}: {} token window", backend.id, backend.context_window),
        }
    }
    Ok(())
}
