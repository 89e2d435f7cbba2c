mod config;
mod watcher;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{ForgeflowConfig, Settings};
use forgeflow_agent::{JsonlSink, ModelRouter};
use forgeflow_orchestrator::{
    default_registry, GatePipeline, LlmPrdGenerator, Orchestrator, PrdGenerator, PrdStore,
    RunOutcome, TaskStatus,
};
use forgeflow_sandbox::ExecutionClient;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use watcher::{external_edit, PrdWatcher};

#[derive(Parser)]
#[command(name = "forgeflow", about = "Forgeflow — multi-agent build orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "forgeflow.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive every task in a PRD to done or blocked
    Run {
        prd: PathBuf,
    },
    /// Show counts per status and phase, the ready set and blocked errors
    Status {
        prd: PathBuf,
    },
    /// Reset every task, or a single blocked task
    Reset {
        prd: PathBuf,
        /// Only reset this blocked task
        #[arg(long)]
        task: Option<String>,
    },
    /// Run, then run again whenever the PRD file changes
    Watch {
        prd: PathBuf,
        /// Milliseconds to wait for a burst of writes to settle
        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,
    },
    /// Plan a fresh PRD from a description
    Generate {
        description: String,
        /// Where to write the PRD
        #[arg(short, long, default_value = "prd.json")]
        out: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = ForgeflowConfig::load(&cli.config)?.resolve()?;

    match cli.command {
        Commands::Run { prd } => {
            let orchestrator = build_orchestrator(&settings)?;
            let mut store = PrdStore::load(&prd).await?;
            let outcome = orchestrator.run(&mut store).await?;
            print_outcome(&outcome);
            Ok(exit_code(&outcome))
        }
        Commands::Status { prd } => {
            let store = PrdStore::load(&prd).await?;
            print_status(&store);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset { prd, task } => {
            let mut store = PrdStore::load(&prd).await?;
            match task {
                Some(id) => {
                    store.prd_mut().reset_task(&id)?;
                    println!("Reset task '{id}'");
                }
                None => {
                    store.prd_mut().reset_all();
                    println!("Reset {} task(s)", store.prd().tasks.len());
                }
            }
            store.persist().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch { prd, debounce_ms } => {
            watch(&settings, &prd, Duration::from_millis(debounce_ms)).await
        }
        Commands::Generate {
            description,
            out,
            force,
        } => {
            if out.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", out.display());
            }
            let router = build_router(&settings)?;
            let generator = LlmPrdGenerator::new(router, default_registry());
            let prd = generator.generate(&description).await?;
            let count = prd.tasks.len();
            let mut store = PrdStore::new(&out, prd);
            store
                .persist()
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("Wrote {count} task(s) to {}", out.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_router(settings: &Settings) -> anyhow::Result<Arc<ModelRouter>> {
    let mut router = ModelRouter::new(settings.router.clone())?;
    if let Some(path) = &settings.calls_log {
        router = router.with_sink(Arc::new(JsonlSink::new(path)));
        info!(path = %path.display(), "Recording model calls");
    }
    Ok(Arc::new(router))
}

fn build_orchestrator(settings: &Settings) -> anyhow::Result<Orchestrator> {
    let router = build_router(settings)?;
    let client = match &settings.execution {
        Some(execution) => Some(Arc::new(ExecutionClient::new(execution.clone())?)),
        None => {
            info!("Sandbox disabled, execution gates will skip");
            None
        }
    };
    let gates = GatePipeline::standard(client, &settings.gates);
    info!(
        tier = %settings.router.tier,
        gates = ?gates.names(),
        concurrency = settings.orchestrator.concurrency,
        "Orchestrator ready"
    );
    Ok(Orchestrator::new(
        router,
        Arc::new(gates),
        default_registry(),
        settings.orchestrator.clone(),
    ))
}

async fn watch(settings: &Settings, prd: &Path, debounce: Duration) -> anyhow::Result<ExitCode> {
    let orchestrator = build_orchestrator(settings)?;
    let mut watcher = PrdWatcher::start(prd, debounce)?;
    let mut store = PrdStore::load(prd).await?;
    let mut last = run_once(&orchestrator, &mut store).await?;

    // Content of the last external edit that failed validation.
    let mut rejected: Option<String> = None;
    loop {
        // Drain before comparing so an edit made during the run is seen here.
        watcher.drain();
        let pending = external_edit(prd, store.last_written())
            .await
            .ok()
            .flatten()
            .is_some_and(|content| rejected.as_deref() != Some(content.as_str()));
        if !pending {
            tokio::select! {
                changed = watcher.changed() => {
                    if !changed {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping watch");
                    break;
                }
            }
        }

        let content = match external_edit(prd, store.last_written()).await {
            Ok(Some(content)) => content,
            Ok(None) => continue,
            Err(e) => {
                warn!(path = %prd.display(), error = %e, "PRD unreadable, waiting for next change");
                continue;
            }
        };
        match PrdStore::load(prd).await {
            Ok(reloaded) => {
                store = reloaded;
                rejected = None;
            }
            Err(e) => {
                warn!(error = %e, "PRD rejected, waiting for next change");
                rejected = Some(content);
                continue;
            }
        }
        info!(path = %prd.display(), "PRD changed, re-running");
        last = run_once(&orchestrator, &mut store).await?;
    }

    Ok(last)
}

async fn run_once(orchestrator: &Orchestrator, store: &mut PrdStore) -> anyhow::Result<ExitCode> {
    let outcome = orchestrator.run(store).await?;
    print_outcome(&outcome);
    Ok(exit_code(&outcome))
}

fn exit_code(outcome: &RunOutcome) -> ExitCode {
    if outcome.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!(
        "Run {} finished in {:.1}s after {} iteration(s)",
        outcome.run_id,
        outcome.duration_ms as f64 / 1000.0,
        outcome.iterations
    );
    println!("  done:    {}", outcome.done.len());
    if !outcome.blocked.is_empty() {
        println!("  blocked: {}", outcome.blocked.join(", "));
    }
    if !outcome.stalled.is_empty() {
        println!("  stalled: {}", outcome.stalled.join(", "));
    }

    if !outcome.metrics.is_empty() {
        println!("\nAgent metrics:");
        for (agent, m) in &outcome.metrics {
            println!(
                "  {agent:<10} attempts={} ok={} failed={} timeouts={} tokens={} cost=${:.4}",
                m.attempts, m.successes, m.failures, m.timeouts, m.tokens, m.cost_usd
            );
        }
        let total = &outcome.aggregate;
        println!(
            "  {:<10} attempts={} tokens={} cost=${:.4}",
            "total", total.attempts, total.tokens, total.cost_usd
        );
    }
}

fn print_status(store: &PrdStore) {
    let prd = store.prd();
    let report = prd.summary();
    println!("{} (v{}) — {} task(s)", prd.meta.name, prd.meta.version, report.total);

    println!("\nBy status:");
    for status in TaskStatus::ALL {
        let count = report.by_status.get(&status).copied().unwrap_or(0);
        if count > 0 {
            let name = status.to_string();
            println!("  {name:<8} {count}");
        }
    }

    println!("\nBy phase:");
    for (phase, counts) in &report.by_phase {
        let parts: Vec<String> = counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
        println!("  phase {phase}: {}", parts.join(" "));
    }

    if report.ready.is_empty() {
        println!("\nReady: none");
    } else {
        println!("\nReady: {}", report.ready.join(", "));
    }

    if !report.blocked.is_empty() {
        println!("\nBlocked:");
        for (id, error) in &report.blocked {
            println!("  {id}: {error}");
        }
    }

    let stalled = prd.stalled();
    if !stalled.is_empty() {
        println!("\nStalled behind blocked work: {}", stalled.join(", "));
    }
}
