use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shadow_core::{coverage_score, CoverageStats};
use shadow_storage::SqliteBackend;
use shadow_sync::{CancelHandle, EnrichConfig, EnrichPipeline, RunSummary};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shadow-cli")]
#[command(about = "Shadow profile enrichment command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enrich the given accounts, or discovered candidates when none are given.
    Enrich {
        account_ids: Vec<String>,
        /// File with one account id per line.
        #[arg(long)]
        ids_file: Option<PathBuf>,
        /// Restrict to these sources, in this priority order.
        #[arg(long = "source")]
        sources: Vec<String>,
        #[arg(long)]
        threshold: Option<f64>,
        /// Longest total wait for local quota per request.
        #[arg(long)]
        max_quota_wait_secs: Option<u64>,
    },
    /// Coverage for specific accounts, or the whole store.
    Coverage { account_ids: Vec<String> },
    /// Current quota windows per source.
    Quota,
    /// Write parquet snapshots of profiles and edges.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Migrate,
    /// Run enrichment on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = EnrichConfig::from_env();

    match cli.command.unwrap_or(Commands::Enrich {
        account_ids: Vec::new(),
        ids_file: None,
        sources: Vec::new(),
        threshold: None,
        max_quota_wait_secs: None,
    }) {
        Commands::Enrich {
            mut account_ids,
            ids_file,
            sources,
            threshold,
            max_quota_wait_secs,
        } => {
            if let Some(threshold) = threshold {
                config.completeness_threshold = threshold;
            }
            if let Some(secs) = max_quota_wait_secs {
                config.max_quota_wait = Duration::from_secs(secs);
            }
            if let Some(path) = ids_file {
                account_ids.extend(read_ids_file(&path).await?);
            }

            let pipeline = EnrichPipeline::connect(config).await?;
            let cancel = interrupt_handle();
            let (summary, run_dir) = if account_ids.is_empty() && sources.is_empty() {
                pipeline.run_candidates(&cancel).await?
            } else {
                if account_ids.is_empty() {
                    bail!("--source needs account ids (arguments or --ids-file)");
                }
                let request = pipeline.request_for(account_ids).with_sources(sources);
                pipeline.run(request, &cancel).await?
            };
            print_summary(&summary, &run_dir);
        }
        Commands::Coverage { account_ids } => {
            let pipeline = EnrichPipeline::connect(config).await?;
            let store = pipeline.store();
            let stats = if account_ids.is_empty() {
                store.population_stats().await?
            } else {
                let mut scores = Vec::with_capacity(account_ids.len());
                for account_id in &account_ids {
                    let profile = store.profile(account_id).await?;
                    let score = coverage_score(profile.as_ref());
                    println!("{account_id}: {}", describe_score(score));
                    scores.push(score);
                }
                CoverageStats::from_scores(scores)
            };
            println!(
                "accounts={} with_data={} complete={} complete_ratio={:.3} mean={}",
                stats.accounts,
                stats.with_data,
                stats.complete,
                stats.complete_ratio(),
                stats
                    .mean_coverage
                    .map(|m| format!("{m:.3}"))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Commands::Quota => {
            let pipeline = EnrichPipeline::connect(config).await?;
            let quota = pipeline.quota();
            for source in quota.sources().await {
                for window in quota.snapshot(&source).await {
                    println!(
                        "{source} {}: {}/{} per {}s (window start {})",
                        window.window,
                        window.count,
                        window.capacity,
                        window.window_secs,
                        window
                            .window_start
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }
        Commands::Export { out } => {
            let out = out.unwrap_or_else(|| {
                config
                    .reports_dir
                    .join("snapshots")
                    .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string())
            });
            let pipeline = EnrichPipeline::connect(config).await?;
            let manifest = pipeline.export(&out).await?;
            println!("export complete: manifest={}", manifest.display());
        }
        Commands::Migrate => {
            let backend = SqliteBackend::connect(&config.database_url, 1)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            backend.migrate().await.context("running migrations")?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = std::sync::Arc::new(EnrichPipeline::connect(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            println!("scheduler running on '{cron}'; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn interrupt_handle() -> CancelHandle {
    let cancel = CancelHandle::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight accounts");
            watcher.cancel();
        }
    });
    cancel
}

async fn read_ids_file(path: &Path) -> Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn describe_score(score: Option<f64>) -> String {
    match score {
        Some(score) => format!("{score:.1}"),
        None => "no data".to_string(),
    }
}

fn print_summary(summary: &RunSummary, run_dir: &Path) {
    println!(
        "enrich complete: run_id={} accounts={} complete_before={} complete_after={} reports={}",
        summary.run_id,
        summary.accounts.len(),
        summary.coverage_before.complete,
        summary.coverage_after.complete,
        run_dir.display()
    );
    for (status, count) in &summary.status_counts {
        println!("  {}: {}", status.as_str(), count);
    }
}
