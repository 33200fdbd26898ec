use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::orchestrator::{AccountStatus, RunSummary};

pub const SUMMARY_FILE: &str = "enrichment_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

/// Writes `<reports_root>/<run_id>/{enrichment_summary.json,run_brief.md}`
/// and returns the run directory.
pub async fn write_run_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(run_dir.join(BRIEF_FILE), render_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(run_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let statuses = summary
        .status_counts
        .iter()
        .map(|(status, count)| format!("- {}: {}", status.as_str(), count))
        .collect::<Vec<_>>()
        .join("\n");

    let failures = summary
        .accounts
        .iter()
        .filter(|a| matches!(a.status, AccountStatus::Error | AccountStatus::Exhausted))
        .map(|a| {
            format!(
                "- `{}` {}: {}",
                a.account_id,
                a.status.as_str(),
                a.reason.as_deref().unwrap_or("-")
            )
        })
        .collect::<Vec<_>>();

    let mut brief = format!(
        "# Shadow Enrichment Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources: {}\n- Accounts: {}\n\n## Coverage\n- Before: {}\n- After: {}\n\n## Outcomes\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        if summary.sources.is_empty() {
            "-".to_string()
        } else {
            summary.sources.join(", ")
        },
        summary.accounts.len(),
        describe_coverage(&summary.coverage_before),
        describe_coverage(&summary.coverage_after),
        statuses,
    );
    if !failures.is_empty() {
        brief.push_str("\n## Needs Attention\n");
        brief.push_str(&failures.join("\n"));
        brief.push('\n');
    }
    brief
}

fn describe_coverage(stats: &shadow_core::CoverageStats) -> String {
    match stats.mean_coverage {
        Some(mean) => format!(
            "{}/{} complete, {} with data, mean {:.2}",
            stats.complete, stats.accounts, stats.with_data, mean
        ),
        None => format!("0/{} complete, no data", stats.accounts),
    }
}
