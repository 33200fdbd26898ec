//! Enrichment runs: orchestration, run reports, parquet snapshots and the
//! optional cron schedule.

pub mod config;
pub mod export;
pub mod orchestrator;
pub mod pipeline;
pub mod reports;

pub const CRATE_NAME: &str = "shadow-sync";

pub use config::EnrichConfig;
pub use export::{export_snapshot, SnapshotFile, SnapshotManifest};
pub use orchestrator::{
    AccountOutcome, AccountStatus, CancelHandle, EnrichmentRequest, Orchestrator, RunSummary,
    SourceAttempt, SourceResult,
};
pub use pipeline::EnrichPipeline;
pub use reports::{render_brief, write_run_reports};
