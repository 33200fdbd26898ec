//! Parquet snapshots of the shadow store for downstream consumers.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shadow_core::{EdgeRecord, ShadowProfile};

pub const PROFILES_FILE: &str = "shadow_profiles.parquet";
pub const EDGES_FILE: &str = "shadow_edges.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub profiles: usize,
    pub edges: usize,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes both parquet files and `manifest.json` into `out_dir`; returns
/// the manifest path.
pub fn export_snapshot(
    out_dir: &Path,
    profiles: &[ShadowProfile],
    edges: &[EdgeRecord],
) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let profiles_path = out_dir.join(PROFILES_FILE);
    let edges_path = out_dir.join(EDGES_FILE);
    write_profiles_parquet(&profiles_path, profiles)?;
    write_edges_parquet(&edges_path, edges)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        exported_at: Utc::now(),
        profiles: profiles.len(),
        edges: edges.len(),
        files: vec![
            manifest_entry("shadow_profiles", out_dir, &profiles_path)?,
            manifest_entry("shadow_edges", out_dir, &edges_path)?,
        ],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_profiles_parquet(path: &Path, profiles: &[ShadowProfile]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("account_id", DataType::Utf8, false),
        ArrowField::new("username", DataType::Utf8, true),
        ArrowField::new("display_name", DataType::Utf8, true),
        ArrowField::new("bio", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("website", DataType::Utf8, true),
        ArrowField::new("joined_date", DataType::Utf8, true),
        ArrowField::new("avatar_present", DataType::Boolean, true),
        ArrowField::new("followers_count", DataType::Int64, true),
        ArrowField::new("following_count", DataType::Int64, true),
        ArrowField::new("listed_in_following", DataType::Boolean, true),
        ArrowField::new("listed_in_followers", DataType::Boolean, true),
        ArrowField::new("coverage", DataType::Float64, false),
        ArrowField::new("last_source", DataType::Utf8, true),
        ArrowField::new("updated_at", DataType::Utf8, false),
    ]));

    let account_ids = text_column(profiles, |p| Some(p.account_id.as_str()));
    let usernames = text_column(profiles, |p| p.fields.username.as_deref());
    let display_names = text_column(profiles, |p| p.fields.display_name.as_deref());
    let bios = text_column(profiles, |p| p.fields.bio.as_deref());
    let locations = text_column(profiles, |p| p.fields.location.as_deref());
    let websites = text_column(profiles, |p| p.fields.website.as_deref());
    let last_sources = text_column(profiles, |p| p.last_source.as_deref());
    let joined = StringArray::from(
        profiles
            .iter()
            .map(|p| p.fields.joined_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let avatars = BooleanArray::from(
        profiles
            .iter()
            .map(|p| p.fields.avatar_present)
            .collect::<Vec<_>>(),
    );
    let followers = Int64Array::from(
        profiles
            .iter()
            .map(|p| p.fields.followers_count)
            .collect::<Vec<_>>(),
    );
    let following = Int64Array::from(
        profiles
            .iter()
            .map(|p| p.fields.following_count)
            .collect::<Vec<_>>(),
    );
    let listed_following = BooleanArray::from(
        profiles
            .iter()
            .map(|p| p.fields.listed_in_following)
            .collect::<Vec<_>>(),
    );
    let listed_followers = BooleanArray::from(
        profiles
            .iter()
            .map(|p| p.fields.listed_in_followers)
            .collect::<Vec<_>>(),
    );
    let coverage = Float64Array::from(profiles.iter().map(|p| p.coverage()).collect::<Vec<_>>());
    let updated = StringArray::from(
        profiles
            .iter()
            .map(|p| Some(p.updated_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(account_ids),
            Arc::new(usernames),
            Arc::new(display_names),
            Arc::new(bios),
            Arc::new(locations),
            Arc::new(websites),
            Arc::new(joined),
            Arc::new(avatars),
            Arc::new(followers),
            Arc::new(following),
            Arc::new(listed_following),
            Arc::new(listed_followers),
            Arc::new(coverage),
            Arc::new(last_sources),
            Arc::new(updated),
        ],
    )
    .context("building shadow_profiles record batch")?;
    write_parquet(path, batch)
}

fn text_column<F>(profiles: &[ShadowProfile], column: F) -> StringArray
where
    F: Fn(&ShadowProfile) -> Option<&str>,
{
    StringArray::from(profiles.iter().map(column).collect::<Vec<_>>())
}

fn write_edges_parquet(path: &Path, edges: &[EdgeRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_account_id", DataType::Utf8, false),
        ArrowField::new("target_account_id", DataType::Utf8, false),
        ArrowField::new("list_type", DataType::Utf8, false),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
        ArrowField::new("reported_by", DataType::Utf8, true),
    ]));

    let sources = StringArray::from(
        edges
            .iter()
            .map(|e| Some(e.source_account_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let targets = StringArray::from(
        edges
            .iter()
            .map(|e| Some(e.target_account_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let list_types = StringArray::from(
        edges
            .iter()
            .map(|e| Some(e.list_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let first_seen = StringArray::from(
        edges
            .iter()
            .map(|e| Some(e.first_seen_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let last_seen = StringArray::from(
        edges
            .iter()
            .map(|e| Some(e.last_seen_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let reporters = StringArray::from(
        edges
            .iter()
            .map(|e| e.reported_by.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(sources),
            Arc::new(targets),
            Arc::new(list_types),
            Arc::new(first_seen),
            Arc::new(last_seen),
            Arc::new(reporters),
        ],
    )
    .context("building shadow_edges record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
