//! SQLite backend for the shadow store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use shadow_core::{EdgeRecord, ListType, ProfileFields, ShadowProfile};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::store::{AttemptRecord, BackendError, EdgeKey, ShadowBackend, StoreError};

const PROFILE_COLUMNS: &str = "account_id, username, display_name, bio, location, website, \
     joined_date, avatar_present, followers_count, following_count, listed_in_following, \
     listed_in_followers, first_seen_at, updated_at, last_source";

#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    account_id: String,
    username: Option<String>,
    display_name: Option<String>,
    bio: Option<String>,
    location: Option<String>,
    website: Option<String>,
    joined_date: Option<NaiveDate>,
    avatar_present: Option<bool>,
    followers_count: Option<i64>,
    following_count: Option<i64>,
    listed_in_following: Option<bool>,
    listed_in_followers: Option<bool>,
    first_seen_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_source: Option<String>,
}

impl From<ProfileRow> for ShadowProfile {
    fn from(row: ProfileRow) -> Self {
        ShadowProfile {
            account_id: row.account_id,
            fields: ProfileFields {
                username: row.username,
                display_name: row.display_name,
                bio: row.bio,
                location: row.location,
                website: row.website,
                joined_date: row.joined_date,
                avatar_present: row.avatar_present,
                followers_count: row.followers_count,
                following_count: row.following_count,
                listed_in_following: row.listed_in_following,
                listed_in_followers: row.listed_in_followers,
            },
            first_seen_at: row.first_seen_at,
            updated_at: row.updated_at,
            last_source: row.last_source,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EdgeRow {
    source_account_id: String,
    target_account_id: String,
    list_type: String,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    reported_by: Option<String>,
}

impl TryFrom<EdgeRow> for EdgeRecord {
    type Error = BackendError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        let list_type = ListType::from_str(&row.list_type)
            .map_err(|err| BackendError::Permanent(err.to_string()))?;
        Ok(EdgeRecord {
            source_account_id: row.source_account_id,
            target_account_id: row.target_account_id,
            list_type,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            reported_by: row.reported_by,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    account_id: String,
    status: String,
    last_attempt_at: DateTime<Utc>,
    exhausted_at: Option<DateTime<Utc>>,
}

/// Lock/contention and connection-level problems are worth retrying; anything
/// the database rejected on its merits is not.
pub fn classify_sqlx_error(err: sqlx::Error) -> BackendError {
    let transient = match &err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let busy_code = matches!(
                code.as_deref(),
                Some("5" | "6" | "261" | "262" | "517" | "773")
            );
            let message = db.message().to_ascii_lowercase();
            busy_code || message.contains("database is locked") || message.contains("busy")
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        _ => false,
    };
    if transient {
        BackendError::Transient(err.to_string())
    } else {
        BackendError::Permanent(err.to_string())
    }
}

impl SqliteBackend {
    /// Opens (creating if needed) a WAL-mode database. Writers wait up to the
    /// busy timeout inside SQLite before the store's own retry loop kicks in.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|err| StoreError::Backend(classify_sqlx_error(err)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|err| StoreError::Backend(classify_sqlx_error(err)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(classify_sqlx_error(err.into())))
    }
}

#[async_trait]
impl ShadowBackend for SqliteBackend {
    async fn merge_profile(
        &self,
        account_id: &str,
        fields: &ProfileFields,
        source: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ShadowProfile, BackendError> {
        let sql = format!(
            r#"
            INSERT INTO shadow_profiles
                (account_id, username, display_name, bio, location, website, joined_date,
                 avatar_present, followers_count, following_count, listed_in_following,
                 listed_in_followers, first_seen_at, updated_at, last_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, ?14)
            ON CONFLICT(account_id) DO UPDATE SET
                username = COALESCE(excluded.username, shadow_profiles.username),
                display_name = COALESCE(excluded.display_name, shadow_profiles.display_name),
                bio = COALESCE(excluded.bio, shadow_profiles.bio),
                location = COALESCE(excluded.location, shadow_profiles.location),
                website = COALESCE(excluded.website, shadow_profiles.website),
                joined_date = COALESCE(excluded.joined_date, shadow_profiles.joined_date),
                avatar_present = COALESCE(excluded.avatar_present, shadow_profiles.avatar_present),
                followers_count = COALESCE(excluded.followers_count, shadow_profiles.followers_count),
                following_count = COALESCE(excluded.following_count, shadow_profiles.following_count),
                listed_in_following = COALESCE(excluded.listed_in_following, shadow_profiles.listed_in_following),
                listed_in_followers = COALESCE(excluded.listed_in_followers, shadow_profiles.listed_in_followers),
                updated_at = excluded.updated_at,
                last_source = COALESCE(excluded.last_source, shadow_profiles.last_source)
            RETURNING {PROFILE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, ProfileRow>(&sql)
            .bind(account_id)
            .bind(&fields.username)
            .bind(&fields.display_name)
            .bind(&fields.bio)
            .bind(&fields.location)
            .bind(&fields.website)
            .bind(fields.joined_date)
            .bind(fields.avatar_present)
            .bind(fields.followers_count)
            .bind(fields.following_count)
            .bind(fields.listed_in_following)
            .bind(fields.listed_in_followers)
            .bind(at)
            .bind(source)
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(row.into())
    }

    async fn upsert_edge(
        &self,
        key: &EdgeKey,
        reported_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<EdgeRecord, BackendError> {
        let row = sqlx::query_as::<_, EdgeRow>(
            r#"
            INSERT INTO shadow_edges
                (source_account_id, target_account_id, list_type, first_seen_at, last_seen_at, reported_by)
            VALUES (?1, ?2, ?3, ?4, ?4, ?5)
            ON CONFLICT(source_account_id, target_account_id, list_type) DO UPDATE SET
                last_seen_at = excluded.last_seen_at
            RETURNING source_account_id, target_account_id, list_type, first_seen_at, last_seen_at, reported_by
            "#,
        )
        .bind(&key.source_account_id)
        .bind(&key.target_account_id)
        .bind(key.list_type.as_str())
        .bind(at)
        .bind(reported_by)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        row.try_into()
    }

    async fn load_profile(&self, account_id: &str) -> Result<Option<ShadowProfile>, BackendError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM shadow_profiles WHERE account_id = ?1");
        let row = sqlx::query_as::<_, ProfileRow>(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(row.map(ShadowProfile::from))
    }

    async fn edges_for(&self, account_id: &str) -> Result<Vec<EdgeRecord>, BackendError> {
        let rows = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT source_account_id, target_account_id, list_type, first_seen_at, last_seen_at, reported_by
            FROM shadow_edges
            WHERE source_account_id = ?1
            ORDER BY list_type, target_account_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        rows.into_iter().map(EdgeRecord::try_from).collect()
    }

    async fn record_attempt(&self, attempt: &AttemptRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO enrichment_attempts (account_id, status, last_attempt_at, exhausted_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account_id) DO UPDATE SET
                status = excluded.status,
                last_attempt_at = excluded.last_attempt_at,
                exhausted_at = excluded.exhausted_at
            "#,
        )
        .bind(&attempt.account_id)
        .bind(&attempt.status)
        .bind(attempt.last_attempt_at)
        .bind(attempt.exhausted_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn load_attempt(&self, account_id: &str) -> Result<Option<AttemptRecord>, BackendError> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT account_id, status, last_attempt_at, exhausted_at
            FROM enrichment_attempts
            WHERE account_id = ?1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(row.map(|r| AttemptRecord {
            account_id: r.account_id,
            status: r.status,
            last_attempt_at: r.last_attempt_at,
            exhausted_at: r.exhausted_at,
        }))
    }

    async fn candidate_accounts(&self, limit: usize) -> Result<Vec<String>, BackendError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT account_id FROM (
                SELECT DISTINCT e.target_account_id AS account_id, 0 AS priority
                FROM shadow_edges e
                LEFT JOIN shadow_profiles p ON p.account_id = e.target_account_id
                WHERE p.account_id IS NULL
                UNION
                SELECT account_id, 1 AS priority
                FROM shadow_profiles
                WHERE location IS NULL
                   OR (website IS NULL AND joined_date IS NULL)
                   OR avatar_present IS NULL
                   OR followers_count IS NULL
                   OR following_count IS NULL
            )
            ORDER BY priority, account_id
            LIMIT ?1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(ids)
    }

    async fn all_profiles(&self) -> Result<Vec<ShadowProfile>, BackendError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM shadow_profiles ORDER BY account_id");
        let rows = sqlx::query_as::<_, ProfileRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(rows.into_iter().map(ShadowProfile::from).collect())
    }

    async fn all_edges(&self) -> Result<Vec<EdgeRecord>, BackendError> {
        let rows = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT source_account_id, target_account_id, list_type, first_seen_at, last_seen_at, reported_by
            FROM shadow_edges
            ORDER BY source_account_id, list_type, target_account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        rows.into_iter().map(EdgeRecord::try_from).collect()
    }
}
