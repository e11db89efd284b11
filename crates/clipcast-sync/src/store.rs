//! Postgres persistence for members and activities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clipcast_core::{Activity, ActivityRecord, Member, PendingActivity};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::QueryAs;
use sqlx::{FromRow, PgPool, Postgres};
use thiserror::Error;

/// SQLSTATEs that mean the statement does not fit the schema.
const SCHEMA_SQLSTATES: &[&str] = &[
    "42P10", // no unique constraint matches the ON CONFLICT target
    "42P01", // undefined table
    "42703", // undefined column
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema mismatch: {0}")]
    Schema(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db
                .code()
                .is_some_and(|code| SCHEMA_SQLSTATES.iter().any(|s| *s == code))
            {
                return StoreError::Schema(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// A record that can be merged into `TABLE` with a single upsert statement.
pub trait UpsertRecord: Sync {
    const TABLE: &'static str;

    /// Columns written by the upsert, in bind order.
    fn columns() -> &'static [&'static str];

    fn bind_values<'q, O>(
        &'q self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> QueryAs<'q, Postgres, O, PgArguments>;
}

impl UpsertRecord for ActivityRecord {
    const TABLE: &'static str = "activities";

    fn columns() -> &'static [&'static str] {
        &["post_id", "video_url", "description", "author_id", "posted_at"]
    }

    fn bind_values<'q, O>(
        &'q self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> QueryAs<'q, Postgres, O, PgArguments> {
        query
            .bind(self.post_id.as_str())
            .bind(self.video_url.as_str())
            .bind(self.description.as_deref())
            .bind(self.author_id.as_str())
            .bind(self.posted_at)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Builds `INSERT .. ON CONFLICT (constraint) DO UPDATE .. RETURNING *`.
///
/// Every column outside the constraint is overwritten with the incoming value. Constraint
/// columns must be a non-empty subset of `columns`.
pub fn upsert_sql(table: &str, columns: &[&str], constraint: &[&str]) -> Result<String, StoreError> {
    if let Some(bad) = std::iter::once(&table)
        .chain(columns.iter())
        .chain(constraint.iter())
        .find(|name| !is_identifier(name))
    {
        return Err(StoreError::Schema(format!("invalid identifier {bad:?}")));
    }
    if columns.is_empty() {
        return Err(StoreError::Schema(format!("no columns to upsert into {table}")));
    }
    if constraint.is_empty() {
        return Err(StoreError::Schema(format!(
            "upsert into {table} needs at least one constraint column"
        )));
    }
    if let Some(missing) = constraint.iter().find(|c| !columns.contains(*c)) {
        return Err(StoreError::Schema(format!(
            "constraint column {missing} is not written by the upsert into {table}"
        )));
    }

    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut updates = columns
        .iter()
        .filter(|c| !constraint.contains(*c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>();
    if updates.is_empty() {
        // DO NOTHING would return no row.
        updates.push(format!("{0} = EXCLUDED.{0}", constraint[0]));
    }

    Ok(format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT ({}) DO UPDATE SET {} RETURNING *",
        columns.join(", "),
        constraint.join(", "),
        updates.join(", ")
    ))
}

/// Atomic insert-or-update of `record` keyed on `constraint`, returning the merged row.
pub async fn upsert<R, O>(pool: &PgPool, record: &R, constraint: &[&str]) -> Result<O, StoreError>
where
    R: UpsertRecord,
    O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let sql = upsert_sql(R::TABLE, R::columns(), constraint)?;
    let row = record
        .bind_values(sqlx::query_as::<_, O>(&sql))
        .fetch_one(pool)
        .await?;
    Ok(row)
}

#[derive(Debug, FromRow)]
pub struct ActivityRow {
    pub post_id: String,
    pub video_url: String,
    pub description: Option<String>,
    pub author_id: String,
    pub posted_at: DateTime<Utc>,
    pub is_published: bool,
}

impl From<ActivityRow> for Activity {
    fn from(row: ActivityRow) -> Self {
        Self {
            post_id: row.post_id,
            video_url: row.video_url,
            description: row.description,
            author_id: row.author_id,
            posted_at: row.posted_at,
            is_published: row.is_published,
        }
    }
}

#[derive(Debug, FromRow)]
struct MemberRow {
    user_id: String,
    url: String,
    name: String,
}

#[derive(Debug, FromRow)]
struct PendingRow {
    post_id: String,
    video_url: String,
    description: Option<String>,
    posted_at: DateTime<Utc>,
    member_name: String,
}

/// Storage operations shared by ingestion and the publisher.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn list_members(&self) -> Result<Vec<Member>, StoreError>;

    /// Merges `record` keyed on `post_id`; `is_published` is left untouched.
    async fn upsert_activity(&self, record: &ActivityRecord) -> Result<Activity, StoreError>;

    /// Oldest unpublished activity whose author is a member.
    async fn next_pending(&self) -> Result<Option<PendingActivity>, StoreError>;

    /// Flips `is_published` to true. Returns false when the row was already published or
    /// does not exist.
    async fn mark_published(&self, post_id: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgActivityStore {
    pool: PgPool,
}

impl PgActivityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for PgActivityStore {
    async fn list_members(&self) -> Result<Vec<Member>, StoreError> {
        let rows = sqlx::query_as::<_, MemberRow>(
            "SELECT user_id, url, name FROM members ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Member {
                user_id: r.user_id,
                url: r.url,
                name: r.name,
            })
            .collect())
    }

    async fn upsert_activity(&self, record: &ActivityRecord) -> Result<Activity, StoreError> {
        let row: ActivityRow = upsert(&self.pool, record, &["post_id"]).await?;
        Ok(row.into())
    }

    async fn next_pending(&self) -> Result<Option<PendingActivity>, StoreError> {
        let row = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT a.post_id, a.video_url, a.description, a.posted_at, m.name AS member_name
            FROM activities a
            JOIN members m ON a.author_id = m.user_id
            WHERE a.is_published = FALSE
            ORDER BY a.posted_at ASC, a.post_id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| PendingActivity {
            post_id: r.post_id,
            video_url: r.video_url,
            description: r.description,
            posted_at: r.posted_at,
            member_name: r.member_name,
        }))
    }

    async fn mark_published(&self, post_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE activities SET is_published = TRUE WHERE post_id = $1 AND is_published = FALSE",
        )
        .bind(post_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryActivityStore;
    use super::*;
    use chrono::TimeZone;

    fn record(post_id: &str, desc: &str, url: &str) -> ActivityRecord {
        ActivityRecord {
            post_id: post_id.to_string(),
            video_url: url.to_string(),
            description: Some(desc.to_string()),
            author_id: "u1".to_string(),
            posted_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn upsert_sql_updates_every_non_key_column() {
        let sql = upsert_sql(
            ActivityRecord::TABLE,
            ActivityRecord::columns(),
            &["post_id"],
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO activities (post_id, video_url, description, author_id, posted_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (post_id) DO UPDATE SET \
             video_url = EXCLUDED.video_url, description = EXCLUDED.description, \
             author_id = EXCLUDED.author_id, posted_at = EXCLUDED.posted_at RETURNING *"
        );
        assert!(!sql.contains("is_published"));
    }

    #[test]
    fn upsert_sql_rejects_constraint_outside_record() {
        let err = upsert_sql("activities", &["post_id", "video_url"], &["author_id"]).unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));
        assert!(matches!(
            upsert_sql("activities", &["post_id"], &[]),
            Err(StoreError::Schema(_))
        ));
    }

    #[test]
    fn upsert_sql_rejects_unsafe_identifiers() {
        assert!(matches!(
            upsert_sql("activities; drop table members", &["post_id"], &["post_id"]),
            Err(StoreError::Schema(_))
        ));
        assert!(matches!(
            upsert_sql("activities", &["Post_Id"], &["Post_Id"]),
            Err(StoreError::Schema(_))
        ));
    }

    #[test]
    fn upsert_sql_with_only_key_columns_still_returns_row() {
        let sql = upsert_sql("tags", &["name"], &["name"]).unwrap();
        assert!(sql.ends_with("DO UPDATE SET name = EXCLUDED.name RETURNING *"));
    }

    #[tokio::test]
    async fn reupsert_keeps_one_row_with_latest_values() {
        let store = MemoryActivityStore::default();
        store
            .upsert_activity(&record("p1", "first", "https://a.test/1.mp4"))
            .await
            .unwrap();
        let merged = store
            .upsert_activity(&record("p1", "second", "https://a.test/1b.mp4"))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(merged.description.as_deref(), Some("second"));
        assert_eq!(merged.video_url, "https://a.test/1b.mp4");
    }

    #[tokio::test]
    async fn reupsert_never_unpublishes() {
        let store = MemoryActivityStore::default();
        store
            .upsert_activity(&record("p1", "first", "https://a.test/1.mp4"))
            .await
            .unwrap();
        assert!(store.mark_published("p1").await.unwrap());
        assert!(!store.mark_published("p1").await.unwrap());

        let merged = store
            .upsert_activity(&record("p1", "edited", "https://a.test/1.mp4"))
            .await
            .unwrap();
        assert!(merged.is_published);
    }
}
