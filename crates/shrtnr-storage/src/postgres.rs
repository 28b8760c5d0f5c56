use crate::aggregator::{DeleteAggregator, DeleteSink};
use crate::config::PostgresConfig;
use crate::MAX_CODE_ATTEMPTS;
use async_trait::async_trait;
use shrtnr_core::{
    BatchEntry, BatchOutcome, LinkStore, Result, ShortCode, StorageError, UrlRecord,
};
use shrtnr_generator::{Generator, RandomGenerator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgExecutor, PgPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../ddl/postgres/urls.sql");

/// PostgreSQL implementation of [`LinkStore`].
///
/// One row per link in `urls`; the long URL carries a unique constraint and
/// deletes only flip the `deleted` flag. Delete requests go through a
/// [`DeleteAggregator`] and reach the table in batches.
pub struct PostgresStore<G = RandomGenerator> {
    pool: PgPool,
    generator: G,
    statement_timeout: Duration,
    aggregator: DeleteAggregator,
}

/// Outcome of inserting one row under a freshly generated code.
enum Insert {
    Created(ShortCode),
    DuplicateLong,
}

impl PostgresStore<RandomGenerator> {
    /// Opens a pool, applies the schema and starts the delete aggregator.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        Self::connect_with_generator(config, RandomGenerator::new()).await
    }
}

impl<G: Generator> PostgresStore<G> {
    pub async fn connect_with_generator(config: PostgresConfig, generator: G) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.statement_timeout)
            .connect(&config.dsn)
            .await
            .map_err(map_sqlx_error)?;

        Self::from_pool(pool, &config, generator).await
    }

    /// Builds a store on an existing pool. The schema is applied here too.
    pub async fn from_pool(pool: PgPool, config: &PostgresConfig, generator: G) -> Result<Self> {
        migrate(&pool).await?;

        let sink = PgDeleteSink {
            pool: pool.clone(),
            statement_timeout: config.statement_timeout,
        };
        let aggregator = DeleteAggregator::spawn(sink, config.aggregator.clone());

        info!(
            max_connections = config.max_connections,
            statement_timeout_ms = config.statement_timeout.as_millis() as u64,
            "postgres store ready"
        );

        Ok(Self {
            pool,
            generator,
            statement_timeout: config.statement_timeout,
            aggregator,
        })
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the aggregator that batches this store's deletes.
    pub fn aggregator(&self) -> &DeleteAggregator {
        &self.aggregator
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(self.statement_timeout, operation, fut).await
    }

    /// Inserts `long` under a new code, drawing another candidate whenever the
    /// code is already taken.
    async fn insert_with_fresh_code(
        &self,
        conn: &mut PgConnection,
        owner: &str,
        long: &str,
    ) -> Result<Insert> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = self.generator.generate();

            let result = sqlx::query(
                r#"
                INSERT INTO urls (short, long, owner)
                VALUES ($1, $2, $3)
                ON CONFLICT (short) DO NOTHING
                "#,
            )
            .bind(code.as_str())
            .bind(long)
            .bind(owner)
            .execute(&mut *conn)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => return Ok(Insert::Created(code)),
                Ok(_) => debug!(code = %code, attempt, "short code taken; retrying"),
                Err(err) if is_unique_violation(&err) => return Ok(Insert::DuplicateLong),
                Err(err) => return Err(map_sqlx_error(err)),
            }
        }

        Err(StorageError::Operation(format!(
            "no free short code after {MAX_CODE_ATTEMPTS} attempts"
        )))
    }
}

#[async_trait]
impl<G: Generator> LinkStore for PostgresStore<G> {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn put(&self, owner: &str, long: &str) -> Result<ShortCode> {
        self.bounded("put", async {
            let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
            match self.insert_with_fresh_code(&mut conn, owner, long).await? {
                Insert::Created(code) => Ok(code),
                Insert::DuplicateLong => {
                    let existing = lookup_code(&mut *conn, long).await?.ok_or_else(|| {
                        StorageError::NotFound(format!("conflicting row for {long}"))
                    })?;
                    Err(StorageError::DuplicateLink { existing })
                }
            }
        })
        .await
    }

    async fn resolve(&self, code: &ShortCode) -> Result<Option<UrlRecord>> {
        self.bounded("resolve", async {
            let row = sqlx::query(
                r#"
                SELECT long, owner, deleted
                FROM urls
                WHERE short = $1
                "#,
            )
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            let Some(row) = row else {
                return Ok(None);
            };

            Ok(Some(UrlRecord {
                original_url: row.try_get("long").map_err(map_sqlx_error)?,
                owner: row.try_get("owner").map_err(map_sqlx_error)?,
                deleted: row.try_get("deleted").map_err(map_sqlx_error)?,
            }))
        })
        .await
    }

    async fn list_by_owner(&self, owner: &str) -> Result<HashMap<ShortCode, String>> {
        self.bounded("list_by_owner", async {
            let rows = sqlx::query(
                r#"
                SELECT short, long
                FROM urls
                WHERE owner = $1
                  AND NOT deleted
                "#,
            )
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.into_iter()
                .map(|row| -> Result<(ShortCode, String)> {
                    let short: String = row.try_get("short").map_err(map_sqlx_error)?;
                    let long: String = row.try_get("long").map_err(map_sqlx_error)?;
                    Ok((ShortCode::new(short)?, long))
                })
                .collect()
        })
        .await
    }

    async fn put_batch(&self, owner: &str, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        self.bounded("put_batch", async {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            let mut outcomes = Vec::with_capacity(entries.len());

            for entry in entries {
                match self
                    .insert_with_fresh_code(&mut tx, owner, &entry.original_url)
                    .await?
                {
                    Insert::Created(short) => outcomes.push(BatchOutcome {
                        correlation_id: entry.correlation_id,
                        short,
                        created: true,
                    }),
                    Insert::DuplicateLong => {
                        tx.rollback().await.map_err(map_sqlx_error)?;
                        debug!(owner, long = %entry.original_url, "batch rolled back on duplicate");

                        // Not found after rollback: the duplicate came from this batch.
                        return Err(match lookup_code(&self.pool, &entry.original_url).await? {
                            Some(existing) => StorageError::DuplicateLink { existing },
                            None => StorageError::InvalidData(format!(
                                "batch repeats long url {}",
                                entry.original_url
                            )),
                        });
                    }
                }
            }

            tx.commit().await.map_err(map_sqlx_error)?;
            debug!(owner, count = outcomes.len(), "stored link batch");
            Ok(outcomes)
        })
        .await
    }

    async fn delete(&self, owner: &str, codes: Vec<ShortCode>) -> Result<()> {
        self.aggregator.enqueue(owner, codes).await
    }

    async fn count_owners(&self) -> Result<u64> {
        self.bounded("count_owners", async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT owner) FROM urls")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            to_count(count)
        })
        .await
    }

    async fn count_links(&self) -> Result<u64> {
        self.bounded("count_links", async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM urls WHERE NOT deleted")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            to_count(count)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        })
        .await
    }

    async fn shutdown(&self) -> Result<()> {
        // The pool is closed even when draining fails.
        let drained = self.aggregator.shutdown().await;
        self.pool.close().await;
        info!(drained = drained.is_ok(), "postgres store closed");
        drained
    }
}

/// Writes flushed delete batches with one UPDATE per owner.
struct PgDeleteSink {
    pool: PgPool,
    statement_timeout: Duration,
}

#[async_trait]
impl DeleteSink for PgDeleteSink {
    async fn soft_delete(&self, owner: &str, codes: &[ShortCode]) -> Result<u64> {
        let shorts: Vec<String> = codes.iter().map(|c| c.as_str().to_owned()).collect();

        bounded(self.statement_timeout, "soft_delete", async {
            let done = sqlx::query(
                r#"
                UPDATE urls
                SET deleted = TRUE
                WHERE owner = $1
                  AND short = ANY($2)
                "#,
            )
            .bind(owner)
            .bind(shorts)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(done.rows_affected())
        })
        .await
    }
}

/// Applies the embedded schema. Safe to run against an initialized database.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;
    debug!("schema applied");
    Ok(())
}

async fn lookup_code<'e, E: PgExecutor<'e>>(executor: E, long: &str) -> Result<Option<ShortCode>> {
    let short: Option<String> = sqlx::query_scalar("SELECT short FROM urls WHERE long = $1")
        .bind(long)
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?;

    short.map(ShortCode::new).transpose()
}

async fn bounded<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(StorageError::Timeout(format!(
            "{operation} exceeded {}ms",
            limit.as_millis()
        )))
    })
}

fn to_count(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StorageError::InvalidData(format!("negative count {value}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}
