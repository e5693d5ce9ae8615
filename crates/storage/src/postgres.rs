//! PostgreSQL [`Store`].
//!
//! One row per `(name, kind)`. Writes are single-statement upserts guarded
//! against a row of the other kind for the same name; a guarded upsert that
//! returns no row is a kind mismatch.

use std::error::Error as _;

use async_trait::async_trait;
use deadpool_postgres::Config;
use deadpool_postgres::ManagerConfig;
use deadpool_postgres::Object;
use deadpool_postgres::Pool;
use deadpool_postgres::PoolError;
use deadpool_postgres::RecyclingMethod;
use deadpool_postgres::Runtime;
use error_stack::Report;
use futures::future::try_join_all;
use metric_types::MetricKind;
use metric_types::Metrics;
use metric_types::Sample;
use metric_types::ValueMetric;
use tokio_postgres::error::SqlState;
use tokio_postgres::GenericClient;
use tokio_postgres::NoTls;
use tokio_postgres::Row;
use tokio_postgres::Statement;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use utils::retry::retry_action;
use utils::retry::RetryError;
use utils::retry::DEFAULT_DELAYS;

use crate::error::StoreError;
use crate::error::StoreResult;
use crate::Store;
use crate::Visitor;

pub const DEFAULT_BATCH_LIMIT: usize = 100;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    delta BIGINT,
    value DOUBLE PRECISION,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (name, kind)
)";

const UPSERT_COUNTER: &str = "INSERT INTO metrics (name, kind, delta, updated_at)
SELECT $1::text, 'counter', $2::bigint, now()
WHERE NOT EXISTS (SELECT 1 FROM metrics WHERE name = $1::text AND kind <> 'counter')
ON CONFLICT (name, kind) DO UPDATE
SET delta = metrics.delta + excluded.delta, updated_at = excluded.updated_at
RETURNING delta";

const UPSERT_GAUGE: &str = "INSERT INTO metrics (name, kind, value, updated_at)
SELECT $1::text, 'gauge', $2::double precision, now()
WHERE NOT EXISTS (SELECT 1 FROM metrics WHERE name = $1::text AND kind <> 'gauge')
ON CONFLICT (name, kind) DO UPDATE
SET value = excluded.value, updated_at = excluded.updated_at
RETURNING value";

const SELECT_ONE: &str = "SELECT kind, delta, value FROM metrics WHERE name = $1 LIMIT 1";

const SELECT_ALL: &str = "SELECT name, kind, delta, value FROM metrics ORDER BY name";

const SELECT_ALL_FOR_UPDATE: &str =
    "SELECT name, kind, delta, value FROM metrics ORDER BY name FOR UPDATE";

const CLEAR_COUNTERS: &str = "UPDATE metrics SET delta = 0, updated_at = now()
WHERE kind = 'counter' AND name = ANY($1::text[])";

pub struct PostgresStore {
    pool: Pool,
    batch_limit: usize,
}

/// Upsert text for values of `kind`.
fn upsert_query(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Counter => UPSERT_COUNTER,
        MetricKind::Gauge => UPSERT_GAUGE,
    }
}

/// Prepared once per pooled connection and reused from its statement cache.
async fn upsert_statement(client: &Object, kind: MetricKind) -> StoreResult<Statement> {
    client
        .prepare_cached(upsert_query(kind))
        .await
        .map_err(pg_error)
}

struct Upserts {
    counter: Statement,
    gauge: Statement,
}

impl Upserts {
    async fn prepare(client: &Object) -> StoreResult<Self> {
        Ok(Self {
            counter: upsert_statement(client, MetricKind::Counter).await?,
            gauge: upsert_statement(client, MetricKind::Gauge).await?,
        })
    }

    fn statement(&self, kind: MetricKind) -> &Statement {
        match kind {
            MetricKind::Counter => &self.counter,
            MetricKind::Gauge => &self.gauge,
        }
    }
}

/// Run one guarded upsert; no returned row means the name is bound to the
/// other kind.
async fn apply_upsert<C: GenericClient + Sync>(
    client: &C,
    statement: &Statement,
    name: &str,
    value: ValueMetric,
) -> StoreResult<ValueMetric> {
    let row = match value {
        ValueMetric::Counter(delta) => client.query_opt(statement, &[&name, &delta]).await,
        ValueMetric::Gauge(gauge) => client.query_opt(statement, &[&name, &gauge]).await,
    }
    .map_err(|e| value_error(e, name, value.kind()))?;

    let Some(row) = row else {
        return Err(Report::new(StoreError::KindMismatch {
            name: name.to_string(),
            bound: other_kind(value.kind()),
            incoming: value.kind(),
        }));
    };
    match value {
        ValueMetric::Counter(_) => row.try_get(0).map(ValueMetric::Counter),
        ValueMetric::Gauge(_) => row.try_get(0).map(ValueMetric::Gauge),
    }
    .map_err(pg_error)
}

impl PostgresStore {
    /// Build the pool, then ping and create the table.
    ///
    /// Connection-class failures are retried with [`DEFAULT_DELAYS`] until
    /// `token` is cancelled.
    pub async fn connect(
        dsn: &str,
        batch_limit: usize,
        token: &CancellationToken,
    ) -> StoreResult<Self> {
        let mut config = Config::new();
        config.url = Some(dsn.to_string());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                Report::new(StoreError::Database {
                    message: format!("invalid database configuration: {e}"),
                })
            })?;

        let store = Self {
            pool,
            batch_limit: batch_limit.max(1),
        };
        retry_action(
            token,
            &DEFAULT_DELAYS,
            || store.bootstrap(),
            &[StoreError::is_retryable],
        )
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => Report::new(StoreError::Connection {
                message: "cancelled before connecting".to_string(),
            }),
            RetryError::Failed(report) => report,
        })?;

        info!(batch_limit = store.batch_limit, "connected to postgres");
        Ok(store)
    }

    async fn bootstrap(&self) -> StoreResult<()> {
        let client = self.client().await?;
        client.batch_execute(CREATE_TABLE).await.map_err(pg_error)
    }

    async fn client(&self) -> StoreResult<Object> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn add(&self, name: &str, value: ValueMetric) -> StoreResult<ValueMetric> {
        if name.is_empty() {
            return Err(Report::new(StoreError::BadName));
        }
        let client = self.client().await?;
        let statement = upsert_statement(&client, value.kind()).await?;
        apply_upsert(&**client, &statement, name, value).await
    }

    async fn get(&self, name: &str) -> StoreResult<ValueMetric> {
        let client = self.client().await?;
        let row = client
            .query_opt(SELECT_ONE, &[&name])
            .await
            .map_err(pg_error)?
            .ok_or_else(|| {
                Report::new(StoreError::NotFound {
                    name: name.to_string(),
                })
            })?;
        decode_value(&row, 0)
    }

    async fn read_all(&self, visit: &mut Visitor<'_>) -> StoreResult<()> {
        let client = self.client().await?;
        let rows = client.query(SELECT_ALL, &[]).await.map_err(pg_error)?;
        for row in &rows {
            let name: String = row.try_get(0).map_err(pg_error)?;
            visit(&name, &decode_value(row, 1)?)?;
        }
        Ok(())
    }

    async fn read_all_and_clear(&self, visit: &mut Visitor<'_>) -> StoreResult<()> {
        let mut client = self.client().await?;
        let pg: &mut tokio_postgres::Client = &mut client;
        let tx = pg.transaction().await.map_err(pg_error)?;
        let rows = tx.query(SELECT_ALL_FOR_UPDATE, &[]).await.map_err(pg_error)?;

        let mut counters = Vec::new();
        for row in &rows {
            let name: String = row.try_get(0).map_err(pg_error)?;
            let value = decode_value(row, 1)?;
            visit(&name, &value)?;
            if value.kind() == MetricKind::Counter {
                counters.push(name);
            }
        }

        if !counters.is_empty() {
            tx.execute(CLEAR_COUNTERS, &[&counters])
                .await
                .map_err(pg_error)?;
        }
        tx.commit().await.map_err(pg_error)
    }

    async fn add_multi(&self, records: Vec<Metrics>) -> StoreResult<Vec<Sample>> {
        let samples = records
            .iter()
            .map(|record| {
                record
                    .to_sample()
                    .map_err(|e| Report::new(StoreError::from_metric(&record.id, e)))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let mut client = self.client().await?;
        let upserts = Upserts::prepare(&client).await?;
        let pg: &mut tokio_postgres::Client = &mut client;
        // an early return drops the transaction, which rolls it back
        let tx = pg.transaction().await.map_err(pg_error)?;

        let mut merged = Vec::with_capacity(samples.len());
        for (index, chunk) in chunks(&samples, self.batch_limit).enumerate() {
            let values = try_join_all(
                chunk
                    .iter()
                    .map(|sample| {
                        let statement = upserts.statement(sample.value.kind());
                        apply_upsert(&tx, statement, &sample.name, sample.value)
                    }),
            )
            .await
            .map_err(|e| e.attach_printable(format!("chunk {index} rolled back")))?;
            debug!(chunk = index, rows = values.len(), "applied metric chunk");
            merged.extend(
                chunk
                    .iter()
                    .zip(values)
                    .map(|(sample, value)| Sample::new(sample.name.clone(), value)),
            );
        }

        tx.commit().await.map_err(pg_error)?;
        Ok(merged)
    }

    async fn ping(&self) -> StoreResult<()> {
        let client = self.client().await?;
        client.batch_execute("SELECT 1").await.map_err(pg_error)
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close();
        Ok(())
    }
}

fn chunks<T>(items: &[T], limit: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(limit.max(1))
}

const fn other_kind(kind: MetricKind) -> MetricKind {
    match kind {
        MetricKind::Counter => MetricKind::Gauge,
        MetricKind::Gauge => MetricKind::Counter,
    }
}

fn decode_value(row: &Row, first: usize) -> StoreResult<ValueMetric> {
    let kind: String = row.try_get(first).map_err(pg_error)?;
    let delta: Option<i64> = row.try_get(first + 1).map_err(pg_error)?;
    let value: Option<f64> = row.try_get(first + 2).map_err(pg_error)?;
    ValueMetric::from_parts(&kind, delta, value).map_err(|e| {
        Report::new(StoreError::Database {
            message: format!("stored row is invalid: {e}"),
        })
    })
}

fn classify(err: &tokio_postgres::Error) -> StoreError {
    let message = err.to_string();
    let io_failure = err
        .source()
        .is_some_and(|source| source.is::<std::io::Error>());
    let connection_class = err
        .code()
        .is_some_and(|code| code.code().starts_with("08"));
    if err.is_closed() || io_failure || connection_class {
        StoreError::Connection { message }
    } else {
        StoreError::Database { message }
    }
}

fn pg_error(err: tokio_postgres::Error) -> Report<StoreError> {
    let context = classify(&err);
    Report::new(err).change_context(context)
}

/// Like [`pg_error`], reporting an out-of-range counter as a bad value.
fn value_error(err: tokio_postgres::Error, name: &str, kind: MetricKind) -> Report<StoreError> {
    if err.code() == Some(&SqlState::NUMERIC_VALUE_OUT_OF_RANGE) {
        return Report::new(err)
            .change_context(StoreError::BadValue {
                kind,
                reason: "counter overflow".to_string(),
            })
            .attach_printable(format!("metric: {name}"));
    }
    pg_error(err)
}

fn pool_error(err: PoolError) -> Report<StoreError> {
    let context = match &err {
        PoolError::Backend(e) => classify(e),
        PoolError::Timeout(_) | PoolError::Closed => StoreError::Connection {
            message: err.to_string(),
        },
        _ => StoreError::Database {
            message: err.to_string(),
        },
    };
    Report::new(err).change_context(context)
}
