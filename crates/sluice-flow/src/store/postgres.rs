//! Postgres-backed store.
//!
//! Atomicity comes from the database:
//!
//! - dataset get-or-create is `INSERT .. ON CONFLICT (name) DO NOTHING` with a
//!   read-back, so racing submissions collapse onto one row
//! - file ordinals are assigned while holding the dataset row lock
//! - status and counter changes are conditional `UPDATE .. WHERE` statements
//!
//! Schema lives in `migrations/`; [`PostgresStore::migrate`] applies it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use sluice_core::{DatasetId, FileId, RequestId};

use super::{validate_transition, CasResult, CounterUpdate, Store};
use crate::dataset::{
    Dataset, DatasetFile, DatasetStatus, DatasetTotals, NewDataset, NewDatasetFile,
};
use crate::error::{Error, Result};
use crate::request::{FileOutcome, TransformRequest, TransformStatus, TransformationResult};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const TERMINAL_STATUSES: [&str; 3] = ["complete", "fatal", "canceled"];

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Store backed by a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::storage_with_source(context, e)
}

fn dataset_from_row(row: &PgRow) -> Result<Dataset> {
    let status: String = row.try_get("lookup_status").map_err(db_err("read dataset"))?;
    Ok(Dataset {
        id: DatasetId::new(row.try_get("id").map_err(db_err("read dataset"))?),
        name: row.try_get("name").map_err(db_err("read dataset"))?,
        did_finder: row.try_get("did_finder").map_err(db_err("read dataset"))?,
        lookup_status: status.parse()?,
        n_files: row.try_get("n_files").map_err(db_err("read dataset"))?,
        known_files: row.try_get("known_files").map_err(db_err("read dataset"))?,
        size: row.try_get("size").map_err(db_err("read dataset"))?,
        events: row.try_get("events").map_err(db_err("read dataset"))?,
        last_used: row.try_get("last_used").map_err(db_err("read dataset"))?,
        last_updated: row.try_get("last_updated").map_err(db_err("read dataset"))?,
    })
}

fn file_from_row(row: &PgRow) -> Result<DatasetFile> {
    Ok(DatasetFile {
        id: FileId::new(row.try_get("id").map_err(db_err("read file"))?),
        dataset_id: DatasetId::new(row.try_get("dataset_id").map_err(db_err("read file"))?),
        ordinal: row.try_get("ordinal").map_err(db_err("read file"))?,
        paths: row.try_get("paths").map_err(db_err("read file"))?,
        adler32: row.try_get("adler32").map_err(db_err("read file"))?,
        file_size: row.try_get("file_size").map_err(db_err("read file"))?,
        file_events: row.try_get("file_events").map_err(db_err("read file"))?,
    })
}

fn request_from_row(row: &PgRow) -> Result<TransformRequest> {
    let read = db_err("read request");
    let request_id: String = row.try_get("request_id").map_err(read)?;
    let workers: i32 = row.try_get("workers").map_err(db_err("read request"))?;
    let destination: String = row
        .try_get("result_destination")
        .map_err(db_err("read request"))?;
    let format: String = row.try_get("result_format").map_err(db_err("read request"))?;
    let status: String = row.try_get("status").map_err(db_err("read request"))?;
    Ok(TransformRequest {
        request_id: request_id.parse()?,
        title: row.try_get("title").map_err(db_err("read request"))?,
        did: row.try_get("did").map_err(db_err("read request"))?,
        did_id: DatasetId::new(row.try_get("did_id").map_err(db_err("read request"))?),
        selection: row.try_get("selection").map_err(db_err("read request"))?,
        tree_name: row.try_get("tree_name").map_err(db_err("read request"))?,
        image: row.try_get("image").map_err(db_err("read request"))?,
        workers: u32::try_from(workers)
            .map_err(|_| Error::serialization(format!("negative worker count {workers}")))?,
        result_destination: destination.parse()?,
        result_format: format.parse()?,
        status: status.parse()?,
        files: row.try_get("files").map_err(db_err("read request"))?,
        files_completed: row.try_get("files_completed").map_err(db_err("read request"))?,
        files_failed: row.try_get("files_failed").map_err(db_err("read request"))?,
        submit_time: row.try_get("submit_time").map_err(db_err("read request"))?,
        finish_time: row.try_get("finish_time").map_err(db_err("read request"))?,
        generated_code_cm: row
            .try_get("generated_code_cm")
            .map_err(db_err("read request"))?,
        transformer_language: row
            .try_get("transformer_language")
            .map_err(db_err("read request"))?,
        transformer_command: row
            .try_get("transformer_command")
            .map_err(db_err("read request"))?,
        failure_description: row
            .try_get("failure_description")
            .map_err(db_err("read request"))?,
    })
}

fn result_from_row(row: &PgRow) -> Result<TransformationResult> {
    let request_id: String = row.try_get("request_id").map_err(db_err("read result"))?;
    let status: String = row.try_get("status").map_err(db_err("read result"))?;
    let status = match status.as_str() {
        "success" => FileOutcome::Success,
        "failure" => FileOutcome::Failure,
        other => return Err(Error::serialization(format!("unknown file outcome '{other}'"))),
    };
    Ok(TransformationResult {
        request_id: request_id.parse()?,
        file_id: FileId::new(row.try_get("file_id").map_err(db_err("read result"))?),
        file_path: row.try_get("file_path").map_err(db_err("read result"))?,
        status,
        total_time: row.try_get("total_time").map_err(db_err("read result"))?,
        total_events: row.try_get("total_events").map_err(db_err("read result"))?,
        total_bytes: row.try_get("total_bytes").map_err(db_err("read result"))?,
        avg_rate: row.try_get("avg_rate").map_err(db_err("read result"))?,
        recorded_at: row.try_get("recorded_at").map_err(db_err("read result"))?,
    })
}

impl PostgresStore {
    /// Connects with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, &PoolConfig::default()).await
    }

    /// Connects with explicit pool settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are inconsistent or the database is
    /// unreachable.
    pub async fn connect_with(database_url: &str, config: &PoolConfig) -> Result<Self> {
        if config.max_connections == 0 || config.max_connections < config.min_connections {
            return Err(Error::configuration(
                "max_connections must be positive and >= min_connections",
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(db_err("connect to database"))?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema. Safe to run repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err("apply schema"))?;
        Ok(())
    }

    async fn insert_files(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: DatasetId,
        start: i64,
        files: &[NewDatasetFile],
    ) -> Result<Vec<DatasetFile>> {
        let mut stored = Vec::with_capacity(files.len());
        for (offset, file) in (0_i64..).zip(files) {
            let row = sqlx::query(
                "INSERT INTO dataset_files (dataset_id, ordinal, paths, adler32, file_size, file_events) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
            )
            .bind(id.get())
            .bind(start + offset)
            .bind(&file.paths)
            .bind(&file.adler32)
            .bind(file.file_size)
            .bind(file.file_events)
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err("insert dataset file"))?;
            stored.push(file_from_row(&row)?);
        }
        let known = start + i64::try_from(files.len()).unwrap_or(i64::MAX);
        sqlx::query("UPDATE datasets SET known_files = $2, last_updated = now() WHERE id = $1")
            .bind(id.get())
            .bind(known)
            .execute(&mut **tx)
            .await
            .map_err(db_err("update known_files"))?;
        Ok(stored)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_or_create_dataset(&self, new: &NewDataset) -> Result<(Dataset, bool)> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        let n_files = if new.lookup_status == DatasetStatus::Complete {
            i64::try_from(new.files.len()).unwrap_or(i64::MAX)
        } else {
            0
        };
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO datasets (name, did_finder, lookup_status, n_files, last_used, last_updated) \
             VALUES ($1, $2, $3, $4, now(), now()) \
             ON CONFLICT (name) DO NOTHING RETURNING id",
        )
        .bind(&new.name)
        .bind(&new.did_finder)
        .bind(new.lookup_status.as_str())
        .bind(n_files)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("insert dataset"))?;

        let created = inserted.is_some();
        if let Some(id) = inserted {
            Self::insert_files(&mut tx, DatasetId::new(id), 0, &new.files).await?;
        }
        tx.commit().await.map_err(db_err("commit"))?;

        let dataset = self
            .find_dataset_by_name(&new.name)
            .await?
            .ok_or_else(|| Error::storage(format!("dataset '{}' vanished after insert", new.name)))?;
        Ok((dataset, created))
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<Option<Dataset>> {
        sqlx::query("SELECT * FROM datasets WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get dataset"))?
            .as_ref()
            .map(dataset_from_row)
            .transpose()
    }

    async fn find_dataset_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        sqlx::query("SELECT * FROM datasets WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("find dataset"))?
            .as_ref()
            .map(dataset_from_row)
            .transpose()
    }

    async fn touch_dataset(&self, id: DatasetId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE datasets SET last_used = $2 WHERE id = $1")
            .bind(id.get())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err("touch dataset"))?;
        Ok(())
    }

    async fn cas_dataset_status(
        &self,
        id: DatasetId,
        expected: DatasetStatus,
        target: DatasetStatus,
    ) -> Result<CasResult<DatasetStatus>> {
        let updated = sqlx::query(
            "UPDATE datasets SET lookup_status = $3, last_updated = now() \
             WHERE id = $1 AND lookup_status = $2",
        )
        .bind(id.get())
        .bind(expected.as_str())
        .bind(target.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("cas dataset status"))?;
        if updated.rows_affected() == 1 {
            return Ok(CasResult::Success);
        }
        Ok(match self.get_dataset(id).await? {
            Some(dataset) => CasResult::Mismatch {
                actual: dataset.lookup_status,
            },
            None => CasResult::NotFound,
        })
    }

    async fn append_dataset_files(
        &self,
        id: DatasetId,
        files: &[NewDatasetFile],
    ) -> Result<Vec<DatasetFile>> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        let known: Option<i64> =
            sqlx::query_scalar("SELECT known_files FROM datasets WHERE id = $1 FOR UPDATE")
                .bind(id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("lock dataset"))?;
        let Some(start) = known else {
            return Err(Error::DatasetNotFound { dataset_id: id });
        };
        let stored = Self::insert_files(&mut tx, id, start, files).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(stored)
    }

    async fn dataset_files(&self, id: DatasetId, from: i64, to: i64) -> Result<Vec<DatasetFile>> {
        sqlx::query(
            "SELECT * FROM dataset_files WHERE dataset_id = $1 AND ordinal >= $2 AND ordinal < $3 \
             ORDER BY ordinal",
        )
        .bind(id.get())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list dataset files"))?
        .iter()
        .map(file_from_row)
        .collect()
    }

    async fn complete_dataset(
        &self,
        id: DatasetId,
        totals: DatasetTotals,
    ) -> Result<Option<Dataset>> {
        sqlx::query(
            "UPDATE datasets SET lookup_status = 'complete', n_files = $2, size = $3, events = $4, \
             last_updated = now() WHERE id = $1 RETURNING *",
        )
        .bind(id.get())
        .bind(totals.files)
        .bind(totals.size)
        .bind(totals.events)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("complete dataset"))?
        .as_ref()
        .map(dataset_from_row)
        .transpose()
    }

    async fn insert_request(&self, request: &TransformRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO requests (request_id, title, did, did_id, selection, tree_name, image, \
             workers, result_destination, result_format, status, files, files_completed, \
             files_failed, submit_time, finish_time, generated_code_cm, transformer_language, \
             transformer_command, failure_description) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20)",
        )
        .bind(request.request_id.to_string())
        .bind(&request.title)
        .bind(&request.did)
        .bind(request.did_id.get())
        .bind(&request.selection)
        .bind(&request.tree_name)
        .bind(&request.image)
        .bind(i32::try_from(request.workers).unwrap_or(i32::MAX))
        .bind(request.result_destination.as_str())
        .bind(request.result_format.as_str())
        .bind(request.status.as_str())
        .bind(request.files)
        .bind(request.files_completed)
        .bind(request.files_failed)
        .bind(request.submit_time)
        .bind(request.finish_time)
        .bind(&request.generated_code_cm)
        .bind(&request.transformer_language)
        .bind(&request.transformer_command)
        .bind(&request.failure_description)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert request"))?;
        Ok(())
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<TransformRequest>> {
        sqlx::query("SELECT * FROM requests WHERE request_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get request"))?
            .as_ref()
            .map(request_from_row)
            .transpose()
    }

    async fn requests_for_dataset(
        &self,
        dataset: DatasetId,
        statuses: &[TransformStatus],
    ) -> Result<Vec<TransformRequest>> {
        let statuses: Vec<&str> = statuses.iter().map(TransformStatus::as_str).collect();
        sqlx::query(
            "SELECT * FROM requests WHERE did_id = $1 AND status = ANY($2) ORDER BY request_id",
        )
        .bind(dataset.get())
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list requests"))?
        .iter()
        .map(request_from_row)
        .collect()
    }

    async fn cas_request_status(
        &self,
        id: &RequestId,
        expected: TransformStatus,
        target: TransformStatus,
        failure_description: Option<String>,
    ) -> Result<CasResult<TransformStatus>> {
        validate_transition(expected, target)?;
        let updated = sqlx::query(
            "UPDATE requests SET status = $3, \
             finish_time = CASE WHEN $4 THEN now() ELSE finish_time END, \
             failure_description = COALESCE($5, failure_description) \
             WHERE request_id = $1 AND status = $2",
        )
        .bind(id.to_string())
        .bind(expected.as_str())
        .bind(target.as_str())
        .bind(target.is_terminal())
        .bind(failure_description)
        .execute(&self.pool)
        .await
        .map_err(db_err("cas request status"))?;
        if updated.rows_affected() == 1 {
            return Ok(CasResult::Success);
        }
        Ok(match self.get_request(id).await? {
            Some(request) => CasResult::Mismatch {
                actual: request.status,
            },
            None => CasResult::NotFound,
        })
    }

    async fn cas_request_files(
        &self,
        id: &RequestId,
        expected: i64,
        new: i64,
    ) -> Result<CasResult<TransformRequest>> {
        let updated = sqlx::query(
            "UPDATE requests SET files = $3 \
             WHERE request_id = $1 AND files = $2 AND status <> ALL($4)",
        )
        .bind(id.to_string())
        .bind(expected)
        .bind(new)
        .bind(&TERMINAL_STATUSES[..])
        .execute(&self.pool)
        .await
        .map_err(db_err("cas request files"))?;
        if updated.rows_affected() == 1 {
            return Ok(CasResult::Success);
        }
        Ok(match self.get_request(id).await? {
            Some(actual) => CasResult::Mismatch { actual },
            None => CasResult::NotFound,
        })
    }

    async fn increment_file_counter(
        &self,
        id: &RequestId,
        outcome: FileOutcome,
    ) -> Result<CounterUpdate> {
        let (completed, failed) = match outcome {
            FileOutcome::Success => (1_i64, 0_i64),
            FileOutcome::Failure => (0, 1),
        };
        let row = sqlx::query(
            "UPDATE requests SET files_completed = files_completed + $2, \
             files_failed = files_failed + $3 \
             WHERE request_id = $1 AND status <> ALL($4) \
             AND files_completed + files_failed < files \
             RETURNING *",
        )
        .bind(id.to_string())
        .bind(completed)
        .bind(failed)
        .bind(&TERMINAL_STATUSES[..])
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("increment file counter"))?;
        if let Some(row) = row {
            return Ok(CounterUpdate::Applied(request_from_row(&row)?));
        }
        Ok(match self.get_request(id).await? {
            None => CounterUpdate::NotFound,
            Some(request) if request.status.is_terminal() => {
                CounterUpdate::Terminal(request.status)
            }
            Some(request) => CounterUpdate::Saturated(request),
        })
    }

    async fn record_transformation_result(&self, result: &TransformationResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO transformation_results (request_id, file_id, file_path, status, \
             total_time, total_events, total_bytes, avg_rate, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(result.request_id.to_string())
        .bind(result.file_id.get())
        .bind(&result.file_path)
        .bind(result.status.as_str())
        .bind(result.total_time)
        .bind(result.total_events)
        .bind(result.total_bytes)
        .bind(result.avg_rate)
        .bind(result.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("record transformation result"))?;
        Ok(())
    }

    async fn transformation_results(&self, id: &RequestId) -> Result<Vec<TransformationResult>> {
        sqlx::query("SELECT * FROM transformation_results WHERE request_id = $1 ORDER BY id")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list transformation results"))?
            .iter()
            .map(result_from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_table() {
        for table in ["datasets", "dataset_files", "requests", "transformation_results"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }

    #[tokio::test]
    async fn inconsistent_pool_config_is_rejected() {
        let config = PoolConfig {
            max_connections: 1,
            min_connections: 2,
            ..PoolConfig::default()
        };
        let err = PostgresStore::connect_with("postgres://localhost/sluice", &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
