// src/state_manager.rs

use crate::models::JobRecord;
use bytes::Bytes;
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Durable storage for the download engine, backed by SQLite.
///
/// Two independent concerns share the connection:
/// - job records (`downloads` table), so the job list survives a restart;
/// - chunk buffers (`chunks` table), keyed by job id, so a paused or
///   interrupted transfer can resume from where it stopped.
///
/// Only the active transfer of a job ever writes that job's chunks, so the
/// store needs nothing stronger than last-write-wins per key.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (or creates) the database file and its tables.
    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// A private, non-durable store. Each call yields an isolated instance.
    pub async fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS downloads (
                        id              TEXT PRIMARY KEY,
                        position        INTEGER NOT NULL,
                        job_data        TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS chunks (
                        job_id          TEXT NOT NULL,
                        seq             INTEGER NOT NULL,
                        data            BLOB NOT NULL,
                        PRIMARY KEY (job_id, seq)
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or updates a job record. New records go to the end of the list;
    /// updates keep their original position.
    pub async fn save_job(&self, job: &JobRecord) -> Result<(), StateError> {
        let job_data = serde_json::to_string(job)?;
        let job_id = job.id.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO downloads (id, position, job_data)
                     VALUES (?1, (SELECT COALESCE(MAX(position), 0) + 1 FROM downloads), ?2)
                     ON CONFLICT(id) DO UPDATE SET job_data = excluded.job_data",
                    params![job_id, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Loads every job record in queueing order.
    pub async fn load_all_jobs(&self) -> Result<Vec<JobRecord>, StateError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT job_data FROM downloads ORDER BY position")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for job_data in rows {
            jobs.push(serde_json::from_str(&job_data)?);
        }
        Ok(jobs)
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), StateError> {
        let job_id = job_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM downloads WHERE id = ?1", params![job_id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Returns the persisted chunks of a job in arrival order, or `None` when
    /// nothing has been stored for it.
    pub async fn get_chunks(&self, job_id: &str) -> Result<Option<Vec<Bytes>>, StateError> {
        let job_id = job_id.to_string();
        let chunks = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM chunks WHERE job_id = ?1 ORDER BY seq")?;
                let chunks = stmt
                    .query_map(params![job_id], |row| row.get::<_, Vec<u8>>(0))?
                    .collect::<Result<Vec<Vec<u8>>, rusqlite::Error>>()?;
                Ok(chunks)
            })
            .await?;

        if chunks.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunks.into_iter().map(Bytes::from).collect()))
        }
    }

    /// Replaces the whole chunk list of a job.
    pub async fn set_chunks(&self, job_id: &str, chunks: &[Bytes]) -> Result<(), StateError> {
        let job_id = job_id.to_string();
        let chunks: Vec<Bytes> = chunks.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM chunks WHERE job_id = ?1", params![job_id])?;
                {
                    let mut stmt =
                        tx.prepare("INSERT INTO chunks (job_id, seq, data) VALUES (?1, ?2, ?3)")?;
                    for (seq, chunk) in chunks.iter().enumerate() {
                        stmt.execute(params![job_id, seq as i64, &chunk[..]])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Stores chunk number `seq` of a job. Equivalent to `set_chunks` with the
    /// previously stored list extended by `chunk`, without rewriting it.
    pub async fn append_chunk(&self, job_id: &str, seq: u64, chunk: Bytes) -> Result<(), StateError> {
        let job_id = job_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO chunks (job_id, seq, data) VALUES (?1, ?2, ?3)",
                    params![job_id, seq as i64, &chunk[..]],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn remove_chunks(&self, job_id: &str) -> Result<(), StateError> {
        let job_id = job_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM chunks WHERE job_id = ?1", params![job_id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Total number of persisted bytes for a job.
    pub async fn chunk_bytes(&self, job_id: &str) -> Result<u64, StateError> {
        let job_id = job_id.to_string();
        let total = self
            .conn
            .call(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM chunks WHERE job_id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )?;
                Ok(total)
            })
            .await?;
        Ok(total.max(0) as u64)
    }

    /// Drops every job record and every chunk.
    pub async fn clear(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch("DELETE FROM chunks; DELETE FROM downloads;")?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Shuts the shared connection down; every later call fails.
    #[cfg(test)]
    pub(crate) async fn close(&self) -> Result<(), StateError> {
        self.conn.clone().close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobDescriptor, JobStatus};

    fn record(id: &str) -> JobRecord {
        JobRecord::new(JobDescriptor::new(id, format!("{id}.bin"), format!("https://x/{id}")))
    }

    #[tokio::test]
    async fn jobs_load_in_insertion_order() {
        let state = StateManager::open_in_memory().await.unwrap();
        for id in ["b", "a", "c"] {
            state.save_job(&record(id)).await.unwrap();
        }

        let mut updated = record("b");
        updated.status = JobStatus::Paused;
        state.save_job(&updated).await.unwrap();

        let jobs = state.load_all_jobs().await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(jobs[0].status, JobStatus::Paused);
    }

    #[tokio::test]
    async fn delete_job_removes_record() {
        let state = StateManager::open_in_memory().await.unwrap();
        state.save_job(&record("a")).await.unwrap();
        state.delete_job("a").await.unwrap();
        assert!(state.load_all_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_chunks_are_none() {
        let state = StateManager::open_in_memory().await.unwrap();
        assert!(state.get_chunks("nope").await.unwrap().is_none());
        assert_eq!(state.chunk_bytes("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn appended_chunks_keep_arrival_order() {
        let state = StateManager::open_in_memory().await.unwrap();
        state.append_chunk("j", 0, Bytes::from_static(b"hello ")).await.unwrap();
        state.append_chunk("j", 1, Bytes::from_static(b"chunked ")).await.unwrap();
        state.append_chunk("j", 2, Bytes::from_static(b"world")).await.unwrap();

        let chunks = state.get_chunks("j").await.unwrap().unwrap();
        assert_eq!(chunks.concat(), b"hello chunked world");
        assert_eq!(state.chunk_bytes("j").await.unwrap(), 19);
    }

    #[tokio::test]
    async fn set_chunks_replaces_previous_list() {
        let state = StateManager::open_in_memory().await.unwrap();
        state.append_chunk("j", 0, Bytes::from_static(b"old")).await.unwrap();
        state.append_chunk("j", 1, Bytes::from_static(b"older")).await.unwrap();

        state.set_chunks("j", &[Bytes::from_static(b"new")]).await.unwrap();

        let chunks = state.get_chunks("j").await.unwrap().unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"new")]);
    }

    #[tokio::test]
    async fn chunks_are_isolated_per_job() {
        let state = StateManager::open_in_memory().await.unwrap();
        state.append_chunk("a", 0, Bytes::from_static(b"aaa")).await.unwrap();
        state.append_chunk("b", 0, Bytes::from_static(b"bb")).await.unwrap();

        state.remove_chunks("a").await.unwrap();

        assert!(state.get_chunks("a").await.unwrap().is_none());
        assert_eq!(state.chunk_bytes("b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloads.db");
        {
            let state = StateManager::open(&path).await.unwrap();
            state.save_job(&record("a")).await.unwrap();
            state.append_chunk("a", 0, Bytes::from_static(b"partial")).await.unwrap();
        }

        let state = StateManager::open(&path).await.unwrap();
        assert_eq!(state.load_all_jobs().await.unwrap().len(), 1);
        assert_eq!(state.chunk_bytes("a").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let state = StateManager::open_in_memory().await.unwrap();
        state.save_job(&record("a")).await.unwrap();
        state.append_chunk("a", 0, Bytes::from_static(b"x")).await.unwrap();

        state.clear().await.unwrap();

        assert!(state.load_all_jobs().await.unwrap().is_empty());
        assert!(state.get_chunks("a").await.unwrap().is_none());
    }
}
