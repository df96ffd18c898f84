#![allow(clippy::missing_errors_doc)]

//! Session persistence for in-progress and completed assessments.
//!
//! [`SessionStore`] layers the progress/history rules over any
//! [`KeyValueStore`]. Every public session operation is fail-soft: storage
//! errors are logged through `tracing` and surface only as `false`, `None`,
//! or an empty history.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use mbti_kernel_core::{
    format_history_date, is_expired, now_utc, unix_millis, Answer, SessionConfig, TraitScores,
    TypeCode,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

const KV_MIGRATION_VERSION: i64 = 1;

const SCHEMA_KV_V1: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY CHECK (length(key) > 0),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Get/set/remove by key. Values are serialized JSON documents.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

pub struct SqliteKeyValueStore {
    conn: Connection,
}

impl SqliteKeyValueStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_KV_V1)
            .context("failed to apply key-value schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![KV_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register key-value schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read key {key}"))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO kv_entries(key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value, now_rfc3339()?],
            )
            .with_context(|| format!("failed to write key {key}"))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .with_context(|| format!("failed to remove key {key}"))?;
        Ok(())
    }
}

/// Process-local store for tests and hosts without durable storage.
/// Reads and writes can be made to fail to exercise the fail-soft paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: BTreeMap<String, String>,
    fail_reads: bool,
    fail_writes: bool,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads {
            return Err(anyhow!("simulated read failure for key {key}"));
        }
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes {
            return Err(anyhow!("simulated quota exceeded for key {key}"));
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.fail_writes {
            return Err(anyhow!("simulated write failure for key {key}"));
        }
        self.entries.remove(key);
        Ok(())
    }
}

pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// The single unfinished attempt. `timestamp` is Unix milliseconds of the
/// last save.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub answers: Vec<Answer>,
    pub current_question: usize,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub date: String,
    pub timestamp: i64,
    #[serde(alias = "mbtiType")]
    pub type_code: TypeCode,
    pub answers: Vec<Answer>,
    pub scores: TraitScores,
}

pub struct SessionStore<S, C = SystemClock> {
    storage: S,
    clock: C,
    config: SessionConfig,
}

impl<S: KeyValueStore> SessionStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            clock: SystemClock,
            config: SessionConfig::v1(),
        }
    }
}

impl<S: KeyValueStore, C: Clock> SessionStore<S, C> {
    pub fn with_config(storage: S, config: SessionConfig, clock: C) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid session configuration: {err}"))?;
        Ok(Self {
            storage,
            clock,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Overwrites the progress record, stamping it with the current time.
    pub fn save_progress(&mut self, answers: &[Answer], current_question: usize) -> bool {
        let key = self.config.progress_key.clone();
        if let Err(err) = check_answers(answers) {
            error!(key = %key, "refusing to save progress: {err:#}");
            return false;
        }

        let record = ProgressRecord {
            answers: answers.to_vec(),
            current_question,
            timestamp: unix_millis(self.clock.now()),
        };

        match self.write_json(&key, &record) {
            Ok(()) => true,
            Err(err) => {
                error!(key = %key, "failed to save progress: {err:#}");
                false
            }
        }
    }

    /// Returns the stored progress unless it is older than the configured
    /// TTL, in which case it is deleted and `None` is returned.
    pub fn load_progress(&mut self) -> Option<ProgressRecord> {
        let record = match self.read_json::<ProgressRecord>(&self.config.progress_key) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                error!(key = %self.config.progress_key, "failed to load progress: {err:#}");
                return None;
            }
        };

        if is_expired(record.timestamp, self.clock.now(), self.config.progress_ttl()) {
            info!(
                key = %self.config.progress_key,
                timestamp = record.timestamp,
                "discarding expired progress"
            );
            let _ = self.clear_progress();
            return None;
        }

        Some(record)
    }

    pub fn clear_progress(&mut self) -> bool {
        let key = self.config.progress_key.clone();
        match self.storage.remove(&key) {
            Ok(()) => true,
            Err(err) => {
                error!(key = %key, "failed to clear progress: {err:#}");
                false
            }
        }
    }

    /// Prepends a completed attempt to history, caps the list, then clears
    /// progress. Progress is left untouched when the history write fails.
    pub fn save_test_result(
        &mut self,
        type_code: TypeCode,
        answers: &[Answer],
        scores: &TraitScores,
    ) -> Option<HistoryRecord> {
        match self.try_save_test_result(type_code, answers, scores) {
            Ok(record) => {
                if !self.clear_progress() {
                    warn!(id = %record.id, "history saved but progress was not cleared");
                }
                Some(record)
            }
            Err(err) => {
                error!(key = %self.config.history_key, "failed to save test result: {err:#}");
                None
            }
        }
    }

    /// Newest-first history; empty when absent or unreadable.
    #[must_use]
    pub fn get_test_history(&self) -> Vec<HistoryRecord> {
        match self.read_json::<Vec<HistoryRecord>>(&self.config.history_key) {
            Ok(history) => history.unwrap_or_default(),
            Err(err) => {
                error!(key = %self.config.history_key, "failed to read history: {err:#}");
                Vec::new()
            }
        }
    }

    #[must_use]
    pub fn get_test_history_by_id(&self, id: &str) -> Option<HistoryRecord> {
        self.get_test_history()
            .into_iter()
            .find(|record| record.id == id)
    }

    /// Removes the record with `id`. Returns `false` without writing when
    /// the current history cannot be read.
    pub fn delete_test_history(&mut self, id: &str) -> bool {
        let key = self.config.history_key.clone();
        let result = self.history_for_update(&key).and_then(|mut history| {
            history.retain(|record| record.id != id);
            self.write_json(&key, &history)
        });
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(key = %key, id, "failed to delete history record: {err:#}");
                false
            }
        }
    }

    pub fn clear_all_history(&mut self) -> bool {
        let key = self.config.history_key.clone();
        match self.storage.remove(&key) {
            Ok(()) => true,
            Err(err) => {
                error!(key = %key, "failed to clear history: {err:#}");
                false
            }
        }
    }

    fn try_save_test_result(
        &mut self,
        type_code: TypeCode,
        answers: &[Answer],
        scores: &TraitScores,
    ) -> Result<HistoryRecord> {
        check_answers(answers)?;
        let key = self.config.history_key.clone();
        let mut history = self.history_for_update(&key)?;

        let now = self.clock.now();
        let record = HistoryRecord {
            id: Ulid::from_datetime(SystemTime::from(now)).to_string(),
            date: format_history_date(now).map_err(|err| anyhow!(err.to_string()))?,
            timestamp: unix_millis(now),
            type_code,
            answers: answers.to_vec(),
            scores: scores.clone(),
        };

        history.insert(0, record.clone());

        let limit = self.config.history_limit;
        if history.len() > limit {
            debug!(
                evicted = history.len() - limit,
                limit, "evicting oldest history records"
            );
            history.truncate(limit);
        }

        self.write_json(&key, &history)?;
        Ok(record)
    }

    /// Current history as the base for a rewrite. Storage errors abort the
    /// rewrite; an undecodable value is replaced.
    fn history_for_update(&self, key: &str) -> Result<Vec<HistoryRecord>> {
        let Some(raw) = self.storage.get(key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(history) => Ok(history),
            Err(err) => {
                warn!(key = %key, "replacing unreadable history: {err}");
                Ok(Vec::new())
            }
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.storage.get(key)? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("stored value for key {key} is not valid"))?;
        Ok(Some(value))
    }

    fn write_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)
            .with_context(|| format!("failed to serialize value for key {key}"))?;
        self.storage.set(key, &payload)
    }
}

fn check_answers(answers: &[Answer]) -> Result<()> {
    for answer in answers {
        Answer::new(answer.question_id, answer.value, answer.weight)
            .map_err(|err| anyhow!("answer for question {}: {err}", answer.question_id))?;
    }
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    now_utc()
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
