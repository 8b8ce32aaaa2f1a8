//! Persisted state and change detection.
//!
//! The state file holds the last record that was notified. It is only ever
//! replaced whole, through a temp file in the same directory, so a crash or a
//! cancelled run leaves either the old or the new state behind.

use chrono::{DateTime, FixedOffset};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{PersistedState, ScreeningRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file {path} is unreadable: {cause}")]
    Corrupt { path: PathBuf, cause: String },
    #[error("failed to write state file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no state has been written yet.
    pub async fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::Corrupt {
                    path: self.path.clone(),
                    cause: err.to_string(),
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                path: self.path.clone(),
                cause: err.to_string(),
            })
    }

    /// Atomically replace the state file.
    pub async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let path = self.path.clone();
        let bytes = serde_json::to_vec_pretty(state).map_err(|err| StoreError::Write {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|err| StoreError::Write {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::Other, err),
            })?
            .map_err(|source| StoreError::Write { path, source })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ChangeResult {
    pub changed: bool,
    pub previous: Option<PersistedState>,
}

/// Compares candidates with the stored record and commits changes.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    store: JsonFileStore,
}

impl ChangeDetector {
    pub fn new(store: JsonFileStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &JsonFileStore {
        &self.store
    }

    /// A missing or unreadable store counts as changed.
    #[instrument(skip_all)]
    pub async fn check(&self, candidate: &ScreeningRecord) -> ChangeResult {
        let previous = match self.store.load().await {
            Ok(state) => state,
            Err(err) => {
                warn!(%err, "ignoring unreadable state");
                None
            }
        };
        let changed = match previous.as_ref().and_then(|s| s.latest_record.as_ref()) {
            Some(prev) => !prev.same_screening(candidate),
            None => true,
        };
        debug!(changed, first_run = previous.is_none(), "change check");
        ChangeResult { changed, previous }
    }

    /// Replace the stored record with `candidate`.
    #[instrument(skip_all, fields(title = %candidate.title))]
    pub async fn commit(
        &self,
        candidate: &ScreeningRecord,
        now: DateTime<FixedOffset>,
    ) -> Result<PersistedState, StoreError> {
        let state = PersistedState {
            last_changed_at: Some(now),
            latest_record: Some(candidate.clone()),
        };
        self.store.save(&state).await?;
        info!(path = %self.store.path().display(), "state committed");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Field;

    fn record(title: &str) -> ScreeningRecord {
        let at = DateTime::parse_from_rfc3339("2026-02-01T10:00:00+01:00").unwrap();
        let mut r = ScreeningRecord::empty("https://www.boras.se/film.html", at);
        r.set(Field::Title, title.to_string());
        r.set(Field::ScreeningDatetime, "2026-02-26 19:00".to_string());
        r.set(Field::Location, "Borås Bio Röda Kvarn".to_string());
        r.set(Field::BookingUrl, "https://bio.se/x".to_string());
        r
    }

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-02-01T10:05:00+01:00").unwrap()
    }

    #[tokio::test]
    async fn first_run_is_changed_and_commit_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let detector = ChangeDetector::new(JsonFileStore::new(td.path().join("db.json")));

        let res = detector.check(&record("Dirty Harry")).await;
        assert!(res.changed);
        assert!(res.previous.is_none());

        let state = detector.commit(&record("Dirty Harry"), now()).await.unwrap();
        let loaded = detector.store().load().await.unwrap().unwrap();
        assert_eq!(loaded.last_changed_at, state.last_changed_at);
        assert_eq!(loaded.latest_record.as_ref().unwrap().title, "Dirty Harry");

        let res = detector.check(&record("Dirty Harry")).await;
        assert!(!res.changed);
        assert!(res.previous.is_some());
        assert!(detector.check(&record("Heat")).await.changed);
    }

    #[tokio::test]
    async fn whitespace_differences_are_not_changes() {
        let td = tempfile::tempdir().unwrap();
        let detector = ChangeDetector::new(JsonFileStore::new(td.path().join("db.json")));
        detector.commit(&record("Dirty Harry"), now()).await.unwrap();
        assert!(!detector.check(&record("  Dirty Harry ")).await.changed);
    }

    #[tokio::test]
    async fn corrupt_state_is_treated_as_absent() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("db.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Corrupt { .. })));

        let res = ChangeDetector::new(store).check(&record("Dirty Harry")).await;
        assert!(res.changed);
        assert!(res.previous.is_none());
    }

    #[tokio::test]
    async fn legacy_state_file_is_understood() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("db.json");
        std::fs::write(
            &path,
            r#"{"last_changed_date":"2025-02-13T08:00:00+01:00","latest_movie_data":{"title":"Dirty Harry","screening_datetime":"2026-02-26 19:00","location":"Borås Bio Röda Kvarn","booking_url":"https://bio.se/x","movie_url":"https://www.boras.se/film.html"}}"#,
        )
        .unwrap();
        let detector = ChangeDetector::new(JsonFileStore::new(&path));
        assert!(!detector.check(&record("Dirty Harry")).await.changed);
    }

    #[tokio::test]
    async fn legacy_null_fields_read_as_missing() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("db.json");
        std::fs::write(
            &path,
            r#"{"last_changed_date":"2025-02-13T08:00:00+01:00","latest_movie_data":{"title":"Dirty Harry","screening_datetime":"2026-02-26 19:00","location":"Borås Bio Röda Kvarn","booking_url":null,"movie_url":null}}"#,
        )
        .unwrap();
        let store = JsonFileStore::new(&path);
        let state = store.load().await.unwrap().unwrap();
        let stored = state.latest_record.unwrap();
        assert_eq!(stored.booking_url, "");
        assert_eq!(stored.source_url, "");

        let mut candidate = record("Dirty Harry");
        candidate.set(Field::BookingUrl, String::new());
        let res = ChangeDetector::new(store).check(&candidate).await;
        assert!(!res.changed);
        assert!(res.previous.is_some());
    }

    #[tokio::test]
    async fn legacy_naive_timestamp_is_read_as_local_time() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("db.json");
        std::fs::write(
            &path,
            r#"{"last_changed_date":"2025-02-20T10:00:00.123456","latest_movie_data":{"title":"Dirty Harry","screening_datetime":"2026-02-26 19:00","location":"Borås Bio Röda Kvarn","booking_url":"https://bio.se/x"}}"#,
        )
        .unwrap();
        let store = JsonFileStore::new(&path);
        let state = store.load().await.unwrap().unwrap();
        let at = state.last_changed_at.unwrap();
        assert_eq!(at.naive_local().format("%Y-%m-%d %H:%M:%S").to_string(), "2025-02-20 10:00:00");

        let res = ChangeDetector::new(store).check(&record("Dirty Harry")).await;
        assert!(!res.changed);
    }

    #[tokio::test]
    async fn unparseable_timestamp_does_not_discard_the_record() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("db.json");
        std::fs::write(
            &path,
            r#"{"last_changed_at":"sometime","latest_record":{"title":"Dirty Harry","screening_datetime":"2026-02-26 19:00","location":"Borås Bio Röda Kvarn","booking_url":"https://bio.se/x"}}"#,
        )
        .unwrap();
        let state = JsonFileStore::new(&path).load().await.unwrap().unwrap();
        assert!(state.last_changed_at.is_none());
        assert_eq!(state.latest_record.unwrap().title, "Dirty Harry");
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("missing-dir").join("db.json");
        let detector = ChangeDetector::new(JsonFileStore::new(&path));
        let err = detector.commit(&record("Dirty Harry"), now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn commit_leaves_no_temp_files() {
        let td = tempfile::tempdir().unwrap();
        let detector = ChangeDetector::new(JsonFileStore::new(td.path().join("db.json")));
        detector.commit(&record("Dirty Harry"), now()).await.unwrap();
        detector.commit(&record("Heat"), now()).await.unwrap();
        let names: Vec<_> = std::fs::read_dir(td.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["db.json".to_string()]);
    }
}
