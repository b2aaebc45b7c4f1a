//! Per-block display history. [`DisplayStatusStore`] is safe to share between placeholders: it is
//! a keyed store with no cross-key invariants.
//!
//! Statuses are persisted through a [`StatusStorage`] so they survive restarts. Storage failures
//! never surface to callers: a failed load behaves as "no status recorded", which errs on the side
//! of showing content again.
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Mutex, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{to_delta, Timestamp},
    Error, Result,
};

/// Latest display and interaction instants of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayStatus {
    /// Last successful display.
    pub displayed_at: Option<Timestamp>,
    /// Last click or close.
    pub interacted_at: Option<Timestamp>,
}

impl DisplayStatus {
    fn latest(&self) -> Option<Timestamp> {
        self.displayed_at.max(self.interacted_at)
    }
}

/// Backend that persists display statuses.
pub trait StatusStorage: Send + Sync {
    /// Load every persisted status.
    fn load(&self) -> Result<HashMap<String, DisplayStatus>>;
    /// Replace persisted statuses with `statuses`.
    fn save(&self, statuses: &HashMap<String, DisplayStatus>) -> Result<()>;
    /// Remove everything.
    fn clear(&self) -> Result<()>;
}

impl<T: StatusStorage + ?Sized> StatusStorage for Box<T> {
    fn load(&self) -> Result<HashMap<String, DisplayStatus>> {
        (**self).load()
    }

    fn save(&self, statuses: &HashMap<String, DisplayStatus>) -> Result<()> {
        (**self).save(statuses)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

/// Non-persistent storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    saved: Mutex<HashMap<String, DisplayStatus>>,
}

impl StatusStorage for MemoryStorage {
    fn load(&self) -> Result<HashMap<String, DisplayStatus>> {
        Ok(self
            .saved
            .lock()
            .expect("thread holding storage lock should not panic")
            .clone())
    }

    fn save(&self, statuses: &HashMap<String, DisplayStatus>) -> Result<()> {
        *self
            .saved
            .lock()
            .expect("thread holding storage lock should not panic") = statuses.clone();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.saved
            .lock()
            .expect("thread holding storage lock should not panic")
            .clear();
        Ok(())
    }
}

/// Stores statuses as a JSON object in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    /// Storage backed by the JSON file at `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> JsonFileStorage {
        JsonFileStorage { path: path.into() }
    }
}

impl StatusStorage for JsonFileStorage {
    fn load(&self) -> Result<HashMap<String, DisplayStatus>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, statuses: &HashMap<String, DisplayStatus>) -> Result<()> {
        let bytes = serde_json::to_vec(statuses)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(Error::from(err)),
            _ => Ok(()),
        }
    }
}

/// Thread-safe store of [`DisplayStatus`] keyed by block id.
pub struct DisplayStatusStore {
    statuses: RwLock<HashMap<String, DisplayStatus>>,
    storage: Box<dyn StatusStorage>,
}

impl DisplayStatusStore {
    /// Default retention for [`DisplayStatusStore::open`].
    pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    /// Open a store backed by `storage`, dropping statuses untouched for longer than
    /// `retention`.
    pub fn open(
        storage: impl StatusStorage + 'static,
        retention: Duration,
        now: Timestamp,
    ) -> DisplayStatusStore {
        let mut statuses = storage.load().unwrap_or_else(|err| {
            log::error!(target: "content_blocks", "unable to load display statuses: {err}");
            HashMap::new()
        });

        let cutoff = now
            .checked_sub_signed(to_delta(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = statuses.len();
        statuses.retain(|_, status| matches!(status.latest(), Some(t) if t > cutoff));
        if statuses.len() != before {
            log::debug!(target: "content_blocks",
                        pruned = before - statuses.len();
                        "pruned stale display statuses");
            if let Err(err) = storage.save(&statuses) {
                log::error!(target: "content_blocks", "unable to save display statuses: {err}");
            }
        }

        DisplayStatusStore {
            statuses: RwLock::new(statuses),
            storage: Box::new(storage),
        }
    }

    /// A store that does not outlive the process.
    pub fn in_memory() -> DisplayStatusStore {
        DisplayStatusStore {
            statuses: RwLock::new(HashMap::new()),
            storage: Box::new(MemoryStorage::default()),
        }
    }

    /// Status of `block_id`. Blocks never displayed report an empty status.
    pub fn status_of(&self, block_id: &str) -> DisplayStatus {
        self.statuses
            .read()
            .expect("thread holding display status lock should not panic")
            .get(block_id)
            .copied()
            .unwrap_or_default()
    }

    /// Record a display of `block_id` at `at`.
    pub fn did_display(&self, block_id: &str, at: Timestamp) {
        self.update(block_id, |status| status.displayed_at = Some(at));
    }

    /// Record an interaction with `block_id` at `at`.
    pub fn did_interact(&self, block_id: &str, at: Timestamp) {
        self.update(block_id, |status| status.interacted_at = Some(at));
    }

    /// Forget everything, including persisted statuses.
    pub fn clear(&self) {
        let mut statuses = self
            .statuses
            .write()
            .expect("thread holding display status lock should not panic");
        statuses.clear();
        if let Err(err) = self.storage.clear() {
            log::error!(target: "content_blocks", "unable to clear display statuses: {err}");
        }
    }

    fn update(&self, block_id: &str, f: impl FnOnce(&mut DisplayStatus)) {
        let mut statuses = self
            .statuses
            .write()
            .expect("thread holding display status lock should not panic");
        f(statuses.entry(block_id.to_owned()).or_default());

        // Saving under the lock keeps persisted snapshots in write order.
        if let Err(err) = self.storage.save(&statuses) {
            log::error!(target: "content_blocks",
                        block_id;
                        "unable to save display statuses: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{TimeDelta, TimeZone, Utc};

    use super::{
        DisplayStatus, DisplayStatusStore, JsonFileStorage, MemoryStorage, StatusStorage,
    };
    use crate::{Error, Result};

    fn disk_gone() -> Error {
        Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
    }

    struct FailingStorage;

    impl StatusStorage for FailingStorage {
        fn load(&self) -> Result<HashMap<String, DisplayStatus>> {
            Err(disk_gone())
        }
        fn save(&self, _statuses: &HashMap<String, DisplayStatus>) -> Result<()> {
            Err(disk_gone())
        }
        fn clear(&self) -> Result<()> {
            Err(disk_gone())
        }
    }

    #[test]
    fn accumulates_latest_timestamps() {
        let store = DisplayStatusStore::in_memory();
        let t1 = Utc.timestamp_opt(1_000, 0).unwrap();
        let t2 = Utc.timestamp_opt(2_000, 0).unwrap();

        assert_eq!(store.status_of("a"), DisplayStatus::default());

        store.did_interact("a", t1);
        store.did_display("a", t2);

        assert_eq!(
            store.status_of("a"),
            DisplayStatus {
                displayed_at: Some(t2),
                interacted_at: Some(t1),
            }
        );
        assert_eq!(store.status_of("b"), DisplayStatus::default());
    }

    #[test]
    fn storage_failures_fail_open() {
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let store = DisplayStatusStore::open(FailingStorage, Duration::from_secs(60), now);

        store.did_display("a", now);
        store.clear();

        assert_eq!(store.status_of("a"), DisplayStatus::default());
    }

    #[test]
    fn prunes_statuses_past_retention() {
        let now = Utc.timestamp_opt(10_000_000, 0).unwrap();
        let storage = MemoryStorage::default();
        storage
            .save(&HashMap::from([
                (
                    "old".to_owned(),
                    DisplayStatus {
                        displayed_at: Some(now - TimeDelta::days(31)),
                        interacted_at: None,
                    },
                ),
                (
                    "recent".to_owned(),
                    DisplayStatus {
                        displayed_at: Some(now - TimeDelta::days(40)),
                        interacted_at: Some(now - TimeDelta::days(2)),
                    },
                ),
            ]))
            .unwrap();

        let store = DisplayStatusStore::open(storage, DisplayStatusStore::DEFAULT_RETENTION, now);

        assert_eq!(store.status_of("old"), DisplayStatus::default());
        assert!(store.status_of("recent").interacted_at.is_some());
    }

    #[test]
    fn survives_reopen_from_file() {
        let path = std::env::temp_dir().join(format!(
            "content-blocks-status-{}.json",
            std::process::id()
        ));
        let now = Utc::now();

        {
            let store = DisplayStatusStore::open(
                JsonFileStorage::new(&path),
                DisplayStatusStore::DEFAULT_RETENTION,
                now,
            );
            store.did_display("a", now);
        }

        let reopened = DisplayStatusStore::open(
            JsonFileStorage::new(&path),
            DisplayStatusStore::DEFAULT_RETENTION,
            now,
        );
        assert_eq!(reopened.status_of("a").displayed_at, Some(now));

        reopened.clear();
        assert!(!path.exists());
    }

    #[test]
    fn file_storage_reports_io_and_format_errors() {
        // A directory cannot be read as a file.
        let unreadable = JsonFileStorage::new(std::env::temp_dir());
        assert!(matches!(unreadable.load(), Err(Error::Io(_))));

        let path = std::env::temp_dir().join(format!(
            "content-blocks-garbage-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "not json").unwrap();
        let garbage = JsonFileStorage::new(&path);
        assert!(matches!(garbage.load(), Err(Error::Serialization(_))));

        // The store still opens, empty.
        let store =
            DisplayStatusStore::open(garbage, DisplayStatusStore::DEFAULT_RETENTION, Utc::now());
        assert_eq!(store.status_of("a"), DisplayStatus::default());
        store.clear();
        assert!(!path.exists());
    }

    #[test]
    fn can_record_from_another_thread() {
        let store = Arc::new(DisplayStatusStore::in_memory());
        let now = Utc::now();

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || store.did_display("a", now)).join();
        }

        assert_eq!(store.status_of("a").displayed_at, Some(now));
    }
}
