use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::clock::DAY_KEY_FORMAT;

const CREDIT_FILE_VERSION: &str = "1.0";

/// Records older than this many days are pruned on write
const RETENTION_DAYS: i64 = 31;

/// Threshold (minutes) under which the budget counts as expiring soon
pub const EXPIRY_WARNING_MINUTES: i64 = 5;

/// Today's budget and remaining top-up units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    pub minutes: i64,
    pub five_extends: i64,
    pub one_extends: i64,
}

impl Credit {
    pub const fn new(minutes: i64, five_extends: i64, one_extends: i64) -> Self {
        Self {
            minutes,
            five_extends,
            one_extends,
        }
    }

    /// True once at most five minutes of budget remain for `usage_minutes`
    pub fn expires_soon(&self, usage_minutes: i64) -> bool {
        self.minutes - usage_minutes <= EXPIRY_WARNING_MINUTES
    }

    pub fn remaining(&self, usage_minutes: i64) -> i64 {
        (self.minutes - usage_minutes).max(0)
    }

    /// A credit whose budget does not exceed `limit`
    ///
    /// Returns `self` unchanged when it already fits; otherwise the budget is
    /// lowered to `limit` (never below zero) and both extension pools are emptied.
    pub fn capped_at(&self, limit: i64) -> Credit {
        if limit >= self.minutes {
            *self
        } else {
            Credit::new(limit.max(0), 0, 0)
        }
    }

    /// Persisted form: `minutes,five_extends,one_extends`
    pub fn as_record(&self) -> String {
        format!("{},{},{}", self.minutes, self.five_extends, self.one_extends)
    }
}

impl fmt::Display for Credit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} min (5-minute extensions left: {}, 1-minute extensions left: {})",
            self.minutes, self.five_extends, self.one_extends
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreditParseError {
    #[error("expected 3 comma-separated fields, found {0}")]
    FieldCount(usize),

    #[error("invalid number in credit record: {0:?}")]
    InvalidNumber(String),
}

impl FromStr for Credit {
    type Err = CreditParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(CreditParseError::FieldCount(fields.len()));
        }

        let parse = |field: &str| {
            field
                .parse::<i64>()
                .map_err(|_| CreditParseError::InvalidNumber(field.to_string()))
        };

        Ok(Credit::new(parse(fields[0])?, parse(fields[1])?, parse(fields[2])?))
    }
}

/// Backend that persists one credit record per day key
pub trait CreditPersistence: Send + Sync {
    fn load(&self, day_key: &str) -> Result<Option<Credit>>;
    fn store(&self, day_key: &str, credit: &Credit) -> Result<()>;

    /// Fingerprint of the stored data; backends shared with other processes
    /// return one so their writes can be noticed
    fn revision(&self) -> Option<Revision> {
        None
    }
}

/// On-disk identity of a credit file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl Revision {
    fn of(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;

        Some(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(&metadata),
        })
    }
}

/// On-disk credit document
#[derive(Debug, Clone, Deserialize, Serialize)]
struct CreditFile {
    version: String,

    /// Day key to `minutes,five,one` record
    #[serde(default)]
    days: BTreeMap<String, String>,
}

impl Default for CreditFile {
    fn default() -> Self {
        Self {
            version: CREDIT_FILE_VERSION.to_string(),
            days: BTreeMap::new(),
        }
    }
}

/// JSON file holding recent per-day credit records
pub struct FileCreditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCreditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_file(&self) -> Result<CreditFile> {
        if !self.path.exists() {
            return Ok(CreditFile::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credit file: {}", self.path.display()))?;

        let file: CreditFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credit file: {}", self.path.display()))?;

        if file.version != CREDIT_FILE_VERSION {
            warn!(
                "Credit file version mismatch (expected {}, got {}), starting fresh",
                CREDIT_FILE_VERSION, file.version
            );
            return Ok(CreditFile::default());
        }

        Ok(file)
    }
}

impl CreditPersistence for FileCreditStore {
    fn load(&self, day_key: &str) -> Result<Option<Credit>> {
        let file = self.read_file()?;

        match file.days.get(day_key) {
            Some(record) => {
                let credit = record
                    .parse::<Credit>()
                    .with_context(|| format!("Corrupt credit record for {}", day_key))?;
                Ok(Some(credit))
            }
            None => Ok(None),
        }
    }

    fn store(&self, day_key: &str, credit: &Credit) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = self.read_file().unwrap_or_else(|e| {
            warn!("Discarding unreadable credit file: {:#}", e);
            CreditFile::default()
        });

        file.days.insert(day_key.to_string(), credit.as_record());
        prune_old_days(&mut file.days, day_key);

        let content = serde_json::to_string_pretty(&file).context("Failed to serialize credits")?;
        crate::platform::common::atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write credit file: {}", self.path.display()))?;

        Ok(())
    }

    fn revision(&self) -> Option<Revision> {
        Revision::of(&self.path)
    }
}

fn prune_old_days(days: &mut BTreeMap<String, String>, current_key: &str) {
    let Ok(current) = NaiveDate::parse_from_str(current_key, DAY_KEY_FORMAT) else {
        return;
    };

    days.retain(|key, _| match NaiveDate::parse_from_str(key, DAY_KEY_FORMAT) {
        Ok(day) => (current - day).num_days() <= RETENTION_DAYS,
        Err(_) => false,
    });
}

pub type CreditObserver = Box<dyn Fn(&str, &Credit) + Send + Sync>;

/// Per-day credit access with a default fallback and change notification
pub struct CreditStore {
    backend: Box<dyn CreditPersistence>,
    default_credit: Credit,
    observers: Mutex<Vec<CreditObserver>>,
    last_revision: Mutex<Option<Revision>>,
}

impl CreditStore {
    pub fn new(backend: Box<dyn CreditPersistence>, default_credit: Credit) -> Self {
        Self {
            backend,
            default_credit,
            observers: Mutex::new(Vec::new()),
            last_revision: Mutex::new(None),
        }
    }

    pub fn default_credit(&self) -> Credit {
        self.default_credit
    }

    /// Credit for `day_key`, or the default when none is stored or it cannot be read
    pub fn get(&self, day_key: &str) -> Credit {
        match self.backend.load(day_key) {
            Ok(Some(credit)) => credit,
            Ok(None) => {
                debug!("No credit stored for {}, using default", day_key);
                self.default_credit
            }
            Err(e) => {
                warn!("Failed to load credit for {}, using default: {:#}", day_key, e);
                self.default_credit
            }
        }
    }

    /// Persist a credit and notify observers; returns false if the write failed
    pub fn save(&self, day_key: &str, credit: &Credit) -> bool {
        if let Err(e) = self.backend.store(day_key, credit) {
            error!("Failed to save credit for {}: {:#}", day_key, e);
            return false;
        }

        debug!("Saved credit for {}: {}", day_key, credit.as_record());
        *self.last_revision.lock().unwrap_or_else(|e| e.into_inner()) = self.backend.revision();

        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer(day_key, credit);
        }

        true
    }

    /// True when the backend changed since this store last looked, e.g. because
    /// `screen-budget extend` wrote it from another process
    pub fn changed_externally(&self) -> bool {
        let Some(current) = self.backend.revision() else {
            return false;
        };

        let mut last = self.last_revision.lock().unwrap_or_else(|e| e.into_inner());
        if *last == Some(current) {
            return false;
        }

        let first_look = last.is_none();
        *last = Some(current);
        if !first_look {
            info!("Credit file changed on disk, reloading");
        }
        true
    }

    /// Register a callback invoked after every successful save
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&str, &Credit) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(observer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::testing::MemoryCreditStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_expires_soon_boundary() {
        let credit = Credit::new(20, 1, 1);
        assert!(!credit.expires_soon(14));
        assert!(credit.expires_soon(15));
        assert!(credit.expires_soon(19));
        assert!(credit.expires_soon(25));
    }

    #[test]
    fn test_remaining_never_negative() {
        let credit = Credit::new(20, 1, 1);
        assert_eq!(credit.remaining(12), 8);
        assert_eq!(credit.remaining(30), 0);
    }

    #[test]
    fn test_capped_at() {
        let credit = Credit::new(20, 1, 1);
        assert_eq!(credit.capped_at(25), credit);
        assert_eq!(credit.capped_at(20), credit);
        assert_eq!(credit.capped_at(9), Credit::new(9, 0, 0));
        assert_eq!(credit.capped_at(-1), Credit::new(0, 0, 0));
    }

    #[test]
    fn test_record_format() {
        let credit = Credit::new(35, 0, 1);
        assert_eq!(credit.as_record(), "35,0,1");
        assert_eq!("35,0,1".parse::<Credit>().unwrap(), credit);
        assert_eq!(" 20 , 1 ,1".parse::<Credit>().unwrap(), Credit::new(20, 1, 1));
    }

    #[test]
    fn test_record_parse_errors() {
        assert_eq!("20,1".parse::<Credit>(), Err(CreditParseError::FieldCount(2)));
        assert_eq!(
            "20,x,1".parse::<Credit>(),
            Err(CreditParseError::InvalidNumber("x".to_string()))
        );
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let store = FileCreditStore::new(temp_dir.path().join("credits.json"));

        assert_eq!(store.load("14.03.2025").unwrap(), None);

        store.store("14.03.2025", &Credit::new(30, 0, 1)).unwrap();
        store.store("15.03.2025", &Credit::new(20, 1, 1)).unwrap();

        assert_eq!(store.load("14.03.2025").unwrap(), Some(Credit::new(30, 0, 1)));
        assert_eq!(store.load("15.03.2025").unwrap(), Some(Credit::new(20, 1, 1)));
    }

    #[test]
    fn test_file_store_prunes_old_days() {
        let temp_dir = tempdir().unwrap();
        let store = FileCreditStore::new(temp_dir.path().join("credits.json"));

        store.store("01.01.2025", &Credit::new(20, 1, 1)).unwrap();
        store.store("14.03.2025", &Credit::new(25, 1, 1)).unwrap();

        assert_eq!(store.load("01.01.2025").unwrap(), None);
        assert!(store.load("14.03.2025").unwrap().is_some());
    }

    #[test]
    fn test_file_store_corrupt_record_is_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("credits.json");
        std::fs::write(&path, r#"{"version":"1.0","days":{"14.03.2025":"bogus"}}"#).unwrap();

        let store = FileCreditStore::new(&path);
        assert!(store.load("14.03.2025").is_err());

        let credits = CreditStore::new(Box::new(store), Credit::new(20, 1, 1));
        assert_eq!(credits.get("14.03.2025"), Credit::new(20, 1, 1));
    }

    #[test]
    fn test_store_defaults_and_notifies() {
        let credits = CreditStore::new(Box::new(MemoryCreditStore::default()), Credit::new(20, 1, 1));
        let notified = Arc::new(AtomicUsize::new(0));

        let counter = notified.clone();
        credits.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(credits.get("14.03.2025"), Credit::new(20, 1, 1));
        assert!(credits.save("14.03.2025", &Credit::new(30, 1, 0)));
        assert_eq!(credits.get("14.03.2025"), Credit::new(30, 1, 0));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_save_does_not_notify() {
        let backend = MemoryCreditStore::default();
        backend.fail_writes(true);
        let credits = CreditStore::new(Box::new(backend), Credit::new(20, 1, 1));
        let notified = Arc::new(AtomicUsize::new(0));

        let counter = notified.clone();
        credits.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!credits.save("14.03.2025", &Credit::new(30, 1, 0)));
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_detects_write_from_another_store() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("credits.json");

        let daemon = CreditStore::new(Box::new(FileCreditStore::new(&path)), Credit::new(20, 1, 1));
        let other = CreditStore::new(Box::new(FileCreditStore::new(&path)), Credit::new(20, 1, 1));

        assert!(!daemon.changed_externally());
        assert!(daemon.save("14.03.2025", &Credit::new(20, 1, 1)));
        assert!(!daemon.changed_externally());

        assert!(other.save("14.03.2025", &Credit::new(25, 0, 1)));
        assert!(daemon.changed_externally());
        assert!(!daemon.changed_externally());
        assert_eq!(daemon.get("14.03.2025"), Credit::new(25, 0, 1));
    }

    #[test]
    fn test_memory_backend_never_changes_externally() {
        let credits = CreditStore::new(Box::new(MemoryCreditStore::default()), Credit::new(20, 1, 1));
        assert!(credits.save("14.03.2025", &Credit::new(30, 1, 0)));
        assert!(!credits.changed_externally());
    }
}
