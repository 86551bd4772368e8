//! Durable storage for subscription positions.
//!
//! A subscriber persists the position of each processed event under its
//! subscription id, and on restart asks [`start_at_for`] where to resume. Records
//! use the JSON format of [`crate::position::encode`].
//!
//! Two implementations are provided: [`InMemoryPositionStorage`] for tests and
//! single-process use, and [`FilePositionStorage`], one JSON file per subscription
//! written atomically (temp file, fsync, rename).

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::position::{self, StartAt, SubscriptionPosition};

/// Keyed storage of subscription positions.
pub trait SubscriptionPositionStorage: Send + Sync {
    /// The stored position, or `None` if nothing was saved for `subscription_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnrecognizedPosition`] if the stored record is not a known
    /// position encoding, or an I/O error from the backing store.
    fn read(&self, subscription_id: &str) -> Result<Option<SubscriptionPosition>, Error>;

    /// Store `position`, replacing any earlier one.
    fn save(&self, subscription_id: &str, position: &SubscriptionPosition) -> Result<(), Error>;

    /// Forget the position. Deleting a missing position is not an error.
    fn delete(&self, subscription_id: &str) -> Result<(), Error>;

    fn exists(&self, subscription_id: &str) -> Result<bool, Error> {
        Ok(self.read(subscription_id)?.is_some())
    }
}

/// Where a subscription should start given what `storage` holds for it.
///
/// [`StartAt::Now`] when nothing was saved, otherwise the saved position.
pub fn start_at_for(
    storage: &dyn SubscriptionPositionStorage,
    subscription_id: &str,
) -> Result<StartAt, Error> {
    Ok(match storage.read(subscription_id)? {
        Some(position) => StartAt::AtPosition(position),
        None => StartAt::Now,
    })
}

/// Positions held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPositionStorage {
    records: RwLock<HashMap<String, Value>>,
}

impl InMemoryPositionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionPositionStorage for InMemoryPositionStorage {
    fn read(&self, subscription_id: &str) -> Result<Option<SubscriptionPosition>, Error> {
        self.records
            .read()
            .get(subscription_id)
            .map(position::decode)
            .transpose()
    }

    fn save(&self, subscription_id: &str, position: &SubscriptionPosition) -> Result<(), Error> {
        let record = position::encode(subscription_id, position);
        self.records.write().insert(subscription_id.to_string(), record);
        Ok(())
    }

    fn delete(&self, subscription_id: &str) -> Result<(), Error> {
        self.records.write().remove(subscription_id);
        Ok(())
    }

    fn exists(&self, subscription_id: &str) -> Result<bool, Error> {
        Ok(self.records.read().contains_key(subscription_id))
    }
}

/// Positions stored as one JSON file per subscription in a directory.
///
/// File names are the hex SHA-256 digest of the subscription id, so every id maps to
/// a short, safe file name. The record itself carries the full id.
#[derive(Debug, Clone)]
pub struct FilePositionStorage {
    dir: PathBuf,
}

impl FilePositionStorage {
    /// Open (creating if needed) a position directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The directory holding the position files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, subscription_id: &str) -> PathBuf {
        let digest = Sha256::digest(subscription_id.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

/// Write `content` to `path` so that readers see either the old or the new file.
fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    // Persist the rename itself.
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

impl SubscriptionPositionStorage for FilePositionStorage {
    fn read(&self, subscription_id: &str) -> Result<Option<SubscriptionPosition>, Error> {
        let content = match fs::read_to_string(self.path_for(subscription_id)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: Value = serde_json::from_str(&content).map_err(|e| {
            Error::UnrecognizedPosition(format!(
                "position of subscription {subscription_id} is not JSON: {e}"
            ))
        })?;
        match record.get(position::SUBSCRIPTION_ID).and_then(Value::as_str) {
            Some(stored) if stored != subscription_id => Err(Error::UnrecognizedPosition(format!(
                "position file for subscription {subscription_id} belongs to subscription {stored}"
            ))),
            _ => position::decode(&record).map(Some),
        }
    }

    fn save(&self, subscription_id: &str, position: &SubscriptionPosition) -> Result<(), Error> {
        let record = position::encode(subscription_id, position);
        let content = serde_json::to_vec_pretty(&record)?;
        write_atomically(&self.path_for(subscription_id), &content)?;
        tracing::trace!(subscription_id, "saved subscription position");
        Ok(())
    }

    fn delete(&self, subscription_id: &str) -> Result<(), Error> {
        match fs::remove_file(self.path_for(subscription_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, subscription_id: &str) -> Result<bool, Error> {
        Ok(self.path_for(subscription_id).try_exists()?)
    }
}
