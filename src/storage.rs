use crate::error::PipelineError;
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Keys of the on-disk key-value store. One JSON file per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKey {
    DistinctId,
    AnonymousId,
    QueueFolder,
    EnabledFlags,
    EnabledFlagPayloads,
    Groups,
    SessionId,
    SessionLastTimestamp,
    RegisteredProperties,
    OptOut,
}

impl StorageKey {
    /// On-disk file name. The prefix is part of the persisted format; do not
    /// rename without a migration.
    pub fn file_name(self) -> &'static str {
        match self {
            StorageKey::DistinctId => "beacon.distinctId",
            StorageKey::AnonymousId => "beacon.anonymousId",
            StorageKey::QueueFolder => "beacon.queueFolder",
            StorageKey::EnabledFlags => "beacon.enabledFeatureFlags",
            StorageKey::EnabledFlagPayloads => "beacon.enabledFeatureFlagPayloads",
            StorageKey::Groups => "beacon.groups",
            StorageKey::SessionId => "beacon.sessionId",
            StorageKey::SessionLastTimestamp => "beacon.sessionLastTimestamp",
            StorageKey::RegisteredProperties => "beacon.registeredProperties",
            StorageKey::OptOut => "beacon.optOut",
        }
    }

    /// Bare key used by the legacy one-entry-object scalar encoding.
    fn bare_name(self) -> &'static str {
        match self {
            StorageKey::DistinctId => "distinctId",
            StorageKey::AnonymousId => "anonymousId",
            StorageKey::QueueFolder => "queueFolder",
            StorageKey::EnabledFlags => "enabledFeatureFlags",
            StorageKey::EnabledFlagPayloads => "enabledFeatureFlagPayloads",
            StorageKey::Groups => "groups",
            StorageKey::SessionId => "sessionId",
            StorageKey::SessionLastTimestamp => "sessionLastTimestamp",
            StorageKey::RegisteredProperties => "registeredProperties",
            StorageKey::OptOut => "optOut",
        }
    }
}

/// Typed get/set/remove over the closed key set, one JSON file per key.
///
/// Values are full JSON documents replaced atomically (write a temp file,
/// then rename over the target). An unparseable file reads as absent, so a
/// crash mid-write costs at most that one value. Scalars written by older
/// clients as a one-entry object keyed by the key's own name are accepted on
/// read; new writes use the bare scalar shape.
pub struct Storage {
    root: PathBuf,
    /// Advisory single-owner guard; released when the store is dropped.
    _lock: Option<File>,
}

impl Storage {
    /// Open (or create) the store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let lock = acquire_lock(&root);
        Ok(Self { root, _lock: lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Queue directory per the `queueFolder` key, defaulting to `queue/`
    /// under the root. The default is written back so the layout is
    /// discoverable on disk.
    pub fn queue_dir(&self) -> PathBuf {
        if let Some(dir) = self.get_string(StorageKey::QueueFolder) {
            return PathBuf::from(dir);
        }
        let dir = self.root.join("queue");
        self.set_string(StorageKey::QueueFolder, &dir.to_string_lossy());
        dir
    }

    pub fn get_string(&self, key: StorageKey) -> Option<String> {
        match self.read_scalar(key)? {
            Value::String(s) => Some(s),
            other => {
                tracing::warn!(key = key.file_name(), found = ?other, "stored value is not a string");
                None
            }
        }
    }

    pub fn set_string(&self, key: StorageKey, value: &str) {
        self.write_value(key, &Value::String(value.to_owned()));
    }

    pub fn get_number(&self, key: StorageKey) -> Option<f64> {
        self.read_scalar(key)?.as_f64()
    }

    pub fn set_number(&self, key: StorageKey, value: f64) {
        match serde_json::Number::from_f64(value) {
            Some(number) => self.write_value(key, &Value::Number(number)),
            None => {
                tracing::warn!(key = key.file_name(), value, "non-finite number; not persisted")
            }
        }
    }

    pub fn get_bool(&self, key: StorageKey) -> Option<bool> {
        self.read_scalar(key)?.as_bool()
    }

    pub fn set_bool(&self, key: StorageKey, value: bool) {
        self.write_value(key, &Value::Bool(value));
    }

    pub fn get_dict(&self, key: StorageKey) -> Option<Map<String, Value>> {
        match self.read_value(key)? {
            Value::Object(map) => Some(map),
            other => {
                tracing::warn!(key = key.file_name(), found = ?other, "stored value is not an object");
                None
            }
        }
    }

    pub fn set_dict(&self, key: StorageKey, value: &Map<String, Value>) {
        self.write_value(key, &Value::Object(value.clone()));
    }

    pub fn get_array(&self, key: StorageKey) -> Option<Vec<Value>> {
        match self.read_value(key)? {
            Value::Array(items) => Some(items),
            other => {
                tracing::warn!(key = key.file_name(), found = ?other, "stored value is not an array");
                None
            }
        }
    }

    pub fn set_array(&self, key: StorageKey, value: &[Value]) {
        self.write_value(key, &Value::Array(value.to_vec()));
    }

    pub fn remove(&self, key: StorageKey) {
        let path = self.path_for(key);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(file = %path.display(), error = %err, "failed to remove stored value");
            }
        }
    }

    /// Wipe every key and recreate the root directory.
    pub fn reset(&self) {
        if let Err(err) = fs::remove_dir_all(&self.root) {
            tracing::warn!(root = %self.root.display(), error = %err, "failed to remove storage root");
        }
        if let Err(err) = fs::create_dir_all(&self.root) {
            tracing::warn!(root = %self.root.display(), error = %err, "failed to recreate storage root");
        }
    }

    fn path_for(&self, key: StorageKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    fn read_value(&self, key: StorageKey) -> Option<Value> {
        let path = self.path_for(key);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                // a partially written file reads as absent
                tracing::warn!(file = %path.display(), error = %err, "unparseable stored value; treating as absent");
                None
            }
        }
    }

    /// Read a scalar, unwrapping the legacy `{ "<key>": value }` shape.
    fn read_scalar(&self, key: StorageKey) -> Option<Value> {
        let value = self.read_value(key)?;
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(inner) = map.get(key.bare_name()).or_else(|| map.get(key.file_name())) {
                    return Some(inner.clone());
                }
            }
        }
        Some(value)
    }

    fn write_value(&self, key: StorageKey, value: &Value) {
        let path = self.path_for(key);
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(key = key.file_name(), error = %err, "failed to serialize value");
                return;
            }
        };

        // Write to a temp file then rename over the target, so readers only
        // ever observe a complete document.
        let tmp = path.with_extension("tmp");
        if let Err(err) = fs::write(&tmp, json) {
            tracing::warn!(file = %tmp.display(), error = %err, "failed to write temp file");
            return;
        }
        if let Err(err) = fs::rename(&tmp, &path) {
            if cfg!(windows) {
                // Windows rename does not replace; remove then retry.
                let _ = fs::remove_file(&path);
                if let Err(err) = fs::rename(&tmp, &path) {
                    tracing::warn!(file = %path.display(), error = %err, "failed to replace stored value");
                }
            } else {
                tracing::warn!(file = %path.display(), error = %err, "failed to replace stored value");
            }
        }
    }
}

fn acquire_lock(root: &Path) -> Option<File> {
    let lock_path = root.join(".beacon.lock");
    let file = match OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
    {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(file = %lock_path.display(), error = %err, "failed to open storage lock file");
            return None;
        }
    };
    if let Err(err) = file.try_lock_exclusive() {
        tracing::warn!(
            file = %lock_path.display(),
            error = %err,
            "storage root appears to be in use by another instance"
        );
        return None;
    }
    Some(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn scalar_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        storage.set_string(StorageKey::DistinctId, "user-1");
        storage.set_number(StorageKey::SessionLastTimestamp, 1722500000.5);
        storage.set_bool(StorageKey::OptOut, true);

        assert_eq!(storage.get_string(StorageKey::DistinctId).as_deref(), Some("user-1"));
        assert_eq!(storage.get_number(StorageKey::SessionLastTimestamp), Some(1722500000.5));
        assert_eq!(storage.get_bool(StorageKey::OptOut), Some(true));
    }

    #[test]
    fn legacy_one_entry_object_scalars_are_accepted() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        fs::write(
            dir.path().join(StorageKey::DistinctId.file_name()),
            r#"{"distinctId":"legacy-user"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join(StorageKey::OptOut.file_name()),
            r#"{"beacon.optOut":true}"#,
        )
        .unwrap();

        assert_eq!(storage.get_string(StorageKey::DistinctId).as_deref(), Some("legacy-user"));
        assert_eq!(storage.get_bool(StorageKey::OptOut), Some(true));
    }

    #[test]
    fn dicts_and_arrays_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        let mut groups = Map::new();
        groups.insert("company".to_owned(), json!("acme"));
        storage.set_dict(StorageKey::Groups, &groups);
        assert_eq!(storage.get_dict(StorageKey::Groups), Some(groups));

        let items = vec![json!(1), json!("two")];
        storage.set_array(StorageKey::RegisteredProperties, &items);
        assert_eq!(storage.get_array(StorageKey::RegisteredProperties), Some(items));
    }

    #[test]
    fn unparseable_file_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        fs::write(dir.path().join(StorageKey::Groups.file_name()), b"{truncated").unwrap();
        assert_eq!(storage.get_dict(StorageKey::Groups), None);
    }

    #[test]
    fn type_mismatch_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        storage.set_string(StorageKey::SessionId, "not-a-number");
        assert_eq!(storage.get_number(StorageKey::SessionId), None);
    }

    #[test]
    fn remove_and_reset() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        storage.set_string(StorageKey::DistinctId, "user-1");
        storage.remove(StorageKey::DistinctId);
        assert_eq!(storage.get_string(StorageKey::DistinctId), None);
        // removing an absent key is fine
        storage.remove(StorageKey::DistinctId);

        storage.set_bool(StorageKey::OptOut, true);
        storage.reset();
        assert_eq!(storage.get_bool(StorageKey::OptOut), None);
        assert!(storage.root().is_dir());
    }

    #[test]
    fn no_temp_files_remain_after_writes() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        storage.set_string(StorageKey::DistinctId, "user-1");
        storage.set_bool(StorageKey::OptOut, false);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn queue_dir_defaults_under_root_and_persists() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        let queue_dir = storage.queue_dir();
        assert_eq!(queue_dir, dir.path().join("queue"));
        // recorded back under the queueFolder key
        assert_eq!(
            storage.get_string(StorageKey::QueueFolder).as_deref(),
            Some(queue_dir.to_string_lossy().as_ref())
        );
    }
}
