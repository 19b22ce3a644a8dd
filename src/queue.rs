use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Directory that file names rejected at construction are moved into.
const MALFORMED_DIR: &str = "malformed";

/// A record handed out by [`PersistentQueue::peek`]: the stable on-disk
/// name it can later be removed by, plus its contents.
#[derive(Debug, Clone, PartialEq)]
pub struct PeekedRecord {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Crash-safe FIFO of opaque records rooted at a directory.
///
/// One file per record, named by fractional seconds since epoch; the numeric
/// sort of those names IS the queue order. The directory is the source of
/// truth across process restarts; the in-memory name sequence converges with
/// it after every operation.
///
/// I/O errors never propagate: a record that cannot be written is dropped
/// with a warning, a record that cannot be read is removed at peek time, and
/// the queue keeps serving whatever state it has. The directory must be
/// owned by exactly one instance.
pub struct PersistentQueue {
    dir: PathBuf,

    /// File names in ascending admission order. Held only around in-memory
    /// mutation, never across file I/O.
    items: Mutex<Vec<String>>,

    /// Last timestamp handed out. Forced strictly monotonic so names never
    /// collide within one instance, even when the clock stalls or steps back.
    last_stamp: Mutex<f64>,
}

impl PersistentQueue {
    /// Open (or create) the queue rooted at `dir`.
    ///
    /// Existing file names are parsed as fractional epoch seconds and sorted
    /// numerically; names that do not parse are moved aside into
    /// `malformed/` rather than silently ordered by string comparison.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %err, "failed to create queue directory");
        }

        let mut entries: Vec<(f64, String)> = Vec::new();
        match fs::read_dir(&dir) {
            Ok(listing) => {
                for entry in listing.flatten() {
                    let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                    if !is_file {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    match name.parse::<f64>() {
                        Ok(stamp) => entries.push((stamp, name)),
                        Err(_) => move_aside(&dir, &name),
                    }
                }
            }
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to list queue directory");
            }
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));

        let last_stamp = entries.last().map(|(stamp, _)| *stamp).unwrap_or(0.0);
        let items = entries.into_iter().map(|(_, name)| name).collect();

        Self {
            dir,
            items: Mutex::new(items),
            last_stamp: Mutex::new(last_stamp),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Count of currently tracked records.
    pub fn depth(&self) -> usize {
        self.items.lock().len()
    }

    /// Persist one record at the tail of the queue.
    ///
    /// A failed write drops the record entirely; nothing partial is tracked.
    pub fn add(&self, bytes: &[u8]) {
        let name = self.next_name();
        let path = self.dir.join(&name);
        if let Err(err) = fs::write(&path, bytes) {
            tracing::warn!(file = %path.display(), error = %err, "failed to persist record; dropping");
            return;
        }
        self.items.lock().push(name);
    }

    /// Read up to `n` records from the head, in admission order.
    ///
    /// An unreadable file is removed from disk, pruned from the sequence,
    /// and does not count toward `n`. Callers that intend to remove what
    /// they peeked should do so through [`discard`](Self::discard) with the
    /// returned names; positions can shift under a concurrent pop or trim,
    /// names cannot.
    pub fn peek(&self, n: usize) -> Vec<PeekedRecord> {
        let snapshot: Vec<String> = self.items.lock().clone();

        let mut records = Vec::new();
        let mut dead = Vec::new();
        for name in snapshot {
            if records.len() == n {
                break;
            }
            let path = self.dir.join(&name);
            match fs::read(&path) {
                Ok(bytes) => records.push(PeekedRecord { name, bytes }),
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "unreadable record; removing");
                    let _ = fs::remove_file(&path);
                    dead.push(name);
                }
            }
        }

        if !dead.is_empty() {
            self.items.lock().retain(|name| !dead.contains(name));
        }
        records
    }

    /// Remove the named records from memory and disk, wherever they now sit.
    ///
    /// Names are the stable identities handed out by [`peek`](Self::peek);
    /// a name that a concurrent pop or trim already removed is skipped
    /// silently.
    pub fn discard(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.items.lock().retain(|name| !names.contains(name));
        for name in names {
            let path = self.dir.join(name);
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(file = %path.display(), error = %err, "failed to remove discarded record");
                }
            }
        }
    }

    /// Delete up to `n` records from the head.
    pub fn pop(&self, n: usize) {
        let victims: Vec<String> = {
            let mut items = self.items.lock();
            let n = n.min(items.len());
            items.drain(..n).collect()
        };
        for name in victims {
            let path = self.dir.join(&name);
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(file = %path.display(), error = %err, "failed to remove popped record");
            }
        }
    }

    /// Remove the record at `index`; out-of-range indexes are ignored.
    pub fn delete(&self, index: usize) {
        let name = {
            let mut items = self.items.lock();
            if index >= items.len() {
                return;
            }
            items.remove(index)
        };
        let path = self.dir.join(&name);
        if let Err(err) = fs::remove_file(&path) {
            tracing::warn!(file = %path.display(), error = %err, "failed to remove deleted record");
        }
    }

    /// Drop oldest records until the depth is at most `max_depth`.
    pub fn trim(&self, max_depth: usize) {
        let excess = self.depth().saturating_sub(max_depth);
        if excess > 0 {
            tracing::warn!(excess, max_depth, "queue over admission cap; dropping oldest records");
            self.pop(excess);
        }
    }

    /// Remove the backing directory and recreate it empty.
    pub fn clear(&self) {
        self.items.lock().clear();
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "failed to remove queue directory");
        }
        if let Err(err) = fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "failed to recreate queue directory");
        }
    }

    fn next_name(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut last = self.last_stamp.lock();
        let stamp = if now > *last { now } else { *last + 1e-6 };
        *last = stamp;
        format!("{stamp:.6}")
    }
}

fn move_aside(dir: &Path, name: &str) {
    let target_dir = dir.join(MALFORMED_DIR);
    if let Err(err) = fs::create_dir_all(&target_dir) {
        tracing::warn!(dir = %target_dir.display(), error = %err, "failed to create malformed directory");
        return;
    }
    let from = dir.join(name);
    let to = target_dir.join(name);
    match fs::rename(&from, &to) {
        Ok(()) => {
            tracing::warn!(file = %from.display(), "record name is not a timestamp; moved aside")
        }
        Err(err) => {
            tracing::warn!(file = %from.display(), error = %err, "failed to move malformed record aside")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn contents(records: Vec<PeekedRecord>) -> Vec<Vec<u8>> {
        records.into_iter().map(|r| r.bytes).collect()
    }

    fn record_paths(dir: &Path) -> Vec<PathBuf> {
        let mut named: Vec<(f64, PathBuf)> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_type().unwrap().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.parse::<f64>().ok().map(|stamp| (stamp, e.path()))
            })
            .collect();
        named.sort_by(|a, b| a.0.total_cmp(&b.0));
        named.into_iter().map(|(_, p)| p).collect()
    }

    #[test]
    fn add_then_peek_preserves_order() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());

        queue.add(b"first");
        queue.add(b"second");
        queue.add(b"third");

        assert_eq!(queue.depth(), 3);
        let records = queue.peek(10);
        // names are the actual on-disk files, in admission order
        for record in &records {
            assert!(dir.path().join(&record.name).is_file());
        }
        assert_eq!(
            contents(records),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn peek_caps_at_n() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        for i in 0..5u8 {
            queue.add(&[i]);
        }
        assert_eq!(contents(queue.peek(2)), vec![vec![0], vec![1]]);
    }

    #[test]
    fn pop_removes_head_records_from_disk() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        queue.add(b"a");
        queue.add(b"b");
        queue.add(b"c");

        queue.pop(2);
        assert_eq!(queue.depth(), 1);
        assert_eq!(contents(queue.peek(10)), vec![b"c".to_vec()]);
        assert_eq!(record_paths(dir.path()).len(), 1);
    }

    #[test]
    fn delete_removes_by_position() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        queue.add(b"a");
        queue.add(b"b");
        queue.add(b"c");

        queue.delete(1);
        assert_eq!(contents(queue.peek(10)), vec![b"a".to_vec(), b"c".to_vec()]);

        // out of range is a no-op
        queue.delete(42);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn reopen_observes_prior_records_in_admission_order() {
        let dir = TempDir::new().unwrap();
        {
            let queue = PersistentQueue::new(dir.path());
            queue.add(b"one");
            queue.add(b"two");
        }
        // a fresh instance over the same directory sees everything
        let reopened = PersistentQueue::new(dir.path());
        assert_eq!(reopened.depth(), 2);
        assert_eq!(contents(reopened.peek(10)), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn reopened_queue_appends_after_existing_records() {
        let dir = TempDir::new().unwrap();
        {
            let queue = PersistentQueue::new(dir.path());
            queue.add(b"old");
        }
        let reopened = PersistentQueue::new(dir.path());
        reopened.add(b"new");
        assert_eq!(contents(reopened.peek(10)), vec![b"old".to_vec(), b"new".to_vec()]);
    }

    #[test]
    fn missing_file_is_pruned_at_peek() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        queue.add(b"gone");
        queue.add(b"kept");

        // simulate external tampering with the head record
        fs::remove_file(&record_paths(dir.path())[0]).unwrap();

        assert_eq!(contents(queue.peek(10)), vec![b"kept".to_vec()]);
        assert_eq!(queue.depth(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_removed_at_peek() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        queue.add(b"corrupt");
        queue.add(b"valid");

        let head = record_paths(dir.path())[0].clone();
        fs::set_permissions(&head, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read(&head).is_ok() {
            // privileged process; permission bits do not apply
            return;
        }

        assert_eq!(contents(queue.peek(10)), vec![b"valid".to_vec()]);
        assert_eq!(queue.depth(), 1);
        assert!(!head.exists());
    }

    #[test]
    fn discard_removes_by_name_despite_head_churn() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        queue.add(b"a");
        queue.add(b"b");
        queue.add(b"c");

        let peeked: Vec<String> = queue.peek(2).into_iter().map(|r| r.name).collect();
        // the head moves underneath the names captured at peek time
        queue.pop(1);
        queue.discard(&peeked);

        // b was removed by name, a's second removal was skipped, c survives
        assert_eq!(contents(queue.peek(10)), vec![b"c".to_vec()]);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn discard_of_unknown_names_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        queue.add(b"only");

        queue.discard(&["1234567890.000001".to_owned()]);
        assert_eq!(contents(queue.peek(10)), vec![b"only".to_vec()]);
    }

    #[test]
    fn non_numeric_names_are_moved_aside_at_construction() {
        let dir = TempDir::new().unwrap();
        {
            let queue = PersistentQueue::new(dir.path());
            queue.add(b"real");
        }
        fs::write(dir.path().join("not-a-timestamp"), b"junk").unwrap();

        let reopened = PersistentQueue::new(dir.path());
        assert_eq!(reopened.depth(), 1);
        assert_eq!(contents(reopened.peek(10)), vec![b"real".to_vec()]);
        assert!(dir.path().join(MALFORMED_DIR).join("not-a-timestamp").exists());
    }

    #[test]
    fn trim_drops_oldest_records() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        for i in 0..4u8 {
            queue.add(&[i]);
        }
        queue.trim(2);
        assert_eq!(contents(queue.peek(10)), vec![vec![2], vec![3]]);
    }

    #[test]
    fn clear_recreates_an_empty_directory() {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::new(dir.path());
        queue.add(b"x");

        queue.clear();
        assert_eq!(queue.depth(), 0);
        assert!(queue.dir().is_dir());
        assert!(record_paths(dir.path()).is_empty());

        // the queue keeps working after a clear
        queue.add(b"y");
        assert_eq!(contents(queue.peek(10)), vec![b"y".to_vec()]);
    }
}
