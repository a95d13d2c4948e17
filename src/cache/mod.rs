//! Durable, incrementally written task output.
//!
//! The store is partitioned per task identity: every family gets a directory
//! under the cache root and every instance a partition inside it, see
//! [`format`] for the layout. Each partition has a single writer, the
//! [`CacheHandle`] held by the worker running that task, so no locking is
//! needed across tasks.

mod format;
mod handle;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{Hash32, Record, Value};
use crate::error::CacheError;
use crate::task::{Params, TaskId};

use self::format::PartitionMeta;

pub use handle::{CacheHandle, FlushPolicy};

/// Persisted state of a task instance as seen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Nothing was ever written.
    Missing,
    /// Records exist, but the producing run never completed.
    Incomplete,
    /// The producing run completed.
    Finalized,
}

impl RecordState {
    pub fn is_fresh(self) -> bool {
        matches!(self, RecordState::Finalized)
    }
}

/// Everything stored for one task instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub id: TaskId,
    /// Records in the order they were produced.
    pub records: Vec<Record>,
    /// One-shot fields.
    pub once: Record,
    pub finalized: bool,
    pub last_flush: Option<SystemTime>,
}

impl CacheRecord {
    pub fn params(&self) -> &Params {
        self.id.params()
    }

    pub fn fingerprint(&self) -> Hash32 {
        self.id.fingerprint()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Values of a single field across all records, skipping records that
    /// lack it.
    pub fn column<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.records.iter().filter_map(move |record| record.get(field))
    }
}

/// Result of [`CacheStore::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    /// A family with one parameterless instance.
    Single(CacheRecord),
    /// A parameter sweep, keyed by each instance's fingerprint.
    Sweep(BTreeMap<Hash32, CacheRecord>),
}

impl Loaded {
    pub fn len(&self) -> usize {
        match self {
            Loaded::Single(_) => 1,
            Loaded::Sweep(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> impl Iterator<Item = &CacheRecord> {
        let (single, sweep) = match self {
            Loaded::Single(record) => (Some(record), None),
            Loaded::Sweep(map) => (None, Some(map.values())),
        };
        single.into_iter().chain(sweep.into_iter().flatten())
    }

    pub fn single(&self) -> Option<&CacheRecord> {
        match self {
            Loaded::Single(record) => Some(record),
            Loaded::Sweep(_) => None,
        }
    }

    /// Finds the instance loaded with exactly these parameters.
    pub fn get(&self, params: &Params) -> Option<&CacheRecord> {
        let fingerprint = params.fingerprint();
        self.records()
            .find(|record| record.fingerprint() == fingerprint)
    }

    /// True when every loaded instance is finalized.
    pub fn is_complete(&self) -> bool {
        self.records().all(|record| record.finalized)
    }
}

/// A partition found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub family: String,
    pub fingerprint: Hash32,
    pub path: Utf8PathBuf,
}

/// Root of the persisted cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
    policy: FlushPolicy,
}

impl CacheStore {
    pub fn new(root: impl Into<Utf8PathBuf>, policy: FlushPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub(crate) fn set_policy(&mut self, policy: FlushPolicy) {
        self.policy = policy;
    }

    fn partition_dir(&self, id: &TaskId) -> Utf8PathBuf {
        self.root.join(id.name()).join(id.fingerprint().to_hex())
    }

    /// Acquires the writer of `id`'s partition, discarding whatever a
    /// previous run left there. The returned handle flushes when dropped.
    pub fn open(&self, id: &TaskId) -> Result<CacheHandle, CacheError> {
        let dir = self.partition_dir(id);
        fs::create_dir_all(&dir)?;

        // the reset meta commits zero records, so from here on the old
        // records file is never read
        let meta = PartitionMeta::empty(id.name(), id.params());
        format::write_meta(&dir, &meta)?;

        match fs::remove_file(dir.join(format::FILE_RECORDS)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        tracing::debug!(task = %id, path = %dir, "opened cache partition");
        Ok(CacheHandle::new(id.clone(), dir, meta, self.policy))
    }

    /// Freshness of `id`'s record, read from the partition metadata only.
    pub fn state(&self, id: &TaskId) -> Result<RecordState, CacheError> {
        let state = match format::read_meta(&self.partition_dir(id))? {
            None => RecordState::Missing,
            Some(meta) if meta.finalized => RecordState::Finalized,
            Some(_) => RecordState::Incomplete,
        };
        Ok(state)
    }

    /// Reads one instance, `None` if it has no partition.
    pub fn read(&self, id: &TaskId) -> Result<Option<CacheRecord>, CacheError> {
        read_partition(&self.partition_dir(id))
    }

    /// Reads the given instances of a task family.
    ///
    /// Only partitions of `instances` are read, data left on disk by
    /// instances that are no longer registered is ignored. With no filter, a
    /// family consisting only of its parameterless instance loads as
    /// [`Loaded::Single`]. Otherwise every instance whose parameters contain
    /// `filter` is returned keyed by fingerprint. Unfinalized records are
    /// included and carry `finalized == false`.
    pub fn load(
        &self,
        name: &str,
        instances: &[TaskId],
        filter: Option<&Params>,
    ) -> Result<Loaded, CacheError> {
        let mut found = BTreeMap::new();

        for id in instances.iter().filter(|id| id.name() == name) {
            if filter.is_some_and(|filter| !id.params().matches(filter)) {
                continue;
            }

            if let Some(record) = self.read(id)? {
                found.insert(record.fingerprint(), record);
            }
        }

        if found.is_empty() {
            return Err(CacheError::NotFound(name.to_string()));
        }

        let single = filter.is_none()
            && instances.len() == 1
            && instances[0].params().is_empty();

        if single {
            if let Some((_, record)) = found.pop_first() {
                return Ok(Loaded::Single(record));
            }
        }

        Ok(Loaded::Sweep(found))
    }

    /// Removes `id`'s partition. Returns whether there was one.
    pub fn remove(&self, id: &TaskId) -> Result<bool, CacheError> {
        let dir = self.partition_dir(id);
        if !dir.exists() {
            return Ok(false);
        }

        fs::remove_dir_all(&dir)?;
        remove_if_empty(dir.parent())?;

        tracing::info!(task = %id, "removed cached data");
        Ok(true)
    }

    /// Lists every partition under the cache root.
    pub fn partitions(&self) -> Result<Vec<Partition>, CacheError> {
        let mut found = Vec::new();

        if !self.root.exists() {
            return Ok(found);
        }

        for family in self.root.read_dir_utf8()? {
            let family = family?;
            if !family.file_type()?.is_dir() {
                continue;
            }

            for entry in family.path().read_dir_utf8()? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }

                if let Some(fingerprint) = Hash32::from_hex(entry.file_name()) {
                    found.push(Partition {
                        family: family.file_name().to_string(),
                        fingerprint,
                        path: entry.path().to_path_buf(),
                    });
                }
            }
        }

        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    /// Removes every partition not in `keep`, and family directories left
    /// empty by that. Returns the removed paths.
    pub fn retain(&self, keep: &BTreeSet<TaskId>) -> Result<Vec<Utf8PathBuf>, CacheError> {
        let keep: BTreeSet<(&str, Hash32)> = keep
            .iter()
            .map(|id| (id.name(), id.fingerprint()))
            .collect();

        let mut removed = Vec::new();

        for partition in self.partitions()? {
            if keep.contains(&(partition.family.as_str(), partition.fingerprint)) {
                continue;
            }

            fs::remove_dir_all(&partition.path)?;
            tracing::info!(path = %partition.path, "removed orphaned partition");

            if let Some(family) = remove_if_empty(partition.path.parent())? {
                removed.push(partition.path);
                removed.push(family);
            } else {
                removed.push(partition.path);
            }
        }

        Ok(removed)
    }
}

fn read_partition(dir: &Utf8Path) -> Result<Option<CacheRecord>, CacheError> {
    let Some(meta) = format::read_meta(dir)? else {
        return Ok(None);
    };

    if meta.fingerprint != meta.params.fingerprint() {
        return Err(CacheError::Corrupt(
            dir.to_path_buf(),
            "parameters do not match the fingerprint".into(),
        ));
    }

    let records = format::read_records(dir, &meta)?;
    let last_flush = meta
        .last_flush_ms
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));

    Ok(Some(CacheRecord {
        id: TaskId::new(&meta.family, meta.params),
        records,
        once: meta.once,
        finalized: meta.finalized,
        last_flush,
    }))
}

fn remove_if_empty(dir: Option<&Utf8Path>) -> Result<Option<Utf8PathBuf>, CacheError> {
    let Some(dir) = dir else {
        return Ok(None);
    };

    if dir.read_dir_utf8()?.next().is_none() {
        fs::remove_dir(dir)?;
        return Ok(Some(dir.to_path_buf()));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(policy: FlushPolicy) -> (tempfile::TempDir, CacheStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        (temp, CacheStore::new(root, policy))
    }

    fn record(i: i64) -> Record {
        Record::from([("i".to_string(), Value::from(i))])
    }

    fn never() -> FlushPolicy {
        FlushPolicy {
            max_bytes: usize::MAX,
            interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_open_append_finalize() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        assert_eq!(store.state(&id).unwrap(), RecordState::Missing);

        let mut handle = store.open(&id).unwrap();
        for i in 0..10 {
            handle.append(&record(i)).unwrap();
        }
        assert_eq!(store.state(&id).unwrap(), RecordState::Incomplete);

        handle.finalize().unwrap();
        assert_eq!(store.state(&id).unwrap(), RecordState::Finalized);

        let read = store.read(&id).unwrap().unwrap();
        assert_eq!(read.len(), 10);
        assert!(read.finalized);
        assert!(read.last_flush.is_some());
    }

    #[test]
    fn test_size_threshold_flushes() {
        let (_temp, store) = store(FlushPolicy {
            max_bytes: 1,
            interval: Duration::from_secs(3600),
        });
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        assert!(handle.append(&record(0)).unwrap());
        assert_eq!(handle.committed(), 1);
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn test_interval_flushes() {
        let (_temp, store) = store(FlushPolicy {
            max_bytes: usize::MAX,
            interval: Duration::ZERO,
        });
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        assert!(handle.append(&record(0)).unwrap());
        assert_eq!(handle.committed(), 1);
    }

    #[test]
    fn test_drop_keeps_partial_output() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        {
            let mut handle = store.open(&id).unwrap();
            handle.append(&record(0)).unwrap();
            handle.append(&record(1)).unwrap();
        }

        let read = store.read(&id).unwrap().unwrap();
        assert_eq!(read.records, vec![record(0), record(1)]);
        assert!(!read.finalized);
    }

    #[test]
    fn test_reopen_resets_partition() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        handle.append(&record(0)).unwrap();
        handle.finalize().unwrap();
        drop(handle);

        let handle = store.open(&id).unwrap();
        drop(handle);

        let read = store.read(&id).unwrap().unwrap();
        assert!(read.is_empty());
        assert!(!read.finalized);
    }

    #[test]
    fn test_once_fields_are_stored() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        handle
            .set_once(Record::from([("avg".into(), Value::from(1.5))]))
            .unwrap();
        handle
            .set_once(Record::from([("avg".into(), Value::from(2.5))]))
            .unwrap();
        handle.finalize().unwrap();

        let read = store.read(&id).unwrap().unwrap();
        assert_eq!(read.once.get("avg"), Some(&Value::from(2.5)));
    }

    #[test]
    fn test_failed_flush_is_retried_once() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        handle.append(&record(0)).unwrap();
        handle.failing_writes = 1;
        handle.flush().unwrap();
        assert_eq!(handle.committed(), 1);
        assert_eq!(handle.failing_writes, 0);

        handle.append(&record(1)).unwrap();
        handle.failing_writes = 2;
        assert!(matches!(handle.flush(), Err(CacheError::Flush(..))));
        assert_eq!(handle.committed(), 1);
        assert_eq!(handle.pending(), 1);

        // the buffer survives a failed flush
        handle.finalize().unwrap();
        assert_eq!(store.read(&id).unwrap().unwrap().records, vec![record(0), record(1)]);
    }

    #[test]
    fn test_flush_into_vanished_partition_fails() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        handle.append(&record(0)).unwrap();
        fs::remove_dir_all(store.partition_dir(&id)).unwrap();

        match handle.flush() {
            Err(CacheError::Flush(failed, cause)) => {
                assert_eq!(failed, id);
                assert!(matches!(*cause, CacheError::FileSystem(_)));
            }
            other => panic!("expected a flush error, got {other:?}"),
        }
    }

    #[test]
    fn test_append_after_finalize_fails() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        handle.finalize().unwrap();
        assert!(matches!(
            handle.append(&record(0)),
            Err(CacheError::Finalized(_))
        ));
    }

    #[test]
    fn test_load_single_and_sweep() {
        let (_temp, store) = store(never());

        let mut handle = store.open(&TaskId::named("vis")).unwrap();
        handle.append(&record(0)).unwrap();
        handle.finalize().unwrap();

        for power in 0..3 {
            let id = TaskId::new("sim", Params::new().with("power", power));
            let mut handle = store.open(&id).unwrap();
            handle.append(&record(power)).unwrap();
            handle.finalize().unwrap();
        }

        let sims: Vec<TaskId> = (0..3)
            .map(|power| TaskId::new("sim", Params::new().with("power", power)))
            .collect();

        let vis = store.load("vis", &[TaskId::named("vis")], None).unwrap();
        assert_eq!(vis.single().map(CacheRecord::len), Some(1));

        let sim = store.load("sim", &sims, None).unwrap();
        assert_eq!(sim.len(), 3);
        assert!(sim.is_complete());
        let one = sim.get(&Params::new().with("power", 1)).unwrap();
        assert_eq!(one.records, vec![record(1)]);

        let filtered = store
            .load("sim", &sims, Some(&Params::new().with("power", 2)))
            .unwrap();
        assert_eq!(filtered.len(), 1);

        assert!(matches!(
            store.load("missing", &[TaskId::named("missing")], None),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_ignores_unlisted_partitions() {
        let (_temp, store) = store(never());

        let ids: Vec<TaskId> = (0..4)
            .map(|power| TaskId::new("sim", Params::new().with("power", power)))
            .collect();
        for id in &ids {
            store.open(id).unwrap().finalize().unwrap();
        }

        let loaded = store.load("sim", &ids[..3], None).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.get(ids[3].params()).is_none());

        // the leftover partition is still on disk for `retain` to find
        assert_eq!(store.partitions().unwrap().len(), 4);
    }

    #[test]
    fn test_reopen_never_leaves_finalized_meta_without_records() {
        let (_temp, store) = store(never());
        let id = TaskId::named("sim");

        let mut handle = store.open(&id).unwrap();
        handle.append(&record(0)).unwrap();
        handle.finalize().unwrap();
        drop(handle);

        // a reset interrupted right after the meta was rewritten
        let dir = store.partition_dir(&id);
        format::write_meta(&dir, &PartitionMeta::empty(id.name(), id.params())).unwrap();

        assert_eq!(store.state(&id).unwrap(), RecordState::Incomplete);
        let read = store.read(&id).unwrap().unwrap();
        assert!(read.is_empty());

        // a completed reset leaves an empty, unfinalized partition
        drop(store.open(&id).unwrap());
        assert!(!store.partition_dir(&id).join(format::FILE_RECORDS).exists());
        assert_eq!(store.state(&id).unwrap(), RecordState::Incomplete);
    }

    #[test]
    fn test_remove_and_retain() {
        let (_temp, store) = store(never());
        let a = TaskId::named("a");
        let b = TaskId::new("b", Params::new().with("x", 1));

        drop(store.open(&a).unwrap());
        drop(store.open(&b).unwrap());
        assert_eq!(store.partitions().unwrap().len(), 2);

        assert!(store.remove(&a).unwrap());
        assert!(!store.remove(&a).unwrap());
        assert!(!store.root().join("a").exists());

        let removed = store.retain(&BTreeSet::new()).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.partitions().unwrap().is_empty());
    }
}
