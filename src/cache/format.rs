//! On-disk layout of a cache partition.
//!
//! ```text
//! <root>/<family>/<fingerprint-hex>/meta.cbor     partition metadata
//! <root>/<family>/<fingerprint-hex>/records.cbor  framed records
//! ```
//!
//! Each frame is `[len: u32 LE][checksum: 8 bytes][payload: CBOR record]`.
//! Only the first `committed` frames (spanning `committed_bytes`) are valid,
//! anything past that is the remains of an interrupted flush and is ignored
//! on read and truncated on the next flush. `meta.cbor` is replaced through a
//! rename, so readers always see either the old or the new commit point.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, Record};
use crate::error::CacheError;
use crate::task::Params;

pub(crate) const FILE_META: &str = "meta.cbor";
pub(crate) const FILE_RECORDS: &str = "records.cbor";

const FRAME_HEADER: usize = 4 + 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PartitionMeta {
    pub family: String,
    pub params: Params,
    pub fingerprint: Hash32,
    pub finalized: bool,
    pub committed: u64,
    pub committed_bytes: u64,
    pub once: Record,
    pub last_flush_ms: Option<u64>,
}

impl PartitionMeta {
    pub fn empty(family: &str, params: &Params) -> Self {
        Self {
            family: family.to_string(),
            params: params.clone(),
            fingerprint: params.fingerprint(),
            finalized: false,
            committed: 0,
            committed_bytes: 0,
            once: Record::new(),
            last_flush_ms: None,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn read_meta(dir: &Utf8Path) -> Result<Option<PartitionMeta>, CacheError> {
    let path = dir.join(FILE_META);

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let meta = ciborium::from_reader(BufReader::new(file))?;
    Ok(Some(meta))
}

/// Atomically replaces the partition metadata.
pub(crate) fn write_meta(dir: &Utf8Path, meta: &PartitionMeta) -> Result<(), CacheError> {
    let path = dir.join(FILE_META);
    let temp = dir.join(format!("{FILE_META}.tmp"));

    {
        let file = File::create(&temp)?;
        let mut writer = BufWriter::new(file);
        ciborium::into_writer(meta, &mut writer)?;
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
    }

    fs::rename(&temp, &path)?;
    Ok(())
}

/// Appends one encoded frame for `record` to `buffer`.
pub(crate) fn encode_frame(record: &Record, buffer: &mut Vec<u8>) -> Result<(), CacheError> {
    let mut payload = Vec::new();
    ciborium::into_writer(record, &mut payload)?;

    let len = u32::try_from(payload.len()).map_err(|_| {
        CacheError::FileSystem(std::io::Error::other("record exceeds 4 GiB"))
    })?;

    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(&checksum(&payload));
    buffer.extend_from_slice(&payload);

    Ok(())
}

/// Decodes the committed frames of a partition.
pub(crate) fn read_records(
    dir: &Utf8Path,
    meta: &PartitionMeta,
) -> Result<Vec<Record>, CacheError> {
    if meta.committed == 0 {
        return Ok(Vec::new());
    }

    let path = dir.join(FILE_RECORDS);
    let mut bytes = Vec::with_capacity(meta.committed_bytes as usize);
    File::open(&path)?
        .take(meta.committed_bytes)
        .read_to_end(&mut bytes)?;

    if (bytes.len() as u64) < meta.committed_bytes {
        return Err(corrupt(&path, "shorter than the committed length"));
    }

    let mut records = Vec::with_capacity(meta.committed as usize);
    let mut rest = bytes.as_slice();

    while records.len() < meta.committed as usize {
        if rest.len() < FRAME_HEADER {
            return Err(corrupt(&path, "truncated frame header"));
        }

        let (len, tail) = rest.split_at(4);
        let (sum, tail) = tail.split_at(8);
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;

        if tail.len() < len {
            return Err(corrupt(&path, "truncated frame payload"));
        }

        let (payload, tail) = tail.split_at(len);
        if checksum(payload).as_slice() != sum {
            return Err(corrupt(&path, "checksum mismatch"));
        }

        records.push(ciborium::from_reader(payload)?);
        rest = tail;
    }

    Ok(records)
}

fn checksum(payload: &[u8]) -> [u8; 8] {
    let hash = blake3::hash(payload);
    let mut sum = [0u8; 8];
    sum.copy_from_slice(&hash.as_bytes()[..8]);
    sum
}

fn corrupt(path: &Utf8Path, why: &str) -> CacheError {
    CacheError::Corrupt(Utf8PathBuf::from(path), why.to_string())
}

/// Writes `buffer` right after the committed bytes, dropping any leftovers
/// of an earlier interrupted write, and syncs the data.
pub(crate) fn append_frames(
    dir: &Utf8Path,
    committed_bytes: u64,
    buffer: &[u8],
) -> Result<(), CacheError> {
    use std::io::{Seek, SeekFrom};

    let path = dir.join(FILE_RECORDS);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;

    file.set_len(committed_bytes)?;
    file.seek(SeekFrom::Start(committed_bytes))?;
    file.write_all(buffer)?;
    file.sync_data()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn record(i: i64) -> Record {
        Record::from([("i".to_string(), Value::from(i))])
    }

    fn dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, path)
    }

    fn commit(dir: &Utf8Path, meta: &mut PartitionMeta, records: &[Record]) {
        let mut buffer = Vec::new();
        for record in records {
            encode_frame(record, &mut buffer).unwrap();
        }
        append_frames(dir, meta.committed_bytes, &buffer).unwrap();
        meta.committed += records.len() as u64;
        meta.committed_bytes += buffer.len() as u64;
        write_meta(dir, meta).unwrap();
    }

    #[test]
    fn test_meta_roundtrip() {
        let (_temp, dir) = dir();
        let meta = PartitionMeta::empty("sim", &Params::new().with("power", 1));

        assert_eq!(read_meta(&dir).unwrap(), None);
        write_meta(&dir, &meta).unwrap();
        assert_eq!(read_meta(&dir).unwrap(), Some(meta));
    }

    #[test]
    fn test_uncommitted_tail_is_ignored() {
        let (_temp, dir) = dir();
        let mut meta = PartitionMeta::empty("sim", &Params::new());

        commit(&dir, &mut meta, &[record(0), record(1)]);

        // an interrupted flush left a partial frame behind
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(dir.join(FILE_RECORDS))
            .unwrap();
        file.write_all(&[7, 0, 0, 0, 1, 2]).unwrap();

        let records = read_records(&dir, &meta).unwrap();
        assert_eq!(records, vec![record(0), record(1)]);

        // the next commit overwrites the garbage instead of appending to it
        commit(&dir, &mut meta, &[record(2)]);
        let records = read_records(&dir, &meta).unwrap();
        assert_eq!(records, vec![record(0), record(1), record(2)]);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let (_temp, dir) = dir();
        let mut meta = PartitionMeta::empty("sim", &Params::new());
        commit(&dir, &mut meta, &[record(0)]);

        let path = dir.join(FILE_RECORDS);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_records(&dir, &meta),
            Err(CacheError::Corrupt(_, _))
        ));
    }
}
