use super::cache::RecencyCache;
use super::codec;
use super::index::{Entry, Index};
use crate::error::{Error, Result};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default recency cache capacity, in entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// A single-file log-structured key-value store in the BitCask lineage,
/// with per-key TTL expiry and a bounded recency cache in front of log
/// reads.
///
/// Every mutation appends a framed, checksummed JSON record to the log and
/// syncs it before returning. An in-memory index maps each live key to the
/// position of its most recent put record; deletes append a tombstone
/// record. The index is rebuilt by scanning the log on open, where a torn
/// record at the tail (from a crash mid-write) is truncated away. Replaced
/// values, tombstones, and expired records accumulate as garbage until an
/// explicit compaction rewrites the log and atomically replaces it.
///
/// Expiry is lazy: an expired key is still indexed until a read finds it
/// expired and drops it, or a compaction skips it. The recency cache holds
/// decoded values of recently read or written keys and is consulted only
/// after the expiry check, so it can never serve an expired value.
///
/// The store is single-writer, single-reader: operations take `&mut self`
/// and run to completion. Hosts that share a store across threads must
/// serialize access through their own critical section.
pub struct BitStore {
    /// The active append-only log file.
    log: Log,
    /// Maps live keys to the position of their most recent put record.
    index: Index,
    /// Caches recently used values, bypassing log reads.
    cache: RecencyCache,
    /// Operation counters since open. Not persisted.
    counters: Counters,
}

/// A log record. Framing and checksumming are the codec's concern; the
/// record itself is a single-line JSON object tagged by operation.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Record {
    Put { key: String, value: Value, expiry: u64 },
    Delete { key: String },
}

/// Counters for the current process's activity since open.
#[derive(Default)]
struct Counters {
    puts: u64,
    deletes: u64,
    last_compaction: Option<u64>,
}

/// A point-in-time snapshot of store statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct Stats {
    pub keys_in_index: usize,
    pub keys_in_cache: usize,
    pub put_count: u64,
    pub delete_count: u64,
    pub file_size_bytes: u64,
    pub last_compaction_time: Option<u64>,
}

/// Current Unix time in whole seconds.
fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

impl BitStore {
    /// Opens or creates a store at the given path with the default cache
    /// capacity.
    pub fn open(path: PathBuf) -> Result<Self> {
        Self::open_with_capacity(path, DEFAULT_CACHE_CAPACITY)
    }

    /// Opens or creates a store with the given cache capacity, rebuilding
    /// the index from the log.
    pub fn open_with_capacity(path: PathBuf, cache_capacity: usize) -> Result<Self> {
        let cache = RecencyCache::new(cache_capacity)?;
        log::info!("Opening store {} with cache capacity {}", path.display(), cache.cap());
        let mut log = Log::new(path)?;
        let index = log.build_index()?;
        log::info!("Indexed {} keys in {}", index.len(), log.path.display());
        Ok(Self { log, index, cache, counters: Counters::default() })
    }

    /// Writes a value for a key. A `ttl` of `None` or `Some(0)` stores the
    /// value without expiry; otherwise the key expires `ttl` seconds from
    /// now.
    pub fn put(&mut self, key: &str, value: Value, ttl: Option<u64>) -> Result<()> {
        let expiry = match ttl {
            None | Some(0) => 0,
            Some(secs) => now_secs() + secs,
        };
        self.write_put(key, value, expiry)
    }

    /// Reads the value for a key, or None if the key is absent or expired.
    /// The first read after expiry drops the key from the index and cache.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>> {
        let Some(entry) = self.index.get(key).copied() else {
            return Ok(None);
        };
        if entry.expired(now_secs()) {
            self.index.remove(key);
            self.cache.invalidate(key);
            return Ok(None);
        }
        if let Some(value) = self.cache.lookup(key) {
            return Ok(Some(value.clone()));
        }
        let value = self.read_value(&entry)?;
        self.cache.insert(key.to_string(), value.clone());
        Ok(Some(value))
    }

    /// Deletes a key, returning true if it was live. Always appends a
    /// tombstone, so deleting an absent key is idempotent with respect to
    /// the log and needs no prior read.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let record = Record::Delete { key: key.to_string() };
        let payload =
            serde_json::to_vec(&record).map_err(|err| Error::NotSerializable(err.to_string()))?;
        self.log.append(&codec::encode(&payload))?;
        self.log.sync()?;
        let was_live = self.index.get(key).is_some_and(|e| !e.expired(now_secs()));
        self.index.remove(key);
        self.cache.invalidate(key);
        self.counters.deletes += 1;
        Ok(was_live)
    }

    /// Resets a key's expiry to `secs` seconds from now by rewriting its
    /// record through the put path; the replaced record becomes garbage for
    /// the next compaction. Errors with `NotFound` on a missing or expired
    /// key.
    pub fn ttl(&mut self, key: &str, secs: u64) -> Result<()> {
        let Some(entry) = self.index.get(key).copied() else {
            return Err(Error::NotFound);
        };
        let now = now_secs();
        if entry.expired(now) {
            self.index.remove(key);
            self.cache.invalidate(key);
            return Err(Error::NotFound);
        }
        let value = self.read_value(&entry)?;
        self.write_put(key, value, now + secs)
    }

    /// Compacts the log by writing the live, unexpired records to a new
    /// file and atomically replacing the current log with it. Replaced
    /// values, tombstones, and expired records are dropped, and the cache
    /// is cleared.
    pub fn compact(&mut self) -> Result<()> {
        let old_size = self.log.size()?;
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");
        let (mut new_log, new_index) = self.write_live(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path)?;
        new_log.path = self.log.path.clone();

        log::info!(
            "Compacted {} from {} to {} bytes",
            new_log.path.display(),
            old_size,
            new_log.size()?
        );
        self.log = new_log;
        self.index = new_index;
        self.cache.clear();
        self.counters.last_compaction = Some(now_secs());
        Ok(())
    }

    /// Returns a snapshot of store statistics.
    pub fn stats(&mut self) -> Result<Stats> {
        Ok(Stats {
            keys_in_index: self.index.len(),
            keys_in_cache: self.cache.len(),
            put_count: self.counters.puts,
            delete_count: self.counters.deletes,
            file_size_bytes: self.log.size()?,
            last_compaction_time: self.counters.last_compaction,
        })
    }

    /// Flushes and closes the store. Dropping the store has the same
    /// effect; consuming it here surfaces flush errors to the caller.
    pub fn close(mut self) -> Result<()> {
        self.log.sync()
    }

    /// Appends a put record and updates the index and cache. Also the
    /// write path for TTL updates.
    fn write_put(&mut self, key: &str, value: Value, expiry: u64) -> Result<()> {
        let record = Record::Put { key: key.to_string(), value, expiry };
        let payload =
            serde_json::to_vec(&record).map_err(|err| Error::NotSerializable(err.to_string()))?;
        let framed = codec::encode(&payload);
        let pos = self.log.append(&framed)?;
        self.log.sync()?;
        let entry = Entry {
            offset: pos + (framed.len() - payload.len() - 1) as u64,
            len: payload.len() as u32,
            checksum: codec::checksum(&payload),
            expiry,
        };
        self.index.set(key.to_string(), entry);
        if let Record::Put { value, .. } = record {
            self.cache.insert(key.to_string(), value);
        }
        self.counters.puts += 1;
        Ok(())
    }

    /// Reads and verifies a record's value from the log, bypassing the
    /// cache. An integrity failure on an indexed record is data
    /// corruption: fatal for the read, but the store remains usable.
    fn read_value(&mut self, entry: &Entry) -> Result<Value> {
        let payload = match self.log.read_exact_at(entry.offset, entry.len as usize) {
            Ok(payload) => payload,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Self::corruption(entry, "record extends beyond end of log".to_string()))
            }
            Err(err) => return Err(err),
        };
        let computed = codec::checksum(&payload);
        if computed != entry.checksum {
            return Err(Self::corruption(
                entry,
                format!("checksum mismatch: stored {:#010x}, computed {computed:#010x}", entry.checksum),
            ));
        }
        match serde_json::from_slice(&payload) {
            Ok(Record::Put { value, .. }) => Ok(value),
            Ok(Record::Delete { .. }) => {
                Err(Self::corruption(entry, "indexed record is a tombstone".to_string()))
            }
            Err(err) => Err(Self::corruption(entry, err.to_string())),
        }
    }

    fn corruption(entry: &Entry, reason: String) -> Error {
        Error::DataCorruption { offset: entry.offset, reason }
    }

    /// Writes the live records of the current log into a new log file at
    /// the given path, in key order, and returns it along with its index.
    /// Payload bytes are copied verbatim, so values and expiries survive
    /// unchanged.
    fn write_live(&mut self, path: PathBuf) -> Result<(Log, Index)> {
        let now = now_secs();
        let mut new_index = Index::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // truncate file if it exists
        for key in self.index.keys() {
            let Some(entry) = self.index.get(&key).copied() else { continue };
            if entry.expired(now) {
                continue;
            }
            let payload = self.log.read_exact_at(entry.offset, entry.len as usize)?;
            if codec::checksum(&payload) != entry.checksum {
                return Err(Self::corruption(&entry, "checksum mismatch during compaction".to_string()));
            }
            let framed = codec::encode(&payload);
            let pos = new_log.append(&framed)?;
            new_index.set(
                key,
                Entry { offset: pos + (framed.len() - payload.len() - 1) as u64, ..entry },
            );
        }
        new_log.sync()?;
        Ok((new_log, new_index))
    }
}

/// Flush the log when the store is closed.
impl Drop for BitStore {
    fn drop(&mut self) {
        if let Err(error) = self.log.sync() {
            log::error!("failed to flush log: {error}")
        }
    }
}

/// The append-only log file, holding a sequence of codec-framed records
/// with no file-level header. Appends go through a dedicated write handle
/// positioned at end-of-file; point reads go through an independent read
/// handle so they never disturb the append position.
struct Log {
    /// Path to the log file.
    path: PathBuf,
    /// Append handle, also used for truncation and durability syncs.
    file: std::fs::File,
    /// Independent read handle for point reads.
    reader: std::fs::File,
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out an
    /// exclusive lock on the file until the handles are dropped, or errors
    /// if the lock is already held.
    fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()?;
        let reader = std::fs::OpenOptions::new().read(true).open(&path)?;
        Ok(Self { path, file, reader })
    }

    /// Builds the key index by scanning the log, honoring last-write-wins
    /// and tombstones. Expired keys are still indexed, since a later
    /// record may supersede them; readers drop them lazily. The first torn
    /// or damaged record is treated as the logical end of the log: the
    /// scan stops there and the file is truncated to the last valid record
    /// boundary, so a torn tail cannot accumulate across restarts.
    fn build_index(&mut self) -> Result<Index> {
        let mut index = Index::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.reader);
        r.seek(SeekFrom::Start(0))?;
        let mut pos = 0;

        while pos < file_len {
            match Self::read_record(&mut r) {
                Ok(Some((Record::Put { key, expiry, .. }, frame))) => {
                    let entry = Entry {
                        offset: pos + frame.header_len as u64,
                        len: frame.payload.len() as u32,
                        checksum: frame.checksum,
                        expiry,
                    };
                    pos += frame.encoded_len() as u64;
                    index.set(key, entry);
                }
                Ok(Some((Record::Delete { key }, frame))) => {
                    pos += frame.encoded_len() as u64;
                    index.remove(&key);
                }
                Ok(None) => break,
                Err(
                    err @ (Error::MalformedHeader(_)
                    | Error::MalformedFrame(_)
                    | Error::ChecksumMismatch { .. }
                    | Error::CorruptRecord(_)),
                ) => {
                    log::error!("Found invalid record at offset {pos}, truncating log: {err}");
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(index)
    }

    /// Reads the next record at the scan position: a frame via the codec,
    /// then the payload as a record. A checksum-valid payload that is not
    /// a record is `CorruptRecord`.
    fn read_record<R: BufRead>(r: &mut R) -> Result<Option<(Record, codec::Frame)>> {
        let Some(frame) = codec::read_frame(r)? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&frame.payload)
            .map_err(|err| Error::CorruptRecord(err.to_string()))?;
        Ok(Some((record, frame)))
    }

    /// Appends raw bytes to the log, returning the offset of the first
    /// byte written. Durability needs an explicit `sync()`.
    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        Ok(pos)
    }

    /// Reads exactly `len` bytes at the given offset via the read handle.
    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Current log size in bytes.
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Flushes OS buffers to stable storage. A mutation is durable once
    /// this returns.
    fn sync(&mut self) -> Result<()> {
        // Don't fsync in tests, to speed them up.
        #[cfg(not(test))]
        self.file.sync_all()?;
        Ok(())
    }
}
