//! In-memory key directory for the log.

use std::collections::BTreeMap;

/// The position and expiry of the most recent put record for a key. The
/// checksum is copied from the record header, so reads can verify payload
/// integrity without revisiting the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Byte offset of the first payload byte within the log.
    pub offset: u64,
    /// Payload length in bytes.
    pub len: u32,
    /// CRC-32 of the payload.
    pub checksum: u32,
    /// Absolute expiry in Unix seconds, or 0 for no expiry.
    pub expiry: u64,
}

impl Entry {
    /// Whether the entry is past its expiry at the given time.
    pub fn expired(&self, now: u64) -> bool {
        self.expiry != 0 && self.expiry <= now
    }
}

/// Maps each live key to its most recent record. Last write wins; a
/// tombstone removes the mapping. Keys are kept ordered, which also makes
/// compaction output deterministic.
pub struct Index {
    entries: BTreeMap<String, Entry>,
}

impl Index {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Sets the entry for a key, replacing any previous one.
    pub fn set(&mut self, key: String, entry: Entry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        self.entries.remove(key)
    }

    /// A snapshot of the indexed keys.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
