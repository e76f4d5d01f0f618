use std::fmt::Debug;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::raft::{Entry, HardState, LogIndex};

/// Persistent storage for the log and the hard state. Every write must be durable when the call
/// returns, since the node responds to RPCs right after.
pub trait Store: Debug + Send {
    fn load_hard_state(&self) -> Result<HardState>;

    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// Append an entry at the end of the log, returning its index.
    fn append(&mut self, entry: Entry) -> Result<LogIndex>;

    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Entries in `start..=end`, skipping any that don't exist.
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    fn len(&self) -> u64;

    /// Drop every entry after the first `len`.
    fn truncate(&mut self, len: u64) -> Result<LogIndex>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_index(&self) -> LogIndex {
        self.len() + 1
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    log: Vec<Entry>,
    hard_state: HardState,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn append(&mut self, entry: Entry) -> Result<LogIndex> {
        self.log.push(entry);
        Ok(self.log.len() as LogIndex)
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        if index == 0 {
            return Ok(None);
        }

        Ok(self.log.get(index as usize - 1).cloned())
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for n in start..=end {
            if let Some(entry) = self.get(n)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn len(&self) -> u64 {
        self.log.len() as u64
    }

    fn truncate(&mut self, len: u64) -> Result<LogIndex> {
        self.log.truncate(len as usize);
        Ok(self.len())
    }
}

const LOG_TREE: &str = "log";
const HARD_STATE_KEY: &str = "hard_state";

/// Stores entries in a sled tree keyed by big endian index, so that iteration order matches
/// log order.
#[derive(Debug)]
pub struct SledStore {
    db: sled::Db,
    log: sled::Tree,
    len: u64,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SledStore> {
        let db = sled::open(path)?;
        let log = db.open_tree(LOG_TREE)?;
        let len = match log.last()? {
            Some((key, _)) => BigEndian::read_u64(&key),
            None => 0,
        };
        Ok(SledStore { db, log, len })
    }

    fn key(index: LogIndex) -> [u8; 8] {
        let mut key = [0; 8];
        BigEndian::write_u64(&mut key, index);
        key
    }
}

impl Store for SledStore {
    fn load_hard_state(&self) -> Result<HardState> {
        match self.db.get(HARD_STATE_KEY)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(HardState::default()),
        }
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.db.insert(HARD_STATE_KEY, bincode::serialize(state)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn append(&mut self, entry: Entry) -> Result<LogIndex> {
        let index = self.len + 1;
        self.log.insert(Self::key(index), bincode::serialize(&entry)?)?;
        self.log.flush()?;
        self.len = index;
        Ok(index)
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        match self.log.get(Self::key(index))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        if start > end {
            return Ok(entries);
        }
        for item in self.log.range(Self::key(start)..=Self::key(end)) {
            let (_, bytes) = item?;
            entries.push(bincode::deserialize(&bytes)?);
        }
        Ok(entries)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn truncate(&mut self, len: u64) -> Result<LogIndex> {
        let mut batch = sled::Batch::default();
        for item in self.log.range(Self::key(len + 1)..) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.log.apply_batch(batch)?;
        self.log.flush()?;
        self.len = std::cmp::min(self.len, len);
        Ok(self.len)
    }
}
