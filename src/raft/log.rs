use std::fmt;
use std::time::SystemTime;

use crate::error::{RaftError, Result};
use crate::raft::store::Store;
use crate::raft::{Entry, HardState, LogIndex, Term};

/// The replicated log. Wraps a [`Store`] and caches the position of the last entry.
pub struct Log {
    store: Box<dyn Store>,
    hard_state: HardState,
    last_index: LogIndex,
    last_term: Term,
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Log {{ last_index: {}, last_term: {} }}",
            self.last_index, self.last_term
        )
    }
}

impl Log {
    pub fn new(store: Box<dyn Store>) -> Result<Log> {
        let hard_state = store.load_hard_state()?;
        let mut log = Log {
            store,
            hard_state,
            last_index: 0,
            last_term: 0,
        };
        log.reload_last()?;
        Ok(log)
    }

    fn reload_last(&mut self) -> Result<()> {
        self.last_index = self.store.len();
        self.last_term = match self.store.get(self.last_index)? {
            Some(entry) => entry.term,
            None => 0,
        };
        Ok(())
    }

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    pub fn save_hard_state(&mut self, state: HardState) -> Result<()> {
        if state != self.hard_state {
            self.store.save_hard_state(&state)?;
            self.hard_state = state;
        }
        Ok(())
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_index
    }

    pub fn last_term(&self) -> Term {
        self.last_term
    }

    pub fn next_index(&self) -> LogIndex {
        self.last_index + 1
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.store.get(index)
    }

    /// The term of the entry at `index`. Index 0 is the empty prefix and has term 0.
    pub fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        Ok(self.store.get(index)?.map(|entry| entry.term))
    }

    /// Whether the log contains an entry at `index` with `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> Result<bool> {
        Ok(self.term_at(index)? == Some(term))
    }

    /// Whether a log ending at `(last_index, last_term)` is at least as up to date as this one.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term || (last_term == self.last_term && last_index >= self.last_index)
    }

    /// Append a new command at `term`, returning its index.
    pub fn append(&mut self, term: Term, command: Vec<u8>) -> Result<LogIndex> {
        let entry = Entry {
            term,
            index: self.next_index(),
            command,
            timestamp: SystemTime::now(),
        };
        self.push(entry)
    }

    fn push(&mut self, entry: Entry) -> Result<LogIndex> {
        if entry.index != self.next_index() {
            return Err(RaftError::Internal {
                error_msg: format!(
                    "entry {} does not follow last index {}",
                    entry.index, self.last_index
                ),
            });
        }
        let term = entry.term;
        let index = self.store.append(entry)?;
        self.last_index = index;
        self.last_term = term;
        Ok(index)
    }

    /// Merge entries received from the leader. Entries already present with the same term are
    /// kept, the first conflicting entry truncates the log from its index, and the rest are
    /// appended. Returns the last index.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<LogIndex> {
        for entry in entries {
            match self.term_at(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    tracing::debug!(index = entry.index, "truncating conflicting entries");
                    self.store.truncate(entry.index - 1)?;
                    self.reload_last()?;
                    self.push(entry)?;
                }
                None => {
                    self.push(entry)?;
                }
            }
        }
        Ok(self.last_index)
    }

    /// Entries in `start..=end`.
    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        if start > end {
            return Ok(vec![]);
        }
        self.store.get_range(start, end)
    }

    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.get_range(1, self.last_index)
    }
}
