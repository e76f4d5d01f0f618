//! A lock replicated through the raft log.
//!
//! Acquire and release are proposed as log commands. Every node applies committed commands to its
//! [`LockTable`] in log order, so nodes that applied the same prefix agree on who holds each lock.
//! A [`DistributedLock`] only reports success once its own command was applied locally.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::Result;
use crate::raft::fsm::ApplyCallback;
use crate::raft::{LogIndex, NodeId, RaftClient};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockCommand {
    LockAcquire {
        lock_id: String,
        lock_name: String,
        holder: NodeId,
        /// Milliseconds since the unix epoch at proposal time.
        timestamp: u64,
    },
    LockRelease {
        lock_id: String,
        lock_name: String,
        holder: NodeId,
        timestamp: u64,
    },
}

impl LockCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<LockCommand> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockState {
    /// The lock instance that proposed the acquire.
    pub lock_id: String,
    pub holder: NodeId,
    pub acquired_at: u64,
    /// The log index of the acquire that took the lock.
    pub index: LogIndex,
}

/// The local projection of every lock, built from applied log commands.
#[derive(Clone, Debug, Default)]
pub struct LockTable {
    locks: Arc<RwLock<HashMap<String, LockState>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, lock_name: &str) -> Option<LockState> {
        self.read().get(lock_name).cloned()
    }

    pub fn holder(&self, lock_name: &str) -> Option<NodeId> {
        self.read().get(lock_name).map(|state| state.holder.clone())
    }

    pub fn is_locked(&self, lock_name: &str) -> bool {
        self.read().contains_key(lock_name)
    }

    /// Apply a committed command. An acquire of a held lock and a release by anyone but the
    /// holder are no-ops.
    pub fn apply_command(&self, index: LogIndex, cmd: LockCommand) {
        let mut locks = self.write();
        match cmd {
            LockCommand::LockAcquire {
                lock_id,
                lock_name,
                holder,
                timestamp,
            } => {
                if let Some(state) = locks.get(&lock_name) {
                    let current = &state.holder;
                    tracing::debug!(%lock_name, %holder, %current, "lock already held");
                    return;
                }
                tracing::debug!(%lock_name, %holder, index, "lock acquired");
                locks.insert(
                    lock_name,
                    LockState {
                        lock_id,
                        holder,
                        acquired_at: timestamp,
                        index,
                    },
                );
            }
            LockCommand::LockRelease {
                lock_name, holder, ..
            } => {
                let held = matches!(locks.get(&lock_name), Some(state) if state.holder == holder);
                if held {
                    tracing::debug!(%lock_name, %holder, index, "lock released");
                    locks.remove(&lock_name);
                } else {
                    tracing::debug!(%lock_name, %holder, "release by a non holder ignored");
                }
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, LockState>> {
        self.locks.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, LockState>> {
        self.locks.write().unwrap_or_else(|err| err.into_inner())
    }
}

impl ApplyCallback for LockTable {
    fn apply(&mut self, index: LogIndex, command: &[u8]) {
        match LockCommand::decode(command) {
            Ok(cmd) => self.apply_command(index, cmd),
            Err(err) => tracing::warn!(index, %err, "skipping entry that is not a lock command"),
        }
    }
}

/// A named lock. Instances on different nodes with the same name guard the same lock.
#[derive(Clone, Debug)]
pub struct DistributedLock {
    lock_id: String,
    lock_name: String,
    client: RaftClient,
    table: LockTable,
}

impl DistributedLock {
    /// `table` must be the apply callback of the node behind `client`.
    pub fn new<S: Into<String>>(lock_name: S, client: RaftClient, table: LockTable) -> Self {
        let lock_name = lock_name.into();
        DistributedLock {
            lock_id: format!("lock_{}_{}", lock_name, Uuid::new_v4().simple()),
            lock_name,
            client,
            table,
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Try to take the lock for `holder`. Returns `false` straight away if the lock is known to be
    /// held, and otherwise once the acquire is applied: `true` if it took the lock, `false` if an
    /// earlier acquire won. Fails with `Timeout` if the acquire isn't applied within `timeout`,
    /// in which case it may still take effect later.
    #[tracing::instrument(skip(self), fields(lock = %self.lock_name))]
    pub async fn acquire(&self, holder: &str, timeout: Duration) -> Result<bool> {
        if self.table.is_locked(&self.lock_name) {
            return Ok(false);
        }

        let cmd = LockCommand::LockAcquire {
            lock_id: self.lock_id.clone(),
            lock_name: self.lock_name.clone(),
            holder: holder.to_string(),
            timestamp: now_millis(),
        };
        let index = tokio::time::timeout(timeout, self.client.propose(cmd.encode()?)).await??;

        let acquired = matches!(
            self.table.get(&self.lock_name),
            Some(state) if state.index == index && state.holder == holder
        );
        tracing::debug!(index, acquired, "acquire applied");
        Ok(acquired)
    }

    /// Release the lock if `holder` holds it. Returns `true` once the release is applied, and
    /// fails with `Timeout` if that takes longer than `timeout`.
    #[tracing::instrument(skip(self), fields(lock = %self.lock_name))]
    pub async fn release(&self, holder: &str, timeout: Duration) -> Result<bool> {
        if self.table.holder(&self.lock_name).as_deref() != Some(holder) {
            return Ok(false);
        }

        let cmd = LockCommand::LockRelease {
            lock_id: self.lock_id.clone(),
            lock_name: self.lock_name.clone(),
            holder: holder.to_string(),
            timestamp: now_millis(),
        };
        let index = tokio::time::timeout(timeout, self.client.propose(cmd.encode()?)).await??;

        // the lock was freed at `index` unless it is still held by an earlier acquire
        let released = match self.table.get(&self.lock_name) {
            Some(state) => state.index > index,
            None => true,
        };
        tracing::debug!(index, released, "release applied");
        Ok(released)
    }

    pub fn is_locked(&self) -> bool {
        self.table.is_locked(&self.lock_name)
    }

    pub fn holder(&self) -> Option<NodeId> {
        self.table.holder(&self.lock_name)
    }
}
