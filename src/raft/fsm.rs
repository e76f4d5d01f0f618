use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::{RaftError, Result};
use crate::raft::{Entry, LogIndex, NodeId, RaftRole, Reply, Term};
use crate::util::Shutdown;

/// Receives committed commands, once per index and strictly in index order.
pub trait ApplyCallback: Send + 'static {
    fn apply(&mut self, index: LogIndex, command: &[u8]);
}

impl<F> ApplyCallback for F
where
    F: FnMut(LogIndex, &[u8]) + Send + 'static,
{
    fn apply(&mut self, index: LogIndex, command: &[u8]) {
        self(index, command)
    }
}

/// Receives the new role and term on every role transition.
pub trait StateChangeCallback: Send + 'static {
    fn on_state_change(&mut self, role: RaftRole, term: Term);
}

impl<F> StateChangeCallback for F
where
    F: FnMut(RaftRole, Term) + Send + 'static,
{
    fn on_state_change(&mut self, role: RaftRole, term: Term) {
        self(role, term)
    }
}

#[derive(Debug)]
pub enum Instruction {
    /// Hand a committed entry to the state machine.
    Apply { entry: Entry },
    /// Answer `reply` once `index` is applied, if the entry there still has `term`.
    Notify {
        index: LogIndex,
        term: Term,
        reply: Reply<Result<LogIndex>>,
    },
    /// Leadership was lost, fail every pending proposal.
    Abort { leader: Option<NodeId> },
    StateChange { role: RaftRole, term: Term },
}

pub struct Driver {
    fsm_rx: mpsc::UnboundedReceiver<Instruction>,
    apply: Box<dyn ApplyCallback>,
    on_state_change: Box<dyn StateChangeCallback>,
    applied: LogIndex,
    notifications: HashMap<LogIndex, (Term, Reply<Result<LogIndex>>)>,
}

impl Driver {
    pub fn new(
        fsm_rx: mpsc::UnboundedReceiver<Instruction>,
        apply: Box<dyn ApplyCallback>,
        on_state_change: Box<dyn StateChangeCallback>,
    ) -> Self {
        Self {
            fsm_rx,
            apply,
            on_state_change,
            applied: 0,
            notifications: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,

                instruction = self.fsm_rx.recv() => match instruction {
                    Some(instruction) => self.exec(instruction),
                    None => break,
                },
            }
        }

        Ok(())
    }

    pub fn exec(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Apply { entry } => {
                if entry.index <= self.applied {
                    tracing::warn!(index = entry.index, "skipping entry that was already applied");
                    return;
                }
                self.apply.apply(entry.index, &entry.command);
                self.applied = entry.index;

                if let Some((term, reply)) = self.notifications.remove(&entry.index) {
                    let res = if term == entry.term {
                        Ok(entry.index)
                    } else {
                        Err(RaftError::NotLeader(None))
                    };
                    let _ = reply.send(res);
                }
            }
            Instruction::Notify { index, term, reply } => {
                self.notifications.insert(index, (term, reply));
            }
            Instruction::Abort { leader } => {
                for (_, (_, reply)) in self.notifications.drain() {
                    let _ = reply.send(Err(RaftError::NotLeader(leader.clone())));
                }
            }
            Instruction::StateChange { role, term } => {
                self.on_state_change.on_state_change(role, term);
            }
        }
    }
}
