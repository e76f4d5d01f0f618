use std::cmp;

use tokio::time::Instant;

use crate::error::{RaftError, Result};
use crate::raft::follower::Follower;
use crate::raft::fsm::Instruction;
use crate::raft::progress::ReplicationProgress;
use crate::raft::rpc::{Address, AppendRequest, AppendResponse, Request, VoteResponse};
use crate::raft::timer::Timer;
use crate::raft::{Apply, Command, LogIndex, NodeId, RaftHandle, RaftRole, Reply};
use crate::raft::{Raft, Role};

#[derive(Debug)]
pub struct Leader {
    pub progress: ReplicationProgress,
    pub heartbeat: Timer,
}

impl Role for Leader {
    fn role(&self) -> RaftRole {
        RaftRole::Leader
    }

    fn heartbeat_deadline(&self) -> Option<Instant> {
        Some(self.heartbeat.deadline())
    }
}

impl Raft<Leader> {
    /// Announce leadership with an immediate round of (possibly empty) appends.
    pub(crate) fn on_transition(mut self) -> Result<RaftHandle> {
        tracing::info!(id = %self.id, term = self.state.current_term, "became leader");
        self.notify_role()?;
        self.replicate()?;
        self.role.heartbeat = Timer::heartbeat(&self.config);
        self.commit()?;
        Ok(RaftHandle::Leader(self))
    }

    pub(crate) fn become_follower(self) -> Result<Raft<Follower>> {
        tracing::info!(id = %self.id, term = self.state.current_term, "stepping down");
        self.fsm_tx.send(Instruction::Abort { leader: None })?;
        let raft: Raft<Follower> = Raft::from(self);
        raft.notify_role()?;
        Ok(raft)
    }

    /// Advance the commit index to the highest index stored on a quorum. Only entries from the
    /// current term are committed by counting replicas; earlier ones commit along with them.
    #[tracing::instrument(skip(self), fields(id = %self.id))]
    fn commit(&mut self) -> Result<LogIndex> {
        let quorum_idx = self.role.progress.committed_index();
        if quorum_idx > self.state.commit_index
            && self.log.term_at(quorum_idx)? == Some(self.state.current_term)
        {
            tracing::trace!(?quorum_idx, "commit");
            self.advance_commit(quorum_idx)?;
        }

        Ok(self.state.commit_index)
    }

    /// Send every peer the entries it is missing, bounded by `max_append_entries`.
    fn replicate(&mut self) -> Result<()> {
        for peer in self.peers() {
            self.replicate_to(&peer)?;
        }
        Ok(())
    }

    fn replicate_to(&self, peer: &NodeId) -> Result<()> {
        let next = self.role.progress.next(peer);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index)?.ok_or_else(|| RaftError::Internal {
            error_msg: format!("no entry at {} to replicate to {}", prev_log_index, peer),
        })?;
        let last = cmp::min(
            self.log.last_index(),
            prev_log_index + self.config.max_append_entries,
        );
        let entries = self.log.get_range(next, last)?;

        self.send(
            Address::Peer(peer.clone()),
            Request::Append(AppendRequest {
                term: self.state.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.state.commit_index,
            }),
        )
    }

    #[tracing::instrument(skip(self, command, reply), fields(id = %self.id))]
    fn apply_propose(
        mut self,
        command: Vec<u8>,
        reply: Reply<Result<LogIndex>>,
    ) -> Result<RaftHandle> {
        let term = self.state.current_term;
        let index = self.log.append(term, command)?;
        tracing::debug!(index, term, "proposed");

        let id = self.id.clone();
        self.role.progress.advance(&id, index);
        self.fsm_tx.send(Instruction::Notify { index, term, reply })?;

        self.replicate()?;
        self.commit()?;
        Ok(RaftHandle::Leader(self))
    }

    fn apply_append_response(
        mut self,
        from: NodeId,
        prev_log_index: LogIndex,
        entries: u64,
        res: AppendResponse,
    ) -> Result<RaftHandle> {
        if res.term < self.state.current_term {
            return Ok(RaftHandle::Leader(self));
        }

        if res.success {
            let matched = prev_log_index + entries;
            if self.role.progress.advance(&from, matched) {
                self.commit()?;
                if self.role.progress.next(&from) <= self.log.last_index() {
                    self.replicate_to(&from)?;
                }
            }
        } else if self.role.progress.regress(&from, prev_log_index, res.last_index) {
            tracing::debug!(peer = %from, next = self.role.progress.next(&from), "backing off");
            self.replicate_to(&from)?;
        }

        Ok(RaftHandle::Leader(self))
    }

    fn apply_heartbeat(mut self) -> Result<RaftHandle> {
        tracing::trace!(id = %self.id, "heartbeat");
        self.replicate()?;
        self.role.heartbeat = Timer::heartbeat(&self.config);
        Ok(RaftHandle::Leader(self))
    }
}

impl Apply for Raft<Leader> {
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        self.log_command(&cmd);

        if let Some(term) = cmd.term() {
            if term > self.state.current_term {
                self.term(term)?;
                return self.become_follower()?.apply(cmd);
            }
        }

        match cmd {
            Command::Heartbeat => self.apply_heartbeat(),
            Command::Propose { command, reply } => self.apply_propose(command, reply),
            Command::AppendResponse {
                from,
                prev_log_index,
                entries,
                res,
            } => self.apply_append_response(from, prev_log_index, entries, res),
            Command::VoteRequest { reply, .. } => {
                let _ = reply.send(VoteResponse {
                    term: self.state.current_term,
                    granted: false,
                });
                Ok(RaftHandle::Leader(self))
            }
            Command::AppendEntries { reply, .. } => {
                // either stale, or another leader in our term which can't happen
                let _ = reply.send(AppendResponse {
                    term: self.state.current_term,
                    success: false,
                    last_index: self.log.last_index(),
                });
                Ok(RaftHandle::Leader(self))
            }
            _ => Ok(RaftHandle::Leader(self)),
        }
    }
}

impl From<Raft<Leader>> for Raft<Follower> {
    fn from(val: Raft<Leader>) -> Raft<Follower> {
        let election = Timer::election(&val.config);
        Raft {
            id: val.id,
            state: val.state,
            role: Follower {
                leader_id: None,
                election,
            },
            config: val.config,
            log: val.log,
            rpc_tx: val.rpc_tx,
            fsm_tx: val.fsm_tx,
        }
    }
}
