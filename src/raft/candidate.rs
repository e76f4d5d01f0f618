use tokio::time::Instant;

use crate::error::{RaftError, Result};
use crate::raft::election::{Election, ElectionStatus};
use crate::raft::follower::Follower;
use crate::raft::leader::Leader;
use crate::raft::progress::ReplicationProgress;
use crate::raft::rpc::{AppendResponse, Request, VoteRequest, VoteResponse};
use crate::raft::timer::Timer;
use crate::raft::{Apply, Command, RaftHandle, RaftRole};
use crate::raft::{Raft, Role};

#[derive(Debug)]
pub struct Candidate {
    pub election: Election,
    pub timer: Timer,
}

impl Raft<Candidate> {
    /// Start a new term: vote for ourselves, persist, and restart the election timer.
    pub(crate) fn campaign(&mut self) -> Result<()> {
        self.state.current_term += 1;
        self.state.voted_for = Some(self.id.clone());
        self.persist()?;
        self.role.election.reset();
        self.role.timer = Timer::election(&self.config);
        tracing::info!(id = %self.id, term = self.state.current_term, "starting election");
        Ok(())
    }

    /// Ask every peer for its vote, then count our own.
    pub(crate) fn request_votes(self) -> Result<RaftHandle> {
        let term = self.state.current_term;
        if !self.config.nodes.is_empty() {
            self.send_all(Request::Vote(VoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            }))?;
        }

        let from = self.id.clone();
        self.apply(Command::VoteResponse {
            from,
            res: VoteResponse {
                term,
                granted: true,
            },
        })
    }

    pub(crate) fn become_follower(self) -> Result<Raft<Follower>> {
        let raft: Raft<Follower> = Raft::from(self);
        raft.notify_role()?;
        Ok(raft)
    }
}

impl Role for Candidate {
    fn role(&self) -> RaftRole {
        RaftRole::Candidate
    }

    fn election_deadline(&self) -> Option<Instant> {
        Some(self.timer.deadline())
    }
}

impl Apply for Raft<Candidate> {
    #[tracing::instrument(skip(self, cmd), fields(id = %self.id, term = self.state.current_term))]
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        self.log_command(&cmd);

        if let Some(term) = cmd.term() {
            if term > self.state.current_term {
                self.term(term)?;
                return self.become_follower()?.apply(cmd);
            }
        }

        match cmd {
            Command::Timeout => {
                // split vote or lost responses, try again in a new term
                self.campaign()?;
                self.request_votes()
            }
            Command::VoteRequest { reply, .. } => {
                // we have already voted for ourselves this term
                let _ = reply.send(VoteResponse {
                    term: self.state.current_term,
                    granted: false,
                });
                Ok(RaftHandle::Candidate(self))
            }
            Command::VoteResponse { from, res } => {
                if res.term < self.state.current_term {
                    // straggler from an earlier election
                    return Ok(RaftHandle::Candidate(self));
                }

                self.role.election.vote(from, res.granted);
                match self.role.election.election_status() {
                    ElectionStatus::Elected => {
                        tracing::info!("i have been elected leader");
                        let raft: Raft<Leader> = Raft::from(self);
                        raft.on_transition()
                    }
                    ElectionStatus::Voting => Ok(RaftHandle::Candidate(self)),
                    ElectionStatus::Defeated => {
                        tracing::info!("i have been defeated");
                        Ok(RaftHandle::Follower(self.become_follower()?))
                    }
                }
            }
            Command::AppendEntries { req, reply } => {
                // While waiting for votes, a candidate may receive an
                // AppendEntries RPC from another server claiming to be
                // leader. If the leader’s term (included in its RPC) is at least
                // as large as the candidate’s current term, then the candidate
                // recognizes the leader as legitimate and returns to follower
                // state.
                if req.term >= self.state.current_term {
                    return self
                        .become_follower()?
                        .apply(Command::AppendEntries { req, reply });
                }

                // If the term in the RPC is smaller than the candidate’s
                // current term, then the candidate rejects the RPC and continues in candidate state.
                let _ = reply.send(AppendResponse {
                    term: self.state.current_term,
                    success: false,
                    last_index: self.log.last_index(),
                });
                Ok(RaftHandle::Candidate(self))
            }
            Command::Propose { reply, .. } => {
                let _ = reply.send(Err(RaftError::NotLeader(None)));
                Ok(RaftHandle::Candidate(self))
            }
            _ => Ok(RaftHandle::Candidate(self)),
        }
    }
}

impl From<Raft<Candidate>> for Raft<Follower> {
    fn from(val: Raft<Candidate>) -> Raft<Follower> {
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

impl From<Raft<Candidate>> for Raft<Leader> {
    fn from(val: Raft<Candidate>) -> Raft<Leader> {
        let mut progress = ReplicationProgress::new(val.voters(), val.log.next_index());
        progress.advance(&val.id, val.log.last_index());
        let heartbeat = Timer::heartbeat(&val.config);
        Raft {
            id: val.id,
            state: val.state,
            role: Leader {
                progress,
                heartbeat,
            },
            config: val.config,
            log: val.log,
            rpc_tx: val.rpc_tx,
            fsm_tx: val.fsm_tx,
        }
    }
}
