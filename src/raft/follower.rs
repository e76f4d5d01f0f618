use std::cmp;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::error::{RaftError, Result};
use crate::raft::candidate::Candidate;
use crate::raft::config::RaftConfig;
use crate::raft::election::Election;
use crate::raft::fsm::Instruction;
use crate::raft::log::Log;
use crate::raft::rpc::{AppendRequest, AppendResponse, Message, VoteRequest, VoteResponse};
use crate::raft::timer::Timer;
use crate::raft::{Apply, Command, NodeId, RaftHandle, RaftRole, Reply, State};
use crate::raft::{Raft, Role};

#[derive(Debug)]
pub struct Follower {
    /// The leader of the current term, once it has been heard from.
    pub leader_id: Option<NodeId>,
    pub election: Timer,
}

impl Role for Follower {
    fn role(&self) -> RaftRole {
        RaftRole::Follower
    }

    fn election_deadline(&self) -> Option<Instant> {
        Some(self.election.deadline())
    }
}

impl Raft<Follower> {
    pub(crate) fn new(
        config: RaftConfig,
        log: Log,
        rpc_tx: UnboundedSender<Message>,
        fsm_tx: UnboundedSender<Instruction>,
    ) -> Result<Raft<Follower>> {
        config.validate().map_err(|err| RaftError::Config {
            file_path: String::new(),
            error_msg: err.to_string(),
        })?;

        let hard_state = log.hard_state().clone();
        let election = Timer::election(&config);
        Ok(Raft {
            id: config.id.clone(),
            state: State {
                current_term: hard_state.current_term,
                voted_for: hard_state.voted_for,
                commit_index: 0,
                last_applied: 0,
            },
            role: Follower {
                leader_id: None,
                election,
            },
            config,
            log,
            rpc_tx,
            fsm_tx,
        })
    }

    fn reset_election_timer(&mut self) {
        self.role.election = Timer::election(&self.config);
    }

    #[tracing::instrument(skip(self, reply), fields(id = %self.id))]
    fn apply_vote_request(
        mut self,
        req: VoteRequest,
        reply: Reply<VoteResponse>,
    ) -> Result<RaftHandle> {
        let term = self.state.current_term;
        let granted = if req.term < term {
            false
        } else {
            let can_vote = match &self.state.voted_for {
                None => true,
                Some(id) => *id == req.candidate_id,
            };
            can_vote && self.log.is_up_to_date(req.last_log_index, req.last_log_term)
        };

        if granted {
            self.state.voted_for = Some(req.candidate_id.clone());
            // the vote must be durable before the candidate hears about it
            self.persist()?;
            self.reset_election_timer();
        }

        tracing::debug!(candidate = %req.candidate_id, term, granted, "vote");
        let _ = reply.send(VoteResponse { term, granted });
        Ok(RaftHandle::Follower(self))
    }

    #[tracing::instrument(skip(self, req, reply), fields(id = %self.id, leader = %req.leader_id))]
    fn apply_append_entries(
        mut self,
        req: AppendRequest,
        reply: Reply<AppendResponse>,
    ) -> Result<RaftHandle> {
        let term = self.state.current_term;
        if req.term < term {
            tracing::debug!(stale = req.term, "rejecting append from stale leader");
            let _ = reply.send(AppendResponse {
                term,
                success: false,
                last_index: self.log.last_index(),
            });
            return Ok(RaftHandle::Follower(self));
        }

        self.reset_election_timer();
        self.role.leader_id = Some(req.leader_id.clone());

        if !req.is_contiguous() {
            tracing::warn!(
                prev_log_index = req.prev_log_index,
                "rejecting append with misnumbered entries"
            );
            let _ = reply.send(AppendResponse {
                term,
                success: false,
                last_index: self.log.last_index(),
            });
            return Ok(RaftHandle::Follower(self));
        }

        if !self.log.matches(req.prev_log_index, req.prev_log_term)? {
            tracing::debug!(
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                "log mismatch"
            );
            let _ = reply.send(AppendResponse {
                term,
                success: false,
                last_index: self.log.last_index(),
            });
            return Ok(RaftHandle::Follower(self));
        }

        // only the prefix the leader vouched for is known to match, later entries may be stale
        let matched = req.prev_log_index + req.entries.len() as u64;
        self.log.splice(req.entries)?;
        self.advance_commit(cmp::min(req.leader_commit, matched))?;

        let _ = reply.send(AppendResponse {
            term,
            success: true,
            last_index: matched,
        });
        Ok(RaftHandle::Follower(self))
    }
}

impl Apply for Raft<Follower> {
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        self.log_command(&cmd);

        if let Some(term) = cmd.term() {
            if term > self.state.current_term {
                self.term(term)?;
                self.role.leader_id = None;
            }
        }

        match cmd {
            Command::Timeout => {
                tracing::info!(id = %self.id, term = self.state.current_term, "election timeout");
                let mut raft: Raft<Candidate> = Raft::from(self);
                raft.campaign()?;
                raft.notify_role()?;
                raft.request_votes()
            }
            Command::VoteRequest { req, reply } => self.apply_vote_request(req, reply),
            Command::AppendEntries { req, reply } => self.apply_append_entries(req, reply),
            Command::Propose { reply, .. } => {
                let _ = reply.send(Err(RaftError::NotLeader(self.role.leader_id.clone())));
                Ok(RaftHandle::Follower(self))
            }
            _ => Ok(RaftHandle::Follower(self)),
        }
    }
}

impl From<Raft<Follower>> for Raft<Candidate> {
    fn from(val: Raft<Follower>) -> Raft<Candidate> {
        let election = Election::new(val.voters());
        let timer = Timer::election(&val.config);
        Raft {
            id: val.id,
            state: val.state,
            role: Candidate { election, timer },
            config: val.config,
            log: val.log,
            rpc_tx: val.rpc_tx,
            fsm_tx: val.fsm_tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use crate::error::RaftError;
    use crate::raft::fsm::Instruction;
    use crate::raft::rpc::{AppendRequest, Request, VoteRequest};
    use crate::raft::test::{entry, new_follower, new_follower_with_peers};
    use crate::raft::{Apply, Command, RaftRole};

    fn vote(term: u64, candidate: &str, last_log_index: u64, last_log_term: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index,
            last_log_term,
        }
    }

    fn append(
        term: u64,
        prev: (u64, u64),
        entries: Vec<crate::raft::Entry>,
        commit: u64,
    ) -> AppendRequest {
        AppendRequest {
            term,
            leader_id: "node-2".to_string(),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    #[tracing_test::traced_test]
    fn follower_to_candidate() {
        let ((mut rpc_rx, mut fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);
        let node = follower.apply(Command::Timeout).unwrap();
        assert!(node.is_candidate());
        let status = node.status();
        assert_eq!(status.term, 1);
        assert_eq!(status.voted_for, Some("node-1".to_string()));

        match rpc_rx.try_recv().unwrap().request {
            Request::Vote(req) => assert_eq!(req.term, 1),
            req => panic!("unexpected request {:?}", req),
        }
        match fsm_rx.try_recv().unwrap() {
            Instruction::StateChange { role, term } => {
                assert_eq!((role, term), (RaftRole::Candidate, 1))
            }
            instruction => panic!("unexpected instruction {:?}", instruction),
        }
    }

    #[test]
    #[tracing_test::traced_test]
    fn follower_to_leader_single_node_cluster() {
        let ((_rpc_rx, _fsm_rx), follower) = new_follower();
        let node = follower.apply(Command::Timeout).unwrap();
        assert!(node.is_leader());
    }

    #[test]
    fn grants_one_vote_per_term() {
        let ((_rpc_rx, _fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);

        let (tx, mut rx) = oneshot::channel();
        let node = follower
            .apply(Command::VoteRequest { req: vote(1, "node-2", 0, 0), reply: tx })
            .unwrap();
        assert!(rx.try_recv().unwrap().granted);

        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::VoteRequest { req: vote(1, "node-3", 0, 0), reply: tx })
            .unwrap();
        assert!(!rx.try_recv().unwrap().granted);

        // asking again is fine
        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::VoteRequest { req: vote(1, "node-2", 0, 0), reply: tx })
            .unwrap();
        assert!(rx.try_recv().unwrap().granted);

        // a new term clears the vote
        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::VoteRequest { req: vote(2, "node-3", 0, 0), reply: tx })
            .unwrap();
        let res = rx.try_recv().unwrap();
        assert!(res.granted);
        assert_eq!(res.term, 2);
        assert_eq!(node.status().voted_for, Some("node-3".to_string()));
    }

    #[test]
    fn rejects_stale_candidates() {
        let ((_rpc_rx, _fsm_rx), mut follower) = new_follower_with_peers(&["node-2", "node-3"]);
        follower.term(3).unwrap();
        follower.log.append(3, b"x".to_vec()).unwrap();

        // lower term
        let (tx, mut rx) = oneshot::channel();
        let node = follower
            .apply(Command::VoteRequest { req: vote(2, "node-2", 5, 2), reply: tx })
            .unwrap();
        let res = rx.try_recv().unwrap();
        assert!(!res.granted);
        assert_eq!(res.term, 3);

        // log behind ours
        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::VoteRequest { req: vote(4, "node-2", 5, 2), reply: tx })
            .unwrap();
        let res = rx.try_recv().unwrap();
        assert!(!res.granted);
        // the term is still adopted
        assert_eq!(res.term, 4);
        assert_eq!(node.status().voted_for, None);
    }

    #[test]
    fn append_entries_and_commit() {
        let ((_rpc_rx, mut fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);

        let (tx, mut rx) = oneshot::channel();
        let node = follower
            .apply(Command::AppendEntries {
                req: append(1, (0, 0), vec![entry(1, 1, "a"), entry(1, 2, "b")], 1),
                reply: tx,
            })
            .unwrap();
        let res = rx.try_recv().unwrap();
        assert!(res.success);
        assert_eq!(res.last_index, 2);

        let status = node.status();
        assert_eq!(status.leader, Some("node-2".to_string()));
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.last_applied, 1);
        match fsm_rx.try_recv().unwrap() {
            Instruction::Apply { entry } => assert_eq!(entry.command, b"a".to_vec()),
            instruction => panic!("unexpected instruction {:?}", instruction),
        }
        assert!(fsm_rx.try_recv().is_err());
    }

    #[test]
    fn commit_is_bounded_by_verified_prefix() {
        let ((_rpc_rx, _fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);
        let (tx, _rx) = oneshot::channel();
        let node = follower
            .apply(Command::AppendEntries {
                req: append(1, (0, 0), vec![entry(1, 1, "a"), entry(1, 2, "b")], 0),
                reply: tx,
            })
            .unwrap();

        // heartbeat that only vouches for index 1, with a leader commit far ahead
        let (tx, _rx) = oneshot::channel();
        let node = node
            .apply(Command::AppendEntries {
                req: append(1, (1, 1), vec![], 5),
                reply: tx,
            })
            .unwrap();
        assert_eq!(node.status().commit_index, 1);
    }

    #[test]
    fn rejects_inconsistent_log() {
        let ((_rpc_rx, _fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);

        let (tx, mut rx) = oneshot::channel();
        let node = follower
            .apply(Command::AppendEntries {
                req: append(1, (3, 1), vec![entry(1, 4, "d")], 0),
                reply: tx,
            })
            .unwrap();
        let res = rx.try_recv().unwrap();
        assert!(!res.success);
        assert_eq!(res.last_index, 0);
        assert_eq!(node.status().last_log_index, 0);

        // stale leader
        let (tx, mut rx) = oneshot::channel();
        let _ = node
            .apply(Command::AppendEntries {
                req: append(0, (0, 0), vec![], 0),
                reply: tx,
            })
            .unwrap();
        let res = rx.try_recv().unwrap();
        assert!(!res.success);
        assert_eq!(res.term, 1);
    }

    #[test]
    fn rejects_misnumbered_entries() {
        let ((_rpc_rx, _fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);

        // an entry claiming index 0
        let (tx, mut rx) = oneshot::channel();
        let node = follower
            .apply(Command::AppendEntries {
                req: append(1, (0, 0), vec![entry(1, 0, "a")], 0),
                reply: tx,
            })
            .unwrap();
        assert!(!rx.try_recv().unwrap().success);

        // a gap after the first entry
        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::AppendEntries {
                req: append(1, (0, 0), vec![entry(1, 1, "a"), entry(1, 3, "c")], 1),
                reply: tx,
            })
            .unwrap();
        let res = rx.try_recv().unwrap();
        assert!(!res.success);
        assert_eq!(res.last_index, 0);
        assert!(node.is_follower());
        assert_eq!(node.status().last_log_index, 0);
        assert_eq!(node.status().commit_index, 0);

        // the node keeps serving well formed appends
        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::AppendEntries {
                req: append(1, (0, 0), vec![entry(1, 1, "a")], 1),
                reply: tx,
            })
            .unwrap();
        assert!(rx.try_recv().unwrap().success);
        assert_eq!(node.status().last_log_index, 1);
    }

    #[test]
    fn truncates_conflicting_suffix() {
        let ((_rpc_rx, _fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);
        let (tx, _rx) = oneshot::channel();
        let node = follower
            .apply(Command::AppendEntries {
                req: append(1, (0, 0), vec![entry(1, 1, "a"), entry(1, 2, "stale")], 1),
                reply: tx,
            })
            .unwrap();

        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::AppendEntries {
                req: append(2, (1, 1), vec![entry(2, 2, "fresh")], 2),
                reply: tx,
            })
            .unwrap();
        assert!(rx.try_recv().unwrap().success);

        let entries = node.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].command, b"fresh".to_vec());
        assert_eq!(node.status().commit_index, 2);
    }

    #[test]
    fn proposals_are_redirected() {
        let ((_rpc_rx, _fsm_rx), follower) = new_follower_with_peers(&["node-2", "node-3"]);
        let (tx, _rx) = oneshot::channel();
        let node = follower
            .apply(Command::AppendEntries {
                req: append(1, (0, 0), vec![], 0),
                reply: tx,
            })
            .unwrap();

        let (tx, mut rx) = oneshot::channel();
        let node = node
            .apply(Command::Propose { command: b"x=1".to_vec(), reply: tx })
            .unwrap();
        assert!(node.is_follower());
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RaftError::NotLeader(Some("node-2".to_string())))
        );
    }
}
