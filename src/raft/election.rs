use std::collections::HashMap;

use crate::raft::NodeId;

/// Tallies the votes of a single term.
#[derive(Debug)]
pub struct Election {
    voter_ids: Vec<NodeId>,
    votes: HashMap<NodeId, bool>,
}

#[derive(Debug, PartialEq)]
pub enum ElectionStatus {
    Elected,
    Voting,
    Defeated,
}

impl Election {
    pub fn new(voter_ids: Vec<NodeId>) -> Election {
        let mut election = Election {
            voter_ids,
            votes: HashMap::new(),
        };

        election.reset();
        election
    }

    pub fn reset(&mut self) {
        self.votes.clear();
    }

    /// Record a vote. Only the first answer from each voter counts.
    pub fn vote(&mut self, id: NodeId, vote: bool) {
        if !self.voter_ids.contains(&id) {
            tracing::warn!(voter = %id, "ignoring vote from unknown node");
            return;
        }
        self.votes.entry(id).or_insert(vote);
    }

    pub fn election_status(&self) -> ElectionStatus {
        let (granted, rejected) =
            self.votes
                .values()
                .fold((0, 0), |(granted, rejected), vote| {
                    if *vote {
                        (granted + 1, rejected)
                    } else {
                        (granted, rejected + 1)
                    }
                });

        if granted >= self.quorum_size() {
            ElectionStatus::Elected
        } else if rejected > self.voters_size() - self.quorum_size() {
            ElectionStatus::Defeated
        } else {
            ElectionStatus::Voting
        }
    }

    #[inline]
    fn voters_size(&self) -> usize {
        self.voter_ids.len()
    }

    /// A strict majority of the voters.
    #[inline]
    fn quorum_size(&self) -> usize {
        (self.voter_ids.len() / 2) + 1
    }
}
