use std::cmp;
use std::collections::HashMap;

use crate::raft::{LogIndex, NodeId};

/// The leader's view of how far each member's log has been replicated, itself included.
#[derive(Debug)]
pub struct ReplicationProgress {
    progress: HashMap<NodeId, Progress>,
}

impl ReplicationProgress {
    /// Every node starts out probing from the leader's next index.
    pub fn new(nodes: Vec<NodeId>, next_index: LogIndex) -> ReplicationProgress {
        assert!(!nodes.is_empty());

        let mut progress = HashMap::new();
        for node_id in nodes {
            progress.insert(node_id, Progress::new(next_index));
        }
        ReplicationProgress { progress }
    }

    pub fn get(&self, node_id: &str) -> Option<&Progress> {
        self.progress.get(node_id)
    }

    /// The next index to send to the node.
    pub fn next(&self, node_id: &str) -> LogIndex {
        self.get(node_id).map(|progress| progress.next).unwrap_or(1)
    }

    /// Record that the node's log matches ours up to `index`. Returns whether anything changed.
    pub fn advance(&mut self, node_id: &str, index: LogIndex) -> bool {
        match self.progress.get_mut(node_id) {
            Some(progress) => progress.increment(index),
            None => false,
        }
    }

    /// Back off after a rejected append that was sent with `prev_log_index`. `last_index` is the
    /// follower's reported last index. Rejections for anything but the current probe are stale
    /// and ignored. Returns whether the next index moved.
    pub fn regress(
        &mut self,
        node_id: &str,
        prev_log_index: LogIndex,
        last_index: LogIndex,
    ) -> bool {
        let progress = match self.progress.get_mut(node_id) {
            Some(progress) => progress,
            None => return false,
        };
        if prev_log_index.saturating_add(1) != progress.next {
            return false;
        }

        let next = cmp::max(
            progress.matched + 1,
            cmp::max(1, cmp::min(prev_log_index, last_index.saturating_add(1))),
        );
        if next == progress.next {
            return false;
        }
        progress.next = next;
        true
    }

    /// The highest index stored on a majority of nodes.
    pub fn committed_index(&self) -> LogIndex {
        let mut indices: Vec<LogIndex> = self.progress.values().map(|pr| pr.matched).collect();

        indices.sort_by(|a, b| b.cmp(a));
        indices[indices.len() / 2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// The next index to send.
    pub next: LogIndex,
    /// The highest index known to match the leader's log.
    pub matched: LogIndex,
}

impl Progress {
    fn new(next: LogIndex) -> Progress {
        Progress { next, matched: 0 }
    }

    fn increment(&mut self, index: LogIndex) -> bool {
        let updated = if self.matched < index {
            self.matched = index;
            true
        } else {
            false
        };

        if self.next < index + 1 {
            self.next = index + 1;
        }

        updated
    }
}
