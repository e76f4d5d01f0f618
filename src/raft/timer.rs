use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::raft::config::RaftConfig;

/// Pick an election timeout uniformly from `[min, max]`.
pub fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// A one-shot deadline. Resetting a timer means replacing it.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    pub fn after(duration: Duration) -> Timer {
        Timer {
            deadline: Instant::now() + duration,
        }
    }

    /// A freshly randomized election timer.
    pub fn election(config: &RaftConfig) -> Timer {
        Timer::after(random_election_timeout(
            config.election_timeout_min(),
            config.election_timeout_max(),
        ))
    }

    pub fn heartbeat(config: &RaftConfig) -> Timer {
        Timer::after(config.heartbeat_interval())
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Sleep until the deadline, or forever when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}
