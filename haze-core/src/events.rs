#![forbid(unsafe_code)]

//! Round-event waiter: bounded wait for a round to reach a lifecycle state.
//!
//! The orchestrator publishes every round update it observes; waiters
//! subscribe per round and complete as soon as any target state is reached.
//! If the last-published state already satisfies a target the wait returns
//! immediately.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Duration, Instant};

use crate::rounds::{Round, RoundState};

const EVENT_CHANNEL_CAPACITY: usize = 512;

pub struct RoundEvents {
    tx: broadcast::Sender<Round>,
    latest: Mutex<HashMap<u64, Round>>,
}

impl Default for RoundEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        RoundEvents {
            tx,
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Record a round update and wake any waiters. Terminal rounds are
    /// dropped from the last-seen table once delivered.
    pub fn publish(&self, round: Round) {
        {
            let mut latest = self.latest.lock();
            if round.state >= RoundState::Completed {
                latest.remove(&round.id);
            } else {
                latest.insert(round.id, round.clone());
            }
        }
        let _ = self.tx.send(round);
    }

    pub fn last_seen(&self, round_id: u64) -> Option<Round> {
        self.latest.lock().get(&round_id).cloned()
    }

    /// Wait up to `wait` for round `round_id` to enter any of `targets`.
    /// Returns `(last seen round info, timed_out)`; the round is `None` only
    /// when no update was ever observed.
    pub async fn wait_for_round(
        &self,
        round_id: u64,
        targets: &[RoundState],
        wait: Duration,
    ) -> (Option<Round>, bool) {
        let deadline = Instant::now() + wait;
        // Subscribe before the snapshot check so a concurrent publish cannot
        // slip between the two.
        let mut rx = self.tx.subscribe();

        let mut last = self.last_seen(round_id);
        if let Some(round) = &last {
            if targets.contains(&round.state) {
                return (last, false);
            }
        }

        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Ok(round)) => {
                    if round.id != round_id {
                        continue;
                    }
                    let hit = targets.contains(&round.state);
                    last = Some(round);
                    if hit {
                        return (last, false);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return (last, true),
                Err(_) => return (last, true),
            }
        }
    }
}
