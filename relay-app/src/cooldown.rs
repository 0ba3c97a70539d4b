//! Per-user minimum interval between accepted requests.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relay_channels::SenderId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Allowed,
    Denied { retry_after_secs: u64 },
}

#[derive(Debug)]
pub struct CooldownTracker {
    cooldown: Duration,
    next_allowed_at: DashMap<SenderId, Instant>,
}

impl CooldownTracker {
    pub fn new(cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            cooldown,
            next_allowed_at: DashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.next_allowed_at.len()
    }

    pub fn contains(&self, user: &SenderId) -> bool {
        self.next_allowed_at.contains_key(user)
    }

    pub fn check_and_reserve(&self, user: &SenderId) -> CooldownDecision {
        self.check_and_reserve_at(user, Instant::now())
    }

    /// Allows and reserves the next slot when `user` has no pending deadline
    /// or it has passed. The entry lock is held across check and write.
    pub fn check_and_reserve_at(&self, user: &SenderId, now: Instant) -> CooldownDecision {
        match self.next_allowed_at.entry(user.clone()) {
            Entry::Occupied(mut entry) => {
                let deadline = *entry.get();
                if now >= deadline {
                    entry.insert(now + self.cooldown);
                    return CooldownDecision::Allowed;
                }
                CooldownDecision::Denied {
                    retry_after_secs: ceil_secs(deadline - now),
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.cooldown);
                CooldownDecision::Allowed
            }
        }
    }

    /// Drops every entry whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.next_allowed_at.len();
        self.next_allowed_at.retain(|_, deadline| *deadline > now);
        before.saturating_sub(self.next_allowed_at.len())
    }

    /// Runs [`Self::sweep`] every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("cooldown sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let removed = tracker.sweep(Instant::now());
                        if removed > 0 {
                            tracing::debug!(
                                removed,
                                remaining = tracker.len(),
                                "swept expired cooldowns"
                            );
                        }
                    }
                }
            }
        })
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}
