//! Global cap on in-flight assistant invocations.
//!
//! Admission is refused, never queued, once the cap is reached. Every admitted
//! token is released exactly once: explicitly, or when its permit drops.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationToken(Ulid);

impl fmt::Display for InvocationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    max_concurrent: usize,
    in_flight: Mutex<HashSet<InvocationToken>>,
}

#[derive(Debug)]
pub enum Admission {
    Admitted(AdmissionPermit),
    Refused,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    // The set is only ever mutated by whole insert/remove calls, so a
    // poisoned lock still guards a consistent set.
    fn lock(&self) -> MutexGuard<'_, HashSet<InvocationToken>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_admit(self: &Arc<Self>) -> Admission {
        let mut in_flight = self.lock();
        if in_flight.len() >= self.max_concurrent {
            tracing::debug!(
                in_flight = in_flight.len(),
                max_concurrent = self.max_concurrent,
                "admission refused"
            );
            return Admission::Refused;
        }
        let mut token = InvocationToken(Ulid::new());
        while !in_flight.insert(token) {
            token = InvocationToken(Ulid::new());
        }
        Admission::Admitted(AdmissionPermit {
            gate: Arc::clone(self),
            token,
            released: false,
        })
    }

    /// Removes `token`. Releasing a token that is not held is a no-op.
    pub fn release(&self, token: InvocationToken) -> bool {
        self.lock().remove(&token)
    }
}

/// Scoped hold on one gate slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<ConcurrencyGate>,
    token: InvocationToken,
    released: bool,
}

impl AdmissionPermit {
    pub fn token(&self) -> InvocationToken {
        self.token
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.release(self.token);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admit(gate: &Arc<ConcurrencyGate>) -> AdmissionPermit {
        match gate.try_admit() {
            Admission::Admitted(permit) => permit,
            Admission::Refused => panic!("expected admission"),
        }
    }

    #[test]
    fn refuses_beyond_capacity_and_readmits_after_release() {
        let gate = ConcurrencyGate::new(3);
        let a = admit(&gate);
        let b = admit(&gate);
        let c = admit(&gate);
        assert_eq!(gate.in_flight(), 3);
        assert!(matches!(gate.try_admit(), Admission::Refused));

        b.release();
        assert_eq!(gate.in_flight(), 2);
        let d = admit(&gate);
        assert!(matches!(gate.try_admit(), Admission::Refused));

        drop((a, c, d));
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn tokens_are_unique() {
        let gate = ConcurrencyGate::new(2);
        let a = admit(&gate);
        let b = admit(&gate);
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn release_is_idempotent() {
        let gate = ConcurrencyGate::new(1);
        let permit = admit(&gate);
        let token = permit.token();
        assert!(gate.release(token));
        assert!(!gate.release(token));
        assert_eq!(gate.in_flight(), 0);
        // The permit's own release after an explicit one must not underflow
        // or disturb other holders.
        let other = admit(&gate);
        drop(permit);
        assert_eq!(gate.in_flight(), 1);
        drop(other);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn permit_is_released_when_a_task_panics() {
        let gate = ConcurrencyGate::new(1);
        let held = Arc::clone(&gate);
        let result = std::thread::spawn(move || {
            let _permit = admit(&held);
            panic!("invocation blew up");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn bound_holds_under_concurrent_admit_and_release() {
        let gate = ConcurrencyGate::new(3);
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        if let Admission::Admitted(permit) = gate.try_admit() {
                            peak.fetch_max(gate.in_flight(), std::sync::atomic::Ordering::SeqCst);
                            if i % 2 == 0 {
                                permit.release();
                            } else {
                                drop(permit);
                            }
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
        assert_eq!(gate.in_flight(), 0);
    }
}
