//! In-flight markers for entry and exit decisions.
//!
//! A flag is claimed for the duration of one decision, including its network
//! calls, and released when the returned guard drops. No lock is held while the
//! decision awaits the gateway. Claims carry a generation so a guard from a
//! claim that was force-cleared cannot release a newer claim.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug)]
struct Claim {
    generation: u64,
    started: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    claim: Option<Claim>,
    generation: u64,
}

#[derive(Debug)]
pub struct InFlightFlag {
    name: &'static str,
    slot: Mutex<Slot>,
}

impl InFlightFlag {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Claims the flag.
    ///
    /// Returns `None` while another claim younger than `max_age` is held. An
    /// older claim is treated as abandoned: it is force-cleared, logged, and
    /// replaced.
    pub fn try_begin(&self, max_age: Duration) -> Option<InFlightGuard<'_>> {
        let mut slot = self.slot.lock();

        if let Some(claim) = &slot.claim {
            let age = claim.started.elapsed();
            if age < max_age {
                return None;
            }
            warn!(
                flag = self.name,
                age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                "Force-clearing stale in-flight flag"
            );
        }

        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        slot.claim = Some(Claim {
            generation,
            started: Instant::now(),
        });

        Some(InFlightGuard {
            flag: self,
            generation,
        })
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.slot.lock().claim.is_some()
    }

    /// Age of the current claim.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.slot.lock().claim.as_ref().map(|c| c.started.elapsed())
    }

    /// Clears the flag regardless of who holds it.
    pub fn force_clear(&self) {
        self.slot.lock().claim = None;
    }

    fn release(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot
            .claim
            .as_ref()
            .is_some_and(|c| c.generation == generation)
        {
            slot.claim = None;
        }
    }
}

/// Releases its claim on drop.
#[derive(Debug)]
#[must_use = "the flag is released as soon as the guard is dropped"]
pub struct InFlightGuard<'a> {
    flag: &'a InFlightFlag,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.release(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(30);

    #[test]
    fn test_claim_is_exclusive() {
        let flag = InFlightFlag::new("exit");
        let guard = flag.try_begin(LONG);
        assert!(guard.is_some());
        assert!(flag.is_set());
        assert!(flag.try_begin(LONG).is_none());

        drop(guard);
        assert!(!flag.is_set());
        assert!(flag.try_begin(LONG).is_some());
    }

    #[test]
    fn test_stale_claim_is_replaced() {
        let flag = InFlightFlag::new("exit");
        let _stale = flag.try_begin(LONG).unwrap();

        let fresh = flag.try_begin(Duration::ZERO);
        assert!(fresh.is_some());
        assert!(flag.is_set());
    }

    #[test]
    fn test_old_guard_does_not_release_new_claim() {
        let flag = InFlightFlag::new("entry");
        let stale = flag.try_begin(LONG).unwrap();
        flag.force_clear();
        let _fresh = flag.try_begin(LONG).unwrap();

        drop(stale);
        assert!(flag.is_set());
    }

    #[test]
    fn test_elapsed_reports_claim_age() {
        let flag = InFlightFlag::new("entry");
        assert!(flag.elapsed().is_none());
        let _guard = flag.try_begin(LONG).unwrap();
        assert!(flag.elapsed().is_some());
    }
}
