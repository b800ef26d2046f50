//! Fuzzed periodic report timer

use rand::Rng;
use std::time::{Duration, Instant};

/// One-shot deadline armed by send/receive activity.
///
/// The interval is drawn uniformly from `[base*2/3, base*4/3]` each time the
/// timer is armed so that many sessions do not report in lock step. A fired
/// timer stays pending until [`ReportTimer::complete`] is called; while
/// pending it never fires again. Completing leaves the timer disarmed, so a
/// silent session does not report until traffic arms it again.
#[derive(Debug)]
pub struct ReportTimer {
    base: Duration,
    deadline: Option<Instant>,
    pending: bool,
}

impl ReportTimer {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            deadline: None,
            pending: false,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Random interval in `[base*2/3, base*4/3]`
    pub fn fuzzed_interval(&self) -> Duration {
        let base = self.base.as_micros() as u64;
        let (min, max) = (base * 2 / 3, base * 4 / 3);
        if min >= max {
            return self.base;
        }
        Duration::from_micros(rand::thread_rng().gen_range(min..=max))
    }

    /// Arm the timer unless it is already armed or a report is pending
    pub fn touch(&mut self, now: Instant) {
        if self.deadline.is_none() && !self.pending {
            self.deadline = Some(now + self.fuzzed_interval());
        }
    }

    /// Fires at most once per arming; a fired timer is left pending
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline && !self.pending => {
                self.deadline = None;
                self.pending = true;
                true
            }
            _ => false,
        }
    }

    /// Claim the timer for an explicit report request
    pub fn claim(&mut self) -> bool {
        if self.pending {
            return false;
        }
        self.deadline = None;
        self.pending = true;
        true
    }

    /// The pending report was dealt with; the next arming comes from traffic
    pub fn complete(&mut self) {
        self.pending = false;
        self.deadline = None;
    }

    /// Time left until the deadline, bounded by the base interval
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => self.base,
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
        self.pending = false;
    }
}
