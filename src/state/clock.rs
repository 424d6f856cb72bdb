use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::dao::models::{epoch_millis, from_epoch_millis};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// Process wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Hand-driven clock used by simulations and tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl ManualClock {
    /// Clock frozen at `now`.
    pub fn at(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    /// Jump to an arbitrary instant, backwards included.
    pub fn set(&self, to: SystemTime) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of [`TurnClock::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A countdown began for a new holder or deadline.
    Started,
    /// Same holder and deadline as the running countdown; only the drift was refreshed.
    Unchanged,
}

/// What a periodic tick observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTick {
    /// No countdown is running.
    Idle,
    /// The countdown is still going.
    Running {
        /// Whole seconds left, rounded up.
        remaining_seconds: u64,
    },
    /// Reported exactly once per turn, on the first tick at or past the deadline.
    Expired,
    /// The deadline passed and was already reported; the turn awaits a verdict.
    Overdue,
}

#[derive(Debug, Clone)]
struct RunningTurn {
    holder: String,
    deadline: SystemTime,
    expiry_reported: bool,
}

/// Countdown anchored on an authoritative deadline.
///
/// The local clock may disagree with the store. Every resync measures
/// `drift = local_now - authoritative_now` and the countdown runs against
/// `deadline + drift` on the local clock, so two observers with skewed clocks show the
/// same remaining time.
pub struct TurnClock {
    duration: Duration,
    clock: Arc<dyn Clock>,
    drift_ms: i64,
    running: Option<RunningTurn>,
}

impl TurnClock {
    /// Stopped countdown of `duration` read against `clock`.
    pub fn new(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            duration,
            clock,
            drift_ms: 0,
            running: None,
        }
    }

    /// Turn duration configured for this clock.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Re-anchor the drift against a fresh authoritative reading.
    pub fn resync(&mut self, authoritative_now: SystemTime) -> i64 {
        self.drift_ms = epoch_millis(self.clock.now()) - epoch_millis(authoritative_now);
        self.drift_ms
    }

    /// Start (or keep) a countdown towards `deadline`, expressed in store time.
    pub fn start(
        &mut self,
        holder: &str,
        deadline: SystemTime,
        authoritative_now: SystemTime,
    ) -> StartOutcome {
        self.resync(authoritative_now);
        if let Some(running) = &self.running {
            if running.holder == holder && running.deadline == deadline {
                return StartOutcome::Unchanged;
            }
        }
        self.running = Some(RunningTurn {
            holder: holder.to_owned(),
            deadline,
            expiry_reported: false,
        });
        StartOutcome::Started
    }

    /// Stop the countdown. Returns whether one was running.
    pub fn stop(&mut self) -> bool {
        self.running.take().is_some()
    }

    /// Whether a countdown is running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Player the running countdown belongs to.
    pub fn holder(&self) -> Option<&str> {
        self.running.as_ref().map(|running| running.holder.as_str())
    }

    /// Store-time deadline of the running countdown.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.running.as_ref().map(|running| running.deadline)
    }

    /// Deadline translated onto the local clock.
    pub fn adjusted_deadline(&self) -> Option<SystemTime> {
        self.running
            .as_ref()
            .map(|running| from_epoch_millis(epoch_millis(running.deadline) + self.drift_ms))
    }

    /// Local clock minus store clock at the last resync, in milliseconds.
    pub fn drift_ms(&self) -> i64 {
        self.drift_ms
    }

    /// Current store time as estimated from the local clock and the last drift reading.
    pub fn server_now(&self) -> SystemTime {
        from_epoch_millis(epoch_millis(self.clock.now()) - self.drift_ms)
    }

    /// Whole seconds left, rounded up and never negative. The full duration when stopped.
    pub fn remaining_seconds(&self) -> u64 {
        let Some(adjusted) = self.adjusted_deadline() else {
            return self.duration.as_secs();
        };
        let left_ms = epoch_millis(adjusted) - epoch_millis(self.clock.now());
        if left_ms <= 0 {
            0
        } else {
            (left_ms as u64).div_ceil(1000)
        }
    }

    /// Sample the countdown once.
    pub fn tick(&mut self) -> ClockTick {
        let remaining_seconds = self.remaining_seconds();
        let Some(running) = self.running.as_mut() else {
            return ClockTick::Idle;
        };
        if remaining_seconds > 0 {
            return ClockTick::Running { remaining_seconds };
        }
        if running.expiry_reported {
            ClockTick::Overdue
        } else {
            running.expiry_reported = true;
            ClockTick::Expired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TURN: Duration = Duration::from_secs(15);

    fn server_epoch() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn skewed_clock(skew_ms: i64) -> (ManualClock, TurnClock) {
        let local = ManualClock::at(from_epoch_millis(epoch_millis(server_epoch()) + skew_ms));
        let clock = TurnClock::new(TURN, Arc::new(local.clone()));
        (local, clock)
    }

    #[test]
    fn skewed_observers_agree_on_remaining_time() {
        let deadline = server_epoch() + TURN;
        let (ahead_local, mut ahead) = skewed_clock(5_000);
        let (behind_local, mut behind) = skewed_clock(-5_000);

        ahead.start("alice", deadline, server_epoch());
        behind.start("alice", deadline, server_epoch());
        assert_eq!(ahead.remaining_seconds(), 15);
        assert_eq!(behind.remaining_seconds(), 15);

        ahead_local.advance(Duration::from_millis(6_400));
        behind_local.advance(Duration::from_millis(6_400));
        let diff = ahead.remaining_seconds().abs_diff(behind.remaining_seconds());
        assert!(diff <= 1, "observers diverged by {diff}s");
        assert_eq!(ahead.remaining_seconds(), 9);
    }

    #[test]
    fn remaining_rounds_up_and_clamps() {
        let (local, mut clock) = skewed_clock(0);
        clock.start("alice", server_epoch() + TURN, server_epoch());

        local.advance(Duration::from_millis(14_001));
        assert_eq!(clock.remaining_seconds(), 1);
        local.advance(Duration::from_millis(10_000));
        assert_eq!(clock.remaining_seconds(), 0);
    }

    #[test]
    fn stopped_clock_reports_full_duration() {
        let (_, mut clock) = skewed_clock(0);
        assert_eq!(clock.remaining_seconds(), 15);
        clock.start("alice", server_epoch() + TURN, server_epoch());
        assert!(clock.stop());
        assert_eq!(clock.remaining_seconds(), 15);
        assert_eq!(clock.tick(), ClockTick::Idle);
    }

    #[test]
    fn restarting_same_turn_only_refreshes_drift() {
        let (_, mut clock) = skewed_clock(2_000);
        let deadline = server_epoch() + TURN;
        assert_eq!(clock.start("alice", deadline, server_epoch()), StartOutcome::Started);
        assert_eq!(clock.drift_ms(), 2_000);

        let later_reading = server_epoch() + Duration::from_millis(500);
        assert_eq!(
            clock.start("alice", deadline, later_reading),
            StartOutcome::Unchanged
        );
        assert_eq!(clock.drift_ms(), 1_500);
        assert_eq!(
            clock.start("bob", deadline + TURN, server_epoch()),
            StartOutcome::Started
        );
        assert_eq!(clock.holder(), Some("bob"));
    }

    #[test]
    fn expiry_is_reported_once() {
        let (local, mut clock) = skewed_clock(0);
        clock.start("alice", server_epoch() + TURN, server_epoch());

        local.advance(Duration::from_secs(3));
        assert_eq!(clock.tick(), ClockTick::Running { remaining_seconds: 12 });
        local.advance(Duration::from_secs(12));
        assert_eq!(clock.tick(), ClockTick::Expired);
        local.advance(Duration::from_secs(1));
        assert_eq!(clock.tick(), ClockTick::Overdue);
    }
}
