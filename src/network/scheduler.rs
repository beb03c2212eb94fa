//! Per-node clock and periodic event sources.
//!
//! All nodes of a simulation share one [`Clock`] epoch; times handed to the
//! rule engine and the store are offsets from it. A [`PeriodicSchedule`]
//! only ever knows its next deadline, so a node that wakes up late fires
//! once and rebases instead of replaying a backlog.

use crate::engine::{to_duration, TimerSpec};
use rand::rngs::StdRng;
use rand::Rng;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Shared time base of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Clock whose epoch is now
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Time since the epoch
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Instant lying `offset` after the epoch; `None` past the platform's range
    pub fn instant_at(&self, offset: Duration) -> Option<Instant> {
        self.epoch.checked_add(offset)
    }
}

/// Deadlines of one periodic source on one node
#[derive(Debug, Clone)]
pub struct PeriodicSchedule {
    period: Duration,
    jitter: Duration,
    repeat: u64,
    base: Duration,
    next: Option<Duration>,
    fired: u64,
    rng: StdRng,
}

impl PeriodicSchedule {
    /// Schedule of `spec` for a node started at `start`
    pub fn new(spec: &TimerSpec, unit: Duration, start: Duration, rng: StdRng) -> Self {
        let mut schedule = Self {
            period: to_duration(unit, spec.period),
            jitter: to_duration(unit, spec.jitter),
            repeat: spec.repeat,
            base: start.saturating_add(to_duration(unit, spec.initial_delay)),
            next: None,
            fired: 0,
            rng,
        };
        schedule.next = Some(schedule.jittered(schedule.base));
        schedule
    }

    fn jittered(&mut self, base: Duration) -> Duration {
        if self.jitter.is_zero() {
            return base;
        }
        base.saturating_add(self.rng.gen_range(Duration::ZERO..self.jitter))
    }

    /// When the next firing is due; `None` once the repeat count is spent
    pub fn next_deadline(&self) -> Option<Duration> {
        self.next
    }

    /// Fire if the deadline has passed; returns the firing's sequence number.
    pub fn fire(&mut self, now: Duration) -> Option<u64> {
        let deadline = self.next.filter(|&deadline| now >= deadline)?;
        let seq = self.fired;
        self.fired += 1;

        if self.repeat != 0 && self.fired >= self.repeat {
            self.next = None;
            return Some(seq);
        }

        let late = now - deadline;
        self.base = if late >= self.period {
            log::debug!(
                "Periodic source fired {:?} late, rebasing on {:?}",
                late,
                now
            );
            now.saturating_add(self.period)
        } else {
            self.base.saturating_add(self.period)
        };
        self.next = Some(self.jittered(self.base));
        Some(seq)
    }
}

/// Seed of one node's generator, derived from the run seed and the node id
pub fn node_seed(seed: u64, node: &str) -> u64 {
    // FNV-1a
    node.bytes().fold(seed ^ 0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Drive `schedule` on the runtime, calling `emit` with each sequence number.
///
/// The task ends when the schedule is spent, its next deadline cannot be
/// represented as an instant, or `emit` returns false.
pub fn spawn_timer<F>(mut schedule: PeriodicSchedule, clock: Clock, mut emit: F) -> JoinHandle<()>
where
    F: FnMut(u64) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(deadline) = schedule.next_deadline() {
            let Some(wake) = clock.instant_at(deadline) else {
                log::warn!(
                    "Periodic source deadline {:?} is out of range, it will not fire again",
                    deadline
                );
                break;
            };
            tokio::time::sleep_until(wake).await;
            let Some(seq) = schedule.fire(clock.now()) else {
                continue;
            };
            if !emit(seq) {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn spec(period: u64, repeat: u64, initial_delay: u64, jitter: u64) -> TimerSpec {
        TimerSpec {
            period,
            repeat,
            initial_delay,
            jitter,
        }
    }

    fn schedule(spec: TimerSpec) -> PeriodicSchedule {
        PeriodicSchedule::new(&spec, secs(1), Duration::ZERO, StdRng::seed_from_u64(3))
    }

    #[test]
    fn test_deadlines_without_jitter() {
        let mut timer = schedule(spec(5, 0, 1, 0));
        assert_eq!(timer.next_deadline(), Some(secs(1)));
        assert_eq!(timer.fire(secs(0)), None);

        assert_eq!(timer.fire(secs(1)), Some(0));
        assert_eq!(timer.next_deadline(), Some(secs(6)));
        assert_eq!(timer.fire(secs(6)), Some(1));
        assert_eq!(timer.next_deadline(), Some(secs(11)));
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let mut timer = schedule(spec(5, 0, 1, 4));
        for k in 0..50u64 {
            let deadline = timer.next_deadline().unwrap();
            let base = secs(1 + 5 * k);
            assert!(deadline >= base && deadline < base + secs(4), "{deadline:?}");
            assert_eq!(timer.fire(deadline), Some(k));
        }
    }

    #[test]
    fn test_repeat_count() {
        let mut timer = schedule(spec(2, 3, 0, 0));
        assert_eq!(timer.fire(secs(0)), Some(0));
        assert_eq!(timer.fire(secs(2)), Some(1));
        assert_eq!(timer.fire(secs(4)), Some(2));
        assert_eq!(timer.next_deadline(), None);
        assert_eq!(timer.fire(secs(6)), None);
    }

    #[test]
    fn test_late_wakeup_rebases() {
        let mut timer = schedule(spec(5, 0, 1, 0));
        timer.fire(secs(1));

        // Less than a period late keeps the grid
        assert_eq!(timer.fire(secs(8)), Some(1));
        assert_eq!(timer.next_deadline(), Some(secs(11)));

        // A period or more late fires once and rebases
        assert_eq!(timer.fire(secs(40)), Some(2));
        assert_eq!(timer.next_deadline(), Some(secs(45)));
        assert_eq!(timer.fire(secs(41)), None);
    }

    #[test]
    fn test_node_seeds_differ() {
        assert_ne!(node_seed(7, "A"), node_seed(7, "B"));
        assert_ne!(node_seed(7, "A"), node_seed(8, "A"));
        assert_eq!(node_seed(7, "A"), node_seed(7, "A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_timer_fires_on_schedule() {
        let clock = Clock::start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = schedule(spec(5, 0, 1, 0));
        let handle = spawn_timer(timer, clock, move |seq| tx.send((seq, clock.now())).is_ok());

        tokio::time::sleep(secs(12)).await;
        handle.abort();

        let mut fired = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            fired.push(entry);
        }
        let seqs: Vec<u64> = fired.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, [0, 1, 2]);
        assert_eq!(fired[2].1, secs(11));
    }

    #[test]
    fn test_clock_rejects_unrepresentable_offsets() {
        let clock = Clock::start();
        assert!(clock.instant_at(secs(5)).is_some());
        assert!(clock.instant_at(Duration::MAX).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_far_deadline_ends_timer_quietly() {
        let clock = Clock::start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Initial delay saturates to Duration::MAX
        let timer = schedule(spec(5, 0, 5_000_000_000, 0));
        let handle = spawn_timer(timer, clock, move |seq| tx.send(seq).is_ok());

        tokio::time::sleep(secs(30)).await;
        assert!(handle.await.is_ok());
        assert!(rx.try_recv().is_err());
    }
}
