//! Reconnect scheduler: at most one pending reconnect per session, with
//! exponential backoff and a global minimum spacing between attempts.

use dashmap::DashMap;
use log::{debug, info};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Backoff parameters, taken from [`crate::WbotConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerTuning {
    pub floor: Duration,
    pub min_interval: Duration,
    pub max_exponent: u32,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(5),
            min_interval: Duration::from_secs(10),
            max_exponent: 6,
        }
    }
}

#[derive(Default)]
struct ReconnectState {
    attempts: u32,
    lock_held: bool,
    last_attempt: Option<Instant>,
    last_wait: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

/// `wait = max(floor, max(2^attempt * 1s, min_delay))`, extended so at least
/// `min_interval` passes since the previous attempt. The exponent is capped,
/// so waits plateau after `max_exponent` attempts.
pub fn compute_wait(
    attempts: u32,
    min_delay: Duration,
    since_last: Option<Duration>,
    tuning: &SchedulerTuning,
) -> Duration {
    let backoff = Duration::from_millis(1000u64 << attempts.min(tuning.max_exponent));
    let mut wait = backoff.max(min_delay).max(tuning.floor);
    if let Some(since) = since_last
        && since < tuning.min_interval
    {
        wait = wait.max(tuning.min_interval - since);
    }
    wait
}

/// Cross-session timer/lock table. Operations are per-session-id; distinct
/// ids never contend.
pub struct ReconnectScheduler {
    states: Arc<DashMap<i64, ReconnectState>>,
    tuning: SchedulerTuning,
}

impl ReconnectScheduler {
    pub fn new(tuning: SchedulerTuning) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            tuning,
        }
    }

    /// Arms a reconnect timer for the session unless one is already pending.
    /// Returns false (and drops `action`) when the lock is held. The lock is
    /// released when the timer fires, just before `action` runs.
    pub fn schedule<F>(&self, session_id: i64, min_delay: Duration, reason: &str, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.states.entry(session_id).or_default();
        if state.lock_held {
            debug!(
                target: "Wbot/Scheduler",
                "session {session_id}: reconnect already pending, ignoring ({reason})"
            );
            return false;
        }

        let since_last = state.last_attempt.map(|t| t.elapsed());
        let wait = compute_wait(state.attempts, min_delay, since_last, &self.tuning);
        state.attempts += 1;
        state.lock_held = true;
        state.last_wait = Some(wait);
        info!(
            target: "Wbot/Scheduler",
            "session {session_id}: reconnect in {wait:?} (attempt {}, reason: {reason})",
            state.attempts
        );

        let states = self.states.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(mut state) = states.get_mut(&session_id) {
                state.lock_held = false;
                state.timer = None;
                state.last_attempt = Some(Instant::now());
            }
            action.await;
        }));
        true
    }

    /// Cancels any pending timer, releases the lock, and resets the attempt
    /// counter. Called on successful connection and on terminal outcomes.
    /// The last-attempt timestamp survives, keeping the minimum spacing in
    /// force across a connect-then-immediate-close cycle. Clearing an
    /// unscheduled session is a safe no-op.
    pub fn clear(&self, session_id: i64) {
        if let Some(mut state) = self.states.get_mut(&session_id) {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.lock_held = false;
            state.attempts = 0;
            state.last_wait = None;
            debug!(target: "Wbot/Scheduler", "session {session_id}: reconnect state cleared");
        }
    }

    pub fn attempts(&self, session_id: i64) -> u32 {
        self.states.get(&session_id).map(|s| s.attempts).unwrap_or(0)
    }

    pub fn lock_held(&self, session_id: i64) -> bool {
        self.states
            .get(&session_id)
            .map(|s| s.lock_held)
            .unwrap_or(false)
    }

    /// Wait computed for the most recent `schedule` call.
    pub fn scheduled_wait(&self, session_id: i64) -> Option<Duration> {
        self.states.get(&session_id).and_then(|s| s.last_wait)
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        for entry in self.states.iter() {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn fast_tuning() -> SchedulerTuning {
        SchedulerTuning {
            floor: Duration::from_millis(1),
            min_interval: Duration::ZERO,
            max_exponent: 6,
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_plateaus() {
        let tuning = SchedulerTuning::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let wait = compute_wait(attempt, Duration::ZERO, None, &tuning);
            assert!(wait >= previous, "wait decreased at attempt {attempt}");
            previous = wait;
        }
        // 2^6 seconds is the plateau.
        assert_eq!(
            compute_wait(6, Duration::ZERO, None, &tuning),
            Duration::from_secs(64)
        );
        assert_eq!(
            compute_wait(11, Duration::ZERO, None, &tuning),
            Duration::from_secs(64)
        );
    }

    #[test]
    fn test_wait_respects_floor_min_delay_and_spacing() {
        let tuning = SchedulerTuning::default();
        // Early attempts are lifted to the floor.
        assert_eq!(
            compute_wait(0, Duration::ZERO, None, &tuning),
            Duration::from_secs(5)
        );
        // An explicit minimum delay dominates the backoff.
        assert_eq!(
            compute_wait(0, Duration::from_secs(15), None, &tuning),
            Duration::from_secs(15)
        );
        // A recent attempt extends the wait to keep 10s spacing.
        assert_eq!(
            compute_wait(0, Duration::ZERO, Some(Duration::from_secs(2)), &tuning),
            Duration::from_secs(8)
        );
        // Spacing already satisfied: no extension.
        assert_eq!(
            compute_wait(0, Duration::ZERO, Some(Duration::from_secs(30)), &tuning),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_deduplicates_while_lock_held() {
        let scheduler = ReconnectScheduler::new(SchedulerTuning::default());
        let fired = Arc::new(AtomicUsize::new(0));

        let f1 = fired.clone();
        assert!(scheduler.schedule(1, Duration::ZERO, "first", async move {
            f1.fetch_add(1, Ordering::SeqCst);
        }));
        let f2 = fired.clone();
        assert!(!scheduler.schedule(1, Duration::ZERO, "second", async move {
            f2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(scheduler.attempts(1), 1);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.lock_held(1));
        // Attempts survive the fire; only clear resets them.
        assert_eq!(scheduler.attempts(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_timer_and_resets_state() {
        let scheduler = ReconnectScheduler::new(SchedulerTuning::default());
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        scheduler.schedule(1, Duration::ZERO, "test", async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.clear(1);

        assert!(!scheduler.lock_held(1));
        assert_eq!(scheduler.attempts(1), 0);
        assert_eq!(scheduler.scheduled_wait(1), None);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "cancelled timer must not fire");

        // Clearing again with nothing scheduled is a no-op.
        scheduler.clear(1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_spacing_survives_clear() {
        let scheduler = ReconnectScheduler::new(SchedulerTuning::default());
        scheduler.schedule(1, Duration::ZERO, "first", async {});
        // Timer fires at 5s and records the attempt timestamp.
        sleep(Duration::from_secs(6)).await;

        // Connected, then closed again one second later.
        scheduler.clear(1);
        assert_eq!(scheduler.attempts(1), 0);
        sleep(Duration::from_secs(1)).await;

        assert!(scheduler.schedule(1, Duration::ZERO, "again", async {}));
        // 2s since the last attempt: the wait stretches to keep 10s spacing.
        assert_eq!(scheduler.scheduled_wait(1), Some(Duration::from_secs(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_accumulate_across_fire_cycles() {
        let scheduler = ReconnectScheduler::new(fast_tuning());
        for expected in 1..=4u32 {
            assert!(scheduler.schedule(7, Duration::ZERO, "cycle", async {}));
            assert_eq!(scheduler.attempts(7), expected);
            // Wait long enough for the current timer to fire.
            sleep(Duration::from_secs(130)).await;
            assert!(!scheduler.lock_held(7));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_sessions_do_not_contend() {
        let scheduler = ReconnectScheduler::new(SchedulerTuning::default());
        assert!(scheduler.schedule(1, Duration::ZERO, "a", async {}));
        assert!(scheduler.schedule(2, Duration::ZERO, "b", async {}));
        assert!(scheduler.lock_held(1));
        assert!(scheduler.lock_held(2));
        scheduler.clear(1);
        assert!(!scheduler.lock_held(1));
        assert!(scheduler.lock_held(2));
    }
}
