//! Client-side sliding-window admission control.
//!
//! [`RateWindow`] is a plain value: a log of event timestamps plus the two
//! policy parameters. Every transition takes `now` explicitly and returns the
//! next window, so the sliding-window law can be tested without a clock.
//! [`SlidingWindowLimiter`] pairs a window with a [`Clock`] for callers that
//! just want `admit()`.
//!
//! ```rust
//! use meta_strip::limiter::RateWindow;
//! use std::time::Duration;
//!
//! let window = RateWindow::new(2, Duration::from_secs(60));
//! let (window, first) = window.admit(0);
//! let (window, second) = window.admit(1_000);
//! let (window, third) = window.admit(2_000);
//! assert!(first && second && !third);
//! assert_eq!(window.retry_after_secs(2_000), 58);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::WindowConfig;

/// Inspect calls allowed per window.
pub const INSPECT_MAX_REQUESTS: u32 = 10;
/// Strip calls allowed per window (the remote rewrite is the costlier call).
pub const STRIP_MAX_REQUESTS: u32 = 5;
/// Default trailing window for both operation classes.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Source of "now" in milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock: milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Shared between a test and the
/// limiters it drives.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Log-based sliding window for one operation class.
///
/// An event recorded at `t` is live while `now - t < window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    events: Vec<u64>,
    max_requests: u32,
    window: Duration,
}

impl RateWindow {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            events: Vec::new(),
            max_requests,
            window,
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Recorded timestamps, including ones that may have expired since the
    /// last transition.
    pub fn events(&self) -> &[u64] {
        &self.events
    }

    fn window_millis(&self) -> u64 {
        self.window.as_millis() as u64
    }

    fn is_live(&self, event: u64, now: u64) -> bool {
        now.saturating_sub(event) < self.window_millis()
    }

    fn live(&self, now: u64) -> impl Iterator<Item = u64> + '_ {
        self.events
            .iter()
            .copied()
            .filter(move |&event| self.is_live(event, now))
    }

    /// Drop every event that has left the window. Idempotent.
    pub fn pruned(mut self, now: u64) -> Self {
        let window = self.window_millis();
        self.events.retain(|&event| now.saturating_sub(event) < window);
        self
    }

    /// Number of events still inside the window at `now`.
    pub fn live_count(&self, now: u64) -> usize {
        self.live(now).count()
    }

    /// Try to admit one request at `now`.
    ///
    /// Returns the pruned window and `false` when the window is full;
    /// otherwise records `now` and returns `true`.
    pub fn admit(self, now: u64) -> (Self, bool) {
        let mut next = self.pruned(now);
        if next.events.len() >= next.max_requests as usize {
            return (next, false);
        }
        next.events.push(now);
        (next, true)
    }

    /// Slots left in the window at `now`.
    pub fn remaining(&self, now: u64) -> u32 {
        let live = u32::try_from(self.live_count(now)).unwrap_or(u32::MAX);
        self.max_requests.saturating_sub(live)
    }

    /// Whole seconds (rounded up) until the oldest live event expires, or 0
    /// when nothing is live.
    pub fn retry_after_secs(&self, now: u64) -> u64 {
        let Some(oldest) = self.live(now).min() else {
            return 0;
        };
        let age = now.saturating_sub(oldest);
        let wait = self.window_millis().saturating_sub(age);
        wait.div_ceil(1000)
    }

    /// Forget every recorded event.
    pub fn reset(mut self) -> Self {
        self.events.clear();
        self
    }
}

/// A [`RateWindow`] bound to a clock.
pub struct SlidingWindowLimiter {
    window: RateWindow,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: RateWindow::new(max_requests, window),
            clock,
        }
    }

    /// 10 requests per 60 seconds on the wall clock.
    pub fn inspect() -> Self {
        Self::new(INSPECT_MAX_REQUESTS, DEFAULT_WINDOW, Arc::new(SystemClock))
    }

    /// 5 requests per 60 seconds on the wall clock.
    pub fn strip() -> Self {
        Self::new(STRIP_MAX_REQUESTS, DEFAULT_WINDOW, Arc::new(SystemClock))
    }

    pub fn from_config(config: &WindowConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.max_requests,
            Duration::from_secs(config.window_secs),
            clock,
        )
    }

    pub fn admit(&mut self) -> bool {
        let now = self.clock.now_millis();
        let (next, admitted) = self.window.clone().admit(now);
        self.window = next;
        admitted
    }

    pub fn remaining(&self) -> u32 {
        self.window.remaining(self.clock.now_millis())
    }

    pub fn retry_after_seconds(&self) -> u64 {
        self.window.retry_after_secs(self.clock.now_millis())
    }

    pub fn reset(&mut self) {
        self.window = self.window.clone().reset();
    }

    pub fn window(&self) -> &RateWindow {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect_window() -> RateWindow {
        RateWindow::new(INSPECT_MAX_REQUESTS, DEFAULT_WINDOW)
    }

    // ── RateWindow ───────────────────────────────────────────────────

    #[test]
    fn ten_admits_then_denied() {
        let mut window = inspect_window();
        for i in 0..10 {
            let (next, admitted) = window.admit(i * 1_000);
            assert!(admitted, "call {} should be admitted", i + 1);
            window = next;
        }
        let (window, admitted) = window.admit(10_000);
        assert!(!admitted);
        assert_eq!(window.events().len(), 10, "denial must not record");
    }

    #[test]
    fn retry_after_tracks_oldest_event() {
        let mut window = RateWindow::new(2, DEFAULT_WINDOW);
        (window, _) = window.admit(1_000);
        (window, _) = window.admit(30_000);
        let (window, admitted) = window.admit(40_500);
        assert!(!admitted);
        // Oldest event leaves at 61_000; 20_500 ms to go.
        assert_eq!(window.retry_after_secs(40_500), 21);

        let (_, admitted) = window.clone().admit(60_999);
        assert!(!admitted);
        let (_, admitted) = window.admit(61_000);
        assert!(admitted);
    }

    #[test]
    fn retry_after_zero_when_empty() {
        assert_eq!(inspect_window().retry_after_secs(5_000), 0);
    }

    #[test]
    fn retry_after_exact_second_boundary() {
        let (window, _) = RateWindow::new(1, DEFAULT_WINDOW).admit(0);
        assert_eq!(window.retry_after_secs(0), 60);
        assert_eq!(window.retry_after_secs(59_000), 1);
        assert_eq!(window.retry_after_secs(59_001), 1);
        assert_eq!(window.retry_after_secs(60_000), 0);
    }

    #[test]
    fn remaining_counts_live_events_only() {
        let mut window = RateWindow::new(3, Duration::from_secs(10));
        (window, _) = window.admit(0);
        (window, _) = window.admit(5_000);
        assert_eq!(window.remaining(6_000), 1);
        assert_eq!(window.remaining(10_000), 2);
        assert_eq!(window.remaining(15_000), 3);
    }

    #[test]
    fn queries_do_not_mutate() {
        let (window, _) = inspect_window().admit(0);
        let before = window.clone();
        let _ = window.remaining(120_000);
        let _ = window.retry_after_secs(120_000);
        assert_eq!(window, before);
    }

    #[test]
    fn pruned_is_idempotent() {
        let mut window = inspect_window();
        (window, _) = window.admit(0);
        (window, _) = window.admit(50_000);
        let once = window.pruned(70_000);
        let twice = once.clone().pruned(70_000);
        assert_eq!(once, twice);
        assert_eq!(once.events(), &[50_000]);
    }

    #[test]
    fn reset_clears_events() {
        let (window, _) = inspect_window().admit(0);
        let window = window.reset();
        assert!(window.events().is_empty());
        assert_eq!(window.remaining(0), INSPECT_MAX_REQUESTS);
    }

    #[test]
    fn window_slides_continuously() {
        let mut window = RateWindow::new(2, Duration::from_secs(10));
        (window, _) = window.admit(0);
        (window, _) = window.admit(9_000);
        let (w, admitted) = window.admit(9_500);
        assert!(!admitted);
        // First event expires at 10_000; second still holds its slot.
        let (w, admitted) = w.admit(10_000);
        assert!(admitted);
        let (_, admitted) = w.admit(10_001);
        assert!(!admitted);
    }

    // ── SlidingWindowLimiter ─────────────────────────────────────────

    #[test]
    fn limiter_uses_injected_clock() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut limiter = SlidingWindowLimiter::new(STRIP_MAX_REQUESTS, DEFAULT_WINDOW, clock.clone());

        for _ in 0..5 {
            assert!(limiter.admit());
            clock.advance(Duration::from_secs(1));
        }
        assert!(!limiter.admit());
        assert_eq!(limiter.remaining(), 0);
        assert_eq!(limiter.retry_after_seconds(), 55);

        clock.advance(Duration::from_secs(55));
        assert!(limiter.admit());
    }

    #[test]
    fn limiter_reset_restores_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let mut limiter = SlidingWindowLimiter::new(1, DEFAULT_WINDOW, clock.clone());
        assert!(limiter.admit());
        assert!(!limiter.admit());
        limiter.reset();
        assert_eq!(limiter.remaining(), 1);
        assert!(limiter.admit());

        clock.set(60_000);
        assert_eq!(limiter.remaining(), 1);
    }

    #[test]
    fn default_constructors_use_fixed_limits() {
        assert_eq!(SlidingWindowLimiter::inspect().window().max_requests(), 10);
        assert_eq!(SlidingWindowLimiter::strip().window().max_requests(), 5);
        assert_eq!(SlidingWindowLimiter::strip().window().window(), DEFAULT_WINDOW);
    }

    #[test]
    fn from_config_reads_limits() {
        let config = WindowConfig {
            max_requests: 3,
            window_secs: 30,
        };
        let limiter = SlidingWindowLimiter::from_config(&config, Arc::new(ManualClock::new(0)));
        assert_eq!(limiter.window().max_requests(), 3);
        assert_eq!(limiter.window().window(), Duration::from_secs(30));
    }
}
