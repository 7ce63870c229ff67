//! Adaptive per-flow rate and concurrency control.
//!
//! Each flow owns one controller: a token bucket enforcing the effective RPM
//! (hot-swapped on adjustment) plus a feedback loop over the last W request
//! outcomes. Sustained errors or 429s halve the RPM and shrink the
//! concurrency cap; a calm cool-down period grows the RPM back by 10% steps
//! up to the hard ceiling.

use arc_swap::ArcSwap;
use governor::{Quota, RateLimiter};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Observation window length.
const WINDOW: usize = 20;
/// Error-rate trip threshold.
const ERROR_RATE_HI: f64 = 0.3;
/// Rate-limit-rate trip threshold.
const RATE_LIMIT_HI: f64 = 0.2;
/// Error rate under which recovery may grow.
const ERROR_RATE_LO: f64 = 0.05;
/// Calm time before each growth step.
const COOL_DOWN: Duration = Duration::from_secs(30);
/// Concurrency reduction applied on each trip.
const CAP_REDUCTION_PCT: u32 = 25;

/// One observed request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    outcome: Outcome,
}

/// RAII concurrency slot; dropping it releases the slot.
pub struct Slot {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type DirectLimiter = governor::DefaultDirectRateLimiter;

pub struct FlowController {
    limiter: ArcSwap<DirectLimiter>,
    effective_rpm: AtomicU32,
    ceiling_rpm: u32,
    workers: usize,
    /// Percent of the computed cap currently allowed (100 when untripped).
    cap_pct: AtomicU32,
    in_flight: Arc<AtomicUsize>,
    /// EWMA of request latency in milliseconds.
    avg_latency_ms: AtomicU64,
    adaptive: bool,
    state: Mutex<ControllerState>,
}

struct ControllerState {
    window: VecDeque<Observation>,
    calm_since: Instant,
    last_growth: Instant,
}

fn build_limiter(rpm: u32) -> DirectLimiter {
    let rpm = NonZeroU32::new(rpm.max(1)).expect("rpm is at least 1");
    let burst = NonZeroU32::new(1).expect("burst is 1");
    // Burst of 1 paces requests evenly instead of letting a full minute's
    // quota fire at once.
    RateLimiter::direct(Quota::per_minute(rpm).allow_burst(burst))
}

impl FlowController {
    pub fn new(initial_rpm: u32, ceiling_rpm: u32, workers: usize, adaptive: bool) -> Self {
        let rpm = initial_rpm.clamp(1, ceiling_rpm.max(1));
        let now = Instant::now();
        Self {
            limiter: ArcSwap::from_pointee(build_limiter(rpm)),
            effective_rpm: AtomicU32::new(rpm),
            ceiling_rpm: ceiling_rpm.max(1),
            workers: workers.max(1),
            cap_pct: AtomicU32::new(100),
            in_flight: Arc::new(AtomicUsize::new(0)),
            avg_latency_ms: AtomicU64::new(1_000),
            adaptive,
            state: Mutex::new(ControllerState {
                window: VecDeque::with_capacity(WINDOW),
                calm_since: now,
                last_growth: now,
            }),
        }
    }

    pub fn effective_rpm(&self) -> u32 {
        self.effective_rpm.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Current concurrency cap: `min(workers, ceil(rpm · latency / 60))`,
    /// scaled down while tripped.
    pub fn concurrency_cap(&self) -> usize {
        let rpm = self.effective_rpm() as f64;
        let latency_secs = self.avg_latency_ms.load(Ordering::SeqCst) as f64 / 1_000.0;
        let little = (rpm * latency_secs / 60.0).ceil().max(1.0) as usize;
        let base = self.workers.min(little);
        let pct = self.cap_pct.load(Ordering::SeqCst) as usize;
        (base * pct / 100).max(1)
    }

    /// Wait for a concurrency slot and a rate token.
    pub async fn acquire(&self) -> Slot {
        loop {
            if self.in_flight.load(Ordering::SeqCst) < self.concurrency_cap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.limiter.load().until_ready().await;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Slot {
            in_flight: self.in_flight.clone(),
        }
    }

    /// Record an outcome and run the feedback rules.
    pub fn record(&self, outcome: Outcome, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        // EWMA with alpha = 1/4.
        let previous = self.avg_latency_ms.load(Ordering::SeqCst);
        self.avg_latency_ms
            .store((previous * 3 + latency_ms) / 4, Ordering::SeqCst);

        if !self.adaptive {
            return;
        }

        let mut state = self.state.lock().expect("controller state poisoned");
        state.window.push_back(Observation { outcome });
        if state.window.len() > WINDOW {
            state.window.pop_front();
        }
        if state.window.len() < WINDOW / 2 {
            return;
        }

        let total = state.window.len() as f64;
        let errors = state
            .window
            .iter()
            .filter(|o| o.outcome != Outcome::Success)
            .count() as f64;
        let rate_limits = state
            .window
            .iter()
            .filter(|o| o.outcome == Outcome::RateLimited)
            .count() as f64;
        let error_rate = errors / total;
        let rate_limit_rate = rate_limits / total;

        if error_rate > ERROR_RATE_HI || rate_limit_rate > RATE_LIMIT_HI {
            let current = self.effective_rpm();
            let halved = (current / 2).max(1);
            if halved < current {
                self.set_rpm(halved);
                tracing::warn!(
                    rpm = halved,
                    error_rate,
                    rate_limit_rate,
                    "controller down-shift: halving effective RPM"
                );
            }
            let pct = self.cap_pct.load(Ordering::SeqCst);
            self.cap_pct
                .store(pct.saturating_sub(pct * CAP_REDUCTION_PCT / 100).max(10), Ordering::SeqCst);
            state.window.clear();
            state.calm_since = Instant::now();
            return;
        }

        if error_rate < ERROR_RATE_LO {
            if state.calm_since.elapsed() >= COOL_DOWN
                && state.last_growth.elapsed() >= COOL_DOWN
            {
                let current = self.effective_rpm();
                let grown = ((current as f64 * 1.1).ceil() as u32).min(self.ceiling_rpm);
                if grown > current {
                    self.set_rpm(grown);
                    tracing::debug!(rpm = grown, "controller recovery: +10% effective RPM");
                }
                let pct = self.cap_pct.load(Ordering::SeqCst);
                self.cap_pct.store((pct + 10).min(100), Ordering::SeqCst);
                state.last_growth = Instant::now();
            }
        } else {
            state.calm_since = Instant::now();
        }
    }

    fn set_rpm(&self, rpm: u32) {
        let rpm = rpm.clamp(1, self.ceiling_rpm);
        self.effective_rpm.store(rpm, Ordering::SeqCst);
        self.limiter.store(Arc::new(build_limiter(rpm)));
    }

    #[cfg(test)]
    fn force_calm(&self, ago: Duration) {
        let mut state = self.state.lock().expect("controller state poisoned");
        state.calm_since = Instant::now() - ago;
        state.last_growth = Instant::now() - ago;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sustained_rate_limits_halve_rpm_within_one_window() {
        let controller = FlowController::new(60, 600, 4, true);
        // Half a window of solid 429s is enough observations to trip.
        for _ in 0..WINDOW / 2 {
            controller.record(Outcome::RateLimited, Duration::from_millis(500));
        }
        assert_eq!(controller.effective_rpm(), 30);

        // A continuing stream keeps shifting down, never below 1.
        for _ in 0..WINDOW {
            controller.record(Outcome::RateLimited, Duration::from_millis(500));
        }
        assert!(controller.effective_rpm() < 30);
        assert!(controller.effective_rpm() >= 1);
    }

    #[test]
    fn rpm_never_exceeds_ceiling() {
        let controller = FlowController::new(100, 120, 4, true);
        for _ in 0..50 {
            controller.force_calm(Duration::from_secs(60));
            for _ in 0..WINDOW {
                controller.record(Outcome::Success, Duration::from_millis(200));
            }
        }
        assert!(controller.effective_rpm() <= 120);
    }

    #[test]
    fn calm_period_grows_rpm_by_ten_percent() {
        let controller = FlowController::new(60, 600, 4, true);
        controller.force_calm(Duration::from_secs(60));
        for _ in 0..WINDOW {
            controller.record(Outcome::Success, Duration::from_millis(200));
        }
        assert_eq!(controller.effective_rpm(), 66);
    }

    #[test]
    fn pinned_mode_ignores_outcomes() {
        let controller = FlowController::new(60, 600, 4, false);
        for _ in 0..WINDOW * 2 {
            controller.record(Outcome::RateLimited, Duration::from_millis(500));
        }
        assert_eq!(controller.effective_rpm(), 60);
    }

    #[test]
    fn concurrency_cap_follows_littles_law() {
        let controller = FlowController::new(60, 600, 8, true);
        // 60 rpm at 1s latency keeps one request in flight.
        assert_eq!(controller.concurrency_cap(), 1);

        // Fast responses lower latency; the cap stays worker-bounded.
        for _ in 0..8 {
            controller.record(Outcome::Success, Duration::from_millis(10));
        }
        assert!(controller.concurrency_cap() <= 8);
    }

    #[tokio::test]
    async fn acquire_respects_in_flight_accounting() {
        let controller = Arc::new(FlowController::new(600, 600, 2, false));
        let slot = controller.acquire().await;
        assert_eq!(controller.in_flight(), 1);
        drop(slot);
        assert_eq!(controller.in_flight(), 0);
    }
}
