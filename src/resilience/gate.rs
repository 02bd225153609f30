use crate::{Error, ErrorContext, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

/// Facts about gate occupancy, for stats and orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSnapshot {
    pub max: usize,
    pub available: usize,
    pub in_use: usize,
    pub pacing_interval_ms: u64,
}

/// Largest permit count a gate accepts.
pub const MAX_GATE_PERMITS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Longest pacing window a gate accepts.
pub const MAX_GATE_WINDOW: Duration = Duration::from_secs(86_400);

/// Bounded-concurrency runner with completion pacing.
///
/// At most `max_concurrent` tasks hold a permit at any instant. Each permit is
/// held through the task and then for `window / max_concurrent` more, so the
/// steady-state completion rate never exceeds `max_concurrent / window`.
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    interval: Duration,
}

impl ConcurrencyGate {
    /// Out-of-range arguments are clamped to `1..=MAX_GATE_PERMITS` and
    /// `MAX_GATE_WINDOW`.
    pub fn new(max_concurrent: usize, window: Duration) -> Self {
        let max_concurrent = max_concurrent.clamp(1, MAX_GATE_PERMITS);
        let divisor = u32::try_from(max_concurrent).unwrap_or(u32::MAX);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            interval: window.min(MAX_GATE_WINDOW) / divisor,
        }
    }

    /// Build from a window given in (possibly fractional) seconds.
    pub fn from_secs_f64(max_concurrent: usize, window_secs: f64) -> Result<Self> {
        let window = window_duration(window_secs)?;
        if max_concurrent == 0 || max_concurrent > MAX_GATE_PERMITS {
            return Err(Error::configuration_with_context(
                format!("max_concurrent must be between 1 and {}", MAX_GATE_PERMITS),
                ErrorContext::new().with_field_path("gate.max_concurrent"),
            ));
        }
        Ok(Self::new(max_concurrent, window))
    }

    pub fn pacing_interval(&self) -> Duration {
        self.interval
    }

    /// Run `task` under a permit.
    ///
    /// The pacing pause applies whatever the task's outcome, and also when the
    /// returned future is dropped before finishing: the permit is then released
    /// by a background timer once the pause has elapsed.
    pub async fn run<F, Fut>(&self, task: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let permit = self.permits.clone().acquire_owned().await.map_err(|_| {
            Error::runtime_with_context(
                "Concurrency gate closed",
                ErrorContext::new().with_source("concurrency_gate"),
            )
        })?;
        let mut guard = PacedPermit::new(permit, self.interval);

        let output = task().await;

        let release_at = Instant::now() + self.interval;
        guard.release_at = Some(release_at);
        tokio::time::sleep_until(release_at).await;
        guard.release();
        Ok(output)
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let available = self.permits.available_permits();
        GateSnapshot {
            max: self.max_concurrent,
            available,
            in_use: self.max_concurrent.saturating_sub(available),
            pacing_interval_ms: self.interval.as_millis() as u64,
        }
    }

    /// Stop granting permits; waiting and future callers get an error.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Parse a pacing window, rejecting values that are not in `(0, MAX_GATE_WINDOW]`.
pub fn window_duration(window_secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(window_secs) {
        Ok(window) if !window.is_zero() && window <= MAX_GATE_WINDOW => Ok(window),
        _ => Err(Error::configuration_with_context(
            format!(
                "window_secs must be positive and at most {}",
                MAX_GATE_WINDOW.as_secs()
            ),
            ErrorContext::new().with_field_path("gate.window_secs"),
        )),
    }
}

/// Permit that cannot be returned before its pacing pause has elapsed.
struct PacedPermit {
    permit: Option<OwnedSemaphorePermit>,
    interval: Duration,
    release_at: Option<Instant>,
}

impl PacedPermit {
    fn new(permit: OwnedSemaphorePermit, interval: Duration) -> Self {
        Self {
            permit: Some(permit),
            interval,
            release_at: None,
        }
    }

    fn release(&mut self) {
        self.permit.take();
    }
}

impl Drop for PacedPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let release_at = self
            .release_at
            .unwrap_or_else(|| Instant::now() + self.interval);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                trace!("gate task cancelled, deferring permit release");
                handle.spawn(async move {
                    tokio::time::sleep_until(release_at).await;
                    drop(permit);
                });
            }
            // no runtime left to time the pause; the permit goes back now
            Err(_) => drop(permit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pacing_interval_is_window_over_max() {
        let gate = ConcurrencyGate::new(4, Duration::from_secs(2));
        assert_eq!(gate.pacing_interval(), Duration::from_millis(500));
        let gate = ConcurrencyGate::from_secs_f64(10, 1.0).unwrap();
        assert_eq!(gate.pacing_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_oversized_arguments_are_clamped() {
        let gate = ConcurrencyGate::new(1usize << 32, Duration::from_secs(u64::MAX));
        assert_eq!(gate.snapshot().max, MAX_GATE_PERMITS);
        assert!(gate.pacing_interval() <= MAX_GATE_WINDOW);
    }

    #[test]
    fn test_unusable_window_is_a_configuration_error() {
        for secs in [1e30, f64::NAN, f64::INFINITY, -1.0, 0.0, 86_401.0] {
            let err = ConcurrencyGate::from_secs_f64(2, secs).err().unwrap();
            assert!(matches!(err, Error::Configuration { .. }), "{}", secs);
        }
        let err = ConcurrencyGate::from_secs_f64(1usize << 32, 1.0).err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_zero_max_is_clamped() {
        let gate = ConcurrencyGate::new(0, Duration::from_secs(1));
        assert_eq!(gate.snapshot().max, 1);
        assert_eq!(gate.pacing_interval(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_concurrent() {
        let gate = Arc::new(ConcurrencyGate::new(3, Duration::from_millis(300)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..12u64 {
            let gate = gate.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                gate.run(|| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10 * (i % 4))).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.snapshot().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_rate_is_bounded() {
        // 2 permits per 1s window -> at most 2 completions per second
        let gate = Arc::new(ConcurrencyGate::new(2, Duration::from_secs(1)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.run(|| async {}).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // 10 instant tasks, two at a time, each holding its permit 500ms
        assert!(start.elapsed() >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_still_paces_and_propagates() {
        let gate = ConcurrencyGate::new(1, Duration::from_millis(200));
        let start = Instant::now();
        let out: Result<std::result::Result<(), String>> =
            gate.run(|| async { Err("boom".to_string()) }).await;
        assert_eq!(out.unwrap(), Err("boom".to_string()));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(gate.snapshot().available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_releases_after_pause() {
        let gate = Arc::new(ConcurrencyGate::new(1, Duration::from_millis(300)));
        let g = gate.clone();
        let handle = tokio::spawn(async move {
            g.run(|| tokio::time::sleep(Duration::from_secs(60))).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.snapshot().in_use, 1);

        handle.abort();
        let _ = handle.await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // still inside the pacing pause
        assert_eq!(gate.snapshot().in_use, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gate.snapshot().in_use, 0);
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = ConcurrencyGate::new(1, Duration::ZERO);
        gate.close();
        let err = gate.run(|| async {}).await.unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }
}
