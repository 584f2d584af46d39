//! Admission control: per-tool rate limiting, a global concurrency cap and OS resource
//! limits for child processes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use toolgate_registry::GlobalConfig;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("rate limit exceeded for tool '{tool}', retry in {:.1}s", .wait.as_secs_f64())]
    RateLimited { tool: String, wait: Duration },

    #[error("execution controller is closed")]
    Closed,
}

type Timestamps = Arc<Mutex<VecDeque<Instant>>>;

/// Sliding-window limiter keyed by tool name.
///
/// Each tool has its own timestamp queue behind its own mutex; the outer map lock is
/// only taken for writing the first time a tool is seen.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    queues: RwLock<HashMap<String, Timestamps>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub tool: String,
    pub recent: usize,
    pub limit: usize,
    pub remaining: usize,
    pub window_seconds: u64,
}

impl RateLimiter {
    /// `max_per_window == 0` disables limiting.
    #[must_use]
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            queues: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn per_minute(max: usize) -> Self {
        Self::new(max, RATE_WINDOW)
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.max_per_window
    }

    fn queue(&self, tool: &str) -> Timestamps {
        if let Some(q) = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
        {
            return Arc::clone(q);
        }
        let mut map = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(tool.to_owned()).or_default())
    }

    /// Record a call to `tool` now, or return how long until one would be admitted.
    ///
    /// # Errors
    ///
    /// Returns the wait until the oldest timestamp leaves the window.
    pub fn check(&self, tool: &str) -> Result<(), Duration> {
        self.check_at(tool, Instant::now())
    }

    /// [`Self::check`] against an explicit clock reading.
    ///
    /// # Errors
    ///
    /// Returns the wait until the oldest timestamp leaves the window.
    pub fn check_at(&self, tool: &str, now: Instant) -> Result<(), Duration> {
        if self.max_per_window == 0 {
            return Ok(());
        }
        let queue = self.queue(tool);
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        evict(&mut queue, now, self.window);
        if queue.len() >= self.max_per_window {
            let wait = queue
                .front()
                .map_or(self.window, |oldest| (*oldest + self.window).saturating_duration_since(now));
            return Err(wait);
        }
        queue.push_back(now);
        Ok(())
    }

    /// Forget recorded calls for one tool, or for every tool.
    pub fn reset(&self, tool: Option<&str>) {
        let mut map = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        match tool {
            Some(name) => {
                map.remove(name);
            }
            None => map.clear(),
        }
    }

    #[must_use]
    pub fn stats(&self, tool: &str) -> RateLimitStats {
        let recent = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
            .map_or(0, |q| {
                let mut q = q.lock().unwrap_or_else(PoisonError::into_inner);
                evict(&mut q, Instant::now(), self.window);
                q.len()
            });
        RateLimitStats {
            tool: tool.to_owned(),
            recent,
            limit: self.max_per_window,
            remaining: self.max_per_window.saturating_sub(recent),
            window_seconds: self.window.as_secs(),
        }
    }
}

fn evict(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while queue
        .front()
        .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= window)
    {
        queue.pop_front();
    }
}

#[derive(Debug, Default)]
struct SlotCounters {
    active: AtomicUsize,
    high_water: AtomicUsize,
    admitted: AtomicU64,
    queued: AtomicU64,
}

/// Global cap on simultaneously running executions. Callers over the cap wait.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    cap: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<SlotCounters>,
}

impl ConcurrencyLimiter {
    /// `cap` is clamped to at least one.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            semaphore: Arc::new(Semaphore::new(cap)),
            counters: Arc::default(),
        }
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Wait for a slot.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Closed`] after [`Self::close`].
    pub async fn acquire(&self) -> Result<ConcurrencySlot, AdmissionError> {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cap = self.cap, "concurrency cap reached, waiting for a slot");
                Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| AdmissionError::Closed)?
            }
            Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
        };
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.high_water.fetch_max(active, Ordering::SeqCst);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(ConcurrencySlot {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Refuse new admissions; queued waiters fail with [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn high_water(&self) -> usize {
        self.counters.high_water.load(Ordering::SeqCst)
    }
}

/// A held concurrency slot; returned to the pool on drop.
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<SlotCounters>,
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Caps applied to each child process. Zero leaves that resource unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_file_size_bytes: u64,
}

const MIB: u64 = 1024 * 1024;

impl ResourceLimits {
    /// `None` when resource limits are disabled.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Option<Self> {
        config.resource_limits_enabled.then(|| Self {
            cpu_seconds: config.max_cpu_seconds,
            memory_bytes: config.max_memory_mb.saturating_mul(MIB),
            max_processes: config.max_processes,
            max_file_size_bytes: config.max_file_size_mb.saturating_mul(MIB),
        })
    }
}

/// Applies [`ResourceLimits`] inside the child between fork and exec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimiter {
    limits: Option<ResourceLimits>,
}

impl ResourceLimiter {
    #[must_use]
    pub fn new(limits: Option<ResourceLimits>) -> Self {
        Self { limits }
    }

    #[must_use]
    pub fn limits(&self) -> Option<ResourceLimits> {
        self.limits
    }

    /// Register the limits on `cmd`. Failures inside the child are ignored so a host
    /// that refuses a limit still runs the tool.
    #[cfg(unix)]
    pub fn install(&self, cmd: &mut tokio::process::Command) {
        let Some(limits) = self.limits else {
            return;
        };
        // SAFETY: the hook only calls setrlimit, which is async-signal-safe, and does
        // not allocate or take locks.
        unsafe {
            cmd.pre_exec(move || {
                apply_rlimits(&limits);
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn install(&self, _cmd: &mut tokio::process::Command) {
        if self.limits.is_some() {
            tracing::warn!("resource limits are not supported on this platform, running unrestricted");
        }
    }
}

#[cfg(unix)]
fn apply_rlimits(limits: &ResourceLimits) {
    use nix::sys::resource::{RLIM_INFINITY, Resource, rlim_t, setrlimit};

    let table = [
        (Resource::RLIMIT_CPU, limits.cpu_seconds),
        (Resource::RLIMIT_AS, limits.memory_bytes),
        (Resource::RLIMIT_NPROC, limits.max_processes),
        (Resource::RLIMIT_FSIZE, limits.max_file_size_bytes),
    ];
    for (resource, value) in table {
        if value == 0 {
            continue;
        }
        let value = rlim_t::try_from(value).unwrap_or(RLIM_INFINITY);
        let _ = setrlimit(resource, value, value);
    }
}

/// Proof of admission for one call. Dropping it returns the concurrency slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    tool: String,
    slot: ConcurrencySlot,
}

impl AdmissionPermit {
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Return the slot now. Equivalent to dropping the permit.
    pub fn release(self) {
        tracing::trace!(tool = %self.tool, "admission slot released");
        drop(self.slot);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub active: usize,
    pub high_water: usize,
    pub max_concurrent: usize,
    pub total_admitted: u64,
    pub total_queued: u64,
    pub rate_limiting_enabled: bool,
    pub max_executions_per_minute: usize,
    pub resource_limits: Option<ResourceLimits>,
}

/// Composition of the three admission mechanisms.
#[derive(Debug)]
pub struct ExecutionController {
    rate: Option<RateLimiter>,
    concurrency: ConcurrencyLimiter,
    resources: ResourceLimiter,
}

impl ExecutionController {
    #[must_use]
    pub fn new(
        rate: Option<RateLimiter>,
        concurrency: ConcurrencyLimiter,
        resources: ResourceLimiter,
    ) -> Self {
        Self {
            rate,
            concurrency,
            resources,
        }
    }

    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        let rate = (config.rate_limiting_enabled && config.max_executions_per_minute > 0)
            .then(|| RateLimiter::per_minute(config.max_executions_per_minute));
        Self::new(
            rate,
            ConcurrencyLimiter::new(config.concurrency_cap()),
            ResourceLimiter::new(ResourceLimits::from_config(config)),
        )
    }

    /// Rate check (never waits), then concurrency admission (waits for a slot).
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::RateLimited`] when the tool is over its per-minute
    /// budget and [`AdmissionError::Closed`] after shutdown.
    pub async fn acquire(&self, tool: &str) -> Result<AdmissionPermit, AdmissionError> {
        if let Some(rate) = &self.rate {
            rate.check(tool).map_err(|wait| {
                tracing::warn!(tool, wait_secs = wait.as_secs_f64(), "rate limit exceeded");
                AdmissionError::RateLimited {
                    tool: tool.to_owned(),
                    wait,
                }
            })?;
        }
        let slot = self.concurrency.acquire().await?;
        tracing::debug!(tool, active = self.concurrency.active(), "admitted");
        Ok(AdmissionPermit {
            tool: tool.to_owned(),
            slot,
        })
    }

    #[must_use]
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate.as_ref()
    }

    pub fn reset_rate_limit(&self, tool: Option<&str>) {
        if let Some(rate) = &self.rate {
            rate.reset(tool);
        }
    }

    #[must_use]
    pub fn concurrency(&self) -> &ConcurrencyLimiter {
        &self.concurrency
    }

    #[must_use]
    pub fn resource_limiter(&self) -> &ResourceLimiter {
        &self.resources
    }

    pub fn close(&self) {
        self.concurrency.close();
    }

    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        let counters = &self.concurrency.counters;
        ControllerStats {
            active: counters.active.load(Ordering::SeqCst),
            high_water: counters.high_water.load(Ordering::SeqCst),
            max_concurrent: self.concurrency.cap,
            total_admitted: counters.admitted.load(Ordering::Relaxed),
            total_queued: counters.queued.load(Ordering::Relaxed),
            rate_limiting_enabled: self.rate.is_some(),
            max_executions_per_minute: self.rate.as_ref().map_or(0, RateLimiter::limit),
            resource_limits: self.resources.limits(),
        }
    }
}
