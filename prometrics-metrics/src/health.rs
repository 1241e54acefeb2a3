//! Process health sampling
//!
//! A [`HealthSampler`] reads process statistics and writes them into a fixed
//! set of unlabeled instruments:
//! - `app_uptime_seconds` - seconds since process start
//! - `app_memory_alloc_bytes` - resident memory
//! - `app_goroutines` - live OS threads
//! - `app_gc_total` - garbage collections, for runtimes that report them
//! - `app_cpu_usage_percent` - CPU time over wall time since the previous sample
//!
//! [`start_health_sampler`] runs it on a fixed interval until cancelled.

use crate::{CounterSeries, GaugeSeries, MetricsError, MetricsRegistry, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometrics_core::{Error, HttpRequest, HttpResponse, Middleware, Next};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Pin the fallback uptime origin to now if nothing has read it yet.
///
/// Only used when the statistics source cannot report the process start
/// time. Call it first in `main` on such platforms.
pub fn mark_process_start() {
    Lazy::force(&PROCESS_START);
}

/// Time since [`mark_process_start`] first ran
pub fn uptime() -> Duration {
    PROCESS_START.elapsed()
}

/// Source of raw process statistics.
///
/// Every method returns `None` when the statistic is unavailable on this
/// platform; the sampler then skips that update.
pub trait ProcessStats: Send {
    /// Resident memory in bytes
    fn resident_memory_bytes(&mut self) -> Option<u64>;

    /// Number of live threads
    fn thread_count(&mut self) -> Option<u64>;

    /// Cumulative CPU time, user plus system
    fn cpu_time(&mut self) -> Option<Duration>;

    /// Cumulative garbage collection count. Native processes have none.
    fn gc_count(&mut self) -> Option<u64> {
        None
    }

    /// Wall-clock time the process started
    fn start_time(&mut self) -> Option<SystemTime> {
        None
    }
}

/// Fields of `/proc/self/stat` the sampler uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub num_threads: u64,
    /// Clock ticks after boot at which the process started
    pub start_ticks: u64,
}

/// Parse the content of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let (_, rest) = content.rsplit_once(')')?;
    // rest starts at field 3 (state)
    let fields: Vec<&str> = rest.split_whitespace().collect();

    Some(ProcStat {
        utime_ticks: fields.get(11)?.parse().ok()?,
        stime_ticks: fields.get(12)?.parse().ok()?,
        num_threads: fields.get(17)?.parse().ok()?,
        start_ticks: fields.get(19)?.parse().ok()?,
    })
}

/// Boot time in seconds since the epoch, from the content of `/proc/stat`
pub fn parse_boot_time(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()
}

/// Resident pages from the content of `/proc/<pid>/statm`
pub fn parse_proc_statm(content: &str) -> Option<u64> {
    content.split_whitespace().nth(1)?.parse().ok()
}

/// Statistics read from procfs
#[cfg(target_os = "linux")]
pub struct ProcfsStats {
    page_size: u64,
    clock_ticks: u64,
    start: Option<SystemTime>,
}

#[cfg(target_os = "linux")]
impl ProcfsStats {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions and only reads system configuration
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        // SAFETY: as above
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };

        Self {
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            clock_ticks: if clock_ticks > 0 { clock_ticks as u64 } else { 100 },
            start: None,
        }
    }

    fn stat(&self) -> Option<ProcStat> {
        let content = std::fs::read_to_string("/proc/self/stat").ok()?;
        parse_proc_stat(&content)
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcfsStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl ProcessStats for ProcfsStats {
    fn resident_memory_bytes(&mut self) -> Option<u64> {
        let content = std::fs::read_to_string("/proc/self/statm").ok()?;
        parse_proc_statm(&content).map(|pages| pages * self.page_size)
    }

    fn thread_count(&mut self) -> Option<u64> {
        self.stat().map(|stat| stat.num_threads)
    }

    fn cpu_time(&mut self) -> Option<Duration> {
        let stat = self.stat()?;
        let ticks = stat.utime_ticks + stat.stime_ticks;
        Some(Duration::from_secs_f64(ticks as f64 / self.clock_ticks as f64))
    }

    fn start_time(&mut self) -> Option<SystemTime> {
        if self.start.is_none() {
            let boot = parse_boot_time(&std::fs::read_to_string("/proc/stat").ok()?)?;
            let ticks = self.stat()?.start_ticks;
            let after_boot = Duration::from_secs_f64(ticks as f64 / self.clock_ticks as f64);
            self.start = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(boot) + after_boot);
        }
        self.start
    }
}

/// Statistics source for platforms without procfs
pub struct UnavailableStats;

impl ProcessStats for UnavailableStats {
    fn resident_memory_bytes(&mut self) -> Option<u64> {
        None
    }

    fn thread_count(&mut self) -> Option<u64> {
        None
    }

    fn cpu_time(&mut self) -> Option<Duration> {
        None
    }
}

/// The statistics source for the current platform
pub fn system_stats() -> Box<dyn ProcessStats> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsStats::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnavailableStats)
    }
}

/// CPU usage in percent of one core; `None` when no wall time has passed
pub fn cpu_percent(cpu_delta: Duration, wall_delta: Duration) -> Option<f64> {
    if wall_delta.is_zero() {
        return None;
    }
    Some(cpu_delta.as_secs_f64() / wall_delta.as_secs_f64() * 100.0)
}

/// The health instruments
#[derive(Clone)]
pub struct HealthMetrics {
    uptime: GaugeSeries,
    memory: GaugeSeries,
    threads: GaugeSeries,
    gc_total: CounterSeries,
    cpu: GaugeSeries,
}

impl HealthMetrics {
    /// Get or create the health instruments in `registry`
    pub fn new(registry: &MetricsRegistry) -> Result<Self> {
        mark_process_start();

        let uptime = registry
            .get_or_create_gauge("app_uptime_seconds", "App uptime in seconds", &[])?
            .with_labels(&[])?;
        let memory = registry
            .get_or_create_gauge("app_memory_alloc_bytes", "Resident memory in bytes", &[])?
            .with_labels(&[])?;
        let threads = registry
            .get_or_create_gauge("app_goroutines", "Number of live threads", &[])?
            .with_labels(&[])?;
        let gc_total = registry
            .get_or_create_counter("app_gc_total", "Total garbage collections", &[])?
            .with_labels(&[])?;
        let cpu = registry
            .get_or_create_gauge(
                "app_cpu_usage_percent",
                "CPU usage of the process (percent)",
                &[],
            )?
            .with_labels(&[])?;

        Ok(Self {
            uptime,
            memory,
            threads,
            gc_total,
            cpu,
        })
    }
}

/// One set of readings. Statistics that could not be read are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSample {
    pub uptime_seconds: f64,
    pub memory_bytes: Option<u64>,
    pub threads: Option<u64>,
    /// Collections since the previous sample
    pub gc_delta: Option<u64>,
    pub cpu_percent: Option<f64>,
}

struct SamplerCore {
    stats: Box<dyn ProcessStats>,
    last_gc: u64,
    last_cpu: Option<(Instant, Duration)>,
}

/// Reads statistics and flushes them into [`HealthMetrics`].
///
/// Clones share the same source and baselines, so the periodic loop and
/// [`HealthMetricsMiddleware`] can sample through one sampler.
#[derive(Clone)]
pub struct HealthSampler {
    metrics: HealthMetrics,
    state: Arc<Mutex<SamplerCore>>,
    cpu_sampling: bool,
}

impl HealthSampler {
    /// Sampler reading the current platform's statistics
    pub fn new(metrics: HealthMetrics, cpu_sampling: bool) -> Self {
        Self::with_stats(metrics, system_stats(), cpu_sampling)
    }

    /// Sampler reading from a custom source
    pub fn with_stats(
        metrics: HealthMetrics,
        mut stats: Box<dyn ProcessStats>,
        cpu_sampling: bool,
    ) -> Self {
        let last_cpu = if cpu_sampling {
            stats.cpu_time().map(|cpu| (Instant::now(), cpu))
        } else {
            None
        };

        Self {
            metrics,
            state: Arc::new(Mutex::new(SamplerCore {
                stats,
                last_gc: 0,
                last_cpu,
            })),
            cpu_sampling,
        }
    }

    /// Take one sample and write it into the instruments
    pub fn sample_and_flush(&self) -> HealthSample {
        let sample = self.sample(&mut self.state.lock());
        self.flush(&sample);
        sample
    }

    /// Like [`sample_and_flush`](Self::sample_and_flush), but returns `None`
    /// without sampling while another sample is in progress
    pub fn try_sample_and_flush(&self) -> Option<HealthSample> {
        let mut state = self.state.try_lock()?;
        let sample = self.sample(&mut state);
        drop(state);
        self.flush(&sample);
        Some(sample)
    }

    fn sample(&self, state: &mut SamplerCore) -> HealthSample {
        let memory_bytes = state.stats.resident_memory_bytes();
        let threads = state.stats.thread_count();

        let gc_delta = state.stats.gc_count().map(|total| {
            let delta = total.saturating_sub(state.last_gc);
            state.last_gc = total;
            delta
        });

        let cpu_percent = if self.cpu_sampling {
            let now = Instant::now();
            match state.stats.cpu_time() {
                Some(cpu) => {
                    let percent = state
                        .last_cpu
                        .and_then(|(at, prev)| cpu_percent(cpu.saturating_sub(prev), now - at));
                    state.last_cpu = Some((now, cpu));
                    percent
                }
                None => None,
            }
        } else {
            None
        };

        let uptime_seconds = state
            .stats
            .start_time()
            .and_then(|start| SystemTime::now().duration_since(start).ok())
            .unwrap_or_else(uptime)
            .as_secs_f64();

        HealthSample {
            uptime_seconds,
            memory_bytes,
            threads,
            gc_delta,
            cpu_percent,
        }
    }

    fn flush(&self, sample: &HealthSample) {
        self.metrics.uptime.set(sample.uptime_seconds);

        match sample.memory_bytes {
            Some(bytes) => self.metrics.memory.set(bytes as f64),
            None => warn!("Resident memory unavailable, skipping app_memory_alloc_bytes"),
        }
        match sample.threads {
            Some(threads) => self.metrics.threads.set(threads as f64),
            None => warn!("Thread count unavailable, skipping app_goroutines"),
        }
        if let Some(delta) = sample.gc_delta {
            // a delta is never negative
            let _ = self.metrics.gc_total.increment_by(delta as f64);
        }
        if self.cpu_sampling {
            match sample.cpu_percent {
                Some(percent) => self.metrics.cpu.set(percent),
                None => warn!("CPU usage unavailable, skipping app_cpu_usage_percent"),
            }
        }

        debug!(?sample, "Flushed health sample");
    }
}

/// Lifecycle of a started sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Running,
    Stopped,
}

/// Handle to a running health sampler task
pub struct SamplerHandle {
    token: CancellationToken,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn state(&self) -> SamplerState {
        if self.running.load(Ordering::Acquire) {
            SamplerState::Running
        } else {
            SamplerState::Stopped
        }
    }

    /// Completed sample cycles
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Stop before the next tick. A sample in progress completes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the sampler task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health sampler task failed");
        }
    }

    /// Cancel and wait for the task to exit
    pub async fn stop(self) {
        self.cancel();
        self.join().await;
    }
}

/// Spawn a task that samples every `interval_secs` seconds until `token` is
/// cancelled. The first sample is taken one interval after start.
///
/// Must be called from within a tokio runtime.
///
/// # Examples
///
/// ```
/// use prometrics_metrics::*;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let registry = MetricsRegistry::new();
/// let sampler = HealthSampler::new(HealthMetrics::new(&registry).unwrap(), true);
///
/// let handle = start_health_sampler(sampler, 10, CancellationToken::new()).unwrap();
/// assert_eq!(handle.state(), SamplerState::Running);
/// handle.stop().await;
/// # });
/// ```
pub fn start_health_sampler(
    sampler: HealthSampler,
    interval_secs: u64,
    token: CancellationToken,
) -> Result<SamplerHandle> {
    if interval_secs == 0 {
        return Err(MetricsError::InvalidInterval(interval_secs));
    }

    let period = Duration::from_secs(interval_secs);
    let running = Arc::new(AtomicBool::new(true));
    let ticks = Arc::new(AtomicU64::new(0));

    let task = {
        let token = token.clone();
        let running = running.clone();
        let ticks = ticks.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs, "Health sampler started");

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sampler.sample_and_flush();
                        ticks.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }

            running.store(false, Ordering::Release);
            info!("Health sampler stopped");
        })
    };

    Ok(SamplerHandle {
        token,
        running,
        ticks,
        task,
    })
}

/// Middleware that refreshes the health instruments before passing the
/// request on, typically mounted in front of the metrics endpoint.
///
/// Statistics are read on the blocking pool. A request that arrives while
/// another sample is running reuses that sample instead of waiting.
pub struct HealthMetricsMiddleware {
    sampler: HealthSampler,
}

impl HealthMetricsMiddleware {
    pub fn new(sampler: HealthSampler) -> Self {
        Self { sampler }
    }
}

#[async_trait::async_trait]
impl Middleware for HealthMetricsMiddleware {
    async fn handle(
        &self,
        request: HttpRequest,
        next: Next,
    ) -> std::result::Result<HttpResponse, Error> {
        let sampler = self.sampler.clone();
        match tokio::task::spawn_blocking(move || sampler.try_sample_and_flush()).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!("Health sample already in progress, skipping"),
            Err(e) => warn!(error = %e, "Health sampling task failed"),
        }
        next(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometrics_core::{MiddlewareChain, handler_fn};

    struct FakeStats {
        gc: u64,
        reads: Arc<AtomicU64>,
    }

    impl ProcessStats for FakeStats {
        fn resident_memory_bytes(&mut self) -> Option<u64> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Some(64 * 1024 * 1024)
        }

        fn thread_count(&mut self) -> Option<u64> {
            Some(4)
        }

        fn cpu_time(&mut self) -> Option<Duration> {
            None
        }

        fn gc_count(&mut self) -> Option<u64> {
            self.gc += 3;
            Some(self.gc)
        }
    }

    fn fake_sampler(registry: &MetricsRegistry) -> (HealthSampler, Arc<AtomicU64>) {
        let reads = Arc::new(AtomicU64::new(0));
        let stats = FakeStats {
            gc: 0,
            reads: reads.clone(),
        };
        let metrics = HealthMetrics::new(registry).unwrap();
        let sampler = HealthSampler::with_stats(metrics, Box::new(stats), false);
        (sampler, reads)
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = "4242 (my (odd) app) S 1 4242 4242 0 -1 4194560 2500 0 0 0 \
                       150 30 0 0 20 0 7 0 12345 123456789 2048 18446744073709551615";
        let stat = parse_proc_stat(content).unwrap();
        assert_eq!(stat.utime_ticks, 150);
        assert_eq!(stat.stime_ticks, 30);
        assert_eq!(stat.num_threads, 7);
        assert_eq!(stat.start_ticks, 12345);

        assert!(parse_proc_stat("garbage").is_none());
        assert!(parse_proc_stat("1 (short) S 1 2").is_none());
    }

    #[test]
    fn test_parse_boot_time() {
        let content = "cpu  10 0 20 300 0 0 0 0 0 0\nintr 1 2 3\nbtime 1760000000\nprocesses 42\n";
        assert_eq!(parse_boot_time(content), Some(1760000000));
        assert_eq!(parse_boot_time("cpu  10 0 20 300\n"), None);
    }

    #[test]
    fn test_uptime_counts_from_reported_start_time() {
        struct StartedAnHourAgo;

        impl ProcessStats for StartedAnHourAgo {
            fn resident_memory_bytes(&mut self) -> Option<u64> {
                None
            }

            fn thread_count(&mut self) -> Option<u64> {
                None
            }

            fn cpu_time(&mut self) -> Option<Duration> {
                None
            }

            fn start_time(&mut self) -> Option<SystemTime> {
                SystemTime::now().checked_sub(Duration::from_secs(3600))
            }
        }

        let registry = MetricsRegistry::new();
        let metrics = HealthMetrics::new(&registry).unwrap();
        let sampler = HealthSampler::with_stats(metrics, Box::new(StartedAnHourAgo), false);

        let sample = sampler.sample_and_flush();
        assert!(sample.uptime_seconds >= 3600.0);
        assert!(sample.uptime_seconds < 3700.0);
    }

    #[test]
    fn test_parse_proc_statm() {
        assert_eq!(parse_proc_statm("10240 2048 512 10 0 4096 0\n"), Some(2048));
        assert_eq!(parse_proc_statm(""), None);
    }

    #[test]
    fn test_cpu_percent() {
        assert_eq!(cpu_percent(Duration::from_millis(500), Duration::from_secs(1)), Some(50.0));
        assert_eq!(cpu_percent(Duration::from_secs(2), Duration::from_secs(1)), Some(200.0));
        assert_eq!(cpu_percent(Duration::from_secs(1), Duration::ZERO), None);
    }

    #[test]
    fn test_sample_flushes_instruments_and_gc_delta() {
        let registry = MetricsRegistry::new();
        let (sampler, _) = fake_sampler(&registry);

        let first = sampler.sample_and_flush();
        assert_eq!(first.gc_delta, Some(3));
        let second = sampler.sample_and_flush();
        assert_eq!(second.gc_delta, Some(3));
        assert!(second.uptime_seconds >= first.uptime_seconds);

        let text = registry.render();
        assert!(text.contains("app_memory_alloc_bytes 67108864"));
        assert!(text.contains("app_goroutines 4"));
        assert!(text.contains("app_gc_total 6"));
    }

    #[test]
    fn test_unavailable_stats_leave_gauges_untouched() {
        let registry = MetricsRegistry::new();
        let sampler = HealthSampler::with_stats(
            HealthMetrics::new(&registry).unwrap(),
            Box::new(UnavailableStats),
            true,
        );

        let sample = sampler.sample_and_flush();
        assert_eq!(sample.memory_bytes, None);
        assert_eq!(sample.cpu_percent, None);
        assert_eq!(sample.gc_delta, None);

        let text = registry.render();
        assert!(text.contains("app_memory_alloc_bytes 0"));
        assert!(text.contains("app_gc_total 0"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_stats_read_self() {
        let mut stats = ProcfsStats::new();
        assert!(stats.resident_memory_bytes().unwrap() > 0);
        assert!(stats.thread_count().unwrap() >= 1);
        assert!(stats.cpu_time().is_some());
        assert_eq!(stats.gc_count(), None);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let registry = MetricsRegistry::new();
        let (sampler, _) = fake_sampler(&registry);

        let result = start_health_sampler(sampler, 0, CancellationToken::new());
        assert!(matches!(result, Err(MetricsError::InvalidInterval(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_ticks_until_cancelled() {
        let registry = MetricsRegistry::new();
        let (sampler, reads) = fake_sampler(&registry);
        let token = CancellationToken::new();

        let handle = start_health_sampler(sampler, 1, token.clone()).unwrap();
        assert_eq!(handle.state(), SamplerState::Running);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        token.cancel();

        let ticks = handle.ticks();
        assert!((2..=3).contains(&ticks), "ticks = {}", ticks);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.ticks(), ticks);
        assert_eq!(reads.load(Ordering::SeqCst), ticks);
        assert_eq!(handle.state(), SamplerState::Stopped);
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_interval() {
        let registry = MetricsRegistry::new();
        let (sampler, _) = fake_sampler(&registry);

        let handle = start_health_sampler(sampler, 10, CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(handle.ticks(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.ticks(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_health_middleware_samples_per_request() {
        let registry = MetricsRegistry::new();
        let (sampler, reads) = fake_sampler(&registry);

        let mut chain = MiddlewareChain::new();
        chain.use_middleware(HealthMetricsMiddleware::new(sampler));
        let handler = chain.wrap(handler_fn(|_req| async { Ok(HttpResponse::ok()) }));

        handler(HttpRequest::new("GET", "/metrics")).await.unwrap();
        handler(HttpRequest::new("GET", "/metrics")).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_health_middleware_skips_while_sampling() {
        let registry = MetricsRegistry::new();
        let (sampler, reads) = fake_sampler(&registry);

        let mut chain = MiddlewareChain::new();
        chain.use_middleware(HealthMetricsMiddleware::new(sampler.clone()));
        let handler = chain.wrap(handler_fn(|_req| async { Ok(HttpResponse::ok()) }));

        {
            let _busy = sampler.state.lock();
            assert!(sampler.try_sample_and_flush().is_none());
            let response = handler(HttpRequest::new("GET", "/metrics")).await.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(reads.load(Ordering::SeqCst), 0);
        }

        assert!(sampler.try_sample_and_flush().is_some());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }
}
