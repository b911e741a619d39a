//! Collector runtime: one thread per probe feeding the spool.
//!
//! Each thread runs `sample -> normalize -> enqueue` on the probe's interval
//! and, between passes, waits in short slices for pushed samples or
//! shutdown. Per-probe order is preserved; there is no ordering across
//! probes.

use crate::logging::{event_names, truncate_for_log, Stage};
use crate::normalize::Normalizer;
use crate::probe::{Probe, RawSample};
use crate::signal::Shutdown;
use edr_common::{CanonicalEvent, EntryId};
use edr_spool::{Spool, SpoolError};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest uninterrupted wait inside a probe thread.
pub const WAIT_SLICE: Duration = Duration::from_millis(200);

/// Pauses before each retry of a spool write that failed transiently.
const SPOOL_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(25),
    Duration::from_millis(100),
    Duration::from_millis(400),
];

#[derive(Debug, Default)]
pub struct ProbeStats {
    passes: AtomicU64,
    samples: AtomicU64,
    spooled: AtomicU64,
    spool_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStatsSnapshot {
    pub passes: u64,
    pub samples: u64,
    pub spooled: u64,
    pub spool_failures: u64,
}

impl ProbeStats {
    pub fn snapshot(&self) -> ProbeStatsSnapshot {
        ProbeStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            spooled: self.spooled.load(Ordering::Relaxed),
            spool_failures: self.spool_failures.load(Ordering::Relaxed),
        }
    }
}

/// Result of [`CollectorRuntime::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub stopped: Vec<&'static str>,
    /// Probes still running at the grace deadline; their threads are
    /// detached.
    pub late: Vec<&'static str>,
}

struct ProbeHandle {
    name: &'static str,
    stats: Arc<ProbeStats>,
    thread: thread::JoinHandle<()>,
}

/// Normalize and spool on the probe's own thread.
struct Pipeline {
    name: &'static str,
    normalizer: Arc<Normalizer>,
    spool: Arc<Spool>,
    stats: Arc<ProbeStats>,
}

impl Pipeline {
    fn ingest(&self, samples: Vec<RawSample>) {
        if samples.is_empty() {
            return;
        }
        self.stats
            .samples
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        for raw in samples {
            let event = self.normalizer.normalize(raw);
            match self.enqueue_with_retry(&event) {
                Ok(_) => {
                    self.stats.spooled.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.spool_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event = event_names::SPOOL_WRITE_FAILED,
                        stage = %Stage::Spool,
                        probe = self.name,
                        error = %e,
                        summary = %truncate_for_log(&event.summary(), 200),
                        "failed to spool event"
                    );
                }
            }
        }
    }

    fn enqueue_with_retry(&self, event: &CanonicalEvent) -> Result<EntryId, SpoolError> {
        let mut delays = SPOOL_RETRY_DELAYS.iter();
        loop {
            match self.spool.enqueue(event) {
                Err(e) if e.is_transient() => match delays.next() {
                    Some(delay) => {
                        debug!(
                            stage = %Stage::Spool,
                            probe = self.name,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "spool write failed, retrying"
                        );
                        thread::sleep(*delay);
                    }
                    None => return Err(e),
                },
                other => return other,
            }
        }
    }
}

pub struct CollectorRuntime {
    normalizer: Arc<Normalizer>,
    spool: Arc<Spool>,
    shutdown: Shutdown,
    probes: Vec<ProbeHandle>,
}

impl CollectorRuntime {
    pub fn new(normalizer: Arc<Normalizer>, spool: Arc<Spool>) -> Self {
        Self {
            normalizer,
            spool,
            shutdown: Shutdown::new(),
            probes: Vec::new(),
        }
    }

    /// Start `probe` on its own thread.
    pub fn spawn(&mut self, probe: Box<dyn Probe>) -> io::Result<()> {
        let name = probe.name();
        let stats = Arc::new(ProbeStats::default());
        let pipeline = Pipeline {
            name,
            normalizer: Arc::clone(&self.normalizer),
            spool: Arc::clone(&self.spool),
            stats: Arc::clone(&stats),
        };
        let shutdown = self.shutdown.clone();
        let thread = thread::Builder::new()
            .name(format!("edr-probe-{name}"))
            .spawn(move || probe_loop(probe, &pipeline, &shutdown))?;

        self.probes.push(ProbeHandle {
            name,
            stats,
            thread,
        });
        Ok(())
    }

    pub fn probe_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name).collect()
    }

    pub fn stats(&self) -> Vec<(&'static str, ProbeStatsSnapshot)> {
        self.probes
            .iter()
            .map(|p| (p.name, p.stats.snapshot()))
            .collect()
    }

    /// Signal every probe and wait up to `grace` for them to finish their
    /// final flush.
    pub fn stop(self, grace: Duration) -> StopReport {
        self.shutdown.trigger();
        let deadline = Instant::now() + grace;
        let mut report = StopReport::default();

        for handle in self.probes {
            while !handle.thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.thread.is_finished() {
                if handle.thread.join().is_err() {
                    warn!(probe = handle.name, "probe thread panicked");
                }
                report.stopped.push(handle.name);
            } else {
                warn!(
                    event = event_names::PROBE_LATE,
                    stage = %Stage::Shutdown,
                    probe = handle.name,
                    grace_ms = grace.as_millis() as u64,
                    "probe did not stop within grace period"
                );
                report.late.push(handle.name);
            }
        }
        report
    }
}

fn probe_loop(mut probe: Box<dyn Probe>, pipeline: &Pipeline, shutdown: &Shutdown) {
    let name = pipeline.name;
    match probe.start() {
        Ok(()) => info!(
            event = event_names::PROBE_STARTED,
            stage = %Stage::Collect,
            probe = name,
            "probe started"
        ),
        Err(e) => warn!(
            event = event_names::PROBE_UNAVAILABLE,
            stage = %Stage::Collect,
            probe = name,
            error = %e,
            "probe running degraded"
        ),
    }

    let interval = probe.interval();
    let mut next_pass = Instant::now();
    while !shutdown.is_triggered() {
        let now = Instant::now();
        if now >= next_pass {
            let samples = probe.sample();
            pipeline.stats.passes.fetch_add(1, Ordering::Relaxed);
            debug!(
                event = event_names::PROBE_PASS,
                stage = %Stage::Collect,
                probe = name,
                samples = samples.len(),
                "probe pass"
            );
            pipeline.ingest(samples);
            next_pass = now + interval;
        }

        let wait = next_pass
            .saturating_duration_since(Instant::now())
            .min(WAIT_SLICE);
        if probe.wait_for_push(wait, shutdown) {
            pipeline.ingest(probe.drain_pushed());
        }
    }

    // Samples pushed before stop are still spooled.
    probe.stop();
    pipeline.ingest(probe.drain_pushed());
    info!(
        event = event_names::PROBE_STOPPED,
        stage = %Stage::Shutdown,
        probe = name,
        "probe stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeError, RawFile, RawProcess};
    use edr_common::{EventKind, PlatformTag};
    use tempfile::TempDir;

    struct TickProbe {
        per_pass: usize,
        interval: Duration,
    }

    impl Probe for TickProbe {
        fn name(&self) -> &'static str {
            "tick"
        }
        fn kind(&self) -> EventKind {
            EventKind::Process
        }
        fn interval(&self) -> Duration {
            self.interval
        }
        fn sample(&mut self) -> Vec<RawSample> {
            (0..self.per_pass)
                .map(|i| {
                    RawSample::Process(RawProcess {
                        pid: Some(i as i64),
                        ..RawProcess::default()
                    })
                })
                .collect()
        }
    }

    /// Buffers one pushed sample that only becomes visible on stop.
    struct FlushOnStopProbe {
        pushed: Vec<RawSample>,
    }

    impl Probe for FlushOnStopProbe {
        fn name(&self) -> &'static str {
            "flush"
        }
        fn kind(&self) -> EventKind {
            EventKind::File
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
        fn start(&mut self) -> Result<(), ProbeError> {
            Err(ProbeError::Unavailable {
                probe: "flush",
                reason: "test".into(),
            })
        }
        fn sample(&mut self) -> Vec<RawSample> {
            Vec::new()
        }
        fn stop(&mut self) {
            self.pushed.push(RawSample::File(RawFile {
                path: Some("/tmp/late".into()),
                ..RawFile::default()
            }));
        }
        fn drain_pushed(&mut self) -> Vec<RawSample> {
            std::mem::take(&mut self.pushed)
        }
    }

    /// Ignores shutdown for longer than any grace used here.
    struct StuckProbe;

    impl Probe for StuckProbe {
        fn name(&self) -> &'static str {
            "stuck"
        }
        fn kind(&self) -> EventKind {
            EventKind::Network
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
        fn sample(&mut self) -> Vec<RawSample> {
            thread::sleep(Duration::from_millis(500));
            Vec::new()
        }
    }

    fn runtime(dir: &TempDir) -> (CollectorRuntime, Arc<Spool>) {
        let spool = Arc::new(Spool::open(dir.path()).unwrap());
        let normalizer = Arc::new(Normalizer::for_platform("rt-host", PlatformTag::Linux));
        (CollectorRuntime::new(normalizer, Arc::clone(&spool)), spool)
    }

    #[test]
    fn test_passes_are_spooled() {
        let dir = TempDir::new().unwrap();
        let (mut rt, spool) = runtime(&dir);
        rt.spawn(Box::new(TickProbe {
            per_pass: 3,
            interval: Duration::from_millis(20),
        }))
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while spool.pending_count().unwrap() < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = rt.stats();
        let report = rt.stop(Duration::from_secs(2));
        assert_eq!(report.stopped, vec!["tick"]);
        assert!(report.late.is_empty());

        let (_, snapshot) = stats[0];
        assert!(snapshot.passes >= 2);
        let pending = spool.list_pending().unwrap();
        assert!(pending.len() >= 6);
        let first = spool.read(&pending[0]).unwrap();
        assert_eq!(first.event.hostname, "rt-host");
        assert_eq!(first.event.kind(), EventKind::Process);
    }

    #[test]
    fn test_pushed_samples_flushed_on_stop() {
        let dir = TempDir::new().unwrap();
        let (mut rt, spool) = runtime(&dir);
        rt.spawn(Box::new(FlushOnStopProbe { pushed: Vec::new() })).unwrap();
        thread::sleep(Duration::from_millis(50));

        let report = rt.stop(Duration::from_secs(2));
        assert_eq!(report.stopped, vec!["flush"]);
        let pending = spool.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(spool.read(&pending[0]).unwrap().event.kind(), EventKind::File);
    }

    fn pipeline(spool: &Arc<Spool>) -> Pipeline {
        Pipeline {
            name: "retry",
            normalizer: Arc::new(Normalizer::for_platform("rt-host", PlatformTag::Linux)),
            spool: Arc::clone(spool),
            stats: Arc::new(ProbeStats::default()),
        }
    }

    fn one_sample() -> Vec<RawSample> {
        vec![RawSample::Process(RawProcess {
            pid: Some(5),
            ..RawProcess::default()
        })]
    }

    #[test]
    fn test_transient_spool_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let (_rt, spool) = runtime(&dir);
        let tmp = dir.path().join(edr_spool::TMP_DIR);
        std::fs::remove_dir(&tmp).unwrap();
        let restore = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            std::fs::create_dir(&tmp).unwrap();
        });

        let pipeline = pipeline(&spool);
        pipeline.ingest(one_sample());
        restore.join().unwrap();

        let stats = pipeline.stats.snapshot();
        assert_eq!(stats.spooled, 1);
        assert_eq!(stats.spool_failures, 0);
        assert_eq!(spool.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_persistent_spool_failure_gives_up() {
        let dir = TempDir::new().unwrap();
        let (_rt, spool) = runtime(&dir);
        std::fs::remove_dir(dir.path().join(edr_spool::TMP_DIR)).unwrap();

        let pipeline = pipeline(&spool);
        let started = Instant::now();
        pipeline.ingest(one_sample());

        let stats = pipeline.stats.snapshot();
        assert_eq!(stats.spooled, 0);
        assert_eq!(stats.spool_failures, 1);
        assert!(started.elapsed() >= SPOOL_RETRY_DELAYS.iter().sum::<Duration>());
    }

    #[test]
    fn test_late_probe_is_reported() {
        let dir = TempDir::new().unwrap();
        let (mut rt, _spool) = runtime(&dir);
        rt.spawn(Box::new(StuckProbe)).unwrap();
        thread::sleep(Duration::from_millis(50));

        let report = rt.stop(Duration::from_millis(20));
        assert_eq!(report.late, vec!["stuck"]);
    }
}
