//! Usage collection on a dedicated thread.
//!
//! The scheduler is driven by a command channel. Between commands the worker
//! sleeps until the earliest pending task is due; a task either samples every
//! registered source or ends a custom collection.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{SampleRing, UsageSample, UsageSnapshot, UsageSource};
use crate::dump::{self, DumpTarget};
use crate::error::{BrokerError, Result};
use crate::hardware::DeviceId;
use crate::StatsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    Init,
    Periodic,
    Custom,
    Terminated,
}

impl fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectionMode::Init => "init",
            CollectionMode::Periodic => "periodic",
            CollectionMode::Custom => "custom",
            CollectionMode::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Samples gathered by one custom collection, per device
pub type CustomReport = BTreeMap<DeviceId, Vec<UsageSample>>;

enum Command {
    Register {
        id: DeviceId,
        source: Weak<dyn UsageSource>,
    },
    Unregister {
        id: DeviceId,
    },
    StartCustom {
        interval: Duration,
        max_duration: Duration,
        reply: Sender<Result<()>>,
    },
    StopCustom {
        target: DumpTarget,
        reply: Sender<Result<CustomReport>>,
    },
    History {
        id: DeviceId,
        reply: Sender<Vec<UsageSample>>,
    },
    Dump {
        target: DumpTarget,
        reply: Sender<String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Periodic,
    Custom,
    CustomEnd,
}

#[derive(Debug, Clone, Copy)]
struct Task {
    wake_at: Instant,
    kind: TaskKind,
}

struct SourceRecord {
    source: Weak<dyn UsageSource>,
    periodic: SampleRing,
    custom: Vec<UsageSample>,
    previous: Option<UsageSnapshot>,
}

impl SourceRecord {
    fn new(source: Weak<dyn UsageSource>, history: usize) -> Self {
        Self {
            source,
            periodic: SampleRing::new(history),
            custom: Vec::new(),
            previous: None,
        }
    }

    fn sample(&mut self, snapshot: UsageSnapshot) -> UsageSample {
        let previous = self.previous.replace(snapshot).unwrap_or_default();
        UsageSample {
            taken_at: SystemTime::now(),
            snapshot,
            delta: snapshot.delta(&previous),
        }
    }
}

struct Worker {
    commands: Receiver<Command>,
    mode: Arc<Mutex<CollectionMode>>,
    records: HashMap<DeviceId, SourceRecord>,
    tasks: Vec<Task>,
    periodic_interval: Duration,
    history: usize,
    min_custom_interval: Duration,
    max_custom_duration: Duration,
    custom_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        self.set_mode(CollectionMode::Periodic);
        self.schedule(
            wake_after(Instant::now(), self.periodic_interval),
            TaskKind::Periodic,
        );

        loop {
            self.run_due();
            let next = self.tasks.iter().map(|t| t.wake_at).min();
            let command = match next {
                Some(at) => self.commands.recv_deadline(at),
                None => self
                    .commands
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match command {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        self.tasks.clear();
        self.set_mode(CollectionMode::Terminated);
        info!("Usage scheduler stopped");
    }

    fn mode(&self) -> CollectionMode {
        *self.mode.lock()
    }

    fn set_mode(&self, mode: CollectionMode) {
        *self.mode.lock() = mode;
    }

    fn schedule(&mut self, wake_at: Instant, kind: TaskKind) {
        self.tasks.push(Task { wake_at, kind });
    }

    fn run_due(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) =
            self.tasks.drain(..).partition(|t| t.wake_at <= now);
        self.tasks = pending;

        for task in due {
            match task.kind {
                TaskKind::Periodic if self.mode() == CollectionMode::Periodic => {
                    self.collect(false);
                    let next = next_wake(task.wake_at, self.periodic_interval, now);
                    self.schedule(next, TaskKind::Periodic);
                }
                TaskKind::Custom if self.mode() == CollectionMode::Custom => {
                    self.collect(true);
                    let next = next_wake(task.wake_at, self.custom_interval, now);
                    self.schedule(next, TaskKind::Custom);
                }
                TaskKind::CustomEnd if self.mode() == CollectionMode::Custom => {
                    let samples: usize = self.records.values().map(|r| r.custom.len()).sum();
                    info!(
                        "Custom usage collection reached its time limit, discarding {} samples",
                        samples
                    );
                    self.end_custom();
                }
                stale => debug!("Dropping stale {:?} task", stale),
            }
        }
    }

    fn collect(&mut self, custom: bool) {
        for record in self.records.values_mut() {
            let Some(source) = record.source.upgrade() else {
                continue;
            };
            let snapshot = source.usage_snapshot();
            drop(source);
            let sample = record.sample(snapshot);
            if custom {
                record.custom.push(sample);
            } else {
                record.periodic.push(sample);
            }
        }
        self.records
            .retain(|_, record| record.source.strong_count() > 0);
    }

    fn end_custom(&mut self) {
        self.tasks
            .retain(|t| !matches!(t.kind, TaskKind::Custom | TaskKind::CustomEnd));
        for record in self.records.values_mut() {
            record.custom.clear();
        }
        self.set_mode(CollectionMode::Periodic);
        self.schedule(Instant::now(), TaskKind::Periodic);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { id, source } => {
                debug!("Monitoring usage of {}", id);
                self.records
                    .insert(id, SourceRecord::new(source, self.history));
            }
            Command::Unregister { id } => {
                if self.records.remove(&id).is_some() {
                    debug!("Stopped monitoring usage of {}", id);
                }
            }
            Command::StartCustom {
                interval,
                max_duration,
                reply,
            } => {
                let _ = reply.send(self.start_custom(interval, max_duration));
            }
            Command::StopCustom { target, reply } => {
                let _ = reply.send(self.stop_custom(&target));
            }
            Command::History { id, reply } => {
                let history = self
                    .records
                    .get(&id)
                    .map(|r| r.periodic.to_vec())
                    .unwrap_or_default();
                let _ = reply.send(history);
            }
            Command::Dump { target, reply } => {
                let _ = reply.send(self.dump(&target));
            }
            Command::Shutdown => {}
        }
    }

    fn start_custom(&mut self, interval: Duration, max_duration: Duration) -> Result<()> {
        if self.mode() == CollectionMode::Custom {
            return Err(BrokerError::Busy("custom usage collection".into()));
        }
        if interval < self.min_custom_interval {
            return Err(BrokerError::InvalidArg(format!(
                "collection interval {:?} is below the minimum {:?}",
                interval, self.min_custom_interval
            )));
        }
        let max_duration = if max_duration > self.max_custom_duration {
            warn!(
                "Custom collection capped at {:?} instead of {:?}",
                self.max_custom_duration, max_duration
            );
            self.max_custom_duration
        } else {
            max_duration
        };

        self.tasks.retain(|t| t.kind != TaskKind::Periodic);
        for record in self.records.values_mut() {
            record.custom.clear();
        }
        self.custom_interval = interval;
        self.set_mode(CollectionMode::Custom);
        let now = Instant::now();
        self.schedule(now, TaskKind::Custom);
        self.schedule(wake_after(now, max_duration), TaskKind::CustomEnd);
        info!(
            "Custom usage collection every {:?} for at most {:?}",
            interval, max_duration
        );
        Ok(())
    }

    fn stop_custom(&mut self, target: &DumpTarget) -> Result<CustomReport> {
        if self.mode() != CollectionMode::Custom {
            return Err(BrokerError::InvalidArg(
                "no custom usage collection is running".into(),
            ));
        }
        let report = self
            .records
            .iter_mut()
            .filter(|(id, _)| target.matches(id))
            .map(|(id, record)| (id.clone(), std::mem::take(&mut record.custom)))
            .collect();
        self.end_custom();
        info!("Custom usage collection stopped");
        Ok(report)
    }

    fn dump(&self, target: &DumpTarget) -> String {
        let mut out = String::new();
        dump::write_line(&mut out, 0, format_args!("Usage collection: {}", self.mode()));
        let mut ids: Vec<_> = self
            .records
            .keys()
            .filter(|id| target.matches(id))
            .collect();
        ids.sort();
        for id in ids {
            let record = &self.records[id];
            dump::write_line(
                &mut out,
                1,
                format_args!(
                    "{}: {} periodic samples ({} evicted), {} custom samples",
                    id,
                    record.periodic.len(),
                    record.periodic.evicted(),
                    record.custom.len()
                ),
            );
            if let Some(latest) = record.periodic.latest() {
                dump::write_snapshot(&mut out, 2, "last", &latest.snapshot);
                dump::write_snapshot(&mut out, 2, "delta", &latest.delta);
            }
        }
        out
    }
}

/// Far enough out to mean "never" for any configured interval
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn wake_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

fn next_wake(previous: Instant, interval: Duration, now: Instant) -> Instant {
    let next = wake_after(previous, interval);
    if next <= now {
        wake_after(now, interval)
    } else {
        next
    }
}

/// Handle to the usage collection thread
pub struct UsageScheduler {
    commands: Sender<Command>,
    mode: Arc<Mutex<CollectionMode>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UsageScheduler {
    pub fn start(config: &StatsConfig) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let mode = Arc::new(Mutex::new(CollectionMode::Init));
        let worker = Worker {
            commands: rx,
            mode: mode.clone(),
            records: HashMap::new(),
            tasks: Vec::new(),
            periodic_interval: config.periodic_interval(),
            history: config.periodic_history,
            min_custom_interval: config.min_custom_interval(),
            max_custom_duration: config.max_custom_duration(),
            custom_interval: config.min_custom_interval(),
        };
        let handle = thread::Builder::new()
            .name("argus-usage".into())
            .spawn(move || worker.run())?;
        info!(
            "Usage scheduler started, sampling every {:?}",
            config.periodic_interval()
        );

        Ok(Self {
            commands: tx,
            mode,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BrokerError::SchedulerStopped)
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = flume::bounded(1);
        self.send(make(tx))?;
        rx.recv().map_err(|_| BrokerError::SchedulerStopped)
    }

    /// Start sampling `source`. Registering an id again starts it over with
    /// an empty history.
    pub fn register_client<S: UsageSource + 'static>(&self, source: &Arc<S>) -> Result<()> {
        let weak = Arc::downgrade(source);
        let weak: Weak<dyn UsageSource> = weak;
        self.send(Command::Register {
            id: source.source_id(),
            source: weak,
        })
    }

    pub fn unregister_client(&self, id: &DeviceId) -> Result<()> {
        self.send(Command::Unregister { id: id.clone() })
    }

    /// Sample every `interval` until stopped or `max_duration` passes,
    /// pausing periodic collection meanwhile
    pub fn start_custom_collection(&self, interval: Duration, max_duration: Duration) -> Result<()> {
        self.request(|reply| Command::StartCustom {
            interval,
            max_duration,
            reply,
        })?
    }

    pub fn stop_custom_collection(&self, target: DumpTarget) -> Result<CustomReport> {
        self.request(|reply| Command::StopCustom { target, reply })?
    }

    pub fn mode(&self) -> CollectionMode {
        *self.mode.lock()
    }

    /// Periodic samples of one device, oldest first
    pub fn history(&self, id: &DeviceId) -> Result<Vec<UsageSample>> {
        self.request(|reply| Command::History {
            id: id.clone(),
            reply,
        })
    }

    pub fn latest(&self, id: &DeviceId) -> Result<Option<UsageSample>> {
        Ok(self.history(id)?.pop())
    }

    pub fn dump(&self, target: DumpTarget) -> Result<String> {
        self.request(|reply| Command::Dump { target, reply })
    }

    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.send(Command::Shutdown);
        if worker.join().is_err() {
            warn!("Usage scheduler thread panicked");
        }
    }
}

impl Drop for UsageScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeSource {
        id: DeviceId,
        frames: AtomicU64,
    }

    impl FakeSource {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                frames: AtomicU64::new(0),
            })
        }
    }

    impl UsageSource for FakeSource {
        fn source_id(&self) -> DeviceId {
            self.id.clone()
        }

        fn usage_snapshot(&self) -> UsageSnapshot {
            UsageSnapshot {
                frames_received: self.frames.fetch_add(10, Ordering::Relaxed) + 10,
                ..Default::default()
            }
        }
    }

    fn config(periodic_ms: u64, max_custom_ms: u64) -> StatsConfig {
        StatsConfig {
            periodic_interval_ms: periodic_ms,
            periodic_history: 4,
            min_custom_interval_ms: 5,
            max_custom_duration_ms: max_custom_ms,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn huge_intervals_do_not_overflow() {
        let now = Instant::now();
        assert!(next_wake(now, Duration::MAX, now) > now);

        let scheduler = UsageScheduler::start(&config(u64::MAX, u64::MAX)).unwrap();
        let source = FakeSource::new("cam0");
        scheduler.register_client(&source).unwrap();
        scheduler
            .start_custom_collection(Duration::from_millis(5), Duration::MAX)
            .unwrap();
        assert_eq!(scheduler.mode(), CollectionMode::Custom);
        wait_for(|| source.frames.load(Ordering::Relaxed) >= 20);
        let report = scheduler.stop_custom_collection(DumpTarget::All).unwrap();
        assert!(!report[&source.id].is_empty());
        scheduler.shutdown();
        assert_eq!(scheduler.mode(), CollectionMode::Terminated);
    }

    #[test]
    fn periodic_history_is_bounded() {
        let scheduler = UsageScheduler::start(&config(5, 10_000)).unwrap();
        let source = FakeSource::new("cam0");
        scheduler.register_client(&source).unwrap();
        wait_for(|| scheduler.history(&source.id).unwrap().len() == 4);
        assert_eq!(scheduler.mode(), CollectionMode::Periodic);

        // Let the ring wrap a few times
        wait_for(|| source.frames.load(Ordering::Relaxed) >= 100);
        let history = scheduler.history(&source.id).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|s| s.delta.frames_received == 10));
    }

    #[test]
    fn reregistering_starts_with_empty_history() {
        let scheduler = UsageScheduler::start(&config(20, 10_000)).unwrap();
        let source = FakeSource::new("cam0");
        scheduler.register_client(&source).unwrap();
        wait_for(|| scheduler.history(&source.id).unwrap().len() >= 2);

        scheduler.unregister_client(&source.id).unwrap();
        assert!(scheduler.history(&source.id).unwrap().is_empty());
        scheduler.register_client(&source).unwrap();
        let history = scheduler.history(&source.id).unwrap();
        assert!(history.len() <= 1);
        // A fresh record has no baseline, so its first delta is the snapshot
        for sample in history {
            assert_eq!(sample.delta.frames_received, sample.snapshot.frames_received);
        }
    }

    #[test]
    fn custom_collection_round_trip() {
        let scheduler = UsageScheduler::start(&config(60_000, 10_000)).unwrap();
        let source = FakeSource::new("cam0");
        let other = FakeSource::new("cam1");
        scheduler.register_client(&source).unwrap();
        scheduler.register_client(&other).unwrap();

        assert!(matches!(
            scheduler.stop_custom_collection(DumpTarget::All),
            Err(BrokerError::InvalidArg(_))
        ));
        assert!(matches!(
            scheduler.start_custom_collection(Duration::from_millis(1), Duration::from_secs(1)),
            Err(BrokerError::InvalidArg(_))
        ));

        scheduler
            .start_custom_collection(Duration::from_millis(5), Duration::from_secs(5))
            .unwrap();
        assert_eq!(scheduler.mode(), CollectionMode::Custom);
        assert!(matches!(
            scheduler.start_custom_collection(Duration::from_millis(5), Duration::from_secs(5)),
            Err(BrokerError::Busy(_))
        ));

        wait_for(|| source.frames.load(Ordering::Relaxed) >= 30);
        let report = scheduler
            .stop_custom_collection(DumpTarget::Device(source.id.clone()))
            .unwrap();
        assert_eq!(report.len(), 1);
        assert!(report[&source.id].len() >= 3);
        assert_eq!(scheduler.mode(), CollectionMode::Periodic);
        // Custom samples never land in the periodic history
        assert!(scheduler.history(&source.id).unwrap().len() <= 1);
    }

    #[test]
    fn custom_collection_ends_on_its_own() {
        let scheduler = UsageScheduler::start(&config(60_000, 50)).unwrap();
        scheduler
            .start_custom_collection(Duration::from_millis(5), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(scheduler.mode(), CollectionMode::Custom);
        wait_for(|| scheduler.mode() == CollectionMode::Periodic);
    }

    #[test]
    fn dead_sources_are_forgotten() {
        let scheduler = UsageScheduler::start(&config(5, 10_000)).unwrap();
        let source = FakeSource::new("cam0");
        let id = source.id.clone();
        scheduler.register_client(&source).unwrap();
        wait_for(|| !scheduler.history(&id).unwrap().is_empty());
        drop(source);
        wait_for(|| scheduler.history(&id).unwrap().is_empty());
    }

    #[test]
    fn shutdown_terminates() {
        let scheduler = UsageScheduler::start(&config(5, 10_000)).unwrap();
        scheduler.shutdown();
        assert_eq!(scheduler.mode(), CollectionMode::Terminated);
        let source = FakeSource::new("cam0");
        assert!(matches!(
            scheduler.register_client(&source),
            Err(BrokerError::SchedulerStopped)
        ));
        assert!(scheduler.dump(DumpTarget::All).is_err());
    }
}
