//! Owns every long-running task, restarts the ones that finish and enforces the failure
//! budget. Shutdown is cooperative through one [`CancellationToken`].

use crate::archive::CsvArchive;
use crate::buffer::{BufferWriter, DurableBuffer};
use crate::config::DeviceConfig;
use crate::driver::{DeviceState, DriverFactory, SensorDriver};
use crate::error::DriverError;
use crate::notifier::Notifier;
use crate::sample::Sample;
use crate::uploader::{Endpoint, UploadStats, Uploader, UploaderConfig};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub compact_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Sensor,
    Uploader,
    Compactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Requested,
    FailureBudgetExhausted,
}

/// Failures counted inside a fixed window that restarts once it has elapsed.
#[derive(Debug, Clone)]
pub struct FailureWindow {
    length: Duration,
    started: Instant,
    count: u32,
}

impl FailureWindow {
    pub fn new(length: Duration, now: Instant) -> Self {
        Self {
            length,
            started: now,
            count: 0,
        }
    }

    /// Resets the counter once the window has elapsed.
    pub fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) >= self.length {
            self.started = now;
            self.count = 0;
        }
    }

    pub fn record(&mut self, now: Instant) -> u32 {
        self.roll(now);
        self.count += 1;
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub kind: TaskKind,
    pub running: bool,
    pub device_state: Option<DeviceState>,
    pub failure_count: u32,
    pub restarts: u64,
    pub last_error: Option<String>,
}

/// Task table shared with the status API.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<Vec<TaskStatus>>>,
}

impl StatusBoard {
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TaskStatus>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, name: &str, kind: TaskKind) {
        self.lock().push(TaskStatus {
            name: name.to_string(),
            kind,
            running: false,
            device_state: (kind == TaskKind::Sensor).then_some(DeviceState::Discovering),
            failure_count: 0,
            restarts: 0,
            last_error: None,
        });
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut TaskStatus)) {
        if let Some(status) = self.lock().iter_mut().find(|status| status.name == name) {
            apply(status);
        }
    }

    fn set_device_state(&self, name: &str, state: DeviceState) {
        self.update(name, |status| status.device_state = Some(state));
    }
}

/// Requests graceful shutdown. Repeated requests are no-ops.
#[derive(Clone)]
pub struct ShutdownHandle {
    cancel: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self, why: &str) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(reason = why, "shutdown requested");
        self.cancel.cancel();
    }
}

/// Everything the supervisor needs to (re)build its tasks.
pub struct SupervisorParts {
    pub box_id: String,
    pub devices: Vec<DeviceConfig>,
    pub factory: Arc<dyn DriverFactory>,
    pub buffer: DurableBuffer,
    pub endpoint: Arc<dyn Endpoint>,
    pub notifier: Arc<dyn Notifier>,
    pub upload_stats: Arc<UploadStats>,
    pub uploader: UploaderConfig,
    pub archive_dir: Option<PathBuf>,
    pub config: SupervisorConfig,
}

enum Role {
    Sensor(DeviceConfig),
    Uploader,
    Compactor,
}

struct Slot {
    name: String,
    role: Role,
    handle: Option<JoinHandle<Result<()>>>,
    failures: FailureWindow,
}

pub struct Supervisor {
    parts: SupervisorParts,
    slots: Vec<Slot>,
    board: StatusBoard,
    cancel: CancellationToken,
    shutdown: ShutdownHandle,
}

impl Supervisor {
    pub fn new(parts: SupervisorParts) -> Self {
        let cancel = CancellationToken::new();
        let board = StatusBoard::default();
        let now = Instant::now();
        let window = parts.config.failure_window;

        let mut slots: Vec<Slot> = parts
            .devices
            .iter()
            .map(|device| Slot {
                name: device.id.clone(),
                role: Role::Sensor(device.clone()),
                handle: None,
                failures: FailureWindow::new(window, now),
            })
            .collect();
        slots.push(Slot {
            name: "uploader".to_string(),
            role: Role::Uploader,
            handle: None,
            failures: FailureWindow::new(window, now),
        });
        slots.push(Slot {
            name: "compactor".to_string(),
            role: Role::Compactor,
            handle: None,
            failures: FailureWindow::new(window, now),
        });
        for slot in &slots {
            board.register(&slot.name, slot.role.kind());
        }

        Self {
            parts,
            slots,
            board,
            shutdown: ShutdownHandle {
                cancel: cancel.clone(),
                requested: Arc::new(AtomicBool::new(false)),
            },
            cancel,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Runs until shutdown is requested or the failure budget is spent, then joins every task.
    pub async fn run(mut self) -> Result<ShutdownReason> {
        for index in 0..self.slots.len() {
            self.spawn(index);
        }
        tracing::info!(tasks = self.slots.len(), "supervisor started");

        let mut ticker = tokio::time::interval(self.parts.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break ShutdownReason::Requested,
                _ = ticker.tick() => {}
            }
            if let Some(reason) = self.check_tasks().await {
                break reason;
            }
        };

        self.shutdown.request(match reason {
            ShutdownReason::Requested => "signal",
            ShutdownReason::FailureBudgetExhausted => "failure budget exhausted",
        });
        self.join_all().await;
        self.parts.notifier.log_event("Shutdown complete");
        Ok(reason)
    }

    async fn check_tasks(&mut self) -> Option<ShutdownReason> {
        let now = Instant::now();
        let mut finished = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            slot.failures.roll(now);
            if slot.handle.as_ref().is_some_and(JoinHandle::is_finished) {
                finished.push(index);
            }
        }

        for &index in &finished {
            let Some(handle) = self.slots[index].handle.take() else {
                continue;
            };
            let error = match handle.await {
                Ok(Ok(())) => "exited unexpectedly".to_string(),
                Ok(Err(err)) => format!("{err:#}"),
                Err(join) if join.is_panic() => "panicked".to_string(),
                Err(join) => join.to_string(),
            };
            let slot = &mut self.slots[index];
            let count = slot.failures.record(now);
            tracing::warn!(task = %slot.name, failures = count, error = %error, "task finished");
            self.board.update(&slot.name, |status| {
                status.running = false;
                status.failure_count = count;
                status.last_error = Some(error);
            });
        }

        let total: u32 = self.slots.iter().map(|slot| slot.failures.count()).sum();
        for slot in &self.slots {
            let count = slot.failures.count();
            self.board.update(&slot.name, |status| status.failure_count = count);
        }
        if total > self.parts.config.failure_threshold {
            tracing::error!(failures = total, "failure budget exhausted");
            self.parts.notifier.log_event(&format!(
                "{total} task failures within {}s; shutting down",
                self.parts.config.failure_window.as_secs()
            ));
            return Some(ShutdownReason::FailureBudgetExhausted);
        }

        for index in finished {
            if self.cancel.is_cancelled() {
                break;
            }
            self.spawn(index);
            self.board.update(&self.slots[index].name, |status| status.restarts += 1);
        }
        None
    }

    fn spawn(&mut self, index: usize) {
        let cancel = self.cancel.clone();
        let board = self.board.clone();
        let slot = &mut self.slots[index];
        let handle = match &slot.role {
            Role::Sensor(device) => {
                let driver = self.parts.factory.build(device, cancel.clone());
                let sink = DeviceSink::new(device, &self.parts);
                tokio::task::spawn_blocking(move || run_sensor(driver, sink, board, cancel))
            }
            Role::Uploader => {
                let uploader = Uploader::new(
                    self.parts.buffer.clone(),
                    self.parts.endpoint.clone(),
                    self.parts.notifier.clone(),
                    self.parts.uploader.clone(),
                    self.parts.upload_stats.clone(),
                );
                tokio::spawn(uploader.run(cancel))
            }
            Role::Compactor => tokio::spawn(run_compactor(
                self.parts.buffer.clone(),
                self.parts.config.compact_interval,
                cancel,
            )),
        };
        slot.handle = Some(handle);
        self.board.update(&slot.name, |status| status.running = true);
    }

    async fn join_all(&mut self) {
        for slot in &mut self.slots {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(task = %slot.name, error = %err, "task failed during shutdown"),
                Err(err) => tracing::warn!(task = %slot.name, error = %err, "task panicked during shutdown"),
            }
            self.board.update(&slot.name, |status| status.running = false);
        }
        tracing::info!("all tasks stopped");
    }
}

impl Role {
    fn kind(&self) -> TaskKind {
        match self {
            Role::Sensor(_) => TaskKind::Sensor,
            Role::Uploader => TaskKind::Uploader,
            Role::Compactor => TaskKind::Compactor,
        }
    }
}

/// Where a device's samples go: the durable buffer, a local CSV archive, or both.
struct DeviceSink {
    buffer: Option<BufferWriter>,
    archive: Option<CsvArchive>,
}

impl DeviceSink {
    fn new(device: &DeviceConfig, parts: &SupervisorParts) -> Self {
        let archive = match (&parts.archive_dir, device.log_locally) {
            (Some(dir), true) => Some(CsvArchive::new(dir, &parts.box_id, &device.id)),
            (None, true) => {
                tracing::warn!(device = %device.id, "log_locally set but no archive directory configured");
                None
            }
            _ => None,
        };
        Self {
            buffer: device.upload.then(|| parts.buffer.writer(&device.id)),
            archive,
        }
    }

    fn write(&mut self, sample: &Sample) -> Result<()> {
        if let Some(writer) = self.buffer.as_mut() {
            writer.append(sample).context("append sample to buffer")?;
        }
        if let Some(archive) = self.archive.as_mut() {
            if let Err(err) = archive.append(sample) {
                tracing::warn!(device = %sample.device_id(), error = %err, "failed to archive sample");
            }
        }
        Ok(())
    }
}

/// Blocking body of a sensor task. Returns `Ok` only when cancelled.
fn run_sensor(
    mut driver: SensorDriver,
    mut sink: DeviceSink,
    board: StatusBoard,
    cancel: CancellationToken,
) -> Result<()> {
    let name = driver.device_id().to_string();
    board.set_device_state(&name, DeviceState::Discovering);

    if let Err(err) = driver.initialize() {
        board.set_device_state(&name, driver.state());
        if cancel.is_cancelled() {
            return Ok(());
        }
        return Err(err).with_context(|| format!("bring up {name}"));
    }
    board.set_device_state(&name, driver.state());

    loop {
        match driver.next_sample() {
            Ok(sample) => sink.write(&sample)?,
            Err(DriverError::Cancelled) => {
                tracing::info!(device = %name, "sensor task stopping");
                return Ok(());
            }
            Err(err) => {
                board.set_device_state(&name, driver.state());
                return Err(err).with_context(|| format!("sample {name}"));
            }
        }
    }
}

async fn run_compactor(
    buffer: DurableBuffer,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
        match buffer.compact().await {
            Ok(report) if report.removed_files > 0 => tracing::info!(
                removed_files = report.removed_files,
                reclaimed_bytes = report.reclaimed_bytes,
                "buffer compacted"
            ),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "buffer compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, BufferStrategy};
    use crate::driver::{DeviceKind, Protocol};
    use crate::driver::imu::ImuCsv;
    use crate::link::LinkOpener;
    use crate::testing::{RecordingNotifier, ScriptedEndpoint, ScriptedLink, ScriptedOpener};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn imu_device(id: &str) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::ImuCsv,
            id: id.to_string(),
            ports: vec!["/dev/ttyIMU".to_string()],
            sample_rate_hz: 20,
            aa_cutoff_hz: 5,
            upload: true,
            log_locally: false,
        }
    }

    /// Fails to find the device for the first `missing` builds, then serves IMU lines
    /// until cancelled.
    struct FlakyFactory {
        missing: usize,
        builds: AtomicUsize,
    }

    impl FlakyFactory {
        fn new(missing: usize) -> Self {
            Self {
                missing,
                builds: AtomicUsize::new(0),
            }
        }
    }

    impl DriverFactory for FlakyFactory {
        fn build(&self, device: &DeviceConfig, cancel: CancellationToken) -> SensorDriver {
            let build = self.builds.fetch_add(1, Ordering::SeqCst);
            let present = build >= self.missing;
            let hold = cancel.clone();
            let opener: Arc<dyn LinkOpener> = Arc::new(ScriptedOpener::single("/dev/ttyIMU", move |port| {
                present.then(|| {
                    ScriptedLink::new(port)
                        .with_inbound(vec![
                            b"1,0.1,0.2,9.8,0.0,0.0,0.1\r\n".to_vec(),
                            b"2,0.1,0.2,9.8,0.0,0.0,0.1\r\n".to_vec(),
                        ])
                        .hold_until(hold.clone())
                })
            }));
            let protocol: Box<dyn Protocol> = Box::new(ImuCsv::new());
            SensorDriver::new(&device.id, protocol, opener, cancel)
        }
    }

    fn parts(dir: &TempDir, factory: Arc<dyn DriverFactory>, threshold: u32) -> (SupervisorParts, Arc<RecordingNotifier>) {
        let devices = vec![imu_device("imu")];
        let buffer = DurableBuffer::open(
            &BufferConfig {
                strategy: BufferStrategy::Hourly,
                data_dir: dir.path().to_path_buf(),
                measurement: "box".to_string(),
                retention: None,
                segment_roll_bytes: 1024 * 1024,
                segment_roll_duration: Duration::from_secs(3600),
            },
            vec!["imu".to_string()],
        )
        .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let parts = SupervisorParts {
            box_id: "box".to_string(),
            devices,
            factory,
            buffer,
            endpoint: Arc::new(ScriptedEndpoint::default()),
            notifier: notifier.clone(),
            upload_stats: Arc::new(UploadStats::default()),
            uploader: UploaderConfig {
                batch_cap: 600,
                min_cycle: Duration::from_millis(20),
            },
            archive_dir: None,
            config: SupervisorConfig {
                poll_interval: Duration::from_millis(20),
                failure_threshold: threshold,
                failure_window: Duration::from_secs(3600),
                compact_interval: Duration::from_secs(600),
            },
        };
        (parts, notifier)
    }

    async fn wait_for(board: &StatusBoard, check: impl Fn(&[TaskStatus]) -> bool) {
        for _ in 0..200 {
            if check(&board.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", board.snapshot());
    }

    #[test]
    fn failure_window_resets_after_elapsing() {
        let start = Instant::now();
        let mut window = FailureWindow::new(Duration::from_secs(3600), start);
        assert_eq!(window.record(start), 1);
        assert_eq!(window.record(start + Duration::from_secs(1800)), 2);
        window.roll(start + Duration::from_secs(3599));
        assert_eq!(window.count(), 2);
        window.roll(start + Duration::from_secs(3600));
        assert_eq!(window.count(), 0);
        assert_eq!(window.record(start + Duration::from_secs(3601)), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restarts_failed_sensor_task() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(FlakyFactory::new(1));
        let (parts, notifier) = parts(&dir, factory.clone(), 8);
        let supervisor = Supervisor::new(parts);
        let board = supervisor.status_board();
        let shutdown = supervisor.shutdown_handle();
        let run = tokio::spawn(supervisor.run());

        wait_for(&board, |tasks| {
            tasks.iter().any(|task| {
                task.name == "imu"
                    && task.restarts == 1
                    && task.device_state == Some(DeviceState::Sampling)
            })
        })
        .await;

        let imu = board.snapshot().into_iter().find(|task| task.name == "imu").unwrap();
        assert_eq!(imu.failure_count, 1);
        assert!(imu.last_error.unwrap().contains("imu"));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);

        shutdown.request("test");
        shutdown.request("test again");
        let reason = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
        assert_eq!(notifier.events(), vec!["Shutdown complete".to_string()]);
        assert!(board.snapshot().iter().all(|task| !task.running));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhausted_budget_shuts_down() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(FlakyFactory::new(usize::MAX));
        let (parts, notifier) = parts(&dir, factory.clone(), 2);
        let supervisor = Supervisor::new(parts);

        let reason = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::FailureBudgetExhausted);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 3);

        let events = notifier.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("3 task failures within 3600s"));
        assert_eq!(events[1], "Shutdown complete");
    }
}
