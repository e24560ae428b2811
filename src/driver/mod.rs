//! Per-device protocol drivers.
//!
//! A [`SensorDriver`] owns one link and walks `discovering → configuring → sampling`, ending
//! in `faulted` once too many frames have been rejected since it started sampling. Everything that differs per
//! instrument sits behind [`Protocol`].

pub mod analog;
pub mod anemometer;
pub mod barometer;
pub mod imu;

use crate::config::DeviceConfig;
use crate::error::{DriverError, FrameError};
use crate::link::{Link, LinkOpener, LinkSettings, RawSourceOpener, SerialOpener};
use crate::sample::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Rejected frames tolerated per bring-up before the driver gives up on its link.
pub const MAX_FRAME_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Discovering,
    Configuring,
    Sampling,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Barometer,
    YoungAnemometer,
    ImuCsv,
    AnalogAnemometer,
}

/// Wire behaviour of one instrument family.
pub trait Protocol: Send {
    /// Link settings used while probing candidate ports.
    fn discovery_settings(&self) -> LinkSettings;

    /// True when the device answering on `link` is the configured one.
    fn identify(&mut self, link: &mut dyn Link) -> Result<bool, DriverError>;

    fn configure(&mut self, _link: &mut dyn Link) -> Result<(), DriverError> {
        Ok(())
    }

    /// Puts the device into streaming mode.
    fn start(&mut self, link: &mut dyn Link) -> Result<(), DriverError>;

    /// Raw bytes of the next frame; empty on timeout.
    fn read_frame(&mut self, link: &mut dyn Link) -> std::io::Result<Vec<u8>> {
        link.read_until(b'\n')
    }

    fn parse_frame(
        &self,
        device_id: &str,
        frame: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Sample, FrameError>;

    fn stop(&mut self, _link: &mut dyn Link) {}
}

pub struct SensorDriver {
    device_id: String,
    protocol: Box<dyn Protocol>,
    opener: Arc<dyn LinkOpener>,
    link: Option<Box<dyn Link>>,
    state: DeviceState,
    frame_failures: u32,
    cancel: CancellationToken,
}

impl SensorDriver {
    pub fn new(
        device_id: impl Into<String>,
        protocol: Box<dyn Protocol>,
        opener: Arc<dyn LinkOpener>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            opener,
            link: None,
            state: DeviceState::Discovering,
            frame_failures: 0,
            cancel,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Discovers, configures and starts the device. Any error leaves the driver faulted.
    pub fn initialize(&mut self) -> Result<(), DriverError> {
        let result = self.bring_up();
        if result.is_err() {
            self.fault();
        }
        result
    }

    fn bring_up(&mut self) -> Result<(), DriverError> {
        self.state = DeviceState::Discovering;
        let mut link = self.discover()?;

        self.state = DeviceState::Configuring;
        let configured = {
            let mut guarded = CancellableLink::new(link.as_mut(), &self.cancel);
            self.protocol
                .configure(&mut guarded)
                .and_then(|_| self.protocol.start(&mut guarded))
        };
        if self.cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        configured?;

        tracing::info!(device = %self.device_id, port = link.port_name(), "device sampling");
        self.link = Some(link);
        self.frame_failures = 0;
        self.state = DeviceState::Sampling;
        Ok(())
    }

    fn discover(&mut self) -> Result<Box<dyn Link>, DriverError> {
        let settings = self.protocol.discovery_settings();
        let candidates = self.opener.candidates()?;

        for port in &candidates {
            if self.cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            let mut link = match self.opener.open(port, &settings) {
                Ok(link) => link,
                Err(err) => {
                    tracing::debug!(device = %self.device_id, port = %port, error = %err, "port unavailable");
                    continue;
                }
            };
            let identified = {
                let mut guarded = CancellableLink::new(link.as_mut(), &self.cancel);
                self.protocol.identify(&mut guarded)
            };
            if self.cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            match identified {
                Ok(true) => {
                    tracing::info!(device = %self.device_id, port = %port, "device discovered");
                    return Ok(link);
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(device = %self.device_id, port = %port, error = %err, "identify failed");
                }
            }
        }

        Err(DriverError::DeviceNotFound {
            device_id: self.device_id.clone(),
            probed: candidates.len(),
        })
    }

    /// Blocks until the next valid sample. Rejected frames are absorbed until more than
    /// [`MAX_FRAME_FAILURES`] have accumulated since bring-up, which faults the driver.
    pub fn next_sample(&mut self) -> Result<Sample, DriverError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            if self.state != DeviceState::Sampling {
                return Err(DriverError::NotSampling(self.device_id.clone()));
            }
            let Some(link) = self.link.as_mut() else {
                return Err(DriverError::NotSampling(self.device_id.clone()));
            };

            let frame = match self.protocol.read_frame(link.as_mut()) {
                Ok(frame) => frame,
                Err(err) => {
                    self.fault();
                    return Err(err.into());
                }
            };
            let received_at = Utc::now();
            let parsed = if frame.is_empty() {
                Err(FrameError::Timeout)
            } else {
                self.protocol.parse_frame(&self.device_id, &frame, received_at)
            };

            match parsed {
                Ok(sample) => return Ok(sample),
                Err(err) => {
                    self.frame_failures += 1;
                    match err {
                        FrameError::Checksum { .. } => {
                            tracing::debug!(device = %self.device_id, error = %err, "frame rejected")
                        }
                        _ => {
                            tracing::warn!(device = %self.device_id, error = %err, failures = self.frame_failures, "frame rejected")
                        }
                    }
                    if self.frame_failures > MAX_FRAME_FAILURES {
                        let failures = self.frame_failures;
                        self.fault();
                        return Err(DriverError::Faulted {
                            device_id: self.device_id.clone(),
                            failures,
                        });
                    }
                }
            }
        }
    }

    fn fault(&mut self) {
        self.release();
        self.state = DeviceState::Faulted;
    }

    /// Stops streaming and closes the link.
    pub fn release(&mut self) {
        if let Some(mut link) = self.link.take() {
            self.protocol.stop(link.as_mut());
            tracing::info!(device = %self.device_id, port = link.port_name(), "link released");
        }
    }
}

impl Drop for SensorDriver {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lends a link to protocol code for discovery and configuration. Every operation fails
/// with `Interrupted` once the token is cancelled, so long handshakes stop at the next I/O.
struct CancellableLink<'a> {
    inner: &'a mut dyn Link,
    cancel: &'a CancellationToken,
}

impl<'a> CancellableLink<'a> {
    fn new(inner: &'a mut dyn Link, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }

    fn check(&self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "driver cancelled"));
        }
        Ok(())
    }
}

impl Link for CancellableLink<'_> {
    fn port_name(&self) -> &str {
        self.inner.port_name()
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.check()?;
        self.inner.write_all(bytes)
    }

    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
        self.check()?;
        self.inner.read_until(terminator)
    }

    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        self.check()?;
        self.inner.read_chunk(max)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.pulse_reset()
    }
}

pub fn build_protocol(device: &DeviceConfig) -> Box<dyn Protocol> {
    match device.kind {
        DeviceKind::Barometer => Box::new(barometer::Barometer::new(
            &device.id,
            device.sample_rate_hz,
            device.aa_cutoff_hz,
        )),
        DeviceKind::YoungAnemometer => Box::new(anemometer::YoungAnemometer::new(&device.id)),
        DeviceKind::ImuCsv => Box::new(imu::ImuCsv::new()),
        DeviceKind::AnalogAnemometer => {
            Box::new(analog::AnalogAnemometer::new(device.sample_rate_hz))
        }
    }
}

/// Builds fresh drivers; the supervisor calls it on every (re)start.
pub trait DriverFactory: Send + Sync {
    fn build(&self, device: &DeviceConfig, cancel: CancellationToken) -> SensorDriver;
}

/// Serial instruments search serial ports; analog ones read their configured ADC channels.
pub struct DeviceDriverFactory;

impl DriverFactory for DeviceDriverFactory {
    fn build(&self, device: &DeviceConfig, cancel: CancellationToken) -> SensorDriver {
        let opener: Arc<dyn LinkOpener> = match device.kind {
            DeviceKind::AnalogAnemometer => Arc::new(RawSourceOpener::new(device.ports.clone())),
            _ => Arc::new(SerialOpener::new(device.ports.clone())),
        };
        SensorDriver::new(&device.id, build_protocol(device), opener, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{barometer_responder, ScriptedLink, ScriptedOpener};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn imu_line(t: u32) -> Vec<u8> {
        format!("{t},0.1,0.2,9.8,0.0,0.0,0.1\r\n").into_bytes()
    }

    fn imu_driver(inbound: Vec<Vec<u8>>) -> SensorDriver {
        let opener = ScriptedOpener::single("/dev/ttyUSB0", move |name| {
            Some(ScriptedLink::new(name).with_inbound(inbound.clone()))
        });
        SensorDriver::new(
            "imu",
            Box::new(imu::ImuCsv::new()),
            Arc::new(opener),
            CancellationToken::new(),
        )
    }

    #[test]
    fn absorbs_bad_frames_up_to_limit() {
        let mut inbound = vec![imu_line(0)];
        inbound.extend((0..5).map(|_| b"garbage\r\n".to_vec()));
        inbound.push(imu_line(1));
        inbound.extend((0..5).map(|_| b"1,2,3\r\n".to_vec()));
        inbound.push(imu_line(2));

        let mut driver = imu_driver(inbound);
        driver.initialize().unwrap();
        assert_eq!(driver.state(), DeviceState::Sampling);

        let first = driver.next_sample().unwrap();
        assert_eq!(first.field("imu_time"), Some(&crate::sample::FieldValue::Float(1.0)));
        let second = driver.next_sample().unwrap();
        assert_eq!(second.field("imu_time"), Some(&crate::sample::FieldValue::Float(2.0)));
        assert_eq!(driver.state(), DeviceState::Sampling);
    }

    #[test]
    fn faults_after_threshold_exceeded() {
        let mut inbound = vec![imu_line(0)];
        inbound.extend((0..=MAX_FRAME_FAILURES).map(|_| b"x\r\n".to_vec()));
        inbound.push(imu_line(1));

        let mut driver = imu_driver(inbound);
        driver.initialize().unwrap();

        let err = driver.next_sample().unwrap_err();
        assert!(matches!(err, DriverError::Faulted { failures: 11, .. }));
        assert_eq!(driver.state(), DeviceState::Faulted);
        assert!(matches!(
            driver.next_sample().unwrap_err(),
            DriverError::NotSampling(_)
        ));
    }

    #[test]
    fn good_frames_do_not_clear_failure_count() {
        let mut inbound = vec![imu_line(0)];
        for t in 1..=MAX_FRAME_FAILURES + 1 {
            inbound.push(imu_line(t));
            inbound.push(b"1,2,3\r\n".to_vec());
        }
        inbound.push(imu_line(99));

        let mut driver = imu_driver(inbound);
        driver.initialize().unwrap();
        for t in 1..=MAX_FRAME_FAILURES + 1 {
            let sample = driver.next_sample().unwrap();
            assert_eq!(sample.field("imu_time"), Some(&crate::sample::FieldValue::Float(t as f64)));
        }
        let err = driver.next_sample().unwrap_err();
        assert!(matches!(err, DriverError::Faulted { failures: 11, .. }));
        assert_eq!(driver.state(), DeviceState::Faulted);
    }

    #[test]
    fn timeouts_count_as_failures() {
        let mut driver = imu_driver(vec![imu_line(0)]);
        driver.initialize().unwrap();
        let err = driver.next_sample().unwrap_err();
        assert!(matches!(err, DriverError::Faulted { .. }));
    }

    #[test]
    fn not_found_when_no_port_identifies() {
        let opener = ScriptedOpener::new(vec!["/dev/ttyS0".into(), "/dev/ttyS1".into()], |name| {
            Some(ScriptedLink::new(name).with_inbound(vec![b"noise\r\n".to_vec()]))
        });
        let mut driver = SensorDriver::new(
            "imu",
            Box::new(imu::ImuCsv::new()),
            Arc::new(opener),
            CancellationToken::new(),
        );
        let err = driver.initialize().unwrap_err();
        assert!(matches!(err, DriverError::DeviceNotFound { probed: 2, .. }));
        assert_eq!(driver.state(), DeviceState::Faulted);
    }

    #[test]
    fn cancellation_interrupts_identify() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let reads = Arc::new(Mutex::new(None));
        let seen = reads.clone();
        let opener = ScriptedOpener::new(vec!["/dev/ttyS0".into(), "/dev/ttyS1".into()], move |name| {
            let link = ScriptedLink::new(name)
                .with_inbound((0..40).map(|_| b"boot noise\r\n".to_vec()).collect())
                .cancel_on_read(3, trip.clone());
            *seen.lock().unwrap() = Some(link.reads());
            Some(link)
        });
        let mut driver = SensorDriver::new(
            "imu",
            Box::new(imu::ImuCsv::new()),
            Arc::new(opener),
            cancel,
        );

        assert!(matches!(driver.initialize(), Err(DriverError::Cancelled)));
        let reads = reads.lock().unwrap().clone().unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancellation_interrupts_configure() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let opener = ScriptedOpener::single("/dev/ttyUSB0", move |name| {
            // Identify takes four reads (SN, SN, MN, SN); the first settings query trips the token.
            Some(
                ScriptedLink::new(name)
                    .with_responder(barometer_responder("140344", 20, 5, Vec::new()))
                    .cancel_on_read(5, trip.clone()),
            )
        });
        let mut driver = SensorDriver::new(
            "140344",
            Box::new(barometer::Barometer::new("140344", 20, 5)),
            Arc::new(opener),
            cancel,
        );
        assert!(matches!(driver.initialize(), Err(DriverError::Cancelled)));
        assert_eq!(driver.state(), DeviceState::Faulted);
    }

    #[test]
    fn analog_device_samples_from_adc_channel() {
        let dir = tempfile::TempDir::new().unwrap();
        let channel = dir.path().join("in_voltage2_raw");
        std::fs::write(&channel, "0\n").unwrap();
        let device = DeviceConfig {
            kind: DeviceKind::AnalogAnemometer,
            id: "cup".to_string(),
            ports: vec![channel.display().to_string()],
            sample_rate_hz: 100,
            aa_cutoff_hz: 5,
            upload: true,
            log_locally: false,
        };

        let mut driver = DeviceDriverFactory.build(&device, CancellationToken::new());
        driver.initialize().unwrap();
        assert_eq!(driver.state(), DeviceState::Sampling);
        let sample = driver.next_sample().unwrap();
        assert_eq!(sample.device_id(), "cup");
        assert_eq!(sample.field("raw"), Some(&crate::sample::FieldValue::Float(0.0)));
    }

    #[test]
    fn cancelled_driver_stops_before_reading() {
        let cancel = CancellationToken::new();
        let opener = ScriptedOpener::single("/dev/ttyUSB0", |name| {
            Some(ScriptedLink::new(name).with_inbound(vec![imu_line(0), imu_line(1)]))
        });
        let mut driver = SensorDriver::new(
            "imu",
            Box::new(imu::ImuCsv::new()),
            Arc::new(opener),
            cancel.clone(),
        );
        driver.initialize().unwrap();
        cancel.cancel();
        assert!(matches!(driver.next_sample(), Err(DriverError::Cancelled)));
    }
}
