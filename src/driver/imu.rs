//! ESP32 + MPU9250 board streaming comma-separated IMU readings.

use super::Protocol;
use crate::error::{DriverError, FrameError};
use crate::link::{Link, LinkSettings};
use crate::sample::Sample;
use chrono::{DateTime, Utc};
use std::time::Duration;

const FIELD_NAMES: [&str; 7] = [
    "imu_time", "accelX", "accelY", "accelZ", "gyroX", "gyroY", "gyroZ",
];

/// Lines read after a reset before giving up on the board.
const BOOT_LINE_LIMIT: usize = 30;

#[derive(Default)]
pub struct ImuCsv;

impl ImuCsv {
    pub fn new() -> Self {
        Self
    }

    fn parse_values(frame: &[u8]) -> Result<[f64; 7], FrameError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| FrameError::Malformed("non-ascii bytes".to_string()))?
            .trim();
        let parts: Vec<&str> = text.split(',').collect();
        if parts.len() != FIELD_NAMES.len() {
            return Err(FrameError::Malformed(format!(
                "expected {} fields, got {}",
                FIELD_NAMES.len(),
                parts.len()
            )));
        }

        let mut values = [0.0; 7];
        for (slot, raw) in values.iter_mut().zip(&parts) {
            *slot = raw
                .trim()
                .parse()
                .map_err(|_| FrameError::Malformed(format!("non-numeric field {raw:?}")))?;
        }
        Ok(values)
    }
}

impl Protocol for ImuCsv {
    fn discovery_settings(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: 115_200,
            timeout: Duration::from_secs(1),
        }
    }

    /// The board has no identity query: reset it and accept the port once it streams a
    /// well-formed line.
    fn identify(&mut self, link: &mut dyn Link) -> Result<bool, DriverError> {
        link.pulse_reset()?;
        for _ in 0..BOOT_LINE_LIMIT {
            let line = link.read_until(b'\n')?;
            if Self::parse_values(&line).is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn start(&mut self, _link: &mut dyn Link) -> Result<(), DriverError> {
        Ok(())
    }

    fn parse_frame(
        &self,
        device_id: &str,
        frame: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Sample, FrameError> {
        let values = Self::parse_values(frame)?;
        Ok(FIELD_NAMES
            .iter()
            .zip(values)
            .fold(Sample::new(device_id, received_at), |sample, (name, value)| {
                sample.with_float(name, value)
            }))
    }
}
