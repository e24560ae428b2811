//! Adafruit 1733 cup anemometer read through an ADC channel.
//!
//! The sensor outputs 0.4 V at rest and 2.0 V at 32.4 m/s. The ADC reports signed 32-bit
//! counts against a 5.08 V reference; each read yields one count as a `<count>\n` line.

use super::Protocol;
use crate::error::{DriverError, FrameError};
use crate::link::{Link, LinkSettings};
use crate::sample::Sample;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

const REFERENCE_VOLTS: f64 = 5.08;
const FULL_SCALE_COUNTS: f64 = 0x7fff_ffff as f64;
const MIN_VOLTS: f64 = 0.4;
const MAX_VOLTS: f64 = 2.0;
const MIN_WIND: f64 = 0.0;
const MAX_WIND: f64 = 32.4;

pub struct AnalogAnemometer {
    period: Duration,
    next_due: Option<Instant>,
}

impl AnalogAnemometer {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / f64::from(sample_rate_hz.max(1))),
            next_due: None,
        }
    }
}

pub fn counts_to_volts(raw: i64) -> f64 {
    raw as f64 * (REFERENCE_VOLTS / FULL_SCALE_COUNTS)
}

/// Linear map of the sensor's output range onto its wind range. Readings outside the
/// voltage range extrapolate rather than clamp; `raw` is recorded alongside.
pub fn wind_speed(volts: f64) -> f64 {
    (volts - MIN_VOLTS) / (MAX_VOLTS - MIN_VOLTS) * (MAX_WIND - MIN_WIND)
}

fn parse_count(frame: &[u8]) -> Result<i64, FrameError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| FrameError::Malformed("non-ascii bytes".to_string()))?
        .trim();
    text.parse()
        .map_err(|_| FrameError::Malformed(format!("adc count {text:?}")))
}

impl Protocol for AnalogAnemometer {
    fn discovery_settings(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: 0,
            timeout: Duration::from_secs(1),
        }
    }

    /// A channel that yields a count is the configured one; ADC inputs carry no identity.
    fn identify(&mut self, link: &mut dyn Link) -> Result<bool, DriverError> {
        let line = link.read_until(b'\n')?;
        Ok(parse_count(&line).is_ok())
    }

    fn start(&mut self, _link: &mut dyn Link) -> Result<(), DriverError> {
        self.next_due = None;
        Ok(())
    }

    /// Conversions are on demand, so reads are paced to the configured rate.
    fn read_frame(&mut self, link: &mut dyn Link) -> std::io::Result<Vec<u8>> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        let base = self.next_due.map_or(now, |due| due.max(now));
        self.next_due = Some(base + self.period);
        link.read_until(b'\n')
    }

    fn parse_frame(
        &self,
        device_id: &str,
        frame: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Sample, FrameError> {
        let raw = parse_count(frame)?;
        Ok(Sample::new(device_id, received_at)
            .with_float("raw", raw as f64)
            .with_float("value", wind_speed(counts_to_volts(raw))))
    }
}
