//! R.M. Young 86000 ultrasonic anemometer, polled-telegram output.
//!
//! Frames are `<address> <speed> <direction> <status>*<checksum>\r`. The checksum is the XOR
//! of every byte before `*`, written as hex.

use super::Protocol;
use crate::error::{DriverError, FrameError};
use crate::link::{Link, LinkSettings};
use crate::sample::Sample;
use chrono::{DateTime, Utc};
use std::time::Duration;

const DISCOVERY_CHUNK: usize = 128;
const STATUS_OK: &str = "00";
const MIN_FIELDS: usize = 4;

pub struct YoungAnemometer {
    address: String,
}

impl YoungAnemometer {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

/// XOR of every byte preceding the first `*` (the whole input when there is none).
pub fn xor_checksum(frame: &str) -> u8 {
    frame
        .bytes()
        .take_while(|b| *b != b'*')
        .fold(0u8, |acc, b| acc ^ b)
}

/// Converts a meteorological speed/direction pair (degrees) to `(u, v)` components.
pub fn polar_to_cartesian(speed: f64, direction_deg: f64) -> (f64, f64) {
    let radians = direction_deg.to_radians();
    (speed * radians.cos(), speed * radians.sin())
}

impl Protocol for YoungAnemometer {
    fn discovery_settings(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: 9600,
            timeout: Duration::from_millis(200),
        }
    }

    fn identify(&mut self, link: &mut dyn Link) -> Result<bool, DriverError> {
        let chunk = link.read_chunk(DISCOVERY_CHUNK)?;
        // The first piece is usually a partial telegram; the second is the first whole one.
        let Some(line) = chunk.split(|b| *b == b'\r').nth(1) else {
            return Ok(false);
        };
        let line = String::from_utf8_lossy(line);
        Ok(line.split_whitespace().next() == Some(self.address.as_str()))
    }

    fn start(&mut self, link: &mut dyn Link) -> Result<(), DriverError> {
        link.set_timeout(Duration::from_secs(1))?;
        Ok(())
    }

    fn read_frame(&mut self, link: &mut dyn Link) -> std::io::Result<Vec<u8>> {
        link.read_until(b'\r')
    }

    fn parse_frame(
        &self,
        device_id: &str,
        frame: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Sample, FrameError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| FrameError::Malformed("non-ascii bytes".to_string()))?;
        let text = text.strip_suffix('\r').unwrap_or(text);

        let parts: Vec<&str> = text.split(' ').collect();
        let trailer: Vec<&str> = parts[parts.len() - 1].split('*').collect();
        if trailer.len() != 2 {
            return Err(FrameError::Malformed(format!("no checksum trailer in {text:?}")));
        }
        if parts.len() < MIN_FIELDS {
            return Err(FrameError::Malformed(format!(
                "expected at least {MIN_FIELDS} fields, got {}",
                parts.len()
            )));
        }

        let declared = u8::from_str_radix(trailer[1].trim(), 16)
            .map_err(|_| FrameError::Malformed(format!("checksum {:?}", trailer[1])))?;
        let computed = xor_checksum(text);
        if declared != computed {
            return Err(FrameError::Checksum { declared, computed });
        }
        if trailer[0] != STATUS_OK {
            return Err(FrameError::Status(trailer[0].to_string()));
        }

        let speed: f64 = parts[1]
            .trim()
            .parse()
            .map_err(|_| FrameError::Malformed(format!("speed {:?}", parts[1])))?;
        let direction: f64 = parts[2]
            .trim()
            .parse()
            .map_err(|_| FrameError::Malformed(format!("direction {:?}", parts[2])))?;
        let (u, v) = polar_to_cartesian(speed, direction);

        Ok(Sample::new(device_id, received_at)
            .with_float("speed", speed)
            .with_float("direction", direction)
            .with_float("u", u)
            .with_float("v", v))
    }
}
