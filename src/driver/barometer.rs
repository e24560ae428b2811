//! Paroscientific 6000-16B-IS digital barometer.
//!
//! ASCII command/response framing: commands go out as `*0100<CC>[=<value>]\r\n` and replies
//! come back with a five byte `*0001` header. Once `P4` is issued the device streams
//! `*0001V,<device time>,<pressure>` lines until any other command arrives.

use super::Protocol;
use crate::error::{DriverError, FrameError};
use crate::link::{Link, LinkSettings};
use crate::sample::Sample;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;

const MODEL: &str = "6000-16B-IS";
const COMMAND_PREFIX: &str = "*0100";
const WRITE_ENABLE: &str = "EW";
const SAMPLE_MARKER: &str = "*0001V";
const REPLY_HEADER_LEN: usize = 5;
const SAMPLE_FIELD_COUNT: usize = 3;
const DEVICE_TIME_FORMAT: &str = "%m/%d/%y %H:%M:%S%.f";
const CLOCK_FORMAT: &str = "%m/%d/%y %H:%M:%S";
const BARO_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const SERIAL_NUMBER_ATTEMPTS: usize = 5;
const REPLY_READ_ATTEMPTS: usize = 5;
/// Sample lines still in flight from a streaming device that a command read may discard.
const STREAM_DRAIN_LIMIT: usize = 64;

/// Settings the device must already hold; they are only read back, never written.
const FIXED_SETTINGS: [&str; 12] = [
    "VR=Q1.03", "XM=1", "UN=2", "MD=0", "XN=0", "TS=1", "GE=1", "TJ=0", "TF=.00", "TP=0",
    "GT=1", "GD=0",
];

pub struct Barometer {
    serial_number: String,
    sample_rate_hz: u32,
    aa_cutoff_hz: u32,
    identified: bool,
}

impl Barometer {
    pub fn new(serial_number: &str, sample_rate_hz: u32, aa_cutoff_hz: u32) -> Self {
        Self {
            serial_number: serial_number.to_string(),
            sample_rate_hz: sample_rate_hz.max(1),
            aa_cutoff_hz,
            identified: false,
        }
    }

    fn writable_settings(&self) -> [String; 2] {
        [
            format!("TH={},P4;>OK", self.sample_rate_hz),
            format!("IA={}", self.aa_cutoff_hz),
        ]
    }

    fn sample_timeout(&self) -> Duration {
        Duration::from_secs_f64(1.5 / f64::from(self.sample_rate_hz))
    }

    /// Sends one command and returns the trimmed reply. Before the device is identified a
    /// single empty read ends the wait so silent ports are skipped quickly. Streamed sample
    /// lines ahead of the reply are discarded and do not count as attempts.
    fn command(&self, link: &mut dyn Link, code: &str) -> std::io::Result<String> {
        link.write_all(format!("{COMMAND_PREFIX}{code}\r\n").as_bytes())?;
        let attempts = if self.identified { REPLY_READ_ATTEMPTS } else { 1 };
        let mut timeouts = 0;
        let mut drained = 0;
        while timeouts < attempts {
            let raw = link.read_until(b'\n')?;
            if raw.is_empty() {
                timeouts += 1;
                continue;
            }
            if raw.starts_with(SAMPLE_MARKER.as_bytes()) && drained < STREAM_DRAIN_LIMIT {
                drained += 1;
                continue;
            }
            return Ok(trim_reply(&raw));
        }
        Ok(String::new())
    }

    fn misconfigured(&self, setting: &str, reply: String) -> DriverError {
        DriverError::DeviceMisconfigured {
            device_id: self.serial_number.clone(),
            setting: setting.to_string(),
            reply,
        }
    }
}

fn trim_reply(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);
    text.get(REPLY_HEADER_LEN..).unwrap_or_default().to_string()
}

impl Protocol for Barometer {
    fn discovery_settings(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: 115_200,
            timeout: Duration::from_millis(200),
        }
    }

    fn identify(&mut self, link: &mut dyn Link) -> Result<bool, DriverError> {
        self.identified = false;

        // A device left in continuous mode stops on the first command; those replies are noise.
        self.command(link, "SN")?;
        self.command(link, "SN")?;

        let model = self.command(link, "MN")?;
        if !model.contains(MODEL) {
            return Ok(false);
        }

        for _ in 0..SERIAL_NUMBER_ATTEMPTS {
            let reply = self.command(link, "SN")?;
            let serial = reply.get(3..).unwrap_or_default();
            if !serial.is_empty() && serial.chars().all(|c| c.is_ascii_digit()) {
                self.identified = serial == self.serial_number;
                return Ok(self.identified);
            }
        }
        Ok(false)
    }

    fn configure(&mut self, link: &mut dyn Link) -> Result<(), DriverError> {
        for setting in FIXED_SETTINGS {
            let reply = self.command(link, &setting[..2])?;
            if reply != setting {
                return Err(self.misconfigured(setting, reply));
            }
        }

        for setting in self.writable_settings() {
            let reply = self.command(link, &setting[..2])?;
            if reply == setting {
                continue;
            }
            tracing::info!(device = %self.serial_number, setting = %setting, current = %reply, "writing barometer setting");
            let reply = self.command(link, &format!("{WRITE_ENABLE}{COMMAND_PREFIX}{setting}"))?;
            if reply != setting {
                return Err(self.misconfigured(&setting, reply));
            }
        }
        Ok(())
    }

    fn start(&mut self, link: &mut dyn Link) -> Result<(), DriverError> {
        let clock = Utc::now().format(CLOCK_FORMAT).to_string();
        let reply = self.command(link, &format!("{WRITE_ENABLE}{COMMAND_PREFIX}GR={clock}"))?;

        let expected_date = clock.split(' ').next().unwrap_or_default();
        let echoed_date = reply
            .split_once('=')
            .and_then(|(_, value)| value.split(' ').next())
            .unwrap_or_default();
        if echoed_date != expected_date {
            return Err(self.misconfigured("GR", reply));
        }

        link.set_timeout(self.sample_timeout())?;
        link.write_all(format!("{COMMAND_PREFIX}P4\r\n").as_bytes())?;
        Ok(())
    }

    fn parse_frame(
        &self,
        device_id: &str,
        frame: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Sample, FrameError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| FrameError::Malformed("non-ascii bytes".to_string()))?
            .trim();
        let parts: Vec<&str> = text.split(',').collect();
        if parts[0] != SAMPLE_MARKER {
            return Err(FrameError::Malformed(format!("unexpected line {text:?}")));
        }
        if parts.len() != SAMPLE_FIELD_COUNT {
            return Err(FrameError::Malformed(format!(
                "expected {SAMPLE_FIELD_COUNT} fields, got {}",
                parts.len()
            )));
        }

        let device_time = NaiveDateTime::parse_from_str(parts[1].trim(), DEVICE_TIME_FORMAT)
            .map_err(|err| FrameError::Malformed(format!("device time {:?}: {err}", parts[1])))?;
        let value: f64 = parts[2]
            .trim()
            .parse()
            .map_err(|_| FrameError::Malformed(format!("pressure {:?}", parts[2])))?;

        Ok(Sample::new(device_id, received_at)
            .with_float("value", value)
            .with_text("baro_time", device_time.format(BARO_TIME_FORMAT).to_string()))
    }

    fn stop(&mut self, link: &mut dyn Link) {
        if let Err(err) = self.command(link, "SN") {
            tracing::debug!(device = %self.serial_number, error = %err, "stop command failed");
        }
    }
}
