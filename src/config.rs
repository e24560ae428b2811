use crate::buffer::{BufferConfig, BufferStrategy};
use crate::driver::DeviceKind;
use crate::supervisor::SupervisorConfig;
use crate::uploader::{EndpointConfig, UploaderConfig};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub box_id: String,
    pub devices_path: PathBuf,
    pub http_bind: String,

    pub buffer: BufferConfig,
    pub archive_dir: Option<PathBuf>,

    pub endpoint: EndpointConfig,
    pub uploader: UploaderConfig,
    pub supervisor: SupervisorConfig,

    pub event_log: PathBuf,
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let box_id = env_string("FIELD_FORWARDER_BOX_ID", Some(default_box_id()))?;
        if box_id.is_empty() {
            bail!("FIELD_FORWARDER_BOX_ID must not be empty");
        }
        let devices_path = PathBuf::from(env_string(
            "FIELD_FORWARDER_DEVICES_PATH",
            Some("/etc/field-forwarder/devices.json".to_string()),
        )?);
        let http_bind =
            env_string("FIELD_FORWARDER_HTTP_BIND", Some("127.0.0.1:9102".to_string()))?;

        let data_dir = PathBuf::from(env_string(
            "FIELD_FORWARDER_DATA_DIR",
            Some("/var/lib/field-forwarder/buffer".to_string()),
        )?);
        let strategy: BufferStrategy =
            env_string("FIELD_FORWARDER_BUFFER_STRATEGY", Some("hourly".to_string()))?
                .parse()
                .context("invalid FIELD_FORWARDER_BUFFER_STRATEGY")?;
        let retention = match env_optional("FIELD_FORWARDER_RETENTION_HOURS") {
            Some(raw) => {
                let hours = raw
                    .parse::<u64>()
                    .context("invalid FIELD_FORWARDER_RETENTION_HOURS")?;
                Some(Duration::from_secs(hours * 3600))
            }
            None => None,
        };
        let segment_roll_bytes =
            env_u64("FIELD_FORWARDER_SEGMENT_ROLL_BYTES", Some(64 * 1024 * 1024))?;
        let segment_roll_duration =
            Duration::from_secs(env_u64("FIELD_FORWARDER_SEGMENT_ROLL_SECONDS", Some(3600))?);
        let archive_dir = env_optional("FIELD_FORWARDER_ARCHIVE_DIR").map(PathBuf::from);

        let endpoint = EndpointConfig {
            url: env_string("FIELD_FORWARDER_INFLUX_URL", None)?,
            org: env_string("FIELD_FORWARDER_INFLUX_ORG", Some("field".to_string()))?,
            bucket: env_string("FIELD_FORWARDER_INFLUX_BUCKET", Some("field".to_string()))?,
            token: env_secret("FIELD_FORWARDER_INFLUX_TOKEN")?,
            request_timeout: Duration::from_secs(env_u64(
                "FIELD_FORWARDER_REQUEST_TIMEOUT_SECS",
                Some(30),
            )?),
        };

        let batch_cap = env_u64("FIELD_FORWARDER_BATCH_CAP", Some(600))? as usize;
        if batch_cap == 0 {
            bail!("FIELD_FORWARDER_BATCH_CAP must be at least 1");
        }
        let uploader = UploaderConfig {
            batch_cap,
            min_cycle: Duration::from_millis(env_u64("FIELD_FORWARDER_MIN_CYCLE_MS", Some(1000))?),
        };

        let supervisor = SupervisorConfig {
            poll_interval: Duration::from_secs(env_u64(
                "FIELD_FORWARDER_POLL_INTERVAL_SECS",
                Some(5),
            )?),
            failure_threshold: env_u64("FIELD_FORWARDER_FAILURE_THRESHOLD", Some(8))? as u32,
            failure_window: Duration::from_secs(env_u64(
                "FIELD_FORWARDER_FAILURE_WINDOW_SECS",
                Some(3600),
            )?),
            compact_interval: Duration::from_secs(env_u64(
                "FIELD_FORWARDER_COMPACT_INTERVAL_SECS",
                Some(600),
            )?),
        };

        let event_log = env_optional("FIELD_FORWARDER_EVENT_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("events.log"));
        let webhook_url = env_secret("FIELD_FORWARDER_WEBHOOK_URL")?;

        Ok(Self {
            buffer: BufferConfig {
                strategy,
                data_dir,
                measurement: box_id.clone(),
                retention,
                segment_roll_bytes,
                segment_roll_duration,
            },
            box_id,
            devices_path,
            http_bind,
            archive_dir,
            endpoint,
            uploader,
            supervisor,
            event_log,
            webhook_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub id: String,
    /// Candidate ports; empty means every port the OS enumerates.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,
    #[serde(default = "default_aa_cutoff")]
    pub aa_cutoff_hz: u32,
    #[serde(default = "default_true")]
    pub upload: bool,
    #[serde(default)]
    pub log_locally: bool,
}

fn default_sample_rate() -> u32 {
    20
}

fn default_aa_cutoff() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    devices: Vec<DeviceConfig>,
}

pub fn load_devices(path: &Path) -> Result<Vec<DeviceConfig>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read device list {}", path.display()))?;
    parse_devices(&raw).with_context(|| format!("invalid device list {}", path.display()))
}

pub fn parse_devices(raw: &str) -> Result<Vec<DeviceConfig>> {
    let file: DeviceFile = serde_json::from_str(raw).context("failed to parse device JSON")?;
    if file.devices.is_empty() {
        bail!("no devices configured");
    }

    let mut seen = HashSet::new();
    for device in &file.devices {
        let id = device.id.trim();
        if id.is_empty() {
            bail!("device id must not be empty");
        }
        if id.contains(['/', '\\']) || id == "." || id == ".." || id == crate::buffer::QUEUE_LANE {
            bail!("device id {id:?} is not usable as a directory name");
        }
        if !seen.insert(id.to_string()) {
            bail!("duplicate device id {id:?}");
        }
        if device.kind == DeviceKind::Barometer {
            if device.sample_rate_hz == 0 {
                bail!("device {id}: sample_rate_hz must be positive");
            }
            if device.sample_rate_hz <= 2 * device.aa_cutoff_hz {
                bail!(
                    "device {id}: sample_rate_hz {} must exceed twice aa_cutoff_hz {}",
                    device.sample_rate_hz,
                    device.aa_cutoff_hz
                );
            }
        }
        if device.kind == DeviceKind::AnalogAnemometer {
            if device.ports.is_empty() {
                bail!("device {id}: analog_anemometer needs its ADC channel listed in ports");
            }
            if device.sample_rate_hz == 0 {
                bail!("device {id}: sample_rate_hz must be positive");
            }
        }
    }
    Ok(file.devices)
}

fn default_box_id() -> String {
    hostname().unwrap_or_else(|| "field-box".to_string())
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// `KEY` directly, or the contents of the file named by `KEY_FILE`.
fn env_secret(key: &str) -> Result<Option<String>> {
    if let Some(value) = env_optional(key) {
        return Ok(Some(value));
    }
    let file_key = format!("{key}_FILE");
    match env_optional(&file_key) {
        Some(path) => {
            let value = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {file_key} ({path})"))?;
            let value = value.trim().to_string();
            Ok((!value.is_empty()).then_some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_with_defaults() {
        let devices = parse_devices(
            r#"{"devices": [
                {"type": "barometer", "id": "123456", "sample_rate_hz": 40, "aa_cutoff_hz": 10},
                {"type": "young_anemometer", "id": "wind", "ports": ["/dev/ttyUSB1"], "log_locally": true},
                {"type": "imu_csv", "id": "imu", "upload": false}
            ]}"#,
        )
        .unwrap();

        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].kind, DeviceKind::Barometer);
        assert_eq!(devices[0].sample_rate_hz, 40);
        assert!(devices[0].ports.is_empty());
        assert_eq!(devices[1].ports, vec!["/dev/ttyUSB1".to_string()]);
        assert_eq!(devices[1].sample_rate_hz, 20);
        assert_eq!(devices[1].aa_cutoff_hz, 5);
        assert!(devices[1].upload && devices[1].log_locally);
        assert!(!devices[2].upload);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = parse_devices(
            r#"{"devices": [{"type": "imu_csv", "id": "a"}, {"type": "imu_csv", "id": "a"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_aliasing_barometer_rate() {
        let err = parse_devices(
            r#"{"devices": [{"type": "barometer", "id": "1", "sample_rate_hz": 10, "aa_cutoff_hz": 5}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn rejects_unknown_device_type_and_path_ids() {
        assert!(parse_devices(r#"{"devices": [{"type": "adc", "id": "x"}]}"#).is_err());
        assert!(parse_devices(r#"{"devices": [{"type": "imu_csv", "id": "../x"}]}"#).is_err());
        assert!(parse_devices(r#"{"devices": []}"#).is_err());
    }

    #[test]
    fn analog_anemometer_requires_a_channel() {
        let err = parse_devices(r#"{"devices": [{"type": "analog_anemometer", "id": "cup"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("ADC channel"));

        let devices = parse_devices(
            r#"{"devices": [{"type": "analog_anemometer", "id": "cup", "ports": ["/sys/bus/iio/devices/iio:device0/in_voltage3_raw"], "sample_rate_hz": 10}]}"#,
        )
        .unwrap();
        assert_eq!(devices[0].kind, DeviceKind::AnalogAnemometer);
        assert_eq!(devices[0].sample_rate_hz, 10);
    }

    #[test]
    fn reads_secret_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "s3cret\n").unwrap();
        let key = "FIELD_FORWARDER_TEST_SECRET";
        env::set_var(format!("{key}_FILE"), &path);
        assert_eq!(env_secret(key).unwrap().as_deref(), Some("s3cret"));
        env::remove_var(format!("{key}_FILE"));
        assert_eq!(env_secret(key).unwrap(), None);
    }
}
