//! Append-only hourly line-protocol logs per device, drained by a byte-offset tailer.
//!
//! Layout: `<data_dir>/<device_id>/<YYYY-MM-DD-HH>` holds one record per `\n`-terminated
//! line; `<data_dir>/pointers.json` holds each device's `{bucket, offset}`. A pointer only
//! ever sits at the start of a complete record or at the clean end of its file.

use crate::error::BufferError;
use crate::sample::{encode_line, record_marker, Sample};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

pub const HOUR_FORMAT: &str = "%Y-%m-%d-%H";
/// Furthest the tailer walks backward looking for a record start.
pub const MAX_RECOVERY_SCAN: u64 = 64 * 1024;
/// Late appends for an hour are still picked up this long after the hour ends.
const ROLL_GRACE: Duration = Duration::from_secs(60);
const POINTER_FILE: &str = "pointers.json";
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub device_id: String,
    pub bucket: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PointerDisk {
    bucket: String,
    offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointerStatus {
    pub device_id: String,
    pub bucket: String,
    pub offset: u64,
    pub bucket_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TailBatch {
    pub records: Vec<String>,
    pub next_offset: u64,
}

pub fn bucket_for(timestamp: DateTime<Utc>) -> String {
    timestamp.format(HOUR_FORMAT).to_string()
}

fn parse_bucket(bucket: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&format!("{bucket}:00:00"), "%Y-%m-%d-%H:%M:%S").ok()
}

fn hour_floor(now: DateTime<Utc>) -> NaiveDateTime {
    let naive = now.naive_utc();
    naive
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(naive)
}

/// Appends samples for one device. Torn tails left by a crash are cut off when a file is
/// (re)opened so the next record starts on a fresh line.
pub struct HourlyWriter {
    dir: PathBuf,
    measurement: String,
    current: Option<(String, File)>,
    last_sync: Instant,
}

impl HourlyWriter {
    fn new(dir: PathBuf, measurement: &str) -> Self {
        Self {
            dir,
            measurement: measurement.to_string(),
            current: None,
            last_sync: Instant::now(),
        }
    }

    /// Returns `false` when the sample had nothing encodable and was skipped.
    pub fn append(&mut self, sample: &Sample) -> Result<bool, BufferError> {
        let Some(line) = encode_line(&self.measurement, sample) else {
            return Ok(false);
        };
        let bucket = bucket_for(sample.timestamp());

        let stale = self.current.as_ref().map_or(true, |(current, _)| *current != bucket);
        if stale {
            if let Some((_, file)) = self.current.take() {
                file.sync_data().ok();
            }
            fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(&bucket);
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            truncate_torn_tail(&mut file)?;
            self.current = Some((bucket, file));
        }
        let Some((_, file)) = self.current.as_mut() else {
            return Ok(false);
        };

        file.write_all(format!("{line}\n").as_bytes())?;
        if self.last_sync.elapsed() >= SYNC_INTERVAL {
            file.sync_data()?;
            self.last_sync = Instant::now();
        }
        Ok(true)
    }
}

impl Drop for HourlyWriter {
    fn drop(&mut self) {
        if let Some((_, file)) = &self.current {
            file.sync_data().ok();
        }
    }
}

fn truncate_torn_tail(file: &mut File) -> Result<(), BufferError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let scan = len.min(MAX_RECOVERY_SCAN);
    let mut tail = vec![0u8; scan as usize];
    file.seek(SeekFrom::Start(len - scan))?;
    file.read_exact(&mut tail)?;
    if tail.last() == Some(&b'\n') {
        return Ok(());
    }
    let keep = match tail.iter().rposition(|b| *b == b'\n') {
        Some(idx) => len - scan + idx as u64 + 1,
        None if scan == len => 0,
        None => return Ok(()),
    };
    tracing::warn!(dropped = len - keep, "truncating torn record at end of hourly log");
    file.set_len(keep)?;
    Ok(())
}

fn is_record_start(window: &[u8], base: u64, pos: u64, marker: &[u8]) -> bool {
    if pos == 0 {
        return true;
    }
    let idx = (pos - base) as usize;
    if idx == 0 || window[idx - 1] != b'\n' {
        return false;
    }
    let rest = &window[idx..];
    // A record still being written is a valid start even before its marker is complete.
    if rest.len() < marker.len() {
        marker.starts_with(rest)
    } else {
        rest.starts_with(marker)
    }
}

/// Finds the record start at or before `offset`, walking backward at most
/// [`MAX_RECOVERY_SCAN`] bytes.
fn recover_record_start(
    file: &mut File,
    path: &Path,
    offset: u64,
    len: u64,
    marker: &[u8],
) -> Result<u64, BufferError> {
    let offset = offset.min(len);
    if offset == 0 {
        return Ok(0);
    }

    let floor = offset.saturating_sub(MAX_RECOVERY_SCAN);
    let base = floor.saturating_sub(1);
    let end = (offset + marker.len() as u64).min(len);
    let mut window = vec![0u8; (end - base) as usize];
    file.seek(SeekFrom::Start(base))?;
    file.read_exact(&mut window)?;

    if offset == len && window.last() == Some(&b'\n') {
        return Ok(offset);
    }
    let mut pos = offset;
    loop {
        if is_record_start(&window, base, pos, marker) {
            if pos != offset {
                tracing::warn!(path = %path.display(), from = offset, to = pos, "pointer realigned to record start");
            }
            return Ok(pos);
        }
        if pos == floor {
            break;
        }
        pos -= 1;
    }

    Err(BufferError::CorruptionRecoveryExhausted {
        path: path.to_path_buf(),
        offset,
        scanned: offset - floor,
    })
}

/// Reads up to `max` complete records starting at `offset`. Lines without the record marker
/// are skipped but still consumed, so `next_offset` always lands on a record start or EOF.
pub fn tail_file(path: &Path, offset: u64, marker: &str, max: usize) -> Result<TailBatch, BufferError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = recover_record_start(&mut file, path, offset, len, marker.as_bytes())?;

    file.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut pos = start;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        match std::str::from_utf8(&line[..n - 1]) {
            Ok(text) if text.starts_with(marker) => {
                if records.len() >= max {
                    break;
                }
                records.push(text.to_string());
            }
            _ => tracing::warn!(path = %path.display(), offset = pos, "skipping unrecognised line"),
        }
        pos += n as u64;
    }

    Ok(TailBatch {
        records,
        next_offset: pos,
    })
}

struct PointerStore {
    path: PathBuf,
    entries: BTreeMap<String, PointerDisk>,
}

impl PointerStore {
    fn load(path: PathBuf) -> Self {
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "failed to parse pointer file; starting fresh");
                BTreeMap::new()
            }),
            _ => BTreeMap::new(),
        };
        Self { path, entries }
    }

    fn persist(&self) -> Result<(), BufferError> {
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(&self.entries)?.as_bytes())?;
        file.sync_data()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

pub struct HourlyBuffer {
    data_dir: PathBuf,
    measurement: String,
    marker: String,
    devices: Vec<String>,
    retention: Option<Duration>,
    pointers: Mutex<PointerStore>,
}

impl HourlyBuffer {
    pub fn open(
        data_dir: &Path,
        measurement: &str,
        devices: Vec<String>,
        retention: Option<Duration>,
    ) -> Result<Self, BufferError> {
        fs::create_dir_all(data_dir)?;
        let mut store = PointerStore::load(data_dir.join(POINTER_FILE));

        let now_bucket = bucket_for(Utc::now());
        for device in &devices {
            if store.entries.contains_key(device) {
                continue;
            }
            let bucket = list_buckets(&data_dir.join(device))?
                .into_iter()
                .next()
                .unwrap_or_else(|| now_bucket.clone());
            tracing::info!(device = %device, bucket = %bucket, "initialised pointer");
            store.entries.insert(device.clone(), PointerDisk { bucket, offset: 0 });
        }
        store.persist()?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            measurement: measurement.to_string(),
            marker: record_marker(measurement),
            devices,
            retention,
            pointers: Mutex::new(store),
        })
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn writer(&self, device_id: &str) -> HourlyWriter {
        HourlyWriter::new(self.data_dir.join(device_id), &self.measurement)
    }

    fn store(&self) -> std::sync::MutexGuard<'_, PointerStore> {
        self.pointers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pointer(&self, device_id: &str) -> Option<Pointer> {
        self.store().entries.get(device_id).map(|disk| Pointer {
            device_id: device_id.to_string(),
            bucket: disk.bucket.clone(),
            offset: disk.offset,
        })
    }

    pub fn set_pointer(&self, pointer: &Pointer) -> Result<(), BufferError> {
        let mut store = self.store();
        store.entries.insert(
            pointer.device_id.clone(),
            PointerDisk {
                bucket: pointer.bucket.clone(),
                offset: pointer.offset,
            },
        );
        store.persist()
    }

    /// Next batch for `device_id` together with the pointer that confirms it. With no new
    /// data the pointer may roll forward to the next hour instead.
    pub fn read_batch(&self, device_id: &str, max: usize) -> Result<Option<(Vec<String>, Pointer)>, BufferError> {
        self.read_batch_at(device_id, max, Utc::now())
    }

    fn read_batch_at(
        &self,
        device_id: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<(Vec<String>, Pointer)>, BufferError> {
        let Some(pointer) = self.pointer(device_id) else {
            return Ok(None);
        };
        let path = self.data_dir.join(device_id).join(&pointer.bucket);

        if path.exists() {
            let batch = tail_file(&path, pointer.offset, &self.marker, max)?;
            let advanced = Pointer {
                offset: batch.next_offset,
                ..pointer.clone()
            };
            if !batch.records.is_empty() {
                return Ok(Some((batch.records, advanced)));
            }
            if advanced.offset != pointer.offset {
                self.set_pointer(&advanced)?;
            }
        }

        self.roll_forward(&pointer, now)?;
        Ok(None)
    }

    fn roll_forward(&self, pointer: &Pointer, now: DateTime<Utc>) -> Result<(), BufferError> {
        let Some(current) = parse_bucket(&pointer.bucket) else {
            tracing::warn!(device = %pointer.device_id, bucket = %pointer.bucket, "unparseable bucket; resetting to current hour");
            return self.set_pointer(&Pointer {
                device_id: pointer.device_id.clone(),
                bucket: bucket_for(now),
                offset: 0,
            });
        };
        let grace = ChronoDuration::from_std(ROLL_GRACE).unwrap_or_else(|_| ChronoDuration::zero());
        if current + ChronoDuration::hours(1) + grace > now.naive_utc() {
            return Ok(());
        }

        let now_hour = hour_floor(now);
        let next = list_buckets(&self.data_dir.join(&pointer.device_id))?
            .into_iter()
            .filter_map(|bucket| parse_bucket(&bucket).map(|at| (at, bucket)))
            .find(|(at, _)| *at > current && *at <= now_hour)
            .map(|(_, bucket)| bucket)
            .unwrap_or_else(|| now_hour.format(HOUR_FORMAT).to_string());

        tracing::debug!(device = %pointer.device_id, from = %pointer.bucket, to = %next, "rolling pointer forward");
        self.set_pointer(&Pointer {
            device_id: pointer.device_id.clone(),
            bucket: next,
            offset: 0,
        })
    }

    /// Deletes hourly files behind each pointer once they are older than the retention.
    pub fn compact(&self) -> Result<usize, BufferError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let mut removed = 0;
        for device in &self.devices {
            let Some(pointer) = self.pointer(device) else {
                continue;
            };
            let dir = self.data_dir.join(device);
            for bucket in list_buckets(&dir)? {
                if bucket >= pointer.bucket {
                    break;
                }
                let path = dir.join(&bucket);
                let age = fs::metadata(&path)?
                    .modified()
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or_default();
                if age >= retention {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> Vec<PointerStatus> {
        self.devices
            .iter()
            .filter_map(|device| self.pointer(device))
            .map(|pointer| {
                let bucket_bytes = fs::metadata(self.data_dir.join(&pointer.device_id).join(&pointer.bucket))
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                PointerStatus {
                    device_id: pointer.device_id,
                    bucket: pointer.bucket,
                    offset: pointer.offset,
                    bucket_bytes,
                }
            })
            .collect()
    }
}

/// Hourly bucket names in `dir`, oldest first.
fn list_buckets(dir: &Path) -> Result<Vec<String>, BufferError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut buckets = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if entry.path().is_file() && parse_bucket(&name).is_some() {
            buckets.push(name);
        }
    }
    buckets.sort();
    Ok(buckets)
}
