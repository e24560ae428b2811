//! Durable local buffer between drivers and the uploader.
//!
//! Two interchangeable strategies sit behind [`DurableBuffer`]: per-device hourly logs with a
//! byte-offset tailer, or a single ack/nack queue. Producers get a blocking
//! [`BufferWriter`]; the uploader pulls [`Batch`]es per lane and confirms or releases them.

pub mod hourly;
pub mod queue;

use crate::error::BufferError;
use crate::sample::{encode_line, Sample};
use anyhow::{anyhow, Context, Result};
use hourly::{HourlyBuffer, HourlyWriter, Pointer, PointerStatus};
use queue::{CompactionReport, QueueConfig, QueueHandle, QueueStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Lane name used by the queue strategy, which drains every device through one queue.
pub const QUEUE_LANE: &str = "queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    Hourly,
    Queue,
}

impl std::str::FromStr for BufferStrategy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "queue" => Ok(Self::Queue),
            other => Err(anyhow!("unknown buffer strategy {other:?} (expected hourly|queue)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub strategy: BufferStrategy,
    pub data_dir: PathBuf,
    pub measurement: String,
    pub retention: Option<Duration>,
    pub segment_roll_bytes: u64,
    pub segment_roll_duration: Duration,
}

#[derive(Clone)]
pub enum DurableBuffer {
    Hourly(Arc<HourlyBuffer>),
    Queue {
        handle: QueueHandle,
        measurement: String,
        dir: PathBuf,
    },
}

#[derive(Debug)]
enum Receipt {
    Pointer(Pointer),
    Seqs(Vec<u64>),
}

/// Records handed to the uploader. Dropping a batch without confirming it leaves the data
/// pending, but queue batches should be released so they are redelivered promptly.
#[derive(Debug)]
pub struct Batch {
    pub lane: String,
    pub records: Vec<String>,
    receipt: Receipt,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newline-joined line-protocol body.
    pub fn body(&self) -> String {
        self.records.join("\n")
    }
}

pub enum BufferWriter {
    Hourly(HourlyWriter),
    Queue {
        handle: QueueHandle,
        measurement: String,
    },
}

impl BufferWriter {
    /// Blocking append; returns `false` when the sample had nothing encodable.
    pub fn append(&mut self, sample: &Sample) -> Result<bool, BufferError> {
        match self {
            BufferWriter::Hourly(writer) => writer.append(sample),
            BufferWriter::Queue {
                handle,
                measurement,
            } => {
                if encode_line(measurement, sample).is_none() {
                    return Ok(false);
                }
                handle.put_blocking(sample.clone())?;
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BufferStatus {
    Hourly {
        pointers: Vec<PointerStatus>,
        free_bytes: Option<u64>,
    },
    Queue {
        queue: QueueStatus,
        free_bytes: Option<u64>,
    },
}

impl DurableBuffer {
    /// Opens the configured strategy. `devices` are the lanes of the hourly strategy.
    pub fn open(config: &BufferConfig, devices: Vec<String>) -> Result<Self> {
        match config.strategy {
            BufferStrategy::Hourly => {
                let buffer = HourlyBuffer::open(
                    &config.data_dir,
                    &config.measurement,
                    devices,
                    config.retention,
                )
                .with_context(|| format!("open hourly buffer in {}", config.data_dir.display()))?;
                Ok(DurableBuffer::Hourly(Arc::new(buffer)))
            }
            BufferStrategy::Queue => {
                let dir = config.data_dir.join("queue");
                let handle = queue::spawn_queue_thread(QueueConfig {
                    dir: dir.clone(),
                    segment_roll_bytes: config.segment_roll_bytes,
                    segment_roll_duration: config.segment_roll_duration,
                })?;
                Ok(DurableBuffer::Queue {
                    handle,
                    measurement: config.measurement.clone(),
                    dir,
                })
            }
        }
    }

    pub fn writer(&self, device_id: &str) -> BufferWriter {
        match self {
            DurableBuffer::Hourly(buffer) => BufferWriter::Hourly(buffer.writer(device_id)),
            DurableBuffer::Queue {
                handle,
                measurement,
                ..
            } => BufferWriter::Queue {
                handle: handle.clone(),
                measurement: measurement.clone(),
            },
        }
    }

    pub fn lanes(&self) -> Vec<String> {
        match self {
            DurableBuffer::Hourly(buffer) => buffer.devices().to_vec(),
            DurableBuffer::Queue { .. } => vec![QUEUE_LANE.to_string()],
        }
    }

    /// Next batch for `lane`, at most `max` records. Repeated calls without a confirm
    /// return the same records.
    pub async fn next_batch(&self, lane: &str, max: usize) -> Result<Option<Batch>, BufferError> {
        match self {
            DurableBuffer::Hourly(buffer) => {
                let buffer = buffer.clone();
                let device = lane.to_string();
                let read = tokio::task::spawn_blocking(move || buffer.read_batch(&device, max))
                    .await
                    .map_err(|err| BufferError::Io(std::io::Error::other(err.to_string())))??;
                Ok(read.map(|(records, pointer)| Batch {
                    lane: lane.to_string(),
                    records,
                    receipt: Receipt::Pointer(pointer),
                }))
            }
            DurableBuffer::Queue {
                handle,
                measurement,
                ..
            } => {
                let entries = handle.get_batch(max).await?;
                if entries.is_empty() {
                    return Ok(None);
                }
                let seqs = entries.iter().map(|entry| entry.seq).collect();
                let records = entries
                    .iter()
                    .filter_map(|entry| encode_line(measurement, &entry.sample))
                    .collect();
                Ok(Some(Batch {
                    lane: lane.to_string(),
                    records,
                    receipt: Receipt::Seqs(seqs),
                }))
            }
        }
    }

    /// Marks a delivered batch as done (advance pointer / ack entries).
    pub async fn confirm(&self, batch: Batch) -> Result<(), BufferError> {
        match (self, batch.receipt) {
            (DurableBuffer::Hourly(buffer), Receipt::Pointer(pointer)) => {
                let buffer = buffer.clone();
                tokio::task::spawn_blocking(move || buffer.set_pointer(&pointer))
                    .await
                    .map_err(|err| BufferError::Io(std::io::Error::other(err.to_string())))?
            }
            (DurableBuffer::Queue { handle, .. }, Receipt::Seqs(seqs)) => handle.ack(seqs).await,
            _ => Ok(()),
        }
    }

    /// Returns an undelivered batch to pending.
    pub fn release(&self, batch: Batch) {
        if let (DurableBuffer::Queue { handle, .. }, Receipt::Seqs(seqs)) = (self, batch.receipt) {
            handle.nack(seqs);
        }
    }

    pub async fn compact(&self) -> Result<CompactionReport, BufferError> {
        match self {
            DurableBuffer::Hourly(buffer) => {
                let buffer = buffer.clone();
                let removed = tokio::task::spawn_blocking(move || buffer.compact())
                    .await
                    .map_err(|err| BufferError::Io(std::io::Error::other(err.to_string())))??;
                Ok(CompactionReport {
                    removed_files: removed,
                    reclaimed_bytes: 0,
                })
            }
            DurableBuffer::Queue { handle, .. } => handle.compact().await,
        }
    }

    pub async fn status(&self) -> Result<BufferStatus, BufferError> {
        match self {
            DurableBuffer::Hourly(buffer) => Ok(BufferStatus::Hourly {
                pointers: buffer.status(),
                free_bytes: free_bytes(buffer.data_dir()),
            }),
            DurableBuffer::Queue { handle, dir, .. } => {
                let queue = handle.status().await?;
                Ok(BufferStatus::Queue {
                    queue,
                    free_bytes: free_bytes(dir),
                })
            }
        }
    }
}

/// Free bytes on the filesystem holding `path`, for unprivileged writers.
pub fn free_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    let cpath = CString::new(path.as_os_str().to_string_lossy().as_bytes().to_vec()).ok()?;

    let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut out as *mut libc::statvfs) };
    if rc != 0 {
        return None;
    }
    let block = if out.f_frsize > 0 {
        out.f_frsize as u64
    } else {
        out.f_bsize as u64
    };
    Some((out.f_bavail as u64).saturating_mul(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn config(dir: &Path, strategy: BufferStrategy) -> BufferConfig {
        BufferConfig {
            strategy,
            data_dir: dir.to_path_buf(),
            measurement: "box".to_string(),
            retention: None,
            segment_roll_bytes: 64 * 1024 * 1024,
            segment_roll_duration: Duration::from_secs(3600),
        }
    }

    async fn exercise(strategy: BufferStrategy) {
        let dir = TempDir::new().unwrap();
        let buffer = DurableBuffer::open(&config(dir.path(), strategy), vec!["dev".into()]).unwrap();
        let lane = buffer.lanes().remove(0);

        let producer = buffer.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = producer.writer("dev");
            for n in 0..3 {
                let sample = Sample::new("dev", Utc::now()).with_float("value", f64::from(n));
                assert!(writer.append(&sample).unwrap());
            }
            let empty = Sample::new("dev", Utc::now()).with_float("value", f64::NAN);
            assert!(!writer.append(&empty).unwrap());
        })
        .await
        .unwrap();

        let batch = buffer.next_batch(&lane, 2).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.records[0].starts_with("box,id=dev value=0 "));
        buffer.release(batch);

        let again = buffer.next_batch(&lane, 2).await.unwrap().unwrap();
        assert!(again.records[0].starts_with("box,id=dev value=0 "));
        buffer.confirm(again).await.unwrap();

        let rest = buffer.next_batch(&lane, 10).await.unwrap().unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest.records[0].starts_with("box,id=dev value=2 "));
        buffer.confirm(rest).await.unwrap();

        assert!(buffer.next_batch(&lane, 10).await.unwrap().is_none());
        assert!(buffer.status().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hourly_strategy_round_trip() {
        exercise(BufferStrategy::Hourly).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queue_strategy_round_trip() {
        exercise(BufferStrategy::Queue).await;
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!("Hourly".parse::<BufferStrategy>().unwrap(), BufferStrategy::Hourly);
        assert_eq!(" queue ".parse::<BufferStrategy>().unwrap(), BufferStrategy::Queue);
        assert!("kafka".parse::<BufferStrategy>().is_err());
    }
}
