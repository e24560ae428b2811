//! Transactional local queue with ack/nack semantics.
//!
//! One spool thread owns every file handle. Entries are length + crc32c framed JSON records
//! in segment files (`seg-<stream>-<start>.open` while written, `seg-<stream>-<start>-<end>.seg`
//! once closed). `state.json` keeps the contiguous ack watermark plus any acks above it.
//! In-flight marks live only in memory, so after a crash every unacked entry is pending.

use crate::error::BufferError;
use crate::sample::Sample;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const SEGMENT_MAGIC: &[u8; 8] = b"FFQUEUE1";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_LEN: usize = 64;
const FRAME_HEADER_LEN: u64 = 8;
const MAX_FRAME_LEN: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub dir: PathBuf,
    pub segment_roll_bytes: u64,
    pub segment_roll_duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueStateDisk {
    stream_id: String,
    next_seq: u64,
    acked_seq: u64,
    #[serde(default)]
    acked_above: Vec<u64>,
    open_segment_start_seq: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    seq: u64,
    sample: Sample,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub seq: u64,
    pub sample: Sample,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub stream_id: String,
    pub next_seq: u64,
    pub acked_seq: u64,
    pub pending_entries: u64,
    pub in_flight: usize,
    pub closed_segments: usize,
    pub open_segment_start_seq: u64,
    pub queue_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactionReport {
    pub removed_files: usize,
    pub reclaimed_bytes: u64,
}

#[derive(Debug)]
pub enum QueueCommand {
    Put {
        sample: Sample,
        respond_to: oneshot::Sender<Result<u64, BufferError>>,
    },
    Get {
        max: usize,
        respond_to: oneshot::Sender<Result<Vec<QueueEntry>, BufferError>>,
    },
    Ack {
        seqs: Vec<u64>,
        respond_to: oneshot::Sender<Result<(), BufferError>>,
    },
    Nack {
        seqs: Vec<u64>,
    },
    Compact {
        respond_to: oneshot::Sender<Result<CompactionReport, BufferError>>,
    },
    GetStatus {
        respond_to: oneshot::Sender<QueueStatus>,
    },
}

#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    fn send(&self, cmd: QueueCommand) -> Result<(), BufferError> {
        self.tx.send(cmd).map_err(|_| BufferError::Closed)
    }

    /// Appends a pending entry; returns once it is synced to disk.
    pub async fn put(&self, sample: Sample) -> Result<u64, BufferError> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Put {
            sample,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| BufferError::Closed)?
    }

    /// [`put`](Self::put) for driver threads outside the async runtime.
    pub fn put_blocking(&self, sample: Sample) -> Result<u64, BufferError> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Put {
            sample,
            respond_to: tx,
        })?;
        rx.blocking_recv().map_err(|_| BufferError::Closed)?
    }

    pub async fn get(&self) -> Result<Option<QueueEntry>, BufferError> {
        Ok(self.get_batch(1).await?.into_iter().next())
    }

    /// Oldest pending entries, marked in-flight until acked or nacked.
    pub async fn get_batch(&self, max: usize) -> Result<Vec<QueueEntry>, BufferError> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Get {
            max,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| BufferError::Closed)?
    }

    pub async fn ack(&self, seqs: Vec<u64>) -> Result<(), BufferError> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Ack {
            seqs,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| BufferError::Closed)?
    }

    pub fn nack(&self, seqs: Vec<u64>) {
        let _ = self.send(QueueCommand::Nack { seqs });
    }

    pub async fn compact(&self) -> Result<CompactionReport, BufferError> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Compact { respond_to: tx })?;
        rx.await.map_err(|_| BufferError::Closed)?
    }

    pub async fn status(&self) -> Result<QueueStatus, BufferError> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::GetStatus { respond_to: tx })?;
        rx.await.map_err(|_| BufferError::Closed)
    }
}

/// Opens (or creates) the queue in `config.dir` and hands it to a dedicated thread. The
/// thread exits once every handle is dropped.
pub fn spawn_queue_thread(config: QueueConfig) -> Result<QueueHandle> {
    let mut runtime = QueueRuntime::open(config)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<QueueCommand>();

    std::thread::Builder::new()
        .name("queue-spool".to_string())
        .spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                runtime.handle(cmd);
            }
            runtime.segment.file.sync_data().ok();
            if let Err(err) = runtime.persist_state() {
                tracing::warn!(error = %err, "failed to persist queue state on exit");
            }
        })
        .context("failed to spawn queue thread")?;

    Ok(QueueHandle { tx })
}

struct SegmentWriter {
    path: PathBuf,
    file: fs::File,
    start_seq: u64,
    created_at: Instant,
}

#[derive(Debug, Clone)]
struct ClosedSegment {
    path: PathBuf,
    start_seq: u64,
    end_seq: u64,
    size_bytes: u64,
}

struct ReadCursor {
    start_seq: u64,
    path: PathBuf,
    file: fs::File,
}

struct QueueRuntime {
    config: QueueConfig,
    state_path: PathBuf,
    stream_id: Uuid,
    next_seq: u64,
    acked_seq: u64,
    acked_above: BTreeSet<u64>,
    in_flight: BTreeSet<u64>,
    closed: Vec<ClosedSegment>,
    segment: SegmentWriter,
    cursor: Option<ReadCursor>,
}

impl QueueRuntime {
    fn open(config: QueueConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)
            .with_context(|| format!("failed to create {}", config.dir.display()))?;
        let state_path = config.dir.join("state.json");
        let state = load_or_init_state(&state_path)?;
        let stream_id = Uuid::parse_str(&state.stream_id).context("invalid stream_id")?;

        let mut closed = list_closed_segments(&config.dir, stream_id)?;
        closed.sort_by_key(|seg| seg.start_seq);

        let mut next_seq = state.next_seq.max(1);
        if let Some(last) = closed.last() {
            next_seq = next_seq.max(last.end_seq + 1);
        }

        let segment = match find_open_segment(&config.dir, stream_id, state.open_segment_start_seq)? {
            Some((path, start_seq)) => {
                let mut file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .with_context(|| format!("open {}", path.display()))?;
                let last_seq = recover_truncate_tail(&mut file)?;
                next_seq = next_seq.max(start_seq);
                if let Some(last_seq) = last_seq {
                    next_seq = next_seq.max(last_seq + 1);
                }
                SegmentWriter {
                    path,
                    file,
                    start_seq,
                    created_at: Instant::now(),
                }
            }
            None => create_new_segment(&config.dir, stream_id, next_seq)?,
        };

        let runtime = Self {
            config,
            state_path,
            stream_id,
            next_seq,
            acked_seq: state.acked_seq,
            acked_above: state.acked_above.into_iter().collect(),
            in_flight: BTreeSet::new(),
            closed,
            segment,
            cursor: None,
        };
        runtime.persist_state()?;

        tracing::info!(
            stream_id = %runtime.stream_id,
            next_seq = runtime.next_seq,
            acked_seq = runtime.acked_seq,
            "queue opened"
        );
        Ok(runtime)
    }

    fn handle(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Put { sample, respond_to } => {
                let _ = respond_to.send(self.put(sample));
            }
            QueueCommand::Get { max, respond_to } => {
                let _ = respond_to.send(self.get_batch(max));
            }
            QueueCommand::Ack { seqs, respond_to } => {
                let _ = respond_to.send(self.ack(seqs));
            }
            QueueCommand::Nack { seqs } => self.nack(seqs),
            QueueCommand::Compact { respond_to } => {
                let _ = respond_to.send(self.compact());
            }
            QueueCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    fn put(&mut self, sample: Sample) -> Result<u64, BufferError> {
        let seq = self.next_seq;
        let payload = serde_json::to_vec(&EntryRecord { seq, sample })?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let before = self.segment.file.seek(SeekFrom::End(0))?;
        let written = self
            .segment
            .file
            .write_all(&frame)
            .and_then(|_| self.segment.file.sync_data());
        if let Err(err) = written {
            // Never leave a half frame in front of later records.
            self.segment.file.set_len(before).ok();
            return Err(err.into());
        }
        self.next_seq += 1;

        if self.segment.created_at.elapsed() >= self.config.segment_roll_duration
            || before + frame.len() as u64 >= self.config.segment_roll_bytes
        {
            self.roll_segment()?;
        }
        Ok(seq)
    }

    fn roll_segment(&mut self) -> Result<(), BufferError> {
        let start_seq = self.segment.start_seq;
        let last_seq = self.next_seq - 1;
        if last_seq < start_seq {
            return Ok(());
        }
        self.segment.file.sync_data()?;
        let closed_path = segment_closed_path(&self.config.dir, self.stream_id, start_seq, last_seq);
        fs::rename(&self.segment.path, &closed_path)?;
        let size_bytes = fs::metadata(&closed_path).map(|m| m.len()).unwrap_or(0);
        self.closed.push(ClosedSegment {
            path: closed_path,
            start_seq,
            end_seq: last_seq,
            size_bytes,
        });

        self.segment = create_new_segment(&self.config.dir, self.stream_id, self.next_seq)
            .map_err(|err| BufferError::Io(std::io::Error::other(err.to_string())))?;
        self.persist_state()
    }

    fn is_deliverable(&self, seq: u64) -> bool {
        seq > self.acked_seq && !self.acked_above.contains(&seq) && !self.in_flight.contains(&seq)
    }

    /// Segments in seq order: closed ones, then the open one, as `(start_seq, path)`.
    fn segment_order(&self) -> Vec<(u64, PathBuf)> {
        self.closed
            .iter()
            .map(|seg| (seg.start_seq, seg.path.clone()))
            .chain(std::iter::once((self.segment.start_seq, self.segment.path.clone())))
            .collect()
    }

    fn open_cursor_at(&self, start_seq: u64, path: &Path) -> Result<ReadCursor, BufferError> {
        let mut file = fs::File::open(path)?;
        file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN as u64))?;
        Ok(ReadCursor {
            start_seq,
            path: path.to_path_buf(),
            file,
        })
    }

    fn rewind_cursor(&mut self) -> Result<(), BufferError> {
        let from = self.acked_seq + 1;
        let order = self.segment_order();
        let target = order
            .iter()
            .rev()
            .find(|(start, _)| *start <= from)
            .or_else(|| order.first())
            .cloned();
        self.cursor = match target {
            Some((start, path)) => Some(self.open_cursor_at(start, &path)?),
            None => None,
        };
        Ok(())
    }

    fn get_batch(&mut self, max: usize) -> Result<Vec<QueueEntry>, BufferError> {
        let mut out = Vec::new();
        if max == 0 {
            return Ok(out);
        }
        if self.cursor.is_none() {
            self.rewind_cursor()?;
        }

        while out.len() < max {
            let (cursor_start, frame) = match self.cursor.as_mut() {
                Some(cursor) => (cursor.start_seq, read_next_frame(&mut cursor.file)?),
                None => break,
            };
            match frame {
                Some(payload) => {
                    let record: EntryRecord = match serde_json::from_slice(&payload) {
                        Ok(record) => record,
                        Err(err) => {
                            tracing::warn!(error = %err, "skipping undecodable queue record");
                            continue;
                        }
                    };
                    if self.is_deliverable(record.seq) {
                        self.in_flight.insert(record.seq);
                        out.push(QueueEntry {
                            seq: record.seq,
                            sample: record.sample,
                        });
                    }
                }
                None => {
                    if cursor_start == self.segment.start_seq {
                        break;
                    }
                    if let Some(cursor) = self.cursor.as_mut() {
                        let pos = cursor.file.stream_position()?;
                        let len = cursor.file.metadata()?.len();
                        if pos < len {
                            tracing::warn!(
                                segment = %cursor.path.display(),
                                offset = pos,
                                skipped_bytes = len - pos,
                                "invalid frame in closed segment; skipping rest of segment"
                            );
                        }
                    }
                    let next = self
                        .segment_order()
                        .into_iter()
                        .find(|(start, _)| *start > cursor_start);
                    match next {
                        Some((start, path)) => self.cursor = Some(self.open_cursor_at(start, &path)?),
                        None => break,
                    }
                }
            }
        }
        Ok(out)
    }

    fn ack(&mut self, seqs: Vec<u64>) -> Result<(), BufferError> {
        for seq in seqs {
            self.in_flight.remove(&seq);
            if seq > self.acked_seq && seq < self.next_seq {
                self.acked_above.insert(seq);
            }
        }
        self.advance_acked_seq();
        self.persist_state()
    }

    fn advance_acked_seq(&mut self) {
        loop {
            let next = self.acked_seq.saturating_add(1);
            if !self.acked_above.remove(&next) {
                break;
            }
            self.acked_seq = next;
        }
    }

    fn nack(&mut self, seqs: Vec<u64>) {
        for seq in seqs {
            self.in_flight.remove(&seq);
        }
        self.cursor = None;
    }

    fn compact(&mut self) -> Result<CompactionReport, BufferError> {
        let open_has_records = self.next_seq > self.segment.start_seq;
        if open_has_records && self.next_seq - 1 <= self.acked_seq {
            self.roll_segment()?;
        }

        let mut report = CompactionReport::default();
        let acked_seq = self.acked_seq;
        let mut kept = Vec::with_capacity(self.closed.len());
        for seg in self.closed.drain(..) {
            if seg.end_seq <= acked_seq {
                match fs::remove_file(&seg.path) {
                    Ok(()) => {
                        report.removed_files += 1;
                        report.reclaimed_bytes += seg.size_bytes;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, path = %seg.path.display(), "failed to delete acked segment");
                        kept.push(seg);
                    }
                }
            } else {
                kept.push(seg);
            }
        }
        self.closed = kept;
        Ok(report)
    }

    fn persist_state(&self) -> Result<(), BufferError> {
        let tmp = self.state_path.with_extension("json.tmp");
        let disk = QueueStateDisk {
            stream_id: self.stream_id.to_string(),
            next_seq: self.next_seq,
            acked_seq: self.acked_seq,
            acked_above: self.acked_above.iter().copied().collect(),
            open_segment_start_seq: Some(self.segment.start_seq),
        };
        fs::write(&tmp, serde_json::to_string_pretty(&disk)?)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    fn status(&self) -> QueueStatus {
        let open_bytes = self.segment.file.metadata().map(|m| m.len()).unwrap_or(0);
        let queue_bytes = self
            .closed
            .iter()
            .map(|seg| seg.size_bytes)
            .sum::<u64>()
            .saturating_add(open_bytes);
        let written = self.next_seq.saturating_sub(1);
        QueueStatus {
            stream_id: self.stream_id.to_string(),
            next_seq: self.next_seq,
            acked_seq: self.acked_seq,
            pending_entries: written
                .saturating_sub(self.acked_seq)
                .saturating_sub(self.acked_above.len() as u64),
            in_flight: self.in_flight.len(),
            closed_segments: self.closed.len(),
            open_segment_start_seq: self.segment.start_seq,
            queue_bytes,
        }
    }
}

fn load_or_init_state(state_path: &Path) -> Result<QueueStateDisk> {
    if state_path.exists() {
        let raw = fs::read_to_string(state_path).context("read queue state")?;
        return serde_json::from_str(&raw).context("parse queue state");
    }
    Ok(QueueStateDisk {
        stream_id: Uuid::new_v4().to_string(),
        next_seq: 1,
        acked_seq: 0,
        acked_above: Vec::new(),
        open_segment_start_seq: None,
    })
}

fn segment_open_path(dir: &Path, stream_id: Uuid, start_seq: u64) -> PathBuf {
    dir.join(format!("seg-{}-{}.open", stream_id, start_seq))
}

fn segment_closed_path(dir: &Path, stream_id: Uuid, start_seq: u64, end_seq: u64) -> PathBuf {
    dir.join(format!("seg-{}-{}-{}.seg", stream_id, start_seq, end_seq))
}

fn find_open_segment(
    dir: &Path,
    stream_id: Uuid,
    preferred_start: Option<u64>,
) -> Result<Option<(PathBuf, u64)>> {
    if let Some(start_seq) = preferred_start {
        let path = segment_open_path(dir, stream_id, start_seq);
        if path.exists() {
            return Ok(Some((path, start_seq)));
        }
    }

    let prefix = format!("seg-{}-", stream_id);
    for entry in fs::read_dir(dir).context("read queue dir")? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".open") {
            continue;
        }
        // seg-<uuid>-<start>.open
        let Some(start_seq) = name
            .trim_end_matches(".open")
            .rsplit('-')
            .next()
            .and_then(|v| v.parse().ok())
        else {
            continue;
        };
        return Ok(Some((path, start_seq)));
    }
    Ok(None)
}

fn list_closed_segments(dir: &Path, stream_id: Uuid) -> Result<Vec<ClosedSegment>> {
    let mut out = Vec::new();
    let prefix = format!("seg-{}-", stream_id);
    for entry in fs::read_dir(dir).context("read queue dir")? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".seg") {
            continue;
        }
        let Some((start_seq, end_seq)) = parse_closed_segment_range(name) else {
            continue;
        };
        out.push(ClosedSegment {
            path: path.clone(),
            start_seq,
            end_seq,
            size_bytes: entry.metadata()?.len(),
        });
    }
    Ok(out)
}

fn parse_closed_segment_range(name: &str) -> Option<(u64, u64)> {
    // seg-<uuid>-<start>-<end>.seg
    let mut parts = name.trim_end_matches(".seg").rsplit('-');
    let end = parts.next()?.parse().ok()?;
    let start = parts.next()?.parse().ok()?;
    Some((start, end))
}

fn create_new_segment(dir: &Path, stream_id: Uuid, start_seq: u64) -> Result<SegmentWriter> {
    let path = segment_open_path(dir, stream_id, start_seq);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("create {}", path.display()))?;
    write_segment_header(&mut file, stream_id, start_seq)?;
    file.sync_data().ok();
    Ok(SegmentWriter {
        path,
        file,
        start_seq,
        created_at: Instant::now(),
    })
}

fn write_segment_header(file: &mut fs::File, stream_id: Uuid, start_seq: u64) -> Result<()> {
    let mut header = vec![0u8; SEGMENT_HEADER_LEN];
    header[0..8].copy_from_slice(SEGMENT_MAGIC);
    header[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(SEGMENT_HEADER_LEN as u32).to_le_bytes());
    header[16..32].copy_from_slice(stream_id.as_bytes());
    header[32..40].copy_from_slice(&Utc::now().timestamp_millis().to_le_bytes());
    header[40..48].copy_from_slice(&start_seq.to_le_bytes());
    file.write_all(&header)?;
    Ok(())
}

/// Cuts the open segment back to its last intact frame. Returns the last intact seq.
fn recover_truncate_tail(file: &mut fs::File) -> Result<Option<u64>> {
    let end = file.metadata()?.len();
    if end < SEGMENT_HEADER_LEN as u64 {
        return Err(anyhow!("segment too small"));
    }
    file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN as u64))?;
    let mut pos = SEGMENT_HEADER_LEN as u64;
    let mut last_seq = None;
    while let Some(payload) = read_next_frame(file)? {
        match serde_json::from_slice::<EntryRecord>(&payload) {
            Ok(record) => last_seq = Some(record.seq),
            Err(_) => break,
        }
        pos += FRAME_HEADER_LEN + payload.len() as u64;
    }
    if pos < end {
        tracing::warn!(dropped = end - pos, "truncating torn queue segment tail");
    }
    file.set_len(pos)?;
    file.seek(SeekFrom::End(0))?;
    Ok(last_seq)
}

/// Next intact frame payload. At a clean end or a torn frame the file position is restored
/// and `None` returned.
fn read_next_frame(file: &mut fs::File) -> Result<Option<Vec<u8>>, BufferError> {
    let start = file.stream_position()?;
    let restore = |file: &mut fs::File| -> Result<Option<Vec<u8>>, BufferError> {
        file.seek(SeekFrom::Start(start))?;
        Ok(None)
    };

    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return restore(file),
        Err(err) => return Err(err.into()),
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[0..4]);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&header[4..8]);
    let len = u32::from_le_bytes(len_bytes) as u64;
    let crc = u32::from_le_bytes(crc_bytes);
    if len == 0 || len > MAX_FRAME_LEN {
        return restore(file);
    }

    let mut payload = vec![0u8; len as usize];
    match file.read_exact(&mut payload) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return restore(file),
        Err(err) => return Err(err.into()),
    }
    if crc32c(&payload) != crc {
        return restore(file);
    }
    Ok(Some(payload))
}
