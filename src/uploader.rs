//! Drains the durable buffer into the line-protocol write endpoint.

use crate::buffer::{Batch, DurableBuffer};
use crate::error::{BufferError, DeliveryError};
use crate::notifier::Notifier;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const ERROR_BODY_LIMIT: usize = 512;

/// Remote sink for newline-joined line-protocol batches.
pub trait Endpoint: Send + Sync {
    fn write(&self, body: String) -> BoxFuture<'_, Result<(), DeliveryError>>;
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

/// InfluxDB v2 `/api/v2/write` client.
pub struct InfluxEndpoint {
    client: Client,
    write_url: Url,
    token: Option<String>,
}

impl InfluxEndpoint {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let mut write_url = Url::parse(&config.url)
            .with_context(|| format!("invalid endpoint url {}", config.url))?
            .join("api/v2/write")
            .context("invalid endpoint url")?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
        })
    }
}

impl Endpoint for InfluxEndpoint {
    fn write(&self, body: String) -> BoxFuture<'_, Result<(), DeliveryError>> {
        Box::pin(async move {
            let mut request = self
                .client
                .post(self.write_url.clone())
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(body);
            if let Some(token) = &self.token {
                request = request.header(AUTHORIZATION, format!("Token {token}"));
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub batch_cap: usize,
    pub min_cycle: Duration,
}

/// Delivery counters shared with the status API.
#[derive(Default)]
pub struct UploadStats {
    delivered_records: AtomicU64,
    delivered_batches: AtomicU64,
    failed_attempts: AtomicU64,
    delivery_failing: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
    quarantined: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSnapshot {
    pub delivered_records: u64,
    pub delivered_batches: u64,
    pub failed_attempts: u64,
    pub delivery_failing: bool,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub quarantined_lanes: Vec<String>,
}

impl UploadStats {
    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            delivered_records: self.delivered_records.load(Ordering::Relaxed),
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            delivery_failing: self.delivery_failing.load(Ordering::Relaxed),
            last_error: lock(&self.last_error).clone(),
            last_success: *lock(&self.last_success),
            quarantined_lanes: lock(&self.quarantined).clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Uploader {
    buffer: DurableBuffer,
    endpoint: Arc<dyn Endpoint>,
    notifier: Arc<dyn Notifier>,
    config: UploaderConfig,
    stats: Arc<UploadStats>,
    delivery_failing: bool,
    quarantined: HashSet<String>,
}

impl Uploader {
    pub fn new(
        buffer: DurableBuffer,
        endpoint: Arc<dyn Endpoint>,
        notifier: Arc<dyn Notifier>,
        config: UploaderConfig,
        stats: Arc<UploadStats>,
    ) -> Self {
        Self {
            buffer,
            endpoint,
            notifier,
            config,
            stats,
            delivery_failing: false,
            quarantined: HashSet::new(),
        }
    }

    /// Polls until cancelled. Cancellation is only observed between batches.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(batch_cap = self.config.batch_cap, "uploader started");
        while !cancel.is_cancelled() {
            let cycle_start = tokio::time::Instant::now();
            let largest = self.poll_cycle(&cancel).await;
            if largest >= self.config.batch_cap {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(cycle_start + self.config.min_cycle) => {}
            }
        }
        tracing::info!("uploader stopped");
        Ok(())
    }

    /// One pass over every lane. Returns the largest batch size seen.
    pub async fn poll_cycle(&mut self, cancel: &CancellationToken) -> usize {
        let mut largest = 0;
        for lane in self.buffer.lanes() {
            if cancel.is_cancelled() {
                break;
            }
            if self.quarantined.contains(&lane) {
                continue;
            }

            let batch = match self.buffer.next_batch(&lane, self.config.batch_cap).await {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(err @ BufferError::CorruptionRecoveryExhausted { .. }) => {
                    self.quarantine(&lane, &err);
                    continue;
                }
                Err(err) => {
                    tracing::warn!(lane = %lane, error = %err, "failed to read buffer");
                    continue;
                }
            };

            largest = largest.max(batch.len());
            if !self.deliver(batch).await {
                // The endpoint is down for every lane; retry on the next cycle.
                break;
            }
        }
        largest
    }

    async fn deliver(&mut self, batch: Batch) -> bool {
        let count = batch.len() as u64;
        if !batch.is_empty() {
            if let Err(err) = self.endpoint.write(batch.body()).await {
                self.record_failure(&batch.lane, &err);
                self.buffer.release(batch);
                return false;
            }
        }

        let lane = batch.lane.clone();
        if let Err(err) = self.buffer.confirm(batch).await {
            // Delivered but not confirmed: the records will be sent again.
            tracing::warn!(lane = %lane, error = %err, "failed to confirm delivered batch");
        }
        self.stats.delivered_records.fetch_add(count, Ordering::Relaxed);
        self.stats.delivered_batches.fetch_add(1, Ordering::Relaxed);
        *lock(&self.stats.last_success) = Some(Utc::now());
        tracing::debug!(lane = %lane, records = count, "batch delivered");

        if self.delivery_failing {
            self.delivery_failing = false;
            self.stats.delivery_failing.store(false, Ordering::Relaxed);
            self.notifier.log_event("Data delivery recovered");
        }
        true
    }

    fn record_failure(&mut self, lane: &str, err: &DeliveryError) {
        self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
        *lock(&self.stats.last_error) = Some(err.to_string());
        tracing::warn!(lane = %lane, error = %err, "batch delivery failed");

        if !self.delivery_failing {
            self.delivery_failing = true;
            self.stats.delivery_failing.store(true, Ordering::Relaxed);
            self.notifier
                .log_event(&format!("Data delivery failing: {err}"));
        }
    }

    fn quarantine(&mut self, lane: &str, err: &BufferError) {
        tracing::error!(lane = %lane, error = %err, "buffer lane quarantined");
        self.quarantined.insert(lane.to_string());
        lock(&self.stats.quarantined).push(lane.to_string());
        self.notifier
            .log_event(&format!("Buffer for {lane} is corrupt and has been skipped: {err}"));
    }
}
