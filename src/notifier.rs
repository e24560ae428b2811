use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operator-facing sink for rare, human-readable events.
pub trait Notifier: Send + Sync {
    fn log_event(&self, message: &str);
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Appends `[<utc>] [<box>] <message>` lines to a local file and mirrors each event to an
/// optional chat webhook. Nothing here ever fails the caller.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

struct EventLogInner {
    box_id: String,
    path: Option<PathBuf>,
    webhook_url: Option<String>,
    client: Client,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(box_id: &str, path: Option<PathBuf>, webhook_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(EventLogInner {
                box_id: box_id.to_string(),
                path,
                webhook_url,
                client,
                write_lock: Mutex::new(()),
            }),
        }
    }
}

impl EventLogInner {
    fn append(&self, text: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let line = format!(
            "[{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            text
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = result {
            tracing::warn!(error = %err, path = %path.display(), "failed to append event log");
        }
    }

    async fn post_webhook(&self, url: &str, text: &str) {
        let response = self
            .client
            .post(url)
            .json(&WebhookPayload { text })
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => self.append(&format!("[{}] webhook error {}", self.box_id, resp.status())),
            Err(err) => self.append(&format!("[{}] webhook error {err}", self.box_id)),
        }
    }
}

impl Notifier for EventLog {
    fn log_event(&self, message: &str) {
        let text = format!("[{}] {}", self.inner.box_id, message);
        tracing::info!(event = %text, "operator event");
        self.inner.append(&text);

        let Some(url) = self.inner.webhook_url.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    inner.post_webhook(&url, &text).await;
                });
            }
            Err(_) => tracing::warn!("no runtime available; webhook skipped"),
        }
    }
}
