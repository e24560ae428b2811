mod archive;
mod buffer;
mod config;
mod driver;
mod error;
mod http;
mod link;
mod notifier;
mod sample;
mod supervisor;
mod uploader;

#[cfg(test)]
mod testing;

use crate::buffer::DurableBuffer;
use crate::config::Config;
use crate::driver::DeviceDriverFactory;
use crate::notifier::EventLog;
use crate::supervisor::{ShutdownHandle, ShutdownReason, Supervisor, SupervisorParts};
use crate::uploader::{InfluxEndpoint, UploadStats};
use anyhow::{bail, Context, Result};
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,field_forwarder=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn wait_for_signal(shutdown: ShutdownHandle) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => shutdown.request("SIGINT"),
        _ = terminate => shutdown.request("SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing()?;

    let devices = config::load_devices(&config.devices_path)?;
    std::fs::create_dir_all(&config.buffer.data_dir).with_context(|| {
        format!("failed to create data dir {}", config.buffer.data_dir.display())
    })?;

    let notifier = Arc::new(EventLog::new(
        &config.box_id,
        Some(config.event_log.clone()),
        config.webhook_url.clone(),
    ));
    let lanes = devices
        .iter()
        .filter(|device| device.upload)
        .map(|device| device.id.clone())
        .collect();
    let buffer = DurableBuffer::open(&config.buffer, lanes)?;
    let endpoint = Arc::new(InfluxEndpoint::new(&config.endpoint)?);
    let upload_stats = Arc::new(UploadStats::default());

    tracing::info!(
        box_id = %config.box_id,
        devices = devices.len(),
        strategy = ?config.buffer.strategy,
        "field-forwarder starting"
    );

    let supervisor = Supervisor::new(SupervisorParts {
        box_id: config.box_id.clone(),
        devices,
        factory: Arc::new(DeviceDriverFactory),
        buffer: buffer.clone(),
        endpoint,
        notifier,
        upload_stats: upload_stats.clone(),
        uploader: config.uploader.clone(),
        archive_dir: config.archive_dir.clone(),
        config: config.supervisor.clone(),
    });

    let app = http::router(http::HttpState {
        box_id: config.box_id.clone(),
        buffer,
        uploads: upload_stats,
        tasks: supervisor.status_board(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "field-forwarder HTTP listening");
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "status API exited");
        }
    });

    let signal_handle = tokio::spawn(wait_for_signal(supervisor.shutdown_handle()));
    let reason = supervisor.run().await?;
    signal_handle.abort();
    http_handle.abort();

    if reason == ShutdownReason::FailureBudgetExhausted {
        bail!("stopped after exhausting the task failure budget");
    }
    tracing::info!("field-forwarder stopped");
    Ok(())
}
