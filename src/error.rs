use std::path::PathBuf;

/// A single frame that could not be turned into a sample. Absorbed by the driver's
/// frame-failure counter; never fatal on its own.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("checksum mismatch: declared {declared:#04x}, computed {computed:#04x}")]
    Checksum { declared: u8, computed: u8 },

    #[error("device reported status {0}")]
    Status(String),

    #[error("no frame before link timeout")]
    Timeout,
}

/// Errors that end a driver instance. The supervisor rebuilds the driver from
/// `discovering` when it sees one of these.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("device {device_id} not found on {probed} candidate port(s)")]
    DeviceNotFound { device_id: String, probed: usize },

    #[error("device {device_id} misconfigured: {setting} (device replied {reply:?})")]
    DeviceMisconfigured {
        device_id: String,
        setting: String,
        reply: String,
    },

    #[error("device {device_id} faulted after {failures} bad frames")]
    Faulted { device_id: String, failures: u32 },

    #[error("driver for {0} is not sampling")]
    NotSampling(String),

    #[error("driver cancelled")]
    Cancelled,

    #[error("link I/O error: {0}")]
    Link(#[from] std::io::Error),
}

/// Endpoint could not confirm a batch. Always transient from the uploader's point of view.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("endpoint rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error(
        "no valid record start within {scanned} bytes before offset {offset} in {}",
        path.display()
    )]
    CorruptionRecoveryExhausted {
        path: PathBuf,
        offset: u64,
        scanned: u64,
    },

    #[error("buffer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("buffer spool thread stopped")]
    Closed,
}
