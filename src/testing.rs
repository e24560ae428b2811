//! Scripted stand-ins for hardware, the endpoint and the notifier.

use crate::driver::anemometer::xor_checksum;
use crate::error::DeliveryError;
use crate::link::{Link, LinkOpener, LinkSettings};
use crate::notifier::Notifier;
use crate::uploader::Endpoint;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type Responder = Box<dyn FnMut(&str) -> Vec<Vec<u8>> + Send>;

/// Link fed from a queue of reads. Each `read_*` call pops one entry; an empty queue reads
/// as a timeout, optionally parking until `hold` is cancelled.
pub struct ScriptedLink {
    name: String,
    inbound: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    written: Arc<Mutex<Vec<String>>>,
    resets: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    hold: Option<CancellationToken>,
    cancel_on_read: Option<(usize, CancellationToken)>,
}

impl ScriptedLink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inbound: VecDeque::new(),
            responder: None,
            written: Arc::new(Mutex::new(Vec::new())),
            resets: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
            hold: None,
            cancel_on_read: None,
        }
    }

    pub fn with_inbound(mut self, reads: Vec<Vec<u8>>) -> Self {
        self.inbound.extend(reads);
        self
    }

    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn hold_until(mut self, cancel: CancellationToken) -> Self {
        self.hold = Some(cancel);
        self
    }

    /// Cancels `cancel` as the `nth` read (1-based) is served.
    pub fn cancel_on_read(mut self, nth: usize, cancel: CancellationToken) -> Self {
        self.cancel_on_read = Some((nth, cancel));
        self
    }

    pub fn reads(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }

    pub fn written(&self) -> Arc<Mutex<Vec<String>>> {
        self.written.clone()
    }

    pub fn resets(&self) -> Arc<AtomicUsize> {
        self.resets.clone()
    }

    fn next_read(&mut self) -> Vec<u8> {
        let served = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((nth, cancel)) = &self.cancel_on_read {
            if served == *nth {
                cancel.cancel();
            }
        }
        if let Some(next) = self.inbound.pop_front() {
            return next;
        }
        if let Some(hold) = &self.hold {
            while !hold.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        Vec::new()
    }
}

impl Link for ScriptedLink {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(bytes).to_string();
        if let Some(responder) = self.responder.as_mut() {
            self.inbound.extend(responder(text.trim_end()));
        }
        self.written.lock().unwrap().push(text);
        Ok(())
    }

    fn read_until(&mut self, _terminator: u8) -> io::Result<Vec<u8>> {
        Ok(self.next_read())
    }

    fn read_chunk(&mut self, _max: usize) -> io::Result<Vec<u8>> {
        Ok(self.next_read())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type LinkMaker = Box<dyn Fn(&str) -> Option<ScriptedLink> + Send + Sync>;

pub struct ScriptedOpener {
    ports: Vec<String>,
    make: LinkMaker,
}

impl ScriptedOpener {
    pub fn new(
        ports: Vec<String>,
        make: impl Fn(&str) -> Option<ScriptedLink> + Send + Sync + 'static,
    ) -> Self {
        Self {
            ports,
            make: Box::new(make),
        }
    }

    pub fn single(
        port: &str,
        make: impl Fn(&str) -> Option<ScriptedLink> + Send + Sync + 'static,
    ) -> Self {
        Self::new(vec![port.to_string()], make)
    }
}

impl LinkOpener for ScriptedOpener {
    fn candidates(&self) -> io::Result<Vec<String>> {
        Ok(self.ports.clone())
    }

    fn open(&self, port: &str, _settings: &LinkSettings) -> io::Result<Box<dyn Link>> {
        match (self.make)(port) {
            Some(link) => Ok(Box::new(link)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, port.to_string())),
        }
    }
}

/// Telegram with a correct checksum and trailing CR.
pub fn young_frame(body: &str) -> String {
    format!("{body}*{:02X}\r", xor_checksum(body))
}

/// Answers barometer commands the way a healthy unit does. `P4` releases `samples`.
pub fn barometer_responder(
    serial: &str,
    rate: u32,
    aa_cutoff: u32,
    samples: Vec<String>,
) -> Responder {
    let serial = serial.to_string();
    let mut samples: VecDeque<String> = samples.into();
    let mut rate_setting = format!("TH={rate},P4;>OK");
    let mut aa_setting = format!("IA={aa_cutoff}");
    let fixed = [
        "VR=Q1.03", "XM=1", "UN=2", "MD=0", "XN=0", "TS=1", "GE=1", "TJ=0", "TF=.00", "TP=0",
        "GT=1", "GD=0",
    ];

    Box::new(move |command: &str| {
        let reply = |text: &str| format!("*0001{text}\r\n").into_bytes();
        let Some(body) = command.strip_prefix("*0100") else {
            return Vec::new();
        };
        if let Some(write) = body.strip_prefix("EW*0100") {
            if write.starts_with("TH=") {
                rate_setting = write.to_string();
            } else if write.starts_with("IA=") {
                aa_setting = write.to_string();
            }
            return vec![reply(write)];
        }
        match body {
            "MN" => vec![reply("MN=6000-16B-IS")],
            "SN" => vec![reply(&format!("SN={serial}"))],
            "TH" => vec![reply(&rate_setting)],
            "IA" => vec![reply(&aa_setting)],
            "P4" => samples
                .drain(..)
                .map(|line| format!("{line}\r\n").into_bytes())
                .collect(),
            other => fixed
                .iter()
                .find(|setting| setting.starts_with(other))
                .map(|setting| vec![reply(setting)])
                .unwrap_or_default(),
        }
    })
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn log_event(&self, message: &str) {
        self.events.lock().unwrap().push(message.to_string());
    }
}

/// Endpoint that records every accepted body and fails the next `fail_next` writes.
#[derive(Default)]
pub struct ScriptedEndpoint {
    bodies: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl ScriptedEndpoint {
    pub fn failing(times: usize) -> Self {
        let endpoint = Self::default();
        endpoint.fail_next.store(times, Ordering::SeqCst);
        endpoint
    }

    pub fn fail_next(&self, times: usize) {
        self.fail_next.store(times, Ordering::SeqCst);
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.bodies()
            .iter()
            .flat_map(|body| body.lines().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Endpoint for ScriptedEndpoint {
    fn write(&self, body: String) -> BoxFuture<'_, Result<(), DeliveryError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryError::Transport("connection refused".to_string()));
            }
            self.bodies.lock().unwrap().push(body);
            Ok(())
        })
    }
}
