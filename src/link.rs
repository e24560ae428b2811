//! Blocking byte links to instruments.
//!
//! Drivers only ever see [`Link`] and [`LinkOpener`]. Serial ports and ADC channels are
//! implemented here; tests substitute scripted links.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub timeout: Duration,
}

/// One exclusively-owned connection to a device. Every read is bounded by the link timeout.
pub trait Link: Send {
    fn port_name(&self) -> &str;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Reads through `terminator` (inclusive). On timeout returns whatever arrived, which may
    /// be empty.
    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>>;

    /// Reads up to `max` bytes, stopping early on timeout.
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>>;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Toggles DTR to reset boards that wire it to their reset line.
    fn pulse_reset(&mut self) -> io::Result<()>;
}

pub trait LinkOpener: Send + Sync {
    fn candidates(&self) -> io::Result<Vec<String>>;

    fn open(&self, port: &str, settings: &LinkSettings) -> io::Result<Box<dyn Link>>;
}

pub struct SerialLink {
    name: String,
    port: Box<dyn SerialPort>,
    timeout: Duration,
    pending: Vec<u8>,
}

impl SerialLink {
    pub fn open(path: &str, settings: &LinkSettings) -> io::Result<Self> {
        let port = serialport::new(path, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout)
            .open()?;

        tracing::debug!(port = path, baud = settings.baud_rate, "opened serial port");

        Ok(Self {
            name: path.to_string(),
            port,
            timeout: settings.timeout,
            pending: Vec::new(),
        })
    }

    /// One read attempt into `pending`; `Ok(0)` on a port timeout.
    fn fill(&mut self) -> io::Result<usize> {
        let mut buf = [0u8; 256];
        match self.port.read(&mut buf) {
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl Link for SerialLink {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(idx) = self.pending.iter().position(|b| *b == terminator) {
                return Ok(self.pending.drain(..=idx).collect());
            }
            if Instant::now() >= deadline {
                return Ok(std::mem::take(&mut self.pending));
            }
            self.fill()?;
        }
    }

    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        while self.pending.len() < max && Instant::now() < deadline {
            self.fill()?;
        }
        let take = self.pending.len().min(max);
        Ok(self.pending.drain(..take).collect())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        self.port.write_data_terminal_ready(false)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.write_data_terminal_ready(true)?;
        self.pending.clear();
        Ok(())
    }
}

/// Opens serial ports for one device. An empty port list probes every port the OS reports.
#[derive(Debug, Clone, Default)]
pub struct SerialOpener {
    ports: Vec<String>,
}

impl SerialOpener {
    pub fn new(ports: Vec<String>) -> Self {
        Self { ports }
    }
}

impl LinkOpener for SerialOpener {
    fn candidates(&self) -> io::Result<Vec<String>> {
        if !self.ports.is_empty() {
            return Ok(self.ports.clone());
        }
        let mut ports: Vec<String> = serialport::available_ports()?
            .into_iter()
            .map(|info| info.port_name)
            .collect();
        ports.sort();
        Ok(ports)
    }

    fn open(&self, port: &str, settings: &LinkSettings) -> io::Result<Box<dyn Link>> {
        Ok(Box::new(SerialLink::open(port, settings)?))
    }
}

/// One-shot analog conversions.
pub trait RawSource: Send {
    fn name(&self) -> &str;

    fn read_raw(&mut self) -> io::Result<i64>;
}

/// A Linux IIO channel such as `/sys/bus/iio/devices/iio:device0/in_voltage3_raw`. Every
/// read of the attribute triggers a conversion.
pub struct IioChannel {
    name: String,
    path: PathBuf,
}

impl IioChannel {
    pub fn open(path: &str) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} is not a channel attribute"),
            ));
        }
        Ok(Self {
            name: path.to_string(),
            path: PathBuf::from(path),
        })
    }
}

impl RawSource for IioChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_raw(&mut self) -> io::Result<i64> {
        let text = fs::read_to_string(&self.path)?;
        text.trim().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: unreadable count {:?}", self.name, text.trim()),
            )
        })
    }
}

/// Presents a [`RawSource`] as a line link: each read performs one conversion and yields
/// `<count>\n`.
pub struct RawSourceLink {
    source: Box<dyn RawSource>,
}

impl RawSourceLink {
    pub fn new(source: Box<dyn RawSource>) -> Self {
        Self { source }
    }

    fn convert(&mut self) -> io::Result<Vec<u8>> {
        Ok(format!("{}\n", self.source.read_raw()?).into_bytes())
    }
}

impl Link for RawSourceLink {
    fn port_name(&self) -> &str {
        self.source.name()
    }

    fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "analog channels take no commands",
        ))
    }

    fn read_until(&mut self, _terminator: u8) -> io::Result<Vec<u8>> {
        self.convert()
    }

    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut line = self.convert()?;
        line.truncate(max);
        Ok(line)
    }

    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens the configured ADC channels. There is no enumeration: channels must be listed.
#[derive(Debug, Clone, Default)]
pub struct RawSourceOpener {
    channels: Vec<String>,
}

impl RawSourceOpener {
    pub fn new(channels: Vec<String>) -> Self {
        Self { channels }
    }
}

impl LinkOpener for RawSourceOpener {
    fn candidates(&self) -> io::Result<Vec<String>> {
        Ok(self.channels.clone())
    }

    fn open(&self, port: &str, _settings: &LinkSettings) -> io::Result<Box<dyn Link>> {
        let channel = IioChannel::open(port)?;
        tracing::debug!(channel = port, "opened adc channel");
        Ok(Box::new(RawSourceLink::new(Box::new(channel))))
    }
}
