//! Physical link abstraction.
//!
//! A [`Transport`] moves fixed-size frames between host and device and
//! nothing more — it never interprets payload semantics. The production
//! implementation is [`SerialTransport`]; tests and hardware-free rigs use
//! [`SimDevice`](crate::sim::SimDevice).
//!
//! Failure modes are structured: a busy port ([`VelodromeError::Busy`]), a
//! missing device ([`VelodromeError::NotFound`]) and an unplugged/broken
//! link ([`VelodromeError::Transport`]) are distinct so that connection
//! logic can retry the transient ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serial2::SerialPort;
use tracing::{debug, info, warn};

use crate::packet::{FRAME_LEN, RawFrame};
use crate::{Result, VelodromeError};

/// How long a single blocking serial read waits before re-checking the
/// caller's deadline.
const READ_POLL: Duration = Duration::from_millis(25);

/// A bidirectional link carrying raw protocol frames.
///
/// Implementations must be safe to drive from one task at a time; callers
/// (the device session) serialize access externally.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Open the link. Must be idempotent: opening an already-open
    /// transport is a no-op.
    async fn open(&mut self) -> Result<()>;

    /// Close the link, releasing the underlying resource.
    async fn close(&mut self) -> Result<()>;

    /// Send one frame.
    async fn send(&mut self, frame: &RawFrame) -> Result<()>;

    /// Receive one frame, waiting at most `timeout`.
    ///
    /// Returns [`VelodromeError::NoReply`] when the window elapses without
    /// a complete frame.
    async fn recv(&mut self, timeout: Duration) -> Result<RawFrame>;

    fn is_open(&self) -> bool;

    /// Human-readable identifier of the link (port path, etc.).
    fn description(&self) -> String;
}

/// Serial-port transport for the device.
///
/// Frames are fixed 65-byte records sent back-to-back; reads therefore
/// accumulate exactly [`FRAME_LEN`] bytes per frame. Blocking serial calls
/// run on the tokio blocking pool.
pub struct SerialTransport {
    path: PathBuf,
    baud: u32,
    port: Option<Arc<SerialPort>>,
}

impl SerialTransport {
    /// Default baud rate of the device's serial bridge.
    pub const DEFAULT_BAUD: u32 = 115_200;

    pub fn new(path: impl AsRef<Path>, baud: u32) -> Self {
        Self { path: path.as_ref().to_path_buf(), baud, port: None }
    }

    /// Enumerate serial ports that may host a device.
    pub fn available_ports() -> Result<Vec<PathBuf>> {
        Ok(SerialPort::available_ports()?)
    }

    /// Pick the first available serial port, retrying on a fixed interval
    /// until one shows up. Each attempt is logged.
    pub async fn autoconnect(interval: Duration) -> Result<Self> {
        loop {
            let ports = Self::available_ports()?;
            match ports.first() {
                Some(first) => {
                    if ports.len() > 1 {
                        warn!(count = ports.len(), "multiple serial ports found, using the first");
                    }
                    info!(port = %first.display(), "selected serial port");
                    return Ok(Self::new(first, Self::DEFAULT_BAUD));
                }
                None => {
                    warn!(retry_in = ?interval, "no serial device found, retrying");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    fn map_io(&self, err: std::io::Error) -> VelodromeError {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => VelodromeError::NotFound,
            ErrorKind::PermissionDenied | ErrorKind::AddrInUse => {
                VelodromeError::busy(self.path.display().to_string())
            }
            _ => VelodromeError::transport_with_source(
                format!("serial I/O on {}", self.path.display()),
                Box::new(err),
            ),
        }
    }

    fn open_port(&self) -> Result<&Arc<SerialPort>> {
        self.port
            .as_ref()
            .ok_or(VelodromeError::NotReady { state: "disconnected" })
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let baud = self.baud;
        let opened = tokio::task::spawn_blocking(move || -> std::io::Result<SerialPort> {
            let mut port = SerialPort::open(&path, baud)?;
            port.set_read_timeout(READ_POLL)?;
            Ok(port)
        })
        .await
        .map_err(|e| VelodromeError::transport(format!("blocking open task failed: {e}")))?
        .map_err(|e| self.map_io(e))?;

        debug!(port = %self.path.display(), baud = self.baud, "serial port opened");
        self.port = Some(Arc::new(opened));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.path.display(), "serial port closed");
        }
        Ok(())
    }

    async fn send(&mut self, frame: &RawFrame) -> Result<()> {
        let port = Arc::clone(self.open_port()?);
        let frame = *frame;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut written = 0;
            while written < frame.len() {
                written += port.write(&frame[written..])?;
            }
            Ok(())
        })
        .await
        .map_err(|e| VelodromeError::transport(format!("blocking write task failed: {e}")))?
        .map_err(|e| {
            VelodromeError::transport_with_source(
                format!("serial write on {}", path.display()),
                Box::new(e),
            )
        })
    }

    async fn recv(&mut self, timeout: Duration) -> Result<RawFrame> {
        let port = Arc::clone(self.open_port()?);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<RawFrame> {
            let deadline = Instant::now() + timeout;
            let mut frame = [0u8; FRAME_LEN];
            let mut filled = 0;
            while filled < FRAME_LEN {
                if Instant::now() >= deadline {
                    return Err(VelodromeError::NoReply { after: timeout });
                }
                match port.read(&mut frame[filled..]) {
                    Ok(0) => {
                        return Err(VelodromeError::transport(format!(
                            "serial port {} closed by peer",
                            path.display()
                        )));
                    }
                    Ok(n) => filled += n,
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        ) => {}
                    Err(e) => {
                        return Err(VelodromeError::transport_with_source(
                            format!("serial read on {}", path.display()),
                            Box::new(e),
                        ));
                    }
                }
            }
            Ok(frame)
        })
        .await
        .map_err(|e| VelodromeError::transport(format!("blocking read task failed: {e}")))?
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn description(&self) -> String {
        format!("serial:{}", self.path.display())
    }
}
