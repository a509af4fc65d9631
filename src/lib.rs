//! Closed-loop behavioral VR toolkit for rotary-encoder laboratory devices.
//!
//! Velodrome talks to a treadmill-style encoder device over a small framed
//! binary protocol and drives a 1-D virtual-track experiment whose position
//! follows the animal's running, with behavioral rules triggering device
//! outputs (air puffs, LEDs) in real time.
//!
//! # Features
//!
//! - **Typed protocol**: framed request/reply with sequence-number
//!   correlation, timeouts, and a typed parameter registry
//! - **Resilient sessions**: auto-reconnect on busy devices, bootloader
//!   recovery, graceful degradation on dropped replies
//! - **Behavioral engine**: zones, dwell/velocity/speed rules and
//!   teleport/pause/burst events, evaluated at a fixed tick rate
//! - **Hardware-free testing**: a simulated device behind the same
//!   transport seam
//!
//! # Quick start
//!
//! ```rust,no_run
//! use velodrome::Velodrome;
//!
//! #[tokio::main]
//! async fn main() -> velodrome::Result<()> {
//!     let device = Velodrome::connect().await?;
//!     let latency = device.ping().await?;
//!     println!("firmware {} responded in {latency:?}",
//!         device.firmware_info().expect("probed at connect"));
//!     Ok(())
//! }
//! ```
//!
//! ## Playing a level
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use velodrome::Velodrome;
//! use velodrome::maze::{EventSpec, Level, MazeConfig, MazeSession, MemorySink, Rule};
//!
//! #[tokio::main]
//! async fn main() -> velodrome::Result<()> {
//!     let mut level = Level::new("training-1");
//!     level.add_zone(1200.0, "neutral");
//!     level.add_zone(800.0, "aversive");
//!     level.add_event(
//!         "escape",
//!         EventSpec::RandomTeleport { zone_kinds: vec!["neutral".into()] },
//!     );
//!     level.add_rule(Rule::zone("escape", "aversive", Duration::from_secs(2)))?;
//!
//!     let device = Velodrome::connect().await?;
//!     let mut session =
//!         MazeSession::new(device, level, MazeConfig::default(), MemorySink::new())?;
//!     session.run(&CancellationToken::new()).await
//! }
//! ```

// Protocol stack, leaves first
mod error;
pub mod packet;
pub mod params;
pub mod transport;

// Device session and the simulated device behind the same seam
pub mod device;
pub mod sim;

// The virtual maze: levels, rules, events, session loop
pub mod maze;

// Core exports
pub use error::{NackCode, Result, VelodromeError};
pub use packet::{Command, FRAME_LEN, HEADER_LEN, MAX_PAYLOAD, Packet, RawFrame};
pub use params::{ParamInfo, ParamType, Registry, VELOCITY_SIGN, Value};
pub use transport::{SerialTransport, Transport};

// Device session exports
pub use device::{
    DeviceConfig, DeviceMode, DeviceSession, FirmwareInfo, LinkState, MazeReading, ProductInfo,
    RecorderReading,
};
pub use sim::{SimDevice, SimHandle};

// Maze exports for the common path; the full surface lives in [`maze`]
pub use maze::{Level, LogEntry, LogSink, MazeConfig, MazeSession};

use std::time::Duration;

/// Unified entry point for device connections.
///
/// # Examples
///
/// ## Autodiscovered hardware
/// ```rust,no_run
/// use velodrome::Velodrome;
///
/// # #[tokio::main]
/// # async fn main() -> velodrome::Result<()> {
/// let device = Velodrome::connect().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Any transport (here: the simulator)
/// ```rust
/// use velodrome::{SimDevice, Velodrome};
///
/// # #[tokio::main]
/// # async fn main() -> velodrome::Result<()> {
/// let device = Velodrome::attach(SimDevice::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Velodrome;

impl Velodrome {
    /// Interval between discovery/connect retries while no device answers.
    const RETRY_INTERVAL: Duration = Duration::from_secs(5);

    /// Autodiscover a serial device and bring a session to ready.
    ///
    /// Waits for a device to appear and retries busy ports on a fixed
    /// interval, so it is safe to call before the hardware is plugged in.
    pub async fn connect() -> Result<DeviceSession<SerialTransport>> {
        let transport = SerialTransport::autoconnect(Self::RETRY_INTERVAL).await?;
        Self::attach(transport).await
    }

    /// Bring a session to ready over a caller-supplied transport.
    pub async fn attach<T: Transport>(transport: T) -> Result<DeviceSession<T>> {
        let mut session = DeviceSession::new(transport, DeviceConfig::default());
        session.connect().await?;
        Ok(session)
    }
}
