//! Device session: the protocol state machine.
//!
//! A [`DeviceSession`] owns a [`Transport`] and turns the raw framed link
//! into typed operations. The session walks
//! `Disconnected → Connecting → Probing → Ready(Application)`; a device
//! found in bootloader mode is reset and re-probed before it is usable.
//!
//! # Request correlation
//!
//! Each request carries a wrapping sequence number (msn) and the session's
//! random address pair. [`request`](Wire::request) sends, then receives in
//! a loop, discarding any frame that does not match the outstanding request
//! (wrong address pair or msn) until the matching reply arrives or the
//! reply window elapses. One request is in flight at a time: the transport
//! sits behind a lock held for the full send-and-await of a single request
//! and released between requests, so foreground reads, background bursts
//! and pollers interleave at request granularity without stealing each
//! other's replies.
//!
//! # Background bursts
//!
//! [`start_burst`](DeviceSession::start_burst) runs a periodic on/off
//! toggle of a digital output as a cancellable task. Starting a burst on a
//! port that is already bursting replaces the running task; stopping joins
//! the task and leaves the port low before returning.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::packet::{Command, Packet};
use crate::params::{Registry, Value};
use crate::transport::Transport;
use crate::{NackCode, Result, VelodromeError};

/// Operating mode reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Normal firmware; all operations available.
    Application,
    /// In-application-programming mode; only reset is useful.
    Bootloader,
}

/// Protocol state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Probing,
    Ready(DeviceMode),
}

impl LinkState {
    const fn name(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Probing => "probing",
            LinkState::Ready(DeviceMode::Application) => "ready",
            LinkState::Ready(DeviceMode::Bootloader) => "bootloader",
        }
    }
}

/// Tunables for a device session.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// How long `request` waits for a matching reply.
    pub reply_timeout: Duration,
    /// Fixed interval between connect attempts while the device is busy or
    /// absent. Retries are unbounded, each one logged.
    pub connect_retry: Duration,
    /// Seed for the session's RNG (addresses, ping payloads). `None` seeds
    /// from the OS; tests inject a value for determinism.
    pub seed: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(250),
            connect_retry: Duration::from_secs(5),
            seed: None,
        }
    }
}

/// Firmware version and build stamp, decoded from the info reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub release: u8,
    pub sub: u8,
    pub build: u16,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl FirmwareInfo {
    fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 11 {
            return Err(VelodromeError::decode(
                "firmware info",
                format!("payload is {} bytes, need 11", payload.len()),
            ));
        }
        Ok(Self {
            release: payload[0],
            sub: payload[1],
            build: u16::from_le_bytes([payload[2], payload[3]]),
            year: u16::from_le_bytes([payload[4], payload[5]]),
            month: payload[6],
            day: payload[7],
            hour: payload[8],
            minute: payload[9],
            second: payload[10],
        })
    }
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} build {} ({:04}-{:02}-{:02} {:02}:{:02}:{:02})",
            self.release,
            self.sub,
            self.build,
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second
        )
    }
}

/// Product identity decoded from the info reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub name: String,
    pub revision: String,
    pub serial: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl ProductInfo {
    fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 32 {
            return Err(VelodromeError::decode(
                "product info",
                format!("payload is {} bytes, need 32", payload.len()),
            ));
        }
        let text = |bytes: &[u8]| {
            String::from_utf8_lossy(bytes).trim_end_matches('\0').trim().to_string()
        };
        Ok(Self {
            name: text(&payload[0..18]),
            revision: text(&payload[18..24]),
            serial: u32::from_le_bytes([payload[24], payload[25], payload[26], payload[27]]),
            year: u16::from_le_bytes([payload[28], payload[29]]),
            month: payload[30],
            day: payload[31],
        })
    }
}

/// One read of the maze bundle (combo 0xBB): clock, encoder position, I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MazeReading {
    pub time: u64,
    pub position: i64,
    pub inputs: [bool; 2],
    pub outputs: [bool; 4],
}

/// One read of the recording bundle (combo 0xAA): clock, velocity, I/O.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RecorderReading {
    pub time: u64,
    pub velocity: f64,
    pub inputs: [bool; 2],
    pub outputs: [bool; 4],
}

fn io_states(values: &BTreeMap<u8, Value>) -> Result<([bool; 2], [bool; 4])> {
    Ok((
        [bundle_flag(values, 0x20)?, bundle_flag(values, 0x21)?],
        [
            bundle_flag(values, 0x30)?,
            bundle_flag(values, 0x31)?,
            bundle_flag(values, 0x32)?,
            bundle_flag(values, 0x33)?,
        ],
    ))
}

impl MazeReading {
    fn from_values(values: &BTreeMap<u8, Value>) -> Result<Self> {
        let time = values
            .get(&0x05)
            .and_then(Value::as_u64)
            .ok_or_else(|| VelodromeError::decode("maze bundle", "missing TIME field"))?;
        let position = values
            .get(&0x10)
            .and_then(Value::as_i32)
            .ok_or_else(|| VelodromeError::decode("maze bundle", "missing ENCPOS field"))?;
        let (inputs, outputs) = io_states(values)?;
        Ok(Self { time, position: i64::from(position), inputs, outputs })
    }
}

impl RecorderReading {
    fn from_values(values: &BTreeMap<u8, Value>) -> Result<Self> {
        let time = values
            .get(&0x05)
            .and_then(Value::as_u64)
            .ok_or_else(|| VelodromeError::decode("recorder bundle", "missing TIME field"))?;
        let velocity = values
            .get(&0x11)
            .and_then(Value::as_f32)
            .ok_or_else(|| VelodromeError::decode("recorder bundle", "missing ENCVEL field"))?;
        let (inputs, outputs) = io_states(values)?;
        Ok(Self { time, velocity: f64::from(velocity), inputs, outputs })
    }
}

/// The serialized wire: transport, address pair, sequence counter.
///
/// Shared (via `Arc`) between the session and its background burst tasks so
/// every write goes through the same one-in-flight-request discipline.
struct Wire<T: Transport> {
    transport: Mutex<T>,
    host: u16,
    device: u16,
    msn: AtomicU8,
    reply_timeout: Duration,
}

impl<T: Transport> Wire<T> {
    async fn request(&self, cmd: Command, payload: &[u8]) -> Result<Packet> {
        let msn = self.msn.fetch_add(1, Ordering::Relaxed);
        let request = Packet::new(self.device, self.host, msn, cmd, payload.to_vec())?;
        let frame = request.encode()?;

        // lock spans exactly one send-and-await; bursts and pollers queue here
        let mut transport = self.transport.lock().await;
        transport.send(&frame).await?;

        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(VelodromeError::NoReply { after: self.reply_timeout });
            }
            let raw = match transport.recv(deadline - now).await {
                Ok(raw) => raw,
                Err(VelodromeError::NoReply { .. }) => {
                    return Err(VelodromeError::NoReply { after: self.reply_timeout });
                }
                Err(err) => return Err(err),
            };
            match Packet::decode(raw.as_slice()) {
                Ok(reply) if reply.is_reply_to(&request) => {
                    trace!(msn, cmd = ?cmd, "matched reply");
                    return Ok(reply);
                }
                Ok(other) => {
                    trace!(
                        want_msn = msn,
                        got_msn = other.msn,
                        "discarding unmatched frame"
                    );
                }
                Err(err) => {
                    // malformed frames are discarded, the wait continues
                    debug!(error = %err, "discarding malformed frame");
                }
            }
        }
    }

    /// Issue a request whose reply must be an ack.
    async fn request_ack(&self, cmd: Command, payload: &[u8]) -> Result<()> {
        let reply = self.request(cmd, payload).await?;
        match reply.cmd {
            Command::Ack => Ok(()),
            Command::Nack => Err(nack_error(&reply)),
            other => Err(VelodromeError::decode(
                "command reply",
                format!("expected ack or nack, got {:#04x}", other.raw()),
            )),
        }
    }

    async fn write_param(&self, id: u8, bytes: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(1 + bytes.len());
        payload.push(id);
        payload.extend_from_slice(bytes);
        self.request_ack(Command::ParamWrite, &payload).await
    }
}

fn nack_error(reply: &Packet) -> VelodromeError {
    match reply.payload.first() {
        Some(&raw) => VelodromeError::Nack { code: NackCode::from_raw(raw) },
        None => VelodromeError::decode("nack reply", "nack without an error code"),
    }
}

/// Expect the reply to echo the request command and yield its payload.
fn expect_reply_payload(reply: Packet, cmd: Command) -> Result<Vec<u8>> {
    match reply.cmd {
        c if c == cmd => Ok(reply.payload),
        Command::Nack => Err(nack_error(&reply)),
        other => Err(VelodromeError::decode(
            "command reply",
            format!("expected {:#04x}, got {:#04x}", cmd.raw(), other.raw()),
        )),
    }
}

struct BurstHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A connected device: typed operations over the framed protocol.
pub struct DeviceSession<T: Transport> {
    wire: Arc<Wire<T>>,
    registry: Registry,
    state: LinkState,
    firmware: Option<FirmwareInfo>,
    product: Option<ProductInfo>,
    bursts: StdMutex<HashMap<u8, BurstHandle>>,
    rng: StdMutex<StdRng>,
    connect_retry: Duration,
}

impl<T: Transport> DeviceSession<T> {
    /// Wrap a transport in a new session with a fresh random address pair.
    pub fn new(transport: T, config: DeviceConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let host: u16 = rng.r#gen();
        let device: u16 = rng.r#gen();
        debug!(host, device, "session addresses assigned");

        Self {
            wire: Arc::new(Wire {
                transport: Mutex::new(transport),
                host,
                device,
                msn: AtomicU8::new(0),
                reply_timeout: config.reply_timeout,
            }),
            registry: Registry::standard(),
            state: LinkState::Disconnected,
            firmware: None,
            product: None,
            bursts: StdMutex::new(HashMap::new()),
            rng: StdMutex::new(rng),
            connect_retry: config.connect_retry,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The session's random `(host, device)` address pair.
    pub fn addresses(&self) -> (u16, u16) {
        (self.wire.host, self.wire.device)
    }

    /// Firmware info cached at connect time.
    pub fn firmware_info(&self) -> Option<&FirmwareInfo> {
        self.firmware.as_ref()
    }

    /// Product info cached at connect time.
    pub fn product_info(&self) -> Option<&ProductInfo> {
        self.product.as_ref()
    }

    /// Open the transport and probe the device until it is ready.
    ///
    /// Transient open failures (busy, absent) are retried on a fixed
    /// interval without bound, each attempt logged. A device found in
    /// bootloader mode is reset and probed again.
    pub async fn connect(&mut self) -> Result<()> {
        if matches!(self.state, LinkState::Ready(_)) {
            return Ok(());
        }
        self.state = LinkState::Connecting;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = self.wire.transport.lock().await.open().await;
            match result {
                Ok(()) => break,
                Err(err) if err.is_retryable() => {
                    warn!(
                        attempt = attempts,
                        error = %err,
                        retry_in = ?self.connect_retry,
                        "device unavailable, retrying"
                    );
                    tokio::time::sleep(self.connect_retry).await;
                }
                Err(err) => {
                    self.state = LinkState::Disconnected;
                    return Err(err);
                }
            }
        }
        info!(attempts, "link opened");

        self.state = LinkState::Probing;
        let mut mode = match self.read_device_state().await {
            Ok(mode) => mode,
            Err(err) => {
                self.state = LinkState::Disconnected;
                return Err(err);
            }
        };

        if mode == DeviceMode::Bootloader {
            info!("device in bootloader mode, resetting");
            self.state = LinkState::Connecting;
            self.wire.request_ack(Command::Reset, &[]).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.state = LinkState::Probing;
            mode = self.read_device_state().await?;
            if mode == DeviceMode::Bootloader {
                self.state = LinkState::Ready(DeviceMode::Bootloader);
                return Err(VelodromeError::NotReady { state: "bootloader" });
            }
        }

        let firmware = self.read_firmware_info().await?;
        let product = self.read_product_info().await?;
        if let Err(err) = self.set_led(true).await {
            warn!(error = %err, "could not light the status LED");
        }

        self.state = LinkState::Ready(DeviceMode::Application);
        info!(firmware = %firmware, product = %product.name, "device ready");
        self.firmware = Some(firmware);
        self.product = Some(product);
        Ok(())
    }

    /// Stop bursts, dim the LED and close the transport.
    pub async fn close(&mut self) -> Result<()> {
        self.stop_all_bursts().await;
        if matches!(self.state, LinkState::Ready(DeviceMode::Application)) {
            if let Err(err) = self.set_led(false).await {
                warn!(error = %err, "could not dim the status LED");
            }
        }
        self.wire.transport.lock().await.close().await?;
        self.state = LinkState::Disconnected;
        info!("device session closed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            LinkState::Ready(DeviceMode::Application) => Ok(()),
            other => Err(VelodromeError::NotReady { state: other.name() }),
        }
    }

    /// Ask the device whether it runs application firmware or the bootloader.
    pub async fn read_device_state(&self) -> Result<DeviceMode> {
        let reply = self.wire.request(Command::DeviceState, &[]).await?;
        let payload = expect_reply_payload(reply, Command::DeviceState)?;
        match payload.first() {
            Some(0x00) => Ok(DeviceMode::Bootloader),
            Some(0x01) => Ok(DeviceMode::Application),
            Some(&other) => Err(VelodromeError::decode(
                "device state",
                format!("unknown state byte {other:#04x}"),
            )),
            None => Err(VelodromeError::decode("device state", "empty payload")),
        }
    }

    pub async fn read_firmware_info(&self) -> Result<FirmwareInfo> {
        let reply = self.wire.request(Command::FirmwareInfo, &[]).await?;
        FirmwareInfo::parse(&expect_reply_payload(reply, Command::FirmwareInfo)?)
    }

    pub async fn read_product_info(&self) -> Result<ProductInfo> {
        let reply = self.wire.request(Command::ProductInfo, &[]).await?;
        ProductInfo::parse(&expect_reply_payload(reply, Command::ProductInfo)?)
    }

    /// Round-trip a 5-byte random payload and measure the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let payload: [u8; 5] = {
            let mut rng = self.rng.lock().unwrap();
            rng.r#gen()
        };
        let started = tokio::time::Instant::now();
        let reply = self.wire.request(Command::Ping, &payload).await?;
        let elapsed = started.elapsed();
        let echoed = expect_reply_payload(reply, Command::Ping)?;
        if echoed != payload {
            return Err(VelodromeError::decode("ping reply", "echo payload mismatch"));
        }
        Ok(elapsed)
    }

    /// Reboot the device.
    pub async fn reset(&self) -> Result<()> {
        self.wire.request_ack(Command::Reset, &[]).await
    }

    pub async fn set_led(&self, on: bool) -> Result<()> {
        self.wire.request_ack(Command::SetLed, &[u8::from(on)]).await
    }

    /// Read a single parameter and decode it through the registry.
    pub async fn read_param(&self, id: u8) -> Result<Value> {
        self.ensure_ready()?;
        let info = self.registry.get(id)?;
        let reply = self.wire.request(Command::ParamRead, &[id]).await?;
        let payload = expect_reply_payload(reply, Command::ParamRead)?;
        let value = self.registry.decode(id, &payload)?;
        trace!(param = info.name, ?value, "parameter read");
        Ok(value)
    }

    /// Read a combo parameter, returning its constituents keyed by id.
    pub async fn read_params(&self, combo_id: u8) -> Result<BTreeMap<u8, Value>> {
        self.ensure_ready()?;
        let members = self.registry.combo_members(combo_id)?.to_vec();
        let reply = self.wire.request(Command::ParamRead, &members).await?;
        let payload = expect_reply_payload(reply, Command::ParamRead)?;
        match self.registry.decode(combo_id, &payload)? {
            Value::Combo(values) => Ok(values),
            other => Err(VelodromeError::decode(
                "combo read",
                format!("combo {combo_id:#04x} decoded to non-combo value {other:?}"),
            )),
        }
    }

    /// Write raw bytes into a parameter.
    pub async fn write_param(&self, id: u8, bytes: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        self.registry.get(id)?;
        self.wire.write_param(id, bytes).await
    }

    /// State of digital input `input` (1 or 2).
    pub async fn read_input(&self, input: u8) -> Result<bool> {
        check_port(input, 2, "digital input")?;
        let value = self.read_param(0x20 + input - 1).await?;
        value
            .as_bool()
            .ok_or_else(|| VelodromeError::decode("digital input", "non-flag value"))
    }

    pub async fn read_inputs(&self) -> Result<[bool; 2]> {
        let values = self.read_params(0x25).await?;
        Ok([bundle_flag(&values, 0x20)?, bundle_flag(&values, 0x21)?])
    }

    /// State of digital output `port` (1 to 4).
    pub async fn read_output(&self, port: u8) -> Result<bool> {
        check_port(port, 4, "digital output")?;
        let value = self.read_param(0x30 + port - 1).await?;
        value
            .as_bool()
            .ok_or_else(|| VelodromeError::decode("digital output", "non-flag value"))
    }

    pub async fn read_outputs(&self) -> Result<[bool; 4]> {
        let values = self.read_params(0x35).await?;
        Ok([
            bundle_flag(&values, 0x30)?,
            bundle_flag(&values, 0x31)?,
            bundle_flag(&values, 0x32)?,
            bundle_flag(&values, 0x33)?,
        ])
    }

    /// Drive digital output `port` (1 to 4) high or low.
    pub async fn write_output(&self, port: u8, high: bool) -> Result<()> {
        check_port(port, 4, "digital output")?;
        self.ensure_ready()?;
        self.wire.write_param(0x30 + port - 1, &[u8::from(high)]).await
    }

    /// Set the analog output voltage.
    pub async fn write_analog(&self, volts: f32) -> Result<()> {
        self.ensure_ready()?;
        self.wire.write_param(0x40, &volts.to_le_bytes()).await
    }

    /// Device clock, in firmware ticks.
    pub async fn read_time(&self) -> Result<u64> {
        self.read_param(0x05)
            .await?
            .as_u64()
            .ok_or_else(|| VelodromeError::decode("TIME", "non-integer value"))
    }

    /// Encoder position in counts.
    pub async fn read_position(&self) -> Result<i64> {
        Ok(i64::from(
            self.read_param(0x10)
                .await?
                .as_i32()
                .ok_or_else(|| VelodromeError::decode("ENCPOS", "non-integer value"))?,
        ))
    }

    /// Windowed encoder velocity in counts per second.
    pub async fn read_velocity(&self) -> Result<f64> {
        Ok(f64::from(
            self.read_param(0x11)
                .await?
                .as_f32()
                .ok_or_else(|| VelodromeError::decode("ENCVEL", "non-velocity value"))?,
        ))
    }

    /// Size of the firmware's velocity averaging window.
    pub async fn read_window_size(&self) -> Result<u16> {
        self.read_param(0x12)
            .await?
            .as_u16()
            .ok_or_else(|| VelodromeError::decode("ENCVELWIN", "non-integer value"))
    }

    /// Homing progress: 0 idle, 1 homing, 2 home position found.
    pub async fn read_homing_state(&self) -> Result<u8> {
        self.read_param(0x13)
            .await?
            .as_u8()
            .ok_or_else(|| VelodromeError::decode("ENCHOME", "non-integer value"))
    }

    /// The encoder position homing seeks out.
    pub async fn read_home_position(&self) -> Result<i64> {
        Ok(i64::from(
            self.read_param(0x14)
                .await?
                .as_i32()
                .ok_or_else(|| VelodromeError::decode("ENCHOMEPOS", "non-integer value"))?,
        ))
    }

    /// Voltage rails and temperatures in one read.
    pub async fn read_sensors(&self) -> Result<BTreeMap<u8, Value>> {
        self.read_params(0x0A).await
    }

    pub async fn read_voltages(&self) -> Result<BTreeMap<u8, Value>> {
        self.read_params(0x0B).await
    }

    pub async fn read_temperatures(&self) -> Result<BTreeMap<u8, Value>> {
        self.read_params(0x0C).await
    }

    /// Zero the device clock.
    pub async fn reset_time(&self) -> Result<()> {
        self.ensure_ready()?;
        self.wire.write_param(0x05, &[0; 8]).await
    }

    /// Zero the encoder position counter.
    pub async fn reset_position(&self) -> Result<()> {
        self.ensure_ready()?;
        self.wire.write_param(0x10, &[0; 4]).await
    }

    /// The recording bundle: clock, velocity and I/O in one request.
    pub async fn read_recorder_params(&self) -> Result<RecorderReading> {
        let values = self.read_params(0xAA).await?;
        RecorderReading::from_values(&values)
    }

    /// The maze bundle: clock, encoder position and I/O in one request.
    pub async fn read_maze_params(&self) -> Result<MazeReading> {
        let values = self.read_params(0xBB).await?;
        MazeReading::from_values(&values)
    }

    /// Start toggling `port` high for `on_time` then low for `pause_time`,
    /// repeating in the background until stopped.
    ///
    /// Starting a burst on a port that is already bursting replaces the
    /// running task rather than stacking a second one.
    pub async fn start_burst(
        &self,
        port: u8,
        on_time: Duration,
        pause_time: Duration,
    ) -> Result<()> {
        check_port(port, 4, "digital output")?;
        self.ensure_ready()?;

        let old = self.bursts.lock().unwrap().remove(&port);
        if let Some(old) = old {
            debug!(port, "replacing running burst");
            old.cancel.cancel();
            let _ = old.task.await;
        }

        let wire = Arc::clone(&self.wire);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let id = 0x30 + port - 1;
        let task = tokio::spawn(async move {
            loop {
                if child.is_cancelled() {
                    break;
                }
                if let Err(err) = wire.write_param(id, &[1]).await {
                    warn!(port, error = %err, "burst write failed, stopping burst");
                    break;
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(on_time) => {}
                }
                if let Err(err) = wire.write_param(id, &[0]).await {
                    warn!(port, error = %err, "burst write failed, stopping burst");
                    break;
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(pause_time) => {}
                }
            }
            // the stop contract: never leave the port mid-pulse
            if let Err(err) = wire.write_param(id, &[0]).await {
                warn!(port, error = %err, "could not drive port low after burst");
            }
        });

        info!(port, ?on_time, ?pause_time, "burst started");
        self.bursts.lock().unwrap().insert(port, BurstHandle { cancel, task });
        Ok(())
    }

    /// Stop the burst on `port`, waiting for the task to finish.
    ///
    /// Does not return while the port could still be mid-pulse: the task is
    /// joined and drives the output low on its way out.
    pub async fn stop_burst(&self, port: u8) -> Result<()> {
        check_port(port, 4, "digital output")?;
        let handle = self.bursts.lock().unwrap().remove(&port);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
            debug!(port, "burst stopped");
        }
        Ok(())
    }

    /// Stop every running burst, joining each task.
    pub async fn stop_all_bursts(&self) {
        let handles: Vec<_> = self.bursts.lock().unwrap().drain().collect();
        for (port, handle) in handles {
            handle.cancel.cancel();
            let _ = handle.task.await;
            debug!(port, "burst stopped");
        }
    }

    /// Whether a burst task is currently running on `port`.
    pub fn is_bursting(&self, port: u8) -> bool {
        self.bursts
            .lock()
            .unwrap()
            .get(&port)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Burst activity for all four ports.
    pub fn burst_states(&self) -> [bool; 4] {
        [1, 2, 3, 4].map(|port| self.is_bursting(port))
    }
}

impl<T: Transport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        // tasks cannot be joined here; cancelling is enough for cleanup
        for handle in self.bursts.lock().unwrap().values() {
            handle.cancel.cancel();
        }
    }
}

fn check_port(port: u8, max: u8, what: &str) -> Result<()> {
    if (1..=max).contains(&port) {
        Ok(())
    } else {
        Err(VelodromeError::config(
            what.to_string(),
            format!("{what} number {port} is outside 1..={max}"),
        ))
    }
}

fn bundle_flag(values: &BTreeMap<u8, Value>, id: u8) -> Result<bool> {
    values.get(&id).and_then(Value::as_bool).ok_or_else(|| {
        VelodromeError::decode("parameter bundle", format!("missing I/O field {id:#04x}"))
    })
}
