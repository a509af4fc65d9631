//! Simulated device for tests and hardware-free dry runs.
//!
//! [`SimDevice`] implements [`Transport`] against an in-memory model of the
//! firmware: a parameter store, ack/nack behavior, and scripted fault
//! injection (busy opens, dropped requests, noise frames). A cloned
//! [`SimHandle`] lets a test drive the "hardware" side — move the encoder,
//! flip inputs, advance the clock — while a session talks to it through the
//! normal protocol path.
//!
//! This fills the role the replay connection plays for live telemetry
//! elsewhere: the same seam, a second implementation, no hardware needed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::packet::{Command, Packet, RawFrame};
use crate::{NackCode, Result, VelodromeError};

/// Device state byte: bootloader ("IAP") mode.
const STATE_BOOTLOADER: u8 = 0x00;
/// Device state byte: application mode.
const STATE_APPLICATION: u8 = 0x01;

#[derive(Debug)]
struct SimState {
    open: bool,
    /// Opens left to fail with "busy" before succeeding.
    busy_opens: u32,
    open_attempts: u32,
    app_state: u8,
    resets: u32,
    params: HashMap<u8, Vec<u8>>,
    inbox: VecDeque<RawFrame>,
    /// Requests left to swallow without replying.
    drop_requests: u32,
    /// Requests left to precede with mismatched noise frames.
    noisy_requests: u32,
    /// Force the next command to be nacked with this code.
    nack_next: Option<NackCode>,
    /// Record of parameter writes, oldest first.
    writes: Vec<(u8, Vec<u8>)>,
}

impl SimState {
    fn new() -> Self {
        let mut params = HashMap::new();
        params.insert(0x01, 3.3f32.to_le_bytes().to_vec());
        params.insert(0x02, 5.0f32.to_le_bytes().to_vec());
        params.insert(0x03, 36.5f32.to_le_bytes().to_vec());
        params.insert(0x04, 22.0f32.to_le_bytes().to_vec());
        params.insert(0x05, 0u64.to_le_bytes().to_vec());
        params.insert(0x10, 0i32.to_le_bytes().to_vec());
        params.insert(0x11, velocity_bytes(0.0, 1));
        params.insert(0x12, 10u16.to_le_bytes().to_vec());
        params.insert(0x13, vec![0]);
        params.insert(0x14, 0i32.to_le_bytes().to_vec());
        params.insert(0x20, vec![0]);
        params.insert(0x21, vec![0]);
        for id in 0x30..=0x33 {
            params.insert(id, vec![0]);
        }
        params.insert(0x40, 0f32.to_le_bytes().to_vec());
        params.insert(0xFF, vec![0]);

        Self {
            open: false,
            busy_opens: 0,
            open_attempts: 0,
            app_state: STATE_APPLICATION,
            resets: 0,
            params,
            inbox: VecDeque::new(),
            drop_requests: 0,
            noisy_requests: 0,
            nack_next: None,
            writes: Vec::new(),
        }
    }

    fn queue(&mut self, packet: &Packet) {
        if let Ok(frame) = packet.encode() {
            self.inbox.push_back(frame);
        }
    }

    fn queue_noise(&mut self, request: &Packet) {
        // one violation per frame: wrong msn, wrong target, wrong source
        let mut wrong_msn = reply_to(request, request.cmd, vec![0xAB]);
        wrong_msn.msn = request.msn.wrapping_add(91);
        self.queue(&wrong_msn);

        let mut wrong_target = reply_to(request, request.cmd, vec![0xAB]);
        wrong_target.target = request.source.wrapping_add(1);
        self.queue(&wrong_target);

        let mut wrong_source = reply_to(request, request.cmd, vec![0xAB]);
        wrong_source.source = request.target.wrapping_add(1);
        self.queue(&wrong_source);
    }

    fn process(&mut self, request: Packet) {
        if self.drop_requests > 0 {
            self.drop_requests -= 1;
            trace!(msn = request.msn, "sim swallowing request");
            return;
        }
        if self.noisy_requests > 0 {
            self.noisy_requests -= 1;
            self.queue_noise(&request);
        }
        if let Some(code) = self.nack_next.take() {
            let reply = reply_to(&request, Command::Nack, vec![code.raw()]);
            self.queue(&reply);
            return;
        }

        let reply = match request.cmd {
            Command::Ping => reply_to(&request, Command::Ping, request.payload.clone()),
            Command::DeviceState => {
                reply_to(&request, Command::DeviceState, vec![self.app_state])
            }
            Command::FirmwareInfo => {
                reply_to(&request, Command::FirmwareInfo, firmware_payload())
            }
            Command::ProductInfo => reply_to(&request, Command::ProductInfo, product_payload()),
            Command::ParamRead => {
                let mut payload = Vec::new();
                for &id in &request.payload {
                    match self.params.get(&id) {
                        Some(bytes) => payload.extend_from_slice(bytes),
                        None => {
                            let nack = reply_to(
                                &request,
                                Command::Nack,
                                vec![NackCode::ParamNotFound.raw()],
                            );
                            self.queue(&nack);
                            return;
                        }
                    }
                }
                reply_to(&request, Command::ParamRead, payload)
            }
            Command::ParamWrite => {
                let Some((&id, value)) = request.payload.split_first() else {
                    let nack = reply_to(
                        &request,
                        Command::Nack,
                        vec![NackCode::InvalidCmdSyntax.raw()],
                    );
                    self.queue(&nack);
                    return;
                };
                if !self.params.contains_key(&id) {
                    let nack = reply_to(
                        &request,
                        Command::Nack,
                        vec![NackCode::ParamNotFound.raw()],
                    );
                    self.queue(&nack);
                    return;
                }
                self.params.insert(id, value.to_vec());
                self.writes.push((id, value.to_vec()));
                reply_to(&request, Command::Ack, Vec::new())
            }
            Command::SetLed => {
                let state = request.payload.first().copied().unwrap_or(0);
                self.params.insert(0xFF, vec![state]);
                reply_to(&request, Command::Ack, Vec::new())
            }
            Command::Reset => {
                self.resets += 1;
                self.app_state = STATE_APPLICATION;
                reply_to(&request, Command::Ack, Vec::new())
            }
            _ => reply_to(&request, Command::Nack, vec![NackCode::UnknownCmd.raw()]),
        };
        self.queue(&reply);
    }
}

fn reply_to(request: &Packet, cmd: Command, payload: Vec<u8>) -> Packet {
    Packet {
        target: request.source,
        source: request.target,
        msn: request.msn,
        cmd,
        payload,
    }
}

fn velocity_bytes(magnitude: f32, direction: i8) -> Vec<u8> {
    let mut bytes = magnitude.to_le_bytes().to_vec();
    bytes.push(direction as u8);
    bytes
}

fn firmware_payload() -> Vec<u8> {
    let mut payload = vec![2, 1];
    payload.extend_from_slice(&324u16.to_le_bytes());
    payload.extend_from_slice(&2023u16.to_le_bytes());
    payload.extend_from_slice(&[6, 15, 12, 30, 5]);
    payload
}

fn product_payload() -> Vec<u8> {
    let mut payload = vec![0u8; 32];
    payload[..7].copy_from_slice(b"VELO-01");
    payload[18..21].copy_from_slice(b"A02");
    payload[24..28].copy_from_slice(&0x00C0_FFEEu32.to_le_bytes());
    payload[28..30].copy_from_slice(&2023u16.to_le_bytes());
    payload[30] = 6;
    payload[31] = 15;
    payload
}

/// In-memory device implementing [`Transport`].
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(SimState::new())) }
    }

    /// A handle for driving the simulated hardware from a test.
    pub fn handle(&self) -> SimHandle {
        SimHandle { state: Arc::clone(&self.state) }
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl crate::Transport for SimDevice {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.open {
            return Ok(());
        }
        state.open_attempts += 1;
        if state.busy_opens > 0 {
            state.busy_opens -= 1;
            return Err(VelodromeError::busy("sim"));
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().open = false;
        Ok(())
    }

    async fn send(&mut self, frame: &RawFrame) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(VelodromeError::NotReady { state: "disconnected" });
        }
        match Packet::decode(frame.as_slice()) {
            Ok(request) => state.process(request),
            Err(err) => trace!(error = %err, "sim ignoring malformed frame"),
        }
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<RawFrame> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.open {
                return Err(VelodromeError::NotReady { state: "disconnected" });
            }
            if let Some(frame) = state.inbox.pop_front() {
                return Ok(frame);
            }
        }
        // nothing pending: the real device would stay silent
        tokio::time::sleep(timeout).await;
        if let Some(frame) = self.state.lock().unwrap().inbox.pop_front() {
            return Ok(frame);
        }
        Err(VelodromeError::NoReply { after: timeout })
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn description(&self) -> String {
        "sim".to_string()
    }
}

/// Test-side handle to the simulated hardware.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Fail the next `n` open attempts with a busy error.
    pub fn fail_opens_with_busy(&self, n: u32) {
        self.state.lock().unwrap().busy_opens = n;
    }

    /// Swallow the next `n` requests without replying.
    pub fn drop_requests(&self, n: u32) {
        self.state.lock().unwrap().drop_requests = n;
    }

    /// Precede the next `n` replies with mismatched noise frames.
    pub fn make_noisy(&self, n: u32) {
        self.state.lock().unwrap().noisy_requests = n;
    }

    /// Nack the next command with the given code.
    pub fn nack_next(&self, code: NackCode) {
        self.state.lock().unwrap().nack_next = Some(code);
    }

    /// Put the device in bootloader mode until the next reset.
    pub fn enter_bootloader(&self) {
        self.state.lock().unwrap().app_state = STATE_BOOTLOADER;
    }

    pub fn open_attempts(&self) -> u32 {
        self.state.lock().unwrap().open_attempts
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().unwrap().resets
    }

    /// Raw encoded value of a parameter in the store.
    pub fn param_raw(&self, id: u8) -> Option<Vec<u8>> {
        self.state.lock().unwrap().params.get(&id).cloned()
    }

    pub fn set_param_raw(&self, id: u8, bytes: Vec<u8>) {
        self.state.lock().unwrap().params.insert(id, bytes);
    }

    pub fn set_time(&self, time: u64) {
        self.set_param_raw(0x05, time.to_le_bytes().to_vec());
    }

    pub fn set_position(&self, counts: i32) {
        self.set_param_raw(0x10, counts.to_le_bytes().to_vec());
    }

    pub fn set_velocity(&self, magnitude: f32, direction: i8) {
        self.set_param_raw(0x11, velocity_bytes(magnitude, direction));
    }

    pub fn set_input(&self, input: u8, high: bool) {
        debug_assert!((1..=2).contains(&input));
        self.set_param_raw(0x20 + input - 1, vec![u8::from(high)]);
    }

    /// Current level of a digital output, as last written by the host.
    pub fn output(&self, port: u8) -> bool {
        debug_assert!((1..=4).contains(&port));
        self.param_raw(0x30 + port - 1).is_some_and(|bytes| bytes.first().copied() != Some(0))
    }

    /// Writes made to the given parameter, oldest first.
    pub fn writes_to(&self, id: u8) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(wid, _)| *wid == id)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }
}
