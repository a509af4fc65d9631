//! The real-time maze session loop.
//!
//! A [`MazeSession`] plays a [`Level`] against a connected device. Each
//! tick, in order:
//!
//! 1. read the maze bundle (clock, encoder, I/O) from the device,
//!    tolerating a failed read by reusing the previous tick's values;
//! 2. compute velocity from the encoder delta plus any manual offset;
//! 3. advance the virtual position (with wraparound) unless paused;
//! 4. recompute the current zone;
//! 5. evaluate the rules and dispatch fired events;
//! 6. append one sample to the log sink and broadcast it to observers.
//!
//! The loop is driven either by an external clock calling
//! [`tick`](MazeSession::tick) (a render loop, typically) or by
//! [`run`](MazeSession::run), which paces itself at the configured rate
//! under a cancellation token. A single read failure never kills the
//! experiment; protocol-skew errors do.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{EventSpec, SessionView};
use super::level::Level;
use super::log::{LogEntry, LogSink};
use super::rule::{TickSignals, evaluate_rules};
use super::zone::find_zone;
use crate::device::{DeviceSession, MazeReading};
use crate::transport::Transport;
use crate::{Result, VelodromeError};

/// Lifecycle of a maze session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MazePhase {
    Initializing,
    Running,
    Paused,
    Finished,
}

impl MazePhase {
    const fn name(&self) -> &'static str {
        match self {
            MazePhase::Initializing => "initializing",
            MazePhase::Running => "running",
            MazePhase::Paused => "paused",
            MazePhase::Finished => "finished",
        }
    }
}

/// Tunables for a maze session.
#[derive(Debug, Clone)]
pub struct MazeConfig {
    /// Scales encoder revolutions to track units per tick.
    pub velocity_ratio: f64,
    /// Encoder counts per full revolution of the wheel.
    pub counts_per_revolution: f64,
    /// End the session automatically after this much wall time.
    pub runtime_limit: Option<Duration>,
    /// Tick frequency used by [`MazeSession::run`].
    pub tick_rate: f64,
    /// Seed for random teleports; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Skip the log sink entirely (dry runs).
    pub suppress_log: bool,
}

impl Default for MazeConfig {
    fn default() -> Self {
        Self {
            velocity_ratio: 1.0,
            counts_per_revolution: 14_400.0,
            runtime_limit: None,
            tick_rate: 60.0,
            seed: None,
            suppress_log: false,
        }
    }
}

/// A play-through of one level on one device.
pub struct MazeSession<T: Transport, S: LogSink> {
    device: DeviceSession<T>,
    level: Level,
    config: MazeConfig,
    sink: S,
    phase: MazePhase,
    position: f64,
    prev_encoder: Option<i64>,
    last_reading: MazeReading,
    current_zone: usize,
    teleported: bool,
    manual_velocity: f64,
    keys: Vec<char>,
    started: Instant,
    rng: StdRng,
    samples: watch::Sender<Option<Arc<LogEntry>>>,
}

impl<T: Transport, S: LogSink> MazeSession<T, S> {
    /// Bind a validated level to a device and a log sink.
    pub fn new(
        device: DeviceSession<T>,
        level: Level,
        config: MazeConfig,
        sink: S,
    ) -> Result<Self> {
        level.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (samples, _) = watch::channel(None);
        Ok(Self {
            device,
            level,
            config,
            sink,
            phase: MazePhase::Initializing,
            position: 0.0,
            prev_encoder: None,
            last_reading: MazeReading::default(),
            current_zone: 0,
            teleported: false,
            manual_velocity: 0.0,
            keys: Vec::new(),
            started: Instant::now(),
            rng,
            samples,
        })
    }

    pub fn phase(&self) -> MazePhase {
        self.phase
    }

    pub fn is_paused(&self) -> bool {
        self.phase == MazePhase::Paused
    }

    /// Current virtual position on the track.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// The zone the animal is currently in.
    pub fn current_zone(&self) -> &super::zone::Zone {
        &self.level.zones[self.current_zone]
    }

    pub fn level(&self) -> &Level {
        &self.level
    }

    pub fn device(&self) -> &DeviceSession<T> {
        &self.device
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Queue a key press for the next tick's rule evaluation.
    pub fn push_key(&mut self, key: char) {
        self.keys.push(key.to_ascii_uppercase());
    }

    /// Adjust the manual velocity offset added to every tick.
    pub fn nudge_velocity(&mut self, delta: f64) {
        self.manual_velocity += delta;
    }

    pub fn set_manual_velocity(&mut self, velocity: f64) {
        self.manual_velocity = velocity;
    }

    /// Live feed of per-tick samples, independent of the log sink.
    pub fn sample_stream(&self) -> impl Stream<Item = Arc<LogEntry>> + 'static {
        WatchStream::new(self.samples.subscribe()).filter_map(|opt| async move { opt })
    }

    /// Connect (if needed), zero the device clock and position, take the
    /// first reading and begin running.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != MazePhase::Initializing {
            return Err(VelodromeError::NotReady { state: self.phase.name() });
        }
        // failing to establish the initial connection is fatal
        self.device.connect().await?;
        self.device.reset_time().await?;
        self.device.reset_position().await?;
        self.level.reset_rules();

        self.last_reading = self.device.read_maze_params().await?;
        self.prev_encoder = Some(self.last_reading.position);
        self.position = 0.0;
        self.current_zone = find_zone(self.position, &self.level.zones)
            .map(|zone| zone.id)
            .unwrap_or(0);
        self.started = Instant::now();
        self.phase = MazePhase::Running;
        info!(level = %self.level.name, track_length = self.level.length(), "maze session started");
        Ok(())
    }

    /// Execute one simulation tick. See the module docs for the step order.
    pub async fn tick(&mut self) -> Result<()> {
        match self.phase {
            MazePhase::Initializing => {
                return Err(VelodromeError::NotReady { state: "initializing" });
            }
            MazePhase::Finished => {
                debug!("tick after finish ignored");
                return Ok(());
            }
            MazePhase::Running | MazePhase::Paused => {}
        }

        // 1. read the device, degrading to the previous sample on failure
        match self.device.read_maze_params().await {
            Ok(reading) => self.last_reading = reading,
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "device read failed, reusing previous sample");
            }
            Err(err) => return Err(err),
        }

        // 2. velocity from the encoder delta
        let encoder = self.last_reading.position;
        let delta = encoder - self.prev_encoder.unwrap_or(encoder);
        self.prev_encoder = Some(encoder);
        let velocity = self.config.velocity_ratio * delta as f64
            / self.config.counts_per_revolution
            + self.manual_velocity;

        // 3. movement, wrapping at the track length
        if self.phase == MazePhase::Running {
            self.position = wrap(self.position + velocity, self.level.length());
        }

        // 4. zone membership
        match find_zone(self.position, &self.level.zones) {
            Some(zone) => self.current_zone = zone.id,
            None => warn!(position = self.position, "position outside every zone, keeping last"),
        }

        // 5. rules and events
        let keys = mem::take(&mut self.keys);
        let zone_kind = self.level.zones[self.current_zone].kind.clone();
        let signals = TickSignals {
            zone_kind: &zone_kind,
            velocity,
            inputs: self.last_reading.inputs,
            keys: &keys,
        };
        let view = SessionView {
            paused: self.phase == MazePhase::Paused,
            outputs: self.last_reading.outputs,
            bursting: self.device.burst_states(),
        };
        let fired = evaluate_rules(&mut self.level.rules, &mut self.level.events, &signals, &view);
        for spec in fired {
            self.dispatch(spec).await?;
        }

        // 6. one sample per tick; the teleported flag belongs to exactly
        // this entry and is cleared by building it
        let entry = LogEntry {
            elapsed: self.started.elapsed().as_secs_f64(),
            device_time: self.last_reading.time,
            velocity,
            position: self.position,
            teleported: mem::take(&mut self.teleported),
            paused: self.phase == MazePhase::Paused,
            inputs: self.last_reading.inputs,
            outputs: self.last_reading.outputs,
            zone_kind,
            zone_membership: self
                .level
                .zones
                .iter()
                .map(|zone| zone.id == self.current_zone)
                .collect(),
        };
        if !self.config.suppress_log {
            self.sink.append(&entry)?;
        }
        let _ = self.samples.send(Some(Arc::new(entry)));

        if let Some(limit) = self.config.runtime_limit {
            if self.started.elapsed() >= limit {
                info!(?limit, "runtime limit reached");
                self.finish().await?;
            }
        }
        Ok(())
    }

    /// Drive the session at the configured tick rate until cancelled or
    /// finished.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.phase == MazePhase::Initializing {
            self.start().await?;
        }
        let period = Duration::from_secs_f64(1.0 / self.config.tick_rate);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await?;
                    if self.phase == MazePhase::Finished {
                        return Ok(());
                    }
                }
            }
        }
        self.finish().await
    }

    /// Jump to `target`, flagging the next log entry.
    pub fn teleport(&mut self, target: f64) {
        self.position = wrap(target, self.level.length());
        self.teleported = true;
        debug!(position = self.position, "teleported");
    }

    /// Teleport to the middle of a random zone of one of `kinds`, never
    /// the kind currently occupied. Skipped with a warning when no zone
    /// qualifies.
    pub fn random_teleport(&mut self, kinds: &[String]) {
        let current_kind = &self.level.zones[self.current_zone].kind;
        let candidates: Vec<f64> = self
            .level
            .zones
            .iter()
            .filter(|zone| kinds.contains(&zone.kind) && &zone.kind != current_kind)
            .map(super::zone::Zone::middle)
            .collect();
        match candidates.is_empty() {
            true => warn!(?kinds, "random teleport has no eligible target zone"),
            false => {
                let target = candidates[self.rng.gen_range(0..candidates.len())];
                self.teleport(target);
            }
        }
    }

    /// Freeze the track, optionally teleporting first. No-op when paused.
    pub fn pause(&mut self, position: Option<f64>) {
        if self.phase != MazePhase::Running {
            return;
        }
        if let Some(position) = position {
            self.teleport(position);
        }
        self.phase = MazePhase::Paused;
        info!("session paused");
    }

    /// Resume the track, optionally teleporting first. No-op unless paused.
    pub fn unpause(&mut self, position: Option<f64>) {
        if self.phase != MazePhase::Paused {
            return;
        }
        if let Some(position) = position {
            self.teleport(position);
        }
        self.phase = MazePhase::Running;
        info!("session resumed");
    }

    /// Stop bursts, flush and close the sink, end the session.
    pub async fn finish(&mut self) -> Result<()> {
        if self.phase == MazePhase::Finished {
            return Ok(());
        }
        self.device.stop_all_bursts().await;
        self.sink.flush()?;
        self.sink.close()?;
        let _ = self.samples.send(None);
        self.phase = MazePhase::Finished;
        info!(elapsed = self.started.elapsed().as_secs_f64(), "maze session finished");
        Ok(())
    }

    async fn dispatch(&mut self, spec: EventSpec) -> Result<()> {
        match spec {
            EventSpec::Teleport { target } => self.teleport(target),
            EventSpec::RandomTeleport { zone_kinds } => self.random_teleport(&zone_kinds),
            EventSpec::PortOn { port } => self.write_output(port, true).await?,
            EventSpec::PortOff { port } => self.write_output(port, false).await?,
            EventSpec::StartBurst { port, on_time, pause_time } => {
                let result = self
                    .device
                    .start_burst(
                        port,
                        Duration::from_secs_f64(on_time),
                        Duration::from_secs_f64(pause_time),
                    )
                    .await;
                if let Err(err) = result {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(port, error = %err, "start burst failed");
                }
            }
            EventSpec::StopBurst { port } => self.device.stop_burst(port).await?,
            EventSpec::Pause { position } => self.pause(position),
            EventSpec::UnPause { position } => self.unpause(position),
            EventSpec::Print { message } => info!(%message),
        }
        Ok(())
    }

    /// Actuate an output, keeping the in-tick shadow of the port levels
    /// current so later events this tick see the new state.
    async fn write_output(&mut self, port: u8, high: bool) -> Result<()> {
        match self.device.write_output(port, high).await {
            Ok(()) => {
                if let Some(slot) =
                    self.last_reading.outputs.get_mut(usize::from(port.saturating_sub(1)))
                {
                    *slot = high;
                }
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                warn!(port, high, error = %err, "output write failed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Wrap a track coordinate into `[0, length)`.
fn wrap(position: f64, length: f64) -> f64 {
    if length <= 0.0 {
        return 0.0;
    }
    let wrapped = position % length;
    if wrapped < 0.0 { wrapped + length } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::maze::log::MemorySink;
    use crate::sim::{SimDevice, SimHandle};

    #[test]
    fn wrap_stays_in_range() {
        assert_eq!(wrap(0.0, 200.0), 0.0);
        assert_eq!(wrap(250.0, 200.0), 50.0);
        assert_eq!(wrap(-50.0, 200.0), 150.0);
        assert_eq!(wrap(200.0, 200.0), 0.0);
    }

    fn two_zone_level() -> Level {
        let mut level = Level::new("test");
        level.add_zone(100.0, "neutral");
        level.add_zone(100.0, "aversive");
        level
    }

    async fn session_with(
        level: Level,
    ) -> (MazeSession<SimDevice, MemorySink>, SimHandle) {
        let sim = SimDevice::new();
        let handle = sim.handle();
        let device = DeviceSession::new(
            sim,
            DeviceConfig {
                reply_timeout: Duration::from_millis(50),
                connect_retry: Duration::from_millis(5),
                seed: Some(11),
            },
        );
        let config = MazeConfig { seed: Some(11), ..Default::default() };
        let mut session = MazeSession::new(device, level, config, MemorySink::new()).unwrap();
        session.start().await.unwrap();
        (session, handle)
    }

    #[tokio::test]
    async fn encoder_motion_advances_position_with_wraparound() {
        let (mut session, handle) = session_with(two_zone_level()).await;
        // one full revolution = 14400 counts = 1 track unit by default
        handle.set_position(14_400 * 150);
        session.tick().await.unwrap();
        assert!((session.position() - 150.0).abs() < 1e-9);
        assert_eq!(session.current_zone().kind, "aversive");

        handle.set_position(14_400 * 250);
        session.tick().await.unwrap();
        assert!((session.position() - 50.0).abs() < 1e-9, "wrapped at track length");
    }

    #[tokio::test]
    async fn paused_session_holds_position() {
        let (mut session, handle) = session_with(two_zone_level()).await;
        session.pause(None);
        handle.set_position(14_400 * 10);
        session.tick().await.unwrap();
        assert_eq!(session.position(), 0.0);
        assert!(session.sink().entries.last().unwrap().paused);

        // pausing again is a no-op, unpausing resumes movement
        session.pause(None);
        session.unpause(None);
        handle.set_position(14_400 * 20);
        session.tick().await.unwrap();
        assert!((session.position() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn read_failure_degrades_to_stale_values() {
        let (mut session, handle) = session_with(two_zone_level()).await;
        handle.set_position(14_400 * 5);
        session.tick().await.unwrap();
        assert!((session.position() - 5.0).abs() < 1e-9);

        handle.drop_requests(1);
        session.tick().await.unwrap();
        // stale encoder sample means zero delta, position holds
        assert!((session.position() - 5.0).abs() < 1e-9);
        assert_eq!(session.sink().entries.len(), 2);
    }

    #[tokio::test]
    async fn manual_velocity_offset_moves_without_encoder() {
        let (mut session, _handle) = session_with(two_zone_level()).await;
        session.set_manual_velocity(3.0);
        session.tick().await.unwrap();
        session.tick().await.unwrap();
        assert!((session.position() - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn finish_flushes_and_closes_the_sink() {
        let (mut session, _handle) = session_with(two_zone_level()).await;
        session.tick().await.unwrap();
        session.finish().await.unwrap();
        assert!(session.sink().closed);
        assert!(session.sink().flushes >= 1);
        // ticking after finish is a no-op
        session.tick().await.unwrap();
        assert_eq!(session.sink().entries.len(), 1);
    }
}
