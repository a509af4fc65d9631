//! The virtual linear maze: levels, zones, rules, events and the
//! real-time session loop.
//!
//! A [`Level`] tiles a 1-D virtual track with typed [`Zone`]s, names a set
//! of [`Event`]s (teleports, output pulses, pauses) and binds [`Rule`]s
//! that watch the animal's position and velocity and trigger those events.
//! A [`MazeSession`] plays a level against a connected device: every tick
//! it reads the encoder, advances the virtual position, evaluates the
//! rules, dispatches fired events and appends one sample to a [`LogSink`].
//!
//! Rendering of the track is a collaborator's job; this module only owns
//! positions, zones and behavior.

mod event;
mod level;
mod log;
mod rule;
mod session;
mod zone;

pub use event::{Event, EventSpec, SessionView};
pub use level::{Level, LevelSpec, RuleSpec, ZoneSpec};
pub use log::{LogEntry, LogSink, MemorySink, NullSink};
pub use rule::{Comparison, Edge, Rule, TickSignals, evaluate_rules};
pub use session::{MazeConfig, MazePhase, MazeSession};
pub use zone::{Zone, find_zone};
