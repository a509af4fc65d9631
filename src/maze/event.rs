//! Events: the side effects rules can trigger.

use serde::{Deserialize, Serialize};

/// What the maze session looks like to a `triggerable` check: enough state
/// to decide whether firing an event makes sense right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionView {
    pub paused: bool,
    /// Last-known digital output levels, ports 1..=4.
    pub outputs: [bool; 4],
    /// Which ports have a burst task running.
    pub bursting: [bool; 4],
}

/// The action an event performs when it fires.
///
/// Durations are seconds so level files stay plain YAML numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSpec {
    /// Jump to a fixed track position.
    Teleport { target: f64 },
    /// Jump to the middle of a random zone of one of the given kinds,
    /// excluding the kind currently occupied.
    RandomTeleport { zone_kinds: Vec<String> },
    /// Drive a digital output high.
    PortOn { port: u8 },
    /// Drive a digital output low.
    PortOff { port: u8 },
    /// Begin periodic on/off toggling of a digital output.
    StartBurst { port: u8, on_time: f64, pause_time: f64 },
    /// Stop the toggling started by [`StartBurst`](EventSpec::StartBurst).
    StopBurst { port: u8 },
    /// Freeze the track, optionally teleporting first.
    Pause { position: Option<f64> },
    /// Resume the track, optionally teleporting first.
    UnPause { position: Option<f64> },
    /// Write a message to the log.
    Print { message: String },
}

/// A named, counted event bound into a level.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub spec: EventSpec,
    /// How many times this event has fired this session.
    pub trigger_count: u64,
}

impl Event {
    pub fn new(name: impl Into<String>, spec: EventSpec) -> Self {
        Self { name: name.into(), spec, trigger_count: 0 }
    }

    /// Whether it makes sense to fire this event against the given session
    /// state. A rule whose condition holds keeps retrying on later ticks
    /// until this turns true.
    pub fn triggerable(&self, view: &SessionView) -> bool {
        match &self.spec {
            EventSpec::Teleport { .. } | EventSpec::RandomTeleport { .. } => !view.paused,
            EventSpec::PortOn { port } => !output_state(view, *port),
            EventSpec::PortOff { port } => output_state(view, *port),
            EventSpec::StartBurst { port, .. } => !burst_state(view, *port),
            EventSpec::StopBurst { port } => burst_state(view, *port),
            EventSpec::Pause { .. } => !view.paused,
            EventSpec::UnPause { .. } => view.paused,
            EventSpec::Print { .. } => true,
        }
    }
}

fn output_state(view: &SessionView, port: u8) -> bool {
    view.outputs.get(usize::from(port.saturating_sub(1))).copied().unwrap_or(false)
}

fn burst_state(view: &SessionView, port: u8) -> bool {
    view.bursting.get(usize::from(port.saturating_sub(1))).copied().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teleports_require_running_session() {
        let event = Event::new("tp", EventSpec::Teleport { target: 50.0 });
        assert!(event.triggerable(&SessionView::default()));
        assert!(!event.triggerable(&SessionView { paused: true, ..Default::default() }));
    }

    #[test]
    fn port_events_check_last_known_level() {
        let on = Event::new("on", EventSpec::PortOn { port: 2 });
        let off = Event::new("off", EventSpec::PortOff { port: 2 });
        let low = SessionView::default();
        let high = SessionView { outputs: [false, true, false, false], ..Default::default() };
        assert!(on.triggerable(&low));
        assert!(!on.triggerable(&high));
        assert!(!off.triggerable(&low));
        assert!(off.triggerable(&high));
    }

    #[test]
    fn burst_events_check_running_tasks() {
        let start =
            Event::new("s", EventSpec::StartBurst { port: 1, on_time: 0.1, pause_time: 0.1 });
        let stop = Event::new("e", EventSpec::StopBurst { port: 1 });
        let idle = SessionView::default();
        let bursting = SessionView { bursting: [true, false, false, false], ..Default::default() };
        assert!(start.triggerable(&idle));
        assert!(!start.triggerable(&bursting));
        assert!(!stop.triggerable(&idle));
        assert!(stop.triggerable(&bursting));
    }

    #[test]
    fn pause_events_are_state_dependent() {
        let pause = Event::new("p", EventSpec::Pause { position: None });
        let unpause = Event::new("u", EventSpec::UnPause { position: None });
        let running = SessionView::default();
        let paused = SessionView { paused: true, ..Default::default() };
        assert!(pause.triggerable(&running));
        assert!(!pause.triggerable(&paused));
        assert!(unpause.triggerable(&paused));
        assert!(!unpause.triggerable(&running));
    }
}
