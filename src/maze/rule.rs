//! Rules: per-tick conditions that trigger events.
//!
//! Every live rule is checked once per tick with the signal relevant to its
//! variant (zone kind, velocity, digital inputs, key presses). Each rule
//! owns a `done` latch so a condition that keeps holding fires its event
//! exactly once per arm/disarm cycle; the latch transitions are
//! variant-specific and documented on [`Rule::check`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::event::{Event, EventSpec, SessionView};

/// Which side of the threshold arms a velocity/speed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

/// Digital-input transition an input rule fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
}

/// A countdown armed by `reset` and expired once the configured length has
/// passed. Freshly-created timers start counting immediately.
#[derive(Debug, Clone)]
struct DelayTimer {
    length: Duration,
    until: Instant,
}

impl DelayTimer {
    fn new(length: Duration) -> Self {
        Self { length, until: Instant::now() + length }
    }

    fn reset(&mut self) {
        self.until = Instant::now() + self.length;
    }

    fn running(&self) -> bool {
        Instant::now() < self.until
    }
}

/// The signals one tick exposes to rule evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TickSignals<'a> {
    /// Kind of the zone currently occupied.
    pub zone_kind: &'a str,
    /// Velocity applied this tick.
    pub velocity: f64,
    /// Digital input levels.
    pub inputs: [bool; 2],
    /// Key symbols pressed since the previous tick.
    pub keys: &'a [char],
}

#[derive(Debug, Clone)]
enum RuleKind {
    Zone {
        kind: String,
        delay: DelayTimer,
        active: bool,
    },
    Velocity {
        cmp: Comparison,
        threshold: f64,
        delay: DelayTimer,
        active: bool,
    },
    SmoothVelocity {
        cmp: Comparison,
        threshold: f64,
        delay: DelayTimer,
        active: bool,
        bin: usize,
        window: VecDeque<f64>,
    },
    Speed {
        cmp: Comparison,
        threshold: f64,
        bin: usize,
        window: VecDeque<f64>,
    },
    KeyPress {
        key: char,
    },
    Input {
        input: u8,
        edge: Edge,
        last: Option<bool>,
    },
}

/// A condition bound to a named event.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Name of the event this rule triggers.
    pub event: String,
    done: bool,
    kind: RuleKind,
}

impl Rule {
    /// Fires after the animal has dwelt in a zone of `kind` for `delay`.
    pub fn zone(event: impl Into<String>, kind: impl Into<String>, delay: Duration) -> Self {
        Self {
            event: event.into(),
            done: false,
            kind: RuleKind::Zone { kind: kind.into(), delay: DelayTimer::new(delay), active: false },
        }
    }

    /// Fires once absolute velocity has stayed `cmp` `threshold` for `delay`.
    pub fn velocity(
        event: impl Into<String>,
        cmp: Comparison,
        threshold: f64,
        delay: Duration,
    ) -> Self {
        Self {
            event: event.into(),
            done: false,
            kind: RuleKind::Velocity {
                cmp,
                threshold,
                delay: DelayTimer::new(delay),
                active: false,
            },
        }
    }

    /// Like [`velocity`](Rule::velocity) but smoothing over a moving
    /// average of the last `bin` velocities.
    pub fn smooth_velocity(
        event: impl Into<String>,
        bin: usize,
        cmp: Comparison,
        threshold: f64,
        delay: Duration,
    ) -> Self {
        let bin = bin.max(1);
        Self {
            event: event.into(),
            done: false,
            kind: RuleKind::SmoothVelocity {
                cmp,
                threshold,
                delay: DelayTimer::new(delay),
                active: false,
                bin,
                window: VecDeque::with_capacity(bin),
            },
        }
    }

    /// Fires when the sum of the last `bin` absolute velocities crosses
    /// `threshold`. Edge-triggered, no dwell delay.
    pub fn speed(
        event: impl Into<String>,
        cmp: Comparison,
        threshold: f64,
        bin: usize,
    ) -> Self {
        let bin = bin.max(1);
        Self {
            event: event.into(),
            done: false,
            kind: RuleKind::Speed { cmp, threshold, bin, window: VecDeque::with_capacity(bin) },
        }
    }

    /// Fires on every press of `key`.
    pub fn key_press(event: impl Into<String>, key: char) -> Self {
        Self {
            event: event.into(),
            done: false,
            kind: RuleKind::KeyPress { key: key.to_ascii_uppercase() },
        }
    }

    /// Fires on the given transition of digital input `input` (1 or 2).
    pub fn input(event: impl Into<String>, input: u8, edge: Edge) -> Self {
        debug_assert!((1..=2).contains(&input));
        Self { event: event.into(), done: false, kind: RuleKind::Input { input, edge, last: None } }
    }

    /// Evaluate one tick; returns whether the rule wants to fire now.
    ///
    /// Latch semantics per variant:
    /// - **Zone**: entering the configured kind arms a delay timer; staying
    ///   past the delay fires once; leaving disarms and allows re-arming.
    /// - **Velocity / SmoothVelocity**: crossing the threshold in the
    ///   configured direction arms; crossing back disarms and resets the
    ///   delay; staying armed past the delay fires once.
    /// - **Speed**: fires whenever the window sum is across the threshold
    ///   and the latch is clear; the sum coming back resets the latch.
    /// - **KeyPress / Input**: fire immediately on match; the event's own
    ///   `triggerable` predicate is the only guard.
    ///
    /// Firing is confirmed by the engine via [`mark_fired`](Rule::mark_fired)
    /// only when the bound event was actually triggerable, so a blocked
    /// rule keeps retrying on later ticks.
    pub fn check(&mut self, signals: &TickSignals<'_>) -> bool {
        match &mut self.kind {
            RuleKind::Zone { kind, delay, active } => {
                if signals.zone_kind == kind.as_str() {
                    if !*active && !self.done {
                        delay.reset();
                        *active = true;
                    }
                    *active && !self.done && !delay.running()
                } else {
                    self.done = false;
                    *active = false;
                    false
                }
            }
            RuleKind::Velocity { cmp, threshold, delay, active } => {
                threshold_latch(*cmp, *threshold, delay, active, &mut self.done, signals.velocity.abs())
            }
            RuleKind::SmoothVelocity { cmp, threshold, delay, active, bin, window } => {
                window.push_back(signals.velocity);
                if window.len() > *bin {
                    window.pop_front();
                }
                let mean: f64 = window.iter().sum::<f64>() / window.len() as f64;
                threshold_latch(*cmp, *threshold, delay, active, &mut self.done, mean.abs())
            }
            RuleKind::Speed { cmp, threshold, bin, window } => {
                window.push_back(signals.velocity.abs());
                if window.len() > *bin {
                    window.pop_front();
                }
                let sum: f64 = window.iter().sum();
                match cmp {
                    Comparison::Above => {
                        if sum > *threshold {
                            !self.done
                        } else {
                            self.done = false;
                            false
                        }
                    }
                    Comparison::Below => {
                        if sum <= *threshold {
                            !self.done
                        } else {
                            self.done = false;
                            false
                        }
                    }
                }
            }
            RuleKind::KeyPress { key } => signals.keys.contains(key),
            RuleKind::Input { input, edge, last } => {
                let current = signals.inputs[usize::from(*input - 1)];
                let fired = match edge {
                    Edge::Rising => *last == Some(false) && current,
                    Edge::Falling => *last == Some(true) && !current,
                };
                *last = Some(current);
                fired
            }
        }
    }

    /// Record that the bound event actually fired.
    ///
    /// A zone rule bound to a random teleport re-arms immediately instead
    /// of latching: the teleport can land in another zone of the same kind
    /// without any tick where zone membership changes, and the rule must
    /// stay live there. This is variant-specific firing semantics, not a
    /// missing latch.
    pub fn mark_fired(&mut self, rearm_immediately: bool) {
        self.done = true;
        if rearm_immediately {
            if let RuleKind::Zone { active, .. } = &mut self.kind {
                self.done = false;
                *active = false;
            }
        }
    }

    /// Reset the rule's delay timer, if it has one.
    pub fn reset_delay(&mut self) {
        match &mut self.kind {
            RuleKind::Zone { delay, .. }
            | RuleKind::Velocity { delay, .. }
            | RuleKind::SmoothVelocity { delay, .. } => delay.reset(),
            _ => {}
        }
    }
}

fn threshold_latch(
    cmp: Comparison,
    threshold: f64,
    delay: &mut DelayTimer,
    active: &mut bool,
    done: &mut bool,
    value: f64,
) -> bool {
    let (arms, disarms) = match cmp {
        Comparison::Above => (value > threshold, value < threshold),
        Comparison::Below => (value < threshold, value > threshold),
    };
    if arms {
        *active = true;
    }
    if disarms {
        *active = false;
        *done = false;
        delay.reset();
    }
    *active && !*done && !delay.running()
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RuleKind::Zone { kind, delay, .. } => {
                write!(f, "in {kind} zone for {:?}", delay.length)
            }
            RuleKind::Velocity { cmp, threshold, delay, .. } => {
                write!(f, "velocity {cmp:?} {threshold} for {:?}", delay.length)
            }
            RuleKind::SmoothVelocity { cmp, threshold, delay, bin, .. } => {
                write!(
                    f,
                    "smooth velocity (avg of {bin}) {cmp:?} {threshold} for {:?}",
                    delay.length
                )
            }
            RuleKind::Speed { cmp, threshold, bin, .. } => {
                write!(f, "sum of last {bin} speeds {cmp:?} {threshold}")
            }
            RuleKind::KeyPress { key } => write!(f, "{key} key press"),
            RuleKind::Input { input, edge, .. } => {
                write!(f, "input {input} {edge:?} edge")
            }
        }
    }
}

/// Run every rule against this tick's signals, firing triggerable events.
///
/// Returns the fired event actions in rule order; the caller performs the
/// side effects.
pub fn evaluate_rules(
    rules: &mut [Rule],
    events: &mut HashMap<String, Event>,
    signals: &TickSignals<'_>,
    view: &SessionView,
) -> Vec<EventSpec> {
    let mut fired = Vec::new();
    for rule in rules.iter_mut() {
        if !rule.check(signals) {
            continue;
        }
        let Some(event) = events.get_mut(&rule.event) else {
            warn!(event = %rule.event, "rule references an unknown event");
            continue;
        };
        if !event.triggerable(view) {
            continue;
        }
        event.trigger_count += 1;
        info!(rule = %rule, event = %event.name, count = event.trigger_count, "rule triggered");
        rule.mark_fired(matches!(event.spec, EventSpec::RandomTeleport { .. }));
        fired.push(event.spec.clone());
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_with(name: &str, spec: EventSpec) -> HashMap<String, Event> {
        let mut events = HashMap::new();
        events.insert(name.to_string(), Event::new(name, spec));
        events
    }

    fn signals<'a>(zone_kind: &'a str, velocity: f64) -> TickSignals<'a> {
        TickSignals { zone_kind, velocity, inputs: [false, false], keys: &[] }
    }

    fn run(
        rules: &mut [Rule],
        events: &mut HashMap<String, Event>,
        zone_kind: &str,
        velocity: f64,
    ) -> usize {
        evaluate_rules(rules, events, &signals(zone_kind, velocity), &SessionView::default()).len()
    }

    #[test]
    fn zone_rule_fires_once_until_reentry() {
        let mut rules = vec![Rule::zone("tp", "aversive", Duration::ZERO)];
        let mut events = events_with("tp", EventSpec::Teleport { target: 50.0 });

        assert_eq!(run(&mut rules, &mut events, "aversive", 0.0), 1);
        // condition keeps holding: no re-fire
        assert_eq!(run(&mut rules, &mut events, "aversive", 0.0), 0);
        assert_eq!(run(&mut rules, &mut events, "aversive", 0.0), 0);
        // leave, re-enter: fires again
        assert_eq!(run(&mut rules, &mut events, "neutral", 0.0), 0);
        assert_eq!(run(&mut rules, &mut events, "aversive", 0.0), 1);
        assert_eq!(events["tp"].trigger_count, 2);
    }

    #[test]
    fn zone_rule_waits_out_its_delay() {
        let mut rules = vec![Rule::zone("tp", "reward", Duration::from_millis(30))];
        let mut events = events_with("tp", EventSpec::Teleport { target: 0.0 });

        assert_eq!(run(&mut rules, &mut events, "reward", 0.0), 0);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(run(&mut rules, &mut events, "reward", 0.0), 1);
    }

    #[test]
    fn zone_rule_exit_before_delay_disarms() {
        let mut rules = vec![Rule::zone("tp", "reward", Duration::from_millis(30))];
        let mut events = events_with("tp", EventSpec::Teleport { target: 0.0 });

        assert_eq!(run(&mut rules, &mut events, "reward", 0.0), 0);
        assert_eq!(run(&mut rules, &mut events, "neutral", 0.0), 0);
        std::thread::sleep(Duration::from_millis(40));
        // the dwell restarted on re-entry, so nothing fires yet
        assert_eq!(run(&mut rules, &mut events, "reward", 0.0), 0);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(run(&mut rules, &mut events, "reward", 0.0), 1);
    }

    #[test]
    fn zone_rule_with_random_teleport_rearms_immediately() {
        let mut rules = vec![Rule::zone("rtp", "aversive", Duration::ZERO)];
        let mut events =
            events_with("rtp", EventSpec::RandomTeleport { zone_kinds: vec!["neutral".into()] });

        // landing in another zone of the same kind must keep the rule live
        assert_eq!(run(&mut rules, &mut events, "aversive", 0.0), 1);
        assert_eq!(run(&mut rules, &mut events, "aversive", 0.0), 1);
        assert_eq!(events["rtp"].trigger_count, 2);
    }

    #[test]
    fn blocked_rule_retries_until_triggerable() {
        let mut rules = vec![Rule::zone("on", "reward", Duration::ZERO)];
        let mut events = events_with("on", EventSpec::PortOn { port: 1 });
        let high = SessionView { outputs: [true, false, false, false], ..Default::default() };

        // port already high: not triggerable, latch must stay clear
        let fired = evaluate_rules(&mut rules, &mut events, &signals("reward", 0.0), &high);
        assert!(fired.is_empty());
        assert_eq!(events["on"].trigger_count, 0);

        // port low again: the same dwell now fires
        let fired =
            evaluate_rules(&mut rules, &mut events, &signals("reward", 0.0), &SessionView::default());
        assert_eq!(fired.len(), 1);
        assert_eq!(events["on"].trigger_count, 1);
    }

    #[test]
    fn velocity_rule_arms_disarms_and_refires() {
        let mut rules = vec![Rule::velocity("e", Comparison::Above, 10.0, Duration::ZERO)];
        let mut events = events_with("e", EventSpec::Print { message: "fast".into() });

        assert_eq!(run(&mut rules, &mut events, "z", 5.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 15.0), 1);
        // still above: latched
        assert_eq!(run(&mut rules, &mut events, "z", 20.0), 0);
        // negative velocity counts by magnitude, still above
        assert_eq!(run(&mut rules, &mut events, "z", -20.0), 0);
        // drop below: disarm, then re-fire on the next crossing
        assert_eq!(run(&mut rules, &mut events, "z", 2.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 12.0), 1);
    }

    #[test]
    fn velocity_below_rule_fires_on_slowness() {
        let mut rules = vec![Rule::velocity("e", Comparison::Below, 3.0, Duration::ZERO)];
        let mut events = events_with("e", EventSpec::Print { message: "slow".into() });

        assert_eq!(run(&mut rules, &mut events, "z", 10.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 1.0), 1);
        assert_eq!(run(&mut rules, &mut events, "z", 1.0), 0);
    }

    #[test]
    fn smooth_velocity_rule_uses_the_moving_average() {
        let mut rules =
            vec![Rule::smooth_velocity("e", 3, Comparison::Above, 10.0, Duration::ZERO)];
        let mut events = events_with("e", EventSpec::Print { message: "fast".into() });

        // averages: 30, (30+0)/2=15, (30+0+0)/3=10, then (0+0+0)/3=0
        assert_eq!(run(&mut rules, &mut events, "z", 30.0), 1);
        assert_eq!(run(&mut rules, &mut events, "z", 0.0), 0); // 15 still above, latched
        assert_eq!(run(&mut rules, &mut events, "z", 0.0), 0); // 10 is not above 10
        assert_eq!(run(&mut rules, &mut events, "z", 0.0), 0); // 0 disarms
        assert_eq!(run(&mut rules, &mut events, "z", 36.0), 1); // avg 12: re-fires
    }

    #[test]
    fn speed_rule_is_edge_triggered() {
        let mut rules = vec![Rule::speed("e", Comparison::Above, 10.0, 3)];
        let mut events = events_with("e", EventSpec::Print { message: "sum".into() });

        // window fills: sums 5, 10, 15
        assert_eq!(run(&mut rules, &mut events, "z", 5.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 5.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 5.0), 1);
        // holding above: no re-fire
        assert_eq!(run(&mut rules, &mut events, "z", 5.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 5.0), 0);
        // dropping the sum to 3 resets the latch
        assert_eq!(run(&mut rules, &mut events, "z", 1.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 1.0), 0);
        assert_eq!(run(&mut rules, &mut events, "z", 1.0), 0);
        // a new rise re-fires
        assert_eq!(run(&mut rules, &mut events, "z", 9.0), 1);
        assert_eq!(events["e"].trigger_count, 2);
    }

    #[test]
    fn key_press_rule_matches_symbol() {
        let mut rules = vec![Rule::key_press("e", 'p')];
        let mut events = events_with("e", EventSpec::Pause { position: None });

        let quiet = TickSignals { zone_kind: "z", velocity: 0.0, inputs: [false; 2], keys: &[] };
        let pressed =
            TickSignals { zone_kind: "z", velocity: 0.0, inputs: [false; 2], keys: &['P'] };

        assert!(evaluate_rules(&mut rules, &mut events, &quiet, &SessionView::default()).is_empty());
        assert_eq!(
            evaluate_rules(&mut rules, &mut events, &pressed, &SessionView::default()).len(),
            1
        );
    }

    #[test]
    fn input_rule_fires_on_configured_edge_only() {
        let mut rules = vec![Rule::input("e", 1, Edge::Rising)];
        let mut events = events_with("e", EventSpec::Print { message: "lick".into() });

        let low = TickSignals { zone_kind: "z", velocity: 0.0, inputs: [false, false], keys: &[] };
        let high = TickSignals { zone_kind: "z", velocity: 0.0, inputs: [true, false], keys: &[] };

        // first observation establishes the baseline, no edge yet
        assert!(evaluate_rules(&mut rules, &mut events, &high, &SessionView::default()).is_empty());
        assert!(evaluate_rules(&mut rules, &mut events, &high, &SessionView::default()).is_empty());
        assert!(evaluate_rules(&mut rules, &mut events, &low, &SessionView::default()).is_empty());
        // low -> high is the rising edge
        assert_eq!(
            evaluate_rules(&mut rules, &mut events, &high, &SessionView::default()).len(),
            1
        );
    }
}
