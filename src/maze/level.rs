//! Level authoring: tiling the track, naming events, binding rules.
//!
//! Levels can be built programmatically or loaded from a YAML file:
//!
//! ```yaml
//! name: training-1
//! zones:
//!   - { length: 1200, kind: neutral }
//!   - { length: 800, kind: aversive }
//! events:
//!   escape:
//!     random_teleport: { zone_kinds: [neutral] }
//! rules:
//!   - zone: { event: escape, kind: aversive, delay: 2.0 }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::event::{Event, EventSpec};
use super::rule::{Comparison, Edge, Rule};
use super::zone::Zone;
use crate::{Result, VelodromeError};

/// Serializable zone description: zones tile the track in file order, each
/// one starting where the previous ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub length: f64,
    pub kind: String,
}

/// Serializable rule description; delays are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSpec {
    Zone { event: String, kind: String, delay: f64 },
    Velocity { event: String, comparison: Comparison, threshold: f64, delay: f64 },
    SmoothVelocity {
        event: String,
        bin: usize,
        comparison: Comparison,
        threshold: f64,
        delay: f64,
    },
    Speed { event: String, comparison: Comparison, threshold: f64, bin: usize },
    KeyPress { event: String, key: char },
    Input { event: String, input: u8, edge: Edge },
}

impl RuleSpec {
    fn event(&self) -> &str {
        match self {
            RuleSpec::Zone { event, .. }
            | RuleSpec::Velocity { event, .. }
            | RuleSpec::SmoothVelocity { event, .. }
            | RuleSpec::Speed { event, .. }
            | RuleSpec::KeyPress { event, .. }
            | RuleSpec::Input { event, .. } => event,
        }
    }

    fn build(&self) -> Rule {
        match self {
            RuleSpec::Zone { event, kind, delay } => {
                Rule::zone(event, kind, Duration::from_secs_f64(*delay))
            }
            RuleSpec::Velocity { event, comparison, threshold, delay } => {
                Rule::velocity(event, *comparison, *threshold, Duration::from_secs_f64(*delay))
            }
            RuleSpec::SmoothVelocity { event, bin, comparison, threshold, delay } => {
                Rule::smooth_velocity(
                    event,
                    *bin,
                    *comparison,
                    *threshold,
                    Duration::from_secs_f64(*delay),
                )
            }
            RuleSpec::Speed { event, comparison, threshold, bin } => {
                Rule::speed(event, *comparison, *threshold, *bin)
            }
            RuleSpec::KeyPress { event, key } => Rule::key_press(event, *key),
            RuleSpec::Input { event, input, edge } => Rule::input(event, *input, *edge),
        }
    }
}

/// Serializable level description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSpec {
    pub name: String,
    #[serde(default)]
    pub zones: Vec<ZoneSpec>,
    #[serde(default)]
    pub events: HashMap<String, EventSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// A playable level: contiguous zones, named events, bound rules.
#[derive(Debug)]
pub struct Level {
    pub name: String,
    pub zones: Vec<Zone>,
    pub events: HashMap<String, Event>,
    pub rules: Vec<Rule>,
}

impl Level {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), zones: Vec::new(), events: HashMap::new(), rules: Vec::new() }
    }

    /// Append a zone of `length` starting where the previous zone ended.
    pub fn add_zone(&mut self, length: f64, kind: impl Into<String>) -> &Zone {
        let offset = self.zones.last().map_or(0.0, Zone::end);
        let zone = Zone::new(self.zones.len(), offset, length, kind);
        debug!(level = %self.name, id = zone.id, offset, length, kind = %zone.kind, "zone added");
        self.zones.push(zone);
        self.zones.last().expect("just pushed")
    }

    /// Register an event under a name rules can bind to.
    pub fn add_event(&mut self, name: impl Into<String>, spec: EventSpec) {
        let name = name.into();
        self.events.insert(name.clone(), Event::new(name, spec));
    }

    /// Bind a rule; fails if it references an unregistered event.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if !self.events.contains_key(&rule.event) {
            return Err(VelodromeError::config(
                format!("level '{}'", self.name),
                format!("rule references unknown event '{}'", rule.event),
            ));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Total track length: the sum of all zone lengths.
    pub fn length(&self) -> f64 {
        self.zones.iter().map(|zone| zone.length).sum()
    }

    /// Zones of the given kind, in construction order.
    pub fn zones_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Zone> + 'a {
        self.zones.iter().filter(move |zone| zone.kind == kind)
    }

    /// Re-arm every rule's delay timer, e.g. when (re)starting a session
    /// on a level that was built some time ago.
    pub fn reset_rules(&mut self) {
        for rule in &mut self.rules {
            rule.reset_delay();
        }
    }

    /// Sanity-check the level before playing it.
    pub fn validate(&self) -> Result<()> {
        let context = || format!("level '{}'", self.name);
        if self.zones.is_empty() {
            return Err(VelodromeError::config(context(), "level has no zones"));
        }
        for zone in &self.zones {
            if zone.length <= 0.0 {
                return Err(VelodromeError::config(
                    context(),
                    format!("zone {} has non-positive length {}", zone.id, zone.length),
                ));
            }
        }
        for rule in &self.rules {
            if !self.events.contains_key(&rule.event) {
                return Err(VelodromeError::config(
                    context(),
                    format!("rule references unknown event '{}'", rule.event),
                ));
            }
        }
        for event in self.events.values() {
            if let EventSpec::RandomTeleport { zone_kinds } = &event.spec {
                let reachable = zone_kinds
                    .iter()
                    .any(|kind| self.zones.iter().any(|zone| &zone.kind == kind));
                if !reachable {
                    return Err(VelodromeError::config(
                        context(),
                        format!("event '{}' targets zone kinds the level lacks", event.name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Materialize a level from its serializable description.
    pub fn from_spec(spec: LevelSpec) -> Result<Self> {
        let mut level = Level::new(spec.name);
        for zone in spec.zones {
            level.add_zone(zone.length, zone.kind);
        }
        for (name, event) in spec.events {
            level.add_event(name, event);
        }
        for rule in &spec.rules {
            if let RuleSpec::Input { input, .. } = rule {
                if !(1..=2).contains(input) {
                    return Err(VelodromeError::config(
                        format!("level '{}'", level.name),
                        format!("input rule uses input {input}, expected 1 or 2"),
                    ));
                }
            }
            level.add_rule(rule.build())?;
        }
        level.validate()?;
        Ok(level)
    }

    /// Load a level from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: LevelSpec = serde_yaml_ng::from_str(yaml)?;
        Self::from_spec(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_tile_contiguously() {
        let mut level = Level::new("test");
        level.add_zone(100.0, "neutral");
        level.add_zone(50.0, "aversive");
        level.add_zone(25.0, "neutral");
        assert_eq!(level.zones[1].begin(), 100.0);
        assert_eq!(level.zones[2].begin(), 150.0);
        assert_eq!(level.length(), 175.0);
        assert_eq!(level.zones_of_kind("neutral").count(), 2);
    }

    #[test]
    fn rules_must_reference_registered_events() {
        let mut level = Level::new("test");
        level.add_zone(100.0, "neutral");
        let err = level.add_rule(Rule::zone("missing", "neutral", Duration::ZERO)).unwrap_err();
        assert!(matches!(err, VelodromeError::Config { .. }));

        level.add_event("tp", EventSpec::Teleport { target: 0.0 });
        level.add_rule(Rule::zone("tp", "neutral", Duration::ZERO)).unwrap();
    }

    #[test]
    fn validate_rejects_empty_and_degenerate_levels() {
        let level = Level::new("empty");
        assert!(level.validate().is_err());

        let mut level = Level::new("degenerate");
        level.add_zone(0.0, "neutral");
        assert!(level.validate().is_err());
    }

    #[test]
    fn validate_rejects_unreachable_random_teleports() {
        let mut level = Level::new("test");
        level.add_zone(100.0, "neutral");
        level.add_event("rtp", EventSpec::RandomTeleport { zone_kinds: vec!["reward".into()] });
        assert!(level.validate().is_err());
    }

    #[test]
    fn level_loads_from_yaml() {
        let yaml = r#"
name: training-1
zones:
  - { length: 1200, kind: neutral }
  - { length: 800, kind: aversive }
events:
  escape:
    random_teleport: { zone_kinds: [neutral] }
  puff:
    start_burst: { port: 2, on_time: 0.2, pause_time: 0.8 }
rules:
  - zone: { event: escape, kind: aversive, delay: 2.0 }
  - speed: { event: puff, comparison: above, threshold: 40, bin: 100 }
"#;
        let level = Level::from_yaml(yaml).unwrap();
        assert_eq!(level.name, "training-1");
        assert_eq!(level.zones.len(), 2);
        assert_eq!(level.zones[1].begin(), 1200.0);
        assert_eq!(level.events.len(), 2);
        assert_eq!(level.rules.len(), 2);
    }

    #[test]
    fn yaml_rejects_bad_input_number() {
        let yaml = r#"
name: bad
zones:
  - { length: 100, kind: neutral }
events:
  note:
    print: { message: hi }
rules:
  - input: { event: note, input: 3, edge: rising }
"#;
        assert!(Level::from_yaml(yaml).is_err());
    }

    #[test]
    fn spec_roundtrips_through_yaml() {
        let spec = LevelSpec {
            name: "rt".into(),
            zones: vec![ZoneSpec { length: 10.0, kind: "a".into() }],
            events: HashMap::from([(
                "e".to_string(),
                EventSpec::Pause { position: Some(5.0) },
            )]),
            rules: vec![RuleSpec::KeyPress { event: "e".into(), key: 'p' }],
        };
        let yaml = serde_yaml_ng::to_string(&spec).unwrap();
        let back: LevelSpec = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, spec);
    }
}
