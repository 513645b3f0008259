//! Trace events and the labels the instrumentation emits.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Forward,
    Backward,
    Optimizer,
}

impl Phase {
    pub fn short_name(&self) -> &'static str {
        match self {
            Phase::Forward => "forward",
            Phase::Backward => "backward",
            Phase::Optimizer => "optimizer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Boundary {
    Start,
    End,
}

impl Boundary {
    pub fn short_name(&self) -> &'static str {
        match self {
            Boundary::Start => "start",
            Boundary::End => "end",
        }
    }
}

/// `<phase> <boundary> <layer>`, e.g. `forward start fc1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventLabel {
    pub phase: Phase,
    pub boundary: Boundary,
    pub layer: String,
}

impl EventLabel {
    pub fn new(phase: Phase, boundary: Boundary, layer: impl ToString) -> Self {
        Self {
            phase,
            boundary,
            layer: layer.to_string(),
        }
    }

    pub fn forward_start(layer: impl ToString) -> Self {
        Self::new(Phase::Forward, Boundary::Start, layer)
    }

    pub fn forward_end(layer: impl ToString) -> Self {
        Self::new(Phase::Forward, Boundary::End, layer)
    }

    pub fn backward_start(layer: impl ToString) -> Self {
        Self::new(Phase::Backward, Boundary::Start, layer)
    }

    pub fn backward_end(layer: impl ToString) -> Self {
        Self::new(Phase::Backward, Boundary::End, layer)
    }
}

impl fmt::Display for EventLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.phase.short_name(),
            self.boundary.short_name(),
            self.layer
        )
    }
}

impl FromStr for EventLabel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ' ');
        let phase = match parts.next() {
            Some("forward") => Phase::Forward,
            Some("backward") => Phase::Backward,
            Some("optimizer") => Phase::Optimizer,
            _ => return Err(()),
        };
        let boundary = match parts.next() {
            Some("start") => Boundary::Start,
            Some("end") => Boundary::End,
            _ => return Err(()),
        };
        match parts.next() {
            Some(layer) if !layer.is_empty() => Ok(Self::new(phase, boundary, layer)),
            _ => Err(()),
        }
    }
}

/// One recorded timestamp. `seq` is the insertion position within the session and
/// breaks ties between equal timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: u64,
    pub seq: u64,
    pub label: String,
}

impl TraceEvent {
    pub fn parsed_label(&self) -> Option<EventLabel> {
        self.label.parse().ok()
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.timestamp, self.label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceLog {
    events: Vec<TraceEvent>,
}

impl TraceLog {
    pub fn new(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sorts by `(timestamp, seq)`; program order among equal timestamps is kept.
    pub fn sort(&mut self) {
        self.events.sort_by_key(|e| (e.timestamp, e.seq));
    }

    pub fn lines(&self) -> Vec<String> {
        self.events.iter().map(ToString::to_string).collect()
    }

    pub fn count_label(&self, label: &str) -> usize {
        self.events.iter().filter(|e| e.label == label).count()
    }
}

impl FromIterator<TraceEvent> for TraceLog {
    fn from_iter<T: IntoIterator<Item = TraceEvent>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
