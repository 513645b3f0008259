//! Pairs start/end events of a sorted trace into per-layer spans.

use std::collections::{HashMap, VecDeque};

use itertools::Itertools;
use serde::Serialize;

use crate::trace::{Boundary, Phase, TraceEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Span {
    pub layer: String,
    pub phase: Phase,
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl Span {
    pub fn duration(&self) -> Option<u64> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(e.saturating_sub(s)),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceSummary {
    /// In order of each span's first event.
    pub spans: Vec<Span>,
    /// Lines whose label is not a `<phase> <boundary> <layer>` label.
    pub unlabeled: usize,
}

impl TraceSummary {
    pub fn incomplete(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(|s| !s.is_complete())
    }

    /// Layers in the order their backward pass started.
    pub fn backward_order(&self) -> Vec<&str> {
        self.spans
            .iter()
            .filter(|s| s.phase == Phase::Backward && s.start.is_some())
            .sorted_by_key(|s| s.start)
            .map(|s| s.layer.as_str())
            .dedup()
            .collect()
    }

    /// Total duration per `(phase, layer)` over complete spans.
    pub fn totals(&self) -> Vec<(Phase, &str, u64)> {
        self.spans
            .iter()
            .filter_map(|s| s.duration().map(|d| ((s.phase, s.layer.as_str()), d)))
            .into_grouping_map()
            .sum()
            .into_iter()
            .map(|((phase, layer), d)| (phase, layer, d))
            .sorted()
            .collect()
    }
}

/// Matches each end with the oldest open start of the same `(phase, layer)`.
/// An end with no open start becomes an end-only span.
pub fn summarize(events: &[TraceEvent]) -> TraceSummary {
    let mut summary = TraceSummary::default();
    let mut open: HashMap<(Phase, String), VecDeque<usize>> = HashMap::new();

    for event in events {
        let Some(label) = event.parsed_label() else {
            summary.unlabeled += 1;
            continue;
        };
        let key = (label.phase, label.layer);
        match label.boundary {
            Boundary::Start => {
                open.entry(key.clone()).or_default().push_back(summary.spans.len());
                summary.spans.push(Span {
                    layer: key.1,
                    phase: key.0,
                    start: Some(event.timestamp),
                    end: None,
                });
            }
            Boundary::End => match open.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(idx) => summary.spans[idx].end = Some(event.timestamp),
                None => summary.spans.push(Span {
                    layer: key.1,
                    phase: key.0,
                    start: None,
                    end: Some(event.timestamp),
                }),
            },
        }
    }
    summary
}
