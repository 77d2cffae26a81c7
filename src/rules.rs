//! Composable cutoff predicates evaluated against a point-value snapshot
//!
//! A rule tree is built once at setup and evaluated every poll cycle with a
//! single monotonic `now`, so all nodes in a cycle agree on the time. The
//! only mutable state is [`Period`]'s edge memory; everything else is a pure
//! function of the snapshot.
//!
//! Evaluation never fails: a leaf over a stale or missing value reports
//! "condition not met" (false) so one dead device cannot stall the loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::registry::{PointId, Value};

/// One point sample in a cycle's snapshot.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub value: Value,
    /// Carried over from an earlier cycle because the device did not answer.
    pub stale: bool,
}

/// Read-only view of the point values gathered at the top of a poll cycle.
#[derive(Default)]
pub struct Snapshot {
    samples: HashMap<PointId, Sample>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot::default()
    }

    pub fn insert(&mut self, id: PointId, value: Value, stale: bool) {
        self.samples.insert(id, Sample { value, stale });
    }

    pub fn get(&self, id: PointId) -> Option<Sample> {
        self.samples.get(&id).copied()
    }

    /// The sample for `id`, unless it is missing or stale.
    pub fn fresh(&self, id: PointId) -> Option<Value> {
        self.samples
            .get(&id)
            .filter(|sample| !sample.stale)
            .map(|sample| sample.value)
    }
}

/// Edge memory for [`Rule::Period`], owned by its node.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeriodState {
    last_edge: Option<Instant>,
    source_was_true: bool,
}

/// A node in the rule tree.
#[derive(Debug)]
pub enum Rule {
    /// A boolean point is on.
    Active(PointId),
    /// An analog point equals a value exactly.
    Equals(PointId, i32),
    /// An analog point lies *outside* the given bounds. An absent bound is
    /// unbounded on that side; boundary values count as in range.
    Range {
        point: PointId,
        low: Option<i32>,
        high: Option<i32>,
    },
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    /// True while the elapsed time since the most recent rising edge of
    /// `source` lies in `[start, stop)`. A new edge re-arms the window.
    Period {
        source: Box<Rule>,
        start: Duration,
        stop: Duration,
        state: PeriodState,
    },
}

impl Rule {
    pub fn period(source: Rule, start: Duration, stop: Duration) -> Rule {
        Rule::Period {
            source: Box::new(source),
            start,
            stop,
            state: PeriodState::default(),
        }
    }

    /// Evaluate against the cycle's snapshot and shared clock reading.
    ///
    /// Children are always evaluated in full (no short-circuit), so nested
    /// Period nodes observe every rising edge of their source.
    pub fn evaluate(&mut self, snapshot: &Snapshot, now: Instant) -> bool {
        match self {
            Rule::Active(point) => snapshot.fresh(*point).is_some_and(Value::is_on),
            Rule::Equals(point, value) => snapshot
                .fresh(*point)
                .is_some_and(|v| v.as_analog() == *value),
            Rule::Range { point, low, high } => {
                let Some(value) = snapshot.fresh(*point) else {
                    return false;
                };
                let value = value.as_analog();
                low.is_some_and(|l| value < l) || high.is_some_and(|h| value > h)
            }
            Rule::And(children) => children
                .iter_mut()
                .map(|child| child.evaluate(snapshot, now))
                .fold(true, |acc, result| acc && result),
            Rule::Or(children) => children
                .iter_mut()
                .map(|child| child.evaluate(snapshot, now))
                .fold(false, |acc, result| acc || result),
            Rule::Not(child) => !child.evaluate(snapshot, now),
            Rule::Period {
                source,
                start,
                stop,
                state,
            } => {
                let source_is_true = source.evaluate(snapshot, now);
                if source_is_true && !state.source_was_true {
                    state.last_edge = Some(now);
                }
                state.source_was_true = source_is_true;

                match state.last_edge {
                    Some(edge) => {
                        let elapsed = now.saturating_duration_since(edge);
                        elapsed >= *start && elapsed < *stop
                    }
                    None => false,
                }
            }
        }
    }

    /// Every point this rule (or any child) reads during evaluation.
    pub fn referenced_points(&self, out: &mut Vec<PointId>) {
        match self {
            Rule::Active(point) | Rule::Equals(point, _) => out.push(*point),
            Rule::Range { point, .. } => out.push(*point),
            Rule::And(children) | Rule::Or(children) => {
                for child in children {
                    child.referenced_points(out);
                }
            }
            Rule::Not(child) => child.referenced_points(out),
            Rule::Period { source, .. } => source.referenced_points(out),
        }
    }
}
