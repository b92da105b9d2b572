use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::error::FieldDecodeWarning;

/// Stable channel key, e.g. `pm1_pm25`, `co2`, `uptime`.
pub type ChannelId = String;

/// One raw value produced by one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub channel_id: ChannelId,
    pub raw_value: f64,
    pub timestamp: OffsetDateTime,
}

/// Flat, validated output of the payload decoder.
#[derive(Debug, Clone, Default)]
pub struct RawReadingSet {
    pub values: BTreeMap<ChannelId, f64>,
    /// Number of PM sensor groups present in the payload.
    pub pm_groups: usize,
    pub warnings: Vec<FieldDecodeWarning>,
}

impl RawReadingSet {
    pub fn insert(&mut self, channel_id: impl Into<ChannelId>, value: f64) {
        self.values.insert(channel_id.into(), value);
    }

    pub fn get(&self, channel_id: &str) -> Option<f64> {
        self.values.get(channel_id).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stamp every value with the poll time.
    pub fn readings(&self, timestamp: OffsetDateTime) -> impl Iterator<Item = Reading> + '_ {
        self.values.iter().map(move |(id, value)| Reading {
            channel_id: id.clone(),
            raw_value: *value,
            timestamp,
        })
    }
}

/// What a channel's value means, and therefore which statistics apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Physical measurement; gets window statistics and a rolling average.
    Instantaneous,
    /// Aggregate already computed by the device; passed through as-is.
    StatisticalDerivative,
    /// Counter or housekeeping value; latest only.
    Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericType {
    Float,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    EnabledByDefault,
    DisabledByDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// A logical measurement stream. Immutable once registered.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub unit: Option<&'static str>,
    pub kind: ChannelKind,
    pub numeric: NumericType,
    pub visibility: Visibility,
    pub state_class: StateClass,
}

impl Channel {
    pub fn is_enabled_by_default(&self) -> bool {
        self.visibility == Visibility::EnabledByDefault
    }
}

/// Mean/min/max/median over the current rolling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub samples: usize,
}

/// Current output for one channel.
///
/// `window` and `rolling` are only set for instantaneous channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub latest: f64,
    pub updated_at: OffsetDateTime,
    pub window: Option<WindowSummary>,
    pub rolling: Option<f64>,
}

/// Full published output of a poll cycle. Replaced wholesale, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub taken_at: OffsetDateTime,
    pub channels: BTreeMap<ChannelId, ChannelStats>,
}

impl DeviceSnapshot {
    pub fn empty(taken_at: OffsetDateTime) -> Self {
        Self {
            taken_at,
            channels: BTreeMap::new(),
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<&ChannelStats> {
        self.channels.get(channel_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHealth {
    pub consecutive_failures: u32,
    pub last_success: Option<OffsetDateTime>,
    pub last_failure: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub available: bool,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            available: true,
        }
    }

    pub fn record_success(&mut self, at: OffsetDateTime) {
        self.consecutive_failures = 0;
        self.last_success = Some(at);
        self.available = true;
    }

    /// Returns true when this failure flips the station to unavailable.
    pub fn record_failure(&mut self, at: OffsetDateTime, error: String, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(at);
        self.last_error = Some(error);
        let was_available = self.available;
        if self.consecutive_failures >= threshold {
            self.available = false;
        }
        was_available && !self.available
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_goes_unavailable_at_threshold_and_recovers() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut health = ConnectionHealth::new();

        assert!(!health.record_failure(now, "a".into(), 3));
        assert!(!health.record_failure(now, "b".into(), 3));
        assert!(health.available);
        assert!(health.record_failure(now, "c".into(), 3));
        assert!(!health.available);
        assert!(!health.record_failure(now, "d".into(), 3));
        assert_eq!(health.consecutive_failures, 4);
        assert_eq!(health.last_error.as_deref(), Some("d"));

        health.record_success(now);
        assert!(health.available);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.last_success, Some(now));
    }
}
