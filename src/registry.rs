//! Discovery of the channels a specific station actually supports.
//!
//! The first successfully decoded payload defines the channel set for the
//! whole session. After that the set is frozen: ids that show up later are
//! logged and ignored so the consumer's entity set never churns.

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{
    Channel, ChannelId, ChannelKind, NumericType, RawReadingSet, StateClass, Visibility,
};

const MICROGRAMS_PER_CUBIC_METER: &str = "µg/m³";

/// (channel id, display name, unit, numeric type, state class)
const DIAGNOSTICS: [(&str, &str, Option<&str>, NumericType, StateClass); 4] = [
    ("voltage", "Supply Voltage", Some("mV"), NumericType::Float, StateClass::Measurement),
    ("free_heap", "Free Heap Memory", Some("B"), NumericType::Integer, StateClass::Measurement),
    ("uptime", "Uptime", Some("s"), NumericType::Integer, StateClass::TotalIncreasing),
    ("boot_count", "Boot Count", None, NumericType::Integer, StateClass::TotalIncreasing),
];

fn pm_label(metric: &str) -> Option<&'static str> {
    match metric {
        "pm25" => Some("PM2.5"),
        "pm1_0" => Some("PM1.0"),
        "pm10" => Some("PM10"),
        _ => None,
    }
}

/// Display name and unit of a base measurement id (no aggregate suffix).
fn measurement(base: &str) -> Option<(String, &'static str)> {
    match base {
        "co2" => return Some(("CO₂".to_string(), "ppm")),
        "temperature" => return Some(("Temperature".to_string(), "°C")),
        "humidity" => return Some(("Humidity".to_string(), "%")),
        _ => {}
    }
    if let Some(label) = pm_label(base) {
        return Some((label.to_string(), MICROGRAMS_PER_CUBIC_METER));
    }

    // pm{group}_{metric}
    let (group, metric) = base.strip_prefix("pm")?.split_once('_')?;
    let group: u8 = group.parse().ok()?;
    let label = pm_label(metric)?;
    Some((format!("PMS{} {}", group, label), MICROGRAMS_PER_CUBIC_METER))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Default metadata for a channel id, inferred from its naming pattern.
pub fn describe(id: &str) -> Channel {
    if let Some(&(_, name, unit, numeric, state_class)) = DIAGNOSTICS.iter().find(|d| d.0 == id) {
        return Channel {
            id: id.to_string(),
            name: name.to_string(),
            unit,
            kind: ChannelKind::Diagnostic,
            numeric,
            visibility: Visibility::DisabledByDefault,
            state_class,
        };
    }

    let (base, suffix, kind) = if let Some((base, stat)) = id.rsplit_once("_device_") {
        (base, format!(" {}", capitalize(stat)), ChannelKind::StatisticalDerivative)
    } else if let Some(base) = id.strip_suffix("_rolling_mean") {
        (base, " Rolling Mean".to_string(), ChannelKind::StatisticalDerivative)
    } else if let Some(base) = id.strip_suffix("_rolling") {
        (base, " Rolling".to_string(), ChannelKind::StatisticalDerivative)
    } else {
        (id, String::new(), ChannelKind::Instantaneous)
    };

    let (name, unit) = match measurement(base) {
        Some((name, unit)) => (format!("{}{}", name, suffix), Some(unit)),
        None => (id.to_string(), None),
    };

    Channel {
        id: id.to_string(),
        name,
        unit,
        kind,
        numeric: NumericType::Float,
        visibility: Visibility::EnabledByDefault,
        state_class: StateClass::Measurement,
    }
}

/// Frozen-after-first-decode set of channels for one session.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<ChannelId, Channel>,
    frozen: bool,
    ignored: BTreeSet<ChannelId>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register channels from a decoded payload; returns the ids created by this call.
    ///
    /// Creates channels only until the first payload naming at least one
    /// channel, including fields that were present but dropped, has been seen.
    pub fn observe(&mut self, raw: &RawReadingSet) -> BTreeSet<ChannelId> {
        let mut created = BTreeSet::new();

        if !self.frozen {
            // Fields dropped as implausible still exist on this device.
            let dropped = raw.warnings.iter().map(|w| &w.channel_id);
            for id in raw.values.keys().chain(dropped) {
                if !self.channels.contains_key(id) {
                    self.channels.insert(id.clone(), describe(id));
                    created.insert(id.clone());
                }
            }
            if !self.channels.is_empty() {
                self.frozen = true;
                info!(
                    "Discovered {} channels across {} PM group(s); channel set frozen",
                    self.channels.len(),
                    raw.pm_groups
                );
            }
            return created;
        }

        for id in raw.values.keys() {
            if self.channels.contains_key(id) {
                continue;
            }
            if self.ignored.insert(id.clone()) {
                warn!("Ignoring unexpected channel {} that appeared after discovery", id);
            } else {
                debug!("Ignoring unexpected channel {}", id);
            }
        }
        created
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    pub fn known(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Channel ids seen after the freeze and dropped.
    pub fn ignored(&self) -> &BTreeSet<ChannelId> {
        &self.ignored
    }
}
