//! Schema-tolerant decoding of the station's realtime JSON payload
//!
//! The payload is a fixed set of recognised sections, each independently
//! optional. Which ones are present depends on the hardware model:
//!
//! - `pms`: one to three PM sensor groups (`pms1`..`pms3`) plus a
//!   device-computed `rolling` group; `historic` is ignored
//! - `co2`: a `rolling` stat block, only on models with a CO₂ sensor
//! - `met`: `temperature` / `humidity`, each a stat block or a bare number
//! - `sys`: `vpwr`, `heap`, `alive`, `boot` housekeeping values
//!
//! Only a payload that is not a JSON object, or that has no PM group at all,
//! fails as a whole. Everything else degrades per field.
use log::{debug, warn};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{DecodeError, FieldDecodeWarning};
use crate::models::RawReadingSet;

/// Device key -> channel metric name.
const PM_METRICS: [(&str, &str); 3] = [("pm25", "pm25"), ("pm1", "pm1_0"), ("pm10", "pm10")];
const DEVICE_STATS: [&str; 4] = ["mean", "median", "min", "max"];

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default, deserialize_with = "section")]
    pms: Option<PmsSection>,
    #[serde(default, deserialize_with = "section")]
    co2: Option<Co2Section>,
    #[serde(default, deserialize_with = "section")]
    met: Option<MetSection>,
    #[serde(default, deserialize_with = "section")]
    sys: Option<SysSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PmsSection {
    #[serde(default, deserialize_with = "section")]
    pms1: Option<PmGroup>,
    #[serde(default, deserialize_with = "section")]
    pms2: Option<PmGroup>,
    #[serde(default, deserialize_with = "section")]
    pms3: Option<PmGroup>,
    #[serde(default, deserialize_with = "section")]
    rolling: Option<PmGroup>,
}

impl PmsSection {
    fn groups(&self) -> impl Iterator<Item = (usize, &PmGroup)> {
        [&self.pms1, &self.pms2, &self.pms3]
            .into_iter()
            .enumerate()
            .filter_map(|(i, group)| group.as_ref().map(|g| (i + 1, g)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct PmGroup {
    #[serde(default, deserialize_with = "section")]
    pm25: Option<StatBlock>,
    #[serde(default, deserialize_with = "section")]
    pm1: Option<StatBlock>,
    #[serde(default, deserialize_with = "section")]
    pm10: Option<StatBlock>,
}

impl PmGroup {
    fn block(&self, device_key: &str) -> Option<&StatBlock> {
        match device_key {
            "pm25" => self.pm25.as_ref(),
            "pm1" => self.pm1.as_ref(),
            "pm10" => self.pm10.as_ref(),
            _ => None,
        }
    }
}

/// Raw JSON values are kept so a wrongly-typed field drops only itself.
#[derive(Debug, Default, Deserialize)]
struct StatBlock {
    latest: Option<Value>,
    mean: Option<Value>,
    median: Option<Value>,
    min: Option<Value>,
    max: Option<Value>,
}

impl StatBlock {
    fn stat(&self, name: &str) -> Option<&Value> {
        match name {
            "latest" => self.latest.as_ref(),
            "mean" => self.mean.as_ref(),
            "median" => self.median.as_ref(),
            "min" => self.min.as_ref(),
            "max" => self.max.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Co2Section {
    #[serde(default, deserialize_with = "section")]
    rolling: Option<StatBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct MetSection {
    temperature: Option<Value>,
    humidity: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct SysSection {
    vpwr: Option<Value>,
    heap: Option<Value>,
    alive: Option<Value>,
    boot: Option<Value>,
}

/// Deserialize a sub-object, treating anything that isn't an object as absent.
fn section<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if !value.is_object() {
        return Ok(None);
    }
    Ok(serde_json::from_value(value).ok())
}

/// Physically plausible bounds per measurement.
#[derive(Debug, Clone, Copy)]
enum Range {
    Concentration,
    Co2,
    Humidity,
    Temperature,
    NonNegative,
}

impl Range {
    fn check(self, value: f64) -> Result<f64, String> {
        let (lo, hi) = match self {
            Range::Concentration | Range::NonNegative => (0.0, f64::MAX),
            Range::Co2 => (0.0, 10_000.0),
            Range::Humidity => (0.0, 100.0),
            Range::Temperature => (-50.0, 80.0),
        };
        if !value.is_finite() {
            Err("not a finite number".to_string())
        } else if value < lo || value > hi {
            Err(format!("{} outside plausible range", value))
        } else {
            Ok(value)
        }
    }
}

/// Accumulates values and per-field warnings for one payload.
struct Collector {
    out: RawReadingSet,
}

impl Collector {
    fn number(&mut self, path: &str, channel_id: String, value: Option<&Value>, range: Range) {
        let value = match value {
            None | Some(Value::Null) => return,
            Some(value) => value,
        };
        let checked = value
            .as_f64()
            .ok_or_else(|| format!("expected a number, got {}", value))
            .and_then(|v| range.check(v));
        match checked {
            Ok(v) => self.out.insert(channel_id, v),
            Err(reason) => {
                let warning = FieldDecodeWarning::new(path, channel_id, reason);
                warn!("{}", warning);
                self.out.warnings.push(warning);
            }
        }
    }

    /// `latest` becomes `base`; device aggregates get `{base}_device_{stat}`.
    fn stat_block(&mut self, path: &str, base: &str, block: &StatBlock, range: Range) {
        self.number(&format!("{}.latest", path), base.to_string(), block.latest.as_ref(), range);
        for stat in DEVICE_STATS {
            self.number(
                &format!("{}.{}", path, stat),
                format!("{}_device_{}", base, stat),
                block.stat(stat),
                range,
            );
        }
    }

    fn met(&mut self, name: &str, value: Option<&Value>, range: Range) {
        let path = format!("met.{}", name);
        match value {
            Some(Value::Object(_)) => {
                let block = value
                    .cloned()
                    .and_then(|v| serde_json::from_value::<StatBlock>(v).ok())
                    .unwrap_or_default();
                self.stat_block(&path, name, &block, range);
            }
            other => self.number(&path, name.to_string(), other, range),
        }
    }
}

/// Decode one raw payload into a flat, range-checked reading set.
pub fn decode(bytes: &[u8]) -> Result<RawReadingSet, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::Malformed(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(DecodeError::Malformed(format!(
            "expected a JSON object at top level, got {}",
            json_type(&value)
        )));
    }
    let payload: Payload =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let pms = payload
        .pms
        .as_ref()
        .filter(|pms| pms.groups().next().is_some())
        .ok_or_else(|| DecodeError::Malformed("no PM sensor group present".to_string()))?;

    let mut collector = Collector {
        out: RawReadingSet::default(),
    };

    for (index, group) in pms.groups() {
        collector.out.pm_groups += 1;
        for (device_key, metric) in PM_METRICS {
            if let Some(block) = group.block(device_key) {
                collector.stat_block(
                    &format!("pms.pms{}.{}", index, device_key),
                    &format!("pm{}_{}", index, metric),
                    block,
                    Range::Concentration,
                );
            }
        }
    }

    if let Some(rolling) = &pms.rolling {
        for (device_key, metric) in PM_METRICS {
            if let Some(block) = rolling.block(device_key) {
                let path = format!("pms.rolling.{}", device_key);
                collector.number(
                    &format!("{}.latest", path),
                    format!("{}_rolling", metric),
                    block.latest.as_ref(),
                    Range::Concentration,
                );
                collector.number(
                    &format!("{}.mean", path),
                    format!("{}_rolling_mean", metric),
                    block.mean.as_ref(),
                    Range::Concentration,
                );
            }
        }
    }

    if let Some(block) = payload.co2.as_ref().and_then(|co2| co2.rolling.as_ref()) {
        collector.stat_block("co2.rolling", "co2", block, Range::Co2);
    }

    if let Some(met) = &payload.met {
        collector.met("temperature", met.temperature.as_ref(), Range::Temperature);
        collector.met("humidity", met.humidity.as_ref(), Range::Humidity);
    }

    if let Some(sys) = &payload.sys {
        let fields = [
            ("sys.vpwr", "voltage", &sys.vpwr),
            ("sys.heap", "free_heap", &sys.heap),
            ("sys.alive", "uptime", &sys.alive),
            ("sys.boot", "boot_count", &sys.boot),
        ];
        for (path, channel_id, value) in fields {
            collector.number(path, channel_id.to_string(), value.as_ref(), Range::NonNegative);
        }
    }

    debug!(
        "Decoded {} values from {} PM group(s), {} field(s) dropped",
        collector.out.len(),
        collector.out.pm_groups,
        collector.out.warnings.len()
    );
    Ok(collector.out)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
