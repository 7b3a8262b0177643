//! Domain records shared by the evaluators, the database layer and the HTTP
//! API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::macros::format_description;
use time::{OffsetDateTime, Time};

pub type PlantId = i64;
pub type SensorId = i64;

/// Readings are percentages; anything outside this range is rejected at
/// ingestion.
pub const MOISTURE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invalid configuration supplied by a caller (config file or API request).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError(pub String);

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigurationError {}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Moisture bound(s) a reading is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Threshold {
    /// Sensor-level window. Either bound may be absent.
    Range {
        min_moisture: Option<f64>,
        max_moisture: Option<f64>,
    },
    /// Plant-level single cutoff. Only the low side is checked.
    Cutoff { moisture_threshold: f64 },
}

impl Threshold {
    /// The value below which a plant counts as too dry, if any.
    pub fn floor(&self) -> Option<f64> {
        match *self {
            Threshold::Range { min_moisture, .. } => min_moisture,
            Threshold::Cutoff { moisture_threshold } => Some(moisture_threshold),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let check = |name: &str, v: f64| {
            if MOISTURE_RANGE.contains(&v) {
                Ok(())
            } else {
                Err(ConfigurationError(format!(
                    "{name} {v} out of range [0, 100]"
                )))
            }
        };
        match *self {
            Threshold::Range {
                min_moisture,
                max_moisture,
            } => {
                if let Some(min) = min_moisture {
                    check("min_moisture", min)?;
                }
                if let Some(max) = max_moisture {
                    check("max_moisture", max)?;
                }
                if let (Some(min), Some(max)) = (min_moisture, max_moisture) {
                    if min > max {
                        return Err(ConfigurationError(format!(
                            "min_moisture ({min}) must not exceed max_moisture ({max})"
                        )));
                    }
                }
                Ok(())
            }
            Threshold::Cutoff { moisture_threshold } => {
                check("moisture_threshold", moisture_threshold)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Readings + alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: i64,
    pub sensor_id: SensorId,
    pub moisture: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowMoisture,
    HighMoisture,
    SystemError,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LowMoisture => "low_moisture",
            AlertKind::HighMoisture => "high_moisture",
            AlertKind::SystemError => "system_error",
        }
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_moisture" => Ok(AlertKind::LowMoisture),
            "high_moisture" => Ok(AlertKind::HighMoisture),
            "system_error" => Ok(AlertKind::SystemError),
            _ => Err(format!("unknown alert kind '{s}'")),
        }
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum AlertSource {
    Sensor(SensorId),
    Plant(PlantId),
}

impl AlertSource {
    pub fn kind_str(&self) -> &'static str {
        match self {
            AlertSource::Sensor(_) => "sensor",
            AlertSource::Plant(_) => "plant",
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            AlertSource::Sensor(id) | AlertSource::Plant(id) => id,
        }
    }
}

/// An alert proposed by the threshold evaluator, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertDraft {
    pub kind: AlertKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: i64,
    pub source: AlertSource,
    pub kind: AlertKind,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub resolved: bool,
}

// ---------------------------------------------------------------------------
// Watering
// ---------------------------------------------------------------------------

/// Zero-padded 24-hour `HH:MM`. Ordering is the string ordering, which for
/// this format matches chronological order within a day.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleTime(String);

impl ScheduleTime {
    pub fn parse(s: &str) -> Result<Self, ConfigurationError> {
        let bad = |why: String| ConfigurationError(format!("time '{s}' is not a valid HH:MM value: {why}"));

        // Kept as text, so it has to be zero-padded for ordering to hold.
        if s.len() != 5 {
            return Err(bad("expected 5 characters".to_string()));
        }
        Time::parse(s, format_description!("[hour]:[minute]")).map_err(|e| bad(e.to_string()))?;
        Ok(Self(s.to_string()))
    }

    /// Wall-clock `HH:MM` of `t` in its own offset.
    pub fn of(t: OffsetDateTime) -> Self {
        Self(format!("{:02}:{:02}", t.hour(), t.minute()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ScheduleTime {
    type Error = ConfigurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ScheduleTime::parse(&s)
    }
}

impl From<ScheduleTime> for String {
    fn from(t: ScheduleTime) -> Self {
        t.0
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 0 = Monday .. 6 = Sunday.
pub fn validate_day_of_week(day: i64) -> Result<u8, ConfigurationError> {
    u8::try_from(day)
        .ok()
        .filter(|d| *d <= 6)
        .ok_or_else(|| ConfigurationError(format!("day_of_week {day} out of range [0, 6]")))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringSchedule {
    pub id: i64,
    pub plant_id: PlantId,
    pub day_of_week: u8,
    pub time: ScheduleTime,
    /// Seconds.
    pub duration: f64,
    /// Millilitres.
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringEvent {
    pub id: i64,
    pub plant_id: PlantId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub duration: f64,
    pub amount: f64,
    pub is_automatic: bool,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub name: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: SensorId,
    pub device_id: i64,
    /// Channel index on the device.
    pub index: i64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plant {
    pub id: PlantId,
    pub name: String,
    pub species: Option<String>,
    pub location: Option<String>,
    pub owner: Option<String>,
    pub zone_id: Option<i64>,
    pub sensor_id: Option<SensorId>,
    pub moisture_threshold: Option<f64>,
}

impl Plant {
    pub fn threshold(&self) -> Option<Threshold> {
        self.moisture_threshold
            .map(|moisture_threshold| Threshold::Cutoff { moisture_threshold })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}
