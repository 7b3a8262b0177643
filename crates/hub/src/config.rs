//! TOML config file loading, validation, and database seeding for zones,
//! devices, sensors, plants and watering schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use time::UtcOffset;
use tracing::{info, warn};

use crate::db::{Db, NewPlant};
use crate::model::{validate_day_of_week, ScheduleTime, Threshold};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Seconds between schedule sweeps.
    pub sweep_interval_sec: u64,
    /// Offset of the wall clock schedules are written in.
    pub utc_offset_minutes: i32,
    /// Default look-back for plant health reports.
    pub health_window_days: i64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            sweep_interval_sec: 60,
            utc_offset_minutes: 0,
            health_window_days: 7,
        }
    }
}

impl HubSettings {
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_sec)
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60)
            .with_context(|| format!("invalid utc_offset_minutes {}", self.utc_offset_minutes))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub device_id: String,
    pub index: i64,
    pub name: Option<String>,
    pub min_moisture: Option<f64>,
    pub max_moisture: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct SensorRef {
    pub device_id: String,
    pub index: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub name: String,
    pub species: Option<String>,
    pub location: Option<String>,
    pub owner: Option<String>,
    pub zone: Option<String>,
    pub sensor: Option<SensorRef>,
    pub moisture_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub plant: String,
    pub day_of_week: i64,
    pub time: String,
    pub duration: f64,
    pub amount: f64,
}

/// Largest offset `time` accepts is ±25:59:59; real zones stay within these.
const MIN_OFFSET_MINUTES: i32 = -12 * 60;
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_plants(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let h = &self.hub;
        if h.sweep_interval_sec == 0 {
            errors.push("hub: sweep_interval_sec must be positive".to_string());
        }
        if !(MIN_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&h.utc_offset_minutes) {
            errors.push(format!(
                "hub: utc_offset_minutes {} out of range [{MIN_OFFSET_MINUTES}, {MAX_OFFSET_MINUTES}]",
                h.utc_offset_minutes
            ));
        }
        if h.health_window_days <= 0 {
            errors.push(format!(
                "hub: health_window_days must be positive, got {}",
                h.health_window_days
            ));
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, z) in self.zones.iter().enumerate() {
            if z.name.trim().is_empty() {
                errors.push(format!("zones[{i}]: name is empty"));
            } else if !seen.insert(&z.name) {
                errors.push(format!("zone '{}': duplicate name", z.name));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, d) in self.devices.iter().enumerate() {
            if d.device_id.trim().is_empty() {
                errors.push(format!("devices[{i}]: device_id is empty"));
            } else if !seen.insert(&d.device_id) {
                errors.push(format!("device '{}': duplicate device_id", d.device_id));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let device_ids: HashSet<&str> = self.devices.iter().map(|d| d.device_id.as_str()).collect();
        let mut seen: HashSet<(&str, i64)> = HashSet::new();

        for s in &self.sensors {
            let ctx = format!("sensor '{}/{}'", s.device_id, s.index);

            if !device_ids.contains(s.device_id.as_str()) {
                errors.push(format!(
                    "{ctx}: device_id '{}' does not match any defined device",
                    s.device_id
                ));
            }
            if s.index < 0 {
                errors.push(format!("{ctx}: index must not be negative"));
            }
            if !seen.insert((s.device_id.as_str(), s.index)) {
                errors.push(format!("{ctx}: duplicate sensor"));
            }

            let threshold = Threshold::Range {
                min_moisture: s.min_moisture,
                max_moisture: s.max_moisture,
            };
            if let Err(e) = threshold.validate() {
                errors.push(format!("{ctx}: {e}"));
            }
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let zone_names: HashSet<&str> = self.zones.iter().map(|z| z.name.as_str()).collect();
        let sensors: HashSet<(&str, i64)> = self
            .sensors
            .iter()
            .map(|s| (s.device_id.as_str(), s.index))
            .collect();
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_sensors: HashSet<&SensorRef> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.name.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.name)
                }
            };

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&p.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if let Some(zone) = &p.zone {
                if !zone_names.contains(zone.as_str()) {
                    errors.push(format!(
                        "{}: zone '{zone}' does not match any defined zone",
                        ctx()
                    ));
                }
            }

            if let Some(sr) = &p.sensor {
                if !sensors.contains(&(sr.device_id.as_str(), sr.index)) {
                    errors.push(format!(
                        "{}: sensor '{}/{}' does not match any defined sensor",
                        ctx(),
                        sr.device_id,
                        sr.index
                    ));
                } else if !seen_sensors.insert(sr) {
                    errors.push(format!(
                        "{}: sensor '{}/{}' is already bound to another plant",
                        ctx(),
                        sr.device_id,
                        sr.index
                    ));
                }
            }

            if let Some(moisture_threshold) = p.moisture_threshold {
                if let Err(e) = (Threshold::Cutoff { moisture_threshold }).validate() {
                    errors.push(format!("{}: {e}", ctx()));
                }
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let plant_names: HashSet<&str> = self.plants.iter().map(|p| p.name.as_str()).collect();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = format!("schedules[{i}] (plant '{}')", s.plant);

            if !plant_names.contains(s.plant.as_str()) {
                errors.push(format!("{ctx}: plant does not match any defined plant"));
            }
            if let Err(e) = validate_day_of_week(s.day_of_week) {
                errors.push(format!("{ctx}: {e}"));
            }
            if let Err(e) = ScheduleTime::parse(&s.time) {
                errors.push(format!("{ctx}: {e}"));
            }
            if !(s.duration > 0.0) {
                errors.push(format!("{ctx}: duration must be positive, got {}", s.duration));
            }
            if !(s.amount > 0.0) {
                errors.push(format!("{ctx}: amount must be positive, got {}", s.amount));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// default (empty) config.
pub fn load(path: &str) -> Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path, "config file not found, using defaults");
            return Ok(Config::default());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert everything the config declares into the database. Safe to run on
/// every start: existing rows are updated, schedules are not duplicated.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let mut zone_ids: HashMap<&str, i64> = HashMap::new();
    for z in &config.zones {
        let id = db
            .upsert_zone(&z.name, z.description.as_deref())
            .await
            .with_context(|| format!("failed to upsert zone '{}'", z.name))?;
        zone_ids.insert(&z.name, id);
    }

    let mut device_ids: HashMap<&str, i64> = HashMap::new();
    for d in &config.devices {
        let id = db
            .upsert_device(&d.device_id, d.name.as_deref())
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.device_id))?;
        device_ids.insert(&d.device_id, id);
    }

    let mut sensor_ids: HashMap<(&str, i64), i64> = HashMap::new();
    for s in &config.sensors {
        let ctx = || format!("failed to upsert sensor '{}/{}'", s.device_id, s.index);
        let device = *device_ids
            .get(s.device_id.as_str())
            .with_context(|| format!("{}: unknown device", ctx()))?;
        let id = db
            .upsert_sensor(device, s.index, s.name.as_deref())
            .await
            .with_context(ctx)?;
        if s.min_moisture.is_some() || s.max_moisture.is_some() {
            db.set_threshold(id, s.min_moisture, s.max_moisture)
                .await
                .with_context(ctx)?;
        }
        sensor_ids.insert((s.device_id.as_str(), s.index), id);
    }

    let mut plant_ids: HashMap<&str, i64> = HashMap::new();
    for p in &config.plants {
        let zone_id = p.zone.as_deref().and_then(|z| zone_ids.get(z).copied());
        let sensor_id = p
            .sensor
            .as_ref()
            .and_then(|sr| sensor_ids.get(&(sr.device_id.as_str(), sr.index)).copied());
        let id = db
            .upsert_plant(&NewPlant {
                name: p.name.clone(),
                species: p.species.clone(),
                location: p.location.clone(),
                owner: p.owner.clone(),
                zone_id,
                sensor_id,
                moisture_threshold: p.moisture_threshold,
            })
            .await
            .with_context(|| format!("failed to upsert plant '{}'", p.name))?;
        plant_ids.insert(&p.name, id);
    }

    let mut new_schedules = 0usize;
    for s in &config.schedules {
        let ctx = || format!("failed to add schedule for plant '{}'", s.plant);
        let plant = *plant_ids
            .get(s.plant.as_str())
            .with_context(|| format!("{}: unknown plant", ctx()))?;
        let day = validate_day_of_week(s.day_of_week).with_context(ctx)?;
        let time = ScheduleTime::parse(&s.time).with_context(ctx)?;

        if db.schedule_exists(plant, day, &time).await.with_context(ctx)? {
            continue;
        }
        db.insert_schedule(plant, day, &time, s.duration, s.amount)
            .await
            .with_context(ctx)?;
        new_schedules += 1;
    }

    info!(
        zones = config.zones.len(),
        devices = config.devices.len(),
        sensors = config.sensors.len(),
        plants = config.plants.len(),
        new_schedules,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
