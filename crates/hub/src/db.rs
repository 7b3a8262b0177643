use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, FromRow, Pool, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::model::{
    Alert, AlertDraft, AlertKind, AlertSource, Device, Plant, PlantId, Reading, ScheduleTime,
    Sensor, SensorId, Threshold, WateringEvent, WateringSchedule, Zone,
};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Fields for a new plant. Used by both the API and config seeding.
#[derive(Debug, Clone, Default)]
pub struct NewPlant {
    pub name: String,
    pub species: Option<String>,
    pub location: Option<String>,
    pub owner: Option<String>,
    pub zone_id: Option<i64>,
    pub sensor_id: Option<SensorId>,
    pub moisture_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SystemSummary {
    pub total_plants: i64,
    pub total_sensors: i64,
    pub total_devices: i64,
    pub active_alerts: i64,
}

pub(crate) fn to_datetime(ts: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).with_context(|| format!("invalid unix timestamp {ts}"))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct ZoneRow {
    id: i64,
    name: String,
    description: Option<String>,
}

impl From<ZoneRow> for Zone {
    fn from(r: ZoneRow) -> Self {
        Zone {
            id: r.id,
            name: r.name,
            description: r.description,
        }
    }
}

#[derive(FromRow)]
struct DeviceRow {
    id: i64,
    device_id: String,
    name: Option<String>,
    last_seen: Option<i64>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = anyhow::Error;

    fn try_from(r: DeviceRow) -> Result<Self> {
        Ok(Device {
            id: r.id,
            device_id: r.device_id,
            name: r.name,
            last_seen: r.last_seen.map(to_datetime).transpose()?,
        })
    }
}

#[derive(FromRow)]
struct SensorRow {
    id: i64,
    device_id: i64,
    idx: i64,
    name: Option<String>,
}

impl From<SensorRow> for Sensor {
    fn from(r: SensorRow) -> Self {
        Sensor {
            id: r.id,
            device_id: r.device_id,
            index: r.idx,
            name: r.name,
        }
    }
}

#[derive(FromRow)]
struct PlantRow {
    id: i64,
    name: String,
    species: Option<String>,
    location: Option<String>,
    owner: Option<String>,
    zone_id: Option<i64>,
    sensor_id: Option<i64>,
    moisture_threshold: Option<f64>,
}

impl From<PlantRow> for Plant {
    fn from(r: PlantRow) -> Self {
        Plant {
            id: r.id,
            name: r.name,
            species: r.species,
            location: r.location,
            owner: r.owner,
            zone_id: r.zone_id,
            sensor_id: r.sensor_id,
            moisture_threshold: r.moisture_threshold,
        }
    }
}

#[derive(FromRow)]
struct ReadingRow {
    id: i64,
    ts: i64,
    sensor_id: i64,
    moisture: f64,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = anyhow::Error;

    fn try_from(r: ReadingRow) -> Result<Self> {
        Ok(Reading {
            id: r.id,
            sensor_id: r.sensor_id,
            moisture: r.moisture,
            timestamp: to_datetime(r.ts)?,
        })
    }
}

#[derive(FromRow)]
struct AlertRow {
    id: i64,
    ts: i64,
    source_kind: String,
    source_id: i64,
    kind: String,
    message: String,
    resolved: bool,
}

impl TryFrom<AlertRow> for Alert {
    type Error = anyhow::Error;

    fn try_from(r: AlertRow) -> Result<Self> {
        let source = match r.source_kind.as_str() {
            "sensor" => AlertSource::Sensor(r.source_id),
            "plant" => AlertSource::Plant(r.source_id),
            other => anyhow::bail!("alert {}: unknown source kind '{other}'", r.id),
        };
        let kind = r
            .kind
            .parse::<AlertKind>()
            .map_err(|e| anyhow::anyhow!("alert {}: {e}", r.id))?;
        Ok(Alert {
            id: r.id,
            source,
            kind,
            message: r.message,
            timestamp: to_datetime(r.ts)?,
            resolved: r.resolved,
        })
    }
}

#[derive(FromRow)]
struct ScheduleRow {
    id: i64,
    plant_id: i64,
    day_of_week: i64,
    time: String,
    duration: f64,
    amount: f64,
}

impl TryFrom<ScheduleRow> for WateringSchedule {
    type Error = anyhow::Error;

    fn try_from(r: ScheduleRow) -> Result<Self> {
        Ok(WateringSchedule {
            id: r.id,
            plant_id: r.plant_id,
            day_of_week: crate::model::validate_day_of_week(r.day_of_week)
                .with_context(|| format!("schedule {}", r.id))?,
            time: ScheduleTime::parse(&r.time).with_context(|| format!("schedule {}", r.id))?,
            duration: r.duration,
            amount: r.amount,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: i64,
    ts: i64,
    plant_id: i64,
    duration: f64,
    amount: f64,
    is_automatic: bool,
}

impl TryFrom<EventRow> for WateringEvent {
    type Error = anyhow::Error;

    fn try_from(r: EventRow) -> Result<Self> {
        Ok(WateringEvent {
            id: r.id,
            plant_id: r.plant_id,
            timestamp: to_datetime(r.ts)?,
            duration: r.duration,
            amount: r.amount,
            is_automatic: r.is_automatic,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

async fn insert_reading_on<'e, E>(
    exec: E,
    ts: i64,
    sensor_id: SensorId,
    moisture: f64,
) -> Result<Reading>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id = sqlx::query("INSERT INTO readings (ts, sensor_id, moisture) VALUES (?, ?, ?)")
        .bind(ts)
        .bind(sensor_id)
        .bind(moisture)
        .execute(exec)
        .await
        .context("insert_reading failed")?
        .last_insert_rowid();
    Ok(Reading {
        id,
        sensor_id,
        moisture,
        timestamp: to_datetime(ts)?,
    })
}

async fn insert_alert_on<'e, E>(
    exec: E,
    ts: i64,
    source: AlertSource,
    draft: &AlertDraft,
) -> Result<Alert>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id = sqlx::query(
        r#"
        INSERT INTO alerts (ts, source_kind, source_id, kind, message, resolved)
        VALUES (?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(ts)
    .bind(source.kind_str())
    .bind(source.id())
    .bind(draft.kind.as_str())
    .bind(&draft.message)
    .execute(exec)
    .await
    .context("insert_alert failed")?
    .last_insert_rowid();

    Ok(Alert {
        id,
        source,
        kind: draft.kind,
        message: draft.message.clone(),
        timestamp: to_datetime(ts)?,
        resolved: false,
    })
}

const PLANT_COLUMNS: &str =
    "p.id, p.name, p.species, p.location, p.owner, p.zone_id, p.sensor_id, p.moisture_threshold";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/plant-monitor/plant-monitor.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every in-memory connection is its own database, so tests get
        // exactly one that never expires.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zones
    // ----------------------------

    /// Insert or update a zone by name; returns its id.
    pub async fn upsert_zone(&self, name: &str, description: Option<&str>) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO zones (name, description) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET description=excluded.description
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .context("upsert_zone failed")?;
        Ok(id)
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query_as::<_, ZoneRow>(
            "SELECT id, name, description FROM zones ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_zones failed")?;
        Ok(rows.into_iter().map(Zone::from).collect())
    }

    pub async fn get_zone(&self, id: i64) -> Result<Option<Zone>> {
        let row = sqlx::query_as::<_, ZoneRow>(
            "SELECT id, name, description FROM zones WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_zone failed")?;
        Ok(row.map(Zone::from))
    }

    pub async fn get_zone_by_name(&self, name: &str) -> Result<Option<Zone>> {
        let row = sqlx::query_as::<_, ZoneRow>(
            "SELECT id, name, description FROM zones WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("get_zone_by_name failed")?;
        Ok(row.map(Zone::from))
    }

    pub async fn update_zone(
        &self,
        id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Option<Zone>> {
        let row = sqlx::query_as::<_, ZoneRow>(
            r#"
            UPDATE zones SET name = ?, description = ? WHERE id = ?
            RETURNING id, name, description
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("update_zone failed")?;
        Ok(row.map(Zone::from))
    }

    /// Plants in the zone are kept and lose their zone.
    pub async fn delete_zone(&self, id: i64) -> Result<bool> {
        let n = sqlx::query("DELETE FROM zones WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_zone failed")?
            .rows_affected();
        Ok(n > 0)
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn create_device(&self, device_id: &str, name: Option<&str>) -> Result<Device> {
        let id = sqlx::query("INSERT INTO devices (device_id, name) VALUES (?, ?)")
            .bind(device_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("create_device failed")?
            .last_insert_rowid();
        Ok(Device {
            id,
            device_id: device_id.to_string(),
            name: name.map(str::to_string),
            last_seen: None,
        })
    }

    /// Register a device on first contact. Callers racing on the same
    /// `device_id` all get the one row, and an existing name is kept. The
    /// flag is true when this call created the row.
    pub async fn ensure_device(&self, device_id: &str) -> Result<(Device, bool)> {
        let created = sqlx::query(
            "INSERT INTO devices (device_id) VALUES (?) ON CONFLICT(device_id) DO NOTHING",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("ensure_device failed")?
        .rows_affected()
            == 1;

        let device = self
            .get_device_by_device_id(device_id)
            .await?
            .with_context(|| format!("device '{device_id}' missing after insert"))?;
        Ok((device, created))
    }

    pub async fn rename_device(&self, id: i64, name: Option<&str>) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "UPDATE devices SET name = ? WHERE id = ? RETURNING id, device_id, name, last_seen",
        )
        .bind(name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("rename_device failed")?;
        row.map(Device::try_from).transpose()
    }

    /// Insert or rename a device by its hardware id; returns the row id.
    pub async fn upsert_device(&self, device_id: &str, name: Option<&str>) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO devices (device_id, name) VALUES (?, ?)
            ON CONFLICT(device_id) DO UPDATE SET name=excluded.name
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(id)
    }

    pub async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, device_id, name, last_seen FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")?;
        row.map(Device::try_from).transpose()
    }

    pub async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, device_id, name, last_seen FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device_by_device_id failed")?;
        row.map(Device::try_from).transpose()
    }

    pub async fn list_devices(&self, skip: i64, limit: i64) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, device_id, name, last_seen FROM devices ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("list_devices failed")?;
        convert_all(rows)
    }

    pub async fn touch_device(&self, id: i64, ts: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touch_device failed")?;
        Ok(())
    }

    // ----------------------------
    // Sensors + thresholds
    // ----------------------------

    pub async fn create_sensor(&self, device: i64, index: i64, name: Option<&str>) -> Result<Sensor> {
        let id = sqlx::query("INSERT INTO sensors (device_id, idx, name) VALUES (?, ?, ?)")
            .bind(device)
            .bind(index)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("create_sensor failed")?
            .last_insert_rowid();
        Ok(Sensor {
            id,
            device_id: device,
            index,
            name: name.map(str::to_string),
        })
    }

    /// Sensor counterpart of [`Db::ensure_device`].
    pub async fn ensure_sensor(&self, device: i64, index: i64) -> Result<(Sensor, bool)> {
        let created = sqlx::query(
            "INSERT INTO sensors (device_id, idx) VALUES (?, ?) ON CONFLICT(device_id, idx) DO NOTHING",
        )
        .bind(device)
        .bind(index)
        .execute(&self.pool)
        .await
        .context("ensure_sensor failed")?
        .rows_affected()
            == 1;

        let sensor = self
            .get_sensor_by_index(device, index)
            .await?
            .with_context(|| format!("sensor {device}/{index} missing after insert"))?;
        Ok((sensor, created))
    }

    pub async fn list_sensors(&self, skip: i64, limit: i64) -> Result<Vec<Sensor>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            "SELECT id, device_id, idx, name FROM sensors ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("list_sensors failed")?;
        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    pub async fn upsert_sensor(&self, device: i64, index: i64, name: Option<&str>) -> Result<SensorId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sensors (device_id, idx, name) VALUES (?, ?, ?)
            ON CONFLICT(device_id, idx) DO UPDATE SET name=excluded.name
            RETURNING id
            "#,
        )
        .bind(device)
        .bind(index)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(id)
    }

    pub async fn get_sensor(&self, id: SensorId) -> Result<Option<Sensor>> {
        let row = sqlx::query_as::<_, SensorRow>(
            "SELECT id, device_id, idx, name FROM sensors WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_sensor failed")?;
        Ok(row.map(Sensor::from))
    }

    pub async fn get_sensor_by_index(&self, device: i64, index: i64) -> Result<Option<Sensor>> {
        let row = sqlx::query_as::<_, SensorRow>(
            "SELECT id, device_id, idx, name FROM sensors WHERE device_id = ? AND idx = ?",
        )
        .bind(device)
        .bind(index)
        .fetch_optional(&self.pool)
        .await
        .context("get_sensor_by_index failed")?;
        Ok(row.map(Sensor::from))
    }

    pub async fn sensors_for_device(&self, device: i64) -> Result<Vec<Sensor>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            "SELECT id, device_id, idx, name FROM sensors WHERE device_id = ? ORDER BY idx",
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await
        .context("sensors_for_device failed")?;
        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    /// The sensor's range threshold, if one has been set.
    pub async fn get_threshold(&self, sensor_id: SensorId) -> Result<Option<Threshold>> {
        let row: Option<(Option<f64>, Option<f64>)> = sqlx::query_as(
            "SELECT min_moisture, max_moisture FROM thresholds WHERE sensor_id = ?",
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_threshold failed")?;
        Ok(row.map(|(min_moisture, max_moisture)| Threshold::Range {
            min_moisture,
            max_moisture,
        }))
    }

    pub async fn set_threshold(
        &self,
        sensor_id: SensorId,
        min_moisture: Option<f64>,
        max_moisture: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO thresholds (sensor_id, min_moisture, max_moisture) VALUES (?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              min_moisture=excluded.min_moisture,
              max_moisture=excluded.max_moisture
            "#,
        )
        .bind(sensor_id)
        .bind(min_moisture)
        .bind(max_moisture)
        .execute(&self.pool)
        .await
        .context("set_threshold failed")?;
        Ok(())
    }

    // ----------------------------
    // Plants
    // ----------------------------

    pub async fn create_plant(&self, p: &NewPlant) -> Result<Plant> {
        let id = sqlx::query(
            r#"
            INSERT INTO plants (name, species, location, owner, zone_id, sensor_id, moisture_threshold)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&p.name)
        .bind(&p.species)
        .bind(&p.location)
        .bind(&p.owner)
        .bind(p.zone_id)
        .bind(p.sensor_id)
        .bind(p.moisture_threshold)
        .execute(&self.pool)
        .await
        .context("create_plant failed")?
        .last_insert_rowid();

        Ok(Plant {
            id,
            name: p.name.clone(),
            species: p.species.clone(),
            location: p.location.clone(),
            owner: p.owner.clone(),
            zone_id: p.zone_id,
            sensor_id: p.sensor_id,
            moisture_threshold: p.moisture_threshold,
        })
    }

    /// Insert or update a plant by name; returns its id.
    pub async fn upsert_plant(&self, p: &NewPlant) -> Result<PlantId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO plants (name, species, location, owner, zone_id, sensor_id, moisture_threshold)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              species=excluded.species,
              location=excluded.location,
              owner=excluded.owner,
              zone_id=excluded.zone_id,
              sensor_id=excluded.sensor_id,
              moisture_threshold=excluded.moisture_threshold
            RETURNING id
            "#,
        )
        .bind(&p.name)
        .bind(&p.species)
        .bind(&p.location)
        .bind(&p.owner)
        .bind(p.zone_id)
        .bind(p.sensor_id)
        .bind(p.moisture_threshold)
        .fetch_one(&self.pool)
        .await
        .context("upsert_plant failed")?;
        Ok(id)
    }

    /// Overwrite a plant's editable fields. The owner never changes.
    pub async fn update_plant(&self, id: PlantId, p: &NewPlant) -> Result<Option<Plant>> {
        let row = sqlx::query_as::<_, PlantRow>(
            r#"
            UPDATE plants SET
              name = ?, species = ?, location = ?, zone_id = ?, sensor_id = ?, moisture_threshold = ?
            WHERE id = ?
            RETURNING id, name, species, location, owner, zone_id, sensor_id, moisture_threshold
            "#,
        )
        .bind(&p.name)
        .bind(&p.species)
        .bind(&p.location)
        .bind(p.zone_id)
        .bind(p.sensor_id)
        .bind(p.moisture_threshold)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("update_plant failed")?;
        Ok(row.map(Plant::from))
    }

    pub async fn get_plant(&self, id: PlantId) -> Result<Option<Plant>> {
        let row = sqlx::query_as::<_, PlantRow>(&format!(
            "SELECT {PLANT_COLUMNS} FROM plants p WHERE p.id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plant failed")?;
        Ok(row.map(Plant::from))
    }

    pub async fn get_plant_by_name(&self, name: &str) -> Result<Option<Plant>> {
        let row = sqlx::query_as::<_, PlantRow>(&format!(
            "SELECT {PLANT_COLUMNS} FROM plants p WHERE p.name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("get_plant_by_name failed")?;
        Ok(row.map(Plant::from))
    }

    pub async fn plant_for_sensor(&self, sensor_id: SensorId) -> Result<Option<Plant>> {
        let row = sqlx::query_as::<_, PlantRow>(&format!(
            "SELECT {PLANT_COLUMNS} FROM plants p WHERE p.sensor_id = ?"
        ))
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .context("plant_for_sensor failed")?;
        Ok(row.map(Plant::from))
    }

    /// Plants visible to `owner`: unowned plants plus the owner's own.
    pub async fn list_plants(&self, owner: Option<&str>, skip: i64, limit: i64) -> Result<Vec<Plant>> {
        let rows = sqlx::query_as::<_, PlantRow>(&format!(
            r#"
            SELECT {PLANT_COLUMNS} FROM plants p
            WHERE p.owner IS NULL OR p.owner = ?
            ORDER BY p.id
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(owner)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("list_plants failed")?;
        Ok(rows.into_iter().map(Plant::from).collect())
    }

    pub async fn plants_in_zone(&self, zone_id: i64, owner: Option<&str>) -> Result<Vec<Plant>> {
        let rows = sqlx::query_as::<_, PlantRow>(&format!(
            r#"
            SELECT {PLANT_COLUMNS} FROM plants p
            WHERE p.zone_id = ? AND (p.owner IS NULL OR p.owner = ?)
            ORDER BY p.id
            "#
        ))
        .bind(zone_id)
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .context("plants_in_zone failed")?;
        Ok(rows.into_iter().map(Plant::from).collect())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, ts: i64, sensor_id: SensorId, moisture: f64) -> Result<Reading> {
        insert_reading_on(&self.pool, ts, sensor_id, moisture).await
    }

    /// Store a reading together with the alerts `evaluate` derives from it.
    /// Both share one transaction: if any alert fails, the reading is rolled
    /// back too.
    pub async fn insert_reading_with_alerts<F>(
        &self,
        ts: i64,
        sensor_id: SensorId,
        moisture: f64,
        evaluate: F,
    ) -> Result<(Reading, Vec<Alert>)>
    where
        F: FnOnce(&Reading) -> Vec<(AlertSource, AlertDraft)>,
    {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let reading = insert_reading_on(&mut *tx, ts, sensor_id, moisture).await?;
        let mut alerts = Vec::new();
        for (source, draft) in evaluate(&reading) {
            alerts.push(insert_alert_on(&mut *tx, ts, source, &draft).await?);
        }

        tx.commit().await.context("commit failed")?;
        Ok((reading, alerts))
    }

    pub async fn list_readings(&self, skip: i64, limit: i64) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            "SELECT id, ts, sensor_id, moisture FROM readings ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("list_readings failed")?;
        convert_all(rows)
    }

    /// Readings for one sensor in `[start, end]` (either side optional),
    /// oldest first.
    pub async fn readings_for_sensor(
        &self,
        sensor_id: SensorId,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, ts, sensor_id, moisture FROM readings
            WHERE sensor_id = ?
              AND (? IS NULL OR ts >= ?)
              AND (? IS NULL OR ts <= ?)
            ORDER BY ts, id
            "#,
        )
        .bind(sensor_id)
        .bind(start)
        .bind(start)
        .bind(end)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("readings_for_sensor failed")?;
        convert_all(rows)
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn insert_alert(&self, ts: i64, source: AlertSource, draft: &AlertDraft) -> Result<Alert> {
        insert_alert_on(&self.pool, ts, source, draft).await
    }

    pub async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(
            "SELECT id, ts, source_kind, source_id, kind, message, resolved FROM alerts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_alert failed")?;
        row.map(Alert::try_from).transpose()
    }

    /// Returns false if there was nothing to delete.
    pub async fn delete_alert(&self, id: i64) -> Result<bool> {
        let n = sqlx::query("DELETE FROM alerts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_alert failed")?
            .rows_affected();
        Ok(n > 0)
    }

    pub async fn list_alerts(&self, unresolved_only: bool, skip: i64, limit: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT id, ts, source_kind, source_id, kind, message, resolved FROM alerts
            WHERE (? = 0 OR resolved = 0)
            ORDER BY ts DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(unresolved_only)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("list_alerts failed")?;
        convert_all(rows)
    }

    /// Mark an alert resolved. Returns `None` if it doesn't exist.
    pub async fn resolve_alert(&self, id: i64) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(
            r#"
            UPDATE alerts SET resolved = 1 WHERE id = ?
            RETURNING id, ts, source_kind, source_id, kind, message, resolved
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("resolve_alert failed")?;
        row.map(Alert::try_from).transpose()
    }

    // ----------------------------
    // Watering schedules
    // ----------------------------

    pub async fn insert_schedule(
        &self,
        plant_id: PlantId,
        day_of_week: u8,
        time: &ScheduleTime,
        duration: f64,
        amount: f64,
    ) -> Result<WateringSchedule> {
        let id = sqlx::query(
            r#"
            INSERT INTO watering_schedules (plant_id, day_of_week, time, duration, amount)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(plant_id)
        .bind(i64::from(day_of_week))
        .bind(time.as_str())
        .bind(duration)
        .bind(amount)
        .execute(&self.pool)
        .await
        .context("insert_schedule failed")?
        .last_insert_rowid();

        Ok(WateringSchedule {
            id,
            plant_id,
            day_of_week,
            time: time.clone(),
            duration,
            amount,
        })
    }

    /// Whether an identical (plant, day, time) schedule already exists.
    pub async fn schedule_exists(&self, plant_id: PlantId, day_of_week: u8, time: &ScheduleTime) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM watering_schedules
            WHERE plant_id = ? AND day_of_week = ? AND time = ?
            "#,
        )
        .bind(plant_id)
        .bind(i64::from(day_of_week))
        .bind(time.as_str())
        .fetch_one(&self.pool)
        .await
        .context("schedule_exists failed")?;
        Ok(n > 0)
    }

    /// Every schedule, ordered by plant, day and time.
    pub async fn load_schedules(&self) -> Result<Vec<WateringSchedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT id, plant_id, day_of_week, time, duration, amount
            FROM watering_schedules
            ORDER BY plant_id, day_of_week, time, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_schedules failed")?;
        convert_all(rows)
    }

    pub async fn list_schedules(&self, owner: Option<&str>, skip: i64, limit: i64) -> Result<Vec<WateringSchedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT s.id, s.plant_id, s.day_of_week, s.time, s.duration, s.amount
            FROM watering_schedules s
            JOIN plants p ON p.id = s.plant_id
            WHERE p.owner IS NULL OR p.owner = ?
            ORDER BY s.id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(owner)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("list_schedules failed")?;
        convert_all(rows)
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn insert_watering_event(
        &self,
        ts: i64,
        plant_id: PlantId,
        duration: f64,
        amount: f64,
        is_automatic: bool,
    ) -> Result<WateringEvent> {
        let id = sqlx::query(
            r#"
            INSERT INTO watering_events (ts, plant_id, duration, amount, is_automatic)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(plant_id)
        .bind(duration)
        .bind(amount)
        .bind(is_automatic)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?
        .last_insert_rowid();

        Ok(WateringEvent {
            id,
            plant_id,
            timestamp: to_datetime(ts)?,
            duration,
            amount,
            is_automatic,
        })
    }

    /// Record an automatic watering unless the plant was watered at or after
    /// `cooldown_start` in the meantime. The check and the insert share one
    /// transaction. Returns `None` when skipped.
    pub async fn record_automatic_watering(
        &self,
        ts: i64,
        schedule: &WateringSchedule,
        cooldown_start: i64,
    ) -> Result<Option<WateringEvent>> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(ts) FROM watering_events WHERE plant_id = ?")
                .bind(schedule.plant_id)
                .fetch_one(&mut *tx)
                .await
                .context("record_automatic_watering: last event lookup failed")?;

        if last.is_some_and(|last| last >= cooldown_start) {
            tx.rollback().await.context("rollback failed")?;
            return Ok(None);
        }

        let id = sqlx::query(
            r#"
            INSERT INTO watering_events (ts, plant_id, duration, amount, is_automatic)
            VALUES (?, ?, ?, ?, 1)
            "#,
        )
        .bind(ts)
        .bind(schedule.plant_id)
        .bind(schedule.duration)
        .bind(schedule.amount)
        .execute(&mut *tx)
        .await
        .context("record_automatic_watering: insert failed")?
        .last_insert_rowid();

        tx.commit().await.context("commit failed")?;

        Ok(Some(WateringEvent {
            id,
            plant_id: schedule.plant_id,
            timestamp: to_datetime(ts)?,
            duration: schedule.duration,
            amount: schedule.amount,
            is_automatic: true,
        }))
    }

    /// Most recent watering event for every plant that has one.
    pub async fn last_events_by_plant(&self) -> Result<HashMap<PlantId, WateringEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT e.id, e.ts, e.plant_id, e.duration, e.amount, e.is_automatic
            FROM watering_events e
            WHERE e.id = (
              SELECT e2.id FROM watering_events e2
              WHERE e2.plant_id = e.plant_id
              ORDER BY e2.ts DESC, e2.id DESC
              LIMIT 1
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("last_events_by_plant failed")?;

        let events: Vec<WateringEvent> = convert_all(rows)?;
        Ok(events.into_iter().map(|e| (e.plant_id, e)).collect())
    }

    pub async fn list_watering_events(&self, owner: Option<&str>, skip: i64, limit: i64) -> Result<Vec<WateringEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT e.id, e.ts, e.plant_id, e.duration, e.amount, e.is_automatic
            FROM watering_events e
            JOIN plants p ON p.id = e.plant_id
            WHERE p.owner IS NULL OR p.owner = ?
            ORDER BY e.ts DESC, e.id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(owner)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("list_watering_events failed")?;
        convert_all(rows)
    }

    // ----------------------------
    // Summary
    // ----------------------------

    pub async fn system_summary(&self) -> Result<SystemSummary> {
        let (total_plants, total_sensors, total_devices, active_alerts): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                  (SELECT COUNT(*) FROM plants),
                  (SELECT COUNT(*) FROM sensors),
                  (SELECT COUNT(*) FROM devices),
                  (SELECT COUNT(*) FROM alerts WHERE resolved = 0)
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .context("system_summary failed")?;

        Ok(SystemSummary {
            total_plants,
            total_sensors,
            total_devices,
            active_alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertKind;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    async fn plant_with_sensor(db: &Db) -> (SensorId, PlantId) {
        let dev = db.create_device("esp-01", Some("bench")).await.unwrap();
        let sensor = db.create_sensor(dev.id, 1, None).await.unwrap();
        let plant = db
            .create_plant(&NewPlant {
                name: "basil".into(),
                sensor_id: Some(sensor.id),
                moisture_threshold: Some(30.0),
                ..Default::default()
            })
            .await
            .unwrap();
        (sensor.id, plant.id)
    }

    #[tokio::test]
    async fn threshold_absent_until_set() {
        let db = test_db().await;
        let (sensor, _) = plant_with_sensor(&db).await;

        assert_eq!(db.get_threshold(sensor).await.unwrap(), None);

        db.set_threshold(sensor, Some(20.0), None).await.unwrap();
        db.set_threshold(sensor, Some(25.0), Some(70.0)).await.unwrap();
        assert_eq!(
            db.get_threshold(sensor).await.unwrap(),
            Some(Threshold::Range {
                min_moisture: Some(25.0),
                max_moisture: Some(70.0)
            })
        );
    }

    #[tokio::test]
    async fn plant_lookup_by_sensor() {
        let db = test_db().await;
        let (sensor, plant) = plant_with_sensor(&db).await;
        let found = db.plant_for_sensor(sensor).await.unwrap().unwrap();
        assert_eq!(found.id, plant);
        assert_eq!(found.threshold().and_then(|t| t.floor()), Some(30.0));
    }

    #[tokio::test]
    async fn readings_filtered_by_window() {
        let db = test_db().await;
        let (sensor, _) = plant_with_sensor(&db).await;
        for (ts, m) in [(100, 10.0), (200, 20.0), (300, 30.0)] {
            db.insert_reading(ts, sensor, m).await.unwrap();
        }

        let all = db.readings_for_sensor(sensor, None, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let window = db.readings_for_sensor(sensor, Some(150), Some(300)).await.unwrap();
        let values: Vec<f64> = window.iter().map(|r| r.moisture).collect();
        assert_eq!(values, vec![20.0, 30.0]);
    }

    #[tokio::test]
    async fn alerts_resolve_and_filter() {
        let db = test_db().await;
        let (sensor, _) = plant_with_sensor(&db).await;
        let draft = AlertDraft {
            kind: AlertKind::LowMoisture,
            message: "dry".into(),
        };
        let a = db.insert_alert(10, AlertSource::Sensor(sensor), &draft).await.unwrap();
        db.insert_alert(20, AlertSource::Sensor(sensor), &draft).await.unwrap();

        let resolved = db.resolve_alert(a.id).await.unwrap().unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.source, AlertSource::Sensor(sensor));

        assert_eq!(db.list_alerts(false, 0, 100).await.unwrap().len(), 2);
        let open = db.list_alerts(true, 0, 100).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].id, a.id);

        assert!(db.resolve_alert(999).await.unwrap().is_none());
        assert_eq!(db.system_summary().await.unwrap().active_alerts, 1);
    }

    #[tokio::test]
    async fn last_event_per_plant_is_newest() {
        let db = test_db().await;
        let (_, plant) = plant_with_sensor(&db).await;
        db.insert_watering_event(100, plant, 10.0, 200.0, false).await.unwrap();
        let newest = db.insert_watering_event(500, plant, 12.0, 250.0, true).await.unwrap();
        db.insert_watering_event(300, plant, 11.0, 220.0, false).await.unwrap();

        let map = db.last_events_by_plant().await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&plant].id, newest.id);
    }

    #[tokio::test]
    async fn automatic_watering_respects_cooldown_start() {
        let db = test_db().await;
        let (_, plant) = plant_with_sensor(&db).await;
        let schedule = db
            .insert_schedule(plant, 2, &ScheduleTime::parse("08:00").unwrap(), 30.0, 250.0)
            .await
            .unwrap();

        let first = db.record_automatic_watering(1_000, &schedule, 0).await.unwrap();
        assert!(first.is_some_and(|e| e.is_automatic && e.amount == 250.0));

        // Event at 1000 is inside a cooldown that starts at 500.
        assert!(db
            .record_automatic_watering(2_000, &schedule, 500)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn plant_listing_hides_other_owners() {
        let db = test_db().await;
        for (name, owner) in [("a", None), ("b", Some("alice")), ("c", Some("bob"))] {
            db.create_plant(&NewPlant {
                name: name.into(),
                owner: owner.map(str::to_string),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let names = |ps: Vec<Plant>| ps.into_iter().map(|p| p.name).collect::<Vec<_>>();
        assert_eq!(names(db.list_plants(None, 0, 100).await.unwrap()), vec!["a"]);
        assert_eq!(
            names(db.list_plants(Some("alice"), 0, 100).await.unwrap()),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn failed_alert_rolls_back_reading() {
        let db = test_db().await;
        let (sensor, _) = plant_with_sensor(&db).await;
        sqlx::query("DROP TABLE alerts").execute(&db.pool).await.unwrap();

        let draft = AlertDraft {
            kind: AlertKind::LowMoisture,
            message: "dry".into(),
        };
        let result = db
            .insert_reading_with_alerts(10, sensor, 5.0, |_| {
                vec![(AlertSource::Sensor(sensor), draft)]
            })
            .await;
        assert!(result.is_err());
        assert!(db.readings_for_sensor(sensor, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reading_and_alerts_commit_together() {
        let db = test_db().await;
        let (sensor, plant) = plant_with_sensor(&db).await;
        let (reading, alerts) = db
            .insert_reading_with_alerts(10, sensor, 5.0, |r| {
                vec![(
                    AlertSource::Plant(plant),
                    AlertDraft {
                        kind: AlertKind::LowMoisture,
                        message: format!("low {}", r.moisture),
                    },
                )]
            })
            .await
            .unwrap();
        assert_eq!(reading.moisture, 5.0);
        assert_eq!(alerts[0].message, "low 5");
        assert_eq!(db.get_alert(alerts[0].id).await.unwrap(), Some(alerts[0].clone()));
        assert!(db.delete_alert(alerts[0].id).await.unwrap());
        assert!(!db.delete_alert(alerts[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn ensure_keeps_existing_rows() {
        let db = test_db().await;
        let named = db.create_device("esp-01", Some("bench")).await.unwrap();

        let (dev, created) = db.ensure_device("esp-01").await.unwrap();
        assert!(!created);
        assert_eq!(dev.id, named.id);
        assert_eq!(dev.name.as_deref(), Some("bench"));

        let (s1, created) = db.ensure_sensor(dev.id, 3).await.unwrap();
        assert!(created);
        let (s2, created) = db.ensure_sensor(dev.id, 3).await.unwrap();
        assert!(!created);
        assert_eq!(s1.id, s2.id);
        assert_eq!(db.list_sensors(0, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_zone_keeps_its_plants() {
        let db = test_db().await;
        let zone = db.upsert_zone("porch", None).await.unwrap();
        let plant = db
            .create_plant(&NewPlant {
                name: "fern".into(),
                zone_id: Some(zone),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(db.delete_zone(zone).await.unwrap());
        let plant = db.get_plant(plant.id).await.unwrap().unwrap();
        assert_eq!(plant.zone_id, None);
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let db = test_db().await;
        let d1 = db.upsert_device("esp-01", Some("one")).await.unwrap();
        let d2 = db.upsert_device("esp-01", Some("renamed")).await.unwrap();
        assert_eq!(d1, d2);
        let s1 = db.upsert_sensor(d1, 0, None).await.unwrap();
        let s2 = db.upsert_sensor(d1, 0, Some("pot")).await.unwrap();
        assert_eq!(s1, s2);
        let z1 = db.upsert_zone("porch", None).await.unwrap();
        let z2 = db.upsert_zone("porch", Some("sunny")).await.unwrap();
        assert_eq!(z1, z2);

        let dev = db.get_device(d1).await.unwrap().unwrap();
        assert_eq!(dev.name.as_deref(), Some("renamed"));
    }
}
