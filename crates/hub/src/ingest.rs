//! Reading ingestion: resolve the reporting sensor, store the reading, run
//! the threshold evaluator and persist whatever alerts it proposes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::Db;
use crate::model::{Alert, AlertSource, Reading, Sensor, SensorId};
use crate::state::SharedState;
use crate::threshold::evaluate;

/// Payload posted by a device. `sensor_id` is the channel index on that
/// device, not the hub's sensor id.
#[derive(Debug, Deserialize)]
pub struct ReadingMsg {
    pub device_id: String,
    pub sensor_id: i64,
    pub moisture: f64,
}

#[derive(Debug, Serialize)]
pub struct Ingested {
    pub reading: Reading,
    pub alerts: Vec<Alert>,
}

/// Find the sensor behind `(device_id, index)`, registering the device and
/// sensor on first contact. Simultaneous first readings from one device
/// resolve to the same rows.
pub async fn resolve_sensor(db: &Db, device_id: &str, index: i64, now: OffsetDateTime) -> Result<Sensor> {
    let (device, created) = db.ensure_device(device_id).await?;
    if created {
        info!(device = %device_id, "ingest: registered unknown device");
    }
    db.touch_device(device.id, now.unix_timestamp()).await?;

    let (sensor, created) = db.ensure_sensor(device.id, index).await?;
    if created {
        info!(device = %device_id, index, "ingest: registered unknown sensor");
    }
    Ok(sensor)
}

/// Device-facing entry point.
pub async fn ingest(db: &Db, shared: &SharedState, msg: &ReadingMsg, now: OffsetDateTime) -> Result<Ingested> {
    let sensor = resolve_sensor(db, &msg.device_id, msg.sensor_id, now).await?;
    record(db, shared, sensor.id, msg.moisture, now).await
}

/// Store a reading for a known sensor and raise its alerts.
///
/// The sensor's own range threshold and the cutoff of the plant bound to it
/// are evaluated independently; each produces alerts tagged with its source.
/// The reading and its alerts are stored atomically.
pub async fn record(
    db: &Db,
    shared: &SharedState,
    sensor_id: SensorId,
    moisture: f64,
    now: OffsetDateTime,
) -> Result<Ingested> {
    let mut checks = vec![(
        AlertSource::Sensor(sensor_id),
        db.get_threshold(sensor_id).await?,
    )];
    if let Some(plant) = db.plant_for_sensor(sensor_id).await? {
        checks.push((AlertSource::Plant(plant.id), plant.threshold()));
    }

    let (reading, alerts) = db
        .insert_reading_with_alerts(now.unix_timestamp(), sensor_id, moisture, |reading| {
            let mut drafts = Vec::new();
            for (source, threshold) in checks {
                for draft in evaluate(reading, threshold.as_ref()) {
                    warn!(
                        sensor = sensor_id,
                        moisture,
                        kind = draft.kind.as_str(),
                        "ingest: {}",
                        draft.message
                    );
                    drafts.push((source, draft));
                }
            }
            drafts
        })
        .await?;

    {
        let mut st = shared.write().await;
        st.record_reading(sensor_id, moisture);
        for a in &alerts {
            st.record_alert(format!(
                "{} {}: {}",
                a.source.kind_str(),
                a.source.id(),
                a.message
            ));
        }
    }

    Ok(Ingested { reading, alerts })
}
