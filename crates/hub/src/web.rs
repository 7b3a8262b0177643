use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use time::{Duration, OffsetDateTime, UtcOffset};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::access::{authorize_plant, OWNER_HEADER};
use crate::db::{Db, NewPlant, SystemSummary};
use crate::health::{summarize, HealthReport};
use crate::ingest::{self, Ingested, ReadingMsg};
use crate::scheduler::due_for_watering;
use crate::model::{
    validate_day_of_week, Alert, ConfigurationError, Device, Plant, PlantId, Reading,
    ScheduleTime, Sensor, SensorId, Threshold, WateringEvent, WateringSchedule, Zone,
    MOISTURE_RANGE,
};
use crate::state::{SharedState, StatusResponse};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;
/// Longest health window, in days. Larger values cannot be turned into a
/// start time.
const MAX_HEALTH_DAYS: i64 = 36_500;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
    /// Default look-back for `/api/plants/{id}/health`.
    pub health_window_days: i64,
    /// Wall clock the watering schedules are written in.
    pub utc_offset: UtcOffset,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Handler failure rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{what} not found"),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl From<ConfigurationError> for ApiError {
    fn from(e: ConfigurationError) -> Self {
        Self::bad_request(e.0)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("api: {e:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// Caller identity from the owner header, if any.
fn requester(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_LIMIT
}

impl Page {
    fn bounds(&self) -> (i64, i64) {
        (self.skip.max(0), self.limit.clamp(1, MAX_LIMIT))
    }
}

fn check_moisture(moisture: f64) -> ApiResult<()> {
    if MOISTURE_RANGE.contains(&moisture) {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!(
            "moisture {moisture} out of range [0, 100]"
        )))
    }
}

fn check_positive(name: &str, v: f64) -> ApiResult<()> {
    if v > 0.0 {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("{name} must be positive, got {v}")))
    }
}

async fn visible_plant(db: &Db, id: PlantId, headers: &HeaderMap) -> ApiResult<Plant> {
    authorize_plant(db.get_plant(id).await?, requester(headers))
        .ok_or_else(|| ApiError::not_found("plant"))
}

async fn existing_sensor(db: &Db, id: SensorId) -> ApiResult<Sensor> {
    db.get_sensor(id)
        .await?
        .ok_or_else(|| ApiError::not_found("sensor"))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/api/status", get(api_status))
        .route("/api/summary", get(api_summary))
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/{id}", get(get_device).put(rename_device))
        .route("/api/sensors", get(list_sensors).post(create_sensor))
        .route("/api/sensors/{id}", get(get_sensor))
        .route(
            "/api/sensors/{id}/threshold",
            get(get_threshold).put(put_threshold),
        )
        .route("/api/sensors/{id}/readings", post(post_sensor_reading))
        .route("/api/readings", get(list_readings).post(post_reading))
        .route("/api/readings/sensor/{id}", get(sensor_readings))
        .route("/api/alerts", get(list_alerts))
        .route(
            "/api/alerts/{id}",
            get(get_alert).put(resolve_alert).delete(delete_alert),
        )
        .route("/api/zones", get(list_zones).post(create_zone))
        .route(
            "/api/zones/{id}",
            get(get_zone).put(update_zone).delete(delete_zone),
        )
        .route("/api/zones/{id}/plants", get(zone_plants))
        .route("/api/plants", get(list_plants).post(create_plant))
        .route("/api/plants/{id}", get(get_plant).put(update_plant))
        .route("/api/plants/{id}/health", get(plant_health))
        .route(
            "/api/watering/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route("/api/watering/due", get(due_plants))
        .route(
            "/api/watering/events",
            get(list_watering_events).post(create_watering_event),
        )
        .with_state(state)
}

async fn ping() -> impl IntoResponse {
    Json(json!({ "message": "pong" }))
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_summary(State(state): State<AppState>) -> ApiResult<Json<SystemSummary>> {
    Ok(Json(state.db.system_summary().await?))
}

// -- Devices ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateDevice {
    device_id: String,
    name: Option<String>,
}

async fn list_devices(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<Device>>> {
    let (skip, limit) = page.bounds();
    Ok(Json(state.db.list_devices(skip, limit).await?))
}

async fn create_device(
    State(state): State<AppState>,
    Json(body): Json<CreateDevice>,
) -> ApiResult<(StatusCode, Json<Device>)> {
    let device_id = body.device_id.trim();
    if device_id.is_empty() {
        return Err(ApiError::bad_request("device_id is empty"));
    }
    if state.db.get_device_by_device_id(device_id).await?.is_some() {
        return Err(ApiError::conflict(format!(
            "device '{device_id}' already registered"
        )));
    }
    let device = state.db.create_device(device_id, body.name.as_deref()).await?;
    info!(device = %device.device_id, id = device.id, "api: device registered");
    Ok((StatusCode::CREATED, Json(device)))
}

#[derive(Debug, Deserialize)]
struct RenameDevice {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceDetail {
    #[serde(flatten)]
    device: Device,
    sensors: Vec<Sensor>,
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<DeviceDetail>> {
    let device = state
        .db
        .get_device(id)
        .await?
        .ok_or_else(|| ApiError::not_found("device"))?;
    let sensors = state.db.sensors_for_device(device.id).await?;
    Ok(Json(DeviceDetail { device, sensors }))
}

async fn rename_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<RenameDevice>,
) -> ApiResult<Json<Device>> {
    let name = body.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let device = state
        .db
        .rename_device(id, name)
        .await?
        .ok_or_else(|| ApiError::not_found("device"))?;
    info!(device = %device.device_id, ?name, "api: device renamed");
    Ok(Json(device))
}

// -- Sensors + thresholds -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSensor {
    /// Hardware id of the owning device.
    device_id: String,
    index: i64,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThresholdBody {
    min_moisture: Option<f64>,
    max_moisture: Option<f64>,
}

async fn create_sensor(
    State(state): State<AppState>,
    Json(body): Json<CreateSensor>,
) -> ApiResult<(StatusCode, Json<Sensor>)> {
    if body.index < 0 {
        return Err(ApiError::bad_request("index must not be negative"));
    }
    let device = state
        .db
        .get_device_by_device_id(&body.device_id)
        .await?
        .ok_or_else(|| ApiError::not_found("device"))?;
    if state
        .db
        .get_sensor_by_index(device.id, body.index)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict(format!(
            "sensor {} already registered on device '{}'",
            body.index, device.device_id
        )));
    }
    let sensor = state
        .db
        .create_sensor(device.id, body.index, body.name.as_deref())
        .await?;
    info!(device = %device.device_id, index = sensor.index, id = sensor.id, "api: sensor registered");
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn list_sensors(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<Sensor>>> {
    let (skip, limit) = page.bounds();
    Ok(Json(state.db.list_sensors(skip, limit).await?))
}

async fn get_sensor(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
) -> ApiResult<Json<Sensor>> {
    Ok(Json(existing_sensor(&state.db, id).await?))
}

async fn get_threshold(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
) -> ApiResult<Json<Threshold>> {
    existing_sensor(&state.db, id).await?;
    state
        .db
        .get_threshold(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("threshold"))
}

async fn put_threshold(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
    Json(body): Json<ThresholdBody>,
) -> ApiResult<Json<Threshold>> {
    existing_sensor(&state.db, id).await?;
    let threshold = Threshold::Range {
        min_moisture: body.min_moisture,
        max_moisture: body.max_moisture,
    };
    threshold.validate()?;
    state
        .db
        .set_threshold(id, body.min_moisture, body.max_moisture)
        .await?;
    info!(sensor = id, ?threshold, "api: threshold updated");
    Ok(Json(threshold))
}

// -- Readings -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SensorReadingBody {
    moisture: f64,
}

#[derive(Debug, Deserialize)]
struct ReadingWindow {
    #[serde(default, with = "time::serde::rfc3339::option")]
    start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    end: Option<OffsetDateTime>,
}

async fn post_reading(
    State(state): State<AppState>,
    Json(msg): Json<ReadingMsg>,
) -> ApiResult<(StatusCode, Json<Ingested>)> {
    if msg.device_id.trim().is_empty() {
        return Err(ApiError::bad_request("device_id is empty"));
    }
    if msg.sensor_id < 0 {
        return Err(ApiError::bad_request("sensor_id must not be negative"));
    }
    check_moisture(msg.moisture)?;

    let out = ingest::ingest(&state.db, &state.shared, &msg, OffsetDateTime::now_utc()).await?;
    Ok((StatusCode::CREATED, Json(out)))
}

async fn post_sensor_reading(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
    Json(body): Json<SensorReadingBody>,
) -> ApiResult<(StatusCode, Json<Ingested>)> {
    check_moisture(body.moisture)?;
    existing_sensor(&state.db, id).await?;

    let out = ingest::record(
        &state.db,
        &state.shared,
        id,
        body.moisture,
        OffsetDateTime::now_utc(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(out)))
}

async fn list_readings(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<Reading>>> {
    let (skip, limit) = page.bounds();
    Ok(Json(state.db.list_readings(skip, limit).await?))
}

async fn sensor_readings(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
    Query(window): Query<ReadingWindow>,
) -> ApiResult<Json<Vec<Reading>>> {
    existing_sensor(&state.db, id).await?;
    let readings = state
        .db
        .readings_for_sensor(
            id,
            window.start.map(OffsetDateTime::unix_timestamp),
            window.end.map(OffsetDateTime::unix_timestamp),
        )
        .await?;
    Ok(Json(readings))
}

// -- Alerts -----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AlertQuery {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    unresolved: bool,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> ApiResult<Json<Vec<Alert>>> {
    let (skip, limit) = Page {
        skip: q.skip,
        limit: q.limit,
    }
    .bounds();
    Ok(Json(state.db.list_alerts(q.unresolved, skip, limit).await?))
}

async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Alert>> {
    state
        .db
        .get_alert(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("alert"))
}

async fn delete_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if !state.db.delete_alert(id).await? {
        return Err(ApiError::not_found("alert"));
    }
    info!(alert = id, "api: alert deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Alert>> {
    let alert = state
        .db
        .resolve_alert(id)
        .await?
        .ok_or_else(|| ApiError::not_found("alert"))?;
    info!(alert = id, "api: alert resolved");
    Ok(Json(alert))
}

// -- Zones ------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateZone {
    name: String,
    description: Option<String>,
}

async fn list_zones(State(state): State<AppState>) -> ApiResult<Json<Vec<Zone>>> {
    Ok(Json(state.db.load_zones().await?))
}

async fn create_zone(
    State(state): State<AppState>,
    Json(body): Json<CreateZone>,
) -> ApiResult<(StatusCode, Json<Zone>)> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is empty"));
    }
    if state.db.get_zone_by_name(name).await?.is_some() {
        return Err(ApiError::conflict(format!("zone '{name}' already exists")));
    }
    let id = state
        .db
        .upsert_zone(name, body.description.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(Zone {
            id,
            name: name.to_string(),
            description: body.description,
        }),
    ))
}

async fn get_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Zone>> {
    state
        .db
        .get_zone(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("zone"))
}

async fn update_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<CreateZone>,
) -> ApiResult<Json<Zone>> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is empty"));
    }
    if let Some(other) = state.db.get_zone_by_name(name).await? {
        if other.id != id {
            return Err(ApiError::conflict(format!("zone '{name}' already exists")));
        }
    }
    let zone = state
        .db
        .update_zone(id, name, body.description.as_deref())
        .await?
        .ok_or_else(|| ApiError::not_found("zone"))?;
    Ok(Json(zone))
}

/// Plants in the zone are kept and become unzoned.
async fn delete_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if !state.db.delete_zone(id).await? {
        return Err(ApiError::not_found("zone"));
    }
    info!(zone = id, "api: zone deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn zone_plants(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Plant>>> {
    if state.db.get_zone(id).await?.is_none() {
        return Err(ApiError::not_found("zone"));
    }
    Ok(Json(state.db.plants_in_zone(id, requester(&headers)).await?))
}

// -- Plants -----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreatePlant {
    name: String,
    species: Option<String>,
    location: Option<String>,
    zone_id: Option<i64>,
    sensor_id: Option<SensorId>,
    moisture_threshold: Option<f64>,
}

/// Absent fields keep their current value.
#[derive(Debug, Deserialize)]
struct UpdatePlant {
    name: Option<String>,
    species: Option<String>,
    location: Option<String>,
    zone_id: Option<i64>,
    sensor_id: Option<SensorId>,
    moisture_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct PlantHealth {
    plant_id: PlantId,
    days: i64,
    threshold: f64,
    #[serde(flatten)]
    report: HealthReport,
}

async fn list_plants(
    State(state): State<AppState>,
    Query(page): Query<Page>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Plant>>> {
    let (skip, limit) = page.bounds();
    Ok(Json(
        state
            .db
            .list_plants(requester(&headers), skip, limit)
            .await?,
    ))
}

/// The caller becomes the plant's owner; without an owner header the plant
/// is public.
/// Checks shared by plant creation and update. `current` is the plant being
/// edited, which may keep its own name and sensor.
async fn check_plant(db: &Db, p: &NewPlant, current: Option<PlantId>) -> ApiResult<()> {
    if p.name.is_empty() {
        return Err(ApiError::bad_request("name is empty"));
    }
    if let Some(moisture_threshold) = p.moisture_threshold {
        Threshold::Cutoff { moisture_threshold }.validate()?;
    }
    if let Some(other) = db.get_plant_by_name(&p.name).await? {
        if Some(other.id) != current {
            return Err(ApiError::conflict(format!("plant '{}' already exists", p.name)));
        }
    }
    if let Some(zone_id) = p.zone_id {
        if db.get_zone(zone_id).await?.is_none() {
            return Err(ApiError::bad_request(format!("unknown zone {zone_id}")));
        }
    }
    if let Some(sensor_id) = p.sensor_id {
        if db.get_sensor(sensor_id).await?.is_none() {
            return Err(ApiError::bad_request(format!("unknown sensor {sensor_id}")));
        }
        if let Some(bound) = db.plant_for_sensor(sensor_id).await? {
            if Some(bound.id) != current {
                return Err(ApiError::conflict(format!(
                    "sensor {sensor_id} is already bound to a plant"
                )));
            }
        }
    }
    Ok(())
}

async fn create_plant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePlant>,
) -> ApiResult<(StatusCode, Json<Plant>)> {
    let new = NewPlant {
        name: body.name.trim().to_string(),
        species: body.species,
        location: body.location,
        owner: requester(&headers).map(str::to_string),
        zone_id: body.zone_id,
        sensor_id: body.sensor_id,
        moisture_threshold: body.moisture_threshold,
    };
    check_plant(&state.db, &new, None).await?;

    let plant = state.db.create_plant(&new).await?;
    info!(plant = plant.id, name = %plant.name, "api: plant created");
    Ok((StatusCode::CREATED, Json(plant)))
}

async fn update_plant(
    State(state): State<AppState>,
    Path(id): Path<PlantId>,
    headers: HeaderMap,
    Json(body): Json<UpdatePlant>,
) -> ApiResult<Json<Plant>> {
    let current = visible_plant(&state.db, id, &headers).await?;
    let merged = NewPlant {
        name: body
            .name
            .map(|n| n.trim().to_string())
            .unwrap_or(current.name),
        species: body.species.or(current.species),
        location: body.location.or(current.location),
        owner: current.owner,
        zone_id: body.zone_id.or(current.zone_id),
        sensor_id: body.sensor_id.or(current.sensor_id),
        moisture_threshold: body.moisture_threshold.or(current.moisture_threshold),
    };
    check_plant(&state.db, &merged, Some(current.id)).await?;

    let plant = state
        .db
        .update_plant(current.id, &merged)
        .await?
        .ok_or_else(|| ApiError::not_found("plant"))?;
    info!(plant = plant.id, name = %plant.name, "api: plant updated");
    Ok(Json(plant))
}

async fn get_plant(
    State(state): State<AppState>,
    Path(id): Path<PlantId>,
    headers: HeaderMap,
) -> ApiResult<Json<Plant>> {
    Ok(Json(visible_plant(&state.db, id, &headers).await?))
}

/// Health over the last `days` of the plant's sensor readings. The plant's
/// cutoff is the reference; a plant without one falls back to its sensor's
/// minimum.
async fn plant_health(
    State(state): State<AppState>,
    Path(id): Path<PlantId>,
    Query(q): Query<HealthQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<PlantHealth>> {
    let days = q.days.unwrap_or(state.health_window_days);
    if !(1..=MAX_HEALTH_DAYS).contains(&days) {
        return Err(ApiError::bad_request(format!(
            "days must be in [1, {MAX_HEALTH_DAYS}], got {days}"
        )));
    }
    let plant = visible_plant(&state.db, id, &headers).await?;

    let sensor_floor = match plant.sensor_id {
        Some(sensor_id) => state
            .db
            .get_threshold(sensor_id)
            .await?
            .and_then(|t| t.floor()),
        None => None,
    };
    let threshold = plant
        .threshold()
        .and_then(|t| t.floor())
        .or(sensor_floor)
        .ok_or_else(|| ApiError::bad_request("plant has no moisture threshold"))?;

    let report = match plant.sensor_id {
        Some(sensor_id) => {
            let start = OffsetDateTime::now_utc() - Duration::days(days);
            let readings = state
                .db
                .readings_for_sensor(sensor_id, Some(start.unix_timestamp()), None)
                .await?;
            summarize(&readings, threshold)
        }
        None => HealthReport::no_data(),
    };

    Ok(Json(PlantHealth {
        plant_id: plant.id,
        days,
        threshold,
        report,
    }))
}

// -- Watering ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSchedule {
    plant_id: PlantId,
    day_of_week: i64,
    time: String,
    duration: f64,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct CreateWateringEvent {
    plant_id: PlantId,
    duration: f64,
    amount: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
}

async fn list_schedules(
    State(state): State<AppState>,
    Query(page): Query<Page>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<WateringSchedule>>> {
    let (skip, limit) = page.bounds();
    Ok(Json(
        state
            .db
            .list_schedules(requester(&headers), skip, limit)
            .await?,
    ))
}

async fn create_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSchedule>,
) -> ApiResult<(StatusCode, Json<WateringSchedule>)> {
    let day = validate_day_of_week(body.day_of_week)?;
    let time = ScheduleTime::parse(&body.time)?;
    check_positive("duration", body.duration)?;
    check_positive("amount", body.amount)?;
    let plant = visible_plant(&state.db, body.plant_id, &headers).await?;

    let schedule = state
        .db
        .insert_schedule(plant.id, day, &time, body.duration, body.amount)
        .await?;
    info!(
        plant = plant.id,
        day,
        time = %time,
        "api: watering schedule created"
    );
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// Plants whose schedule has fired today and that are out of cooldown.
async fn due_plants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<PlantId>>> {
    let now = OffsetDateTime::now_utc().to_offset(state.utc_offset);
    let schedules = state.db.load_schedules().await?;
    let last_events = state.db.last_events_by_plant().await?;

    let mut visible = Vec::new();
    for id in due_for_watering(now, &schedules, &last_events) {
        if authorize_plant(state.db.get_plant(id).await?, requester(&headers)).is_some() {
            visible.push(id);
        }
    }
    Ok(Json(visible))
}

async fn list_watering_events(
    State(state): State<AppState>,
    Query(page): Query<Page>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<WateringEvent>>> {
    let (skip, limit) = page.bounds();
    Ok(Json(
        state
            .db
            .list_watering_events(requester(&headers), skip, limit)
            .await?,
    ))
}

/// Record a manual watering. Manual events count toward the cooldown of
/// automatic ones.
async fn create_watering_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateWateringEvent>,
) -> ApiResult<(StatusCode, Json<WateringEvent>)> {
    check_positive("duration", body.duration)?;
    check_positive("amount", body.amount)?;
    let plant = visible_plant(&state.db, body.plant_id, &headers).await?;

    let ts = body.timestamp.unwrap_or_else(OffsetDateTime::now_utc);
    let event = state
        .db
        .insert_watering_event(ts.unix_timestamp(), plant.id, body.duration, body.amount, false)
        .await?;
    state.shared.write().await.record_watering(plant.id, false);
    info!(plant = plant.id, amount = body.amount, "api: manual watering recorded");
    Ok((StatusCode::CREATED, Json(event)))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> (Router, Db) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let state = AppState {
            db: db.clone(),
            shared: SystemState::shared(),
            health_window_days: 7,
            utc_offset: UtcOffset::UTC,
        };
        (router(state), db)
    }

    fn request(method: Method, uri: &str, owner: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner);
        }
        match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        send(app, request(Method::GET, uri, None, None)).await
    }

    async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        send(app, request(Method::POST, uri, None, Some(body))).await
    }

    #[tokio::test]
    async fn ping_pongs() {
        let (app, _) = app().await;
        let (status, body) = get(&app, "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "pong" }));
    }

    #[tokio::test]
    async fn reading_flow_raises_and_resolves_alerts() {
        let (app, _) = app().await;

        let (status, body) = post(
            &app,
            "/api/readings",
            json!({ "device_id": "esp-01", "sensor_id": 0, "moisture": 55.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["alerts"], json!([]));
        let sensor_id = body["reading"]["sensor_id"].as_i64().unwrap();

        let (status, _) = send(
            &app,
            request(
                Method::PUT,
                &format!("/api/sensors/{sensor_id}/threshold"),
                None,
                Some(json!({ "min_moisture": 20.0, "max_moisture": 80.0 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = post(
            &app,
            "/api/readings",
            json!({ "device_id": "esp-01", "sensor_id": 0, "moisture": 15.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["alerts"][0]["kind"], "low_moisture");
        assert_eq!(body["alerts"][0]["source"]["type"], "sensor");

        let (_, open) = get(&app, "/api/alerts?unresolved=true").await;
        let open = open.as_array().unwrap().clone();
        assert_eq!(open.len(), 1);
        let alert_id = open[0]["id"].as_i64().unwrap();

        let (status, resolved) = send(
            &app,
            request(Method::PUT, &format!("/api/alerts/{alert_id}"), None, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["resolved"], true);

        let (_, summary) = get(&app, "/api/summary").await;
        assert_eq!(summary["active_alerts"], 0);
        assert_eq!(summary["total_sensors"], 1);

        let (_, status) = get(&app, "/api/status").await;
        assert_eq!(status["counters"]["readings"], 2);
    }

    #[tokio::test]
    async fn out_of_range_moisture_rejected() {
        let (app, _) = app().await;
        let (status, body) = post(
            &app,
            "/api/readings",
            json!({ "device_id": "esp-01", "sensor_id": 0, "moisture": 140.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn sensor_reading_requires_known_sensor() {
        let (app, _) = app().await;
        let (status, _) = post(&app, "/api/sensors/42/readings", json!({ "moisture": 40.0 })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registration_conflicts_and_missing_devices() {
        let (app, _) = app().await;
        let (status, _) = post(&app, "/api/devices", json!({ "device_id": "esp-01" })).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = post(&app, "/api/devices", json!({ "device_id": "esp-01" })).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let sensor = json!({ "device_id": "esp-01", "index": 0 });
        let (status, _) = post(&app, "/api/sensors", sensor.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = post(&app, "/api/sensors", sensor).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post(&app, "/api/sensors", json!({ "device_id": "esp-99", "index": 0 })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, devices) = get(&app, "/api/devices").await;
        let id = devices[0]["id"].as_i64().unwrap();
        let (status, detail) = get(&app, &format!("/api/devices/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["device_id"], "esp-01");
        assert_eq!(detail["sensors"][0]["index"], 0);
    }

    #[tokio::test]
    async fn inverted_threshold_rejected() {
        let (app, db) = app().await;
        let dev = db.create_device("esp-01", None).await.unwrap();
        let sensor = db.create_sensor(dev.id, 0, None).await.unwrap();

        let (status, body) = send(
            &app,
            request(
                Method::PUT,
                &format!("/api/sensors/{}/threshold", sensor.id),
                None,
                Some(json!({ "min_moisture": 70.0, "max_moisture": 30.0 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("must not exceed"));

        let (status, _) = get(&app, &format!("/api/sensors/{}/threshold", sensor.id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_schedule_time_rejected() {
        let (app, db) = app().await;
        let plant = db
            .create_plant(&NewPlant {
                name: "fern".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let (status, body) = post(
            &app,
            "/api/watering/schedules",
            json!({ "plant_id": plant.id, "day_of_week": 2, "time": "8am", "duration": 30.0, "amount": 250.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("HH:MM"));

        let (status, body) = post(
            &app,
            "/api/watering/schedules",
            json!({ "plant_id": plant.id, "day_of_week": 2, "time": "08:00", "duration": 30.0, "amount": 250.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["time"], "08:00");
    }

    #[tokio::test]
    async fn foreign_plants_look_missing() {
        let (app, _) = app().await;
        let (status, plant) = send(
            &app,
            request(
                Method::POST,
                "/api/plants",
                Some("alice"),
                Some(json!({ "name": "orchid", "moisture_threshold": 40.0 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(plant["owner"], "alice");
        let uri = format!("/api/plants/{}", plant["id"]);

        let (status, _) = send(&app, request(Method::GET, &uri, Some("alice"), None)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, request(Method::GET, &uri, Some("bob"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&app, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, listed) = get(&app, "/api/plants").await;
        assert_eq!(listed, json!([]));
    }

    #[tokio::test]
    async fn plant_health_uses_cutoff() {
        let (app, db) = app().await;
        let dev = db.create_device("esp-01", None).await.unwrap();
        let sensor = db.create_sensor(dev.id, 0, None).await.unwrap();
        let plant = db
            .create_plant(&NewPlant {
                name: "basil".into(),
                sensor_id: Some(sensor.id),
                moisture_threshold: Some(30.0),
                ..Default::default()
            })
            .await
            .unwrap();

        let (_, body) = get(&app, &format!("/api/plants/{}/health", plant.id)).await;
        assert_eq!(body["status"], "No data available for analysis");
        assert_eq!(body["count"], 0);

        let recent = OffsetDateTime::now_utc().unix_timestamp() - 60;
        db.insert_reading(recent, sensor.id, 40.0).await.unwrap();
        db.insert_reading(recent, sensor.id, 50.0).await.unwrap();
        // Outside the default 7-day window.
        db.insert_reading(recent - 30 * 86_400, sensor.id, 0.0).await.unwrap();

        let (status, body) = get(&app, &format!("/api/plants/{}/health", plant.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Healthy");
        assert_eq!(body["average"], 45.0);
        assert_eq!(body["count"], 2);
        assert_eq!(body["threshold"], 30.0);

        let (status, _) = get(&app, &format!("/api/plants/{}/health?days=0", plant.id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn plant_health_without_threshold_rejected() {
        let (app, db) = app().await;
        let plant = db
            .create_plant(&NewPlant {
                name: "cactus".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let (status, _) = get(&app, &format!("/api/plants/{}/health", plant.id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn manual_watering_is_recorded() {
        let (app, db) = app().await;
        let plant = db
            .create_plant(&NewPlant {
                name: "mint".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let (status, body) = post(
            &app,
            "/api/watering/events",
            json!({ "plant_id": plant.id, "duration": 20.0, "amount": 150.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["is_automatic"], false);

        let (_, events) = get(&app, "/api/watering/events").await;
        assert_eq!(events.as_array().unwrap().len(), 1);

        // Every weekday at midnight: due unless watered within a day.
        for day in 0..7 {
            db.insert_schedule(plant.id, day, &ScheduleTime::parse("00:00").unwrap(), 10.0, 100.0)
                .await
                .unwrap();
        }
        let (_, due) = get(&app, "/api/watering/due").await;
        assert_eq!(due, json!([]));

        let (status, _) = post(
            &app,
            "/api/watering/events",
            json!({ "plant_id": plant.id, "duration": 0.0, "amount": 150.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn zone_lists_its_plants() {
        let (app, db) = app().await;
        let (status, zone) = post(&app, "/api/zones", json!({ "name": "balcony" })).await;
        assert_eq!(status, StatusCode::CREATED);
        let zone_id = zone["id"].as_i64().unwrap();

        db.create_plant(&NewPlant {
            name: "tomato".into(),
            zone_id: Some(zone_id),
            ..Default::default()
        })
        .await
        .unwrap();

        let (_, plants) = get(&app, &format!("/api/zones/{zone_id}/plants")).await;
        assert_eq!(plants[0]["name"], "tomato");

        let (status, _) = post(&app, "/api/zones", json!({ "name": "balcony" })).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = get(&app, "/api/zones/999/plants").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plant_health_rejects_oversized_window() {
        let (app, db) = app().await;
        let plant = db
            .create_plant(&NewPlant {
                name: "basil".into(),
                moisture_threshold: Some(30.0),
                ..Default::default()
            })
            .await
            .unwrap();

        for days in ["1000000000", "36501", "-3"] {
            let (status, body) =
                get(&app, &format!("/api/plants/{}/health?days={days}", plant.id)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "days={days}");
            assert!(body["error"].as_str().unwrap().contains("days"));
        }
        let (status, _) = get(&app, &format!("/api/plants/{}/health?days=36500", plant.id)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn plant_update_keeps_omitted_fields() {
        let (app, db) = app().await;
        let dev = db.create_device("esp-01", None).await.unwrap();
        let s1 = db.create_sensor(dev.id, 0, None).await.unwrap();
        let s2 = db.create_sensor(dev.id, 1, None).await.unwrap();
        let (_, plant) = send(
            &app,
            request(
                Method::POST,
                "/api/plants",
                Some("ana"),
                Some(json!({ "name": "fern", "species": "nephrolepis", "sensor_id": s1.id })),
            ),
        )
        .await;
        let uri = format!("/api/plants/{}", plant["id"]);
        db.create_plant(&NewPlant {
            name: "ivy".into(),
            sensor_id: Some(s2.id),
            ..Default::default()
        })
        .await
        .unwrap();

        let put = |body: Value, owner: Option<&'static str>| request(Method::PUT, &uri, owner, Some(body));

        let (status, body) = send(&app, put(json!({ "moisture_threshold": 35.0 }), Some("ana"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["moisture_threshold"], 35.0);
        assert_eq!(body["species"], "nephrolepis");
        assert_eq!(body["sensor_id"], s1.id);
        assert_eq!(body["owner"], "ana");

        // Keeping its own name and sensor is fine.
        let (status, _) = send(&app, put(json!({ "name": "fern", "sensor_id": s1.id }), Some("ana"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, put(json!({ "name": "ivy" }), Some("ana"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(&app, put(json!({ "sensor_id": s2.id }), Some("ana"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(&app, put(json!({ "moisture_threshold": 120.0 }), Some("ana"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, put(json!({ "zone_id": 42 }), Some("ana"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, put(json!({ "name": "mine" }), Some("bob"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn zone_edit_and_delete() {
        let (app, db) = app().await;
        let (_, zone) = post(&app, "/api/zones", json!({ "name": "balcony" })).await;
        post(&app, "/api/zones", json!({ "name": "kitchen" })).await;
        let uri = format!("/api/zones/{}", zone["id"]);
        let plant = db
            .create_plant(&NewPlant {
                name: "tomato".into(),
                zone_id: zone["id"].as_i64(),
                ..Default::default()
            })
            .await
            .unwrap();

        let (status, body) = send(
            &app,
            request(Method::PUT, &uri, None, Some(json!({ "name": "terrace", "description": "south" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "terrace");
        let (_, body) = get(&app, &uri).await;
        assert_eq!(body["description"], "south");

        let (status, _) = send(
            &app,
            request(Method::PUT, &uri, None, Some(json!({ "name": "kitchen" }))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, request(Method::DELETE, &uri, None, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = get(&app, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, request(Method::DELETE, &uri, None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get(&app, &format!("/api/plants/{}", plant.id)).await;
        assert_eq!(body["zone_id"], Value::Null);
    }

    #[tokio::test]
    async fn device_rename_and_sensor_listing() {
        let (app, _) = app().await;
        let (_, device) = post(&app, "/api/devices", json!({ "device_id": "esp-01" })).await;
        post(&app, "/api/sensors", json!({ "device_id": "esp-01", "index": 0 })).await;
        post(&app, "/api/sensors", json!({ "device_id": "esp-01", "index": 1 })).await;

        let uri = format!("/api/devices/{}", device["id"]);
        let (status, body) = send(
            &app,
            request(Method::PUT, &uri, None, Some(json!({ "name": "greenhouse" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "greenhouse");
        let (status, _) = send(
            &app,
            request(Method::PUT, "/api/devices/999", None, Some(json!({ "name": "x" }))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, sensors) = get(&app, "/api/sensors").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sensors.as_array().unwrap().len(), 2);
        let (_, sensors) = get(&app, "/api/sensors?skip=1&limit=5").await;
        assert_eq!(sensors[0]["index"], 1);
    }

    #[tokio::test]
    async fn alert_fetch_and_delete() {
        let (app, _) = app().await;
        post(&app, "/api/devices", json!({ "device_id": "esp-01" })).await;
        let (_, sensor) = post(&app, "/api/sensors", json!({ "device_id": "esp-01", "index": 0 })).await;
        send(
            &app,
            request(
                Method::PUT,
                &format!("/api/sensors/{}/threshold", sensor["id"]),
                None,
                Some(json!({ "min_moisture": 20.0 })),
            ),
        )
        .await;
        let (_, out) = post(
            &app,
            &format!("/api/sensors/{}/readings", sensor["id"]),
            json!({ "moisture": 5.0 }),
        )
        .await;
        let uri = format!("/api/alerts/{}", out["alerts"][0]["id"]);

        let (status, body) = get(&app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "low_moisture");

        let (status, _) = send(&app, request(Method::DELETE, &uri, None, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = get(&app, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, request(Method::DELETE, &uri, None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
