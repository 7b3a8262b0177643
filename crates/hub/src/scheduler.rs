//! Schedule-driven watering: decides which plants are due and runs the
//! periodic sweep that records automatic watering events.
//!
//! A schedule is due when its weekday matches `now` and its `HH:MM` is at or
//! before the current wall-clock time. A due plant is only watered if its
//! last watering event is older than [`COOLDOWN`]. The cooldown is a flat
//! 24 hours and does not depend on how often the plant is scheduled.

use std::collections::{HashMap, HashSet};

use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, error, info};

use crate::db::Db;
use crate::model::{
    AlertDraft, AlertKind, AlertSource, PlantId, ScheduleTime, WateringEvent, WateringSchedule,
};
use crate::state::SharedState;

/// Minimum gap between two watering events for the same plant.
pub const COOLDOWN: Duration = Duration::hours(24);

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// `t` without its sub-second part. Stored event times are whole seconds, so
/// the cooldown is compared at that precision everywhere.
fn whole_seconds(t: OffsetDateTime) -> OffsetDateTime {
    t - Duration::nanoseconds(i64::from(t.nanosecond()))
}

/// The schedules that should fire at `now`, at most one per plant.
///
/// When several schedules for one plant qualify, the first in `schedules`
/// order wins.
pub fn due_schedules<'a>(
    now: OffsetDateTime,
    schedules: &'a [WateringSchedule],
    last_event_by_plant: &HashMap<PlantId, WateringEvent>,
) -> Vec<&'a WateringSchedule> {
    let now = whole_seconds(now);
    let today = now.weekday().number_days_from_monday();
    let clock = ScheduleTime::of(now);
    let cooldown_start = now - COOLDOWN;
    let mut seen: HashSet<PlantId> = HashSet::new();

    schedules
        .iter()
        .filter(|s| s.day_of_week == today && s.time <= clock)
        .filter(|s| match last_event_by_plant.get(&s.plant_id) {
            None => true,
            Some(last) => last.timestamp < cooldown_start,
        })
        .filter(|s| seen.insert(s.plant_id))
        .collect()
}

/// Plant ids due for watering at `now`. Each id appears at most once.
pub fn due_for_watering(
    now: OffsetDateTime,
    schedules: &[WateringSchedule],
    last_event_by_plant: &HashMap<PlantId, WateringEvent>,
) -> Vec<PlantId> {
    due_schedules(now, schedules, last_event_by_plant)
        .into_iter()
        .map(|s| s.plant_id)
        .collect()
}

// ---------------------------------------------------------------------------
// Sweep loop
// ---------------------------------------------------------------------------

/// Run the sweep loop. Intended to be `tokio::spawn`-ed from main.
///
/// Schedules are written in local wall-clock time; `offset` converts the
/// UTC clock into that frame before each sweep.
pub async fn run(db: Db, shared: SharedState, interval: std::time::Duration, offset: UtcOffset) {
    let mut ticker = tokio::time::interval(interval);

    info!(
        interval_sec = interval.as_secs(),
        %offset,
        "scheduler started"
    );
    {
        let mut st = shared.write().await;
        st.record_system(format!(
            "scheduler started (every {}s, offset {offset})",
            interval.as_secs()
        ));
    }

    loop {
        ticker.tick().await;
        let now = OffsetDateTime::now_utc().to_offset(offset);
        sweep(&db, &shared, now).await;
    }
}

/// One pass over all schedules. Returns the watering events created.
///
/// Failures are logged and recorded in the shared event log; the next tick
/// starts from fresh data.
pub async fn sweep(db: &Db, shared: &SharedState, now: OffsetDateTime) -> Vec<WateringEvent> {
    let now = whole_seconds(now);
    let schedules = match db.load_schedules().await {
        Ok(s) => s,
        Err(e) => {
            error!("scheduler: load_schedules failed: {e:#}");
            shared
                .write()
                .await
                .record_error(format!("sweep: load_schedules failed: {e}"));
            return Vec::new();
        }
    };

    let last_events = match db.last_events_by_plant().await {
        Ok(m) => m,
        Err(e) => {
            error!("scheduler: last_events_by_plant failed: {e:#}");
            shared
                .write()
                .await
                .record_error(format!("sweep: last_events_by_plant failed: {e}"));
            return Vec::new();
        }
    };

    let due = due_schedules(now, &schedules, &last_events);
    let ts = now.unix_timestamp();
    let cooldown_start = (now - COOLDOWN).unix_timestamp();
    let mut created = Vec::new();

    for schedule in due {
        match db.record_automatic_watering(ts, schedule, cooldown_start).await {
            Ok(Some(event)) => {
                info!(
                    plant = schedule.plant_id,
                    schedule = schedule.id,
                    duration = schedule.duration,
                    amount = schedule.amount,
                    "scheduler: automatic watering recorded"
                );
                shared.write().await.record_watering(schedule.plant_id, true);
                created.push(event);
            }
            Ok(None) => {
                debug!(
                    plant = schedule.plant_id,
                    "scheduler: plant watered since evaluation, skipping"
                );
            }
            Err(e) => {
                error!(plant = schedule.plant_id, "scheduler: watering insert failed: {e:#}");
                shared.write().await.record_error(format!(
                    "sweep: plant {} watering insert failed: {e}",
                    schedule.plant_id
                ));
                let draft = AlertDraft {
                    kind: AlertKind::SystemError,
                    message: format!("Automatic watering could not be recorded: {e}"),
                };
                if let Err(e) = db
                    .insert_alert(ts, AlertSource::Plant(schedule.plant_id), &draft)
                    .await
                {
                    error!(plant = schedule.plant_id, "scheduler: system alert insert failed: {e:#}");
                }
            }
        }
    }

    shared.write().await.record_sweep(now);
    created
}

// ===========================================================================
// Tests
// ===========================================================================
