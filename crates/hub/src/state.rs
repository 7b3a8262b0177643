use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub counters: Counters,
    pub last_sweep: Option<OffsetDateTime>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub readings: u64,
    pub alerts: u64,
    pub waterings: u64,
    pub errors: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Alert,
    Watering,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub counters: Counters,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sweep: Option<OffsetDateTime>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: Counters::default(),
            last_sweep: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record an ingested reading.
    pub fn record_reading(&mut self, sensor_id: i64, moisture: f64) {
        self.counters.readings += 1;
        self.push_event(EventKind::Reading, format!("sensor {sensor_id}: {moisture}"));
    }

    /// Record a persisted alert.
    pub fn record_alert(&mut self, detail: String) {
        self.counters.alerts += 1;
        self.push_event(EventKind::Alert, detail);
    }

    /// Record an automatic or manual watering event.
    pub fn record_watering(&mut self, plant_id: i64, automatic: bool) {
        self.counters.waterings += 1;
        let how = if automatic { "automatic" } else { "manual" };
        self.push_event(EventKind::Watering, format!("plant {plant_id}: {how} watering"));
    }

    pub fn record_sweep(&mut self, at: OffsetDateTime) {
        self.last_sweep = Some(at);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.counters.errors += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            counters: self.counters,
            last_sweep: self.last_sweep,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
