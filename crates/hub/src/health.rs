//! Plant health summary over a window of readings.

use serde::Serialize;

use crate::model::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    #[serde(rename = "Healthy")]
    Healthy,
    #[serde(rename = "Needs attention")]
    NeedsAttention,
    #[serde(rename = "No data available for analysis")]
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub count: usize,
    pub status: HealthStatus,
}

impl HealthReport {
    pub fn no_data() -> Self {
        Self {
            average: None,
            minimum: None,
            maximum: None,
            count: 0,
            status: HealthStatus::NoData,
        }
    }
}

/// Aggregate `readings` and judge them against `threshold`. A plant is
/// healthy when its average moisture is at or above the threshold.
pub fn summarize(readings: &[Reading], threshold: f64) -> HealthReport {
    if readings.is_empty() {
        return HealthReport::no_data();
    }

    let count = readings.len();
    let (sum, min, max) = readings.iter().fold(
        (0.0_f64, f64::INFINITY, f64::NEG_INFINITY),
        |(sum, min, max), r| (sum + r.moisture, min.min(r.moisture), max.max(r.moisture)),
    );
    let average = sum / count as f64;

    HealthReport {
        average: Some(average),
        minimum: Some(min),
        maximum: Some(max),
        count,
        status: if average >= threshold {
            HealthStatus::Healthy
        } else {
            HealthStatus::NeedsAttention
        },
    }
}
