//! Threshold evaluation for incoming moisture readings.
//!
//! Every violating reading yields a fresh draft. Nothing here remembers
//! earlier alerts, so a sensor that stays dry keeps alerting on every
//! reading.

use crate::model::{AlertDraft, AlertKind, Reading, Threshold};

/// Compare `reading` against `threshold` and return the alerts it triggers.
///
/// For a [`Threshold::Range`] the low bound is checked before the high bound
/// and both checks always run. A [`Threshold::Cutoff`] only has a low side.
pub fn evaluate(reading: &Reading, threshold: Option<&Threshold>) -> Vec<AlertDraft> {
    let mut drafts = Vec::new();
    let m = reading.moisture;

    match threshold {
        None => {}
        Some(Threshold::Range {
            min_moisture,
            max_moisture,
        }) => {
            if let Some(min) = *min_moisture {
                if m < min {
                    drafts.push(AlertDraft {
                        kind: AlertKind::LowMoisture,
                        message: format!("Moisture level below minimum threshold: {m}"),
                    });
                }
            }
            if let Some(max) = *max_moisture {
                if m > max {
                    drafts.push(AlertDraft {
                        kind: AlertKind::HighMoisture,
                        message: format!("Moisture level above maximum threshold: {m}"),
                    });
                }
            }
        }
        Some(Threshold::Cutoff { moisture_threshold }) => {
            if m < *moisture_threshold {
                drafts.push(AlertDraft {
                    kind: AlertKind::LowMoisture,
                    message: format!(
                        "Low moisture detected. Current: {m}%, Threshold: {moisture_threshold}%"
                    ),
                });
            }
        }
    }

    drafts
}
