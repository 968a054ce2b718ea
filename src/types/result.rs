//! Result object returned to job submitters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Info text of the busy response produced by the admission gate.
pub const SERVICE_UNAVAILABLE: &str = "Service unavailable";

/// Outcome of a job, built once per request by the solving path or an error path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultObject {
    pub success: bool,
    /// Aggregate maximum route distance (km x 1000)
    pub result: i64,
    /// Elapsed time since submission, empty when unknown
    pub duration: String,
    pub info: String,
}

impl ResultObject {
    pub fn solved(result: i64, submitted_at: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            result,
            duration: elapsed_since(submitted_at),
            info: String::new(),
        }
    }

    pub fn failure(info: impl Into<String>) -> Self {
        Self {
            success: false,
            result: 0,
            duration: String::new(),
            info: info.into(),
        }
    }

    pub fn busy(submitted_at: Option<DateTime<Utc>>) -> Self {
        Self {
            duration: elapsed_since(submitted_at),
            ..Self::failure(SERVICE_UNAVAILABLE)
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        // Plain struct of strings and integers; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Elapsed time since `submitted_at`, formatted `[d.]hh:mm:ss.fffffff`.
pub fn elapsed_since(submitted_at: Option<DateTime<Utc>>) -> String {
    submitted_at
        .map(|start| format_elapsed(Utc::now() - start))
        .unwrap_or_default()
}

pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let negative = elapsed < chrono::Duration::zero();
    let elapsed = if negative { -elapsed } else { elapsed };

    let total_seconds = elapsed.num_seconds();
    let ticks = (elapsed - chrono::Duration::seconds(total_seconds))
        .num_nanoseconds()
        .unwrap_or(0)
        / 100;
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let sign = if negative { "-" } else { "" };
    let clock = format!("{hours:02}:{minutes:02}:{seconds:02}.{ticks:07}");
    if days > 0 {
        format!("{sign}{days}.{clock}")
    } else {
        format!("{sign}{clock}")
    }
}
