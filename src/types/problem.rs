//! Job document types shared by the gateway, the dispatcher and the solver.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Combinatorial problem families the relay knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProblemType {
    Vrp,
    Knapsack,
    CpSat,
}

impl ProblemType {
    pub const ALL: [ProblemType; 3] = [ProblemType::Vrp, ProblemType::Knapsack, ProblemType::CpSat];

    pub const fn as_str(self) -> &'static str {
        match self {
            ProblemType::Vrp => "VRP",
            ProblemType::Knapsack => "Knapsack",
            ProblemType::CpSat => "CpSat",
        }
    }

    /// Numeric discriminant used by older clients that send the enum as an integer.
    fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(ProblemType::Vrp),
            1 => Some(ProblemType::Knapsack),
            2 => Some(ProblemType::CpSat),
            _ => None,
        }
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown problem type '{0}'")]
pub struct UnknownProblemType(pub String);

impl FromStr for ProblemType {
    type Err = UnknownProblemType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProblemType::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProblemType(s.to_string()))
    }
}

impl Serialize for ProblemType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProblemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ProblemTypeVisitor;

        impl Visitor<'_> for ProblemTypeVisitor {
            type Value = ProblemType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a problem type name or index")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ProblemType, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ProblemType, E> {
                ProblemType::from_index(v)
                    .ok_or_else(|| E::custom(format!("unknown problem type index {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ProblemType, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(ProblemType::from_index)
                    .ok_or_else(|| E::custom(format!("unknown problem type index {v}")))
            }
        }

        deserializer.deserialize_any(ProblemTypeVisitor)
    }
}

/// Job identity and submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(alias = "Id")]
    pub id: i64,
    #[serde(
        default,
        alias = "Timestamp",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A submitted optimization job.
///
/// `job_data` is kept opaque here; each solver parses the part it understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemRequest {
    #[serde(alias = "JobData")]
    pub job_data: Map<String, Value>,
    #[serde(alias = "Metadata")]
    pub metadata: Metadata,
    #[serde(alias = "ProblemType")]
    pub problem_type: ProblemType,
}

impl ProblemRequest {
    pub fn job_id(&self) -> i64 {
        self.metadata.id
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.timestamp
    }

    /// Stamp the submission time unless the caller already did.
    pub fn enrich_timestamp(&mut self, now: DateTime<Utc>) {
        self.metadata.timestamp.get_or_insert(now);
    }
}

/// A point to visit, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(alias = "Latitude")]
    pub latitude: f64,
    #[serde(alias = "Longitude")]
    pub longitude: f64,
}

impl Location {
    #[cfg(test)]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// `jobData` of a VRP job.
///
/// Counts are signed so that out-of-range input reaches validation instead
/// of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrpJob {
    #[serde(default, alias = "Locations")]
    pub locations: Vec<Location>,
    #[serde(default, alias = "VehicleNumber")]
    pub vehicle_number: i64,
    #[serde(default, alias = "MaxDistance")]
    pub max_distance: i64,
}

impl VrpJob {
    pub fn from_job_data(job_data: &Map<String, Value>) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(job_data.clone()))
    }
}

/// Accepts RFC 3339 timestamps as well as offset-less ones, which are read as UTC.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(|e| de::Error::custom(format!("invalid timestamp '{raw}': {e}")))
}
