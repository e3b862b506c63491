//! Meteorological input records and their grouping into monthly batches
//!
//! Each batch is processed end to end independently of every other batch, so the
//! partitioning here is the unit of failure isolation for the whole run.

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `NaN` as `null`, which JSON has no number for
mod missing_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// One observation of the flux tower's micrometeorology
///
/// Missing measurements are stored as `NaN` and serialised as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteorologicalRecord {
    pub timestamp: NaiveDateTime,
    /// Friction velocity
    /// unit: m / s
    #[serde(with = "missing_as_null")]
    pub ustar: f64,
    /// unit: m
    #[serde(with = "missing_as_null")]
    pub tower_height: f64,
    /// unit: m
    #[serde(with = "missing_as_null")]
    pub displacement_height: f64,
    /// Aerodynamic roughness length
    /// unit: m
    #[serde(with = "missing_as_null")]
    pub roughness_length: f64,
    /// Mean wind speed at measurement height
    /// unit: m / s
    #[serde(with = "missing_as_null")]
    pub wind_speed: f64,
    /// Direction the wind blows from, clockwise from north
    /// unit: degrees
    #[serde(with = "missing_as_null")]
    pub wind_direction: f64,
    /// Obukhov length
    /// unit: m
    #[serde(with = "missing_as_null")]
    pub mo_length: f64,
    /// Standard deviation of the lateral wind component
    /// unit: m / s
    #[serde(with = "missing_as_null")]
    pub v_sigma: f64,
    /// Planetary boundary layer height
    /// unit: m
    #[serde(with = "missing_as_null")]
    pub pblh: f64,
}

impl MeteorologicalRecord {
    /// Measurement height above the displacement height
    pub fn zm(&self) -> f64 {
        self.tower_height - self.displacement_height
    }

    pub fn batch_key(&self) -> BatchKey {
        BatchKey {
            year: self.timestamp.year(),
            month: self.timestamp.month(),
        }
    }

    /// Named scalar covariates in the order they are stored alongside the footprints
    pub fn covariates(&self) -> [(&'static str, f64); 10] {
        [
            ("USTAR", self.ustar),
            ("zm", self.zm()),
            ("TOWER_HEIGHT", self.tower_height),
            ("DISPLACEMENT_HEIGHT", self.displacement_height),
            ("ROUGHNESS_LENGTH", self.roughness_length),
            ("WS", self.wind_speed),
            ("WD", self.wind_direction),
            ("MO_LENGTH", self.mo_length),
            ("V_SIGMA", self.v_sigma),
            ("PBLH", self.pblh),
        ]
    }
}

/// Calendar month identifying a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub year: i32,
    pub month: u32,
}

impl BatchKey {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// `YYYY-MM`, used to name the batch's output files
    pub fn file_stem(&self) -> String {
        format!("{}-{:02}", self.year, self.month)
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}

/// The records of one calendar month, sorted by timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyBatch {
    pub key: BatchKey,
    pub records: Vec<MeteorologicalRecord>,
}

impl MonthlyBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Group records into disjoint (year, month) batches
///
/// Batches are returned in chronological order. Within a batch records are sorted by
/// timestamp; records sharing a timestamp keep their input order.
pub fn partition_by_month(records: Vec<MeteorologicalRecord>) -> Vec<MonthlyBatch> {
    let mut groups: BTreeMap<BatchKey, Vec<MeteorologicalRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.batch_key()).or_default().push(record);
    }

    groups
        .into_iter()
        .map(|(key, mut records)| {
            records.sort_by_key(|r| r.timestamp);
            MonthlyBatch { key, records }
        })
        .collect()
}
