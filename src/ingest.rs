//! Reading meteorological records from CSV
//!
//! The input table has a header row with (at least) the columns
//!
//! ```csv
//! datetime,USTAR,TOWER_HEIGHT,DISPLACEMENT_HEIGHT,ROUGHNESS_LENGTH,WS,WD,MO_LENGTH,V_SIGMA,PBLH
//! 2021-05-01 00:00:00,0.41,12.0,2.0,0.1,3.2,225,-48.3,0.62,950
//! ```
//!
//! Other columns are ignored. Empty or unparsable numeric values are read as missing (`NaN`);
//! a missing or unparsable timestamp is an error.

use chrono::NaiveDateTime;
use ffp_core::errors::{FfpError, FfpResult};
use ffp_core::record::MeteorologicalRecord;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Accepted timestamp layouts, tried in order
const DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M",
];

#[derive(Debug, Deserialize)]
struct Row {
    datetime: String,
    #[serde(rename = "USTAR", deserialize_with = "csv::invalid_option")]
    ustar: Option<f64>,
    #[serde(rename = "TOWER_HEIGHT", deserialize_with = "csv::invalid_option")]
    tower_height: Option<f64>,
    #[serde(rename = "DISPLACEMENT_HEIGHT", deserialize_with = "csv::invalid_option")]
    displacement_height: Option<f64>,
    #[serde(rename = "ROUGHNESS_LENGTH", deserialize_with = "csv::invalid_option")]
    roughness_length: Option<f64>,
    #[serde(rename = "WS", deserialize_with = "csv::invalid_option")]
    wind_speed: Option<f64>,
    #[serde(rename = "WD", deserialize_with = "csv::invalid_option")]
    wind_direction: Option<f64>,
    #[serde(rename = "MO_LENGTH", deserialize_with = "csv::invalid_option")]
    mo_length: Option<f64>,
    #[serde(rename = "V_SIGMA", deserialize_with = "csv::invalid_option")]
    v_sigma: Option<f64>,
    #[serde(rename = "PBLH", deserialize_with = "csv::invalid_option")]
    pblh: Option<f64>,
}

pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

impl Row {
    fn into_record(self, line: u64) -> FfpResult<MeteorologicalRecord> {
        let timestamp = parse_datetime(&self.datetime).ok_or_else(|| {
            FfpError::Input(format!(
                "line {line}: cannot parse datetime {:?}",
                self.datetime
            ))
        })?;
        let value = |v: Option<f64>| v.unwrap_or(f64::NAN);
        Ok(MeteorologicalRecord {
            timestamp,
            ustar: value(self.ustar),
            tower_height: value(self.tower_height),
            displacement_height: value(self.displacement_height),
            roughness_length: value(self.roughness_length),
            wind_speed: value(self.wind_speed),
            wind_direction: value(self.wind_direction),
            mo_length: value(self.mo_length),
            v_sigma: value(self.v_sigma),
            pblh: value(self.pblh),
        })
    }
}

/// Read every record of a CSV table, in file order
pub fn read_records(reader: impl Read) -> FfpResult<Vec<MeteorologicalRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut records = Vec::new();
    for row in reader.deserialize::<Row>() {
        let row = row.map_err(|e| FfpError::Input(e.to_string()))?;
        let line = records.len() as u64 + 2;
        records.push(row.into_record(line)?);
    }
    Ok(records)
}

pub fn read_records_from_path(path: &Path) -> FfpResult<Vec<MeteorologicalRecord>> {
    let file = File::open(path).map_err(|e| FfpError::io(path, e))?;
    let records = read_records(file)
        .map_err(|e| FfpError::Input(format!("{}: {}", path.display(), e)))?;
    log::info!("Read {} records from {}", records.len(), path.display());
    Ok(records)
}
