//! Description of a monthly footprint volume
//!
//! A [`FootprintVolume`] is the `time x y x` layout of one batch together with its per-timestamp
//! covariate series. It holds no footprint values: those are produced chunk by chunk by the
//! workers and only ever live in a [`crate::store::VolumeStore`].

use crate::errors::{FfpError, FfpResult};
use crate::grid::GridSpec;
use crate::record::{BatchKey, MeteorologicalRecord};
use chrono::NaiveDateTime;
use indexmap::IndexMap;

/// Name of the footprint variable in every volume
pub const FOOTPRINT_VARIABLE: &str = "fp";

/// Layout and covariates of one batch's footprint volume
#[derive(Debug, Clone, PartialEq)]
pub struct FootprintVolume {
    pub key: BatchKey,
    pub time: Vec<NaiveDateTime>,
    pub y: Vec<i32>,
    pub x: Vec<i32>,
    /// One series per covariate, each with one value per time index
    pub covariates: IndexMap<String, Vec<f32>>,
}

impl FootprintVolume {
    /// Lay out an empty volume for a batch of records
    ///
    /// The records must be non-empty, sorted by timestamp and all belong to `key`'s month.
    /// Covariates are stored as 32-bit floats.
    pub fn build(
        key: BatchKey,
        records: &[MeteorologicalRecord],
        grid: &GridSpec,
    ) -> FfpResult<Self> {
        if records.is_empty() {
            return Err(FfpError::InvalidBatch(format!("batch {key} has no records")));
        }
        if let Some(stray) = records.iter().find(|r| r.batch_key() != key) {
            return Err(FfpError::InvalidBatch(format!(
                "record at {} does not belong to batch {key}",
                stray.timestamp
            )));
        }
        if let Some(pair) = records
            .windows(2)
            .find(|w| w[1].timestamp < w[0].timestamp)
        {
            return Err(FfpError::InvalidBatch(format!(
                "records of batch {key} are not sorted: {} precedes {}",
                pair[0].timestamp, pair[1].timestamp
            )));
        }

        let mut covariates: IndexMap<String, Vec<f32>> = IndexMap::new();
        for record in records {
            for (name, value) in record.covariates() {
                covariates
                    .entry(name.to_string())
                    .or_insert_with(|| Vec::with_capacity(records.len()))
                    .push(value as f32);
            }
        }

        Ok(Self {
            key,
            time: records.iter().map(|r| r.timestamp).collect(),
            y: grid.y(),
            x: grid.x(),
            covariates,
        })
    }

    /// `(time, y, x)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.time.len(), self.y.len(), self.x.len())
    }

    /// Shape of a single chunk, which always spans the full spatial extent
    pub fn chunk_shape(&self) -> (usize, usize) {
        (self.y.len(), self.x.len())
    }

    pub fn n_chunks(&self) -> usize {
        self.time.len()
    }

    pub fn covariate(&self, name: &str) -> Option<&[f32]> {
        self.covariates.get(name).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::half_hourly;

    fn grid() -> GridSpec {
        GridSpec::new(-20, 20, -10, 10, 2, 5).unwrap()
    }

    #[test]
    fn volume_is_sized_from_records_and_grid() {
        let records = half_hourly(2021, 5, 10);
        let volume = FootprintVolume::build(BatchKey::new(2021, 5), &records, &grid()).unwrap();

        assert_eq!(volume.shape(), (10, 5, 21));
        assert_eq!(volume.chunk_shape(), (5, 21));
        assert_eq!(volume.n_chunks(), 10);
        assert_eq!(volume.time[3], records[3].timestamp);
    }

    #[test]
    fn covariates_have_one_value_per_timestamp() {
        let mut records = half_hourly(2021, 5, 4);
        records[2].wind_speed = 7.25;
        let volume = FootprintVolume::build(BatchKey::new(2021, 5), &records, &grid()).unwrap();

        assert_eq!(volume.covariates.len(), 10);
        for series in volume.covariates.values() {
            assert_eq!(series.len(), 4);
        }
        assert_eq!(volume.covariate("WS").unwrap()[2], 7.25_f32);
        assert_eq!(volume.covariate("zm").unwrap()[0], 10.0_f32);
        assert_eq!(volume.covariates.get_index(0).unwrap().0, "USTAR");
    }

    #[test]
    fn rejects_empty_batch() {
        let result = FootprintVolume::build(BatchKey::new(2021, 5), &[], &grid());
        assert!(matches!(result, Err(FfpError::InvalidBatch(_))));
    }

    #[test]
    fn rejects_records_from_other_months() {
        let mut records = half_hourly(2021, 5, 3);
        records.extend(half_hourly(2021, 6, 1));
        let result = FootprintVolume::build(BatchKey::new(2021, 5), &records, &grid());
        assert!(matches!(result, Err(FfpError::InvalidBatch(_))));
    }

    #[test]
    fn rejects_unsorted_records() {
        let mut records = half_hourly(2021, 5, 3);
        records.swap(0, 2);
        let result = FootprintVolume::build(BatchKey::new(2021, 5), &records, &grid());
        assert!(matches!(result, Err(FfpError::InvalidBatch(_))));
    }
}
