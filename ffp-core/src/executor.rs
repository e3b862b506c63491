//! Single-timestamp footprint execution
//!
//! The [`FootprintExecutor`] wraps one call of a [`FootprintModel`] and normalises its result
//! into a chunk of the batch volume. Model-reported failures never escape: the timestamp is
//! recorded as missing instead, so one bad record cannot abort a month of work.

use crate::errors::{FfpError, FfpResult};
use crate::grid::GridSpec;
use crate::record::MeteorologicalRecord;
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use thiserror::Error;

/// Scalar inputs of a single footprint calculation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelInputs {
    /// Measurement height above displacement height
    /// unit: m
    pub zm: f64,
    /// Roughness length, `NaN` if unknown
    /// unit: m
    pub z0: f64,
    /// Mean wind speed at `zm`, `NaN` if unknown
    /// unit: m / s
    pub umean: f64,
    /// Boundary layer height
    /// unit: m
    pub h: f64,
    /// Obukhov length
    /// unit: m
    pub ol: f64,
    /// Standard deviation of lateral velocity fluctuations
    /// unit: m / s
    pub sigmav: f64,
    /// Friction velocity
    /// unit: m / s
    pub ustar: f64,
    /// Wind direction
    /// unit: degrees from north
    pub wind_dir: f64,
}

impl From<&MeteorologicalRecord> for ModelInputs {
    fn from(record: &MeteorologicalRecord) -> Self {
        Self {
            zm: record.zm(),
            z0: record.roughness_length,
            umean: record.wind_speed,
            h: record.pblh,
            ol: record.mo_length,
            sigmav: record.v_sigma,
            ustar: record.ustar,
            wind_dir: record.wind_direction,
        }
    }
}

/// Spatial domain handed to the model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelDomain {
    /// `[xmin, xmax, ymin, ymax]`
    pub domain: [f64; 4],
    pub dx: f64,
    pub dy: f64,
}

impl From<&GridSpec> for ModelDomain {
    fn from(grid: &GridSpec) -> Self {
        Self {
            domain: grid.domain(),
            dx: f64::from(grid.dx()),
            dy: f64::from(grid.dy()),
        }
    }
}

/// Switches controlling the model's optional behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFlags {
    /// Tolerate measurement heights inside the roughness sublayer
    pub rslayer: bool,
    /// Smooth the footprint field
    pub smooth_data: bool,
    /// Write progress messages to the diagnostic sink
    pub verbose: bool,
    /// Produce figures
    pub plot: bool,
}

impl Default for ModelFlags {
    /// The flag set used for every batch
    fn default() -> Self {
        Self {
            rslayer: true,
            smooth_data: true,
            verbose: false,
            plot: false,
        }
    }
}

/// Everything a model run produces
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// Climatological footprint, `(|y|, |x|)`
    pub fclim_2d: Array2<f64>,
}

/// Failures the model itself reports for a given set of inputs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no footprint could be calculated: {0}")]
    NoFootprint(String),
}

/// An external footprint model
///
/// Implementations may write free-form diagnostics to `diagnostics`; callers decide where
/// that text ends up. Failures for physically invalid or non-convergent inputs are reported
/// as [`ModelError`]. Anything else (a panic, exhausted memory) is an unexpected fault and is
/// not recovered by the executor.
pub trait FootprintModel: Send + Sync {
    fn compute(
        &self,
        inputs: &ModelInputs,
        domain: &ModelDomain,
        flags: &ModelFlags,
        diagnostics: &mut dyn Write,
    ) -> Result<ModelOutput, ModelError>;
}

/// Result of one timestamp
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Computed(Array2<f32>),
    /// The model rejected the inputs; `field` is all `NaN`
    Missing {
        reason: ModelError,
        field: Array2<f32>,
    },
}

impl ChunkOutcome {
    pub fn field(&self) -> &Array2<f32> {
        match self {
            ChunkOutcome::Computed(field) => field,
            ChunkOutcome::Missing { field, .. } => field,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ChunkOutcome::Missing { .. })
    }
}

/// An all-`NaN` field of the grid's shape
pub fn missing_field(grid: &GridSpec) -> Array2<f32> {
    Array2::from_elem(grid.shape(), f32::NAN)
}

/// Runs a model for single timestamps
#[derive(Debug, Clone)]
pub struct FootprintExecutor<M> {
    model: M,
}

impl<M: FootprintModel> FootprintExecutor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Compute the footprint of one record on `grid`
    ///
    /// The model's diagnostic output is discarded for the duration of the call. Errors the
    /// model reports become [`ChunkOutcome::Missing`]; only a broken output contract is
    /// returned as an error.
    pub fn compute(
        &self,
        record: &MeteorologicalRecord,
        grid: &GridSpec,
        flags: &ModelFlags,
    ) -> FfpResult<ChunkOutcome> {
        let inputs = ModelInputs::from(record);
        let domain = ModelDomain::from(grid);
        let mut diagnostics = io::sink();

        match self
            .model
            .compute(&inputs, &domain, flags, &mut diagnostics)
        {
            Ok(output) => {
                if output.fclim_2d.dim() != grid.shape() {
                    return Err(FfpError::ModelContract(format!(
                        "footprint for {} has shape {:?}, expected {:?}",
                        record.timestamp,
                        output.fclim_2d.dim(),
                        grid.shape()
                    )));
                }
                Ok(ChunkOutcome::Computed(
                    output.fclim_2d.mapv(|v| v as f32),
                ))
            }
            Err(reason) => {
                debug!("No footprint for {}: {}", record.timestamp, reason);
                Ok(ChunkOutcome::Missing {
                    reason,
                    field: missing_field(grid),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::tests::half_hourly;
    use std::sync::Mutex;

    /// Fills the field with the wind speed; rejects non-positive wind speeds.
    #[derive(Debug, Default)]
    pub(crate) struct WindSpeedModel;

    impl FootprintModel for WindSpeedModel {
        fn compute(
            &self,
            inputs: &ModelInputs,
            domain: &ModelDomain,
            _flags: &ModelFlags,
            diagnostics: &mut dyn Write,
        ) -> Result<ModelOutput, ModelError> {
            writeln!(diagnostics, "computing footprint").ok();
            if !(inputs.umean > 0.0) {
                return Err(ModelError::InvalidInput("wind speed".to_string()));
            }
            let [xmin, xmax, ymin, ymax] = domain.domain;
            let nx = ((xmax - xmin) / domain.dx) as usize + 1;
            let ny = ((ymax - ymin) / domain.dy) as usize + 1;
            Ok(ModelOutput {
                fclim_2d: Array2::from_elem((ny, nx), inputs.umean / 100.0),
            })
        }
    }

    struct WrongShapeModel;

    impl FootprintModel for WrongShapeModel {
        fn compute(
            &self,
            _inputs: &ModelInputs,
            _domain: &ModelDomain,
            _flags: &ModelFlags,
            _diagnostics: &mut dyn Write,
        ) -> Result<ModelOutput, ModelError> {
            Ok(ModelOutput {
                fclim_2d: Array2::zeros((2, 2)),
            })
        }
    }

    #[derive(Default)]
    struct FlagRecorder {
        seen: Mutex<Vec<ModelFlags>>,
    }

    impl FootprintModel for FlagRecorder {
        fn compute(
            &self,
            _inputs: &ModelInputs,
            _domain: &ModelDomain,
            flags: &ModelFlags,
            _diagnostics: &mut dyn Write,
        ) -> Result<ModelOutput, ModelError> {
            self.seen.lock().unwrap().push(*flags);
            Err(ModelError::NoFootprint("recording only".to_string()))
        }
    }

    fn grid() -> GridSpec {
        GridSpec::new(-10, 10, -6, 6, 2, 3).unwrap()
    }

    #[test]
    fn success_yields_f32_field_of_grid_shape() {
        let executor = FootprintExecutor::new(WindSpeedModel);
        let record = half_hourly(2020, 1, 1).remove(0);

        let outcome = executor
            .compute(&record, &grid(), &ModelFlags::default())
            .unwrap();

        match outcome {
            ChunkOutcome::Computed(field) => {
                assert_eq!(field.dim(), (5, 11));
                assert!(field.iter().all(|&v| v == 0.03_f32));
            }
            other => panic!("expected a footprint, got {other:?}"),
        }
    }

    #[test]
    fn model_error_yields_all_nan_field() {
        let executor = FootprintExecutor::new(WindSpeedModel);
        let mut record = half_hourly(2020, 1, 1).remove(0);
        record.wind_speed = -3.0;

        let outcome = executor
            .compute(&record, &grid(), &ModelFlags::default())
            .unwrap();

        assert!(outcome.is_missing());
        assert_eq!(outcome.field().dim(), grid().shape());
        assert!(outcome.field().iter().all(|v| v.is_nan()));
        if let ChunkOutcome::Missing { reason, .. } = outcome {
            assert!(matches!(reason, ModelError::InvalidInput(_)));
        }
    }

    #[test]
    fn missing_inputs_are_model_errors_not_faults() {
        let executor = FootprintExecutor::new(WindSpeedModel);
        let mut record = half_hourly(2020, 1, 1).remove(0);
        record.wind_speed = f64::NAN;

        let outcome = executor.compute(&record, &grid(), &ModelFlags::default());
        assert!(outcome.unwrap().is_missing());
    }

    #[test]
    fn wrong_output_shape_is_a_fault() {
        let executor = FootprintExecutor::new(WrongShapeModel);
        let record = half_hourly(2020, 1, 1).remove(0);

        let result = executor.compute(&record, &grid(), &ModelFlags::default());
        assert!(matches!(result, Err(FfpError::ModelContract(_))));
    }

    #[test]
    fn flags_are_passed_through() {
        let executor = FootprintExecutor::new(FlagRecorder::default());
        let record = half_hourly(2020, 1, 1).remove(0);
        let flags = ModelFlags {
            smooth_data: false,
            ..ModelFlags::default()
        };

        executor
            .compute(&record, &grid(), &ModelFlags::default())
            .unwrap();
        executor.compute(&record, &grid(), &flags).unwrap();

        let seen = executor.model().seen.lock().unwrap();
        assert_eq!(*seen, vec![ModelFlags::default(), flags]);
    }

    #[test]
    fn default_flags() {
        let flags = ModelFlags::default();
        assert!(flags.rslayer);
        assert!(flags.smooth_data);
        assert!(!flags.verbose);
        assert!(!flags.plot);
    }

    #[test]
    fn inputs_come_from_record() {
        let record = half_hourly(2020, 1, 1).remove(0);
        let inputs = ModelInputs::from(&record);
        assert_eq!(inputs.zm, 10.0);
        assert_eq!(inputs.z0, record.roughness_length);
        assert_eq!(inputs.h, record.pblh);
        assert_eq!(inputs.wind_dir, record.wind_direction);
    }
}
