//! Output grid of the footprint fields
//!
//! A [`GridSpec`] describes a rectangular domain centred on the sensor together with the
//! grid steps. It derives the fixed, strictly increasing coordinate sequences that label the
//! `y` and `x` axes of every footprint volume.
//!
//! ```rust
//! use ffp_core::grid::GridSpec;
//!
//! let grid = GridSpec::new(-300, 300, -300, 300, 1, 1).unwrap();
//! assert_eq!(grid.shape(), (601, 601));
//! assert_eq!(grid.x()[0], -300);
//! assert_eq!(*grid.y().last().unwrap(), 300);
//! ```

use crate::errors::{FfpError, FfpResult};
use serde::{Deserialize, Serialize};

/// Raw, unvalidated grid bounds as they appear in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridBounds {
    pub xmin: i32,
    pub xmax: i32,
    pub ymin: i32,
    pub ymax: i32,
    pub dx: i32,
    pub dy: i32,
}

/// Validated footprint domain and grid steps, in metres relative to the sensor
///
/// Immutable once built and shared read-only by every component of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GridBounds", into = "GridBounds")]
pub struct GridSpec {
    xmin: i32,
    xmax: i32,
    ymin: i32,
    ymax: i32,
    dx: i32,
    dy: i32,
}

fn validate_axis(axis: &str, min: i32, max: i32, step: i32) -> FfpResult<()> {
    if min >= max {
        return Err(FfpError::InvalidGrid(format!(
            "{axis}min ({min}) must be smaller than {axis}max ({max})"
        )));
    }
    if step <= 0 {
        return Err(FfpError::InvalidGrid(format!(
            "d{axis} must be positive, got {step}"
        )));
    }
    let span = i64::from(max) - i64::from(min);
    if span % i64::from(step) != 0 {
        return Err(FfpError::InvalidGrid(format!(
            "d{axis} ({step}) does not evenly divide the {axis} span ({span})"
        )));
    }
    Ok(())
}

// spans up to 2^32 - 1 do not fit in i32
fn axis_len(min: i32, max: i32, step: i32) -> usize {
    ((i64::from(max) - i64::from(min)) / i64::from(step)) as usize + 1
}

fn axis_coordinates(min: i32, max: i32, step: i32) -> Vec<i32> {
    (i64::from(min)..=i64::from(max))
        .step_by(step as usize)
        .map(|v| v as i32)
        .collect()
}

impl GridSpec {
    /// Create a grid, rejecting empty domains and steps that do not divide the span
    pub fn new(xmin: i32, xmax: i32, ymin: i32, ymax: i32, dx: i32, dy: i32) -> FfpResult<Self> {
        validate_axis("x", xmin, xmax, dx)?;
        validate_axis("y", ymin, ymax, dy)?;
        Ok(Self {
            xmin,
            xmax,
            ymin,
            ymax,
            dx,
            dy,
        })
    }

    pub fn dx(&self) -> i32 {
        self.dx
    }

    pub fn dy(&self) -> i32 {
        self.dy
    }

    /// Number of points along x
    pub fn nx(&self) -> usize {
        axis_len(self.xmin, self.xmax, self.dx)
    }

    /// Number of points along y
    pub fn ny(&self) -> usize {
        axis_len(self.ymin, self.ymax, self.dy)
    }

    /// Shape of a single footprint field, `(|y|, |x|)`
    pub fn shape(&self) -> (usize, usize) {
        (self.ny(), self.nx())
    }

    /// x coordinates from `xmin` to `xmax` inclusive
    pub fn x(&self) -> Vec<i32> {
        axis_coordinates(self.xmin, self.xmax, self.dx)
    }

    /// y coordinates from `ymin` to `ymax` inclusive
    pub fn y(&self) -> Vec<i32> {
        axis_coordinates(self.ymin, self.ymax, self.dy)
    }

    /// Domain as `[xmin, xmax, ymin, ymax]`
    pub fn domain(&self) -> [f64; 4] {
        [
            f64::from(self.xmin),
            f64::from(self.xmax),
            f64::from(self.ymin),
            f64::from(self.ymax),
        ]
    }
}

impl TryFrom<GridBounds> for GridSpec {
    type Error = FfpError;

    fn try_from(b: GridBounds) -> FfpResult<Self> {
        GridSpec::new(b.xmin, b.xmax, b.ymin, b.ymax, b.dx, b.dy)
    }
}

impl From<GridSpec> for GridBounds {
    fn from(g: GridSpec) -> Self {
        GridBounds {
            xmin: g.xmin,
            xmax: g.xmax,
            ymin: g.ymin,
            ymax: g.ymax,
            dx: g.dx,
            dy: g.dy,
        }
    }
}
