//! Linear 16-bit quantization of footprint values
//!
//! Footprints are non-negative and span a bounded range within a batch, so a per-batch linear
//! mapping onto `[0, 2^16 - 2]` keeps the absolute error below one `scale_factor`. The last
//! representable integer is reserved for missing values:
//!
//! $$ e = \mathrm{round}\left(\frac{v - \mathrm{add\_offset}}{\mathrm{scale\_factor}}\right),
//! \qquad v = e \cdot \mathrm{scale\_factor} + \mathrm{add\_offset} $$

use serde::{Deserialize, Serialize};

/// Largest integer a finite value can encode to
pub const MAX_ENCODED: u16 = u16::MAX - 1;
/// Reserved integer standing for a missing (non-finite) value
pub const SENTINEL: u16 = u16::MAX;

/// Per-batch quantization parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParams {
    pub scale_factor: f64,
    pub add_offset: f64,
}

impl QuantizationParams {
    /// Parameters spanning `[min, max]`
    ///
    /// A zero-width range uses a unit scale factor so every finite value encodes to zero and
    /// decodes back to `min` exactly.
    pub fn from_range(min: f64, max: f64) -> Self {
        let scale_factor = (max - min) / f64::from(MAX_ENCODED);
        Self {
            scale_factor: if scale_factor > 0.0 { scale_factor } else { 1.0 },
            add_offset: min,
        }
    }

    /// Parameters spanning the finite values in `values`, ignoring `NaN` and infinities
    ///
    /// Without any finite value the parameters fall back to a zero offset and unit scale;
    /// every value then encodes to [`SENTINEL`].
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f32>) -> Self {
        match finite_range(values) {
            Some((min, max)) => Self::from_range(f64::from(min), f64::from(max)),
            None => Self {
                scale_factor: 1.0,
                add_offset: 0.0,
            },
        }
    }

    pub fn encode(&self, value: f32) -> u16 {
        if !value.is_finite() {
            return SENTINEL;
        }
        let scaled = ((f64::from(value) - self.add_offset) / self.scale_factor).round();
        scaled.clamp(0.0, f64::from(MAX_ENCODED)) as u16
    }

    pub fn decode(&self, encoded: u16) -> f32 {
        if encoded == SENTINEL {
            return f32::NAN;
        }
        (f64::from(encoded) * self.scale_factor + self.add_offset) as f32
    }
}

/// Minimum and maximum of the finite values, if there are any
pub fn finite_range<'a>(values: impl IntoIterator<Item = &'a f32>) -> Option<(f32, f32)> {
    values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}
