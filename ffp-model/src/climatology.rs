//! Flux footprint parameterisation
//!
//! Two-dimensional footprint of a single averaging period after Kljun et al. (2015),
//! *A simple two-dimensional parameterisation for Flux Footprint Prediction (FFP)*,
//! Geosci. Model Dev., 8, 3695-3713.
//!
//! The crosswind-integrated footprint is expressed in the scaled distance
//!
//! $$ X^* = \frac{x}{z_m} \left(1 - \frac{z_m}{h}\right)
//!     \left(\ln\frac{z_m}{z_0} - \Psi_M\right)^{-1} $$
//!
//! with $F^* = a (X^* - d)^b \exp\left(-c / (X^* - d)\right)$ and spread crosswind with a
//! Gaussian of width $\sigma_y$.

use ffp_core::executor::{
    FootprintModel, ModelDomain, ModelError, ModelFlags, ModelInputs, ModelOutput,
};
use log::trace;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::io::Write;

use crate::smoothing::smooth;

/// Fitted constants of the parameterisation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FfpParameters {
    /// Shape parameters of the crosswind-integrated footprint
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    /// Shape parameters of the crosswind dispersion
    pub ac: f64,
    pub bc: f64,
    pub cc: f64,
    /// Obukhov lengths longer than this are treated as neutral
    /// unit: m
    pub oln: f64,
    /// von Karman constant
    pub k: f64,
}

impl Default for FfpParameters {
    fn default() -> Self {
        Self {
            a: 1.4524,
            b: -1.9914,
            c: 1.4622,
            d: 0.1359,
            ac: 2.17,
            bc: 1.66,
            cc: 20.0,
            oln: 5000.0,
            k: 0.4,
        }
    }
}

/// Obukhov length used for near-neutral conditions
const NEUTRAL_OL: f64 = -1e6;

/// Footprint climatology of one averaging period
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfpClimatology {
    parameters: FfpParameters,
}

fn invalid(message: impl Into<String>) -> ModelError {
    ModelError::InvalidInput(message.into())
}

/// Grid coordinates along one axis, `min` to `max` inclusive
fn axis(min: f64, max: f64, step: f64, name: &str) -> Result<Vec<f64>, ModelError> {
    if !(step > 0.0) || !(max > min) {
        return Err(invalid(format!(
            "domain along {name} must be increasing with a positive step"
        )));
    }
    let n = ((max - min) / step).round() as usize + 1;
    Ok((0..n).map(|i| min + i as f64 * step).collect())
}

impl FfpClimatology {
    pub fn from_parameters(parameters: FfpParameters) -> Self {
        Self { parameters }
    }

    pub fn parameters(&self) -> &FfpParameters {
        &self.parameters
    }

    /// Reject inputs outside the range of validity of the parameterisation
    fn check_inputs(
        &self,
        inputs: &ModelInputs,
        flags: &ModelFlags,
        diagnostics: &mut dyn Write,
    ) -> Result<(), ModelError> {
        let mandatory = [
            ("zm", inputs.zm),
            ("h", inputs.h),
            ("ol", inputs.ol),
            ("sigmav", inputs.sigmav),
            ("ustar", inputs.ustar),
            ("wind_dir", inputs.wind_dir),
        ];
        if let Some((name, _)) = mandatory.iter().find(|(_, v)| !v.is_finite()) {
            return Err(invalid(format!("{name} is missing")));
        }
        if inputs.zm <= 0.0 {
            return Err(invalid("zm must be larger than 0"));
        }
        if inputs.h <= 10.0 {
            return Err(invalid("h must be larger than 10 m"));
        }
        if inputs.zm > inputs.h {
            return Err(invalid("zm must be smaller than h"));
        }
        if inputs.ol == 0.0 {
            return Err(invalid("ol must not be 0"));
        }
        if inputs.zm / inputs.ol <= -15.5 {
            return Err(invalid("zm/ol must be larger than -15.5"));
        }
        if inputs.sigmav <= 0.0 {
            return Err(invalid("sigmav must be larger than 0"));
        }
        if inputs.ustar <= 0.1 {
            return Err(invalid("ustar must be larger than 0.1"));
        }
        if !(0.0..=360.0).contains(&inputs.wind_dir) {
            return Err(invalid("wind_dir must be within [0, 360]"));
        }

        let has_z0 = !inputs.z0.is_nan();
        let has_umean = !inputs.umean.is_nan();
        if !has_z0 && !has_umean {
            return Err(invalid("either z0 or umean is required"));
        }
        if has_umean && !(inputs.umean.is_finite() && inputs.umean > 0.0) {
            return Err(invalid("umean must be larger than 0"));
        }
        if has_z0 {
            if !(inputs.z0.is_finite() && inputs.z0 > 0.0) {
                return Err(invalid("z0 must be larger than 0"));
            }
            if inputs.zm <= 12.5 * inputs.z0 {
                if !flags.rslayer {
                    return Err(invalid("zm must be above the roughness sub-layer"));
                }
                writeln!(
                    diagnostics,
                    "warning: zm = {} m lies within the roughness sub-layer (z0 = {} m)",
                    inputs.zm, inputs.z0
                )
                .ok();
            }
        }
        Ok(())
    }

    /// Integral form of the stability correction for momentum
    fn psi_f(&self, zm: f64, ol: f64) -> f64 {
        if ol <= 0.0 || ol >= self.parameters.oln {
            let xx = (1.0 - 19.0 * zm / ol).powf(0.25);
            ((1.0 + xx * xx) / 2.0).ln() + 2.0 * ((1.0 + xx) / 2.0).ln() - 2.0 * xx.atan() + PI / 2.0
        } else {
            -5.3 * zm / ol
        }
    }

    /// Denominator of the scaled distance, from the roughness length when known and from
    /// the mean wind speed otherwise
    fn scaling(&self, inputs: &ModelInputs, ol: f64) -> Result<f64, ModelError> {
        if inputs.z0.is_nan() {
            return Ok(inputs.umean / inputs.ustar * self.parameters.k);
        }
        let scaling = (inputs.zm / inputs.z0).ln() - self.psi_f(inputs.zm, ol);
        if scaling > 0.0 {
            Ok(scaling)
        } else {
            Err(ModelError::NoFootprint(format!(
                "stability correction {:.3} exceeds ln(zm/z0)",
                self.psi_f(inputs.zm, ol)
            )))
        }
    }

    /// Ratio between the scaled and the physical crosswind dispersion
    fn dispersion_scale(&self, zm: f64, ol: f64) -> f64 {
        let base = if ol <= 0.0 { 0.80 } else { 0.55 };
        (1e-5 * (ol / zm).abs() + base).min(1.0)
    }
}

impl FootprintModel for FfpClimatology {
    fn compute(
        &self,
        inputs: &ModelInputs,
        domain: &ModelDomain,
        flags: &ModelFlags,
        diagnostics: &mut dyn Write,
    ) -> Result<ModelOutput, ModelError> {
        self.check_inputs(inputs, flags, diagnostics)?;

        let p = &self.parameters;
        let ol = if inputs.ol.abs() > p.oln {
            NEUTRAL_OL
        } else {
            inputs.ol
        };
        let scaling = self.scaling(inputs, ol)?;
        let height_factor = 1.0 - inputs.zm / inputs.h;
        let scale_const = self.dispersion_scale(inputs.zm, ol);
        let wind_dir = inputs.wind_dir.to_radians();

        let [xmin, xmax, ymin, ymax] = domain.domain;
        let xs = axis(xmin, xmax, domain.dx, "x")?;
        let ys = axis(ymin, ymax, domain.dy, "y")?;
        if flags.verbose {
            writeln!(
                diagnostics,
                "calculating footprint on {} x {} grid points",
                ys.len(),
                xs.len()
            )
            .ok();
        }

        let field = Array2::from_shape_fn((ys.len(), xs.len()), |(j, i)| {
            let (x, y) = (xs[i], ys[j]);
            let rho = x.hypot(y);
            // direction measured clockwise from north, relative to the wind direction
            let rotated = x.atan2(y) - wind_dir;

            let xstar = rho * rotated.cos() / inputs.zm * height_factor / scaling;
            if !(xstar > p.d) {
                return 0.0;
            }
            let fstar = p.a * (xstar - p.d).powf(p.b) * (-p.c / (xstar - p.d)).exp();
            let f_ci = fstar / inputs.zm * height_factor / scaling;

            let sigystar = p.ac * (p.bc * xstar * xstar / (1.0 + p.cc * xstar)).sqrt();
            let sigy = sigystar / scale_const * inputs.zm * inputs.sigmav / inputs.ustar;
            let crosswind = rho * rotated.sin();

            f_ci / ((2.0 * PI).sqrt() * sigy) * (-(crosswind * crosswind) / (2.0 * sigy * sigy)).exp()
        });

        let fclim_2d = if flags.smooth_data {
            smooth(field.view())
        } else {
            field
        };

        if !fclim_2d.iter().all(|v| v.is_finite()) {
            return Err(ModelError::NoFootprint(
                "footprint contains non-finite values".to_string(),
            ));
        }
        trace!("Footprint integrates to {}", fclim_2d.sum() * domain.dx * domain.dy);
        if flags.verbose {
            writeln!(diagnostics, "footprint calculated").ok();
        }

        Ok(ModelOutput { fclim_2d })
    }
}
