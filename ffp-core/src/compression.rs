//! Conversion of a completed batch volume into its two published forms
//!
//! The workers leave an uncompressed 32-bit store behind. [`CompressionPipeline::compress`]
//! turns it into
//!
//! * a lossless, gzip compressed 32-bit store in place of the intermediate one, and
//! * a lossy store of quantized 16-bit integers next to it.
//!
//! Quantization parameters are derived from the finite values of the whole batch, so every
//! decoded value lies within one `scale_factor` of the lossless value.

use crate::errors::FfpResult;
use crate::quantize::QuantizationParams;
use crate::store::{ChunkEncoding, VolumeStore};
use log::info;
use std::path::{Path, PathBuf};

/// The default gzip compression level
pub const DEFAULT_LEVEL: u32 = 6;

/// Stores produced for one batch
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub lossless: PathBuf,
    pub lossy: PathBuf,
    pub quantization: QuantizationParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPipeline {
    level: u32,
}

impl Default for CompressionPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl CompressionPipeline {
    /// `level` is clamped to gzip's `0..=9`
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Rewrite `intermediate` losslessly and write its quantized copy to `lossy_path`
    ///
    /// The intermediate store must be complete. It is replaced by the lossless store only
    /// once the latter has been fully written.
    pub fn compress(&self, intermediate: &Path, lossy_path: &Path) -> FfpResult<CompressionOutcome> {
        let loaded = {
            let store = VolumeStore::open(intermediate)?;
            store.ensure_complete()?;
            store.load()?
        };

        let lossless = VolumeStore::write_volume(
            intermediate,
            &loaded,
            ChunkEncoding::Lossless { level: self.level },
        )?;
        info!("Wrote lossless volume {}", lossless.path().display());

        let quantization = QuantizationParams::from_values(loaded.footprint.iter());
        let lossy = VolumeStore::write_volume(
            lossy_path,
            &loaded,
            ChunkEncoding::Lossy {
                params: quantization,
                level: self.level,
            },
        )?;
        info!(
            "Wrote lossy volume {} (scale_factor {:e}, add_offset {:e})",
            lossy.path().display(),
            quantization.scale_factor,
            quantization.add_offset
        );

        Ok(CompressionOutcome {
            lossless: lossless.path().to_path_buf(),
            lossy: lossy.path().to_path_buf(),
            quantization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FfpError;
    use crate::grid::GridSpec;
    use crate::quantize::SENTINEL;
    use crate::record::tests::half_hourly;
    use crate::record::BatchKey;
    use crate::store::{Codec, DataType};
    use crate::volume::FootprintVolume;
    use ndarray::Array2;
    use tempfile::tempdir;

    fn intermediate(dir: &Path, n: usize) -> VolumeStore {
        let grid = GridSpec::new(-4, 4, -2, 2, 2, 2).unwrap();
        let volume =
            FootprintVolume::build(BatchKey::new(2021, 5), &half_hourly(2021, 5, n), &grid)
                .unwrap();
        VolumeStore::create(dir.join("2021-05_ffp"), &volume, ChunkEncoding::Raw).unwrap()
    }

    fn ramp(t: usize, shape: (usize, usize)) -> Array2<f32> {
        Array2::from_shape_fn(shape, |(j, i)| {
            (t * 100 + j * 10 + i) as f32 * 1e-4
        })
    }

    #[test]
    fn produces_lossless_and_lossy_volumes() {
        let dir = tempdir().unwrap();
        let store = intermediate(dir.path(), 3);
        let shape = store.volume().chunk_shape();
        store.write_chunk(0, ramp(0, shape).view()).unwrap();
        store
            .write_chunk(1, Array2::from_elem(shape, f32::NAN).view())
            .unwrap();
        store.write_chunk(2, ramp(2, shape).view()).unwrap();

        let lossy_path = dir.path().join("2021-05_ffp_lossy");
        let outcome = CompressionPipeline::default()
            .compress(store.path(), &lossy_path)
            .unwrap();

        let lossless = VolumeStore::open(&outcome.lossless).unwrap();
        assert_eq!(lossless.metadata().footprint.dtype, DataType::Float32);
        assert_eq!(lossless.metadata().footprint.codec, Codec::Gzip { level: 6 });
        assert_eq!(lossless.read_chunk(2).unwrap(), ramp(2, shape));
        assert!(lossless.read_chunk(1).unwrap().iter().all(|v| v.is_nan()));

        let lossy = VolumeStore::open(&lossy_path).unwrap();
        let meta = &lossy.metadata().footprint;
        assert_eq!(meta.dtype, DataType::Uint16);
        assert_eq!(meta.missing_value, Some(SENTINEL));
        assert_eq!(meta.fill_value, Some(SENTINEL));
        assert_eq!(meta.quantization(), Some(outcome.quantization));
        assert_eq!(lossy.volume(), lossless.volume());

        assert!(lossy
            .read_encoded_chunk(1)
            .unwrap()
            .iter()
            .all(|&e| e == SENTINEL));
        let decoded = lossy.read_chunk(2).unwrap();
        for (d, v) in decoded.iter().zip(ramp(2, shape).iter()) {
            assert!(f64::from((d - v).abs()) <= outcome.quantization.scale_factor);
        }
    }

    #[test]
    fn quantization_spans_the_batch() {
        let dir = tempdir().unwrap();
        let store = intermediate(dir.path(), 2);
        let shape = store.volume().chunk_shape();
        store.write_chunk(0, ramp(0, shape).view()).unwrap();
        store.write_chunk(1, ramp(1, shape).view()).unwrap();

        let outcome = CompressionPipeline::new(1)
            .compress(store.path(), &dir.path().join("lossy"))
            .unwrap();

        let max = ramp(1, shape).iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(outcome.quantization.add_offset, 0.0);
        assert!(
            (outcome.quantization.scale_factor - f64::from(max) / 65534.0).abs() < 1e-12
        );
    }

    #[test]
    fn incomplete_intermediate_is_rejected() {
        let dir = tempdir().unwrap();
        let store = intermediate(dir.path(), 2);
        let shape = store.volume().chunk_shape();
        store.write_chunk(0, ramp(0, shape).view()).unwrap();

        let result = CompressionPipeline::default().compress(store.path(), &dir.path().join("l"));
        assert!(matches!(result, Err(FfpError::IncompleteVolume { missing: 1, .. })));
        // the intermediate store is left untouched
        assert!(VolumeStore::open(store.path()).unwrap().has_chunk(0).unwrap());
    }

    #[test]
    fn level_is_clamped() {
        assert_eq!(CompressionPipeline::new(42).level(), 9);
    }
}
