//! Footprint model used by the batch workers
pub mod climatology;
pub mod smoothing;

pub use climatology::{FfpClimatology, FfpParameters};
