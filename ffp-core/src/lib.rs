//! Building blocks for monthly flux footprint volumes
//!
//! Records are grouped into [`record::MonthlyBatch`]es, each batch gets an empty
//! [`store::VolumeStore`], the [`engine::ParallelEngine`] fills it chunk by chunk using worker
//! processes, and the [`compression::CompressionPipeline`] publishes the lossless and lossy
//! forms of the result.

pub mod compression;
pub mod engine;
pub mod executor;
pub mod grid;
pub mod protocol;
pub mod quantize;
pub mod record;
pub mod store;
pub mod volume;

pub mod errors;
