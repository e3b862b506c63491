//! Monthly batch computation of flux footprint volumes
//!
//! See [`pipeline::run`] for the end-to-end flow and [`ffp_core`] for the building blocks.

pub mod config;
pub mod ingest;
pub mod pipeline;
pub mod progress;
pub mod worker;
