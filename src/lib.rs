//! Data loading and training support for unpaired driving-scene image
//! translation: paired-but-unaligned dataset sampling, checkpointing for the
//! two generators and two discriminators, weight initialization policies,
//! learning-rate schedules and tensor-to-image export.

pub mod data;
pub mod training;
pub mod utils;
