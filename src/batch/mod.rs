//! Local batching of fetched images.

mod accumulator;

pub use accumulator::{Admission, Batch, BatchAccumulator, BatchImage};
