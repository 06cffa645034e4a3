// Batching: exact-size windows over a record stream

pub mod windower;

pub use windower::{Batch, BatchWindower, EndOfStream};
