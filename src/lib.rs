// nettrain - streaming ingestion and batch windowing for training on traffic records
// Library exports

pub mod batching; // Exact-size batches with leftover carry-over
pub mod config;
pub mod errors;
pub mod ingest; // Capture containers and the datagram channel
pub mod metrics;
pub mod training; // Oracle, training loop, checkpoints, scoring
