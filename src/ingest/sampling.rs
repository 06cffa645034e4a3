// Fractional record sampling applied before windowing

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

use crate::errors::{PipelineError, PipelineResult};

/// Keeps a fixed fraction of each record group, without replacement.
///
/// Kept records stay in arrival order.
#[derive(Debug)]
pub struct Sampler {
    rate: f64,
    rng: StdRng,
}

impl Sampler {
    /// `rate` must lie in (0, 1]. A seed makes the selection reproducible.
    pub fn new(rate: f64, seed: Option<u64>) -> PipelineResult<Self> {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(PipelineError::config(format!(
                "sample rate must be in (0, 1], got {}",
                rate
            )));
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { rate, rng })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.rate >= 1.0
    }

    pub fn sample<R>(&mut self, records: Vec<R>) -> Vec<R> {
        if self.is_passthrough() || records.is_empty() {
            return records;
        }

        let total = records.len();
        let amount = ((total as f64) * self.rate).round() as usize;
        let mut keep = vec![false; total];
        for i in index::sample(&mut self.rng, total, amount.min(total)) {
            keep[i] = true;
        }

        let sampled: Vec<R> = records
            .into_iter()
            .zip(keep)
            .filter_map(|(record, kept)| kept.then_some(record))
            .collect();
        tracing::debug!(total, kept = sampled.len(), rate = self.rate, "Sampled records");
        sampled
    }
}
