// Loss trend over a rolling window of batches

use std::collections::VecDeque;

use serde::Serialize;

/// Trend direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trend::Improving => "improving",
            Trend::Stable => "stable",
            Trend::Declining => "declining",
        };
        f.write_str(s)
    }
}

/// Relative change between window halves below which the loss counts as flat.
const NOISE: f64 = 0.05;

/// Tracks a rolling window of losses (lower is better)
#[derive(Debug, Clone)]
pub struct LossTrend {
    recent: VecDeque<f64>,
    window_size: usize,
}

impl LossTrend {
    pub fn new(window_size: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    pub fn push(&mut self, loss: f64) {
        if !loss.is_finite() {
            return;
        }
        if self.recent.len() >= self.window_size {
            self.recent.pop_front();
        }
        self.recent.push_back(loss);
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn average(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().sum::<f64>() / self.recent.len() as f64
    }

    /// Compare the mean of the older half of the window with the newer half.
    pub fn trend(&self) -> Trend {
        if self.recent.len() < 4 {
            return Trend::Stable; // Not enough data
        }

        let mid = self.recent.len() / 2;
        let older = self.recent.iter().take(mid).sum::<f64>() / mid as f64;
        let newer =
            self.recent.iter().skip(mid).sum::<f64>() / (self.recent.len() - mid) as f64;

        let change = (older - newer) / older.abs().max(f64::EPSILON);
        if change > NOISE {
            Trend::Improving
        } else if change < -NOISE {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }
}
