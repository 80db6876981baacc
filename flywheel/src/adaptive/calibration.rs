//! Confidence calibration
//!
//! Fits a small logistic model over historical (confidence, succeeded)
//! pairs and produces a delta for the effective minimum confidence. When
//! high-confidence proposals keep failing, the floor rises; when modest
//! ones keep landing, it drops.

use serde::{Deserialize, Serialize};

/// Cycles of history required before calibration speaks
const MIN_SAMPLES: usize = 5;

/// Bound on the returned adjustment
const MAX_DELTA: f64 = 10.0;

/// Gradient steps for the logistic fit
const FIT_ITERATIONS: usize = 500;

/// Learning rate for the fit
const LEARNING_RATE: f64 = 0.5;

/// One observed outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// Proposal confidence, 0..=100
    pub confidence: u8,
    pub succeeded: bool,
}

/// Rolling calibration state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceCalibrator {
    samples: Vec<CalibrationSample>,
}

/// Samples retained
const MAX_SAMPLES: usize = 200;

impl ConfidenceCalibrator {
    pub fn record(&mut self, confidence: u8, succeeded: bool) {
        self.samples.push(CalibrationSample {
            confidence,
            succeeded,
        });
        if self.samples.len() > MAX_SAMPLES {
            self.samples.remove(0);
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Fit and return a delta in [-10, +10] for the confidence floor.
    ///
    /// Returns 0 until enough history exists. The delta is derived from
    /// the confidence at which the fitted curve crosses 50% success: a
    /// crossing above the nominal midpoint means stated confidence runs
    /// hot, so the floor moves up.
    pub fn calibration_delta(&self) -> f64 {
        if self.samples.len() <= MIN_SAMPLES {
            return 0.0;
        }

        // Logistic regression on normalized confidence: p = sigmoid(w*x + b).
        let mut w = 1.0_f64;
        let mut b = 0.0_f64;

        for _ in 0..FIT_ITERATIONS {
            let mut grad_w = 0.0;
            let mut grad_b = 0.0;
            for sample in &self.samples {
                let x = f64::from(sample.confidence) / 100.0 - 0.5;
                let y = if sample.succeeded { 1.0 } else { 0.0 };
                let p = 1.0 / (1.0 + (-(w * x + b)).exp());
                grad_w += (p - y) * x;
                grad_b += p - y;
            }
            let n = self.samples.len() as f64;
            w -= LEARNING_RATE * grad_w / n;
            b -= LEARNING_RATE * grad_b / n;
        }

        // Success midpoint in confidence units. sigmoid crosses 0.5 where
        // w*x + b = 0.
        if w.abs() < 1e-6 {
            return 0.0;
        }
        let crossing = (-b / w + 0.5) * 100.0;
        let delta = (crossing - 50.0) * 0.5;
        delta.clamp(-MAX_DELTA, MAX_DELTA)
    }
}
