//! Adaptive controls
//!
//! Confidence calibration, convergence metrics and drill ambition — the
//! feedback loops that tune the orchestrator from observed outcomes.

pub mod ambition;
pub mod calibration;
pub mod convergence;

pub use ambition::{ambition_from_completion_rate, Ambition};
pub use calibration::{CalibrationSample, ConfidenceCalibrator};
pub use convergence::{
    evaluate_convergence, ConvergenceAction, ConvergenceInputs, ConvergenceReport,
};
