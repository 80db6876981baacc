//! Trajectories — ordered DAGs of implementation steps
//!
//! YAML loading, validation (Kahn-sorted dependency graphs), priority
//! selection with failed-deps-unblock, verification-driven advancement,
//! stuck detection and cycle budgets.

pub mod engine;
pub mod synthesize;
pub mod types;
pub mod validate;
pub mod yaml;

pub use engine::{
    load_valid_trajectories, save_trajectory_yaml, AdvanceOutcome, TrajectoryEngine,
    TrajectoryEngineConfig,
};
pub use synthesize::{synthesize_from_cluster, MIN_CLUSTER_SIZE};
pub use types::{
    CommandOutcome, Measure, MeasureDirection, StepState, StepStatus, Trajectory,
    TrajectoryOutcome, TrajectoryState, TrajectoryStatus, TrajectoryStep, DEFAULT_STEP_PRIORITY,
};
pub use validate::{kahn_sort, sanitize_verification_commands, validate_and_build};
pub use yaml::{parse_simple_list, parse_trajectory_yaml, serialize_trajectory_to_yaml};
