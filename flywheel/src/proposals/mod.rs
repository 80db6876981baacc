//! Proposals — scout output and the pipeline that turns it into work
//!
//! Dedup, scope filtering, spatial grouping, conflict detection and
//! blueprint formation.

pub mod dedup;
pub mod grouping;
pub mod pipeline;
pub mod types;

pub use dedup::{dedup_batch, normalize_title, DedupContext, DedupMemory, DedupRejection};
pub use grouping::{
    common_scope, detect_conflicts, enabler_order, file_jaccard, group_proposals,
    mergeable_pairs, Blueprint, ConflictResolution, ProposalConflict, ProposalGroup,
};
pub use pipeline::{
    run_pipeline, within_scope, FilterRejection, PipelineOutcome, ProposalPipelineConfig,
};
pub use types::{EstimatedComplexity, Proposal, ProposalCategory};
