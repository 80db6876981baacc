//! Scope policy — what a ticket worker may touch
//!
//! Policy derivation, path allow/deny enforcement, credential scanning,
//! and adaptive-trust risk scoring.

pub mod credentials;
pub mod policy;
pub mod risk;

pub use credentials::{contains_credentials, CredentialHit};
pub use policy::{
    derive_policy, is_file_allowed, normalize_path, serialize_for_prompt, ScopePolicy,
    ScopePolicyInput, DENIED_PATH_DEFAULTS,
};
pub use risk::{assess_adaptive_risk, RiskAssessment, RiskLevel};
