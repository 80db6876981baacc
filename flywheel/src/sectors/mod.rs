//! Sectors — the unit of scout scheduling
//!
//! A sector is a contiguous subtree of source files sharing a purpose.
//! The scheduler rotates scout attention across sectors by staleness and
//! yield; the lens rotation varies what the scout looks for.

pub mod lens;
pub mod scheduler;

pub use lens::{default_lenses, Lens, LensRotation};
pub use scheduler::{Sector, SectorScheduler, SectorSet};

pub use crate::index::SectorPurpose;
