//! # bgwatch-id
//!
//! Typed identifiers shared by the block reconciliation crates.
//!
//! ## Design Principles
//!
//! - Block and user names are labels assigned outside this system; they are
//!   validated once at the boundary and never mixed up afterwards
//! - Job identifiers are plain integers issued by the scheduler
//! - Every identifier roundtrips through its string form (parse → format → parse)
//!
//! ## Name Format
//!
//! Names are 1 to [`MAX_NAME_LEN`] characters of ASCII alphanumerics, `-`,
//! `_` and `.`. Examples:
//! - `RMP24Ap183110311` (block)
//! - `slurm` (user)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Longest name accepted by [`BlockName`] and [`UserName`].
pub const MAX_NAME_LEN: usize = 64;
