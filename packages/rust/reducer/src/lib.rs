//! Content reduction for sitecrawl.
//!
//! This crate provides:
//! - [`reduce`]: minimal semantic tree reduction and indented serialization
//! - [`summary`]: candidate summary phrases and cross-page boilerplate removal

pub mod reduce;
pub mod summary;

pub use reduce::reduce;
pub use summary::{MAX_PHRASE_WORDS, extract_summary_phrases, remove_boilerplate};
