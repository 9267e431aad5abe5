//! # hy-suggest
//!
//! Suggestion strategies for Halyard.
//!
//! Every strategy implements [`Suggester`] and is selected by its string id
//! through the [`SuggestionService`], which also keeps the named algorithm
//! parameter sets and the grid cursors.

mod cursor;
mod grid;
mod random;
mod service;
mod strategy;

pub use cursor::{CursorStore, MemoryCursorStore};
pub use grid::GridSuggester;
pub use random::RandomSuggester;
pub use service::{SuggestionParameterSet, SuggestionQuery, SuggestionService};
pub use strategy::{AssignmentSet, NoopSuggester, Suggester, SuggestionRequest};
