//! Heuristic log scanning and the suggestion scaffolds built from it.

pub mod log_analyzer;
pub mod suggestions;

pub use log_analyzer::analyze;
pub use suggestions::{synthesize_patch, synthesize_test};
