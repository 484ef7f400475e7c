pub mod engine;
pub mod scoring;

pub use engine::MatchingEngine;
pub use scoring::score_match;
