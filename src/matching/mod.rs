//! Scoring of remote candidates against local tracks.

mod fallback;
mod scoring;

pub use fallback::{FallbackHit, FallbackResolver};
pub(crate) use fallback::join_query;
pub use scoring::{
    best_plan_a, best_plan_b, normalize, plan_a_score, plan_b_score, FilenameQuery,
    SAME_SONG_SCORE,
};
