//! Cross-session lesson memory.
//!
//! Candidate lessons are generated by the critic after each run, deduplicated
//! into a persistent store, ranked by the retriever at injection points, and
//! promoted or suppressed by the promoter as outcome evidence accumulates.
//! The store writes to a dedicated `lessons.db` under the data root.

pub mod critic;
pub mod promoter;
pub mod retriever;
pub mod store;
pub mod types;

pub use critic::{Critic, QualityFilter};
pub use promoter::{LessonOutcome, Promoter};
pub use retriever::{RetrievalLane, RetrievalMatch, Retriever};
pub use store::LessonStore;
pub use types::{CandidateLesson, Lesson, LessonStatus, ScopeHint};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Learning subsystem errors.
#[derive(Debug, Error)]
pub enum LearningError {
    #[error("lesson database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("lesson store error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Tunable thresholds for dedup, retrieval, and lifecycle transitions.
///
/// Defaults match the documented behavior; benchmark harnesses construct
/// custom configs to parameterize acceptance tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct LearningConfig {
    /// Rule-text Jaccard at or above which same-trigger candidates merge.
    pub dedup_jaccard: f64,
    /// Rule-text Jaccard below which same-trigger lessons are conflict candidates.
    pub conflict_jaccard: f64,
    /// Pre-run retrieval result cap.
    pub prerun_max_results: usize,
    /// On-error retrieval result cap.
    pub on_error_max_results: usize,
    /// Max lessons from one source session in a single retrieval.
    pub max_per_source_session: usize,
    /// Max lessons sharing a tag bucket in a single retrieval.
    pub max_per_tag_bucket: usize,
    /// Score multiplier applied to transfer-lane candidates.
    pub transfer_score_weight: f64,
    /// Transfer-lane quota for one on-error retrieval.
    pub transfer_on_error_cap: usize,
    /// Transfer-lane quota inside the pre-run block.
    pub transfer_prerun_cap: usize,
    /// Strict-lane score that counts as a high-confidence hit for auto policy.
    pub transfer_auto_threshold: f64,
    /// Mean utility required for promotion.
    pub promotion_min_utility: f64,
    /// Relevant runs required for promotion.
    pub promotion_min_runs: usize,
    /// Single-activation utility at or below which a major regression is recorded.
    pub major_regression_utility: f64,
    /// Retrievals with non-positive mean utility before suppression.
    pub suppression_min_retrievals: usize,
    /// Conflict losses to one opponent before suppression.
    pub suppression_conflict_losses: usize,
    /// Days without retrieval before a low-reliability lesson archives.
    pub archive_after_days: i64,
    /// Reliability below which an idle lesson is archivable.
    pub archive_reliability_below: f64,
    /// Recency half-life in days for retrieval scoring.
    pub recency_half_life_days: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            dedup_jaccard: 0.65,
            conflict_jaccard: 0.25,
            prerun_max_results: 8,
            on_error_max_results: 2,
            max_per_source_session: 2,
            max_per_tag_bucket: 3,
            transfer_score_weight: 0.6,
            transfer_on_error_cap: 1,
            transfer_prerun_cap: 2,
            transfer_auto_threshold: 0.5,
            promotion_min_utility: 0.20,
            promotion_min_runs: 3,
            major_regression_utility: -0.5,
            suppression_min_retrievals: 3,
            suppression_conflict_losses: 3,
            archive_after_days: 60,
            archive_reliability_below: 0.4,
            recency_half_life_days: 14.0,
        }
    }
}
