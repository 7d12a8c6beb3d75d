//! Outcome-based lesson utility and lifecycle transitions.
//!
//! Each activation of a lesson (pre-run injection or on-error hint) yields an
//! outcome delta; the promoter folds those into per-lesson counters and
//! applies promotion, suppression, and archival rules. Suppression guards run
//! first so a harmful lesson stops being amplified before any promotion check.

use super::store::LessonStore;
use super::types::LessonStatus;
use super::LearningConfig;

use chrono::{DateTime, Utc};

/// One activation outcome for one lesson.
#[derive(Debug, Clone)]
pub struct LessonOutcome {
    pub lesson_id: String,
    /// 1 when this session's recurrence of the triggering fingerprint dropped
    /// against baseline, negative when it kept recurring.
    pub error_reduction: f64,
    /// Normalized drop in steps-to-first-success.
    pub step_efficiency_gain: f64,
    /// Normalized referee score change against the evidence-window baseline.
    /// None when no referee signal exists for the window.
    pub referee_score_gain: Option<f64>,
    pub major_regression: bool,
    /// Lesson lost conflict resolution during retrieval this session.
    pub contradiction_lost: Option<String>,
}

/// Counts of what one promoter pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionSummary {
    pub updated: usize,
    pub promoted: usize,
    pub suppressed: usize,
    pub archived: usize,
}

/// Applies utility updates and lifecycle transitions against the store.
#[derive(Debug, Clone)]
pub struct Promoter {
    config: LearningConfig,
}

/// Weighted utility for one activation.
///
/// The referee term redistributes into the other two when no judge or
/// contract signal exists for the evidence window.
pub fn compute_utility(
    error_reduction: f64,
    step_efficiency_gain: f64,
    referee_score_gain: Option<f64>,
) -> f64 {
    match referee_score_gain {
        Some(gain) => 0.50 * error_reduction + 0.30 * step_efficiency_gain + 0.20 * gain,
        None => 0.65 * error_reduction + 0.35 * step_efficiency_gain,
    }
}

impl Promoter {
    pub fn new(config: LearningConfig) -> Self {
        Self { config }
    }

    /// Fold a session's activation outcomes into the store and apply
    /// transitions. Unknown lesson ids are skipped (the store may have
    /// compacted or the session may predate a merge).
    pub async fn apply_outcomes(
        &self,
        store: &LessonStore,
        outcomes: &[LessonOutcome],
    ) -> PromotionSummary {
        let mut summary = PromotionSummary::default();

        for outcome in outcomes {
            let Some(mut lesson) = store.get(&outcome.lesson_id) else {
                continue;
            };
            let before = lesson.status;

            let utility = compute_utility(
                outcome.error_reduction,
                outcome.step_efficiency_gain,
                outcome.referee_score_gain,
            );

            lesson.retrieval_count += 1;
            if utility > 0.0 {
                lesson.helpful_count += 1;
            } else {
                lesson.harmful_count += 1;
            }
            if outcome.major_regression || utility <= self.config.major_regression_utility {
                lesson.major_regressions += 1;
            }
            lesson.utility_history.push(utility);
            let overflow = lesson.utility_history.len().saturating_sub(30);
            if overflow > 0 {
                lesson.utility_history.drain(..overflow);
            }

            let mut lost_to_same_opponent = false;
            if let Some(opponent) = &outcome.contradiction_lost {
                let losses = lesson.record_conflict_loss(opponent);
                lost_to_same_opponent =
                    losses as usize >= self.config.suppression_conflict_losses;
            }

            let relevant_runs = lesson.utility_history.len();
            let window = relevant_runs.min(10);
            let mean_utility = if window == 0 {
                0.0
            } else {
                lesson.utility_history[relevant_runs - window..]
                    .iter()
                    .sum::<f64>()
                    / window as f64
            };

            let next_status = if lost_to_same_opponent {
                Some(LessonStatus::Suppressed)
            } else if lesson.retrieval_count as usize >= self.config.suppression_min_retrievals
                && mean_utility <= 0.0
            {
                Some(LessonStatus::Suppressed)
            } else if lesson.status == LessonStatus::Candidate
                && !lesson.promotion_blocked
                && relevant_runs >= self.config.promotion_min_runs
                && mean_utility >= self.config.promotion_min_utility
                && lesson.major_regressions == 0
            {
                Some(LessonStatus::Promoted)
            } else {
                None
            };

            if let Some(status) = next_status {
                if !lesson.status.is_terminal() {
                    lesson.status = status;
                }
            }
            lesson.updated_at = Utc::now();

            summary.updated += 1;
            if before != LessonStatus::Promoted && lesson.status == LessonStatus::Promoted {
                summary.promoted += 1;
                tracing::info!(lesson_id = %lesson.id, mean_utility, "lesson promoted");
            }
            if before != LessonStatus::Suppressed && lesson.status == LessonStatus::Suppressed {
                summary.suppressed += 1;
                tracing::info!(lesson_id = %lesson.id, mean_utility, "lesson suppressed");
            }

            store.save(lesson).await;
        }

        summary
    }

    /// Archive lessons that were never retrieved, have aged past the cutoff,
    /// and sit below the reliability floor. Returns how many moved.
    pub async fn archive_stale(&self, store: &LessonStore, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::days(self.config.archive_after_days);
        let stale = store.iter_filtered(|lesson| {
            !lesson.status.is_terminal()
                && lesson.retrieval_count == 0
                && lesson.created_at < cutoff
                && lesson.reliability() < self.config.archive_reliability_below
        });
        let mut archived = 0;
        for lesson in stale {
            if store
                .transition(&lesson.id, LessonStatus::Archived, "unused past age cutoff")
                .await
            {
                archived += 1;
            }
        }
        archived
    }
}
