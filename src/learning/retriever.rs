//! Ranked lesson retrieval with strict and transfer lanes.
//!
//! The strict lane serves lessons whose domain key matches the active
//! context; the transfer lane serves cross-domain lessons under a small
//! quota and a score penalty. Guards cap per-session and per-tag
//! concentration and resolve conflicts before anything reaches the prompt.

use super::types::{text_jaccard, Lesson};
use super::LearningConfig;
use crate::config::TransferPolicy;

use chrono::{DateTime, Utc};

use std::collections::HashMap;

/// Which lane produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalLane {
    Strict,
    Transfer,
}

impl std::fmt::Display for RetrievalLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// Per-component score breakdown, kept for observability.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalScore {
    pub total: f64,
    pub fingerprint_match: f64,
    pub tag_overlap: f64,
    pub text_similarity: f64,
    pub reliability: f64,
    pub recency: f64,
}

/// One retrieved lesson plus how it scored and through which lane.
#[derive(Debug, Clone)]
pub struct RetrievalMatch {
    pub lesson: Lesson,
    pub score: RetrievalScore,
    pub lane: RetrievalLane,
}

/// The context a retrieval ranks against.
#[derive(Debug, Clone, Default)]
pub struct RetrievalQuery {
    /// Task text pre-run; task text + recent error text on-error.
    pub text: String,
    /// Exact failure fingerprint for on-error retrieval.
    pub fingerprint: String,
    pub tags: Vec<String>,
    pub domain_key: String,
}

/// What a retrieval returned and which lessons lost conflict resolution.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub matches: Vec<RetrievalMatch>,
    /// `(loser, winner)` pairs from conflict resolution, for the promoter's
    /// repeated-loss suppression rule.
    pub conflict_losers: Vec<(String, String)>,
}

/// Stateless ranking over a store snapshot.
#[derive(Debug, Clone)]
pub struct Retriever {
    config: LearningConfig,
    policy: TransferPolicy,
}

impl Retriever {
    pub fn new(config: LearningConfig, policy: TransferPolicy) -> Self {
        Self { config, policy }
    }

    /// Pre-run retrieval: rank against the task text, return up to the
    /// configured top-K for the system-prompt lessons block.
    pub fn pre_run(&self, records: &[Lesson], query: &RetrievalQuery) -> RetrievalOutcome {
        self.retrieve(
            records,
            query,
            self.config.prerun_max_results,
            self.config.transfer_prerun_cap,
            Utc::now(),
        )
    }

    /// On-error retrieval: rank against the fingerprint, tags, and error
    /// text of a just-failed step. Returns at most top-M hints.
    pub fn on_error(&self, records: &[Lesson], query: &RetrievalQuery) -> RetrievalOutcome {
        self.retrieve(
            records,
            query,
            self.config.on_error_max_results,
            self.config.transfer_on_error_cap,
            Utc::now(),
        )
    }

    fn retrieve(
        &self,
        records: &[Lesson],
        query: &RetrievalQuery,
        max_results: usize,
        transfer_cap: usize,
        now: DateTime<Utc>,
    ) -> RetrievalOutcome {
        let mut strict: Vec<RetrievalMatch> = Vec::new();
        let mut transfer: Vec<RetrievalMatch> = Vec::new();

        for lesson in records {
            if !lesson.status.is_retrievable() {
                continue;
            }
            let lane = if !lesson.domain_key.is_empty() && lesson.domain_key == query.domain_key {
                RetrievalLane::Strict
            } else {
                RetrievalLane::Transfer
            };
            let mut score = score_lesson(lesson, query, self.config.recency_half_life_days, now);
            if lane == RetrievalLane::Transfer {
                score.total *= self.config.transfer_score_weight;
            }
            if score.total <= 0.0 {
                continue;
            }
            let candidate = RetrievalMatch {
                lesson: lesson.clone(),
                score,
                lane,
            };
            match lane {
                RetrievalLane::Strict => strict.push(candidate),
                RetrievalLane::Transfer => transfer.push(candidate),
            }
        }

        sort_by_score(&mut strict);
        sort_by_score(&mut transfer);

        let strict_high_confidence = strict
            .iter()
            .filter(|m| m.score.total >= self.config.transfer_auto_threshold)
            .count();

        let transfer_active = match self.policy {
            TransferPolicy::Off => false,
            TransferPolicy::Always => true,
            TransferPolicy::Auto => strict_high_confidence < 1,
        };

        let mut selection = Selection::new(&self.config, max_results);
        for candidate in strict {
            selection.offer(candidate);
        }
        if transfer_active {
            let mut taken = 0usize;
            for candidate in transfer {
                if taken >= transfer_cap {
                    break;
                }
                if selection.offer(candidate) {
                    taken += 1;
                }
            }
        }
        selection.finish()
    }
}

fn sort_by_score(matches: &mut [RetrievalMatch]) {
    matches.sort_by(|a, b| {
        b.score
            .total
            .partial_cmp(&a.score.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.score
                    .reliability
                    .partial_cmp(&a.score.reliability)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.lesson.updated_at.cmp(&a.lesson.updated_at))
    });
}

/// Weighted combination of fingerprint, tag, text, reliability, and recency
/// evidence. Tags are hints: an empty tag set zeroes one component but never
/// blocks a match.
fn score_lesson(
    lesson: &Lesson,
    query: &RetrievalQuery,
    half_life_days: f64,
    now: DateTime<Utc>,
) -> RetrievalScore {
    let fingerprint_match = fingerprint_score(&query.fingerprint, &lesson.trigger_fingerprints);
    let tag_overlap = tag_jaccard(&query.tags, lesson);
    let text_similarity = text_jaccard(&query.text, &lesson.rule_text);
    let reliability = lesson.reliability();
    let recency = recency_score(lesson.updated_at, half_life_days, now);
    let total = 0.40 * fingerprint_match
        + 0.25 * tag_overlap
        + 0.20 * text_similarity
        + 0.10 * reliability
        + 0.05 * recency;
    RetrievalScore {
        total,
        fingerprint_match,
        tag_overlap,
        text_similarity,
        reliability,
        recency,
    }
}

/// 1.0 on an exact trigger hit, 0.5 when one side is a prefix of the other
/// (both sides are already normalized), 0 otherwise.
fn fingerprint_score(query_fingerprint: &str, triggers: &[String]) -> f64 {
    if query_fingerprint.is_empty() {
        return 0.0;
    }
    let mut best: f64 = 0.0;
    for trigger in triggers {
        if trigger == query_fingerprint {
            return 1.0;
        }
        if trigger.starts_with(query_fingerprint) || query_fingerprint.starts_with(trigger.as_str())
        {
            best = best.max(0.5);
        }
    }
    best
}

fn tag_jaccard(query_tags: &[String], lesson: &Lesson) -> f64 {
    if query_tags.is_empty() {
        return 0.0;
    }
    let query: std::collections::BTreeSet<&str> =
        query_tags.iter().map(String::as_str).collect();
    let lesson_tags: std::collections::BTreeSet<&str> = lesson
        .tags
        .iter()
        .chain(&lesson.model_tags)
        .map(String::as_str)
        .collect();
    if lesson_tags.is_empty() {
        return 0.0;
    }
    let intersection = query.intersection(&lesson_tags).count();
    let union = query.union(&lesson_tags).count();
    intersection as f64 / union as f64
}

/// Exponential decay over `updated_at` with the configured half-life.
fn recency_score(updated_at: DateTime<Utc>, half_life_days: f64, now: DateTime<Utc>) -> f64 {
    let age_days = (now - updated_at).num_seconds().max(0) as f64 / 86_400.0;
    0.5_f64.powf(age_days / half_life_days.max(0.1))
}

/// Guard-enforcing accumulator: per-session and per-tag caps plus conflict
/// resolution (higher reliability wins, loser recorded for the promoter).
struct Selection<'c> {
    config: &'c LearningConfig,
    max_results: usize,
    selected: Vec<RetrievalMatch>,
    conflict_losers: Vec<(String, String)>,
    per_session: HashMap<u64, usize>,
    per_tag: HashMap<String, usize>,
}

impl<'c> Selection<'c> {
    fn new(config: &'c LearningConfig, max_results: usize) -> Self {
        Self {
            config,
            max_results,
            selected: Vec::new(),
            conflict_losers: Vec::new(),
            per_session: HashMap::new(),
            per_tag: HashMap::new(),
        }
    }

    /// Try to admit a candidate; returns whether it was taken.
    fn offer(&mut self, candidate: RetrievalMatch) -> bool {
        if self.selected.len() >= self.max_results {
            return false;
        }

        let session = candidate
            .lesson
            .source_session_ids
            .last()
            .copied()
            .unwrap_or(0);
        if session > 0
            && self.per_session.get(&session).copied().unwrap_or(0)
                >= self.config.max_per_source_session
        {
            return false;
        }

        let bucket = candidate
            .lesson
            .tags
            .first()
            .cloned()
            .unwrap_or_else(|| "generic".into());
        if self.per_tag.get(&bucket).copied().unwrap_or(0) >= self.config.max_per_tag_bucket {
            return false;
        }

        if let Some(index) = self.selected.iter().position(|chosen| {
            chosen
                .lesson
                .conflicts_with
                .iter()
                .any(|id| *id == candidate.lesson.id)
                || candidate
                    .lesson
                    .conflicts_with
                    .iter()
                    .any(|id| *id == chosen.lesson.id)
        }) {
            let incumbent = &self.selected[index];
            if candidate.lesson.reliability() > incumbent.lesson.reliability() {
                self.conflict_losers
                    .push((incumbent.lesson.id.clone(), candidate.lesson.id.clone()));
                self.selected[index] = candidate;
            } else {
                self.conflict_losers
                    .push((candidate.lesson.id.clone(), incumbent.lesson.id.clone()));
            }
            return false;
        }

        if session > 0 {
            *self.per_session.entry(session).or_insert(0) += 1;
        }
        *self.per_tag.entry(bucket).or_insert(0) += 1;
        self.selected.push(candidate);
        true
    }

    fn finish(self) -> RetrievalOutcome {
        RetrievalOutcome {
            matches: self.selected,
            conflict_losers: self.conflict_losers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::types::{CandidateLesson, LessonStatus};

    fn lesson(rule: &str, triggers: &[&str], domain: &str, session: u64) -> Lesson {
        Lesson::from_candidate(
            &CandidateLesson {
                trigger_fingerprints: triggers.iter().map(|t| t.to_string()).collect(),
                rule_text: rule.into(),
                scope_hint: Default::default(),
                tags: vec![],
            },
            session,
            domain,
            "task-1",
            vec!["operator_mismatch".into()],
            false,
            Utc::now(),
        )
    }

    fn retriever(policy: TransferPolicy) -> Retriever {
        Retriever::new(LearningConfig::default(), policy)
    }

    fn on_error_query(fingerprint: &str, domain: &str) -> RetrievalQuery {
        RetrievalQuery {
            text: "filter rows where amount above threshold".into(),
            fingerprint: fingerprint.into(),
            tags: vec!["operator_mismatch".into()],
            domain_key: domain.into(),
        }
    }

    #[test]
    fn test_exact_fingerprint_beats_text_only_match() {
        let records = vec![
            lesson(
                "operators are words use gt lt eq",
                &["gridtool:keep requires word operator"],
                "cli:gridtool",
                1,
            ),
            lesson(
                "filter rows where amount above threshold carefully",
                &["gridtool:other failure"],
                "cli:gridtool",
                2,
            ),
        ];
        let outcome = retriever(TransferPolicy::Off).on_error(
            &records,
            &on_error_query("gridtool:keep requires word operator", "cli:gridtool"),
        );
        assert!(!outcome.matches.is_empty());
        assert_eq!(
            outcome.matches[0].lesson.trigger_fingerprints,
            vec!["gridtool:keep requires word operator"]
        );
        assert!((outcome.matches[0].score.fingerprint_match - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_prefix_fingerprint_scores_partial() {
        let records = vec![lesson(
            "operators are words use gt lt eq",
            &["gridtool:keep requires word operator eq neq gt lt"],
            "cli:gridtool",
            1,
        )];
        let outcome = retriever(TransferPolicy::Off).on_error(
            &records,
            &on_error_query("gridtool:keep requires word", "cli:gridtool"),
        );
        assert!((outcome.matches[0].score.fingerprint_match - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_suppressed_and_archived_never_returned() {
        let mut suppressed = lesson("use gt", &["gridtool:keep"], "cli:gridtool", 1);
        suppressed.status = LessonStatus::Suppressed;
        let mut archived = lesson("use lt", &["gridtool:keep"], "cli:gridtool", 2);
        archived.status = LessonStatus::Archived;
        let outcome = retriever(TransferPolicy::Always).on_error(
            &[suppressed, archived],
            &on_error_query("gridtool:keep", "cli:gridtool"),
        );
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn test_on_error_cap_respected() {
        let records: Vec<Lesson> = (0..6)
            .map(|index| {
                lesson(
                    &format!("rule variant {index} about word operators gt lt"),
                    &["gridtool:keep requires word operator"],
                    "cli:gridtool",
                    100 + index,
                )
            })
            .collect();
        let outcome = retriever(TransferPolicy::Off).on_error(
            &records,
            &on_error_query("gridtool:keep requires word operator", "cli:gridtool"),
        );
        assert!(outcome.matches.len() <= LearningConfig::default().on_error_max_results);
    }

    #[test]
    fn test_per_session_guard() {
        let config = LearningConfig {
            prerun_max_results: 8,
            ..Default::default()
        };
        let records: Vec<Lesson> = (0..5)
            .map(|index| {
                lesson(
                    &format!("distinct rule number {index} for filtering"),
                    &[&format!("gridtool:failure {index}")],
                    "cli:gridtool",
                    7,
                )
            })
            .collect();
        let retriever = Retriever::new(config.clone(), TransferPolicy::Off);
        let outcome = retriever.pre_run(
            &records,
            &RetrievalQuery {
                text: "filtering rule".into(),
                domain_key: "cli:gridtool".into(),
                ..Default::default()
            },
        );
        assert!(
            outcome.matches.len() <= config.max_per_source_session,
            "got {} lessons from one session",
            outcome.matches.len()
        );
    }

    #[test]
    fn test_transfer_off_excludes_cross_domain() {
        let records = vec![lesson(
            "aggregation functions are lowercase",
            &["gridtool:unknown function"],
            "cli:gridtool",
            1,
        )];
        let outcome = retriever(TransferPolicy::Off).on_error(
            &records,
            &on_error_query("fluxtool:unknown function", "cli:fluxtool"),
        );
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn test_auto_transfer_fires_without_strict_hits() {
        let records = vec![lesson(
            "aggregation functions are lowercase",
            &["gridtool:unknown function <str> use lowercase"],
            "cli:gridtool",
            1,
        )];
        let query = RetrievalQuery {
            text: "unknown function SUM use lowercase".into(),
            fingerprint: "fluxtool:unknown function <str> use lowercase".into(),
            tags: vec!["function_case".into()],
            domain_key: "cli:fluxtool".into(),
        };
        let outcome = retriever(TransferPolicy::Auto).on_error(&records, &query);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].lane, RetrievalLane::Transfer);
    }

    #[test]
    fn test_auto_transfer_suppressed_by_high_confidence_strict_hit() {
        let mut strict_hit = lesson(
            "keep operators are words use gt",
            &["fluxtool:filter unknown operator"],
            "cli:fluxtool",
            1,
        );
        strict_hit.helpful_count = 8; // high reliability -> clears threshold
        let transfer_candidate = lesson(
            "aggregation functions are lowercase",
            &["gridtool:filter unknown operator"],
            "cli:gridtool",
            2,
        );
        let query = RetrievalQuery {
            text: "keep operators words use gt".into(),
            fingerprint: "fluxtool:filter unknown operator".into(),
            tags: vec!["operator_mismatch".into()],
            domain_key: "cli:fluxtool".into(),
        };
        let outcome =
            retriever(TransferPolicy::Auto).on_error(&[strict_hit, transfer_candidate], &query);
        assert!(outcome
            .matches
            .iter()
            .all(|m| m.lane == RetrievalLane::Strict));
    }

    #[test]
    fn test_transfer_on_error_quota_is_one() {
        let records: Vec<Lesson> = (0..3)
            .map(|index| {
                lesson(
                    &format!("portable rule {index} about lowercase functions"),
                    &[&format!("gridtool:unknown function {index}")],
                    "cli:gridtool",
                    200 + index,
                )
            })
            .collect();
        let query = RetrievalQuery {
            text: "lowercase functions portable rule".into(),
            fingerprint: "fluxtool:unknown function".into(),
            tags: vec![],
            domain_key: "cli:fluxtool".into(),
        };
        let outcome = retriever(TransferPolicy::Always).on_error(&records, &query);
        let transferred = outcome
            .matches
            .iter()
            .filter(|m| m.lane == RetrievalLane::Transfer)
            .count();
        assert!(transferred <= 1, "transfer quota exceeded: {transferred}");
    }

    #[test]
    fn test_conflict_pair_resolves_to_higher_reliability() {
        let mut winner = lesson(
            "aggregation functions must be lowercase",
            &["gridtool:tally"],
            "cli:gridtool",
            1,
        );
        winner.helpful_count = 6;
        let mut loser = lesson(
            "quote every file path in double quotes",
            &["gridtool:tally"],
            "cli:gridtool",
            2,
        );
        winner.conflicts_with = vec![loser.id.clone()];
        loser.conflicts_with = vec![winner.id.clone()];
        let winner_id = winner.id.clone();
        let loser_id = loser.id.clone();

        let query = RetrievalQuery {
            text: "tally lowercase quote path".into(),
            fingerprint: "gridtool:tally".into(),
            tags: vec![],
            domain_key: "cli:gridtool".into(),
        };
        let outcome = retriever(TransferPolicy::Off).on_error(&[winner, loser], &query);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.conflict_losers, vec![(loser_id, winner_id)]);
    }

    #[test]
    fn test_empty_store_returns_empty() {
        let outcome = retriever(TransferPolicy::Always).pre_run(
            &[],
            &RetrievalQuery {
                text: "anything".into(),
                domain_key: "cli:gridtool".into(),
                ..Default::default()
            },
        );
        assert!(outcome.matches.is_empty());
        assert!(outcome.conflict_losers.is_empty());
    }

    #[test]
    fn test_recency_half_life() {
        let now = Utc::now();
        let half = recency_score(now - chrono::Duration::days(14), 14.0, now);
        assert!((half - 0.5).abs() < 0.01, "got {half}");
        let fresh = recency_score(now, 14.0, now);
        assert!((fresh - 1.0).abs() < 1e-6);
    }
}
