//! LessonStore: persistent lesson records with dedup and conflict links.
//!
//! Reads are served from an in-memory snapshot so retrieval stays cheap and
//! the step loop keeps working when the database degrades; every mutation
//! writes through to `lessons.db`. A write failure flips the store into
//! degraded (memory-only) mode for the remainder of the process and logs a
//! warning, which is exactly the failure contract the session runner expects.

use super::types::{text_jaccard, Lesson, LessonStatus};
use super::{LearningConfig, LearningError};

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Wraps a dedicated SQLite pool for lessons.db plus the live snapshot.
pub struct LessonStore {
    pool: Option<SqlitePool>,
    lessons: RwLock<HashMap<String, Lesson>>,
    config: LearningConfig,
    degraded: AtomicBool,
}

/// Result of one upsert: the surviving id and whether a merge happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: String,
    pub merged: bool,
}

impl LessonStore {
    /// Connect to (or create) lessons.db at the given path and hydrate the
    /// snapshot. Runs the embedded schema and enables WAL mode.
    pub async fn connect(
        path: &Path,
        config: LearningConfig,
    ) -> Result<Arc<Self>, LearningError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| LearningError::Store(format!("invalid db path: {error}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA_V1).execute(&pool).await?;

        let rows: Vec<(String,)> = sqlx::query_as("SELECT record FROM lessons")
            .fetch_all(&pool)
            .await?;

        let mut lessons = HashMap::with_capacity(rows.len());
        for (record,) in rows {
            match serde_json::from_str::<Lesson>(&record) {
                Ok(lesson) => {
                    lessons.insert(lesson.id.clone(), lesson);
                }
                Err(error) => {
                    tracing::warn!(%error, "skipping unreadable lesson row");
                }
            }
        }

        Ok(Arc::new(Self {
            pool: Some(pool),
            lessons: RwLock::new(lessons),
            config,
            degraded: AtomicBool::new(false),
        }))
    }

    /// Memory-only store. Used by tests and as the degraded fallback when
    /// connecting to lessons.db fails at session start.
    pub fn in_memory(config: LearningConfig) -> Arc<Self> {
        Arc::new(Self {
            pool: None,
            lessons: RwLock::new(HashMap::new()),
            config,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// True once a persistence failure forced memory-only operation.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lessons.read().expect("lessons lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Lesson> {
        self.lessons
            .read()
            .expect("lessons lock poisoned")
            .get(id)
            .cloned()
    }

    /// Consistent point-in-time view of every record.
    pub fn snapshot(&self) -> Vec<Lesson> {
        self.lessons
            .read()
            .expect("lessons lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// All records matching a predicate.
    pub fn iter_filtered(&self, filter: impl Fn(&Lesson) -> bool) -> Vec<Lesson> {
        self.lessons
            .read()
            .expect("lessons lock poisoned")
            .values()
            .filter(|lesson| filter(lesson))
            .cloned()
            .collect()
    }

    // -- Mutations ----------------------------------------------------------

    /// Insert a candidate, or merge it into an existing lesson when the
    /// trigger sets match and the rule texts clear the dedup threshold.
    /// Returns the surviving id.
    pub async fn upsert(&self, incoming: Lesson) -> UpsertOutcome {
        let (outcome, changed) = {
            let mut lessons = self.lessons.write().expect("lessons lock poisoned");

            let duplicate_id = lessons
                .values()
                .find(|existing| {
                    existing.same_trigger_set(&incoming)
                        && text_jaccard(&existing.rule_text, &incoming.rule_text)
                            >= self.config.dedup_jaccard
                })
                .map(|existing| existing.id.clone());

            let (id, merged) = match duplicate_id {
                Some(id) => {
                    let existing = lessons.get_mut(&id).expect("dedup hit must exist");
                    merge_into(existing, &incoming);
                    (id, true)
                }
                None => {
                    let id = incoming.id.clone();
                    lessons.insert(id.clone(), incoming);
                    (id, false)
                }
            };

            let changed = refresh_conflict_links(&mut lessons, &id, self.config.conflict_jaccard);
            (UpsertOutcome { id, merged }, changed)
        };

        for id in changed {
            self.persist_by_id(&id).await;
        }
        outcome
    }

    /// Apply a lifecycle transition. No-op when the lesson is unknown or
    /// already in a terminal status; returns whether anything changed.
    pub async fn transition(&self, id: &str, new_status: LessonStatus, reason: &str) -> bool {
        let changed = {
            let mut lessons = self.lessons.write().expect("lessons lock poisoned");
            let Some(lesson) = lessons.get_mut(id) else {
                return false;
            };
            if lesson.status.is_terminal() || lesson.status == new_status {
                false
            } else {
                lesson.status = new_status;
                lesson.updated_at = Utc::now();
                if new_status == LessonStatus::Archived {
                    lesson.archived_reason = Some(reason.to_owned());
                }
                tracing::debug!(lesson_id = %id, status = %new_status, reason, "lesson transition");
                true
            }
        };
        if changed {
            self.persist_by_id(id).await;
        }
        changed
    }

    /// Record a conflict between two lessons. Links are always symmetric.
    pub async fn link_conflict(&self, a_id: &str, b_id: &str) {
        if a_id == b_id {
            return;
        }
        let linked = {
            let mut lessons = self.lessons.write().expect("lessons lock poisoned");
            if !lessons.contains_key(a_id) || !lessons.contains_key(b_id) {
                return;
            }
            let mut linked = false;
            for (this, other) in [(a_id, b_id), (b_id, a_id)] {
                let lesson = lessons.get_mut(this).expect("checked above");
                if !lesson.conflicts_with.iter().any(|id| id == other) {
                    lesson.conflicts_with.push(other.to_owned());
                    lesson.conflicts_with.sort_unstable();
                    lesson.updated_at = Utc::now();
                    linked = true;
                }
            }
            linked
        };
        if linked {
            self.persist_by_id(a_id).await;
            self.persist_by_id(b_id).await;
        }
    }

    /// Overwrite one record in place. Used by the promoter after counter
    /// updates; the caller owns the semantics of the change.
    pub async fn save(&self, lesson: Lesson) {
        let id = lesson.id.clone();
        self.lessons
            .write()
            .expect("lessons lock poisoned")
            .insert(id.clone(), lesson);
        self.persist_by_id(&id).await;
    }

    /// Rewrite the whole table from the snapshot inside one transaction.
    ///
    /// Ids and merged counters survive unchanged; this exists to reclaim
    /// superseded rows after heavy merge traffic. Returns the row count.
    pub async fn compact(&self) -> Result<usize, LearningError> {
        let records = self.snapshot();
        let Some(pool) = &self.pool else {
            return Ok(records.len());
        };
        if self.is_degraded() {
            return Ok(records.len());
        }

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM lessons").execute(&mut *tx).await?;
        for lesson in &records {
            let record = serde_json::to_string(lesson)
                .map_err(|error| LearningError::Store(error.to_string()))?;
            sqlx::query(
                "INSERT INTO lessons (id, status, domain_key, updated_at, record) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&lesson.id)
            .bind(lesson.status.to_string())
            .bind(&lesson.domain_key)
            .bind(lesson.updated_at.to_rfc3339())
            .bind(&record)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    // -- Persistence --------------------------------------------------------

    async fn persist_by_id(&self, id: &str) {
        let Some(lesson) = self.get(id) else {
            return;
        };
        let Some(pool) = &self.pool else {
            return;
        };
        if self.is_degraded() {
            return;
        }

        let record = match serde_json::to_string(&lesson) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%error, lesson_id = %id, "failed to encode lesson");
                return;
            }
        };

        let result = sqlx::query(
            "INSERT INTO lessons (id, status, domain_key, updated_at, record) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             status = excluded.status, domain_key = excluded.domain_key, \
             updated_at = excluded.updated_at, record = excluded.record",
        )
        .bind(&lesson.id)
        .bind(lesson.status.to_string())
        .bind(&lesson.domain_key)
        .bind(lesson.updated_at.to_rfc3339())
        .bind(&record)
        .execute(pool)
        .await;

        if let Err(error) = result {
            self.degraded.store(true, Ordering::Relaxed);
            tracing::warn!(%error, lesson_id = %id, "lesson write failed; continuing in-memory");
        }
    }
}

impl std::fmt::Debug for LessonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LessonStore")
            .field("lessons", &self.len())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

/// Merge an incoming duplicate into the surviving record.
///
/// Counters sum, `created_at` keeps the earliest, the higher-reliability rule
/// text wins, and a promotion block lifts once the rule re-emerges from a
/// different session with its own clean evidence.
fn merge_into(existing: &mut Lesson, incoming: &Lesson) {
    if incoming.reliability() > existing.reliability() {
        existing.rule_text = incoming.rule_text.clone();
    }
    existing.retrieval_count += incoming.retrieval_count;
    existing.helpful_count += incoming.helpful_count;
    existing.harmful_count += incoming.harmful_count;
    existing.major_regressions += incoming.major_regressions;

    let new_session = incoming
        .source_session_ids
        .iter()
        .any(|session| !existing.source_session_ids.contains(session));
    for session in &incoming.source_session_ids {
        if !existing.source_session_ids.contains(session) {
            existing.source_session_ids.push(*session);
        }
    }
    existing.source_session_ids.sort_unstable();

    if existing.promotion_blocked && new_session && !incoming.promotion_blocked {
        existing.promotion_blocked = false;
    }

    for tag in incoming.tags.iter().chain(&incoming.model_tags) {
        if !existing.tags.contains(tag) && !existing.model_tags.contains(tag) {
            existing.model_tags.push(tag.clone());
        }
    }

    existing.created_at = existing.created_at.min(incoming.created_at);
    existing.updated_at = Utc::now();
}

/// Re-derive conflict links for `changed_id` against the rest of the store:
/// overlapping triggers with rule texts below the conflict threshold. Returns
/// every id whose links changed (including the changed record itself).
fn refresh_conflict_links(
    lessons: &mut HashMap<String, Lesson>,
    changed_id: &str,
    conflict_jaccard: f64,
) -> Vec<String> {
    let Some(changed) = lessons.get(changed_id).cloned() else {
        return Vec::new();
    };

    let mut conflict_ids: Vec<String> = Vec::new();
    for other in lessons.values() {
        if other.id == changed.id {
            continue;
        }
        if changed.shares_trigger(other)
            && text_jaccard(&changed.rule_text, &other.rule_text) < conflict_jaccard
        {
            conflict_ids.push(other.id.clone());
        }
    }

    let mut touched = vec![changed_id.to_owned()];
    for other_id in &conflict_ids {
        for (this, other) in [(changed_id, other_id.as_str()), (other_id.as_str(), changed_id)] {
            let lesson = lessons.get_mut(this).expect("ids from this map");
            if !lesson.conflicts_with.iter().any(|id| id == other) {
                lesson.conflicts_with.push(other.to_owned());
                lesson.conflicts_with.sort_unstable();
            }
        }
        touched.push(other_id.clone());
    }
    touched
}

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS lessons (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    domain_key TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lessons_status ON lessons(status);
CREATE INDEX IF NOT EXISTS idx_lessons_domain ON lessons(domain_key);
"#;
