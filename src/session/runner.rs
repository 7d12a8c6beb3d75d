//! The session step loop and post-run learning pipeline.
//!
//! One session drives the model and one domain adapter turn-by-turn until a
//! terminal condition, then evaluates (referee), extracts candidate lessons
//! (critic), and updates lesson utility (promoter). Adapter runtime errors
//! are data for the learning loop; only model-transport failures are fatal
//! to the caller. Metrics are always written and the event log always ends
//! cleanly, whatever the outcome.

use crate::adapter::ToolAdapter;
use crate::config::BotConfig;
use crate::error::{AgentError, Result};
use crate::fingerprint::{build_fingerprint, extract_tags, ErrorChannel, ErrorEvent};
use crate::knowledge::{format_chunks, LocalDocsKnowledgeProvider};
use crate::learning::critic::{Critic, CriticInput, TraceStep};
use crate::learning::promoter::{LessonOutcome, Promoter};
use crate::learning::retriever::{RetrievalLane, RetrievalQuery, Retriever};
use crate::learning::types::Lesson;
use crate::learning::LessonStore;
use crate::llm::{turn_with_retry, Message, ModelClient, TurnRequest};
use crate::referee::{Contract, EvalSource, LlmJudge, Referee, Verdict};
use crate::session::events::{
    append_global_capture, ensure_session, load_prior_fingerprints, read_events, EventLog,
    EventRow,
};
use crate::session::metrics::{recent_scores, SessionMetrics};
use crate::session::prompt::{
    build_reflection_prompt, build_system_prompt, format_hint_block, format_lessons_block,
};
use crate::session::validation::validate_shape;
use crate::session::EndReason;

use chrono::Utc;
use tokio::sync::watch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_VALIDATION_RETRIES_PER_STEP: u32 = 2;
const HARD_FAILURE_REFLECTION_THRESHOLD: usize = 3;
const TRANSPORT_MAX_RETRIES: u32 = 3;
const TRANSPORT_BASE_DELAY: Duration = Duration::from_millis(200);
const EXECUTOR_MAX_TOKENS: u32 = 1800;

/// What to run.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: u64,
    pub task_id: String,
    /// Explicit task text; falls back to `tasks/<task_id>/task.md`.
    pub task_text: Option<String>,
    pub domain: String,
    /// Overrides the configured step budget when set.
    pub max_steps: Option<u32>,
}

/// What one session produced.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub metrics: SessionMetrics,
    /// True when the session died on model transport; the CLI exits non-zero
    /// only for this.
    pub transport_failed: bool,
}

/// One hint/lesson injection visible to the model.
#[derive(Debug, Clone)]
struct Activation {
    step: u32,
    /// Empty for the pre-run block.
    fingerprint: String,
    lesson_ids: Vec<String>,
}

fn load_task_text(config: &BotConfig, request: &SessionRequest) -> String {
    if let Some(text) = &request.task_text {
        if !text.trim().is_empty() {
            return text.trim().to_owned();
        }
    }
    let task_md = config
        .data_root
        .join("tasks")
        .join(&request.task_id)
        .join("task.md");
    if let Ok(text) = std::fs::read_to_string(&task_md) {
        return text.trim().to_owned();
    }
    format!("Task: {}. Complete using available tools.", request.task_id)
}

fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.max(low).min(high)
}

/// Run one full session: step loop plus post-session evaluation and
/// learning updates.
pub async fn run_session<M: ModelClient>(
    config: &BotConfig,
    request: SessionRequest,
    model: &M,
    mut adapter: Box<dyn ToolAdapter>,
    store: Arc<LessonStore>,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<SessionReport> {
    let started = Instant::now();
    let max_steps = request.max_steps.unwrap_or(config.max_steps).max(1);
    let domain_key = adapter.domain_key();
    let tool_family = adapter.tool_family();

    let paths = ensure_session(&config.data_root, request.session_id)?;
    adapter
        .bootstrap(&paths.work_dir)
        .map_err(|error| AgentError::Setup(format!("adapter bootstrap failed: {error}")))?;

    let task_text = load_task_text(config, &request);
    let task_dir = config.data_root.join("tasks").join(&request.task_id);
    let contract = Contract::load(&task_dir).unwrap_or_else(|error| {
        tracing::warn!(%error, "unreadable contract; evaluating without it");
        None
    });

    let mut metrics = SessionMetrics::new(request.session_id, &request.task_id, &domain_key);
    let mut log = EventLog::create(&paths, request.session_id, &request.task_id, &request.domain)?;

    let is_cancelled =
        |cancel: &Option<watch::Receiver<bool>>| cancel.as_ref().is_some_and(|rx| *rx.borrow());

    // -- Pre-run retrieval --------------------------------------------------

    let retriever = Retriever::new(store.config().clone(), config.transfer_policy);
    let snapshot = store.snapshot();
    metrics.v2_lessons_loaded = snapshot.len();
    let prerun = retriever.pre_run(
        &snapshot,
        &RetrievalQuery {
            text: task_text.clone(),
            fingerprint: String::new(),
            tags: Vec::new(),
            domain_key: domain_key.clone(),
        },
    );
    let (lessons_block, prerun_ids) = format_lessons_block(&prerun.matches);
    metrics.v2_prerun_lesson_ids = prerun_ids.clone();
    metrics.v2_lesson_activations += prerun_ids.len() as u32;
    metrics.v2_transfer_lane_activations += prerun
        .matches
        .iter()
        .filter(|matched| matched.lane == RetrievalLane::Transfer)
        .count() as u32;

    let system_prompt =
        build_system_prompt(&adapter.system_prompt_fragment(), &request.task_id, &lessons_block);
    let tools = adapter.tool_spec();
    let mut messages: Vec<Message> = vec![Message::User {
        text: task_text.clone(),
    }];

    // -- Step-loop state ----------------------------------------------------

    let prior_fingerprints = load_prior_fingerprints(&config.data_root);
    let mut activations: Vec<Activation> = vec![Activation {
        step: 0,
        fingerprint: String::new(),
        lesson_ids: prerun_ids,
    }];
    let mut conflict_losses: Vec<(String, String)> = prerun.conflict_losers.clone();
    let mut hard_failures: Vec<(u32, String)> = Vec::new();
    let mut seen_fingerprints: Vec<String> = Vec::new();
    let mut reflected_fingerprints: std::collections::HashSet<String> = Default::default();
    let mut threshold_reflection_fired = false;
    let mut last_fingerprint: Option<String> = None;
    let mut reflection_pending: Option<String> = None;

    let mut step: u32 = 1;
    let mut validation_retries_this_step: u32 = 0;
    let mut validation_capped_this_step = false;
    let mut end_reason = EndReason::Budget;
    let mut transport_failed = false;

    while step <= max_steps {
        metrics.steps = step;

        if started.elapsed() > config.wall_clock_budget {
            end_reason = EndReason::WallClock;
            break;
        }
        if is_cancelled(&cancel) {
            end_reason = EndReason::Cancelled;
            break;
        }
        if let Some(text) = reflection_pending.take() {
            metrics.reflection_turns += 1;
            messages.push(Message::User { text });
        }

        let turn = match turn_with_retry(
            model,
            TurnRequest {
                model: &config.model_executor,
                system: &system_prompt,
                messages: &messages,
                tools: &tools,
                max_tokens: EXECUTOR_MAX_TOKENS,
            },
            TRANSPORT_MAX_RETRIES,
            TRANSPORT_BASE_DELAY,
        )
        .await
        {
            Ok(turn) => turn,
            Err(error) => {
                tracing::error!(%error, "model transport failed; ending session");
                end_reason = EndReason::Transport;
                transport_failed = true;
                break;
            }
        };

        messages.push(Message::Assistant {
            text: turn.text(),
            tool_call: turn.tool_call.clone(),
        });
        let Some(call) = turn.tool_call else {
            end_reason = EndReason::ModelStopped;
            break;
        };
        metrics.tool_actions += 1;

        // Shape validation runs before execution so malformed calls never
        // consume the execution budget. Semantic errors are not caught here.
        let schema = tools
            .iter()
            .find(|tool| tool.name == call.name)
            .map(|tool| &tool.input_schema);
        if let Some(validation_error) = validate_shape(&call.name, &call.input, schema) {
            log.step(
                step,
                &call.name,
                call.input.clone(),
                false,
                Some(validation_error.clone()),
                None,
                None,
            )?;
            if validation_retries_this_step < MAX_VALIDATION_RETRIES_PER_STEP {
                validation_retries_this_step += 1;
                metrics.validation_retry_attempts += 1;
                messages.push(Message::ToolResult {
                    call_id: call.id,
                    text: validation_error,
                    is_error: true,
                });
                // Same step: the retry must not burn execution budget.
                continue;
            }
            if !validation_capped_this_step {
                metrics.validation_retry_capped_events += 1;
                validation_capped_this_step = true;
            }
            let fingerprint = format!("validation:{}:{}", call.name, validation_retries_this_step);
            reflection_pending = Some(build_reflection_prompt(
                &validation_error,
                &fingerprint,
                "validation_retry_cap",
            ));
            messages.push(Message::ToolResult {
                call_id: call.id,
                text: validation_error,
                is_error: true,
            });
            step += 1;
            validation_retries_this_step = 0;
            validation_capped_this_step = false;
            continue;
        }

        let outcome = adapter.execute(&call.name, &call.input);
        let mut result_text;
        let mut memory_payload: Option<serde_json::Value> = None;

        if let Some(error_text) = &outcome.error {
            metrics.tool_errors += 1;
            result_text = error_text.clone();

            let known_tool = tools.iter().any(|tool| tool.name == call.name);
            if known_tool {
                let fingerprint = build_fingerprint(&tool_family, error_text, &call.input, None);
                let tags = extract_tags(error_text, &call.input);

                let mut channels = vec![ErrorChannel::HardFailure];
                if tags.iter().any(|tag| tag == "constraint_failed") {
                    channels.push(ErrorChannel::ConstraintFailure);
                }
                if seen_fingerprints.iter().any(|seen| seen == &fingerprint) {
                    channels.push(ErrorChannel::NoProgress);
                }
                if step >= 3.max(max_steps / 2) {
                    channels.push(ErrorChannel::EfficiencyRegression);
                }
                for channel in channels {
                    let event = ErrorEvent::capture(
                        request.session_id,
                        step,
                        channel,
                        &tool_family,
                        &call.name,
                        call.input.clone(),
                        error_text,
                    );
                    append_global_capture(&config.data_root, &event);
                    log.error_capture(step, event)?;
                    metrics.v2_error_events += 1;
                }
                hard_failures.push((step, fingerprint.clone()));

                // Repetition monitor: a fingerprint firing twice in a row or
                // an accumulating failure count forces a reflection turn.
                let repeat_in_a_row = last_fingerprint.as_deref() == Some(fingerprint.as_str());
                if reflection_pending.is_none() {
                    if repeat_in_a_row && !reflected_fingerprints.contains(&fingerprint) {
                        reflected_fingerprints.insert(fingerprint.clone());
                        reflection_pending = Some(build_reflection_prompt(
                            error_text,
                            &fingerprint,
                            "repeat_fingerprint",
                        ));
                    } else if !threshold_reflection_fired
                        && hard_failures.len() >= HARD_FAILURE_REFLECTION_THRESHOLD
                    {
                        threshold_reflection_fired = true;
                        reflection_pending = Some(build_reflection_prompt(
                            error_text,
                            &fingerprint,
                            "error_threshold",
                        ));
                    }
                }

                // On-error retrieval: hints ride back on the tool result so
                // the model sees them on the very next turn.
                let on_error = retriever.on_error(
                    &store.snapshot(),
                    &RetrievalQuery {
                        text: format!("{task_text}\n{error_text}"),
                        fingerprint: fingerprint.clone(),
                        tags: tags.clone(),
                        domain_key: domain_key.clone(),
                    },
                );
                conflict_losses.extend(on_error.conflict_losers.iter().cloned());
                if !on_error.matches.is_empty() {
                    let hints: Vec<String> = on_error
                        .matches
                        .iter()
                        .map(|matched| matched.lesson.rule_text.clone())
                        .collect();
                    metrics.v2_lesson_activations += hints.len() as u32;
                    metrics.v2_transfer_lane_activations += on_error
                        .matches
                        .iter()
                        .filter(|matched| matched.lane == RetrievalLane::Transfer)
                        .count() as u32;
                    activations.push(Activation {
                        step,
                        fingerprint: fingerprint.clone(),
                        lesson_ids: on_error
                            .matches
                            .iter()
                            .map(|matched| matched.lesson.id.clone())
                            .collect(),
                    });
                    memory_payload = Some(serde_json::json!({
                        "injected_lessons": on_error
                            .matches
                            .iter()
                            .map(|matched| serde_json::json!({
                                "lesson_id": matched.lesson.id,
                                "lane": matched.lane.to_string(),
                                "score": matched.score.total,
                            }))
                            .collect::<Vec<_>>(),
                    }));
                    result_text.push_str(&format_hint_block(&hints));
                }

                seen_fingerprints.push(fingerprint.clone());
                last_fingerprint = Some(fingerprint);
            }
        } else {
            result_text = if outcome.output.is_empty() {
                "(ok)".to_owned()
            } else {
                outcome.output.clone()
            };
            last_fingerprint = None;
        }

        log.step(
            step,
            &call.name,
            call.input.clone(),
            !outcome.is_error(),
            outcome.error.clone(),
            if outcome.is_error() { None } else { Some(outcome.output.clone()) },
            memory_payload,
        )?;
        messages.push(Message::ToolResult {
            call_id: call.id,
            text: result_text,
            is_error: outcome.is_error(),
        });

        step += 1;
        validation_retries_this_step = 0;
        validation_capped_this_step = false;
    }

    metrics.end_reason = end_reason;
    let cancelled = end_reason == EndReason::Cancelled;

    // -- Post-session: referee ----------------------------------------------

    let final_state = adapter.capture_final_state();
    let trace_tail = trace_tail_from_events(&paths.events_path);

    let referee_outcome = if transport_failed {
        None
    } else {
        let judge = LlmJudge::new(config.model_judge.clone(), request.domain.clone());
        let referee = Referee::new(contract, Some(judge));
        Some(
            referee
                .evaluate(Some(model), &task_text, &trace_tail, &final_state)
                .await,
        )
    };

    if let Some(outcome) = &referee_outcome {
        metrics.final_verdict = outcome.verdict;
        metrics.passed = outcome.passed();
        metrics.score = outcome.score;
        metrics.eval_source = outcome.eval_source;
        metrics.eval_reasons = outcome.reasons.clone();
        metrics.eval_disagreement = outcome.disagreement;
        metrics.contract_passed = outcome.contract_passed;
        metrics.judge_passed = outcome.judge_passed;
    } else {
        metrics.final_verdict = Verdict::Fail;
        metrics.eval_source = EvalSource::None;
        metrics
            .eval_reasons
            .push(format!("session_ended: {end_reason}"));
    }

    // -- Post-session: critic -----------------------------------------------

    let session_fingerprints: Vec<String> = {
        let mut unique = Vec::new();
        for (_, fingerprint) in &hard_failures {
            if !unique.contains(fingerprint) {
                unique.push(fingerprint.clone());
            }
        }
        unique
    };

    let fully_passed = referee_outcome
        .as_ref()
        .is_some_and(|outcome| outcome.passed() && outcome.score >= 1.0);
    // Cancelled sessions never persist partial candidates; clean passes have
    // nothing durable to extract.
    if !cancelled && !transport_failed && !fully_passed {
        // Auto mode goes strict whenever this domain ships local docs.
        let learning_mode = match config.learning_mode {
            crate::config::LearningMode::Auto => {
                if adapter.docs_manifest().is_empty() {
                    crate::config::LearningMode::Legacy
                } else {
                    crate::config::LearningMode::Strict
                }
            }
            mode => mode,
        };
        let critic_context = match learning_mode {
            crate::config::LearningMode::Strict | crate::config::LearningMode::Auto => {
                let provider = LocalDocsKnowledgeProvider::default();
                let query = build_critic_query(&task_text, &metrics.eval_reasons, &trace_tail);
                format_chunks(&provider.retrieve(&query, &adapter.docs_manifest(), 4))
            }
            crate::config::LearningMode::Legacy => String::new(),
        };
        let verdict_summary = format!(
            "{} (score {:.2}): {}",
            metrics.final_verdict,
            metrics.score,
            metrics.eval_reasons.join(", "),
        );
        let critic = Critic::new(config.model_critic.clone(), learning_mode);
        let report = critic
            .generate(
                model,
                &CriticInput {
                    task_text: &task_text,
                    verdict_summary,
                    trace_tail: &trace_tail,
                    session_fingerprints: &session_fingerprints,
                    context: critic_context,
                },
            )
            .await;

        metrics.critic_raw_candidates = report.raw_count;
        metrics.critic_accepted_candidates = report.accepted.len();
        metrics.critic_rejected_candidates = report
            .rejected
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect();

        let promotion_blocked = referee_outcome
            .as_ref()
            .is_some_and(|outcome| outcome.verdict == Verdict::Uncertain);
        for candidate in report.accepted {
            let tags = extract_tags(&candidate.rule_text, &serde_json::Value::Null);
            let lesson = Lesson::from_candidate(
                &candidate,
                request.session_id,
                &domain_key,
                &metrics.task_cluster,
                tags,
                promotion_blocked,
                Utc::now(),
            );
            let result = store.upsert(lesson).await;
            if result.merged {
                metrics.v2_lessons_merged += 1;
            } else {
                metrics.v2_lessons_generated += 1;
            }
        }
    }

    // -- Post-session: promoter ---------------------------------------------

    // End-of-run learning updates run even for cancelled sessions; a dead
    // transport leaves no usable outcome signal, so only that path skips.
    if !transport_failed {
        let sessions_root = config.data_root.join("sessions");
        let baseline = recent_scores(
            &sessions_root,
            &domain_key,
            &metrics.task_cluster,
            request.session_id,
            3,
            6,
        );
        let referee_gain = if referee_outcome.is_some() && !baseline.is_empty() {
            let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
            Some(clamp(metrics.score - mean, -1.0, 1.0))
        } else {
            None
        };

        let outcomes = build_outcomes(
            &activations,
            &conflict_losses,
            &hard_failures,
            &store,
            metrics.steps,
            max_steps,
            metrics.passed,
            metrics.score,
            metrics.tool_errors,
            referee_gain,
        );
        let promoter = Promoter::new(store.config().clone());
        let summary = promoter.apply_outcomes(&store, &outcomes).await;
        metrics.v2_promoted = summary.promoted;
        metrics.v2_suppressed = summary.suppressed;
        metrics.v2_archived = promoter.archive_stale(&store, Utc::now()).await;
    }

    // -- Recurrence accounting ----------------------------------------------

    if !hard_failures.is_empty() {
        let failing = hard_failures.len() as f64;
        let before = hard_failures
            .iter()
            .filter(|(_, fingerprint)| prior_fingerprints.contains(fingerprint))
            .count() as f64;
        let after = hard_failures
            .iter()
            .filter(|(failed_step, fingerprint)| {
                activations.iter().any(|activation| {
                    !activation.fingerprint.is_empty()
                        && activation.fingerprint == *fingerprint
                        && activation.step < *failed_step
                })
            })
            .count() as f64;
        metrics.fingerprint_recurrence_before = before / failing;
        metrics.fingerprint_recurrence_after = after / failing;
    }

    metrics.store_degraded = store.is_degraded();
    metrics.elapsed_s = started.elapsed().as_secs_f64();
    metrics.write(&paths.metrics_path)?;

    Ok(SessionReport {
        metrics,
        transport_failed,
    })
}

/// Compact trace tail (last 20 executed steps) for judge and critic prompts.
fn trace_tail_from_events(events_path: &std::path::Path) -> Vec<TraceStep> {
    let rows = read_events(events_path);
    let steps: Vec<TraceStep> = rows
        .iter()
        .filter_map(|row| match row {
            EventRow::Step {
                step,
                tool,
                tool_input,
                ok,
                error,
                ..
            } => Some(TraceStep {
                step: *step,
                tool: tool.clone(),
                input_summary: {
                    let rendered = tool_input.to_string();
                    rendered.chars().take(300).collect()
                },
                ok: *ok,
                error: error.as_ref().map(|text| text.chars().take(500).collect()),
            }),
            _ => None,
        })
        .collect();
    let start = steps.len().saturating_sub(20);
    steps[start..].to_vec()
}

fn build_critic_query(task_text: &str, reasons: &[String], trace_tail: &[TraceStep]) -> String {
    let errors: Vec<String> = trace_tail
        .iter()
        .filter_map(|step| step.error.as_ref())
        .map(|error| error.chars().take(180).collect())
        .collect();
    format!(
        "task={task_text}\nreasons={}\nerrors={}",
        reasons.join(", "),
        errors.join(" | "),
    )
}

/// Fold activations and conflict losses into per-lesson outcomes.
#[allow(clippy::too_many_arguments)]
fn build_outcomes(
    activations: &[Activation],
    conflict_losses: &[(String, String)],
    hard_failures: &[(u32, String)],
    store: &LessonStore,
    steps: u32,
    max_steps: u32,
    passed: bool,
    score: f64,
    tool_errors: u32,
    referee_gain: Option<f64>,
) -> Vec<LessonOutcome> {
    let step_efficiency_gain = clamp(1.0 - steps as f64 / max_steps.max(1) as f64, -1.0, 1.0);
    let major_regression = score < 0.2 && tool_errors > 0;

    // error / count accumulators per lesson id.
    let mut buckets: HashMap<String, (f64, f64)> = HashMap::new();
    for activation in activations {
        // Pre-run injections have no triggering fingerprint; each lesson is
        // judged by whether its own failure mode fired this session.
        let shared_reduction = if activation.fingerprint.is_empty() {
            None
        } else {
            let repeats_after = hard_failures
                .iter()
                .filter(|(failed_step, fingerprint)| {
                    *fingerprint == activation.fingerprint && *failed_step > activation.step
                })
                .count();
            Some(if repeats_after == 0 {
                1.0
            } else {
                -clamp(repeats_after as f64 / 3.0, 0.0, 1.0)
            })
        };
        for lesson_id in &activation.lesson_ids {
            let reduction = shared_reduction
                .unwrap_or_else(|| prerun_error_reduction(store, lesson_id, hard_failures, passed));
            let entry = buckets.entry(lesson_id.clone()).or_insert((0.0, 0.0));
            entry.0 += reduction;
            entry.1 += 1.0;
        }
    }

    let mut outcomes: Vec<LessonOutcome> = buckets
        .into_iter()
        .map(|(lesson_id, (total, count))| LessonOutcome {
            lesson_id,
            error_reduction: total / count.max(1.0),
            step_efficiency_gain,
            referee_score_gain: referee_gain,
            major_regression,
            contradiction_lost: None,
        })
        .collect();
    outcomes.sort_by(|a, b| a.lesson_id.cmp(&b.lesson_id));

    for (loser, winner) in conflict_losses {
        outcomes.push(LessonOutcome {
            lesson_id: loser.clone(),
            error_reduction: 0.0,
            step_efficiency_gain: 0.0,
            referee_score_gain: referee_gain,
            major_regression: false,
            contradiction_lost: Some(winner.clone()),
        });
    }
    outcomes
}

/// Did a pre-run-injected lesson's own failure mode recur this session?
fn prerun_error_reduction(
    store: &LessonStore,
    lesson_id: &str,
    hard_failures: &[(u32, String)],
    passed: bool,
) -> f64 {
    let Some(lesson) = store.get(lesson_id) else {
        return 0.0;
    };
    let fired = hard_failures
        .iter()
        .filter(|(_, fingerprint)| {
            lesson.trigger_fingerprints.iter().any(|trigger| {
                fingerprint == trigger || fingerprint.starts_with(trigger.as_str())
            })
        })
        .count();
    if fired == 0 {
        if passed {
            1.0
        } else {
            0.0
        }
    } else {
        -clamp(fired as f64 / 3.0, 0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LearningMode, ModelBackend, TransferPolicy};
    use crate::learning::types::{CandidateLesson, LessonStatus};
    use crate::learning::LearningConfig;
    use crate::llm::mock::{ScriptedModel, ScriptedStep};
    use serde_json::json;

    fn test_config(data_root: std::path::PathBuf) -> BotConfig {
        BotConfig {
            api_key: String::new(),
            backend: ModelBackend::Anthropic,
            model_executor: "executor-model".into(),
            model_critic: "critic-model".into(),
            model_judge: "judge-model".into(),
            data_root,
            learning_mode: LearningMode::Legacy,
            transfer_policy: TransferPolicy::Auto,
            max_steps: 8,
            wall_clock_budget: Duration::from_secs(120),
            subprocess_timeout: Duration::from_secs(30),
        }
    }

    fn data_root() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("lorebot_test_runner_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn request(session_id: u64, domain: &str) -> SessionRequest {
        SessionRequest {
            session_id,
            task_id: "agg-sales".into(),
            task_text: Some(
                "Aggregate sales.csv by region into total=sum(amount) and show the result.".into(),
            ),
            domain: domain.into(),
            max_steps: None,
        }
    }

    fn judge_reply(passed: bool, score: f64) -> ScriptedStep {
        ScriptedStep::text(&format!(
            r#"{{"passed": {passed}, "score": {score}, "reasons": ["final state inspected"]}}"#
        ))
    }

    fn seeded_lesson(trigger: &str, domain: &str, status: LessonStatus) -> Lesson {
        let mut lesson = Lesson::from_candidate(
            &CandidateLesson {
                trigger_fingerprints: vec![trigger.into()],
                rule_text: "operators are words not symbols; use gt, lt, eq".into(),
                scope_hint: Default::default(),
                tags: vec![],
            },
            1,
            domain,
            "agg-sales",
            vec!["operator_mismatch".into()],
            false,
            Utc::now(),
        );
        lesson.status = status;
        lesson.helpful_count = 4;
        lesson
    }

    // S1: cold start. First call uses `>` where the tool expects `gt`; the
    // store is empty, the referee fails the run, the critic emits a
    // candidate grounded in the observed fingerprint.
    #[tokio::test]
    async fn test_cold_start_failure_produces_candidate_lesson() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());

        let bad_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nKEEP amount > 100\nSHOW"}),
        );
        let stop = ScriptedStep::text("I cannot finish this.");
        let critic_reply = ScriptedStep::text(
            r#"[{"trigger_fingerprints":["gridtool:keep requires word operator"],
                 "rule_text":"WRONG symbol operators like > -> CORRECT word operators gt, lt, eq",
                 "scope_hint":"domain","tags":["operator_mismatch"]}]"#,
        );
        let model =
            ScriptedModel::new([bad_call, stop, judge_reply(false, 0.0), critic_reply]);

        let report = run_session(
            &config,
            request(1, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert!(!report.transport_failed);
        assert!(!report.metrics.passed);
        assert_eq!(report.metrics.tool_errors, 1);
        assert_eq!(report.metrics.v2_error_events, 1);
        assert!(report.metrics.v2_prerun_lesson_ids.is_empty());
        assert_eq!(report.metrics.v2_lessons_generated, 1);

        let stored = store.snapshot();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].rule_text.contains("word operators"));
        assert!(stored[0]
            .trigger_fingerprints
            .iter()
            .any(|fp| fp.starts_with("gridtool:keep")));
    }

    // S2: warm start. The S1 lesson is promoted; pre-run retrieval injects
    // it, the model succeeds first try, and the promoter credits the lesson.
    #[tokio::test]
    async fn test_warm_start_injects_lesson_and_credits_it() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());
        let lesson = seeded_lesson(
            "gridtool:keep requires word operator",
            "cli:gridtool",
            LessonStatus::Promoted,
        );
        let lesson_id = store.upsert(lesson).await.id;

        let good_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nKEEP amount gt 100\nSHOW"}),
        );
        let model = ScriptedModel::new([
            good_call,
            ScriptedStep::text("done"),
            judge_reply(true, 1.0),
        ]);

        let report = run_session(
            &config,
            request(2, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert!(report.metrics.passed);
        assert_eq!(report.metrics.v2_prerun_lesson_ids, vec![lesson_id.clone()]);
        assert_eq!(report.metrics.v2_lesson_activations, 1);
        assert!((report.metrics.fingerprint_recurrence_after - 0.0).abs() < 1e-9);

        // The injected lesson block is visible to the model with its id.
        assert!(model.requests()[0].system.contains(&lesson_id));

        let after = store.get(&lesson_id).unwrap();
        assert_eq!(after.helpful_count, 5, "pre-run activation must credit the lesson");
    }

    // On-error hints: the failing tool result carries the retrieved rule so
    // the model sees it on the next turn.
    #[tokio::test]
    async fn test_on_error_hint_is_appended_to_tool_result() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());
        store
            .upsert(seeded_lesson(
                "gridtool:keep requires word operator",
                "cli:gridtool",
                LessonStatus::Promoted,
            ))
            .await;

        let bad_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nKEEP amount > 100\nSHOW"}),
        );
        let good_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nKEEP amount gt 100\nSHOW"}),
        );
        let model = ScriptedModel::new([
            bad_call,
            good_call,
            ScriptedStep::text("done"),
            judge_reply(true, 1.0),
        ]);

        let report = run_session(
            &config,
            request(3, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        // Turn after the failure saw the hint block in the tool result.
        let requests = model.requests();
        assert!(
            requests[1].last_message.contains("--- HINT from prior sessions ---"),
            "hint missing from follow-up turn: {}",
            requests[1].last_message,
        );
        assert!(requests[1].last_message.contains("operators are words"));
        assert!(report.metrics.v2_lesson_activations >= 2, "pre-run + on-error");
    }

    // S5: three successive shape-invalid calls at one step. Two same-step
    // retries, then a capped event with a reflection turn and step advance.
    #[tokio::test]
    async fn test_validation_retry_cap_then_reflection() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());

        let invalid = || ScriptedStep::tool_call("run_gridtool", json!({"wrong_key": 1}));
        let model = ScriptedModel::new([
            invalid(),
            invalid(),
            invalid(),
            ScriptedStep::text("giving up"),
            judge_reply(false, 0.0),
            ScriptedStep::text("[]"), // critic: nothing durable
        ]);

        let report = run_session(
            &config,
            request(4, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.metrics.validation_retry_attempts, 2);
        assert_eq!(report.metrics.validation_retry_capped_events, 1);
        assert_eq!(report.metrics.reflection_turns, 1);
        // The reflection prompt reached the model on the turn after the cap.
        let requests = model.requests();
        assert!(requests
            .iter()
            .any(|seen| seen.last_message.contains("Reflection required")));
        // Step advanced past the capped step rather than looping forever.
        assert!(report.metrics.steps >= 2);
    }

    // Boundary 13: transport failure on the first turn.
    #[tokio::test]
    async fn test_transport_failure_on_first_turn() {
        let root = data_root();
        let config = test_config(root.clone());
        let store = LessonStore::in_memory(LearningConfig::default());
        let model = ScriptedModel::new([ScriptedStep::fail("api down", false)]);

        let report = run_session(
            &config,
            request(5, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert!(report.transport_failed);
        assert!(!report.metrics.passed);
        assert_eq!(report.metrics.end_reason, EndReason::Transport);
        assert!(matches!(report.metrics.eval_source, EvalSource::None));

        // Metrics and a header-only event log still exist on disk.
        let session_dir = root.join("sessions").join("session-005");
        assert!(session_dir.join("metrics.json").exists());
        let rows = read_events(&session_dir.join("events.jsonl"));
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0], EventRow::SessionStart { .. }));
    }

    // Boundary 11: zero prior lessons — no lessons block, session completes.
    #[tokio::test]
    async fn test_empty_store_omits_lessons_block() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());
        let model = ScriptedModel::new([ScriptedStep::text("nothing to do"), judge_reply(false, 0.5), ScriptedStep::text("[]")]);

        let report = run_session(
            &config,
            request(6, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert!(report.metrics.v2_prerun_lesson_ids.is_empty());
        assert!(!model.requests()[0].system.contains("Lessons from prior sessions"));
        assert!(model.requests()[0].system.contains("No prior lessons loaded."));
    }

    // Boundary 12: a store holding only suppressed lessons behaves like an
    // empty one (invariant 8).
    #[tokio::test]
    async fn test_suppressed_lessons_never_injected() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());
        store
            .upsert(seeded_lesson(
                "gridtool:keep requires word operator",
                "cli:gridtool",
                LessonStatus::Suppressed,
            ))
            .await;

        let bad_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nKEEP amount > 100\nSHOW"}),
        );
        let model = ScriptedModel::new([
            bad_call,
            ScriptedStep::text("stopping"),
            judge_reply(false, 0.0),
            ScriptedStep::text("[]"),
        ]);

        let report = run_session(
            &config,
            request(7, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert!(report.metrics.v2_prerun_lesson_ids.is_empty());
        assert_eq!(report.metrics.v2_lesson_activations, 0, "no on-error hints either");
    }

    // S4-flavored transfer: lessons learned on gridtool surface for fluxtool
    // through the capped transfer lane when the strict lane is empty.
    #[tokio::test]
    async fn test_transfer_lane_crosses_domains() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());
        let mut portable = Lesson::from_candidate(
            &CandidateLesson {
                trigger_fingerprints: vec!["gridtool:unknown function <str> use lowercase".into()],
                rule_text: "aggregation functions are lowercase: sum, count, avg".into(),
                scope_hint: Default::default(),
                tags: vec![],
            },
            1,
            "cli:gridtool",
            "agg-sales",
            vec!["function_case".into()],
            false,
            Utc::now(),
        );
        portable.status = LessonStatus::Promoted;
        portable.helpful_count = 4;
        store.upsert(portable).await;

        let bad_call = ScriptedStep::tool_call(
            "run_fluxtool",
            json!({"script": "IMPORT \"sales.csv\"\nGROUP region => total=SUM(amount)\nDISPLAY"}),
        );
        let good_call = ScriptedStep::tool_call(
            "run_fluxtool",
            json!({"script": "IMPORT \"sales.csv\"\nGROUP region => total=sum(amount)\nDISPLAY"}),
        );
        let model = ScriptedModel::new([
            bad_call,
            good_call,
            ScriptedStep::text("done"),
            judge_reply(true, 1.0),
        ]);

        let mut flux_request = request(8, "fluxtool");
        flux_request.task_text =
            Some("Aggregate sales.csv by region using fluxtool and display totals.".into());
        let report = run_session(
            &config,
            flux_request,
            &model,
            Box::new(crate::adapter::FluxtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert!(report.metrics.v2_transfer_lane_activations >= 1);
        let requests = model.requests();
        assert!(
            requests[1].last_message.contains("lowercase"),
            "transfer hint missing: {}",
            requests[1].last_message,
        );
        // No gridtool-specific syntax leaked into the injected hint.
        assert!(!requests[1].last_message.contains("TALLY"));
    }

    // S6: contract passes, judge disagrees. Verdict is uncertain and the
    // candidate stored from this session is blocked from promotion.
    #[tokio::test]
    async fn test_referee_disagreement_blocks_candidate_promotion() {
        let root = data_root();
        let config = test_config(root.clone());
        let store = LessonStore::in_memory(LearningConfig::default());

        let task_dir = root.join("tasks").join("agg-sales");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(
            task_dir.join("contract.json"),
            r#"{"predicates": [{"kind": "final_state_contains", "pattern": "north,320"}]}"#,
        )
        .unwrap();

        let bad_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nKEEP amount > 100\nSHOW"}),
        );
        let good_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nTALLY region -> total=sum(amount)\nSHOW"}),
        );
        let critic_reply = ScriptedStep::text(
            r#"[{"trigger_fingerprints":["gridtool:keep requires word operator"],
                 "rule_text":"WRONG symbol operators -> CORRECT word operators gt, lt, eq",
                 "scope_hint":"domain"}]"#,
        );
        let model = ScriptedModel::new([
            bad_call,
            good_call,
            ScriptedStep::text("done"),
            judge_reply(false, 0.1),
            critic_reply,
        ]);

        let report = run_session(
            &config,
            request(9, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.metrics.final_verdict, Verdict::Uncertain);
        assert!(report.metrics.eval_disagreement);
        assert!(!report.metrics.passed, "uncertain counts as fail");

        let stored = store.snapshot();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].promotion_blocked, "uncertain-session candidates cannot promote alone");
    }

    // S3 (store side): a poisoned candidate is rejected by the known-wrong
    // filter before it ever reaches the store.
    #[tokio::test]
    async fn test_poisoned_candidate_rejected_by_filter() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());

        let bad_call = ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "LOAD \"sales.csv\"\nTALLY region -> total=SUM(amount)\nSHOW"}),
        );
        let poisoned_critic = ScriptedStep::text(
            r#"[{"trigger_fingerprints":["gridtool:unknown function"],
                 "rule_text":"aggregation supports wildcard * so use sum(*) to total all columns",
                 "scope_hint":"domain"}]"#,
        );
        let model = ScriptedModel::new([
            bad_call,
            ScriptedStep::text("stopping"),
            judge_reply(false, 0.0),
            poisoned_critic,
        ]);

        let report = run_session(
            &config,
            request(10, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.metrics.critic_raw_candidates, 1);
        assert_eq!(report.metrics.critic_accepted_candidates, 0);
        assert!(report
            .metrics
            .critic_rejected_candidates
            .contains(&"known_wrong_pattern".to_owned()));
        assert!(store.is_empty(), "poisoned lesson must not reach the store");
    }

    // Cancellation: the loop stops at the next suspension point and no
    // candidate lessons are persisted, but metrics still land on disk.
    #[tokio::test]
    async fn test_cancellation_persists_no_candidates() {
        let root = data_root();
        let config = test_config(root.clone());
        let store = LessonStore::in_memory(LearningConfig::default());
        let (tx, rx) = watch::channel(true);
        drop(tx);

        let model = ScriptedModel::new([ScriptedStep::tool_call(
            "run_gridtool",
            json!({"script": "SHOW"}),
        )]);

        let report = run_session(
            &config,
            request(11, "gridtool"),
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            Some(rx),
        )
        .await
        .unwrap();

        assert_eq!(report.metrics.end_reason, EndReason::Cancelled);
        assert!(store.is_empty());
        assert!(root
            .join("sessions")
            .join("session-011")
            .join("metrics.json")
            .exists());
    }

    // Step budget: the loop terminates at max_steps with reason=budget.
    #[tokio::test]
    async fn test_step_budget_exhaustion() {
        let root = data_root();
        let config = test_config(root);
        let store = LessonStore::in_memory(LearningConfig::default());

        let steps: Vec<ScriptedStep> = (0..10)
            .map(|_| {
                ScriptedStep::tool_call(
                    "run_gridtool",
                    json!({"script": "LOAD \"sales.csv\"\nSHOW 1"}),
                )
            })
            .chain([judge_reply(false, 0.2), ScriptedStep::text("[]")])
            .collect();
        let model = ScriptedModel::new(steps);

        let mut capped = request(12, "gridtool");
        capped.max_steps = Some(3);
        let report = run_session(
            &config,
            capped,
            &model,
            Box::new(crate::adapter::GridtoolAdapter::new()),
            Arc::clone(&store),
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.metrics.end_reason, EndReason::Budget);
        assert_eq!(report.metrics.steps, 3);
    }

    // Determinism (property 9): identical task, store, and script produce
    // identical fingerprints and stored candidates.
    #[tokio::test]
    async fn test_deterministic_rerun_produces_identical_candidates() {
        let mut error_counts = Vec::new();
        let mut lesson_ids = Vec::new();
        for session_id in [21u64, 22u64] {
            let config = test_config(data_root());
            let store = LessonStore::in_memory(LearningConfig::default());
            let model = ScriptedModel::new([
                ScriptedStep::tool_call(
                    "run_gridtool",
                    json!({"script": "LOAD \"sales.csv\"\nKEEP amount > 100\nSHOW"}),
                ),
                ScriptedStep::text("stopping"),
                judge_reply(false, 0.0),
                ScriptedStep::text(
                    r#"[{"trigger_fingerprints":["gridtool:keep requires word operator"],
                         "rule_text":"WRONG symbol operators -> CORRECT word operators gt, lt, eq",
                         "scope_hint":"domain"}]"#,
                ),
            ]);
            let report = run_session(
                &config,
                request(session_id, "gridtool"),
                &model,
                Box::new(crate::adapter::GridtoolAdapter::new()),
                Arc::clone(&store),
                None,
            )
            .await
            .unwrap();
            let rows = store.snapshot();
            assert_eq!(rows.len(), 1);
            lesson_ids.push(rows[0].id.clone());
            error_counts.push(report.metrics.v2_error_events);
        }
        assert_eq!(lesson_ids[0], lesson_ids[1]);
        assert_eq!(error_counts[0], error_counts[1]);
    }
}
