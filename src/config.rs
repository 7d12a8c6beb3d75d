//! Runtime configuration from the environment.
//!
//! The CLI contract keeps configuration out of argv: model identifiers,
//! credentials, budgets, and learning modes all come from environment
//! variables so benchmark harnesses can vary them per-run without touching
//! the command line.

use crate::error::AgentError;

use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;

/// Which model backend serves executor/critic/judge turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelBackend {
    /// HTTP messages API.
    Anthropic,
    /// Local CLI subprocess (`claude -p` style).
    Subprocess,
}

/// Critic prompt path. Legacy may carry domain exemplars; strict is
/// schema-only and leans on the knowledge provider for domain context; auto
/// picks strict whenever the adapter exposes a docs manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    Strict,
    Legacy,
    Auto,
}

/// Cross-domain retrieval policy for the transfer lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPolicy {
    /// Transfer lane disabled.
    Off,
    /// Transfer fires only when the strict lane returns no high-confidence hit.
    Auto,
    /// Both lanes fire unconditionally.
    Always,
}

impl std::fmt::Display for TransferPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Auto => write!(f, "auto"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Full runtime configuration for one process.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub api_key: String,
    pub backend: ModelBackend,
    pub model_executor: String,
    pub model_critic: String,
    /// Judge defaults to one tier above the executor when unset.
    pub model_judge: String,
    /// Root directory for lessons.db, tasks/, and sessions/.
    pub data_root: PathBuf,
    pub learning_mode: LearningMode,
    pub transfer_policy: TransferPolicy,
    pub max_steps: u32,
    pub wall_clock_budget: Duration,
    pub subprocess_timeout: Duration,
}

const DEFAULT_EXECUTOR_MODEL: &str = "claude-haiku-4-5";
const SONNET_MODEL: &str = "claude-sonnet-4-5";
const OPUS_MODEL: &str = "claude-opus-4-6";

/// Judge model one tier above the executor. Opus judges itself.
pub fn default_judge_model(executor_model: &str) -> &'static str {
    let lowered = executor_model.to_lowercase();
    if lowered.contains("opus") || lowered.contains("sonnet") {
        OPUS_MODEL
    } else {
        SONNET_MODEL
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_trimmed(name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl BotConfig {
    /// Load configuration from the environment.
    ///
    /// `ANTHROPIC_API_KEY` is required only for the `anthropic` backend; the
    /// subprocess backend carries its own credentials.
    pub fn from_env() -> crate::error::Result<Self> {
        let backend = match env_trimmed("LOREBOT_BACKEND").as_deref() {
            None | Some("anthropic") => ModelBackend::Anthropic,
            Some("subprocess") => ModelBackend::Subprocess,
            Some(other) => {
                return Err(AgentError::Setup(format!(
                    "unsupported LOREBOT_BACKEND: {other:?} (expected anthropic or subprocess)"
                )))
            }
        };

        let api_key = env_trimmed("ANTHROPIC_API_KEY").unwrap_or_default();
        if backend == ModelBackend::Anthropic && api_key.is_empty() {
            return Err(AgentError::Setup(
                "ANTHROPIC_API_KEY is required when LOREBOT_BACKEND=anthropic".into(),
            ));
        }

        let model_executor =
            env_trimmed("LOREBOT_MODEL_EXECUTOR").unwrap_or_else(|| DEFAULT_EXECUTOR_MODEL.into());
        let model_critic =
            env_trimmed("LOREBOT_MODEL_CRITIC").unwrap_or_else(|| model_executor.clone());
        let model_judge = env_trimmed("LOREBOT_MODEL_JUDGE")
            .unwrap_or_else(|| default_judge_model(&model_executor).into());

        let learning_mode = match env_trimmed("LOREBOT_LEARNING_MODE").as_deref() {
            None | Some("legacy") => LearningMode::Legacy,
            Some("strict") => LearningMode::Strict,
            Some("auto") => LearningMode::Auto,
            Some(other) => {
                return Err(AgentError::Setup(format!(
                    "unknown LOREBOT_LEARNING_MODE: {other:?} (expected strict, legacy, or auto)"
                )))
            }
        };

        let transfer_policy = match env_trimmed("LOREBOT_TRANSFER_POLICY").as_deref() {
            Some("off") => TransferPolicy::Off,
            None | Some("auto") => TransferPolicy::Auto,
            Some("always") => TransferPolicy::Always,
            Some(other) => {
                return Err(AgentError::Setup(format!(
                    "unknown LOREBOT_TRANSFER_POLICY: {other:?} (expected off, auto, or always)"
                )))
            }
        };

        Ok(Self {
            api_key,
            backend,
            model_executor,
            model_critic,
            model_judge,
            data_root: PathBuf::from(
                env_trimmed("LOREBOT_DATA_ROOT").unwrap_or_else(|| "data".into()),
            ),
            learning_mode,
            transfer_policy,
            max_steps: env_u64("LOREBOT_MAX_STEPS", 12) as u32,
            wall_clock_budget: Duration::from_secs(env_u64("LOREBOT_WALL_CLOCK_SECS", 600)),
            subprocess_timeout: Duration::from_secs(env_u64("LOREBOT_SUBPROCESS_TIMEOUT_SECS", 90)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_judge_model_tiers() {
        assert_eq!(default_judge_model("claude-haiku-4-5"), SONNET_MODEL);
        assert_eq!(default_judge_model("claude-sonnet-4-5"), OPUS_MODEL);
        assert_eq!(default_judge_model("claude-opus-4-6"), OPUS_MODEL);
    }
}
