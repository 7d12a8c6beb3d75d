//! One-session CLI runner.
//!
//! Usage: `lorebot <task_id> <domain> <session_id> [--task TEXT] [--max-steps N]`
//!
//! Configuration (models, credentials, budgets, learning mode, transfer
//! policy) comes from the environment; see `config.rs`. Writes the session's
//! event log and metrics under the data root and exits non-zero only on
//! fatal model-transport failure.

use lorebot::adapter::resolve_adapter;
use lorebot::config::ModelBackend;
use lorebot::learning::{LearningConfig, LessonStore};
use lorebot::llm::{
    AnthropicClient, ModelClient, ModelTurn, SubprocessClient, TransportError, TurnRequest,
};
use lorebot::session::runner::{run_session, SessionRequest};
use lorebot::{AgentError, BotConfig};

use std::process::ExitCode;

/// The configured transport, unified behind the Model SPI.
enum Transport {
    Anthropic(AnthropicClient),
    Subprocess(SubprocessClient),
}

impl ModelClient for Transport {
    async fn turn(&self, request: TurnRequest<'_>) -> Result<ModelTurn, TransportError> {
        match self {
            Self::Anthropic(client) => client.turn(request).await,
            Self::Subprocess(client) => client.turn(request).await,
        }
    }
}

struct CliArgs {
    task_id: String,
    domain: String,
    session_id: u64,
    task_text: Option<String>,
    max_steps: Option<u32>,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut task_text = None;
    let mut max_steps = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--task" => {
                task_text = Some(args.next().ok_or("--task requires a value")?);
            }
            "--max-steps" => {
                let raw = args.next().ok_or("--max-steps requires a value")?;
                max_steps = Some(raw.parse().map_err(|_| format!("bad --max-steps: {raw}"))?);
            }
            flag if flag.starts_with("--") => {
                return Err(format!("unknown flag: {flag}"));
            }
            value => positional.push(value.to_owned()),
        }
    }

    if positional.len() != 3 {
        return Err("usage: lorebot <task_id> <domain> <session_id> [--task TEXT] [--max-steps N]".into());
    }
    let session_id = positional[2]
        .parse()
        .map_err(|_| format!("bad session id: {}", positional[2]))?;

    Ok(CliArgs {
        task_id: positional[0].clone(),
        domain: positional[1].clone(),
        session_id,
        task_text,
        max_steps,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lorebot=info")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    let config = match BotConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(2);
        }
    };

    let adapter = match resolve_adapter(&args.domain) {
        Ok(adapter) => adapter,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(2);
        }
    };

    let transport = match config.backend {
        ModelBackend::Anthropic => Transport::Anthropic(AnthropicClient::new(&config.api_key)),
        ModelBackend::Subprocess => {
            Transport::Subprocess(SubprocessClient::new("claude", config.subprocess_timeout))
        }
    };

    // A store that cannot open degrades to memory-only: the session still
    // runs and learns locally, it just cannot persist across processes.
    let learning_dir = config.data_root.join("learning");
    let store = match std::fs::create_dir_all(&learning_dir) {
        Ok(()) => {
            match LessonStore::connect(&learning_dir.join("lessons.db"), LearningConfig::default())
                .await
            {
                Ok(store) => store,
                Err(error) => {
                    tracing::warn!(%error, "lesson store unavailable; running in-memory");
                    LessonStore::in_memory(LearningConfig::default())
                }
            }
        }
        Err(error) => {
            tracing::warn!(%error, "learning dir unavailable; running in-memory");
            LessonStore::in_memory(LearningConfig::default())
        }
    };

    let request = SessionRequest {
        session_id: args.session_id,
        task_id: args.task_id,
        task_text: args.task_text,
        domain: args.domain,
        max_steps: args.max_steps,
    };

    match run_session(&config, request, &transport, adapter, store, None).await {
        Ok(report) => {
            tracing::info!(
                session_id = report.metrics.session_id,
                verdict = %report.metrics.final_verdict,
                score = report.metrics.score,
                steps = report.metrics.steps,
                "session complete"
            );
            if report.transport_failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(AgentError::Transport(message)) => {
            eprintln!("transport failure: {message}");
            ExitCode::FAILURE
        }
        Err(error) => {
            eprintln!("session setup failure: {error}");
            ExitCode::from(2)
        }
    }
}
