//! Session orchestration: the per-run step loop and its artifacts.

pub mod events;
pub mod metrics;
pub mod prompt;
pub mod runner;
pub mod validation;

pub use events::{ensure_session, EventLog, EventRow, SessionPaths};
pub use metrics::SessionMetrics;
pub use runner::{run_session, SessionReport, SessionRequest};

/// Why a session terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Model produced a turn with no tool call.
    ModelStopped,
    /// Step budget exhausted.
    Budget,
    /// Wall-clock budget exhausted.
    WallClock,
    /// External cancel signal observed.
    Cancelled,
    /// Model transport failed after bounded retries.
    Transport,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelStopped => write!(f, "model_stopped"),
            Self::Budget => write!(f, "budget"),
            Self::WallClock => write!(f, "wall_clock"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Transport => write!(f, "transport"),
        }
    }
}
