//! Failure fingerprinting and tag extraction.
//!
//! Turns noisy, tool-specific failure output into a compact stable key so
//! recurrence across runs is detectable. Normalization collapses volatile
//! literals (paths, quoted strings, hex/uuid blobs, multi-digit integers,
//! timestamps) into placeholders while preserving the structural failure
//! vocabulary that lessons trigger on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Which signal channel produced a failure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorChannel {
    /// Tool returned an explicit error.
    HardFailure,
    /// A declared constraint or invariant was violated.
    ConstraintFailure,
    /// Same fingerprint repeated within one run with no state change.
    NoProgress,
    /// Failure late in the run, against the step budget.
    EfficiencyRegression,
}

impl std::fmt::Display for ErrorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardFailure => write!(f, "hard_failure"),
            Self::ConstraintFailure => write!(f, "constraint_failure"),
            Self::NoProgress => write!(f, "no_progress"),
            Self::EfficiencyRegression => write!(f, "efficiency_regression"),
        }
    }
}

/// One failure observation, written to the session event log and fed to
/// on-error retrieval. Write-once, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub session_id: u64,
    pub step_index: u32,
    pub channel: ErrorChannel,
    pub tool_name: String,
    pub action_payload: serde_json::Value,
    /// May be empty for non-hard-failure signals.
    pub error_text: String,
    pub fingerprint: String,
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

static UUID_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}\b",
    )
    .expect("hardcoded regex")
});
static HEX_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?i)\b0x[0-9a-f]+\b").expect("hardcoded regex"));
static TIMESTAMP_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}\S*").expect("hardcoded regex")
});
static QUOTED_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#"'[^'\n]*'|"[^"\n]*""#).expect("hardcoded regex"));
static PATH_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?:[a-zA-Z]:\\\S+|(?:~|/)\S+)").expect("hardcoded regex")
});
static LINE_COL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(?:line|column|col|row)\s+\d+\b").expect("hardcoded regex")
});
static NUMBER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\b\d{2,}(?:\.\d+)?\b").expect("hardcoded regex"));
static NON_TOKEN_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"[^a-z0-9_<>\s]+").expect("hardcoded regex"));
static WS_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\s+").expect("hardcoded regex"));
// Generic error preambles carry no signal; the residual should lead with the
// failure vocabulary lessons actually trigger on.
static ERROR_PREAMBLE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)^\s*error(?:\s+at\s+line\s+\d+)?\s*:\s*").expect("hardcoded regex")
});

const FINGERPRINT_STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "by", "for", "from", "in", "into", "of", "on", "the", "to", "with",
];

const MAX_FINGERPRINT_CHARS: usize = 120;

/// Replace runtime-specific substrings with stable placeholders, then
/// collapse to lowercase stopword-free tokens.
fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = UUID_RE.replace_all(&lowered, "<uuid>");
    let stripped = HEX_RE.replace_all(&stripped, "<hex>");
    let stripped = TIMESTAMP_RE.replace_all(&stripped, "<ts>");
    let stripped = QUOTED_RE.replace_all(&stripped, "<str>");
    let stripped = PATH_RE.replace_all(&stripped, "<path>");
    let stripped = LINE_COL_RE.replace_all(&stripped, "<loc>");
    let stripped = NUMBER_RE.replace_all(&stripped, "<num>");
    let stripped = NON_TOKEN_RE.replace_all(&stripped, " ");
    let collapsed = WS_RE.replace_all(&stripped, " ");

    // Drop stopwords and adjacent duplicate tokens so repeated noise does not
    // change the key while token order stays signal-bearing.
    let mut tokens: Vec<&str> = Vec::new();
    for token in collapsed.trim().split(' ') {
        if token.is_empty() || FINGERPRINT_STOPWORDS.contains(&token) {
            continue;
        }
        if tokens.last() != Some(&token) {
            tokens.push(token);
        }
    }
    tokens.join(" ")
}

/// Public helper: normalized residual of an error payload.
pub fn normalize_error(text: &str) -> String {
    normalize_text(text)
}

fn short_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..4])
}

/// Sorted top-level key list of an action payload, e.g. `{script}`.
fn action_shape(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::Object(map) => {
            let keys: BTreeSet<&str> = map.keys().map(String::as_str).collect();
            let joined: Vec<&str> = keys.into_iter().collect();
            format!("{{{}}}", joined.join(","))
        }
        serde_json::Value::Null => "{}".into(),
        other => format!("<{}>", value_kind(other)),
    }
}

fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Build a stable fingerprint for a failed tool call.
///
/// Never fails: malformed or empty input degrades to `<family>:unspecified`.
/// When `error_text` is empty (silent channels like no-progress), the key is
/// derived from state hashes and the action shape instead of error tokens.
pub fn build_fingerprint(
    tool_family: &str,
    error_text: &str,
    action_payload: &serde_json::Value,
    state_signature: Option<(&str, &str, &str)>,
) -> String {
    let family = normalize_text(tool_family).replace(' ', "_");
    let family = if family.is_empty() { "unknown".into() } else { family };

    let residual = normalize_text(&ERROR_PREAMBLE_RE.replace(error_text, ""));
    if residual.is_empty() {
        if let Some((before, after, reason)) = state_signature {
            return format!(
                "{family}:nop|{}|{}|{}|{}",
                short_hash(before),
                action_shape(action_payload),
                short_hash(after),
                normalize_text(reason).replace(' ', "_"),
            );
        }
        return format!("{family}:unspecified");
    }

    let mut fingerprint = format!("{family}:{residual}");
    if fingerprint.len() > MAX_FINGERPRINT_CHARS {
        fingerprint.truncate(MAX_FINGERPRINT_CHARS);
        // Avoid splitting a token mid-way so prefix matching stays meaningful.
        if let Some(cut) = fingerprint.rfind(' ') {
            fingerprint.truncate(cut);
        }
    }
    fingerprint
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

static TAG_PATTERNS: LazyLock<Vec<(&'static str, regex::Regex)>> = LazyLock::new(|| {
    let table: &[(&str, &str)] = &[
        ("surface_cli", r"(?i)\b(?:cli|usage:|exit code|stderr|stdout)\b"),
        ("surface_http", r"(?i)\b(?:http\s*\d{3}|status\s*\d{3}|https?://|request)\b"),
        (
            "syntax_structure",
            r"(?i)(?:\bsyntax error\b|\bparse error\b|\binvalid syntax\b|\bunexpected token\b|\bunexpected text\b|\busage:\b|\bunknown command\b|\binvalid format\b)",
        ),
        ("unknown_symbol", r"(?i)\b(?:unknown (?:function|column|symbol)|undefined|not recognized)\b"),
        ("not_found", r"(?i)\b(?:not found|no such file|does not exist|missing)\b"),
        ("path_quote", r"(?i)\b(?:must be quoted|quoted path|unquoted|double quotes)\b"),
        ("operator_mismatch", r"(?i)\b(?:word operator|unknown operator|invalid operator|operators? (?:must|are))\b"),
        ("function_case", r"(?i)\b(?:lowercase|uppercase|case.sensitive)\b"),
        ("sort_direction", r"(?i)\b(?:asc|desc|direction must|up|down)\b.*\bdirection\b|\bdirection\b.*\b(?:asc|desc|up|down)\b"),
        ("arity_mismatch", r"(?i)\b(?:wrong number|expects \d|requires (?:a )?column, operator)\b"),
        ("constraint_failed", r"(?i)\b(?:constraint|violation|invariant|duplicate key|not null|foreign key|unique)\b"),
        ("timeout", r"(?i)\b(?:timeout|timed out|deadline exceeded)\b"),
        ("permission", r"(?i)\b(?:permission denied|access denied|operation not permitted)\b"),
        ("auth", r"(?i)\b(?:unauthorized|forbidden|authentication|invalid token|expired token)\b"),
        ("rate_limited", r"(?i)\b(?:rate limit|too many requests|quota exceeded|429)\b"),
        ("network", r"(?i)\b(?:connection reset|connection refused|host unreachable|dns|socket)\b"),
        ("resource", r"(?i)\b(?:out of memory|oom|resource exhausted|disk full|no space left)\b"),
        ("retryable", r"(?i)\b(?:retry|try again|temporarily unavailable|deadlock)\b"),
        ("no_progress", r"(?i)\b(?:no.progress|stuck|stall)\b"),
        ("efficiency_signal", r"(?i)\b(?:latency|slow|token budget|step budget|efficiency)\b"),
        ("command_not_found", r"(?i)\b(?:unknown command|command not found|did you mean)\b"),
    ];
    table
        .iter()
        .map(|(tag, pattern)| (*tag, regex::Regex::new(pattern).expect("hardcoded regex")))
        .collect()
});

/// Extract generic tags from failure context using the fixed vocabulary.
///
/// Tags are hints only: retrieval must tolerate an empty set, so an
/// unmatchable error yields `uncategorized` rather than failing.
pub fn extract_tags(error_text: &str, action_payload: &serde_json::Value) -> Vec<String> {
    let haystack = format!("{error_text} {}", action_payload);
    let mut tags: BTreeSet<String> = BTreeSet::new();
    for (tag, pattern) in TAG_PATTERNS.iter() {
        if pattern.is_match(&haystack) {
            tags.insert((*tag).to_owned());
        }
    }
    static CLIENT_ERR_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?i)\b(?:http|status)\s*4\d\d\b").expect("hardcoded regex")
    });
    static SERVER_ERR_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?i)\b(?:http|status)\s*5\d\d\b").expect("hardcoded regex")
    });
    if CLIENT_ERR_RE.is_match(&haystack) {
        tags.insert("client_error".into());
    }
    if SERVER_ERR_RE.is_match(&haystack) {
        tags.insert("server_error".into());
    }
    if tags.is_empty() {
        return vec!["uncategorized".into()];
    }
    tags.into_iter().collect()
}

impl ErrorEvent {
    /// Capture one hard failure into a fully-populated event.
    pub fn capture(
        session_id: u64,
        step_index: u32,
        channel: ErrorChannel,
        tool_family: &str,
        tool_name: &str,
        action_payload: serde_json::Value,
        error_text: &str,
    ) -> Self {
        let fingerprint = build_fingerprint(tool_family, error_text, &action_payload, None);
        let tags = extract_tags(error_text, &action_payload);
        Self {
            session_id,
            step_index,
            channel,
            tool_name: tool_name.to_owned(),
            action_payload,
            error_text: error_text.to_owned(),
            fingerprint,
            tags,
        }
    }
}
