//! Dual-authority session evaluation.
//!
//! A task may declare a deterministic contract (ordered predicates over the
//! final observable state); an LLM judge independently scores the same
//! evidence. The combination table is strict: agreement decides, and
//! disagreement yields `uncertain`, which downstream promotion treats as
//! failure so lessons from contested sessions cannot promote on their own.

pub mod contract;
pub mod judge;

pub use contract::{Contract, ContractResult, Predicate};
pub use judge::{JudgeVerdict, LlmJudge};

use crate::learning::critic::TraceStep;
use crate::llm::ModelClient;

use serde::{Deserialize, Serialize};

/// Final session verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// Authorities disagreed. Treated as fail for promotion purposes.
    Uncertain,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Uncertain => write!(f, "uncertain"),
        }
    }
}

/// Which authority produced the final verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalSource {
    Contract,
    JudgePrimary,
    JudgeFallback,
    None,
}

/// Full referee output with both authorities' raw signals kept for metrics.
#[derive(Debug, Clone)]
pub struct RefereeOutcome {
    pub verdict: Verdict,
    pub score: f64,
    pub eval_source: EvalSource,
    pub reasons: Vec<String>,
    pub contract_passed: Option<bool>,
    pub judge_passed: Option<bool>,
    pub disagreement: bool,
}

impl RefereeOutcome {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Uncertain counts as fail wherever a boolean is needed.
    pub fn passed_for_promotion(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Referee over an optional contract and an optional judge.
#[derive(Debug, Clone)]
pub struct Referee {
    contract: Option<Contract>,
    judge: Option<LlmJudge>,
}

impl Referee {
    pub fn new(contract: Option<Contract>, judge: Option<LlmJudge>) -> Self {
        Self { contract, judge }
    }

    pub fn has_contract(&self) -> bool {
        self.contract.is_some()
    }

    /// Evaluate a finished session.
    ///
    /// Judge transport/parse failures fall back to the contract-only verdict
    /// when a contract exists, otherwise the session is `uncertain`.
    pub async fn evaluate<M: ModelClient>(
        &self,
        client: Option<&M>,
        task_text: &str,
        trace_tail: &[TraceStep],
        final_state: &str,
    ) -> RefereeOutcome {
        let contract_result = self
            .contract
            .as_ref()
            .map(|contract| contract.evaluate(final_state));

        let judge_result = match (&self.judge, client) {
            (Some(judge), Some(client)) => {
                match judge.judge(client, task_text, trace_tail, final_state).await {
                    Ok(verdict) => Some(verdict),
                    Err(error) => {
                        tracing::warn!(%error, "judge call failed; falling back");
                        None
                    }
                }
            }
            _ => None,
        };

        combine(contract_result, judge_result)
    }
}

/// The verdict combination table.
fn combine(
    contract: Option<ContractResult>,
    judge: Option<JudgeVerdict>,
) -> RefereeOutcome {
    match (contract, judge) {
        (Some(contract), Some(judge)) => {
            let mut reasons = contract.evidence.clone();
            reasons.extend(judge.reasons.iter().map(|reason| format!("judge:{reason}")));
            if contract.passed == judge.passed {
                RefereeOutcome {
                    verdict: if contract.passed { Verdict::Pass } else { Verdict::Fail },
                    score: (contract.score + judge.score) / 2.0,
                    eval_source: EvalSource::Contract,
                    reasons,
                    contract_passed: Some(contract.passed),
                    judge_passed: Some(judge.passed),
                    disagreement: false,
                }
            } else {
                reasons.push("authority_disagreement".into());
                RefereeOutcome {
                    verdict: Verdict::Uncertain,
                    score: contract.score.min(judge.score),
                    eval_source: EvalSource::JudgeFallback,
                    reasons,
                    contract_passed: Some(contract.passed),
                    judge_passed: Some(judge.passed),
                    disagreement: true,
                }
            }
        }
        (Some(contract), None) => RefereeOutcome {
            verdict: if contract.passed { Verdict::Pass } else { Verdict::Fail },
            score: contract.score,
            eval_source: EvalSource::Contract,
            reasons: contract.evidence.clone(),
            contract_passed: Some(contract.passed),
            judge_passed: None,
            disagreement: false,
        },
        (None, Some(judge)) => RefereeOutcome {
            verdict: if judge.passed { Verdict::Pass } else { Verdict::Fail },
            score: judge.score,
            eval_source: EvalSource::JudgePrimary,
            reasons: judge.reasons.clone(),
            contract_passed: None,
            judge_passed: Some(judge.passed),
            disagreement: false,
        },
        (None, None) => RefereeOutcome {
            verdict: Verdict::Uncertain,
            score: 0.0,
            eval_source: EvalSource::None,
            reasons: vec!["no_evaluation_authority".into()],
            contract_passed: None,
            judge_passed: None,
            disagreement: false,
        },
    }
}
