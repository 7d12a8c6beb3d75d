//! Declarative task contracts for the deterministic evaluator.
//!
//! A contract is an ordered predicate list over the session's final
//! observable state. Evaluation short-circuits on the first failure and
//! records evidence for every predicate it ran. A predicate that cannot be
//! evaluated (bad regex) counts as failed with the error as evidence.

use serde::{Deserialize, Serialize};

use std::path::Path;

/// One declarative check against the final state text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Final state contains the literal substring.
    FinalStateContains { pattern: String },
    /// Final state does not contain the literal substring.
    FinalStateNotContains { pattern: String },
    /// Final state matches the regex.
    FinalStateMatches { regex: String },
    /// Final state has at least this many non-empty lines.
    LineCountGte { count: usize },
}

/// Ordered predicate set for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub predicates: Vec<Predicate>,
}

/// Deterministic evaluation result with per-predicate evidence.
#[derive(Debug, Clone)]
pub struct ContractResult {
    pub passed: bool,
    /// Fraction of predicates that held; unevaluated predicates count
    /// against the score.
    pub score: f64,
    pub evidence: Vec<String>,
}

impl Contract {
    /// Load `contract.json` for a task, if present.
    pub fn load(task_dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = task_dir.join("contract.json");
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let contract: Self = serde_json::from_str(&text)
            .map_err(|error| anyhow::anyhow!("invalid contract {}: {error}", path.display()))?;
        Ok(Some(contract))
    }

    /// Evaluate predicates in declared order; first failure short-circuits.
    pub fn evaluate(&self, final_state: &str) -> ContractResult {
        let total = self.predicates.len().max(1);
        let mut evidence = Vec::new();
        let mut held = 0usize;

        for (index, predicate) in self.predicates.iter().enumerate() {
            match predicate.check(final_state) {
                Ok(true) => {
                    held += 1;
                    evidence.push(format!("predicate {} held: {}", index + 1, predicate.describe()));
                }
                Ok(false) => {
                    evidence.push(format!(
                        "predicate {} failed: {}",
                        index + 1,
                        predicate.describe()
                    ));
                    return ContractResult {
                        passed: false,
                        score: held as f64 / total as f64,
                        evidence,
                    };
                }
                Err(error) => {
                    evidence.push(format!("predicate {} error: {error}", index + 1));
                    return ContractResult {
                        passed: false,
                        score: held as f64 / total as f64,
                        evidence,
                    };
                }
            }
        }

        ContractResult {
            passed: true,
            score: 1.0,
            evidence,
        }
    }
}

impl Predicate {
    fn check(&self, final_state: &str) -> anyhow::Result<bool> {
        match self {
            Self::FinalStateContains { pattern } => Ok(final_state.contains(pattern)),
            Self::FinalStateNotContains { pattern } => Ok(!final_state.contains(pattern)),
            Self::FinalStateMatches { regex } => {
                let compiled = regex::Regex::new(regex)
                    .map_err(|error| anyhow::anyhow!("bad regex {regex:?}: {error}"))?;
                Ok(compiled.is_match(final_state))
            }
            Self::LineCountGte { count } => {
                Ok(final_state.lines().filter(|line| !line.trim().is_empty()).count() >= *count)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::FinalStateContains { pattern } => format!("final state contains {pattern:?}"),
            Self::FinalStateNotContains { pattern } => {
                format!("final state does not contain {pattern:?}")
            }
            Self::FinalStateMatches { regex } => format!("final state matches /{regex}/"),
            Self::LineCountGte { count } => format!("final state has >= {count} lines"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(json: &str) -> Contract {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_all_predicates_hold() {
        let contract = contract(
            r#"{"predicates": [
                {"kind": "final_state_contains", "pattern": "north,320"},
                {"kind": "line_count_gte", "count": 2}
            ]}"#,
        );
        let result = contract.evaluate("region,total\nnorth,320\nsouth,240\n");
        assert!(result.passed);
        assert!((result.score - 1.0).abs() < 1e-9);
        assert_eq!(result.evidence.len(), 2);
    }

    #[test]
    fn test_first_failure_short_circuits() {
        let contract = contract(
            r#"{"predicates": [
                {"kind": "final_state_contains", "pattern": "missing"},
                {"kind": "line_count_gte", "count": 1}
            ]}"#,
        );
        let result = contract.evaluate("region,total\nnorth,320\n");
        assert!(!result.passed);
        assert_eq!(result.evidence.len(), 1, "later predicates must not run");
        assert!(result.evidence[0].contains("failed"));
        assert!((result.score - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_regex_predicate_and_error_handling() {
        let matching = contract(
            r#"{"predicates": [{"kind": "final_state_matches", "regex": "north,\\d+"}]}"#,
        );
        assert!(matching.evaluate("north,320").passed);

        let broken = contract(
            r#"{"predicates": [{"kind": "final_state_matches", "regex": "["}]}"#,
        );
        let result = broken.evaluate("anything");
        assert!(!result.passed);
        assert!(result.evidence[0].contains("error"));
    }

    #[test]
    fn test_load_missing_contract_is_none() {
        let dir = std::env::temp_dir().join(format!("lorebot_test_contract_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(Contract::load(&dir).unwrap().is_none());

        std::fs::write(
            dir.join("contract.json"),
            r#"{"predicates": [{"kind": "final_state_contains", "pattern": "x"}]}"#,
        )
        .unwrap();
        assert!(Contract::load(&dir).unwrap().is_some());
    }
}
