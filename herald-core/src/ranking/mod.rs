//! Formula-driven leaderboard ranking.
//!
//! Two formula styles are supported. A whitelisted column list
//! (`referral_count DESC, username ASC`) that persistence can push down as an
//! `ORDER BY`, and an `expr:`-prefixed scoring expression evaluated per
//! participant in a small sandbox. Either way every candidate is scored before
//! the result is truncated, and equal scores are ordered by identity.

mod expr;
mod formula;
mod service;

pub use expr::{EvalError, Expr};
pub use formula::{
    ALLOWED_COLUMNS, ColumnFormula, ColumnKind, EXPRESSION_PREFIX, Formula,
    FormulaError, OrderTerm, SortDirection, validate_formula,
};
pub use service::LeaderboardService;

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use tracing::{debug, warn};

use crate::types::{LeaderboardEntry, MetricValue, RawMetricRow};

struct Scored {
    score: f64,
    row: RawMetricRow,
    variables: BTreeMap<String, MetricValue>,
}

/// Scores every row, sorts best first and keeps at most `limit` entries.
///
/// A participant whose expression fails to evaluate scores zero; the rest of
/// the ranking is unaffected.
pub fn rank(
    formula: &Formula,
    rows: Vec<RawMetricRow>,
    limit: usize,
) -> Vec<LeaderboardEntry> {
    let mut failures = 0usize;
    let mut scored: Vec<Scored> = rows
        .into_iter()
        .map(|row| {
            let variables = row.variables();
            let score = match formula {
                Formula::Columns(columns) => columns.score(&row),
                Formula::Expression(expr) => {
                    expr.evaluate(&variables).unwrap_or_else(|err| {
                        failures += 1;
                        debug!(
                            target: "herald::ranking",
                            identity = %row.identity,
                            error = %err,
                            "participant scored zero after evaluation failure"
                        );
                        0.0
                    })
                }
            };
            Scored {
                score,
                row,
                variables,
            }
        })
        .collect();

    if failures > 0 {
        warn!(
            target: "herald::ranking",
            failures,
            candidates = scored.len(),
            "ranking expression failed for some participants"
        );
    }

    match formula {
        Formula::Columns(columns) => scored.sort_by(|a, b| {
            columns
                .compare(&a.row, &b.row)
                .then_with(|| a.row.identity.cmp(&b.row.identity))
        }),
        Formula::Expression(_) => scored.sort_by(|a, b| {
            OrderedFloat(b.score)
                .cmp(&OrderedFloat(a.score))
                .then_with(|| a.row.identity.cmp(&b.row.identity))
        }),
    }

    scored.truncate(limit);
    scored
        .into_iter()
        .enumerate()
        .map(|(position, entry)| LeaderboardEntry {
            identity: entry.row.identity,
            variables: entry.variables,
            score: entry.score,
            rank: u32::try_from(position + 1).unwrap_or(u32::MAX),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str, referrals: i64) -> RawMetricRow {
        RawMetricRow::new(name)
            .with_column("username", name)
            .with_column("referral_count", referrals)
    }

    #[test]
    fn equal_scores_break_ties_by_identity() {
        let formula = Formula::compile("referral_count DESC, username ASC").expect("valid");
        let rows = vec![participant("bob", 5), participant("carol", 2), participant("alice", 5)];
        let ranked = rank(&formula, rows, 10);
        let names: Vec<_> = ranked.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        assert_eq!(ranked[2].rank, 3);
        assert_eq!(ranked[0].score, 5.0);
    }

    #[test]
    fn scoring_happens_before_truncation() {
        let formula = Formula::compile("expr: referral_count").expect("valid");
        let rows = (0..50).map(|i| participant(&format!("p{i:02}"), i)).collect();
        let ranked = rank(&formula, rows, 3);
        let names: Vec<_> = ranked.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(names, ["p49", "p48", "p47"]);
    }

    #[test]
    fn failed_evaluation_scores_zero() {
        let formula = Formula::compile("expr: bonus * 2").expect("valid");
        let mut lucky = participant("lucky", 1);
        lucky.columns.insert("bonus".into(), MetricValue::Number(10.0));
        let ranked = rank(&formula, vec![participant("plain", 100), lucky], 10);
        assert_eq!(ranked[0].identity, "lucky");
        assert_eq!(ranked[0].score, 20.0);
        assert_eq!(ranked[1].score, 0.0);
    }

    #[test]
    fn ascending_text_lead() {
        let formula = Formula::compile("username ASC").expect("valid");
        let rows = vec![participant("zed", 9), participant("amy", 1)];
        let ranked = rank(&formula, rows, 10);
        assert_eq!(ranked[0].identity, "amy");
        assert!(ranked.iter().all(|entry| entry.score == 0.0));
    }
}
