use std::{cmp::Ordering, fmt};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::expr::Expr;
use crate::types::{MetricValue, RawMetricRow};

static ORDER_TERM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z0-9_]+)(?:\s+(ASC|DESC))?$")
        .expect("order term regex should compile")
});

/// Prefix that selects the expression style.
pub const EXPRESSION_PREFIX: &str = "expr:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Text,
}

/// Columns a formula may reference. The validated clause is embedded
/// verbatim into generated SQL, so this list is the injection boundary.
pub const ALLOWED_COLUMNS: [(&str, ColumnKind); 2] = [
    ("referral_count", ColumnKind::Numeric),
    ("username", ColumnKind::Text),
];

fn column_kind(name: &str) -> Option<ColumnKind> {
    ALLOWED_COLUMNS
        .iter()
        .find(|(column, _)| *column == name)
        .map(|(_, kind)| *kind)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("empty ranking formula")]
    Empty,

    #[error("invalid ranking formula syntax: {0}")]
    InvalidSyntax(String),

    #[error("column {0} not allowed in ranking formula")]
    ColumnNotAllowed(String),

    #[error("expression error at {position}: {message}")]
    Expression { position: usize, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub direction: SortDirection,
    kind: ColumnKind,
}

impl OrderTerm {
    pub fn kind(&self) -> ColumnKind {
        self.kind
    }
}

/// Whitelisted `column [ASC|DESC], ...` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFormula {
    terms: Vec<OrderTerm>,
}

impl ColumnFormula {
    pub fn parse(raw: &str) -> Result<Self, FormulaError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FormulaError::Empty);
        }

        let mut terms = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            let captures = ORDER_TERM_PATTERN
                .captures(part)
                .ok_or_else(|| FormulaError::InvalidSyntax(part.to_string()))?;

            let column = captures
                .get(1)
                .map(|m| m.as_str())
                .ok_or_else(|| FormulaError::InvalidSyntax(part.to_string()))?;
            let kind = column_kind(column)
                .ok_or_else(|| FormulaError::ColumnNotAllowed(column.to_string()))?;
            let direction = match captures.get(2).map(|m| m.as_str()) {
                Some("ASC") => SortDirection::Asc,
                _ => SortDirection::Desc,
            };

            terms.push(OrderTerm {
                column: column.to_string(),
                direction,
                kind,
            });
        }

        Ok(Self { terms })
    }

    pub fn terms(&self) -> &[OrderTerm] {
        &self.terms
    }

    /// SQL `ORDER BY` body, e.g. `referral_count DESC, username ASC`.
    pub fn order_by_clause(&self) -> String {
        self.terms
            .iter()
            .map(|term| format!("{} {}", term.column, term.direction.as_sql()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Score projection of the leading term. Higher is better in both
    /// directions; text columns score zero.
    pub fn score(&self, row: &RawMetricRow) -> f64 {
        let Some(lead) = self.terms.first() else {
            return 0.0;
        };
        match lead.kind {
            ColumnKind::Text => 0.0,
            ColumnKind::Numeric => {
                let value = numeric(row, &lead.column);
                match lead.direction {
                    SortDirection::Desc => value,
                    SortDirection::Asc => -value,
                }
            }
        }
    }

    /// Full multi-term comparison, best row first.
    pub fn compare(&self, a: &RawMetricRow, b: &RawMetricRow) -> Ordering {
        for term in &self.terms {
            let ordering = match term.kind {
                ColumnKind::Numeric => numeric(a, &term.column)
                    .total_cmp(&numeric(b, &term.column)),
                ColumnKind::Text => text(a, &term.column).cmp(&text(b, &term.column)),
            };
            let ordering = match term.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for ColumnFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.order_by_clause())
    }
}

fn numeric(row: &RawMetricRow, column: &str) -> f64 {
    row.columns
        .get(column)
        .and_then(MetricValue::as_f64)
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

fn text(row: &RawMetricRow, column: &str) -> String {
    match row.columns.get(column) {
        Some(value) => value.as_text(),
        // identity doubles as the username when the store omits the column
        None if column == "username" => row.identity.clone(),
        None => String::new(),
    }
}

/// A validated formula, ready to rank with.
#[derive(Debug, Clone)]
pub enum Formula {
    Columns(ColumnFormula),
    Expression(Expr),
}

impl Formula {
    /// Validates and compiles. Nothing is ever evaluated without passing
    /// through here first.
    pub fn compile(raw: &str) -> Result<Self, FormulaError> {
        let trimmed = raw.trim();
        match trimmed.strip_prefix(EXPRESSION_PREFIX) {
            Some(source) => Expr::compile(source).map(Self::Expression),
            None => ColumnFormula::parse(trimmed).map(Self::Columns),
        }
    }

    pub fn column_order(&self) -> Option<&ColumnFormula> {
        match self {
            Self::Columns(columns) => Some(columns),
            Self::Expression(_) => None,
        }
    }
}

pub fn validate_formula(raw: &str) -> Result<(), FormulaError> {
    Formula::compile(raw).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terms_with_default_direction() {
        let formula = ColumnFormula::parse("referral_count, username ASC").expect("valid");
        assert_eq!(formula.terms().len(), 2);
        assert_eq!(formula.terms()[0].direction, SortDirection::Desc);
        assert_eq!(formula.order_by_clause(), "referral_count DESC, username ASC");
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ColumnFormula::parse("  ").unwrap_err().to_string(),
            "empty ranking formula"
        );
        assert_eq!(
            ColumnFormula::parse("email DESC").unwrap_err().to_string(),
            "column email not allowed in ranking formula"
        );
        assert_eq!(
            ColumnFormula::parse("referral_count desc").unwrap_err(),
            FormulaError::InvalidSyntax("referral_count desc".into())
        );
    }

    #[test]
    fn rejects_injection_attempts() {
        for raw in [
            "referral_count; DROP TABLE users",
            "referral_count DESC --",
            "username ASC, (SELECT 1)",
            "referral_count DESC,",
            "referral_count DESC NULLS LAST",
        ] {
            assert!(ColumnFormula::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn expression_prefix_selects_sandbox() {
        assert!(matches!(
            Formula::compile("expr: referral_count * 2"),
            Ok(Formula::Expression(_))
        ));
        assert!(matches!(
            Formula::compile("username ASC"),
            Ok(Formula::Columns(_))
        ));
        assert!(validate_formula("expr: referral_count +").is_err());
    }

    #[test]
    fn leading_numeric_term_drives_score() {
        let row = RawMetricRow::new("alice").with_column("referral_count", 7i64);
        let desc = ColumnFormula::parse("referral_count DESC").expect("valid");
        let asc = ColumnFormula::parse("referral_count ASC").expect("valid");
        let by_name = ColumnFormula::parse("username ASC").expect("valid");
        assert_eq!(desc.score(&row), 7.0);
        assert_eq!(asc.score(&row), -7.0);
        assert_eq!(by_name.score(&row), 0.0);
    }
}
