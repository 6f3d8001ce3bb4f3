use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Primitive metric value. Nested structures never make it into a variable
/// environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl MetricValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// One participant as returned by persistence, before scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetricRow {
    pub identity: String,
    #[serde(default)]
    pub columns: BTreeMap<String, MetricValue>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RawMetricRow {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        value: impl Into<MetricValue>,
    ) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Variable environment for scoring: the row's columns plus its
    /// primitive metadata fields. Columns win on name clashes.
    pub fn variables(&self) -> BTreeMap<String, MetricValue> {
        let mut vars = flatten_metadata(&self.metadata);
        for (name, value) in &self.columns {
            vars.insert(name.clone(), value.clone());
        }
        vars
    }
}

/// Keeps only top-level numbers, strings and booleans.
pub fn flatten_metadata(metadata: &Map<String, Value>) -> BTreeMap<String, MetricValue> {
    metadata
        .iter()
        .filter_map(|(key, value)| {
            MetricValue::from_json(value).map(|metric| (key.clone(), metric))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub identity: String,
    pub variables: BTreeMap<String, MetricValue>,
    pub score: f64,
    pub rank: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_drops_nested_values() {
        let metadata = json!({
            "streak": 4,
            "tier": "gold",
            "verified": true,
            "profile": {"bio": "hi"},
            "badges": ["a", "b"],
            "nothing": null
        });
        let Value::Object(map) = metadata else {
            unreachable!()
        };
        let vars = flatten_metadata(&map);
        assert_eq!(vars.len(), 3);
        assert_eq!(vars["streak"], MetricValue::Number(4.0));
        assert_eq!(vars["tier"], MetricValue::Text("gold".into()));
        assert_eq!(vars["verified"], MetricValue::Bool(true));
    }

    #[test]
    fn columns_shadow_metadata() {
        let mut metadata = Map::new();
        metadata.insert("referral_count".into(), json!(100));
        let row = RawMetricRow::new("alice")
            .with_column("referral_count", 5i64)
            .with_metadata(metadata);
        assert_eq!(row.variables()["referral_count"], MetricValue::Number(5.0));
    }
}
