//! Typed campaign configuration.
//!
//! Metadata is validated once when it crosses into the engine and is then
//! shared as an immutable `Arc<Metadata>` snapshot. A change notification
//! replaces the snapshot wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EntityStatus;
use crate::error::{HeraldError, Result};
use crate::ranking;
use crate::scheduler;

pub const CAMPAIGN_TYPES: [&str; 9] = [
    "scheduled",
    "flash",
    "drip",
    "evergreen",
    "recurring",
    "seasonal",
    "targeted",
    "test",
    "experimental",
];

pub const LEADERBOARD_FEATURE: &str = "leaderboard";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<SchedulingInfo>,
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community: Option<CommunityInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localization: Option<LocalizationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commerce: Option<CommerceInfo>,
    /// Free-form extension section, forwarded verbatim in snapshots.
    pub custom: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    /// Broadcasts per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    pub jobs: Vec<JobSpec>,
}

/// One recurring job declared in campaign metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "type", default)]
    pub job_type: String,
    /// Cron expression; daily at midnight when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    pub fn with_cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(cron.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaderboard: Option<LeaderboardSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_locale: Option<String>,
    pub locales: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommerceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl Metadata {
    /// Parses and validates a raw metadata document.
    pub fn from_value(value: Value) -> Result<Self> {
        let metadata: Metadata = serde_json::from_value(value)
            .map_err(|err| HeraldError::Validation(err.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| HeraldError::Validation(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(kind) = self.campaign_type.as_deref()
            && !CAMPAIGN_TYPES.contains(&kind)
        {
            return Err(HeraldError::Validation(format!(
                "invalid campaign type: {kind}"
            )));
        }

        if let Some(status) = self.status.as_deref()
            && EntityStatus::parse(status).is_none()
        {
            return Err(HeraldError::Validation(format!(
                "invalid campaign status: {status}"
            )));
        }

        if let Some(scheduling) = &self.scheduling {
            if let (Some(start), Some(end)) = (scheduling.start, scheduling.end)
                && start > end
            {
                return Err(HeraldError::Validation(
                    "scheduling start is after end".into(),
                ));
            }
            if let Some(frequency) = scheduling.frequency
                && (!frequency.is_finite() || frequency < 0.0)
            {
                return Err(HeraldError::Validation(format!(
                    "invalid broadcast frequency: {frequency}"
                )));
            }
            for job in &scheduling.jobs {
                if job.job_type.trim().is_empty() {
                    return Err(HeraldError::JobSpec(
                        "job type must be a non-empty string".into(),
                    ));
                }
                scheduler::parse_cron(job.cron.as_deref())?;
            }
        }

        if let Some(formula) = self.leaderboard_formula() {
            ranking::validate_formula(formula)?;
        }

        Ok(())
    }

    /// Positive broadcast rate in Hz, if one is configured.
    pub fn broadcast_frequency(&self) -> Option<f64> {
        let scheduled = self
            .scheduling
            .as_ref()
            .and_then(|scheduling| scheduling.frequency);
        let custom = self.custom.get("broadcast_frequency").and_then(Value::as_f64);

        scheduled
            .filter(|hz| hz.is_finite() && *hz > 0.0)
            .or_else(|| custom.filter(|hz| hz.is_finite() && *hz > 0.0))
    }

    pub fn jobs(&self) -> &[JobSpec] {
        self.scheduling
            .as_ref()
            .map(|scheduling| scheduling.jobs.as_slice())
            .unwrap_or_default()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn leaderboard_enabled(&self) -> bool {
        self.has_feature(LEADERBOARD_FEATURE)
            || self
                .leaderboard_settings()
                .and_then(|settings| settings.enabled)
                .unwrap_or(false)
    }

    pub fn leaderboard_formula(&self) -> Option<&str> {
        self.leaderboard_settings()
            .and_then(|settings| settings.formula.as_deref())
    }

    pub fn leaderboard_limit(&self) -> Option<usize> {
        self.leaderboard_settings().and_then(|settings| settings.limit)
    }

    fn leaderboard_settings(&self) -> Option<&LeaderboardSettings> {
        self.community
            .as_ref()
            .and_then(|community| community.leaderboard.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_document() {
        let metadata = Metadata::from_value(json!({
            "campaign_type": "flash",
            "features": ["leaderboard", "waitlist"],
            "scheduling": {
                "frequency": 5.0,
                "jobs": [{"type": "digest", "cron": "*/5 * * * *"}]
            },
            "community": {"leaderboard": {"formula": "referral_count DESC", "limit": 3}},
            "custom": {"banner": "spring"}
        }))
        .expect("valid metadata");

        assert_eq!(metadata.broadcast_frequency(), Some(5.0));
        assert_eq!(metadata.jobs().len(), 1);
        assert!(metadata.leaderboard_enabled());
        assert_eq!(metadata.leaderboard_formula(), Some("referral_count DESC"));
        assert_eq!(metadata.leaderboard_limit(), Some(3));
        assert_eq!(metadata.custom["banner"], json!("spring"));
    }

    #[test]
    fn custom_frequency_is_a_fallback() {
        let metadata = Metadata::from_value(json!({
            "scheduling": {"frequency": 0.0},
            "custom": {"broadcast_frequency": 2}
        }))
        .expect("valid metadata");
        assert_eq!(metadata.broadcast_frequency(), Some(2.0));
    }

    #[test]
    fn zero_frequency_means_unset() {
        let metadata = Metadata::from_value(json!({"scheduling": {"frequency": 0}}))
            .expect("valid metadata");
        assert_eq!(metadata.broadcast_frequency(), None);
    }

    #[test]
    fn rejects_unknown_campaign_type() {
        let err = Metadata::from_value(json!({"campaign_type": "mystery"}))
            .expect_err("should reject");
        assert!(err.is_validation());
    }

    #[test]
    fn rejects_job_without_type() {
        let err = Metadata::from_value(json!({
            "scheduling": {"jobs": [{"cron": "0 0 * * *"}]}
        }))
        .expect_err("should reject");
        assert!(matches!(err, HeraldError::JobSpec(_)));
    }

    #[test]
    fn rejects_bad_cron_and_bad_formula() {
        assert!(
            Metadata::from_value(json!({
                "scheduling": {"jobs": [{"type": "digest", "cron": "every tuesday"}]}
            }))
            .is_err()
        );
        assert!(
            Metadata::from_value(json!({
                "community": {"leaderboard": {"formula": "password DESC"}}
            }))
            .is_err()
        );
    }

    #[test]
    fn rejects_inverted_schedule() {
        let err = Metadata::from_value(json!({
            "scheduling": {
                "start": "2026-05-02T00:00:00Z",
                "end": "2026-05-01T00:00:00Z"
            }
        }))
        .expect_err("should reject");
        assert!(err.is_validation());
    }
}
