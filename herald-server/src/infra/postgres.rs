//! Campaign store backed by the campaign service's PostgreSQL schema.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{
    HeraldError, Result,
    ports::EntityRepository,
    ranking::ColumnFormula,
    types::{ActiveWindow, EntityHandle, EntityId, EntityStatus, Metadata, RawMetricRow},
};
use sqlx::{PgPool, Row, postgres::{PgPoolOptions, PgRow}};
use tracing::{info, warn};

const SERVICE: &str = "postgres";

const CAMPAIGN_COLUMNS: &str = "slug, ranking_formula, status, metadata::text AS metadata, \
     start_date, end_date";

/// Used for the candidate fetch of expression formulas, which rank every row.
const NATURAL_ORDER: &str = "referral_count DESC, username ASC";

#[derive(Clone)]
pub struct PostgresEntityRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresEntityRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresEntityRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresEntityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| HeraldError::unavailable(SERVICE, format!("failed to connect: {e}")))?;
        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    fn map_campaign(row: &PgRow) -> Result<EntityHandle> {
        let slug: String = row.try_get("slug").map_err(read_error("slug"))?;
        let ranking_formula: Option<String> = row
            .try_get("ranking_formula")
            .map_err(read_error("ranking_formula"))?;
        let status: String = row.try_get("status").map_err(read_error("status"))?;
        let metadata: Option<String> =
            row.try_get("metadata").map_err(read_error("metadata"))?;
        let start: Option<DateTime<Utc>> =
            row.try_get("start_date").map_err(read_error("start_date"))?;
        let end: Option<DateTime<Utc>> =
            row.try_get("end_date").map_err(read_error("end_date"))?;

        let status = EntityStatus::parse(&status).ok_or_else(|| {
            HeraldError::Validation(format!("campaign {slug} has unknown status {status}"))
        })?;
        let metadata = match metadata.as_deref().map(str::trim) {
            None | Some("") => Metadata::default(),
            Some(raw) => serde_json::from_str(raw).map_err(|err| {
                HeraldError::Validation(format!("campaign {slug} metadata: {err}"))
            })?,
        };

        Ok(EntityHandle {
            id: EntityId::from(slug),
            status,
            window: ActiveWindow::new(start, end),
            ranking_formula: ranking_formula.filter(|formula| !formula.trim().is_empty()),
            metadata: Arc::new(metadata),
        })
    }
}

fn read_error(column: &'static str) -> impl Fn(sqlx::Error) -> HeraldError {
    move |e| HeraldError::Internal(format!("Failed to read {column}: {e}"))
}

fn query_error(what: &'static str) -> impl Fn(sqlx::Error) -> HeraldError {
    move |e| HeraldError::unavailable(SERVICE, format!("{what} failed: {e}"))
}

/// Candidate query for a campaign's participants. Only a clause produced by
/// [`ColumnFormula::order_by_clause`] is ever interpolated; it consists of
/// whitelisted column names and fixed direction keywords.
fn leaderboard_query(order: Option<&ColumnFormula>, limited: bool) -> String {
    let clause = order.map(ColumnFormula::order_by_clause);
    let mut query = format!(
        "SELECT u.username, COUNT(r.id) AS referral_count \
         FROM service_user_master u \
         LEFT JOIN service_referral_main r \
           ON u.id = r.referrer_id AND r.campaign_slug = $1 \
         GROUP BY u.id \
         ORDER BY {}",
        clause.as_deref().unwrap_or(NATURAL_ORDER)
    );
    if limited {
        query.push_str(" LIMIT $2");
    }
    query
}

#[async_trait]
impl EntityRepository for PostgresEntityRepository {
    async fn list_active_within_window(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityHandle>> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM service_campaign_main \
             WHERE status = 'active' AND start_date <= $1 AND end_date >= $1 \
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("active campaign listing"))?;

        let mut campaigns = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::map_campaign(row) {
                Ok(campaign) => campaigns.push(campaign),
                Err(err) => warn!(
                    target: "herald::sweep",
                    error = %err,
                    "skipping unreadable campaign row"
                ),
            }
        }
        Ok(campaigns)
    }

    async fn find_entity(&self, entity: &EntityId) -> Result<Option<EntityHandle>> {
        let query = format!("SELECT {CAMPAIGN_COLUMNS} FROM service_campaign_main WHERE slug = $1");
        let row = sqlx::query(&query)
            .bind(entity.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("campaign lookup"))?;

        row.as_ref().map(Self::map_campaign).transpose()
    }

    async fn fetch_leaderboard_rows(
        &self,
        entity: &EntityId,
        order: Option<ColumnFormula>,
        limit: Option<usize>,
    ) -> Result<Vec<RawMetricRow>> {
        let limit = limit.filter(|_| order.is_some());
        let query = leaderboard_query(order.as_ref(), limit.is_some());

        let mut statement = sqlx::query(&query).bind(entity.as_str());
        if let Some(limit) = limit {
            statement = statement.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let rows = statement
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("leaderboard fetch"))?;

        rows.iter()
            .map(|row| {
                let username: String =
                    row.try_get("username").map_err(read_error("username"))?;
                let referrals: i64 = row
                    .try_get("referral_count")
                    .map_err(read_error("referral_count"))?;
                Ok(RawMetricRow::new(username.clone())
                    .with_column("username", username.as_str())
                    .with_column("referral_count", referrals))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaderboard_query_embeds_only_the_validated_clause() {
        let order = ColumnFormula::parse("username ASC, referral_count DESC").expect("valid");
        let query = leaderboard_query(Some(&order), true);
        assert!(query.contains("ORDER BY username ASC, referral_count DESC LIMIT $2"));
        assert!(query.contains("r.campaign_slug = $1"));
    }

    #[test]
    fn unlimited_query_uses_natural_order() {
        let query = leaderboard_query(None, false);
        assert!(query.ends_with("ORDER BY referral_count DESC, username ASC"));
        assert!(!query.contains("LIMIT"));
    }

    #[test]
    fn hostile_formulas_never_reach_the_query_builder() {
        assert!(ColumnFormula::parse("referral_count DESC; DROP TABLE service_user_master").is_err());
        assert!(ColumnFormula::parse("password DESC").is_err());
    }
}
