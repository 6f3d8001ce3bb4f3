use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::{fmt, time::Duration};

use dashmap::DashMap;
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use super::{Formula, rank};
use crate::error::Result;
use crate::ports::EntityRepository;
use crate::types::{EntityId, LeaderboardEntry};

type SlotKey = (EntityId, usize);

struct CachedBoard {
    formula: String,
    computed_at: Instant,
    entries: Arc<Vec<LeaderboardEntry>>,
}

/// Leaderboards cached per `(entity, limit)` for a short TTL.
///
/// Every key owns an async mutex. The first caller computes while holding
/// it; concurrent callers for the same key wait on the lock and then read the
/// fresh entry, so a hot campaign is ranked once per TTL no matter how many
/// requests arrive together.
pub struct LeaderboardService {
    repository: Arc<dyn EntityRepository>,
    ttl: Duration,
    default_formula: String,
    slots: DashMap<SlotKey, Arc<Mutex<Option<CachedBoard>>>>,
    computations: AtomicU64,
}

impl fmt::Debug for LeaderboardService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderboardService")
            .field("ttl", &self.ttl)
            .field("default_formula", &self.default_formula)
            .field("slots", &self.slots.len())
            .field("computations", &self.computations.load(Ordering::Relaxed))
            .finish()
    }
}

impl LeaderboardService {
    pub fn new(
        repository: Arc<dyn EntityRepository>,
        ttl: Duration,
        default_formula: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            ttl,
            default_formula: default_formula.into(),
            slots: DashMap::new(),
            computations: AtomicU64::new(0),
        }
    }

    /// Ranked participants for `entity`. Formula errors are returned before
    /// any cache or persistence access.
    pub async fn leaderboard(
        &self,
        entity: &EntityId,
        formula: Option<&str>,
        limit: usize,
    ) -> Result<Arc<Vec<LeaderboardEntry>>> {
        let raw = formula.unwrap_or(&self.default_formula);
        let compiled = Formula::compile(raw)?;

        let slot = self
            .slots
            .entry((entity.clone(), limit))
            .or_default()
            .clone();
        let mut cached = slot.lock().await;

        if let Some(board) = cached.as_ref()
            && board.formula == raw
            && board.computed_at.elapsed() < self.ttl
        {
            return Ok(Arc::clone(&board.entries));
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let rows = match compiled.column_order() {
            Some(order) => {
                self.repository
                    .fetch_leaderboard_rows(entity, Some(order.clone()), Some(limit))
                    .await?
            }
            None => {
                self.repository
                    .fetch_leaderboard_rows(entity, None, None)
                    .await?
            }
        };

        let candidates = rows.len();
        let entries = Arc::new(rank(&compiled, rows, limit));
        debug!(
            target: "herald::ranking",
            entity = %entity,
            candidates,
            returned = entries.len(),
            "leaderboard recomputed"
        );

        *cached = Some(CachedBoard {
            formula: raw.to_string(),
            computed_at: Instant::now(),
            entries: Arc::clone(&entries),
        });
        Ok(entries)
    }

    /// Drops every cached board of `entity`.
    pub fn invalidate(&self, entity: &EntityId) {
        self.slots.retain(|(id, _), _| id != entity);
    }

    /// Number of times a board was actually computed.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn default_formula(&self) -> &str {
        &self.default_formula
    }
}
