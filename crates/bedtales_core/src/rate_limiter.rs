//! crates/bedtales_core/src/rate_limiter.rs
//!
//! Client-side daily quotas for expensive generation calls.
//!
//! There is no trusted server, so usage is read from three independent places and
//! the largest count wins: the fast cache blob, the durable `apiUsage` rows, and the
//! number of stories/characters created in the trailing 24 hours. Clearing any single
//! layer therefore never hands out extra quota.
//!
//! Generation requests take a [`UsageReservation`] before calling out. Reserved uses
//! count against the gate, so concurrent requests cannot all slip through, but they
//! reach the cache and the store only once committed.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{ActionType, ApiUsage, Character, SavedStory};
use crate::ports::{Clock, DocumentStore, KeyValueCache, PortError, PortResult};
use crate::store;

/// Key of the usage blob in the fast cache.
pub const USAGE_CACHE_KEY: &str = "apiRateLimits";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyLimits {
    pub create_story: u32,
    pub create_character: u32,
}

impl Default for DailyLimits {
    fn default() -> Self {
        Self {
            create_story: 2,
            create_character: 2,
        }
    }
}

impl DailyLimits {
    pub fn for_action(&self, action: ActionType) -> u32 {
        match action {
            ActionType::CreateStory => self.create_story,
            ActionType::CreateCharacter => self.create_character,
        }
    }
}

/// Usage of one action on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounter {
    pub count: u32,
    pub last_reset: String,
}

impl UsageCounter {
    fn fresh(today: &str) -> Self {
        Self {
            count: 0,
            last_reset: today.to_string(),
        }
    }

    /// The count as of `today`: a counter from an earlier day counts as zero.
    fn count_on(&self, today: &str) -> u32 {
        if self.last_reset == today {
            self.count
        } else {
            0
        }
    }
}

pub type UsageMap = BTreeMap<ActionType, UsageCounter>;

/// What the UI needs to render a quota badge.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStatus {
    pub action: ActionType,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub blocked: bool,
}

/// Calendar day in UTC, `YYYY-MM-DD`.
pub fn day_string(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

fn read_state(state: &RwLock<LimiterState>) -> RwLockReadGuard<'_, LimiterState> {
    state.read().unwrap_or_else(|e| e.into_inner())
}

struct LimiterState {
    loading: bool,
    usage: UsageMap,
    /// Uses reserved by requests still in flight.
    pending: BTreeMap<ActionType, u32>,
}

impl LimiterState {
    fn pending(&self, action: ActionType) -> u32 {
        self.pending.get(&action).copied().unwrap_or(0)
    }

    fn release(&mut self, action: ActionType) {
        if let Some(n) = self.pending.get_mut(&action) {
            *n = n.saturating_sub(1);
        }
    }
}

/// One use of an action held for a request in flight.
///
/// [`UsageReservation::commit`] records the use. Dropping the reservation without
/// committing hands the use back.
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct UsageReservation<'a> {
    limiter: &'a RateLimiter,
    action: ActionType,
    settled: bool,
}

impl UsageReservation<'_> {
    pub fn action(&self) -> ActionType {
        self.action
    }

    /// Records the reserved use. See [`RateLimiter::record_action`].
    pub fn commit(mut self) -> JoinHandle<()> {
        self.settled = true;
        self.limiter.count_use(self.action, true)
    }
}

impl Drop for UsageReservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Releasing unused {} reservation", self.action);
            self.limiter.write().release(self.action);
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn KeyValueCache>,
    clock: Arc<dyn Clock>,
    limits: DailyLimits,
    state: Arc<RwLock<LimiterState>>,
    /// Orders the background `apiUsage` writes.
    durable_writes: Arc<Mutex<()>>,
}

impl RateLimiter {
    /// Creates a limiter that blocks every action until [`RateLimiter::synchronize`] ran.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn KeyValueCache>,
        clock: Arc<dyn Clock>,
        limits: DailyLimits,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            limits,
            state: Arc::new(RwLock::new(LimiterState {
                loading: true,
                usage: UsageMap::new(),
                pending: BTreeMap::new(),
            })),
            durable_writes: Arc::new(Mutex::new(())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LimiterState> {
        read_state(&self.state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LimiterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn today(&self) -> String {
        day_string(self.clock.now())
    }

    //=====================================================================================
    // Reconciliation
    //=====================================================================================

    /// Reconciles usage across all layers and writes the result back to each of them.
    ///
    /// If the durable store cannot be read or written, falls back to the cached blob,
    /// and to zero usage when that is unreadable too.
    pub async fn synchronize(&self) {
        self.write().loading = true;
        let usage = match self.reconcile().await {
            Ok(usage) => usage,
            Err(e) => {
                error!("Failed to synchronize API rate limits: {}", e);
                let today = self.today();
                self.read_cache().unwrap_or_else(|| {
                    ActionType::ALL
                        .into_iter()
                        .map(|a| (a, UsageCounter::fresh(&today)))
                        .collect()
                })
            }
        };
        let mut state = self.write();
        state.usage = usage;
        state.loading = false;
    }

    async fn reconcile(&self) -> PortResult<UsageMap> {
        let now = self.clock.now();
        let today = day_string(now);
        let window_start = now - Duration::hours(24);

        let cached = self.read_cache().unwrap_or_default();
        let durable: Vec<ApiUsage> = store::load_all(self.store.as_ref()).await?;
        let (stories, characters) = futures::try_join!(
            store::load_all::<SavedStory>(self.store.as_ref()),
            store::load_all::<Character>(self.store.as_ref()),
        )?;

        let mut usage = UsageMap::new();
        for action in ActionType::ALL {
            let from_cache = cached.get(&action).map_or(0, |c| c.count_on(&today));
            let from_store = durable
                .iter()
                .find(|row| row.id == action)
                .filter(|row| row.last_reset == today)
                .map_or(0, |row| row.count);
            let recent = match action {
                ActionType::CreateStory => stories
                    .iter()
                    .filter(|s| s.created_at > window_start)
                    .count(),
                ActionType::CreateCharacter => characters
                    .iter()
                    .filter(|c| c.created_at > window_start)
                    .count(),
            } as u32;

            let count = from_cache.max(from_store).max(recent);
            if count != from_cache || count != from_store {
                info!(
                    "Reconciled {} usage to {} (cache {}, store {}, recent {})",
                    action, count, from_cache, from_store, recent
                );
            }
            usage.insert(
                action,
                UsageCounter {
                    count,
                    last_reset: today.clone(),
                },
            );
        }

        self.write_cache(&usage);
        let rows: Vec<ApiUsage> = usage
            .iter()
            .map(|(action, counter)| ApiUsage {
                id: *action,
                count: counter.count,
                last_reset: counter.last_reset.clone(),
            })
            .collect();
        store::bulk_put_records(self.store.as_ref(), &rows).await?;

        Ok(usage)
    }

    fn read_cache(&self) -> Option<UsageMap> {
        match self.cache.get(USAGE_CACHE_KEY) {
            Ok(Some(blob)) => match serde_json::from_str::<UsageMap>(&blob) {
                Ok(usage) => Some(usage),
                Err(e) => {
                    warn!("Ignoring unreadable usage cache: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Usage cache unavailable: {}", e);
                None
            }
        }
    }

    fn write_cache(&self, usage: &UsageMap) {
        let result = serde_json::to_string(usage)
            .map_err(|e| PortError::Unexpected(e.to_string()))
            .and_then(|blob| self.cache.set(USAGE_CACHE_KEY, &blob));
        if let Err(e) = result {
            error!("Failed to write usage cache: {}", e);
        }
    }

    //=====================================================================================
    // Gate
    //=====================================================================================

    /// Counts one use of `action`.
    ///
    /// The in-memory count and the cache update immediately. The durable write runs in
    /// the background; its failure is logged because the action already happened. The
    /// returned handle may be awaited or dropped.
    pub fn record_action(&self, action: ActionType) -> JoinHandle<()> {
        self.count_use(action, false)
    }

    /// Holds one use of `action` for a request that is about to call out, or fails
    /// with `QuotaExceeded`. Check and hold happen under one lock.
    pub fn try_reserve(&self, action: ActionType) -> PortResult<UsageReservation<'_>> {
        let today = self.today();
        let mut state = self.write();
        if state.loading {
            return Err(PortError::QuotaExceeded(action));
        }
        let used = state.usage.get(&action).map_or(0, |c| c.count_on(&today));
        if used + state.pending(action) >= self.limits.for_action(action) {
            return Err(PortError::QuotaExceeded(action));
        }
        *state.pending.entry(action).or_insert(0) += 1;
        Ok(UsageReservation {
            limiter: self,
            action,
            settled: false,
        })
    }

    fn count_use(&self, action: ActionType, reserved: bool) -> JoinHandle<()> {
        let today = self.today();
        let usage = {
            let mut state = self.write();
            if reserved {
                state.release(action);
            }
            let current = state.usage.get(&action).map_or(0, |c| c.count_on(&today));
            state.usage.insert(
                action,
                UsageCounter {
                    count: current + 1,
                    last_reset: today,
                },
            );
            state.usage.clone()
        };
        self.write_cache(&usage);

        // Each write stores the latest counter at the time it gets its turn, so the
        // durable row never goes backwards within a day.
        let store = self.store.clone();
        let state = self.state.clone();
        let durable_writes = self.durable_writes.clone();
        tokio::spawn(async move {
            let _turn = durable_writes.lock().await;
            let latest = read_state(&state).usage.get(&action).cloned();
            let Some(counter) = latest else {
                return;
            };
            let row = ApiUsage {
                id: action,
                count: counter.count,
                last_reset: counter.last_reset,
            };
            if let Err(e) = store::put_record(store.as_ref(), &row).await {
                error!("Failed to update apiUsage for {}: {}", row.id, e);
            }
        })
    }

    pub fn is_loading(&self) -> bool {
        self.read().loading
    }

    /// Uses left today. Zero while usage is still being reconciled.
    pub fn get_remaining(&self, action: ActionType) -> u32 {
        let state = self.read();
        if state.loading {
            return 0;
        }
        let used = state
            .usage
            .get(&action)
            .map_or(0, |c| c.count_on(&self.today()));
        self.limits
            .for_action(action)
            .saturating_sub(used + state.pending(action))
    }

    pub fn is_blocked(&self, action: ActionType) -> bool {
        self.get_remaining(action) == 0
    }

    /// Fails with `QuotaExceeded` when `action` is blocked.
    pub fn ensure_allowed(&self, action: ActionType) -> PortResult<()> {
        if self.is_blocked(action) {
            return Err(PortError::QuotaExceeded(action));
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<UsageStatus> {
        let today = self.today();
        let state = self.read();
        ActionType::ALL
            .into_iter()
            .map(|action| {
                let used = state.usage.get(&action).map_or(0, |c| c.count_on(&today));
                let limit = self.limits.for_action(action);
                let remaining = if state.loading {
                    0
                } else {
                    limit.saturating_sub(used + state.pending(action))
                };
                UsageStatus {
                    action,
                    used,
                    limit,
                    remaining,
                    blocked: remaining == 0,
                }
            })
            .collect()
    }
}
