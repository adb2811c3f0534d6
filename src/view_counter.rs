//! The aggregation engine.
//!
//! Views are first counted in live counters in the cache, one per film and day. The collect step sweeps all live
//! counters into one immutable pending batch, and the process step flushes pending batches into the store in one
//! transaction each. When the cache can't be used, views go straight to the store.
//!
//! Collection takes off a live counter only the count that went into the batch, so views arriving meanwhile wait for
//! the next batch. A pending batch is flushed by one caller at a time.
//!
//! Delivery is at-least-once: if the process dies after a flush committed but before its batch was deleted, the batch
//! is applied again on the next run.
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Days;
use chrono::NaiveDate;
use chrono::Utc;
use fieldx::fxstruct;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::error::Result;
use crate::error::StoreError;
use crate::gateway::CacheGateway;
use crate::store::TrendingFilm;
use crate::store::ViewDelta;
use crate::store::ViewStore;

pub const LIVE_KEY_PREFIX: &str = "views:film:";
pub const LIVE_KEY_PATTERN: &str = "views:film:*:*";
pub const PENDING_KEY_PREFIX: &str = "pending:views:";
pub const PENDING_KEY_PATTERN: &str = "pending:views:*";
pub const TRENDING_KEY: &str = "films:trending:7days";

const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone, Debug)]
#[fxstruct(sync, no_new, default, builder, get(copy))]
pub struct CounterSettings {
    /// Lifetime of a live counter, counted from its first view.
    #[fieldx(default(Duration::from_secs(7 * 24 * 3600)))]
    live_ttl: Duration,

    #[fieldx(default(Duration::from_secs(24 * 3600)))]
    batch_ttl: Duration,

    /// Upper bound for a single store operation.
    #[fieldx(default(Duration::from_secs(10)))]
    store_timeout: Duration,

    /// Number of calendar days, today included, the trending list covers.
    #[fieldx(default(7))]
    trending_days: u32,

    #[fieldx(default(Duration::from_secs(300)))]
    trending_ttl: Duration,

    /// Size of the cached trending list.
    #[fieldx(default(10))]
    trending_limit: u64,
}

/// Identity of a live counter: `views:film:{film_id}:{YYYY-MM-DD}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiveCounterKey {
    pub film_id: i32,
    pub day:     NaiveDate,
}

impl LiveCounterKey {
    pub fn new(film_id: i32, day: NaiveDate) -> Self {
        Self { film_id, day }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (film_id, day) = key.strip_prefix(LIVE_KEY_PREFIX)?.split_once(':')?;
        Some(Self {
            film_id: film_id.parse().ok()?,
            day:     NaiveDate::parse_from_str(day, DAY_FORMAT).ok()?,
        })
    }
}

impl Display for LiveCounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{LIVE_KEY_PREFIX}{}:{}", self.film_id, self.day.format(DAY_FORMAT))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewEntry {
    #[serde(alias = "filmId")]
    pub entity_id: i32,
    #[serde(alias = "date")]
    pub day:       NaiveDate,
    pub count:     i64,
}

/// Snapshot of live counters waiting to be flushed. Never modified once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBatch {
    pub batch_id:   String,
    pub created_at: DateTime<Utc>,
    #[serde(alias = "views", default)]
    pub entries:    Vec<ViewEntry>,
}

pub fn pending_key(batch_id: &str) -> String {
    format!("{PENDING_KEY_PREFIX}{batch_id}")
}

/// Produces `batch:{unix_millis}` ids that strictly grow within the process, even when several are requested within
/// the same millisecond or the clock steps back.
#[derive(Debug, Default)]
pub struct BatchIdGenerator {
    last: AtomicI64,
}

impl BatchIdGenerator {
    pub fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return format!("batch:{candidate}"),
                Err(current) => last = current,
            }
        }
    }
}

fn batch_millis(batch_id: &str) -> Option<i64> {
    batch_id.strip_prefix("batch:")?.parse().ok()
}

/// Sum entries of the same film and day. Non-positive entries are dropped. The result is ordered by film, then day.
pub fn merge_entries(entries: &[ViewEntry]) -> Vec<ViewDelta> {
    let mut merged: BTreeMap<(i32, NaiveDate), i64> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.count > 0) {
        let total = merged.entry((entry.entity_id, entry.day)).or_default();
        *total = total.saturating_add(entry.count);
    }
    merged
        .into_iter()
        .map(|((film_id, day), count)| ViewDelta::new(film_id, day, count))
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementOutcome {
    pub success: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub rounds:          u32,
    pub batches_created: u32,
    pub batches_flushed: u32,
    pub batches_failed:  u32,
    /// Pending batches still in the cache when draining stopped.
    pub remaining:       usize,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Marks a pending batch as being flushed for as long as it lives.
struct FlushClaim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    batch_id:  String,
}

impl<'a> FlushClaim<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<String>>, batch_id: &str) -> Option<Self> {
        in_flight.lock().insert(batch_id.to_string()).then(|| Self {
            in_flight,
            batch_id: batch_id.to_string(),
        })
    }
}

impl Drop for FlushClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.batch_id);
    }
}

#[derive(Debug)]
pub struct ViewCounter {
    gateway:   Arc<CacheGateway>,
    store:     Arc<dyn ViewStore>,
    settings:  CounterSettings,
    batch_ids: BatchIdGenerator,
    // Pending batches currently being flushed.
    in_flight: Mutex<HashSet<String>>,
}

impl ViewCounter {
    pub fn new(gateway: Arc<CacheGateway>, store: Arc<dyn ViewStore>, settings: CounterSettings) -> Self {
        Self {
            gateway,
            store,
            settings,
            batch_ids: BatchIdGenerator::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<CacheGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> &CounterSettings {
        &self.settings
    }

    /// Current UTC calendar day.
    pub fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Count one view of a film.
    ///
    /// Goes to today's live counter if the cache is usable and to the store otherwise. Errors only come from the
    /// store.
    #[instrument(level = "trace", skip(self))]
    pub async fn increment_view(&self, film_id: i32) -> Result<IncrementOutcome> {
        if self.gateway.is_available() {
            let key = LiveCounterKey::new(film_id, self.today()).to_string();
            if self.gateway.increment(&key, Some(self.settings.live_ttl())).await > 0 {
                return Ok(IncrementOutcome { success: true });
            }
            warn!(film_id, "Cache increment failed; writing the view directly");
        }

        self.increment_direct(film_id).await
    }

    /// Count one view of a film straight in the store, in one transaction.
    #[instrument(level = "debug", skip(self))]
    pub async fn increment_direct(&self, film_id: i32) -> Result<IncrementOutcome> {
        let today = self.today();
        self.with_store_timeout(self.store.increment_direct(film_id, today))
            .await
            .inspect_err(|err| error!(film_id, "Direct view increment failed: {err}"))?;

        Ok(IncrementOutcome { success: true })
    }

    /// Sweep all live counters into a new pending batch. Returns the batch id, or `None` if there was nothing to
    /// collect or the batch couldn't be stored. Counters are only deleted after their batch is in the cache.
    #[instrument(level = "debug", skip(self))]
    pub async fn collect_views_to_pending(&self) -> Option<String> {
        if !self.gateway.is_available() {
            debug!("Cache unavailable; nothing to collect");
            return None;
        }

        let keys = self.gateway.get_keys(LIVE_KEY_PATTERN).await;
        if keys.is_empty() {
            return None;
        }

        let mut entries = Vec::with_capacity(keys.len());
        let mut taken = Vec::with_capacity(keys.len());
        let mut malformed = Vec::new();
        for key in &keys {
            let Some(live) = LiveCounterKey::parse(key)
            else {
                warn!(key = %key, "Skipping malformed live counter key");
                malformed.push(key);
                continue;
            };

            match self.gateway.get::<i64>(key).await {
                Some(count) if count > 0 => {
                    entries.push(ViewEntry {
                        entity_id: live.film_id,
                        day: live.day,
                        count,
                    });
                    taken.push((key, count));
                }
                Some(count) => {
                    debug!(key = %key, count, "Skipping non-positive live counter");
                    taken.push((key, count));
                }
                None => debug!(key = %key, "Live counter vanished or is unreadable"),
            }
        }

        if entries.is_empty() {
            return None;
        }

        let batch = PendingBatch {
            batch_id: self.batch_ids.next_id(),
            created_at: Utc::now(),
            entries,
        };

        if !self
            .gateway
            .set(&pending_key(&batch.batch_id), &batch, Some(self.settings.batch_ttl()))
            .await
        {
            error!(batch_id = %batch.batch_id, "Pending batch could not be stored; live counters are kept");
            return None;
        }

        // Only what went into the batch is taken off; increments that landed since the read stay for the next one.
        for (key, count) in taken {
            if self.gateway.decrement(key, count).await.is_none() {
                warn!(key = %key, count, "Collected live counter was not settled; its views may be counted again");
            }
        }
        for key in malformed {
            self.gateway.delete(key).await;
        }

        info!(
            batch_id = %batch.batch_id,
            entries = batch.entries.len(),
            "Collected live counters into a pending batch"
        );
        Some(batch.batch_id)
    }

    /// Ids of all pending batches, oldest first.
    pub async fn get_pending_batches(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .gateway
            .get_keys(PENDING_KEY_PATTERN)
            .await
            .into_iter()
            .filter_map(|key| key.strip_prefix(PENDING_KEY_PREFIX).map(str::to_string))
            .collect();

        ids.sort_by(|a, b| {
            batch_millis(a)
                .unwrap_or(i64::MAX)
                .cmp(&batch_millis(b).unwrap_or(i64::MAX))
                .then_with(|| a.cmp(b))
        });
        ids
    }

    /// Flush one pending batch into the store. The batch is deleted only after its transaction committed. Returns
    /// `true` if the batch is gone for good, `false` if it wasn't flushed, including when another flush of the same
    /// batch is under way.
    pub async fn process_pending_batch(&self, batch_id: &str) -> bool {
        self.try_process_pending_batch(batch_id).await.unwrap_or(false)
    }

    /// Same as [`process_pending_batch`](Self::process_pending_batch) but returns `None` without touching the batch if
    /// it is already being flushed by another caller.
    #[instrument(level = "debug", skip(self))]
    pub async fn try_process_pending_batch(&self, batch_id: &str) -> Option<bool> {
        if !self.gateway.is_available() {
            return Some(false);
        }

        let Some(_claim) = FlushClaim::acquire(&self.in_flight, batch_id)
        else {
            debug!(batch_id, "Pending batch is already being flushed");
            return None;
        };

        Some(self.flush_batch(batch_id).await)
    }

    async fn flush_batch(&self, batch_id: &str) -> bool {
        let key = pending_key(batch_id);
        let Some(batch) = self.gateway.get::<PendingBatch>(&key).await
        else {
            warn!(batch_id, "Pending batch not found");
            return false;
        };

        if batch.entries.is_empty() {
            self.gateway.delete(&key).await;
            return true;
        }

        let deltas = merge_entries(&batch.entries);
        if let Err(err) = self.with_store_timeout(self.store.apply_batch(&deltas)).await {
            error!(batch_id, "Pending batch flush failed, will retry: {err}");
            return false;
        }

        self.gateway.delete(&key).await;
        self.gateway.delete(TRENDING_KEY).await;

        info!(batch_id, films = deltas.len(), "Pending batch flushed");
        true
    }

    /// Collect and flush repeatedly until no live counters or pending batches are left, or `max_rounds` is reached.
    #[instrument(level = "debug", skip(self))]
    pub async fn drain(&self, max_rounds: u32) -> DrainReport {
        let mut report = DrainReport::default();

        while report.rounds < max_rounds && self.gateway.is_available() {
            report.rounds += 1;

            let collected = self.collect_views_to_pending().await.is_some();
            if collected {
                report.batches_created += 1;
            }

            for batch_id in self.get_pending_batches().await {
                match self.try_process_pending_batch(&batch_id).await {
                    Some(true) => report.batches_flushed += 1,
                    Some(false) => report.batches_failed += 1,
                    None => (),
                }
            }

            if !collected && self.get_pending_batches().await.is_empty() {
                break;
            }
        }

        report.remaining = self.get_pending_batches().await.len();
        debug!(?report, "Drain finished");
        report
    }

    /// Most viewed films over the trending window, most viewed first.
    ///
    /// Served from the cached snapshot when possible. Requests larger than the configured snapshot size always go to
    /// the store.
    pub async fn trending(&self, limit: u64) -> Result<Vec<TrendingFilm>> {
        let snapshot_limit = self.settings.trending_limit();

        if limit <= snapshot_limit {
            if let Some(mut cached) = self.gateway.get::<Vec<TrendingFilm>>(TRENDING_KEY).await {
                cached.truncate(limit as usize);
                return Ok(cached);
            }
        }

        let since = self
            .today()
            .checked_sub_days(Days::new(u64::from(self.settings.trending_days().saturating_sub(1))))
            .unwrap_or(NaiveDate::MIN);
        let fetch = limit.max(snapshot_limit);
        let mut films = self
            .with_store_timeout(self.store.top_films_since(since, fetch))
            .await?;

        if fetch == snapshot_limit {
            self.gateway
                .set(TRENDING_KEY, &films, Some(self.settings.trending_ttl()))
                .await;
        }

        films.truncate(limit as usize);
        Ok(films)
    }

    pub async fn total_views(&self, film_id: i32) -> Result<Option<i64>> {
        Ok(self.with_store_timeout(self.store.total_views(film_id)).await?)
    }

    pub async fn daily_views(&self, film_id: i32, day: NaiveDate) -> Result<i64> {
        Ok(self.with_store_timeout(self.store.daily_views(film_id, day)).await?)
    }

    async fn with_store_timeout<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        let timeout = self.settings.store_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }
}
