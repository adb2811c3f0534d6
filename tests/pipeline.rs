#![cfg(feature = "sqlite")]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono::Utc;
use wb_viewcount::error::CacheError;
use wb_viewcount::error::StoreError;
use wb_viewcount::gateway::memory::MemoryStore;
use wb_viewcount::gateway::CacheBackend;
use wb_viewcount::gateway::CacheConnector;
use wb_viewcount::gateway::CacheGateway;
use wb_viewcount::gateway::GatewaySettings;
use wb_viewcount::store::DbViewStore;
use wb_viewcount::store::TrendingFilm;
use wb_viewcount::store::ViewDelta;
use wb_viewcount::store::ViewStore;
use wb_viewcount::test::memory_gateway;
use wb_viewcount::test::quick_gateway_settings;
use wb_viewcount::test::TestDb;
use wb_viewcount::view_counter::pending_key;
use wb_viewcount::view_counter::CounterSettings;
use wb_viewcount::view_counter::LiveCounterKey;
use wb_viewcount::view_counter::PendingBatch;
use wb_viewcount::view_counter::ViewCounter;
use wb_viewcount::view_counter::ViewEntry;
use wb_viewcount::view_counter::LIVE_KEY_PATTERN;
use wb_viewcount::view_counter::TRENDING_KEY;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn counter_for(gateway: Arc<CacheGateway>, store: Arc<dyn ViewStore>) -> ViewCounter {
    ViewCounter::new(gateway, store, CounterSettings::default())
}

#[tokio::test]
async fn unavailable_cache_makes_the_pipeline_idle() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let counter = counter_for(CacheGateway::disabled(GatewaySettings::default()), db.store());

    assert_eq!(counter.collect_views_to_pending().await, None);
    assert!(counter.get_pending_batches().await.is_empty());
    assert!(!counter.process_pending_batch("batch:1").await);

    let report = counter.drain(3).await;
    assert_eq!(report.rounds, 0);
    assert!(report.is_complete());

    // Views still count, straight in the database.
    assert!(counter.increment_view(films[0]).await.unwrap().success);
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(1));
}

#[tokio::test]
async fn collect_conserves_live_counts() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(3).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());

    let views = [4i64, 1, 7];
    for (film, count) in films.iter().zip(views) {
        for _ in 0..count {
            counter.increment_view(*film).await.unwrap();
        }
    }
    assert_eq!(gateway.get_keys(LIVE_KEY_PATTERN).await.len(), 3);

    let batch_id = counter.collect_views_to_pending().await.unwrap();
    let batch: PendingBatch = gateway.get(&pending_key(&batch_id)).await.unwrap();

    assert_eq!(batch.batch_id, batch_id);
    assert_eq!(batch.entries.iter().map(|e| e.count).sum::<i64>(), views.iter().sum::<i64>());
    for (film, count) in films.iter().zip(views) {
        let entry = batch.entries.iter().find(|e| e.entity_id == *film).unwrap();
        assert_eq!((entry.day, entry.count), (today(), count));
    }
    assert!(gateway.get_keys(LIVE_KEY_PATTERN).await.is_empty());
    assert_eq!(counter.get_pending_batches().await, vec![batch_id]);

    // Nothing to collect right after a sweep.
    assert_eq!(counter.collect_views_to_pending().await, None);
}

#[tokio::test]
async fn worthless_counters_do_not_make_a_batch() {
    let db = TestDb::new().await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());

    gateway.set("views:film:1:2024-01-01", &0, None).await;
    gateway.set("views:film:2:2024-01-01", &"junk", None).await;
    gateway.set("views:film:oops:2024-01-01", &5, None).await;

    assert_eq!(counter.collect_views_to_pending().await, None);
    assert!(counter.get_pending_batches().await.is_empty());
}

#[tokio::test]
async fn flush_merges_duplicate_entries() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(2).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());

    let d1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let d2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
    let entry = |entity_id, day, count| ViewEntry { entity_id, day, count };
    let batch = PendingBatch {
        batch_id:   "batch:1000".into(),
        created_at: Utc::now(),
        entries:    vec![
            entry(films[0], d1, 2),
            entry(films[0], d1, 3),
            entry(films[0], d2, 1),
            entry(films[1], d2, 4),
        ],
    };
    assert!(gateway.set(&pending_key(&batch.batch_id), &batch, None).await);

    assert!(counter.process_pending_batch("batch:1000").await);

    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(6));
    assert_eq!(counter.total_views(films[1]).await.unwrap(), Some(4));
    assert_eq!(counter.daily_views(films[0], d1).await.unwrap(), 5);
    assert_eq!(counter.daily_views(films[0], d2).await.unwrap(), 1);
    assert_eq!(counter.daily_views(films[1], d2).await.unwrap(), 4);
    assert!(counter.get_pending_batches().await.is_empty());
}

#[tokio::test]
async fn empty_batch_is_just_deleted() {
    let db = TestDb::new().await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());

    let batch = PendingBatch {
        batch_id:   "batch:5".into(),
        created_at: Utc::now(),
        entries:    vec![],
    };
    gateway.set(&pending_key("batch:5"), &batch, None).await;

    assert!(counter.process_pending_batch("batch:5").await);
    assert!(counter.get_pending_batches().await.is_empty());
}

#[tokio::test]
async fn fallback_matches_direct_writes() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(2).await.unwrap();
    let counter = counter_for(CacheGateway::disabled(GatewaySettings::default()), db.store());

    for _ in 0..3 {
        counter.increment_view(films[0]).await.unwrap();
        counter.increment_direct(films[1]).await.unwrap();
    }

    for film in &films {
        assert_eq!(counter.total_views(*film).await.unwrap(), Some(3));
        assert_eq!(counter.daily_views(*film, today()).await.unwrap(), 3);
    }
}

#[tokio::test]
async fn direct_write_errors_propagate() {
    let db = TestDb::new().await.unwrap();
    let counter = counter_for(CacheGateway::disabled(GatewaySettings::default()), db.store());

    let err = counter.increment_view(31337).await.unwrap_err();
    assert!(err.to_string().contains("31337"), "{err}");
}

#[tokio::test]
async fn missing_batch_is_benign() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway, db.store());

    assert!(!counter.process_pending_batch("batch:404").await);
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(0));
}

#[derive(Debug)]
struct FlakyStore {
    inner: Arc<DbViewStore>,
    fail:  AtomicBool,
}

#[async_trait]
impl ViewStore for FlakyStore {
    async fn apply_batch(&self, deltas: &[ViewDelta]) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout(Duration::ZERO));
        }
        self.inner.apply_batch(deltas).await
    }

    async fn total_views(&self, film_id: i32) -> Result<Option<i64>, StoreError> {
        self.inner.total_views(film_id).await
    }

    async fn daily_views(&self, film_id: i32, day: NaiveDate) -> Result<i64, StoreError> {
        self.inner.daily_views(film_id, day).await
    }

    async fn top_films_since(&self, since: NaiveDate, limit: u64) -> Result<Vec<TrendingFilm>, StoreError> {
        self.inner.top_films_since(since, limit).await
    }
}

#[tokio::test]
async fn failed_flush_keeps_the_batch() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let store = Arc::new(FlakyStore {
        inner: db.store(),
        fail:  AtomicBool::new(true),
    });
    let counter = counter_for(gateway, store.clone());

    for _ in 0..5 {
        counter.increment_view(films[0]).await.unwrap();
    }
    let batch_id = counter.collect_views_to_pending().await.unwrap();

    assert!(!counter.process_pending_batch(&batch_id).await);
    assert_eq!(counter.get_pending_batches().await, vec![batch_id.clone()]);
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(0));

    store.fail.store(false, Ordering::SeqCst);
    assert!(counter.process_pending_batch(&batch_id).await);
    assert!(counter.get_pending_batches().await.is_empty());
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(5));
}

#[tokio::test]
async fn unknown_film_in_batch_rolls_back() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());

    counter.increment_view(films[0]).await.unwrap();
    gateway
        .increment(&LiveCounterKey::new(777, today()).to_string(), None)
        .await;
    let batch_id = counter.collect_views_to_pending().await.unwrap();

    assert!(!counter.process_pending_batch(&batch_id).await);
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(0));
    assert_eq!(counter.get_pending_batches().await, vec![batch_id]);
}

#[tokio::test]
async fn drain_converges() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(4).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = Arc::new(counter_for(gateway, db.store()));

    let mut tasks = Vec::new();
    for n in 0..40usize {
        let counter = Arc::clone(&counter);
        let film = films[n % films.len()];
        tasks.push(tokio::spawn(async move { counter.increment_view(film).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // One batch left over from an earlier cycle.
    counter.collect_views_to_pending().await.unwrap();
    for film in &films {
        counter.increment_view(*film).await.unwrap();
    }

    let report = counter.drain(5).await;
    assert!(report.is_complete());
    assert_eq!(report.batches_created, 1);
    assert_eq!(report.batches_flushed, 2);
    assert_eq!(report.batches_failed, 0);

    for film in &films {
        assert_eq!(counter.total_views(*film).await.unwrap(), Some(11));
        assert_eq!(counter.daily_views(*film, today()).await.unwrap(), 11);
    }
}

#[tokio::test]
async fn cache_outage_falls_back_and_recovers() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let (gateway, connector) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());
    let store = connector.store();

    for _ in 0..5 {
        counter.increment_view(films[0]).await.unwrap();
    }

    store.set_offline(true);
    for _ in 0..3 {
        assert!(counter.increment_view(films[0]).await.unwrap().success);
    }
    assert!(!gateway.is_available());
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(3));

    store.set_offline(false);
    assert!(gateway.wait_until_ready(Duration::from_secs(2)).await);

    counter.drain(3).await;
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(8));
    assert_eq!(counter.daily_views(films[0], today()).await.unwrap(), 8);
}

#[tokio::test]
async fn trending_snapshot_is_cached_and_invalidated() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(3).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());

    for (film, views) in films.iter().zip([2, 5, 1]) {
        for _ in 0..views {
            counter.increment_view(*film).await.unwrap();
        }
    }
    counter.drain(2).await;

    let top = counter.trending(2).await.unwrap();
    assert_eq!(
        top,
        vec![
            TrendingFilm {
                film_id: films[1],
                views:   5,
            },
            TrendingFilm {
                film_id: films[0],
                views:   2,
            },
        ]
    );
    let cached: Vec<TrendingFilm> = gateway.get(TRENDING_KEY).await.unwrap();
    assert_eq!(cached.len(), 3);

    for _ in 0..10 {
        counter.increment_view(films[2]).await.unwrap();
    }
    counter.drain(2).await;
    assert_eq!(gateway.get::<Vec<TrendingFilm>>(TRENDING_KEY).await, None);
    assert_eq!(counter.trending(1).await.unwrap()[0].film_id, films[2]);
}

// Backend whose writes can be switched to fail with a command error.
#[derive(Debug)]
struct ReadOnlyToggle {
    inner:     Arc<MemoryStore>,
    read_only: Arc<AtomicBool>,
}

#[async_trait]
impl CacheBackend for ReadOnlyToggle {
    fn name(&self) -> &'static str {
        "read-only-toggle"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(CacheError::Command("READONLY".into()));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.inner.del(keys).await
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.inner.incr(key).await
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError> {
        self.inner.decr_by(key, amount).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.inner.expire(key, ttl).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.inner.keys(pattern).await
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush().await
    }
}

struct ReadOnlyConnector {
    store:     Arc<MemoryStore>,
    read_only: Arc<AtomicBool>,
}

#[async_trait]
impl CacheConnector for ReadOnlyConnector {
    fn target(&self) -> String {
        "memory://read-only-toggle".into()
    }

    async fn connect(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        Ok(Arc::new(ReadOnlyToggle {
            inner:     Arc::clone(&self.store),
            read_only: Arc::clone(&self.read_only),
        }))
    }
}

#[tokio::test]
async fn unsaved_batch_keeps_live_counters() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let read_only = Arc::new(AtomicBool::new(false));
    let gateway = CacheGateway::start(
        Arc::new(ReadOnlyConnector {
            store:     Arc::new(MemoryStore::default()),
            read_only: Arc::clone(&read_only),
        }),
        quick_gateway_settings(),
    );
    assert!(gateway.wait_until_ready(Duration::from_secs(2)).await);
    let counter = counter_for(gateway.clone(), db.store());

    for _ in 0..3 {
        counter.increment_view(films[0]).await.unwrap();
    }

    read_only.store(true, Ordering::SeqCst);
    assert_eq!(counter.collect_views_to_pending().await, None);
    assert!(gateway.is_available());
    assert_eq!(gateway.get_keys(LIVE_KEY_PATTERN).await.len(), 1);
    assert!(counter.get_pending_batches().await.is_empty());

    read_only.store(false, Ordering::SeqCst);
    counter.drain(2).await;
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(3));
}

// Backend where one more view lands on a live counter right before collection settles it.
#[derive(Debug)]
struct LateViews {
    inner: Arc<MemoryStore>,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl CacheBackend for LateViews {
    fn name(&self) -> &'static str {
        "late-views"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if self.armed.load(Ordering::SeqCst) {
            for key in keys {
                self.inner.incr(key).await?;
            }
        }
        self.inner.del(keys).await
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.inner.incr(key).await
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError> {
        if self.armed.load(Ordering::SeqCst) {
            self.inner.incr(key).await?;
        }
        self.inner.decr_by(key, amount).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.inner.expire(key, ttl).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.inner.keys(pattern).await
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush().await
    }
}

struct LateViewsConnector {
    store: Arc<MemoryStore>,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl CacheConnector for LateViewsConnector {
    fn target(&self) -> String {
        "memory://late-views".into()
    }

    async fn connect(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        Ok(Arc::new(LateViews {
            inner: Arc::clone(&self.store),
            armed: Arc::clone(&self.armed),
        }))
    }
}

#[tokio::test]
async fn views_racing_collection_are_kept() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let armed = Arc::new(AtomicBool::new(false));
    let gateway = CacheGateway::start(
        Arc::new(LateViewsConnector {
            store: Arc::new(MemoryStore::default()),
            armed: Arc::clone(&armed),
        }),
        quick_gateway_settings(),
    );
    assert!(gateway.wait_until_ready(Duration::from_secs(2)).await);
    let counter = counter_for(gateway.clone(), db.store());

    for _ in 0..3 {
        counter.increment_view(films[0]).await.unwrap();
    }

    armed.store(true, Ordering::SeqCst);
    let batch_id = counter.collect_views_to_pending().await.unwrap();
    armed.store(false, Ordering::SeqCst);

    let batch: PendingBatch = gateway.get(&pending_key(&batch_id)).await.unwrap();
    assert_eq!(batch.entries.iter().map(|e| e.count).sum::<i64>(), 3);
    let live = LiveCounterKey::new(films[0], today()).to_string();
    assert_eq!(gateway.get::<i64>(&live).await, Some(1));

    let report = counter.drain(5).await;
    assert!(report.is_complete());
    assert_eq!(counter.total_views(films[0]).await.unwrap(), Some(4));
    assert!(gateway.get_keys(LIVE_KEY_PATTERN).await.is_empty());
}

#[tokio::test]
async fn collected_non_positive_counters_are_cleared() {
    let db = TestDb::new().await.unwrap();
    let films = db.add_films(1).await.unwrap();
    let (gateway, _) = memory_gateway().await;
    let counter = counter_for(gateway.clone(), db.store());

    gateway.set("views:film:9:2024-01-01", &0, None).await;
    gateway.set("views:film:oops:2024-01-01", &5, None).await;
    counter.increment_view(films[0]).await.unwrap();

    assert!(counter.collect_views_to_pending().await.is_some());
    assert!(gateway.get_keys(LIVE_KEY_PATTERN).await.is_empty());
}
