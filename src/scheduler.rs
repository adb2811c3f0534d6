//! Periodic triggers driving the pipeline.
//!
//! Three independent tasks share one [`ViewCounter`]: *collect* turns live counters into pending batches, *process*
//! flushes pending batches, and *recover* does the same as process on a slow cadence to pick up anything left behind,
//! including batches from a previous run of the process. Recover also fires once right at start-up. When process and
//! recover run at the same time, each pending batch is still flushed by only one of them.
//!
//! A trigger run never fails; problems are logged and counted in [`SchedulerMetrics`] and the next tick tries again.
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fieldx::fxstruct;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::view_counter::DrainReport;
use crate::view_counter::ViewCounter;

#[derive(Clone, Debug)]
#[fxstruct(sync, no_new, default, builder, get(copy))]
pub struct SchedulerSettings {
    #[fieldx(default(Duration::from_secs(5 * 60)))]
    collect_interval: Duration,

    #[fieldx(default(Duration::from_secs(2 * 60)))]
    process_interval: Duration,

    #[fieldx(default(Duration::from_secs(60 * 60)))]
    recover_interval: Duration,

    /// Upper bound for flushing one pending batch.
    #[fieldx(default(Duration::from_secs(60)))]
    batch_timeout: Duration,

    /// Collect/process rounds of the final drain on shutdown.
    #[fieldx(default(5))]
    drain_rounds: u32,

    #[fieldx(default(true))]
    recover_on_start: bool,
}

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub collect_runs:    AtomicU64,
    pub process_runs:    AtomicU64,
    pub recover_runs:    AtomicU64,
    pub batches_created: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batch_failures:  AtomicU64,
    pub batch_timeouts:  AtomicU64,
}

impl SchedulerMetrics {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            collect_runs:    self.collect_runs.load(Ordering::Relaxed),
            process_runs:    self.process_runs.load(Ordering::Relaxed),
            recover_runs:    self.recover_runs.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batch_failures:  self.batch_failures.load(Ordering::Relaxed),
            batch_timeouts:  self.batch_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub collect_runs:    u64,
    pub process_runs:    u64,
    pub recover_runs:    u64,
    pub batches_created: u64,
    pub batches_flushed: u64,
    pub batch_failures:  u64,
    pub batch_timeouts:  u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Collect,
    Process,
    Recover,
}

impl Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Trigger::Collect => "collect",
            Trigger::Process => "process",
            Trigger::Recover => "recover",
        })
    }
}

/// One collect run.
pub async fn run_collect_once(counter: &ViewCounter, metrics: &SchedulerMetrics) -> Option<String> {
    metrics.collect_runs.fetch_add(1, Ordering::Relaxed);

    let batch_id = counter.collect_views_to_pending().await;
    match &batch_id {
        Some(batch_id) => {
            metrics.batches_created.fetch_add(1, Ordering::Relaxed);
            info!(batch_id = %batch_id, "Live counters collected");
        }
        None => debug!("Nothing collected"),
    }
    batch_id
}

/// One process run: flush every pending batch, one at a time. Returns the number of flushed batches.
pub async fn run_process_once(counter: &ViewCounter, settings: &SchedulerSettings, metrics: &SchedulerMetrics) -> u64 {
    metrics.process_runs.fetch_add(1, Ordering::Relaxed);
    flush_pending(counter, settings, metrics).await
}

/// One recover run. Same as processing, counted separately.
pub async fn run_recover_once(counter: &ViewCounter, settings: &SchedulerSettings, metrics: &SchedulerMetrics) -> u64 {
    metrics.recover_runs.fetch_add(1, Ordering::Relaxed);
    let flushed = flush_pending(counter, settings, metrics).await;
    if flushed > 0 {
        info!(flushed, "Recovered leftover pending batches");
    }
    flushed
}

async fn flush_pending(counter: &ViewCounter, settings: &SchedulerSettings, metrics: &SchedulerMetrics) -> u64 {
    let batch_ids = counter.get_pending_batches().await;
    let mut flushed = 0;

    for batch_id in &batch_ids {
        match tokio::time::timeout(settings.batch_timeout(), counter.try_process_pending_batch(batch_id)).await {
            Ok(None) => debug!(batch_id = %batch_id, "Skipped; another trigger is flushing it"),
            Ok(Some(true)) => {
                flushed += 1;
                metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(false)) => {
                metrics.batch_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                metrics.batch_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(batch_id = %batch_id, "Pending batch flush timed out after {:?}", settings.batch_timeout());
            }
        }
    }

    if !batch_ids.is_empty() {
        debug!(pending = batch_ids.len(), flushed, "Pending batches processed");
    }
    flushed
}

/// Owner of the three trigger tasks.
#[derive(Debug)]
pub struct Scheduler {
    counter:  Arc<ViewCounter>,
    settings: SchedulerSettings,
    metrics:  Arc<SchedulerMetrics>,
    shutdown: watch::Sender<bool>,
    tasks:    Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the triggers. Must be called within a tokio runtime.
    pub fn start(counter: Arc<ViewCounter>, settings: SchedulerSettings) -> Self {
        let metrics = Arc::new(SchedulerMetrics::default());
        let (shutdown, _) = watch::channel(false);

        let tasks: Vec<JoinHandle<()>> = [
            (Trigger::Collect, settings.collect_interval(), false),
            (Trigger::Process, settings.process_interval(), false),
            (Trigger::Recover, settings.recover_interval(), settings.recover_on_start()),
        ]
        .into_iter()
        .map(|(trigger, period, immediate)| {
            tokio::spawn(Self::trigger_loop(
                trigger,
                period,
                immediate,
                Arc::clone(&counter),
                settings.clone(),
                Arc::clone(&metrics),
                shutdown.subscribe(),
            ))
        })
        .collect();

        info!(
            collect_secs = settings.collect_interval().as_secs(),
            process_secs = settings.process_interval().as_secs(),
            recover_secs = settings.recover_interval().as_secs(),
            "Scheduler started"
        );

        Self {
            counter,
            settings,
            metrics,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Stop the triggers, waiting for runs in progress, then drain whatever is still in the cache.
    #[instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self) -> DrainReport {
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!("Trigger task ended abnormally: {err}");
            }
        }

        let report = self.counter.drain(self.settings.drain_rounds()).await;
        if report.is_complete() {
            info!(?report, "Scheduler stopped");
        }
        else {
            warn!(?report, "Scheduler stopped with pending batches left in the cache");
        }
        report
    }

    async fn trigger_loop(
        trigger: Trigger,
        period: Duration,
        immediate: bool,
        counter: Arc<ViewCounter>,
        settings: SchedulerSettings,
        metrics: Arc<SchedulerMetrics>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let start = if immediate { Instant::now() } else { Instant::now() + period };
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(%trigger, "Trigger started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match trigger {
                        Trigger::Collect => {
                            run_collect_once(&counter, &metrics).await;
                        }
                        Trigger::Process => {
                            run_process_once(&counter, &settings, &metrics).await;
                        }
                        Trigger::Recover => {
                            run_recover_once(&counter, &settings, &metrics).await;
                        }
                    }
                }
            }
        }
        debug!(%trigger, "Trigger stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
