//! The `wb-viewcount` service: wires the cache gateway, the store, the view counter and the scheduler together and runs
//! them until interrupted.
use std::future::Future;
use std::sync::Arc;

use clap::Parser;
use sea_orm_migration::MigratorTrait;
use tracing::info;
use tracing::warn;

use crate::config::AppConfig;
use crate::error::Result;
use crate::error::ViewCountError;
use crate::gateway::resolve_cache_target;
use crate::gateway::CacheGateway;
use crate::scheduler::Scheduler;
use crate::store::driver;
use crate::store::migrations::Migrator;
use crate::store::DbViewStore;
use crate::view_counter::ViewCounter;

#[derive(Debug)]
pub struct ViewCountApp {
    config: AppConfig,
}

impl ViewCountApp {
    /// Parse the command line, set up logging and serve until Ctrl-C or SIGTERM.
    pub async fn run() -> Result<()> {
        let app = Self::new(AppConfig::parse())?;
        app.setup_tracing()?;
        app.execute(shutdown_signal()).await
    }

    pub fn new(config: AppConfig) -> Result<Self> {
        config.check()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn setup_tracing(&self) -> Result<()> {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let (file_layer, stderr_layer) = match self.config.log_file() {
            Some(log_file) => {
                let file = std::fs::OpenOptions::new().create(true).append(true).open(log_file)?;
                (
                    Some(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(std::sync::Mutex::new(file)),
                    ),
                    None,
                )
            }
            None => (None, Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init()
            .map_err(|err| ViewCountError::Config(format!("cannot initialize tracing: {err}")))?;

        info!("Tracing initialized");
        Ok(())
    }

    /// Run the pipeline until `shutdown` resolves, then stop gracefully: triggers first, then a final drain, then the
    /// cache connection.
    pub async fn execute(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let config = &self.config;

        let db = driver::connect(&config.database_url(), config.db_max_connections()).await?;
        info!("Using {} database", db.name());

        if config.migrate() {
            Migrator::up(&db.connection(), None)
                .await
                .map_err(ViewCountError::Migration)?;
            info!("Database migrations applied");
        }

        let gateway_settings = config.gateway_settings()?;
        let ready_timeout = gateway_settings.connect_timeout();
        let target = resolve_cache_target(config.redis_url().as_deref(), &config.environment());
        let gateway = CacheGateway::from_target(target.as_deref(), gateway_settings);
        if target.is_some() && !gateway.wait_until_ready(ready_timeout).await {
            warn!(state = ?gateway.state(), "Cache not ready yet; views go to the database until it is");
        }

        let store = Arc::new(DbViewStore::new(db.connection()));
        let counter = Arc::new(ViewCounter::new(Arc::clone(&gateway), store, config.counter_settings()?));
        let scheduler = Scheduler::start(Arc::clone(&counter), config.scheduler_settings()?);

        info!(environment = %config.environment(), "wb-viewcount is running");
        shutdown.await;
        info!("Shutting down");

        let report = scheduler.shutdown().await;
        gateway.close().await;

        info!(
            batches_flushed = report.batches_flushed,
            remaining = report.remaining,
            "wb-viewcount stopped"
        );
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
