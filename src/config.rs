//! Command line and environment configuration of the `wb-viewcount` service.
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use clap::ArgAction;
use fieldx::fxstruct;
use garde::Validate;

use crate::error::Result;
use crate::error::ViewCountError;
use crate::gateway::GatewaySettings;
use crate::scheduler::SchedulerSettings;
use crate::view_counter::CounterSettings;

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, author, name = "wb-viewcount")]
pub struct AppConfig {
    /// Cache server URL. Without it, only development environments use a local default.
    #[clap(long, env = "REDIS_URL")]
    #[fieldx(get(clone))]
    #[garde(skip)]
    redis_url: Option<String>,

    /// Deployment environment name.
    #[clap(long = "env", env = "APP_ENV", default_value = "development")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    environment: String,

    /// Database URL; `sqlite://`, `postgres://` and `mysql://` are understood with the matching features.
    #[clap(long, env = "DATABASE_URL", default_value = "sqlite://wb-viewcount.db?mode=rwc")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    database_url: String,

    #[clap(long, env = "WBVC_DB_MAX_CONNECTIONS", default_value_t = 10)]
    #[garde(range(min = 1))]
    db_max_connections: u32,

    /// Apply pending migrations on start-up.
    #[clap(long, env = "WBVC_MIGRATE", default_value_t = true, action = ArgAction::Set)]
    #[garde(skip)]
    migrate: bool,

    #[clap(long, env = "WBVC_COLLECT_INTERVAL_SECS", default_value_t = 300)]
    #[garde(range(min = 1))]
    collect_interval_secs: u64,

    #[clap(long, env = "WBVC_PROCESS_INTERVAL_SECS", default_value_t = 120)]
    #[garde(range(min = 1))]
    process_interval_secs: u64,

    #[clap(long, env = "WBVC_RECOVER_INTERVAL_SECS", default_value_t = 3600)]
    #[garde(range(min = 1))]
    recover_interval_secs: u64,

    /// Timeout of a single cache call.
    #[clap(long, env = "WBVC_CACHE_OP_TIMEOUT_MS", default_value_t = 2000)]
    #[garde(range(min = 1))]
    cache_op_timeout_ms: u64,

    /// Timeout of a single database operation, a batch flush included.
    #[clap(long, env = "WBVC_STORE_TIMEOUT_SECS", default_value_t = 10)]
    #[garde(range(min = 1))]
    store_timeout_secs: u64,

    #[clap(long, env = "WBVC_RECONNECT_BASE_MS", default_value_t = 500)]
    #[garde(range(min = 1), custom(Self::less_than("reconnect-cap-ms", &self.reconnect_cap_ms)))]
    reconnect_base_ms: u64,

    #[clap(long, env = "WBVC_RECONNECT_CAP_MS", default_value_t = 30_000)]
    #[garde(range(min = 1))]
    reconnect_cap_ms: u64,

    /// Cache reconnection attempts before giving up until restart.
    #[clap(long, env = "WBVC_RECONNECT_ATTEMPTS", default_value_t = 10)]
    #[garde(range(min = 1))]
    reconnect_attempts: u32,

    /// Write logs into this file instead of stderr.
    #[clap(long, env = "WBVC_LOG_FILE")]
    #[fieldx(get(clone))]
    #[garde(skip)]
    log_file: Option<PathBuf>,
}

impl AppConfig {
    fn less_than<'a, T: PartialOrd + Display>(
        max_name: &'static str,
        max: &'a T,
    ) -> impl FnOnce(&'a T, &()) -> garde::Result {
        move |value, _| {
            if value > max {
                Err(garde::Error::new(format!("{} is more than {max_name} ({})", *value, *max)))
            }
            else {
                Ok(())
            }
        }
    }

    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|err| ViewCountError::Config(err.to_string()))
    }

    pub fn gateway_settings(&self) -> Result<GatewaySettings> {
        GatewaySettings::builder()
            .op_timeout(Duration::from_millis(self.cache_op_timeout_ms))
            .reconnect_base(Duration::from_millis(self.reconnect_base_ms))
            .reconnect_cap(Duration::from_millis(self.reconnect_cap_ms))
            .max_reconnect_attempts(self.reconnect_attempts)
            .build()
            .map_err(|err| ViewCountError::Config(err.to_string()))
    }

    pub fn counter_settings(&self) -> Result<CounterSettings> {
        CounterSettings::builder()
            .store_timeout(Duration::from_secs(self.store_timeout_secs))
            .build()
            .map_err(|err| ViewCountError::Config(err.to_string()))
    }

    pub fn scheduler_settings(&self) -> Result<SchedulerSettings> {
        SchedulerSettings::builder()
            .collect_interval(Duration::from_secs(self.collect_interval_secs))
            .process_interval(Duration::from_secs(self.process_interval_secs))
            .recover_interval(Duration::from_secs(self.recover_interval_secs))
            .build()
            .map_err(|err| ViewCountError::Config(err.to_string()))
    }
}
