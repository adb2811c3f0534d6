use std::time::Duration;

use async_trait::async_trait;
use fieldx::fxstruct;
use sea_orm::ConnectOptions;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseBackend;
use sea_orm::DatabaseConnection;
use tracing::debug;
use tracing::error;

use super::DatabaseDriver;
use crate::error::StoreError;

/// Pooled connection to a server database (PostgreSQL, MySQL/MariaDB) or anything else `sea_orm` accepts by URL.
#[derive(Debug)]
#[fxstruct(sync, no_new)]
pub struct Pooled {
    connection: DatabaseConnection,
}

impl Pooled {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let mut opts = ConnectOptions::new(url);
        opts.max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(60))
            .max_lifetime(Duration::from_secs(30 * 60))
            .test_before_acquire(true);

        let connection = sea_orm::Database::connect(opts)
            .await
            .inspect_err(|e| error!("Error connecting to database: {e}"))?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl DatabaseDriver for Pooled {
    fn name(&self) -> &'static str {
        match self.connection.get_database_backend() {
            DatabaseBackend::Postgres => "postgres",
            DatabaseBackend::MySql => "mysql",
            _ => "sqlite",
        }
    }

    fn connection(&self) -> DatabaseConnection {
        self.connection.clone()
    }

    async fn configure(&self) -> Result<(), StoreError> {
        // Session settings would only reach one pooled connection; server-side defaults apply.
        self.connection.ping().await?;
        debug!("Connected to {} database", self.name());
        Ok(())
    }
}
