use std::ops::Deref;
use std::path::Path;

use async_trait::async_trait;
use fieldx::fxstruct;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseConnection;
use tracing::error;

use super::DatabaseDriver;
use crate::error::StoreError;

#[derive(Debug)]
#[fxstruct(sync, no_new)]
pub struct Sqlite {
    connection: DatabaseConnection,
}

impl Sqlite {
    /// Open (creating if needed) a database file.
    pub async fn connect(db_path: &Path) -> Result<Self, StoreError> {
        Self::connect_url(&format!("sqlite://{}?mode=rwc", db_path.display())).await
    }

    pub async fn connect_url(url: &str) -> Result<Self, StoreError> {
        let connection = sea_orm::Database::connect(url)
            .await
            .inspect_err(|e| error!("Error connecting to database {url}: {e}"))?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl DatabaseDriver for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn connection(&self) -> DatabaseConnection {
        self.connection.clone()
    }

    async fn configure(&self) -> Result<(), StoreError> {
        let db = &self.connection;

        db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
        db.execute_unprepared("PRAGMA synchronous=NORMAL;").await?;
        db.execute_unprepared("PRAGMA foreign_keys=ON;").await?;

        Ok(())
    }
}

impl Deref for Sqlite {
    type Target = DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}
