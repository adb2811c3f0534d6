pub mod pooled;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;

use crate::error::StoreError;

#[async_trait]
pub trait DatabaseDriver: Debug + Sync + Send + 'static {
    fn name(&self) -> &'static str;
    fn connection(&self) -> DatabaseConnection;
    /// Per-backend session tuning, run once after connecting.
    async fn configure(&self) -> Result<(), StoreError>;
}

/// Connect to a database by URL and configure the session.
///
/// SQLite URLs get the dedicated driver when the `sqlite` feature is enabled; anything else goes through a plain
/// connection pool. The backend itself must be enabled with the matching cargo feature.
pub async fn connect(url: &str, max_connections: u32) -> Result<Arc<dyn DatabaseDriver>, StoreError> {
    let driver = open(url, max_connections).await?;
    driver.configure().await?;
    Ok(driver)
}

#[cfg(feature = "sqlite")]
async fn open(url: &str, max_connections: u32) -> Result<Arc<dyn DatabaseDriver>, StoreError> {
    if url.starts_with("sqlite:") {
        Ok(Arc::new(sqlite::Sqlite::connect_url(url).await?))
    }
    else {
        Ok(Arc::new(pooled::Pooled::connect(url, max_connections).await?))
    }
}

#[cfg(not(feature = "sqlite"))]
async fn open(url: &str, max_connections: u32) -> Result<Arc<dyn DatabaseDriver>, StoreError> {
    Ok(Arc::new(pooled::Pooled::connect(url, max_connections).await?))
}
