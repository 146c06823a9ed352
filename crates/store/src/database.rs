//! Database connection handling.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectOptions, Database as SeaOrmDatabase, DatabaseConnection};
use tracing::{info, warn};

use crate::error::{Result, StoreError};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connection wrapper shared by the store and the schedulers.
#[derive(Clone)]
pub struct Database {
    connection: Arc<DatabaseConnection>,
}

impl Database {
    /// Connect with pooling tuned for many short statements, retrying a
    /// bounded number of times before giving up.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let mut opt = ConnectOptions::new(database_url.to_string());
            opt.max_connections(50)
                .min_connections(2)
                .connect_timeout(Duration::from_secs(10))
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(300))
                .max_lifetime(Duration::from_secs(3600))
                .sqlx_logging(false)
                .sqlx_slow_statements_logging_settings(
                    tracing::log::LevelFilter::Warn,
                    Duration::from_millis(500),
                );

            match SeaOrmDatabase::connect(opt).await {
                Ok(connection) => {
                    info!("connected to database with pooled connections");
                    return Ok(Self {
                        connection: Arc::new(connection),
                    });
                }
                Err(e) if attempts < MAX_CONNECT_ATTEMPTS => {
                    warn!(
                        "failed to connect to database (attempt {}/{}): {}",
                        attempts, MAX_CONNECT_ATTEMPTS, e
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(StoreError::Connection {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }

    /// Wrap an already-established connection. Tests use this with SQLite.
    pub fn from_connection(connection: DatabaseConnection) -> Self {
        Self {
            connection: Arc::new(connection),
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
