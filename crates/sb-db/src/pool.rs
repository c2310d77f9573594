//! Pooled MySQL connections with an idle keepalive ping.

use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Connection;
use std::env;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::DbError;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Connection settings for one database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    /// The internal (destination) database: `DB_IP`/`DB_USER`/`DB_PASS`/`DB`.
    pub fn internal_from_env() -> DbConfig {
        DbConfig {
            host: env::var("DB_IP").unwrap_or_else(|_| "database".to_owned()),
            user: env::var("DB_USER").unwrap_or_else(|_| "test".to_owned()),
            password: env::var("DB_PASS").unwrap_or_else(|_| "test".to_owned()),
            database: env::var("DB").unwrap_or_else(|_| "api_data".to_owned()),
        }
    }

    /// The external (read-only source) database: `A801_*`.
    pub fn source_from_env() -> DbConfig {
        DbConfig {
            host: env::var("A801_IP").unwrap_or_else(|_| "mockupdb".to_owned()),
            user: env::var("A801_USER").unwrap_or_else(|_| "test".to_owned()),
            password: env::var("A801_PASS").unwrap_or_else(|_| "test".to_owned()),
            database: env::var("A801_DB").unwrap_or_else(|_| "atelier801_api".to_owned()),
        }
    }

    fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:3306/{}",
            self.user, self.password, self.host, self.database
        )
    }
}

/// A pooled database handle.
#[derive(Clone)]
pub struct Db {
    pool: MySqlPool,
    database: String,
}

impl Db {
    pub async fn connect(config: &DbConfig) -> Result<Db, DbError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(&config.url())
            .await?;
        Ok(Db {
            pool,
            database: config.database.clone(),
        })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// The schema name this pool is connected to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Ping an idle connection every 60 seconds so the server never reaps
    /// the pool out from under a quiet service.
    pub fn spawn_keepalive(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            loop {
                sleep(KEEPALIVE_PERIOD).await;
                match pool.acquire().await {
                    Ok(mut conn) => {
                        if let Err(err) = conn.ping().await {
                            warn!(error = %err, "database keepalive ping failed");
                        } else {
                            debug!("database keepalive ping ok");
                        }
                    }
                    Err(err) => warn!(error = %err, "database keepalive acquire failed"),
                }
            }
        })
    }
}
