pub mod credentials;
pub mod export;
pub mod mysql;
pub mod postgres;
mod schema;

use std::sync::Arc;

use async_trait::async_trait;
use tidal_core::connection_manager::{Connection, Connector};
use tidal_core::pagination::DriverError;
use tidal_core::profiles::{ConnectionProfile, Engine};

use crate::mysql::MysqlConnector;
use crate::postgres::PostgresConnector;

/// How both drivers render SQL NULL in a text row.
pub const NULL_TEXT: &str = "NULL";

/// Connects through the driver that matches the profile's engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConnector {
    mysql: MysqlConnector,
    postgres: PostgresConnector,
}

#[async_trait]
impl Connector for EngineConnector {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        match profile.engine {
            Engine::Mysql => self.mysql.connect(profile).await,
            Engine::Postgres => self.postgres.connect(profile).await,
        }
    }
}

#[must_use]
pub fn adapter_name() -> &'static str {
    "tidal-adapters"
}
