use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::pagination::DriverError;
use crate::profiles::ConnectionProfile;
use crate::query_runner::{ExecutionLimits, QueryBackend, QueryRunner};
use crate::schema_cache::{SchemaBackendError, SchemaCatalog};

#[async_trait]
pub trait Connection: Send + Sync {
    fn adapter_name(&self) -> &str;

    fn database_name(&self) -> Option<&str>;

    fn query_backend(&self) -> Arc<dyn QueryBackend>;

    async fn ping(&self) -> Result<(), DriverError>;

    async fn fetch_schema(&self) -> Result<SchemaCatalog, SchemaBackendError>;

    async fn disconnect(&self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, profile: &ConnectionProfile)
        -> Result<Arc<dyn Connection>, DriverError>;
}

#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("connection manager is not connected")]
    NotConnected,
    #[error("connection backend failed: {0}")]
    Backend(#[source] DriverError),
}

/// Connects and pings once; the round trip is reported as the connection latency.
pub async fn establish(
    connector: &dyn Connector,
    profile: &ConnectionProfile,
) -> Result<(Arc<dyn Connection>, Duration), ConnectionManagerError> {
    let started_at = Instant::now();
    let connection = connector
        .connect(profile)
        .await
        .map_err(ConnectionManagerError::Backend)?;
    if let Err(error) = connection.ping().await {
        if let Err(disconnect_error) = connection.disconnect().await {
            debug!(error = %disconnect_error, "disconnect after failed ping failed");
        }
        return Err(ConnectionManagerError::Backend(error));
    }
    Ok((connection, started_at.elapsed()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub profile_name: Option<String>,
    pub target: Option<String>,
    pub adapter_name: Option<String>,
    pub database_name: Option<String>,
    pub is_connected: bool,
    pub last_latency: Option<Duration>,
    pub connected_at: Option<SystemTime>,
}

impl ConnectionStatus {
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            profile_name: None,
            target: None,
            adapter_name: None,
            database_name: None,
            is_connected: false,
            last_latency: None,
            connected_at: None,
        }
    }
}

struct ActiveConnection {
    profile: ConnectionProfile,
    connection: Arc<dyn Connection>,
    runner: Arc<QueryRunner>,
    latency: Duration,
    connected_at: SystemTime,
}

/// Holds the one active connection and the query runner bound to it.
pub struct ConnectionManager {
    limits: ExecutionLimits,
    active: Option<ActiveConnection>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ExecutionLimits::default())
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            active: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let Some(active) = &self.active else {
            return ConnectionStatus::disconnected();
        };
        ConnectionStatus {
            profile_name: Some(active.profile.name.clone()),
            target: Some(active.profile.display_target()),
            adapter_name: Some(active.connection.adapter_name().to_string()),
            database_name: active.connection.database_name().map(str::to_string),
            is_connected: true,
            last_latency: Some(active.latency),
            connected_at: Some(active.connected_at),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn active_profile(&self) -> Option<&ConnectionProfile> {
        self.active.as_ref().map(|active| &active.profile)
    }

    #[must_use]
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.active
            .as_ref()
            .map(|active| Arc::clone(&active.connection))
    }

    pub fn runner(&self) -> Result<Arc<QueryRunner>, ConnectionManagerError> {
        self.active
            .as_ref()
            .map(|active| Arc::clone(&active.runner))
            .ok_or(ConnectionManagerError::NotConnected)
    }

    /// Installs `connection` as the active one. The caller must already have
    /// torn the previous connection down with [`Self::detach`].
    pub fn install(
        &mut self,
        profile: ConnectionProfile,
        connection: Arc<dyn Connection>,
        latency: Duration,
    ) {
        let runner = Arc::new(QueryRunner::with_limits(
            connection.query_backend(),
            self.limits,
        ));
        info!(
            profile = %profile.name,
            adapter = connection.adapter_name(),
            strategy = runner.paging_strategy().label(),
            latency_ms = latency.as_millis() as u64,
            "connection installed"
        );
        self.active = Some(ActiveConnection {
            profile,
            connection,
            runner,
            latency,
            connected_at: SystemTime::now(),
        });
    }

    /// Removes the active connection after cancelling its running executions.
    /// Returns the connection so the caller can disconnect it off the loop.
    pub fn detach(&mut self) -> Option<Arc<dyn Connection>> {
        let active = self.active.take()?;
        active.runner.cancel_all();
        info!(profile = %active.profile.name, "connection detached");
        Some(active.connection)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("limits", &self.limits)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{establish, ConnectionManager, ConnectionManagerError, ConnectionStatus};
    use crate::pagination::DriverError;
    use crate::profiles::{ConnectionProfile, Engine};
    use crate::testing::{MemoryConnection, MemoryConnector};

    fn sample_profile() -> ConnectionProfile {
        ConnectionProfile::new("local", Engine::Mysql, "127.0.0.1", "root")
    }

    #[tokio::test]
    async fn establish_reports_latency_and_pings_once() {
        let connector = MemoryConnector::new(10);
        let (connection, latency) = establish(&connector, &sample_profile())
            .await
            .expect("connect should succeed");

        assert!(latency >= Duration::ZERO);
        assert_eq!(connection.adapter_name(), "memory");
        assert_eq!(connector.connections()[0].ping_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_connect_surfaces_backend_error() {
        let connector = MemoryConnector::new(10);
        connector.fail_next(DriverError::new("access denied for user"));

        let Err(error) = establish(&connector, &sample_profile()).await else {
            panic!("connect should fail");
        };
        assert!(matches!(error, ConnectionManagerError::Backend(_)));
    }

    #[tokio::test]
    async fn failed_ping_disconnects_and_reports_the_ping_error() {
        let connector = MemoryConnector::new(10);
        connector.fail_next_ping(DriverError::new("server has gone away"));

        let Err(error) = establish(&connector, &sample_profile()).await else {
            panic!("ping should fail");
        };
        assert!(matches!(
            &error,
            ConnectionManagerError::Backend(inner) if inner.to_string().contains("gone away")
        ));

        let connection = &connector.connections()[0];
        assert_eq!(connection.ping_calls.load(Ordering::SeqCst), 1);
        assert_eq!(connection.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn install_updates_status_and_exposes_runner() {
        let mut manager = ConnectionManager::default();
        assert!(matches!(
            manager.runner(),
            Err(ConnectionManagerError::NotConnected)
        ));

        let connection = Arc::new(MemoryConnection::new(10));
        manager.install(sample_profile(), connection, Duration::from_millis(3));

        let status = manager.status();
        assert!(status.is_connected);
        assert_eq!(status.profile_name.as_deref(), Some("local"));
        assert_eq!(status.adapter_name.as_deref(), Some("memory"));
        assert_eq!(status.database_name.as_deref(), Some("fixtures"));
        assert_eq!(status.last_latency, Some(Duration::from_millis(3)));
        assert_eq!(
            manager.runner().expect("runner").adapter_name(),
            "memory"
        );
    }

    #[test]
    fn detach_clears_status_and_is_idempotent() {
        let mut manager = ConnectionManager::default();
        manager.install(
            sample_profile(),
            Arc::new(MemoryConnection::new(1)),
            Duration::ZERO,
        );

        assert!(manager.detach().is_some());
        assert!(manager.detach().is_none());
        assert_eq!(manager.status(), ConnectionStatus::disconnected());
    }
}
