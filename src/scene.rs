use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use uuid::Uuid;
use crate::connection::Connection;

/// The simulation side of a region. A scene learns about connections through these calls and
///  subscribes to their decoded client events (see [Connection::events]).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scene: Send + Sync + 'static {
    /// called once, when the connection's circuit was authenticated
    async fn add_connection(&self, connection: Arc<Connection>);

    /// called once, when the connection is closed
    async fn remove_connection(&self, agent_id: Uuid);
}
