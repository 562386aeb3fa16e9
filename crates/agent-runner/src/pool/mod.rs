//! Tool connection pool
//!
//! Connections are keyed by `(session, server)`, or by server alone for
//! stateless servers. A connection is reused for as long as the transport
//! fingerprint of its descriptor stays the same.

pub mod connection;
pub mod http;
pub mod jsonrpc;
pub mod stdio;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use hub_core::session::ToolServerDescriptor;

pub use connection::{fingerprint, ConnectionInfo, ConnectionKey, PooledTool, ToolConnection};
pub use transport::{JsonRpcTransport, ToolServerClient, ToolTransport};

use crate::agent::Tool;
use crate::error::PoolError;

type Slot = Arc<Mutex<Option<Arc<ToolConnection>>>>;

pub struct ToolConnectionPool {
    transport: Arc<dyn ToolTransport>,
    slots: RwLock<HashMap<ConnectionKey, Slot>>,
    drain_timeout: Duration,
}

impl ToolConnectionPool {
    pub fn new(transport: Arc<dyn ToolTransport>, drain_timeout: Duration) -> Self {
        Self {
            transport,
            slots: RwLock::new(HashMap::new()),
            drain_timeout,
        }
    }

    /// Resolve the tools of every enabled server for a session.
    ///
    /// Servers that cannot be reached are skipped with a warning.
    pub async fn resolve(
        &self,
        session_id: &str,
        descriptors: &[ToolServerDescriptor],
    ) -> Vec<Arc<dyn Tool>> {
        let resolved = join_all(
            descriptors
                .iter()
                .filter(|d| d.enabled)
                .map(|d| self.tools_for(session_id, d)),
        )
        .await;

        let mut tools = Vec::new();
        for (descriptor, result) in descriptors.iter().filter(|d| d.enabled).zip(resolved) {
            match result {
                Ok(server_tools) => tools.extend(server_tools),
                Err(e) => warn!(
                    "Skipping tool server {} for session {}: {}",
                    descriptor.id, session_id, e
                ),
            }
        }
        tools
    }

    async fn tools_for(
        &self,
        session_id: &str,
        descriptor: &ToolServerDescriptor,
    ) -> Result<Vec<Arc<dyn Tool>>, PoolError> {
        let connection = self.connection_for(session_id, descriptor).await?;
        let catalog = match connection.catalog().await {
            Ok(catalog) => catalog,
            Err(e) => {
                self.discard(&connection).await;
                return Err(e);
            }
        };
        Ok(catalog
            .into_iter()
            .map(|spec| Arc::new(PooledTool::new(spec, Arc::clone(&connection))) as Arc<dyn Tool>)
            .collect())
    }

    /// Get the live connection for a descriptor, opening or replacing it
    /// as needed
    pub async fn connection_for(
        &self,
        session_id: &str,
        descriptor: &ToolServerDescriptor,
    ) -> Result<Arc<ToolConnection>, PoolError> {
        let key = ConnectionKey::for_descriptor(session_id, descriptor);
        let fingerprint = fingerprint(&descriptor.transport);
        let slot = self.slot(&key).await;

        // one opener per key; concurrent callers wait here and reuse
        let mut current = slot.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.fingerprint() == fingerprint && !existing.is_retired() {
                existing.touch();
                return Ok(Arc::clone(existing));
            }
        }
        if let Some(stale) = current.take() {
            info!(
                "Transport of tool server {} changed, replacing connection",
                descriptor.id
            );
            stale.retire(self.drain_timeout).await;
        }

        let client = self.transport.connect(descriptor).await?;
        let connection = Arc::new(ToolConnection::new(
            key,
            descriptor,
            fingerprint,
            client,
        ));
        *current = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Retire a connection that still occupies its slot, so the next
    /// resolve opens a fresh one
    async fn discard(&self, connection: &Arc<ToolConnection>) {
        let Some(slot) = self.slots.read().await.get(connection.key()).cloned() else {
            return;
        };
        let taken = {
            let mut current = slot.lock().await;
            let same = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection));
            if same {
                current.take()
            } else {
                None
            }
        };
        if let Some(connection) = taken {
            warn!(
                "Dropping connection to tool server {} after failed tool listing",
                connection.key().server_id
            );
            connection.retire(self.drain_timeout).await;
        }
    }

    async fn slot(&self, key: &ConnectionKey) -> Slot {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Drop connections matching the filters. `None` matches everything;
    /// a server filter without a session also covers shared connections.
    pub async fn invalidate(&self, session_id: Option<&str>, server_id: Option<&str>) -> usize {
        let removed: Vec<Slot> = {
            let mut slots = self.slots.write().await;
            let keys: Vec<ConnectionKey> = slots
                .keys()
                .filter(|k| {
                    session_id.map_or(true, |s| k.session_id.as_deref() == Some(s))
                        && server_id.map_or(true, |id| k.server_id == id)
                })
                .cloned()
                .collect();
            keys.iter().filter_map(|k| slots.remove(k)).collect()
        };

        let mut closed = 0;
        for slot in removed {
            if let Some(connection) = slot.lock().await.take() {
                connection.retire(self.drain_timeout).await;
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(
                "Invalidated {} tool connections (session {:?}, server {:?})",
                closed, session_id, server_id
            );
        }
        closed
    }

    /// Close connections unused for longer than `idle_timeout`
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let slots: Vec<(ConnectionKey, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut swept = 0;
        for (key, slot) in slots {
            // a busy slot is being opened or replaced right now
            let Ok(mut current) = slot.try_lock() else {
                continue;
            };
            let idle = current
                .as_ref()
                .is_some_and(|c| c.in_flight() == 0 && c.idle_for() > idle_timeout);
            if !idle {
                continue;
            }
            if let Some(connection) = current.take() {
                info!(
                    "Closing idle connection to tool server {} ({:?})",
                    key.server_id, key.session_id
                );
                connection.retire(self.drain_timeout).await;
                swept += 1;
            }
            drop(current);

            let mut map = self.slots.write().await;
            if map.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                map.remove(&key);
            }
        }
        swept
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut infos = Vec::new();
        for slot in slots {
            if let Some(connection) = slot.lock().await.as_ref() {
                infos.push(connection.info());
            }
        }
        infos
    }

    pub async fn connection_count(&self) -> usize {
        self.connections().await.len()
    }
}
