//! A pooled connection to one tool server

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use hub_core::session::{ToolServerDescriptor, TransportConfig};

use super::transport::ToolServerClient;
use crate::agent::{Tool, ToolOutput, ToolSpec};
use crate::error::PoolError;

/// Identity of a pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    /// Owning session; `None` for stateless servers shared by everyone
    pub session_id: Option<String>,
    pub server_id: String,
}

impl ConnectionKey {
    pub fn for_descriptor(session_id: &str, descriptor: &ToolServerDescriptor) -> Self {
        Self {
            session_id: if descriptor.stateless {
                None
            } else {
                Some(session_id.to_string())
            },
            server_id: descriptor.id.clone(),
        }
    }
}

/// Hash of the transport settings; a change means the connection is stale
pub fn fingerprint(transport: &TransportConfig) -> String {
    let encoded = serde_json::to_vec(transport).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// Summary of a live connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub session_id: Option<String>,
    pub server_id: String,
    pub destination: String,
    pub in_flight: usize,
    pub idle_secs: u64,
}

pub struct ToolConnection {
    key: ConnectionKey,
    destination: String,
    fingerprint: String,
    client: Arc<dyn ToolServerClient>,
    catalog: OnceCell<Vec<ToolSpec>>,
    last_used: StdMutex<Instant>,
    in_flight: AtomicUsize,
    retired: AtomicBool,
    drained: Notify,
}

impl ToolConnection {
    pub fn new(
        key: ConnectionKey,
        descriptor: &ToolServerDescriptor,
        fingerprint: String,
        client: Arc<dyn ToolServerClient>,
    ) -> Self {
        Self {
            key,
            destination: descriptor.transport.destination().to_string(),
            fingerprint,
            client,
            catalog: OnceCell::new(),
            last_used: StdMutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            session_id: self.key.session_id.clone(),
            server_id: self.key.server_id.clone(),
            destination: self.destination.clone(),
            in_flight: self.in_flight(),
            idle_secs: self.idle_for().as_secs(),
        }
    }

    /// Tool catalog, fetched once per connection
    pub async fn catalog(&self) -> Result<Vec<ToolSpec>, PoolError> {
        let tools = self
            .catalog
            .get_or_try_init(|| self.client.list_tools())
            .await?;
        Ok(tools.clone())
    }

    /// Call a tool, unless the connection has been retired
    pub async fn call(&self, name: &str, input: Value) -> Result<ToolOutput, PoolError> {
        // count first, then check: `retire` sees either the count or the flag
        let _guard = InFlight::enter(self);
        if self.is_retired() {
            return Err(PoolError::Retired {
                server_id: self.key.server_id.clone(),
            });
        }
        self.touch();
        let result = self.client.call_tool(name, input).await;
        self.touch();
        result
    }

    /// Stop accepting calls and close once in-flight calls are done.
    ///
    /// Closes inline when nothing is in flight; otherwise a background task
    /// waits up to `drain_timeout` before closing anyway.
    pub async fn retire(self: Arc<Self>, drain_timeout: Duration) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.in_flight() == 0 {
            self.close().await;
            return;
        }

        info!(
            "Draining {} in-flight calls on tool server {}",
            self.in_flight(),
            self.key.server_id
        );
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + drain_timeout;
            loop {
                let notified = self.drained.notified();
                if self.in_flight() == 0 {
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    warn!(
                        "Tool server {} still had {} calls after drain timeout, closing",
                        self.key.server_id,
                        self.in_flight()
                    );
                    break;
                }
            }
            self.close().await;
        });
    }

    async fn close(&self) {
        debug!(
            "Closing connection to tool server {} ({:?})",
            self.key.server_id, self.key.session_id
        );
        self.client.close().await;
    }
}

struct InFlight<'a> {
    connection: &'a ToolConnection,
}

impl<'a> InFlight<'a> {
    fn enter(connection: &'a ToolConnection) -> Self {
        connection.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { connection }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.connection.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.connection.drained.notify_waiters();
        }
    }
}

/// A tool from a pooled connection
pub struct PooledTool {
    spec: ToolSpec,
    connection: Arc<ToolConnection>,
}

impl PooledTool {
    pub fn new(spec: ToolSpec, connection: Arc<ToolConnection>) -> Self {
        Self { spec, connection }
    }
}

#[async_trait]
impl Tool for PooledTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, _invocation_id: &str, input: Value) -> anyhow::Result<ToolOutput> {
        Ok(self.connection.call(&self.spec.name, input).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClient, FakeTransportLog};
    use std::collections::BTreeMap;

    fn descriptor(url: &str) -> ToolServerDescriptor {
        ToolServerDescriptor::new(
            "search",
            TransportConfig::Http {
                url: url.to_string(),
                headers: BTreeMap::new(),
            },
        )
    }

    fn connection(log: &FakeTransportLog, delay: Duration) -> Arc<ToolConnection> {
        let d = descriptor("http://a");
        let client = Arc::new(FakeClient::new(&d, log.clone()).with_call_delay(delay));
        Arc::new(ToolConnection::new(
            ConnectionKey::for_descriptor("s1", &d),
            &d,
            fingerprint(&d.transport),
            client,
        ))
    }

    #[test]
    fn test_fingerprint_tracks_transport() {
        let a = descriptor("http://a");
        let b = descriptor("http://b");
        assert_eq!(fingerprint(&a.transport), fingerprint(&a.clone().transport));
        assert_ne!(fingerprint(&a.transport), fingerprint(&b.transport));
        assert_eq!(fingerprint(&a.transport).len(), 64);
    }

    #[test]
    fn test_stateless_key_is_global() {
        let d = descriptor("http://a");
        assert_eq!(
            ConnectionKey::for_descriptor("s1", &d).session_id.as_deref(),
            Some("s1")
        );
        assert_eq!(ConnectionKey::for_descriptor("s1", &d.stateless()).session_id, None);
    }

    #[tokio::test]
    async fn test_catalog_fetched_once() {
        let log = FakeTransportLog::default();
        let conn = connection(&log, Duration::ZERO);
        assert_eq!(conn.catalog().await.unwrap().len(), 1);
        assert_eq!(conn.catalog().await.unwrap().len(), 1);
        assert_eq!(log.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_retired_connection_rejects_calls() {
        let log = FakeTransportLog::default();
        let conn = connection(&log, Duration::ZERO);
        Arc::clone(&conn).retire(Duration::from_secs(1)).await;

        assert!(conn.is_retired());
        assert_eq!(log.closes(), 1);
        assert!(matches!(
            conn.call("search", Value::Null).await,
            Err(PoolError::Retired { .. })
        ));
    }

    #[tokio::test]
    async fn test_retire_waits_for_in_flight_call() {
        let log = FakeTransportLog::default();
        let conn = connection(&log, Duration::from_millis(100));

        let caller = Arc::clone(&conn);
        let call = tokio::spawn(async move { caller.call("search", Value::Null).await });
        while conn.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        Arc::clone(&conn).retire(Duration::from_secs(5)).await;
        assert_eq!(log.closes(), 0);

        // the in-flight call completes on the old connection
        assert!(call.await.unwrap().is_ok());
        tokio::time::timeout(Duration::from_secs(1), async {
            while log.closes() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
