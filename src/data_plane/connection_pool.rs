//! Broker connection pool with refcounted reuse and exclusive opens.

use crate::errors::BusError;
use crate::observability::events;
use crate::transport::{BrokerConnection, ChannelHandle, ConnectionFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const COMPONENT: &str = "connection_pool";

/// A connection handed out by the pool.
///
/// The pool keeps ownership; holders return the handle through
/// [`ConnectionPool::release`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<dyn BrokerConnection>,
    reused: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id())
            .field("url", &self.inner.url())
            .field("reused", &self.reused)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(inner: Arc<dyn BrokerConnection>, reused: bool) -> Self {
        Self { inner, reused }
    }

    /// Stable identity of the underlying connection.
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    /// URL the connection is open against.
    pub fn url(&self) -> &str {
        self.inner.url()
    }

    /// Whether the handle shares a pooled connection.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Token canceled when the connection is being torn down.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancellation()
    }

    /// Opens a consuming channel on the connection.
    pub async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, BusError> {
        Ok(self.inner.open_channel().await?)
    }
}

type SharedConnections = Mutex<HashMap<String, (usize, Arc<dyn BrokerConnection>)>>;

/// Hands out broker connections per `(url, reuse)` request.
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    shared: SharedConnections,
}

impl ConnectionPool {
    /// Builds a pool over `factory`.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a connection for `url`.
    ///
    /// With `reuse`, the pooled connection for the URL is shared and
    /// refcounted; concurrent callers serialize on the pool lock so only one
    /// open is in flight per pool. Without `reuse` a fresh connection is
    /// opened and owned by the caller until released. `cancel` aborts a
    /// pending open; connections already handed out are unaffected.
    pub async fn get(
        &self,
        url: &str,
        reuse: bool,
        cancel: &CancellationToken,
    ) -> Result<Connection, BusError> {
        if !reuse {
            let opened = self.open(url, cancel).await?;
            return Ok(Connection::new(opened, false));
        }

        let mut shared = self.shared.lock().await;
        if let Some((active, existing)) = shared.get_mut(url) {
            *active += 1;
            debug!(
                event = events::POOL_CONNECTION_REUSED,
                component = COMPONENT,
                url,
                connection_id = %existing.id(),
                active = *active,
                "reusing pooled connection"
            );
            return Ok(Connection::new(existing.clone(), true));
        }

        let opened = self.open(url, cancel).await?;
        shared.insert(url.to_string(), (1, opened.clone()));
        Ok(Connection::new(opened, true))
    }

    async fn open(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn BrokerConnection>, BusError> {
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(
                    event = events::POOL_OPEN_CANCELED,
                    component = COMPONENT,
                    url,
                    "open canceled before completion"
                );
                return Err(BusError::Canceled);
            }
            opened = self.factory.open(url) => opened?,
        };

        debug!(
            event = events::POOL_CONNECTION_OPENED,
            component = COMPONENT,
            url,
            connection_id = %opened.id(),
            "opened broker connection"
        );
        Ok(opened)
    }

    /// Returns a handle to the pool.
    ///
    /// Shared handles decrement the refcount and the pooled connection closes
    /// once the last holder releases it; exclusive handles close immediately.
    pub async fn release(&self, connection: Connection) {
        if !connection.reused {
            Self::close_connection(&connection.inner).await;
            return;
        }

        let mut shared = self.shared.lock().await;
        let Some((active, _)) = shared.get_mut(connection.url()) else {
            warn!(
                component = COMPONENT,
                url = connection.url(),
                "released a connection the pool no longer tracks"
            );
            return;
        };

        *active -= 1;
        if *active == 0 {
            if let Some((_, evicted)) = shared.remove(connection.url()) {
                debug!(
                    event = events::POOL_CONNECTION_RELEASED,
                    component = COMPONENT,
                    url = connection.url(),
                    connection_id = %evicted.id(),
                    "last holder released; closing pooled connection"
                );
                drop(shared);
                Self::close_connection(&evicted).await;
            }
        }
    }

    /// Cancels and closes every pooled connection.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut shared = self.shared.lock().await;
            shared.drain().map(|(_, (_, connection))| connection).collect()
        };
        for connection in drained {
            Self::close_connection(&connection).await;
        }
    }

    async fn close_connection(connection: &Arc<dyn BrokerConnection>) {
        connection.cancellation().cancel();
        if let Err(err) = connection.close().await {
            warn!(
                component = COMPONENT,
                url = connection.url(),
                err = %err,
                "closing broker connection failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionPool;
    use crate::errors::{BusError, TransportError};
    use crate::message::Delivery;
    use crate::transport::{
        BrokerConnection, ChannelHandle, ConnectionFactory, Qos, SubscriptionEndpoint,
        SubscriptionOptions,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct NoopChannel;

    #[async_trait]
    impl ChannelHandle for NoopChannel {
        async fn apply_qos(&self, _qos: Qos) -> Result<(), TransportError> {
            Ok(())
        }

        async fn bind_subscription(
            &self,
            endpoint_name: &str,
            _options: &SubscriptionOptions,
        ) -> Result<SubscriptionEndpoint, TransportError> {
            Ok(SubscriptionEndpoint {
                queue: format!("{endpoint_name}.incoming"),
            })
        }

        async fn consume(&self, _queue: &str) -> Result<mpsc::Receiver<Delivery>, TransportError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
            Ok(())
        }

        async fn nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), TransportError> {
            Ok(())
        }

        async fn cancel_consume(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct RecordingConnection {
        id: Uuid,
        url: String,
        cancellation: CancellationToken,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrokerConnection for RecordingConnection {
        fn id(&self) -> Uuid {
            self.id
        }

        fn url(&self) -> &str {
            &self.url
        }

        fn cancellation(&self) -> CancellationToken {
            self.cancellation.clone()
        }

        async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, TransportError> {
            Ok(Arc::new(NoopChannel))
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for RecordingFactory {
        async fn open(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RecordingConnection {
                id: Uuid::new_v4(),
                url: url.to_string(),
                cancellation: CancellationToken::new(),
                closed: self.closed.clone(),
            }))
        }
    }

    struct StalledFactory;

    #[async_trait]
    impl ConnectionFactory for StalledFactory {
        async fn open(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn reuse_returns_the_same_connection_id() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let cancel = CancellationToken::new();

        let first = pool.get("amqp://h1", true, &cancel).await.unwrap();
        let second = pool.get("amqp://h1", true, &cancel).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exclusive_requests_open_fresh_connections() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let cancel = CancellationToken::new();

        let first = pool.get("amqp://h1", false, &cancel).await.unwrap();
        let second = pool.get("amqp://h1", false, &cancel).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_urls_get_distinct_pooled_connections() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let cancel = CancellationToken::new();

        let first = pool.get("amqp://h1", true, &cancel).await.unwrap();
        let second = pool.get("amqp://h2", true, &cancel).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_aborts_a_pending_open() {
        let pool = ConnectionPool::new(Arc::new(StalledFactory));
        let cancel = CancellationToken::new();

        let pending = pool.get("amqp://h1", true, &cancel);
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("get should resolve after cancel")
            .unwrap_err();
        assert!(matches!(err, BusError::Canceled));
    }

    #[tokio::test]
    async fn releasing_the_last_shared_holder_closes_the_connection() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let cancel = CancellationToken::new();

        let first = pool.get("amqp://h1", true, &cancel).await.unwrap();
        let second = pool.get("amqp://h1", true, &cancel).await.unwrap();

        pool.release(first).await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);

        pool.release(second).await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn releasing_an_exclusive_connection_closes_it_immediately() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let cancel = CancellationToken::new();

        let connection = pool.get("amqp://h1", false, &cancel).await.unwrap();
        let cancellation = connection.cancellation();
        pool.release(connection).await;

        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert!(cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn close_all_cancels_and_closes_pooled_connections() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let cancel = CancellationToken::new();

        let connection = pool.get("amqp://h1", true, &cancel).await.unwrap();
        let cancellation = connection.cancellation();
        pool.close_all().await;

        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert!(cancellation.is_cancelled());
    }
}
