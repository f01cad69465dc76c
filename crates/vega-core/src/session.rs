//! One connected lifetime with a peripheral.
//!
//! A [`Session`] wraps an open [`Link`] and publishes its progress through a
//! [`watch`] channel so other tasks can await the "ready" and "initialized"
//! milestones without polling.

use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::transport::{Connector, Link, LinkEvents, TransportError, TransportResult};

/// Progress of a session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Milestone {
    /// Transport connect in progress.
    Connecting,
    /// Link-layer setup complete.
    Ready,
    /// Initialization handshake complete; polling may start.
    Initialized,
    /// The session has been torn down.
    Closed,
}

/// A live connection to one device.
pub struct Session {
    address: String,
    link: Mutex<Box<dyn Link>>,
    milestone: watch::Sender<Milestone>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("milestone", &*self.milestone.borrow())
            .finish_non_exhaustive()
    }
}

async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl std::future::Future<Output = TransportResult<T>>,
) -> TransportResult<T> {
    tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(TransportError::Timeout {
            operation,
            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })
    })
}

impl Session {
    /// Opens the transport to `address`, bounded by `timeout`.
    ///
    /// The returned session holds a live link from this point on and must be
    /// closed even if [`Session::ready`] never completes.
    ///
    /// # Errors
    ///
    /// Any [`TransportError`] from the connector, or [`TransportError::Timeout`].
    pub async fn connect(
        connector: &dyn Connector,
        address: &str,
        timeout: Duration,
    ) -> TransportResult<(Self, LinkEvents)> {
        let opened = bounded("connect", timeout, connector.connect(address)).await?;
        let session = Self {
            address: address.to_owned(),
            link: Mutex::new(opened.link),
            milestone: watch::Sender::new(Milestone::Connecting),
        };
        Ok((session, opened.events))
    }

    /// Waits for link-layer setup, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// The link's error, or [`TransportError::Timeout`]. The link stays open.
    pub async fn ready(&self, timeout: Duration) -> TransportResult<()> {
        let mut link = self.link.lock().await;
        bounded("connect", timeout, link.ready()).await?;
        drop(link);
        self.milestone.send_replace(Milestone::Ready);
        tracing::debug!(address = %self.address, "session ready");
        Ok(())
    }

    /// Runs the initialization handshake, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// The link's error, or [`TransportError::Timeout`].
    pub async fn initialize(&self, timeout: Duration) -> TransportResult<()> {
        let mut link = self.link.lock().await;
        bounded("init", timeout, link.initialize()).await?;
        drop(link);
        self.milestone.send_replace(Milestone::Initialized);
        tracing::debug!(address = %self.address, "session initialized");
        Ok(())
    }

    /// Performs one telemetry round trip, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] before initialization or after close, the
    /// link's error, or [`TransportError::Timeout`].
    pub async fn read_data_buf(&self, timeout: Duration) -> TransportResult<Vec<u8>> {
        if self.milestone() != Milestone::Initialized {
            return Err(TransportError::Closed);
        }
        let mut link = self.link.lock().await;
        bounded("read", timeout, link.read_data_buf()).await
    }

    /// Closes the link. Idempotent.
    pub async fn close(&self) {
        if self.milestone.send_replace(Milestone::Closed) == Milestone::Closed {
            return;
        }
        self.link.lock().await.close().await;
        tracing::debug!(address = %self.address, "session closed");
    }

    /// Current milestone.
    #[must_use]
    pub fn milestone(&self) -> Milestone {
        *self.milestone.borrow()
    }

    /// Resolves once the session reached `target`, or returns `false` if it
    /// closed first.
    pub async fn wait_for(&self, target: Milestone) -> bool {
        let mut rx = self.milestone.subscribe();
        rx.wait_for(|m| *m >= target)
            .await
            .is_ok_and(|m| *m == target || *m != Milestone::Closed)
    }

    /// Resolves once the link is ready.
    pub async fn wait_ready(&self) -> bool {
        self.wait_for(Milestone::Ready).await
    }

    /// Resolves once initialization has completed.
    pub async fn wait_initialized(&self) -> bool {
        self.wait_for(Milestone::Initialized).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::{MockConnector, MockStep};

    const LIMIT: Duration = Duration::from_secs(5);

    async fn ready_session(connector: &MockConnector) -> Session {
        let (session, _events) = Session::connect(connector, "dev", LIMIT).await.unwrap();
        session.ready(LIMIT).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_milestones_progress() {
        let connector = MockConnector::new();
        let session = ready_session(&connector).await;
        assert_eq!(session.milestone(), Milestone::Ready);
        assert!(session.wait_ready().await);

        assert!(matches!(
            session.read_data_buf(LIMIT).await,
            Err(TransportError::Closed)
        ));

        session.initialize(LIMIT).await.unwrap();
        assert!(session.wait_initialized().await);
        assert!(!session.read_data_buf(LIMIT).await.unwrap().is_empty());

        session.close().await;
        session.close().await;
        assert_eq!(session.milestone(), Milestone::Closed);
        assert_eq!(connector.device("dev").closes(), 1);
        assert!(matches!(
            session.read_data_buf(LIMIT).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_waiter_sees_initialization_from_another_task() {
        let connector = MockConnector::new();
        let session = ready_session(&connector).await;
        let session = Arc::new(session);

        let waiter = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.wait_initialized().await }
        });
        session.initialize(LIMIT).await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_initialized_waiter_is_pending_until_handshake() {
        let connector = MockConnector::new();
        let session = ready_session(&connector).await;

        let mut waiter = tokio_test::task::spawn(session.wait_initialized());
        tokio_test::assert_pending!(waiter.poll());
        session.initialize(LIMIT).await.unwrap();
        assert!(waiter.is_woken());
        assert!(tokio_test::assert_ready!(waiter.poll()));
    }

    #[tokio::test]
    async fn test_close_releases_initialized_waiters() {
        let connector = MockConnector::new();
        let session = ready_session(&connector).await;
        let session = Arc::new(session);

        let waiter = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.wait_initialized().await }
        });
        tokio::task::yield_now().await;
        session.close().await;
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_init_times_out() {
        let connector = MockConnector::new();
        connector.device("dev").push_init(MockStep::Hang);
        let session = ready_session(&connector).await;

        let err = session.initialize(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Timeout {
                operation: "init",
                millis: 10_000
            }
        );
        assert_eq!(session.milestone(), Milestone::Ready);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let connector = MockConnector::new();
        connector
            .device("dev")
            .push_connect(MockStep::Fail(TransportError::AdapterPoweredOff));
        let err = Session::connect(&connector, "dev", LIMIT).await.unwrap_err();
        assert_eq!(err, TransportError::AdapterPoweredOff);
        assert_eq!(connector.device("dev").live_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_stays_open_until_closed_when_ready_hangs() {
        let connector = MockConnector::new();
        connector.device("dev").push_ready(MockStep::Hang);
        let (session, _events) = Session::connect(&connector, "dev", LIMIT).await.unwrap();
        assert_eq!(session.milestone(), Milestone::Connecting);

        let err = session.ready(LIMIT).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Timeout {
                operation: "connect",
                millis: 5_000
            }
        );
        assert_eq!(connector.device("dev").live_links(), 1);

        session.close().await;
        assert_eq!(connector.device("dev").live_links(), 0);
        assert_eq!(connector.device("dev").closes(), 1);
    }
}
