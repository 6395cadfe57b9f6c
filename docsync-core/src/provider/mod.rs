//! Provider adapter: one stable capability surface over any relay.
//!
//! The editing layer talks to a [`ProviderAdapter`] and never to a concrete
//! transport. The adapter does not own the connection lifecycle; that
//! belongs to the session controller. `connect`, `disconnect` and `destroy`
//! are therefore delegates whose failures are logged and swallowed, and a
//! redundant call is a no-op. Callers learn the real state from
//! [`ProviderAdapter::is_connected`] and [`ProviderAdapter::is_synced`], never
//! from whether a call "succeeded".
//!
//! Both flags are driven only by relay status events and are monotonic within
//! one connection attempt: `is_connected` turns true on `Connected`,
//! `is_synced` on a `Synced` that follows `Connected`. They reset when a
//! fresh attempt begins.

mod relay;
mod ws;

pub use relay::{Relay, RelayError, RelayStatus};
pub use ws::WebSocketRelay;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::presence::PresenceChannel;
use crate::replica::ReplicaHandle;

/// Observable state of a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Synced,
}

/// Connection flags for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    pub state: ConnectionState,
    pub connected: bool,
    pub synced: bool,
    /// Number of connection attempts seen so far.
    pub attempt: u64,
    /// Number of relay status events processed.
    pub events: u64,
    /// Set when the adapter opened an attempt the relay has not announced
    /// yet. Events still queued from the previous attempt are dropped.
    awaiting_relay: bool,
}

impl LinkState {
    fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.connected = false;
        self.synced = false;
        self.state = ConnectionState::Connecting;
    }

    /// An attempt started by an adapter `connect()` call.
    fn open_attempt(&mut self) {
        self.begin_attempt();
        self.awaiting_relay = true;
    }

    /// The adapter's attempt never reached the relay.
    fn abandon_attempt(&mut self) {
        self.awaiting_relay = false;
        self.state = ConnectionState::Disconnected;
    }

    fn observe(&mut self, status: RelayStatus) {
        self.events += 1;
        match status {
            RelayStatus::Connecting => {
                if self.awaiting_relay {
                    // The adapter already opened this attempt
                    self.awaiting_relay = false;
                } else {
                    self.begin_attempt();
                }
            }
            stale if self.awaiting_relay => {
                tracing::debug!("Ignoring {:?} from a previous attempt", stale);
            }
            RelayStatus::Connected => {
                self.connected = true;
                self.state = ConnectionState::Connected;
            }
            RelayStatus::Synced => {
                if self.connected {
                    self.synced = true;
                    self.state = ConnectionState::Synced;
                } else {
                    tracing::warn!("Ignoring sync-complete before connect");
                }
            }
            RelayStatus::Disconnected => {
                self.state = ConnectionState::Disconnected;
            }
        }
    }
}

/// Stable capability surface over a relay implementation.
pub struct ProviderAdapter<R: Relay> {
    relay: Arc<R>,
    link: Arc<watch::Sender<LinkState>>,
    watcher: JoinHandle<()>,
}

impl<R: Relay> ProviderAdapter<R> {
    /// Wraps `relay` and starts tracking its status events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(relay: R) -> Self {
        let relay = Arc::new(relay);
        let (link, _) = watch::channel(LinkState::default());
        let link = Arc::new(link);

        let mut status = relay.status();
        let tracker = link.clone();
        let watcher = tokio::spawn(async move {
            loop {
                match status.recv().await {
                    Ok(event) => {
                        tracing::debug!("Relay status: {:?}", event);
                        tracker.send_modify(|link| link.observe(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} relay status events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            relay,
            link,
            watcher,
        }
    }

    /// Asks the relay to connect. Never fails; a no-op if already active.
    pub async fn connect(&self) {
        let opened = !self.relay.is_active();
        if opened {
            self.link.send_modify(LinkState::open_attempt);
        }
        if let Err(e) = self.relay.connect().await {
            tracing::warn!("Relay connect did not start, editing stays local: {}", e);
            if opened {
                self.link.send_modify(LinkState::abandon_attempt);
            }
        }
    }

    /// Asks the relay to disconnect. Never fails.
    pub async fn disconnect(&self) {
        if let Err(e) = self.relay.disconnect().await {
            tracing::debug!("Relay disconnect ignored: {}", e);
        }
    }

    /// Tears the relay down. The replica stays usable.
    pub async fn destroy(&self) {
        self.relay.destroy().await;
        self.link
            .send_modify(|link| link.state = ConnectionState::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.link.borrow().connected
    }

    pub fn is_synced(&self) -> bool {
        self.link.borrow().synced
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.borrow().state
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    /// Watches link state changes.
    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Waits until the current attempt is synced. Returns false on timeout.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut link = self.link.subscribe();
        let synced = matches!(
            tokio::time::timeout(timeout, link.wait_for(|l| l.synced)).await,
            Ok(Ok(_))
        );
        synced
    }

    /// The replica the relay synchronizes.
    pub fn replica(&self) -> ReplicaHandle {
        self.relay.replica().clone()
    }

    /// The presence channel the relay carries.
    pub fn presence(&self) -> Arc<PresenceChannel> {
        self.relay.presence().clone()
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }
}

impl<R: Relay> Drop for ProviderAdapter<R> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Credential;
    use crate::document_id::{ClientId, DocumentId};
    use crate::replica::{LocalMutation, Replica};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Relay whose status events are driven by the test.
    struct ScriptedRelay {
        replica: ReplicaHandle,
        presence: Arc<PresenceChannel>,
        status: broadcast::Sender<RelayStatus>,
        active: AtomicBool,
        fail_connect: bool,
    }

    impl ScriptedRelay {
        fn new(fail_connect: bool) -> Self {
            let (status, _) = broadcast::channel(16);
            Self {
                replica: ReplicaHandle::new(DocumentId::parse("doc").unwrap(), Replica::new()),
                presence: Arc::new(PresenceChannel::new(ClientId::parse("me").unwrap())),
                status,
                active: AtomicBool::new(false),
                fail_connect,
            }
        }

        fn emit(&self, status: RelayStatus) {
            self.status.send(status).unwrap();
        }
    }

    impl Relay for ScriptedRelay {
        fn replica(&self) -> &ReplicaHandle {
            &self.replica
        }

        fn presence(&self) -> &Arc<PresenceChannel> {
            &self.presence
        }

        fn status(&self) -> broadcast::Receiver<RelayStatus> {
            self.status.subscribe()
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        async fn authorize(&self, _credential: Credential) {}

        async fn connect(&self) -> Result<(), RelayError> {
            if self.fail_connect {
                return Err(RelayError::MissingCredential);
            }
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), RelayError> {
            self.active.store(false, Ordering::SeqCst);
            Err(RelayError::Transport("already closed".to_string()))
        }

        async fn destroy(&self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    async fn wait_events(adapter: &ProviderAdapter<ScriptedRelay>, events: u64) {
        let mut link = adapter.watch();
        tokio::time::timeout(Duration::from_secs(2), link.wait_for(|l| l.events >= events))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_link_state_synced_requires_connected() {
        let mut link = LinkState::default();
        link.observe(RelayStatus::Connecting);
        link.observe(RelayStatus::Synced);
        assert!(!link.synced);

        link.observe(RelayStatus::Connected);
        link.observe(RelayStatus::Synced);
        assert!(link.connected && link.synced);
        assert_eq!(link.state, ConnectionState::Synced);
    }

    #[test]
    fn test_link_state_resets_on_new_attempt_only() {
        let mut link = LinkState::default();
        link.observe(RelayStatus::Connecting);
        link.observe(RelayStatus::Connected);
        link.observe(RelayStatus::Synced);
        link.observe(RelayStatus::Disconnected);

        // Monotonic within the attempt
        assert!(link.connected && link.synced);
        assert_eq!(link.state, ConnectionState::Disconnected);

        link.observe(RelayStatus::Connecting);
        assert!(!link.connected && !link.synced);
        assert_eq!(link.attempt, 2);
    }

    #[tokio::test]
    async fn test_flags_follow_relay_events() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(false));

        adapter.connect().await;
        // Call initiation alone does not flip the flag
        assert!(!adapter.is_connected());
        assert_eq!(adapter.connection_state(), ConnectionState::Connecting);

        adapter.relay().emit(RelayStatus::Connecting);
        adapter.relay().emit(RelayStatus::Connected);
        wait_events(&adapter, 2).await;
        assert!(adapter.is_connected());
        assert!(!adapter.is_synced());

        adapter.relay().emit(RelayStatus::Synced);
        assert!(adapter.wait_synced(Duration::from_secs(2)).await);
        assert_eq!(adapter.link_state().attempt, 1);
    }

    #[tokio::test]
    async fn test_synced_before_connected_is_ignored() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(false));
        adapter.connect().await;

        adapter.relay().emit(RelayStatus::Synced);
        wait_events(&adapter, 1).await;
        assert!(!adapter.is_synced());
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_fresh_connect_resets_flags() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(false));
        adapter.connect().await;
        adapter.relay().emit(RelayStatus::Connecting);
        adapter.relay().emit(RelayStatus::Connected);
        adapter.relay().emit(RelayStatus::Synced);
        adapter.relay().emit(RelayStatus::Disconnected);
        wait_events(&adapter, 4).await;
        assert!(adapter.is_synced());

        adapter.disconnect().await;
        adapter.connect().await;
        assert!(!adapter.is_connected());
        assert!(!adapter.is_synced());
        assert_eq!(adapter.link_state().attempt, 2);
    }

    #[test]
    fn test_events_from_previous_attempt_are_dropped() {
        let mut link = LinkState::default();
        link.observe(RelayStatus::Connecting);
        link.observe(RelayStatus::Connected);

        // Reconnect before the old attempt's events were processed
        link.open_attempt();
        link.observe(RelayStatus::Synced);
        link.observe(RelayStatus::Connected);
        assert!(!link.connected && !link.synced);
        assert_eq!(link.state, ConnectionState::Connecting);

        link.observe(RelayStatus::Connecting);
        assert_eq!(link.attempt, 2);
        link.observe(RelayStatus::Connected);
        link.observe(RelayStatus::Synced);
        assert!(link.connected && link.synced);
    }

    #[tokio::test]
    async fn test_stale_events_after_reconnect_leave_flags_clear() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(false));
        adapter.disconnect().await;
        adapter.connect().await;

        // Left over from an earlier connection
        adapter.relay().emit(RelayStatus::Connected);
        adapter.relay().emit(RelayStatus::Synced);
        wait_events(&adapter, 2).await;
        assert!(!adapter.is_connected());
        assert!(!adapter.is_synced());

        adapter.relay().emit(RelayStatus::Connecting);
        adapter.relay().emit(RelayStatus::Connected);
        wait_events(&adapter, 4).await;
        assert!(adapter.is_connected());
        assert_eq!(adapter.link_state().attempt, 1);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(true));
        adapter.connect().await;
        assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_redundant_connect_keeps_flags() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(false));
        adapter.connect().await;
        adapter.relay().emit(RelayStatus::Connecting);
        adapter.relay().emit(RelayStatus::Connected);
        adapter.relay().emit(RelayStatus::Synced);
        wait_events(&adapter, 3).await;

        // Relay still active: lifecycle owned elsewhere, call is a no-op
        adapter.connect().await;
        assert!(adapter.is_connected());
        assert!(adapter.is_synced());
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_and_editing_continues() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(true));

        adapter.connect().await;
        adapter.disconnect().await;
        adapter.destroy().await;

        assert!(!adapter.is_connected());
        let replica = adapter.replica();
        replica
            .apply(LocalMutation::insert(0, "still editable"))
            .await
            .unwrap();
        assert_eq!(replica.text().await.unwrap(), "still editable");
    }

    #[tokio::test]
    async fn test_accessors_expose_relay_instances() {
        let adapter = ProviderAdapter::new(ScriptedRelay::new(false));

        assert!(adapter.replica().ptr_eq(adapter.relay().replica()));
        assert!(Arc::ptr_eq(&adapter.presence(), adapter.relay().presence()));
    }
}
