//! Host notification channel.
//!
//! A second, independent realtime path: instead of a socket, the client
//! registers with the host process over a [`HostBridge`] and receives
//! [`OrderNotification`]s on a push event named after its identity.
//!
//! Lifecycle:
//! - `connect` registers (`subscribe_to_notifications`), retrying after a
//!   delay up to the attempt cap, then attaches the push listener once and
//!   starts the heartbeat.
//! - A failed heartbeat marks the channel disconnected and registers again.
//! - `disconnect` unregisters and stops everything. Calling it twice is safe.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Serialize;
use shopfloor_core::{FailureTracker, ListenerId, ListenerRegistry, RetryPolicy};
use shopfloor_protocol::notification::{HEARTBEAT_COMMAND, SUBSCRIBE_COMMAND, UNSUBSCRIBE_COMMAND};
use shopfloor_protocol::{codec, ClientIdentity, OrderNotification};
use shopfloor_transport::HostBridge;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::metrics;

const CHANNEL: &str = "notifications";

/// Notification channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Interval between heartbeats. Zero disables them.
    pub heartbeat_interval: Duration,
    /// Registration retry delay and attempt cap.
    pub retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Snapshot of the channel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    /// Identity the channel registers with.
    pub client_id: String,
    /// Whether the host accepted the registration.
    pub connected: bool,
    /// Failed registration attempts since the last success.
    pub reconnect_attempts: u32,
}

#[derive(Debug)]
struct State {
    desired: bool,
    registering: bool,
    failures: FailureTracker,
    registration: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl State {
    fn stop_tasks(&mut self) {
        for task in [
            self.registration.take(),
            self.heartbeat.take(),
            self.pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    bridge: Arc<dyn HostBridge>,
    identity: ClientIdentity,
    config: ChannelConfig,
    listeners: ListenerRegistry<OrderNotification>,
    status: watch::Sender<ChannelStatus>,
    state: Mutex<State>,
}

impl Inner {
    fn deliver(&self, payload: &[u8]) {
        metrics::record_message(CHANNEL);
        match codec::decode_notification(payload) {
            Ok(notification) if notification.is_heartbeat() => {
                trace!("Host heartbeat received");
            }
            Ok(notification) => {
                debug!(
                    kind = ?notification.notification_type,
                    order_id = notification.order_id,
                    "Notification received"
                );
                let report = self.listeners.dispatch(&notification);
                metrics::record_listener_failures(report.failed);
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable notification");
                metrics::record_decode_error(CHANNEL);
            }
        }
    }
}

/// Client of the host notification channel.
pub struct NotificationChannel {
    inner: Arc<Inner>,
}

impl NotificationChannel {
    /// Create a channel with a freshly generated identity.
    #[must_use]
    pub fn new(bridge: Arc<dyn HostBridge>, config: ChannelConfig) -> Self {
        Self::with_identity(bridge, config, ClientIdentity::generate())
    }

    /// Create a channel with a given identity.
    #[must_use]
    pub fn with_identity(
        bridge: Arc<dyn HostBridge>,
        config: ChannelConfig,
        identity: ClientIdentity,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus {
            client_id: identity.as_str().to_string(),
            connected: false,
            reconnect_attempts: 0,
        });
        let failures = config.retry.tracker();

        Self {
            inner: Arc::new(Inner {
                bridge,
                identity,
                config,
                listeners: ListenerRegistry::new(),
                status,
                state: Mutex::new(State {
                    desired: false,
                    registering: false,
                    failures,
                    registration: None,
                    heartbeat: None,
                    pump: None,
                }),
            }),
        }
    }

    /// Get the client identity.
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    /// Register with the host.
    ///
    /// Returns immediately; registration and its retries run in the
    /// background. Does nothing while connected or registering.
    pub async fn connect(&self) {
        let mut state = self.inner.state.lock().await;
        if state.registering || self.inner.status.borrow().connected {
            debug!(client_id = %self.inner.identity, "Already connected, ignoring");
            return;
        }

        state.desired = true;
        state.registering = true;
        state.failures.reset();
        state.registration = Some(tokio::spawn(run_registration(Arc::clone(&self.inner))));
    }

    /// Unregister from the host and stop every background task.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        let was_active = state.desired;
        state.desired = false;
        state.registering = false;
        state.stop_tasks();

        if was_active {
            if let Err(e) = self
                .inner
                .bridge
                .invoke(UNSUBSCRIBE_COMMAND, self.inner.identity.as_str())
                .await
            {
                warn!(error = %e, "Failed to unsubscribe from host notifications");
            }
            info!(client_id = %self.inner.identity, "Notification channel disconnected");
        }

        metrics::record_connection_closed(CHANNEL);
        self.inner.status.send_modify(|s| {
            s.connected = false;
            s.reconnect_attempts = 0;
        });
    }

    /// Disconnect, then connect again.
    pub async fn reconnect(&self) {
        self.disconnect().await;
        self.connect().await;
    }

    /// Register a listener for notifications.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&OrderNotification) + Send + Sync + 'static,
    {
        self.inner.listeners.register(listener)
    }

    /// Remove a listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister(id)
    }

    /// Get the current state.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    /// Get a receiver of state changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_lock() {
            state.stop_tasks();
        }
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("status", &*self.inner.status.borrow())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

/// Register until the host accepts or the attempt cap is reached.
///
/// Boxed because the heartbeat it starts may start a new registration.
fn run_registration(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        loop {
            let client_id = inner.identity.as_str();
            let result = inner.bridge.invoke(SUBSCRIBE_COMMAND, client_id).await;

            let mut state = inner.state.lock().await;
            if !state.desired {
                state.registering = false;
                return;
            }

            match result {
                Ok(reply) => {
                    debug!(client_id, reply = %reply, "Registered with host");
                    on_registered(&inner, &mut state).await;
                    return;
                }
                Err(e) => {
                    let delay = state.failures.record_failure();
                    let attempts = state.failures.count();
                    inner.status.send_modify(|s| s.reconnect_attempts = attempts);

                    match delay {
                        Some(delay) => {
                            warn!(client_id, attempts, error = %e, "Registration failed, retrying");
                            metrics::record_reconnect_scheduled(CHANNEL);
                            drop(state);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(
                                client_id,
                                attempts,
                                error = %e,
                                "Registration failed, giving up"
                            );
                            state.registering = false;
                            return;
                        }
                    }
                }
            }
        }
    })
}

async fn on_registered(inner: &Arc<Inner>, state: &mut State) {
    state.registering = false;
    state.failures.reset();

    if state.pump.is_none() {
        let event = inner.identity.event_name();
        match inner.bridge.listen(&event).await {
            Ok(events) => {
                state.pump = Some(tokio::spawn(pump(Arc::downgrade(inner), events)));
                debug!(event = %event, "Listening for notifications");
            }
            Err(e) => warn!(error = %e, "Failed to attach notification listener"),
        }
    }

    if let Some(previous) = state.heartbeat.take() {
        previous.abort();
    }
    if !inner.config.heartbeat_interval.is_zero() {
        state.heartbeat = Some(tokio::spawn(run_heartbeat(Arc::clone(inner))));
    }

    metrics::record_connection_opened(CHANNEL);
    inner.status.send_modify(|s| {
        s.connected = true;
        s.reconnect_attempts = 0;
    });
    info!(client_id = %inner.identity, "Notification channel connected");
}

async fn run_heartbeat(inner: Arc<Inner>) {
    let period = inner.config.heartbeat_interval;
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        let client_id = inner.identity.as_str();
        match inner.bridge.invoke(HEARTBEAT_COMMAND, client_id).await {
            Ok(_) => {
                trace!(client_id, "Heartbeat sent");
                metrics::record_heartbeat(true);
            }
            Err(e) => {
                warn!(client_id, error = %e, "Heartbeat failed, registering again");
                metrics::record_heartbeat(false);

                let mut state = inner.state.lock().await;
                if !state.desired || state.registering {
                    return;
                }
                inner.status.send_modify(|s| s.connected = false);
                metrics::record_connection_closed(CHANNEL);

                // Our own handle: dropping it detaches without aborting us.
                drop(state.heartbeat.take());
                state.registering = true;
                state.registration = Some(tokio::spawn(run_registration(Arc::clone(&inner))));
                return;
            }
        }
    }
}

async fn pump(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(payload) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.deliver(&payload);
    }
    trace!("Notification pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfloor_protocol::codec::encode_notification;
    use shopfloor_protocol::NotificationType;
    use shopfloor_transport::MemoryBridge;
    use std::sync::Mutex as StdMutex;

    const CLIENT: &str = "shopfloor_test";
    const EVENT: &str = "order-notification-shopfloor_test";

    fn channel() -> (NotificationChannel, Arc<MemoryBridge>) {
        let bridge = Arc::new(MemoryBridge::new());
        let channel = NotificationChannel::with_identity(
            Arc::clone(&bridge) as Arc<dyn HostBridge>,
            ChannelConfig::default(),
            ClientIdentity::new(CLIENT),
        );
        (channel, bridge)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn notification(kind: NotificationType, order_id: i64) -> Bytes {
        encode_notification(&OrderNotification::new(kind, order_id)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_registers_and_delivers() {
        let (channel, bridge) = channel();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        channel.subscribe(move |n| sink.lock().unwrap().push(n.order_id));

        channel.connect().await;
        settle().await;

        let status = channel.status();
        assert!(status.connected);
        assert_eq!(status.client_id, CLIENT);
        assert_eq!(bridge.calls()[0].command, SUBSCRIBE_COMMAND);
        assert_eq!(bridge.calls()[0].client_id, CLIENT);
        assert!(bridge.is_listening(EVENT));

        assert!(bridge.emit(EVENT, notification(NotificationType::OrderStatusChanged, 42)));
        assert!(bridge.emit(EVENT, notification(NotificationType::Heartbeat, 0)));
        assert!(bridge.emit(EVENT, Bytes::from_static(b"garbage")));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_is_noop() {
        let (channel, bridge) = channel();
        channel.connect().await;
        channel.connect().await;
        settle().await;
        channel.connect().await;
        settle().await;

        assert_eq!(bridge.call_count(SUBSCRIBE_COMMAND), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_retries_then_succeeds() {
        let (channel, bridge) = channel();
        bridge.fail_next(SUBSCRIBE_COMMAND, 2);

        channel.connect().await;
        settle().await;
        assert!(!channel.status().connected);
        assert_eq!(channel.status().reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(channel.status().reconnect_attempts, 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        let status = channel.status();
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(bridge.call_count(SUBSCRIBE_COMMAND), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_gives_up_after_cap() {
        let (channel, bridge) = channel();
        bridge.fail_next(SUBSCRIBE_COMMAND, 10);

        channel.connect().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(bridge.call_count(SUBSCRIBE_COMMAND), 3);
        let status = channel.status();
        assert!(!status.connected);
        assert_eq!(status.reconnect_attempts, 3);
        assert!(!bridge.is_listening(EVENT));

        // A later connect starts over
        bridge.fail_next(SUBSCRIBE_COMMAND, 0);
        channel.connect().await;
        settle().await;
        assert!(channel.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_reregistration() {
        let (channel, bridge) = channel();
        channel.connect().await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(bridge.call_count(HEARTBEAT_COMMAND), 1);

        bridge.fail_next(HEARTBEAT_COMMAND, 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        // Registered again right away, listener kept
        assert_eq!(bridge.call_count(SUBSCRIBE_COMMAND), 2);
        assert!(channel.status().connected);
        assert!(bridge.is_listening(EVENT));

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(bridge.call_count(HEARTBEAT_COMMAND), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_disables_heartbeat() {
        let bridge = Arc::new(MemoryBridge::new());
        let channel = NotificationChannel::with_identity(
            Arc::clone(&bridge) as Arc<dyn HostBridge>,
            ChannelConfig {
                heartbeat_interval: Duration::ZERO,
                ..ChannelConfig::default()
            },
            ClientIdentity::new(CLIENT),
        );
        let count = Arc::new(StdMutex::new(0));
        let sink = Arc::clone(&count);
        channel.subscribe(move |_| *sink.lock().unwrap() += 1);

        channel.connect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(channel.status().connected);
        assert_eq!(bridge.call_count(HEARTBEAT_COMMAND), 0);
        bridge.emit(EVENT, notification(NotificationType::OrderCreated, 1));
        settle().await;
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_everything() {
        let (channel, bridge) = channel();
        channel.connect().await;
        settle().await;

        channel.disconnect().await;
        settle().await;
        assert!(!channel.status().connected);
        assert_eq!(bridge.call_count(UNSUBSCRIBE_COMMAND), 1);
        assert!(!bridge.is_listening(EVENT));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(bridge.call_count(HEARTBEAT_COMMAND), 0);

        // Idempotent
        channel.disconnect().await;
        assert_eq!(bridge.call_count(UNSUBSCRIBE_COMMAND), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_retries() {
        let (channel, bridge) = channel();
        bridge.fail_next(SUBSCRIBE_COMMAND, 10);

        channel.connect().await;
        settle().await;
        channel.disconnect().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bridge.call_count(SUBSCRIBE_COMMAND), 1);
        assert_eq!(channel.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect() {
        let (channel, bridge) = channel();
        channel.connect().await;
        settle().await;

        channel.reconnect().await;
        settle().await;
        assert!(channel.status().connected);
        assert_eq!(bridge.call_count(UNSUBSCRIBE_COMMAND), 1);
        assert_eq!(bridge.call_count(SUBSCRIBE_COMMAND), 2);
        assert!(bridge.is_listening(EVENT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_listener() {
        let (channel, bridge) = channel();
        let count = Arc::new(StdMutex::new(0));
        let sink = Arc::clone(&count);
        let id = channel.subscribe(move |_| *sink.lock().unwrap() += 1);

        channel.connect().await;
        settle().await;
        assert!(channel.unsubscribe(id));
        bridge.emit(EVENT, notification(NotificationType::OrderCreated, 1));
        settle().await;
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
