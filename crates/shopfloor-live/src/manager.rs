//! Connection manager.
//!
//! Owns the single realtime connection of the process and its lifecycle.
//! All mutable connection state lives in one actor task; the public handle
//! sends commands to it and the per-connection tasks report back with events
//! tagged by attempt number. Events from attempts that are no longer current
//! (replaced, torn down) are dropped, so a late close of an old transport can
//! never disturb the new one.
//!
//! ```text
//!  subscribe/connect ──▶ ┌────────┐ ──spawn──▶ ┌──────────────┐
//!  disconnect        ──▶ │ actor  │            │ attempt task │◀──▶ transport
//!                        │        │ ◀─events── │ (connect +   │
//!  reconnect timer   ──▶ │        │            │  pump)       │
//!  keep-alive tick   ──▶ └────────┘ ─outbound─▶└──────────────┘
//! ```

use bytes::Bytes;
use shopfloor_core::{
    now_ms, resolve, ConnectionPhase, Endpoint, EndpointSource, FailureTracker, Listener,
    ListenerId, ListenerRegistry, RetryPolicy, StatusBroadcaster, StatusSnapshot,
    DEFAULT_EVENTS_PATH,
};
use shopfloor_protocol::{codec, ControlFrame, Envelope, ProtocolError};
use shopfloor_transport::{CloseReason, Connector, Inbound, TransportError};
use std::future::pending;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::metrics;

const CHANNEL: &str = "orders";

const CLOSE_MANUAL: &str = "Manual disconnect";
const CLOSE_RECONNECTING: &str = "Reconnecting";

static GLOBAL: OnceLock<ConnectionManager> = OnceLock::new();

/// Install the process-wide manager.
///
/// Returns the manager back if one is already installed.
pub fn install_global(manager: ConnectionManager) -> Result<(), ConnectionManager> {
    GLOBAL.set(manager)
}

/// Get the process-wide manager, if installed.
#[must_use]
pub fn global() -> Option<&'static ConnectionManager> {
    GLOBAL.get()
}

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Route of the order feed.
    pub path: String,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Interval between keep-alive pings. Zero disables them.
    pub keepalive_interval: Duration,
    /// Reconnect delay and failure cap.
    pub retry: RetryPolicy,
    /// Largest inbound payload handed to the decoder.
    pub max_message_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_EVENTS_PATH.to_string(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_message_size: codec::MAX_MESSAGE_SIZE,
        }
    }
}

struct Shared {
    listeners: ListenerRegistry<Envelope>,
    status: StatusBroadcaster,
}

enum Command {
    Ensure { ack: oneshot::Sender<()> },
    ListenerRemoved { ack: Option<oneshot::Sender<()>> },
    Connect { ack: oneshot::Sender<()> },
    Disconnect { ack: oneshot::Sender<()> },
}

/// Handle to the connection manager.
///
/// Cheap to clone; every clone talks to the same connection. The manager task
/// stops once every handle and subscription is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Start a manager.
    ///
    /// Nothing connects until the first [`subscribe`](Self::subscribe) or
    /// [`connect`](Self::connect).
    pub fn spawn(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn EndpointSource>,
    ) -> Self {
        let shared = Arc::new(Shared {
            listeners: ListenerRegistry::new(),
            status: StatusBroadcaster::new(),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let failures = config.retry.tracker();
        let actor = Actor {
            config,
            connector,
            source,
            shared: Arc::clone(&shared),
            events,
            link: Link::Idle,
            next_attempt: 1,
            should_stay_connected: false,
            explicit: false,
            replace_pending: false,
            failures,
            reconnect_at: None,
            keepalive: None,
        };
        tokio::spawn(actor.run(command_rx, event_rx));

        Self { commands, shared }
    }

    /// Register a listener for inbound events and make sure a connection is
    /// open or being opened.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// unsubscribed or dropped.
    pub async fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(listener)).await
    }

    /// Register an already shared listener.
    pub async fn subscribe_arc(&self, listener: Listener<Envelope>) -> Subscription {
        let id = self.shared.listeners.register_arc(listener);
        self.request(|ack| Command::Ensure { ack }).await;
        Subscription {
            id,
            manager: self.clone(),
            active: true,
        }
    }

    /// Keep the connection open regardless of listeners.
    ///
    /// Also leaves the degraded state.
    pub async fn connect(&self) {
        self.request(|ack| Command::Connect { ack }).await;
    }

    /// Close the connection, cancel any pending reconnect and reset the
    /// status.
    ///
    /// Listeners stay registered; the next subscribe reconnects.
    pub async fn disconnect(&self) {
        self.request(|ack| Command::Disconnect { ack }).await;
    }

    /// Observe status changes.
    ///
    /// The observer is called right away with the current status.
    pub fn on_status<F>(&self, observer: F) -> StatusSubscription
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        StatusSubscription {
            id: self.shared.status.observe(observer),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Get the last known status.
    #[must_use]
    pub fn current_status(&self) -> StatusSnapshot {
        self.shared.status.current()
    }

    /// Get a receiver of status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.shared.status.watch()
    }

    /// Get the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(command(ack)).is_err() {
            debug!("Connection manager stopped, ignoring command");
            return;
        }
        let _ = done.await;
    }

    fn listener_removed(&self) {
        if self
            .commands
            .send(Command::ListenerRemoved { ack: None })
            .is_err()
        {
            debug!("Connection manager stopped, ignoring listener removal");
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("listeners", &self.shared.listeners.len())
            .field("status", &self.shared.status.current())
            .finish()
    }
}

/// A registered event listener.
///
/// Dropping it unregisters the listener; [`unsubscribe`](Self::unsubscribe)
/// does the same and waits until the manager has reacted.
#[must_use = "dropping a subscription unregisters the listener"]
pub struct Subscription {
    id: ListenerId,
    manager: ConnectionManager,
    active: bool,
}

impl Subscription {
    /// Get the listener id.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unregister the listener.
    ///
    /// When it was the last one and no explicit connect is outstanding, the
    /// connection is closed before this returns.
    pub async fn unsubscribe(mut self) {
        self.active = false;
        self.manager.shared.listeners.unregister(self.id);
        self.manager
            .request(|ack| Command::ListenerRemoved { ack: Some(ack) })
            .await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            self.manager.shared.listeners.unregister(self.id);
            self.manager.listener_removed();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Subscription").field(&self.id).finish()
    }
}

/// A registered status observer. Dropping it stops notifications.
#[must_use = "dropping a status subscription stops notifications"]
pub struct StatusSubscription {
    id: ListenerId,
    shared: Arc<Shared>,
}

impl StatusSubscription {
    /// Stop notifications.
    pub fn unsubscribe(self) {}
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.shared.status.unobserve(self.id);
    }
}

enum Outbound {
    Text(String),
    Close(&'static str),
}

enum Link {
    Idle,
    Connecting {
        attempt: u64,
        endpoint: Endpoint,
    },
    Open {
        attempt: u64,
        endpoint: Endpoint,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
}

enum Event {
    Opened {
        attempt: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    ConnectFailed {
        attempt: u64,
        error: TransportError,
    },
    Message {
        attempt: u64,
        payload: Bytes,
    },
    Rejected {
        attempt: u64,
        reason: String,
    },
    Closed {
        attempt: u64,
        reason: CloseReason,
    },
}

enum Step {
    Command(Command),
    Event(Event),
    Reconnect,
    KeepAlive,
    Shutdown,
}

struct Actor {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    source: Arc<dyn EndpointSource>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Event>,
    link: Link,
    next_attempt: u64,
    should_stay_connected: bool,
    explicit: bool,
    replace_pending: bool,
    failures: FailureTracker,
    reconnect_at: Option<Instant>,
    keepalive: Option<Interval>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        debug!(transport = self.connector.name(), "Connection manager started");

        loop {
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Shutdown,
                },
                Some(event) = events.recv() => Step::Event(event),
                () = wait_until(self.reconnect_at) => Step::Reconnect,
                () = tick(&mut self.keepalive) => Step::KeepAlive,
            };

            match step {
                Step::Command(command) => self.handle_command(command),
                Step::Event(event) => self.handle_event(event),
                Step::Reconnect => self.reconnect(),
                Step::KeepAlive => self.send_ping(),
                Step::Shutdown => break,
            }
        }

        self.teardown();
        debug!("Connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Ensure { ack } => {
                self.should_stay_connected = true;
                self.ensure();
                let _ = ack.send(());
            }
            Command::Connect { ack } => {
                self.should_stay_connected = true;
                self.explicit = true;
                self.failures.reset();
                self.ensure();
                let _ = ack.send(());
            }
            Command::Disconnect { ack } => {
                self.teardown();
                let _ = ack.send(());
            }
            Command::ListenerRemoved { ack } => {
                if self.shared.listeners.is_empty() && !self.explicit {
                    debug!("Last listener removed, closing connection");
                    self.teardown();
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { attempt, outbound } => self.on_opened(attempt, outbound),
            Event::ConnectFailed { attempt, error } => self.on_connect_failed(attempt, error),
            Event::Message { attempt, payload } => self.on_message(attempt, &payload),
            Event::Rejected { attempt, reason } => self.on_rejected(attempt, &reason),
            Event::Closed { attempt, reason } => self.on_closed(attempt, reason),
        }
    }

    /// Make sure a connection to the current endpoint is open or opening.
    fn ensure(&mut self) {
        if self.failures.exhausted() {
            debug!("Connection degraded, waiting for an explicit connect");
            return;
        }

        let api_url = self.source.api_url();
        let token = self.source.session_token();
        let endpoint = match resolve(api_url.as_deref(), token.as_deref(), &self.config.path) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Cannot resolve realtime endpoint");
                let idle = matches!(self.link, Link::Idle);
                self.shared.status.update(|s| {
                    s.last_error = Some(e.to_string());
                    if idle {
                        s.connected = false;
                        s.phase = ConnectionPhase::Idle;
                    }
                });
                return;
            }
        };

        match &self.link {
            Link::Connecting { endpoint: current, .. } => {
                // The attempt in flight is left alone; a replacement waits for
                // its outcome.
                self.replace_pending = *current != endpoint;
                if self.replace_pending {
                    debug!(endpoint = %endpoint, "Endpoint changed during handshake");
                }
                return;
            }
            Link::Open { endpoint: current, .. } if *current == endpoint => return,
            Link::Open { .. } => {
                info!(endpoint = %endpoint, "Endpoint changed, replacing connection");
                self.close_link(CLOSE_RECONNECTING);
            }
            Link::Idle => {}
        }

        self.open(endpoint);
    }

    fn open(&mut self, endpoint: Endpoint) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.reconnect_at = None;
        self.replace_pending = false;

        info!(attempt, endpoint = %endpoint, "Connecting");
        let url = endpoint.as_str().to_string();
        self.link = Link::Connecting { attempt, endpoint };
        self.shared.status.update(|s| {
            s.connected = false;
            s.phase = ConnectionPhase::Connecting;
        });

        tokio::spawn(run_attempt(
            attempt,
            url,
            Arc::clone(&self.connector),
            self.config.connect_timeout,
            self.events.clone(),
        ));
    }

    fn on_opened(&mut self, attempt: u64, outbound: mpsc::UnboundedSender<Outbound>) {
        let endpoint = match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Connecting {
                attempt: current,
                endpoint,
            } if current == attempt => endpoint,
            other => {
                trace!(attempt, "Stale connection opened, closing it");
                self.link = other;
                let _ = outbound.send(Outbound::Close(CLOSE_MANUAL));
                return;
            }
        };

        if self.replace_pending {
            debug!(attempt, "Replaced during handshake, closing");
            let _ = outbound.send(Outbound::Close(CLOSE_RECONNECTING));
            self.ensure();
            return;
        }

        info!(attempt, endpoint = %endpoint, "Connected");
        metrics::record_connection_opened(CHANNEL);

        if let Some(token) = self.source.session_token().filter(|t| !t.is_empty()) {
            send_frame(&outbound, &ControlFrame::authenticate(token));
        }

        let period = self.config.keepalive_interval;
        self.keepalive = (!period.is_zero()).then(|| {
            let mut keepalive = interval_at(Instant::now() + period, period);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            keepalive
        });

        self.link = Link::Open {
            attempt,
            endpoint,
            outbound,
        };
        self.shared.status.update(|s| {
            s.connected = true;
            s.reconnect_attempts = 0;
            s.last_error = None;
            s.phase = ConnectionPhase::Open;
        });
    }

    fn on_connect_failed(&mut self, attempt: u64, error: TransportError) {
        if !matches!(self.link, Link::Connecting { attempt: current, .. } if current == attempt) {
            trace!(attempt, "Ignoring failure of stale attempt");
            return;
        }
        self.link = Link::Idle;

        warn!(attempt, error = %error, "Connection attempt failed");
        self.shared.status.update(|s| {
            s.connected = false;
            s.last_error = Some(error.to_string());
        });

        if self.replace_pending {
            self.ensure();
            return;
        }
        self.on_failure();
    }

    fn on_message(&mut self, attempt: u64, payload: &[u8]) {
        if !self.is_current(attempt) {
            return;
        }
        metrics::record_message(CHANNEL);

        match codec::decode_envelope_limited(payload, self.config.max_message_size) {
            Ok(envelope) => {
                self.shared.status.update(|s| {
                    s.last_event_at = Some(now_ms());
                    s.last_error = None;
                });
                trace!(kind = %envelope.kind, "Dispatching event");
                let report = self.shared.listeners.dispatch(&envelope);
                metrics::record_listener_failures(report.failed);
            }
            Err(ProtocolError::Empty) => {
                self.shared.status.update(|s| {
                    s.last_event_at = Some(now_ms());
                    s.last_error = None;
                });
            }
            Err(e) => self.drop_message(&e.to_string()),
        }
    }

    fn on_rejected(&mut self, attempt: u64, reason: &str) {
        if !self.is_current(attempt) {
            return;
        }
        metrics::record_message(CHANNEL);
        self.drop_message(reason);
    }

    /// Report a message that never reached the listeners.
    fn drop_message(&self, reason: &str) {
        warn!(error = reason, "Dropping undecodable message");
        metrics::record_decode_error(CHANNEL);
        self.shared.status.update(|s| {
            s.last_event_at = Some(now_ms());
            s.last_error = Some(format!("Invalid message: {reason}"));
        });
    }

    fn on_closed(&mut self, attempt: u64, reason: CloseReason) {
        if !self.is_current(attempt) {
            trace!(attempt, "Ignoring close of stale connection");
            return;
        }
        self.link = Link::Idle;
        self.keepalive = None;
        metrics::record_connection_closed(CHANNEL);

        let error = reason.reason.clone().or_else(|| {
            (!reason.clean).then(|| "Connection closed unexpectedly".to_string())
        });
        if reason.clean {
            info!(attempt, reason = %reason, "Connection closed by peer");
        } else {
            warn!(attempt, reason = %reason, "Connection lost");
        }
        self.shared.status.update(|s| {
            s.connected = false;
            s.last_error = error;
        });

        if reason.clean && self.should_stay_connected {
            self.failures.reset();
            self.schedule_reconnect(self.failures.policy().delay);
            return;
        }
        self.on_failure();
    }

    fn on_failure(&mut self) {
        if !self.should_stay_connected {
            self.shared.status.update(|s| s.phase = ConnectionPhase::Idle);
            return;
        }

        match self.failures.record_failure() {
            Some(delay) => self.schedule_reconnect(delay),
            None => {
                warn!(
                    failures = self.failures.count(),
                    "Giving up after repeated failures, waiting for an explicit connect"
                );
                self.shared.status.update(|s| {
                    s.connected = false;
                    s.phase = ConnectionPhase::Degraded;
                });
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if self.reconnect_at.is_some() {
            return;
        }
        self.reconnect_at = Some(Instant::now() + delay);
        metrics::record_reconnect_scheduled(CHANNEL);

        self.shared.status.update(|s| {
            s.reconnect_attempts += 1;
            s.phase = ConnectionPhase::ReconnectScheduled;
        });
        debug!(
            delay_ms = delay.as_millis() as u64,
            failures = self.failures.count(),
            "Reconnect scheduled"
        );
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        if self.should_stay_connected {
            self.ensure();
        }
    }

    fn send_ping(&mut self) {
        if let Link::Open { outbound, .. } = &self.link {
            trace!("Sending keep-alive ping");
            send_frame(outbound, &ControlFrame::ping(now_ms()));
        }
    }

    /// Close whatever link exists and forget it.
    fn close_link(&mut self, reason: &'static str) {
        if let Link::Open { outbound, .. } = std::mem::replace(&mut self.link, Link::Idle) {
            let _ = outbound.send(Outbound::Close(reason));
            metrics::record_connection_closed(CHANNEL);
        }
        self.keepalive = None;
    }

    /// Return to idle: no link, no timers, initial status.
    fn teardown(&mut self) {
        self.should_stay_connected = false;
        self.explicit = false;
        self.replace_pending = false;
        self.reconnect_at = None;
        self.failures.reset();
        self.close_link(CLOSE_MANUAL);
        self.shared.status.reset();
    }

    fn is_current(&self, attempt: u64) -> bool {
        matches!(self.link, Link::Open { attempt: current, .. } if current == attempt)
    }
}

fn send_frame(outbound: &mpsc::UnboundedSender<Outbound>, frame: &ControlFrame) {
    match codec::encode_control(frame) {
        Ok(text) => {
            if outbound.send(Outbound::Text(text)).is_err() {
                debug!("Connection gone, control frame dropped");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode control frame"),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// Connect, then pump messages both ways until either side closes.
async fn run_attempt(
    attempt: u64,
    url: String,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut conn = match tokio::time::timeout(connect_timeout, connector.connect(&url)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(error)) => {
            let _ = events.send(Event::ConnectFailed { attempt, error });
            return;
        }
        Err(_) => {
            let _ = events.send(Event::ConnectFailed {
                attempt,
                error: TransportError::Timeout,
            });
            return;
        }
    };

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    if events.send(Event::Opened { attempt, outbound }).is_err() {
        let _ = conn.close(CLOSE_MANUAL).await;
        return;
    }

    loop {
        tokio::select! {
            command = outbound_rx.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = conn.send_text(text).await {
                        warn!(attempt, error = %e, "Send failed");
                    }
                }
                Some(Outbound::Close(reason)) => {
                    if let Err(e) = conn.close(reason).await {
                        debug!(attempt, error = %e, "Close failed");
                    }
                    return;
                }
                None => {
                    if let Err(e) = conn.close(CLOSE_MANUAL).await {
                        debug!(attempt, error = %e, "Close failed");
                    }
                    return;
                }
            },
            inbound = conn.recv() => {
                let event = match inbound {
                    Ok(Inbound::Message(payload)) => Event::Message { attempt, payload },
                    Ok(Inbound::Rejected(reason)) => Event::Rejected { attempt, reason },
                    Ok(Inbound::Closed(reason)) => Event::Closed { attempt, reason },
                    Err(e) => Event::Closed {
                        attempt,
                        reason: CloseReason::unclean(e.to_string()),
                    },
                };
                let closed = matches!(event, Event::Closed { .. });
                if events.send(event).is_err() || closed {
                    if !closed {
                        let _ = conn.close(CLOSE_MANUAL).await;
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shopfloor_core::SessionSettings;
    use shopfloor_transport::memory::{self, MemoryConnector, MemoryPeer, MemoryServer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const API_URL: &str = "http://erp.local:8000/api";

    fn start(token: Option<&str>) -> (ConnectionManager, MemoryServer, Arc<SessionSettings>) {
        let (connector, server) = memory::pair();
        let (manager, settings) = start_with(ManagerConfig::default(), connector, token);
        (manager, server, settings)
    }

    fn start_with(
        config: ManagerConfig,
        connector: MemoryConnector,
        token: Option<&str>,
    ) -> (ConnectionManager, Arc<SessionSettings>) {
        let settings = Arc::new(SessionSettings::new(
            Some(API_URL.to_string()),
            token.map(str::to_string),
        ));
        let manager = ConnectionManager::spawn(
            config,
            Arc::new(connector),
            Arc::clone(&settings) as Arc<dyn EndpointSource>,
        );
        (manager, settings)
    }

    /// Let every task run until the runtime is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn accept(server: &mut MemoryServer) -> MemoryPeer {
        let peer = server.next().await.unwrap().accept();
        settle().await;
        peer
    }

    fn counting_listener() -> (Arc<AtomicUsize>, impl Fn(&Envelope) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        (count, move |_: &Envelope| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_connects_and_dispatches() {
        let (manager, mut server, _) = start(None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let _sub = manager
            .subscribe(move |envelope| sink.lock().unwrap().push(envelope.kind.clone()))
            .await;
        assert_eq!(manager.listener_count(), 1);
        assert_eq!(manager.current_status().phase, ConnectionPhase::Connecting);

        let pending = server.next().await.unwrap();
        assert_eq!(pending.endpoint(), "ws://erp.local:8000/ws/orders");
        let peer = pending.accept();
        settle().await;

        let status = manager.current_status();
        assert!(status.connected);
        assert_eq!(status.phase, ConnectionPhase::Open);
        assert!(status.last_event_at.is_none());

        peer.send_text(r#"{"type":"order_created","order_id":1}"#);
        peer.send_text(r#"{"type":"brand_new_kind"}"#);
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["order_created", "brand_new_kind"]);
        assert!(manager.current_status().last_event_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_sent_after_open() {
        let (manager, mut server, _) = start(Some("secret"));
        let _sub = manager.subscribe(|_| {}).await;

        let pending = server.next().await.unwrap();
        assert_eq!(
            pending.endpoint(),
            "ws://erp.local:8000/ws/orders?token=secret"
        );
        let mut peer = pending.accept();

        let frame: serde_json::Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(frame, json!({"type": "authenticate", "token": "secret"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping_every_interval() {
        let (manager, mut server, _) = start(None);
        manager.connect().await;
        let mut peer = accept(&mut server).await;

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(peer.try_recv().is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let frame: serde_json::Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "ping");
        assert!(frame["timestamp"].is_u64());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(peer.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_follows_listeners() {
        let (manager, mut server, _) = start(None);

        let first = manager.subscribe(|_| {}).await;
        let second = manager.subscribe(|_| {}).await;
        let mut peer = accept(&mut server).await;
        assert_eq!(server.attempts(), 1);

        first.unsubscribe().await;
        settle().await;
        assert!(manager.current_status().connected);
        assert!(peer.try_recv().is_none());

        second.unsubscribe().await;
        assert!(peer.recv().await.is_none());
        assert_eq!(peer.close_reason(), Some("Manual disconnect"));
        assert_eq!(manager.listener_count(), 0);
        assert_eq!(manager.current_status(), StatusSnapshot::initial());

        // Recreated on the next subscription
        let _third = manager.subscribe(|_| {}).await;
        let _peer = accept(&mut server).await;
        assert!(manager.current_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_subscription_tears_down() {
        let (manager, mut server, _) = start(None);
        let sub = manager.subscribe(|_| {}).await;
        let mut peer = accept(&mut server).await;

        drop(sub);
        assert!(peer.recv().await.is_none());
        settle().await;
        assert!(!manager.current_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_connect_outlives_listeners() {
        let (manager, mut server, _) = start(None);
        manager.connect().await;
        let mut peer = accept(&mut server).await;

        let sub = manager.subscribe(|_| {}).await;
        sub.unsubscribe().await;
        settle().await;

        assert!(manager.current_status().connected);
        assert!(peer.try_recv().is_none());
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_stop_fanout() {
        let (manager, mut server, _) = start(None);
        let (first_count, first) = counting_listener();
        let (last_count, last) = counting_listener();

        let _a = manager.subscribe(first).await;
        let _b = manager.subscribe(|_| panic!("listener failure")).await;
        let _c = manager.subscribe(last).await;
        let peer = accept(&mut server).await;

        peer.send_text(r#"{"type":"order_deleted","order_id":4}"#);
        peer.send_text(r#"{"type":"order_deleted","order_id":5}"#);
        settle().await;

        assert_eq!(first_count.load(Ordering::SeqCst), 2);
        assert_eq!(last_count.load(Ordering::SeqCst), 2);
        assert!(manager.current_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclean_close_schedules_reconnect() {
        let (manager, mut server, _) = start(None);
        let _sub = manager.subscribe(|_| {}).await;
        let peer = accept(&mut server).await;

        drop(peer);
        settle().await;
        let status = manager.current_status();
        assert!(!status.connected);
        assert_eq!(status.phase, ConnectionPhase::ReconnectScheduled);
        assert_eq!(status.reconnect_attempts, 1);
        assert!(status.last_error.is_some());

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(server.try_next().is_none());

        let _peer = accept(&mut server).await;
        let status = manager.current_status();
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_reconnects_without_error() {
        let (manager, mut server, _) = start(None);
        let _sub = manager.subscribe(|_| {}).await;
        let peer = accept(&mut server).await;

        peer.close_clean();
        settle().await;
        let status = manager.current_status();
        assert_eq!(status.phase, ConnectionPhase::ReconnectScheduled);
        assert!(status.last_error.is_none());

        let _peer = accept(&mut server).await;
        assert!(manager.current_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_unclean_closes_degrade() {
        let (manager, mut server, _) = start(None);
        let _sub = manager.subscribe(|_| {}).await;

        for _ in 0..3 {
            let peer = accept(&mut server).await;
            drop(peer);
            settle().await;
        }

        let status = manager.current_status();
        assert_eq!(status.phase, ConnectionPhase::Degraded);
        assert!(!status.connected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempts(), 3);

        // A new subscriber does not revive the connection
        let _late = manager.subscribe(|_| {}).await;
        settle().await;
        assert_eq!(server.attempts(), 3);
        assert!(server.try_next().is_none());

        // An explicit connect does
        manager.connect().await;
        let _peer = accept(&mut server).await;
        assert_eq!(server.attempts(), 4);
        assert!(manager.current_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connects_degrade() {
        let (manager, server, _) = start(None);
        server.set_refusing(true);

        let _sub = manager.subscribe(|_| {}).await;
        settle().await;
        assert_eq!(server.attempts(), 1);
        assert_eq!(manager.current_status().reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(server.attempts(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(server.attempts(), 3);
        assert_eq!(manager.current_status().phase, ConnectionPhase::Degraded);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(server.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let (manager, mut server, _) = start(None);
        let _sub = manager.subscribe(|_| {}).await;

        // Hold the handshake without answering
        let _pending = server.next().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        let status = manager.current_status();
        assert_eq!(status.phase, ConnectionPhase::ReconnectScheduled);
        assert_eq!(status.last_error.as_deref(), Some("Connection timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (manager, mut server, _) = start(None);
        let _sub = manager.subscribe(|_| {}).await;
        let peer = accept(&mut server).await;

        drop(peer);
        settle().await;
        assert_eq!(
            manager.current_status().phase,
            ConnectionPhase::ReconnectScheduled
        );

        manager.disconnect().await;
        assert_eq!(manager.current_status(), StatusSnapshot::initial());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(server.attempts(), 1);
        assert!(server.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_base_url_reports_without_retry() {
        let (connector, server) = memory::pair();
        let manager = ConnectionManager::spawn(
            ManagerConfig::default(),
            Arc::new(connector),
            Arc::new(SessionSettings::default()),
        );

        let _sub = manager.subscribe(|_| {}).await;
        let status = manager.current_status();
        assert!(!status.connected);
        assert_eq!(status.phase, ConnectionPhase::Idle);
        assert_eq!(
            status.last_error.as_deref(),
            Some("API base URL is not configured")
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(server.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_endpoint_is_noop() {
        let (manager, mut server, _) = start(None);
        let _a = manager.subscribe(|_| {}).await;
        let _b = manager.subscribe(|_| {}).await;
        manager.connect().await;
        let _peer = accept(&mut server).await;

        manager.connect().await;
        let _c = manager.subscribe(|_| {}).await;
        settle().await;
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_change_replaces_open_connection() {
        let (manager, mut server, settings) = start(Some("one"));
        manager.connect().await;
        let mut old = accept(&mut server).await;
        assert!(old.endpoint().ends_with("token=one"));
        assert!(old.recv().await.is_some()); // authenticate

        settings.set_token(Some("two".to_string()));
        manager.connect().await;
        assert!(old.recv().await.is_none());
        assert_eq!(old.close_reason(), Some("Reconnecting"));

        let new = accept(&mut server).await;
        assert!(new.endpoint().ends_with("token=two"));
        assert!(manager.current_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_change_during_handshake_waits() {
        let (manager, mut server, settings) = start(Some("one"));
        let _a = manager.subscribe(|_| {}).await;
        let first = server.next().await.unwrap();

        settings.set_token(Some("two".to_string()));
        let _b = manager.subscribe(|_| {}).await;
        settle().await;
        assert!(server.try_next().is_none());

        // The first handshake completes, is closed, and the replacement opens
        let mut old = first.accept();
        assert!(old.recv().await.is_none());

        let new = accept(&mut server).await;
        assert!(new.endpoint().ends_with("token=two"));
        assert!(manager.current_status().connected);
        assert_eq!(server.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handshake_then_replacement() {
        let (manager, mut server, settings) = start(Some("one"));
        let _a = manager.subscribe(|_| {}).await;
        let first = server.next().await.unwrap();

        settings.set_token(Some("two".to_string()));
        manager.connect().await;
        first.reject("handshake failed");

        let new = accept(&mut server).await;
        assert!(new.endpoint().ends_with("token=two"));
        assert_eq!(manager.current_status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_keeps_connection() {
        let (manager, mut server, _) = start(None);
        let (count, listener) = counting_listener();
        let _sub = manager.subscribe(listener).await;
        let peer = accept(&mut server).await;

        peer.send_text("not json");
        settle().await;
        let status = manager.current_status();
        assert!(status.connected);
        assert!(status.last_error.unwrap().starts_with("Invalid message"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        peer.send_text("   ");
        peer.send_text(r#"{"type":"heartbeat"}"#);
        settle().await;
        assert!(manager.current_status().last_error.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_message_keeps_connection() {
        let (connector, mut server) = memory::pair();
        let config = ManagerConfig {
            max_message_size: 64,
            ..ManagerConfig::default()
        };
        let (manager, _) = start_with(config, connector, None);
        let (count, listener) = counting_listener();
        let _sub = manager.subscribe(listener).await;
        let peer = accept(&mut server).await;

        let padding = "x".repeat(100);
        peer.send_text(format!(r#"{{"type":"order_created","order_id":1,"note":"{padding}"}}"#));
        settle().await;

        let status = manager.current_status();
        assert!(status.connected);
        assert_eq!(status.phase, ConnectionPhase::Open);
        assert!(status
            .last_error
            .unwrap()
            .starts_with("Invalid message: Message size"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        peer.send_text(r#"{"type":"order_created","order_id":2}"#);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.current_status().last_error.is_none());
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_rejection_keeps_connection() {
        let (connector, mut server) = memory::pair();
        let connector = connector.with_max_message_size(48);
        let (manager, _) = start_with(ManagerConfig::default(), connector, None);
        let (count, listener) = counting_listener();
        let _sub = manager.subscribe(listener).await;
        let peer = accept(&mut server).await;

        for _ in 0..3 {
            peer.send_text(format!(r#"{{"type":"order_created","note":"{}"}}"#, "x".repeat(64)));
        }
        settle().await;

        let status = manager.current_status();
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(
            status.last_error.as_deref(),
            Some("Invalid message: Message size 98 exceeds maximum 48")
        );

        peer.send_text(r#"{"type":"order_deleted","order_id":3}"#);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_keepalive_disables_pings() {
        let (connector, mut server) = memory::pair();
        let config = ManagerConfig {
            keepalive_interval: Duration::ZERO,
            ..ManagerConfig::default()
        };
        let (manager, _) = start_with(config, connector, None);
        let (count, listener) = counting_listener();
        let _sub = manager.subscribe(listener).await;
        let mut peer = accept(&mut server).await;
        assert!(manager.current_status().connected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(peer.try_recv().is_none());

        peer.send_text(r#"{"type":"heartbeat"}"#);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.current_status().phase, ConnectionPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_observer() {
        let (manager, mut server, _) = start(None);
        let phases = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&phases);
        let guard = manager.on_status(move |status| sink.lock().unwrap().push(status.phase));
        assert_eq!(*phases.lock().unwrap(), vec![ConnectionPhase::Idle]);

        let _sub = manager.subscribe(|_| {}).await;
        let _peer = accept(&mut server).await;
        assert_eq!(
            *phases.lock().unwrap(),
            vec![
                ConnectionPhase::Idle,
                ConnectionPhase::Connecting,
                ConnectionPhase::Open
            ]
        );

        guard.unsubscribe();
        manager.disconnect().await;
        assert_eq!(phases.lock().unwrap().len(), 3);

        let rx = manager.watch_status();
        assert_eq!(*rx.borrow(), StatusSnapshot::initial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_install() {
        let (manager, _server, _) = start(None);
        assert!(install_global(manager.clone()).is_ok());
        assert!(install_global(manager).is_err());
        assert!(global().is_some());
    }
}
