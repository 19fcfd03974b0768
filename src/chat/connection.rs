use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chat::protocol::{Command, Frame, Heartbeat};
use crate::chat::registry::{Delivery, RoomFeed, SubscriptionRegistry};
use crate::chat::transport::{Transport, TransportEvent, TransportLink, WsTransport};
use crate::config::ChatConfig;
use crate::models::RoomId;

/// Failure of a connection attempt. Cloned to every caller that was waiting
/// on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("broker rejected the connection: {0}")]
    Rejected(String),
    #[error("connection closed during handshake")]
    Closed,
    #[error("no CONNECTED frame within {0:?}")]
    Timeout(Duration),
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
    #[error("invalid chat endpoint: {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A handshake completed.
    Connected,
    /// An established link went away without `disconnect()`.
    Dropped,
    /// The link came back after a drop. Room subscriptions are not restored
    /// on the broker; call [`ConnectionManager::resubscribe_all`] to do so.
    Reconnected,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct LinkState {
    /// Bumped by every `disconnect()`; attempts and reconnect loops started
    /// under an older epoch give up.
    epoch: u64,
    next_session_id: u64,
    pending: Option<ConnectAttempt>,
    session: Option<Session>,
}

struct Inner {
    config: ChatConfig,
    transport: Arc<dyn Transport>,
    registry: SubscriptionRegistry,
    link: Mutex<LinkState>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// The one shared broker connection of an application session, together
/// with its room subscriptions.
///
/// Construct it once at the top of the application and clone the handle
/// into every component that needs chat; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ChatConfig) -> Self {
        Self::with_transport(config, Arc::new(WsTransport))
    }

    pub fn with_transport(config: ChatConfig, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry: SubscriptionRegistry::new(),
                link: Mutex::new(LinkState::default()),
                state,
                events,
            }),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    /// Connect to the broker. Concurrent callers share a single handshake
    /// and all see its outcome; an established connection returns at once.
    /// A failed attempt leaves the manager disconnected so it can be retried.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let attempt = {
            let mut link = self.inner.lock_link();
            if link.session.is_some() {
                return Ok(());
            }
            match &link.pending {
                Some(attempt) => attempt.clone(),
                None => {
                    let task = tokio::spawn(Arc::clone(&self.inner).handshake(link.epoch));
                    let attempt: ConnectAttempt = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(ConnectionError::Transport(format!("handshake task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();

                    link.pending = Some(attempt.clone());
                    self.inner.state.send_replace(ConnectionState::Connecting);
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Drop every subscription, then close the link. Also stops any pending
    /// reconnect; an in-flight handshake resolves with
    /// [`ConnectionError::Cancelled`].
    pub async fn disconnect(&self) {
        // UNSUBSCRIBEs go out on the current link before it is taken.
        let removed = self
            .inner
            .registry
            .take_all(|frame| self.inner.send_frame(frame));
        let session = {
            let mut link = self.inner.lock_link();
            link.epoch += 1;
            link.pending = None;
            link.session.take()
        };
        drop(removed);

        let Some(mut session) = session else {
            self.inner.state.send_replace(ConnectionState::Disconnected);
            return;
        };

        if let Some(shutdown) = session.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(driver) = session.driver.take() {
            let _ = driver.await;
        }

        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!("Chat connection closed");
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to a room's live messages, connecting first if needed. Any
    /// existing subscription for the room is torn down and its feed closed.
    pub async fn subscribe(&self, room_id: RoomId) -> Result<RoomFeed, ConnectionError> {
        self.connect().await?;

        // Registered before SUBSCRIBE goes out, so no frame can beat it.
        let (feed, replaced) = self
            .inner
            .registry
            .register(room_id, |frame| self.inner.send_frame(frame));
        if let Some(old) = replaced {
            debug!("Replaced subscription {} for room {room_id}", old.id);
        }

        info!("Subscribed to room {room_id}");
        Ok(feed)
    }

    /// Cancel the room's subscription. No-op when there is none.
    pub fn unsubscribe(&self, room_id: RoomId) {
        let removed = self
            .inner
            .registry
            .remove(room_id, |frame| self.inner.send_frame(frame));
        if removed.is_some() {
            info!("Unsubscribed from room {room_id}");
        }
    }

    /// Cancel the room's subscription only if it is still `subscription_id`,
    /// leaving a newer subscription for the same room alone.
    pub fn release(&self, room_id: RoomId, subscription_id: &str) -> bool {
        let removed = self
            .inner
            .registry
            .remove_if(room_id, subscription_id, |frame| self.inner.send_frame(frame));
        if removed.is_some() {
            info!("Unsubscribed from room {room_id}");
        }
        removed.is_some()
    }

    /// Cancel every subscription. The connection itself stays up.
    pub fn unsubscribe_all(&self) {
        let removed = self
            .inner
            .registry
            .take_all(|frame| self.inner.send_frame(frame));
        if !removed.is_empty() {
            info!("Unsubscribed from {} rooms", removed.len());
        }
    }

    /// Re-send SUBSCRIBE for every registered room, typically after
    /// [`ConnectionEvent::Reconnected`]. Returns how many were sent.
    pub fn resubscribe_all(&self) -> usize {
        let sent = self
            .inner
            .registry
            .resubscribe(|frame| self.inner.send_frame(frame));
        if sent > 0 {
            info!("Re-subscribed to {sent} rooms");
        }
        sent
    }

    pub fn has_subscription(&self, room_id: RoomId) -> bool {
        self.inner.registry.contains(room_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }
}

impl Inner {
    fn lock_link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame on the current link. Returns false when there is none.
    /// Registry methods call this with the registry lock held, so the link
    /// lock is always taken second.
    fn send_frame(&self, frame: &Frame) -> bool {
        let link = self.lock_link();
        match &link.session {
            Some(session) => session.outbound.send(frame.encode()).is_ok(),
            None => {
                debug!("Not connected, {} frame not sent", frame.command.as_str());
                false
            }
        }
    }

    // Boxed: the session driver can call back into `connect()`, and the
    // spawned futures would otherwise form a cycle of opaque types.
    fn handshake(self: Arc<Self>, epoch: u64) -> BoxFuture<'static, Result<(), ConnectionError>> {
        async move { self.finish_handshake(epoch).await }.boxed()
    }

    async fn finish_handshake(self: Arc<Self>, epoch: u64) -> Result<(), ConnectionError> {
        let result = self.open_session().await;

        let mut link = self.lock_link();
        if link.epoch != epoch {
            // disconnect() ran while we were waiting; the new link is dropped.
            return Err(ConnectionError::Cancelled);
        }
        link.pending = None;

        match result {
            Ok((transport_link, heartbeat)) => {
                let id = link.next_session_id;
                link.next_session_id += 1;

                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let outbound = transport_link.outbound.clone();
                let driver = tokio::spawn(Arc::clone(&self).drive(
                    id,
                    transport_link,
                    heartbeat,
                    shutdown_rx,
                ));

                link.session = Some(Session {
                    id,
                    outbound,
                    shutdown: Some(shutdown_tx),
                    driver: Some(driver),
                });
                self.state.send_replace(ConnectionState::Connected);
                let _ = self.events.send(ConnectionEvent::Connected);
                info!(
                    "Connected to chat broker (heart-beat out {:?}, in {:?})",
                    heartbeat.outgoing, heartbeat.incoming
                );
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                warn!("Chat connection failed: {e}");
                Err(e)
            }
        }
    }

    /// Open the transport and run the STOMP handshake.
    async fn open_session(&self) -> Result<(TransportLink, Heartbeat), ConnectionError> {
        let url = self
            .config
            .ws_endpoint()
            .map_err(|e| ConnectionError::Endpoint(e.to_string()))?;
        let host = url.host_str().unwrap_or("localhost").to_string();

        let mut link = self
            .transport
            .open(url.to_string())
            .await
            .map_err(|e| ConnectionError::Transport(e.0))?;

        let ours = Heartbeat::new(self.config.heartbeat_outgoing, self.config.heartbeat_incoming);
        let connect = Frame::connect(&host, ours, self.config.access_token.as_deref());
        link.outbound
            .send(connect.encode())
            .map_err(|_| ConnectionError::Closed)?;

        let timeout = self.config.connect_timeout;
        let connected = tokio::time::timeout(timeout, await_connected(&mut link.inbound))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;

        let server = connected
            .get("heart-beat")
            .and_then(Heartbeat::parse)
            .unwrap_or_default();
        Ok((link, ours.negotiate(server)))
    }

    /// Runs for the lifetime of one session: routes inbound frames, sends
    /// heart-beats, and watches for a silent peer.
    async fn drive(
        self: Arc<Self>,
        session_id: u64,
        link: TransportLink,
        heartbeat: Heartbeat,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        let mut send_beat = beat_interval(heartbeat.outgoing);
        let mut check_beat = beat_interval(heartbeat.incoming);
        let mut last_inbound = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let _ = outbound.send(Frame::disconnect().encode());
                    return;
                }
                event = inbound.recv() => match event {
                    Some(TransportEvent::Text(text)) => {
                        last_inbound = Instant::now();
                        self.handle_inbound(&text);
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        break reason.unwrap_or_else(|| "closed by peer".to_string());
                    }
                    Some(TransportEvent::Error(e)) => break e,
                    None => break "transport went away".to_string(),
                },
                _ = send_beat.tick(), if !heartbeat.outgoing.is_zero() => {
                    if outbound.send("\n".to_string()).is_err() {
                        break "transport went away".to_string();
                    }
                }
                _ = check_beat.tick(), if !heartbeat.incoming.is_zero() => {
                    let silent = last_inbound.elapsed();
                    if silent > heartbeat.incoming * 2 {
                        break format!("no data from broker for {silent:?}");
                    }
                }
            }
        };

        drop(outbound);
        self.on_drop(session_id, &reason).await;
    }

    fn handle_inbound(&self, text: &str) {
        let frames = match Frame::parse_all(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Dropping unparsable frame: {e}");
                return;
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => match self.registry.dispatch(&frame) {
                    Ok(Delivery::Delivered(_)) => {}
                    Ok(Delivery::UnknownSubscription) => {
                        debug!("Dropping message for inactive subscription");
                    }
                    Ok(Delivery::FeedClosed(room_id)) => {
                        debug!("Feed for room {room_id} is closed, message dropped");
                    }
                    Err(e) => warn!("Dropping malformed message: {e}"),
                },
                Command::Error => warn!(
                    "Broker sent ERROR: {} {}",
                    frame.get("message").unwrap_or_default(),
                    frame.body
                ),
                Command::Receipt => debug!("Receipt {}", frame.get("receipt-id").unwrap_or_default()),
                other => debug!("Ignoring unexpected {} frame", other.as_str()),
            }
        }
    }

    /// The session's link died. Unless `disconnect()` already took the
    /// session, mark the manager disconnected and retry at the fixed
    /// reconnect delay until it succeeds or the manager is disconnected.
    async fn on_drop(self: Arc<Self>, session_id: u64, reason: &str) {
        let epoch = {
            let mut link = self.lock_link();
            if link.session.as_ref().map(|s| s.id) != Some(session_id) {
                return;
            }
            link.session = None;
            link.epoch
        };

        self.state.send_replace(ConnectionState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Dropped);
        warn!("Chat connection dropped: {reason}");

        let delay = self.config.reconnect_delay;
        let manager = ConnectionManager {
            inner: Arc::clone(&self),
        };
        loop {
            tokio::time::sleep(delay).await;
            if self.lock_link().epoch != epoch {
                return;
            }
            match manager.connect().await {
                Ok(()) => {
                    let _ = self.events.send(ConnectionEvent::Reconnected);
                    info!("Chat connection re-established");
                    return;
                }
                Err(ConnectionError::Cancelled) => return,
                Err(e) => warn!("Reconnect failed: {e}; retrying in {delay:?}"),
            }
        }
    }
}

async fn await_connected(
    inbound: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Result<Frame, ConnectionError> {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Text(text) => {
                let frames = Frame::parse_all(&text).map_err(|e| {
                    ConnectionError::Rejected(format!("unreadable handshake reply: {e}"))
                })?;
                for frame in frames {
                    match frame.command {
                        Command::Connected => return Ok(frame),
                        Command::Error => {
                            let message = frame
                                .get("message")
                                .map(str::to_owned)
                                .unwrap_or_else(|| frame.body.clone());
                            return Err(ConnectionError::Rejected(message));
                        }
                        other => debug!("Ignoring {} frame before CONNECTED", other.as_str()),
                    }
                }
            }
            TransportEvent::Closed(_) => return Err(ConnectionError::Closed),
            TransportEvent::Error(e) => return Err(ConnectionError::Transport(e)),
        }
    }
    Err(ConnectionError::Closed)
}

fn beat_interval(period: Duration) -> Interval {
    // Disabled directions still need an Interval for select!; its branch is
    // never polled.
    let period = if period.is_zero() {
        Duration::from_secs(3600)
    } else {
        period
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
