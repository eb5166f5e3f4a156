//! Push channel connection manager.
//!
//! Owns the single WebSocket connection of a session: connect with a bearer
//! credential, heartbeat while open, and reconnect with exponential backoff
//! after an abnormal close.

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use crate::error::ConnectionError;
use crate::models::{HEARTBEAT_FRAME, InboundFrame, MessageUpdate};
use crate::subscription::Subscription;

/// Close code sent and expected for a client-initiated close.
const NORMAL_CLOSE: u16 = 1000;
/// Reported when the stream ends without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingConnect = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

/// Callback notified with `true` on open and `false` on close or failure.
pub type ConnectionListener = Arc<dyn Fn(bool) + Send + Sync>;
/// Callback receiving every parsed `message_update` frame.
pub type UpdateListener = Arc<dyn Fn(MessageUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Push channel configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct Session {
    outbound: mpsc::UnboundedSender<WsMessage>,
    heartbeat: JoinHandle<()>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    state: ConnectionState,
    /// Bumped on every connect attempt and on close; events from an older
    /// generation are ignored.
    generation: u64,
    pending: Option<PendingConnect>,
    connect_task: Option<AbortHandle>,
    session: Option<Session>,
    reconnect_task: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    credential: Option<String>,
}

struct ConnectionInner {
    config: ConnectionConfig,
    slot: Mutex<Slot>,
    listeners: Mutex<Vec<(u64, ConnectionListener)>>,
    update_listeners: Mutex<Vec<(u64, UpdateListener)>>,
    next_listener_id: AtomicU64,
}

/// Manages the session's single push channel connection.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                slot: Mutex::new(Slot::default()),
                listeners: Mutex::new(Vec::new()),
                update_listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open the push channel.
    ///
    /// Returns immediately when already connected. Calls made while an
    /// attempt is in flight await that same attempt.
    pub async fn connect(&self, credential: &str) -> Result<(), ConnectionError> {
        self.inner.connect(credential).await
    }

    /// Close the channel with a normal close code. No reconnection follows
    /// and every timer is cancelled.
    pub fn close(&self) {
        let (was_connected, outbound) = {
            let mut slot = self.inner.slot.lock();
            slot.generation += 1;
            slot.pending = None;
            slot.credential = None;
            slot.reconnect_attempts = 0;
            if let Some(task) = slot.connect_task.take() {
                task.abort();
            }
            if let Some(task) = slot.reconnect_task.take() {
                task.abort();
            }
            let outbound = slot.session.take().map(|session| {
                session.heartbeat.abort();
                session.reader.abort();
                session.outbound
            });
            let was_connected = slot.state == ConnectionState::Connected;
            slot.state = ConnectionState::Disconnected;
            (was_connected, outbound)
        };

        if let Some(outbound) = outbound {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("client closed"),
            };
            let _ = outbound.send(WsMessage::Close(Some(frame)));
        }

        if was_connected {
            info!("Push channel closed by client");
            self.inner.notify_listeners(false);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().state
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.slot.lock().reconnect_attempts
    }

    /// Write a raw text frame.
    pub fn send(&self, raw: impl Into<String>) -> Result<(), ConnectionError> {
        let raw: String = raw.into();
        let slot = self.inner.slot.lock();
        let session = slot.session.as_ref().ok_or(ConnectionError::NotConnected)?;
        session
            .outbound
            .send(WsMessage::Text(raw.into()))
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Register a connection state listener.
    pub fn add_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Register a sink for inbound `message_update` frames.
    pub fn add_update_listener(
        &self,
        listener: impl Fn(MessageUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .update_listeners
            .lock()
            .push((id, Arc::new(listener)));
        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.update_listeners.lock().retain(|(entry, _)| *entry != id);
            }
        })
    }
}

impl ConnectionInner {
    async fn connect(self: &Arc<Self>, credential: &str) -> Result<(), ConnectionError> {
        let pending = {
            let mut slot = self.slot.lock();
            if slot.state == ConnectionState::Connected {
                return Ok(());
            }
            match &slot.pending {
                Some(pending) => pending.clone(),
                None => {
                    slot.state = ConnectionState::Connecting;
                    slot.generation += 1;
                    slot.credential = Some(credential.to_string());
                    let generation = slot.generation;

                    let inner = Arc::clone(self);
                    let credential = credential.to_string();
                    let task = tokio::spawn(async move { inner.open(credential, generation).await });
                    slot.connect_task = Some(task.abort_handle());

                    let pending = async move {
                        task.await.unwrap_or_else(|err| {
                            if err.is_cancelled() {
                                Err(ConnectionError::Closed)
                            } else {
                                Err(ConnectionError::Transport(format!(
                                    "connect task failed: {}",
                                    err
                                )))
                            }
                        })
                    }
                    .boxed()
                    .shared();
                    slot.pending = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn open(self: Arc<Self>, credential: String, generation: u64) -> Result<(), ConnectionError> {
        debug!(url = %self.config.url, "Opening push channel");
        let result = self.establish(&credential).await;

        let mut slot = self.slot.lock();
        if slot.generation != generation {
            // Closed or superseded while the handshake was running.
            return Err(ConnectionError::Closed);
        }
        slot.pending = None;
        slot.connect_task = None;

        match result {
            Ok(socket) => {
                slot.session = Some(self.spawn_session(socket, generation));
                slot.state = ConnectionState::Connected;
                slot.reconnect_attempts = 0;
                drop(slot);
                info!(url = %self.config.url, "Push channel connected");
                self.notify_listeners(true);
                Ok(())
            }
            Err(error) => {
                slot.state = ConnectionState::Disconnected;
                drop(slot);
                warn!(error = %error, "Push channel connect failed");
                self.notify_listeners(false);
                Err(error)
            }
        }
    }

    async fn establish(&self, credential: &str) -> Result<WsStream, ConnectionError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectionError::Transport(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
            .map_err(|_| ConnectionError::InvalidCredential)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match tokio::time::timeout(self.config.connect_timeout, connect_async(request)).await {
            Err(_) => Err(ConnectionError::Timeout(self.config.connect_timeout)),
            Ok(Err(WsError::Http(response))) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(ConnectionError::Unauthorized)
            }
            Ok(Err(err)) => Err(ConnectionError::Transport(err.to_string())),
            Ok(Ok((socket, _))) => Ok(socket),
        }
    }

    fn spawn_session(self: &Arc<Self>, socket: WsStream, generation: u64) -> Session {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        // The writer ends after a close frame or once every sender is gone.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!("Push channel write failed: {}", err);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let heartbeat_tx = outbound.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if heartbeat_tx
                    .send(WsMessage::Text(Utf8Bytes::from_static(HEARTBEAT_FRAME)))
                    .is_err()
                {
                    break;
                }
            }
        });

        let inner = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let mut close_code = None;
            while let Some(result) = stream.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => inner.handle_frame(text.as_str()),
                    Ok(WsMessage::Close(frame)) => {
                        close_code = Some(frame.map_or(ABNORMAL_CLOSE, |frame| u16::from(frame.code)));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("Push channel read failed: {}", err);
                        break;
                    }
                }
            }
            inner.handle_disconnect(generation, close_code.unwrap_or(ABNORMAL_CLOSE));
        });

        Session {
            outbound,
            heartbeat,
            reader,
        }
    }

    fn handle_frame(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::MessageUpdate(frame)) => {
                let update = MessageUpdate::from(frame);
                let listeners: Vec<UpdateListener> = self
                    .update_listeners
                    .lock()
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect();
                for listener in listeners {
                    listener(update.clone());
                }
            }
            Ok(InboundFrame::Unknown) => {}
            Err(error) => warn!(error = %error, "Dropping malformed push frame"),
        }
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64, code: u16) {
        {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return;
            }
            slot.state = ConnectionState::Disconnected;
            if let Some(session) = slot.session.take() {
                session.heartbeat.abort();
            }
        }

        self.notify_listeners(false);

        if code == NORMAL_CLOSE {
            info!("Push channel closed normally");
            return;
        }
        warn!(
            error = %ConnectionError::AbnormalClose { code },
            "Push channel dropped"
        );
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut slot = self.slot.lock();
        let Some(credential) = slot.credential.clone() else {
            return;
        };
        if let Some(task) = slot.reconnect_task.take() {
            task.abort();
        }
        let inner = Arc::clone(self);
        slot.reconnect_task = Some(tokio::spawn(async move {
            inner.reconnect_loop(credential).await;
        }));
    }

    async fn reconnect_loop(self: Arc<Self>, credential: String) {
        loop {
            let (attempt, delay) = {
                let mut slot = self.slot.lock();
                let attempt = slot.reconnect_attempts;
                match self.config.reconnect.delay_for(attempt) {
                    Some(delay) => {
                        slot.reconnect_attempts += 1;
                        (attempt, delay)
                    }
                    None => {
                        warn!(
                            attempts = attempt,
                            "Giving up on push channel reconnection"
                        );
                        return;
                    }
                }
            };

            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduling push channel reconnect"
            );
            tokio::time::sleep(delay).await;

            match self.connect(&credential).await {
                Ok(()) => return,
                Err(ConnectionError::Closed) => return,
                Err(error) => warn!(attempt = attempt + 1, error = %error, "Reconnect attempt failed"),
            }
        }
    }

    fn notify_listeners(&self, connected: bool) {
        let listeners: Vec<ConnectionListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(connected);
        }
    }
}
