use std::{
    collections::BTreeSet,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{future, stream::BoxStream, Sink, SinkExt, StreamExt};
use shared::{
    domain::ProjectId,
    protocol::{parse_server_frame, ClientFrame, EventError, EventKind, RoomEvent},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{config::Settings, error::ChannelError};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type FrameStream = BoxStream<'static, anyhow::Result<String>>;

/// One live physical connection, as text frames in each direction.
pub struct ChannelConnection {
    pub outbound: FrameSink,
    pub inbound: FrameStream,
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<ChannelConnection, ChannelError>;
}

pub struct WsTransport {
    ws_url: Url,
}

impl WsTransport {
    pub fn new(ws_url: &str) -> Result<Self, ChannelError> {
        let ws_url = Url::parse(ws_url).map_err(|err| ChannelError::InvalidUrl {
            url: ws_url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(ChannelError::InvalidUrl {
                url: ws_url.to_string(),
                reason: "scheme must be ws:// or wss://".into(),
            });
        }
        Ok(Self { ws_url })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ChannelError> {
        Self::new(&settings.resolved_ws_url()?)
    }

    fn url_for(&self, token: &str) -> Url {
        let mut url = self.ws_url.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn connect(&self, token: &str) -> Result<ChannelConnection, ChannelError> {
        let url = self.url_for(token);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (ws_writer, ws_reader) = ws_stream.split();

        let outbound = ws_writer
            .sink_map_err(anyhow::Error::from)
            .with(|text: String| future::ready(Ok::<_, anyhow::Error>(Message::Text(text))));
        let inbound = ws_reader.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(_)) => Some(Err(anyhow::anyhow!("closed by server"))),
                Ok(_) => None,
                Err(err) => Some(Err(err.into())),
            })
        });

        Ok(ChannelConnection {
            outbound: Box::pin(outbound),
            inbound: inbound.boxed(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed connects tolerated before giving up.
    pub attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.reconnect_attempts,
            delay: Duration::from_millis(settings.reconnect_delay_ms),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

type Handler = Arc<dyn Fn(&RoomEvent) + Send + Sync>;

#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, EventKind, Handler)>>,
}

impl HandlerRegistry {
    fn register(&self, kind: EventKind, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, kind, handler));
        id
    }

    fn unregister(&self, id: u64) {
        lock(&self.entries).retain(|(existing, _, _)| *existing != id);
    }

    fn dispatch(&self, event: &RoomEvent) -> usize {
        let kind = event.event.kind();
        // Clone out of the lock so a handler may register or drop others.
        let matching: Vec<Handler> = lock(&self.entries)
            .iter()
            .filter(|(_, registered, _)| *registered == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in &matching {
            handler(event);
        }
        matching.len()
    }

    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Registration returned by [`Channel::on`]. Dropping it unregisters the
/// handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    registry: Weak<HandlerRegistry>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

struct ChannelShared {
    rooms: Mutex<BTreeSet<ProjectId>>,
    handlers: Arc<HandlerRegistry>,
    connected: watch::Sender<bool>,
    connections: AtomicU64,
    stopped: AtomicBool,
}

impl ChannelShared {
    fn rooms(&self) -> Vec<ProjectId> {
        lock(&self.rooms).iter().cloned().collect()
    }

    fn set_connected(&self, value: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }

    fn dispatch_text(&self, text: &str) {
        match parse_server_frame(text) {
            Ok(event) => {
                if !lock(&self.rooms).contains(&event.project_id) {
                    debug!(
                        project_id = %event.project_id,
                        kind = %event.event.kind(),
                        "ignoring event for a room we are not in"
                    );
                    return;
                }
                self.handlers.dispatch(&event);
            }
            Err(EventError::UnknownKind(kind)) => {
                debug!(kind = %kind, "ignoring unknown push event kind");
            }
            Err(err) => {
                warn!(error = %err, "dropping malformed push payload");
            }
        }
    }
}

pub struct Channel {
    token: String,
    shared: Arc<ChannelShared>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Starts the connection driver on the current tokio runtime.
    pub fn spawn(
        transport: Arc<dyn ChannelTransport>,
        token: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let token = token.into();
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(ChannelShared {
            rooms: Mutex::new(BTreeSet::new()),
            handlers: Arc::new(HandlerRegistry::default()),
            connected,
            connections: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(run_driver(
            transport,
            token.clone(),
            Arc::clone(&shared),
            outbound_rx,
            shutdown_rx,
            policy,
        ));

        Arc::new(Self {
            token,
            shared,
            outbound,
            shutdown,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Joins a project room. Remembered across reconnects.
    pub fn subscribe(&self, room: &ProjectId) {
        let inserted = lock(&self.shared.rooms).insert(room.clone());
        if inserted {
            info!(project_id = %room, "joining project room");
            self.emit(&ClientFrame::JoinProject {
                project_id: room.clone(),
            });
        }
    }

    pub fn unsubscribe(&self, room: &ProjectId) {
        let removed = lock(&self.shared.rooms).remove(room);
        if removed {
            info!(project_id = %room, "leaving project room");
            self.emit(&ClientFrame::LeaveProject {
                project_id: room.clone(),
            });
        }
    }

    pub fn rooms(&self) -> Vec<ProjectId> {
        self.shared.rooms()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        let id = self.shared.handlers.register(kind, Arc::new(handler));
        Subscription {
            id,
            kind,
            registry: Arc::downgrade(&self.shared.handlers),
        }
    }

    pub fn off(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.len()
    }

    /// Queues a frame for the live connection. Frames queued while offline
    /// are discarded on reconnect; delivery is best-effort.
    pub fn emit(&self, frame: &ClientFrame) -> bool {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, "failed to encode client frame");
                return false;
            }
        };
        self.outbound.send(text).is_ok()
    }

    pub fn connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Number of connections established so far. Lets a watcher spot a
    /// reconnect even when the offline interval was too short to observe.
    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// True once the channel was closed or its driver gave up reconnecting.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stops the driver. Registered handlers stay attached but never fire
    /// again.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.shared.set_connected(false);
    }

    /// Waits for the driver task to finish, e.g. after [`Channel::close`] or
    /// once the reconnect budget is exhausted.
    pub async fn closed(&self) {
        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

async fn run_driver(
    transport: Arc<dyn ChannelTransport>,
    token: String,
    shared: Arc<ChannelShared>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    policy: ReconnectPolicy,
) {
    let mut failures: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let connecting = tokio::select! {
            result = transport.connect(&token) => result,
            _ = shutdown_rx.changed() => break,
        };

        match connecting {
            Ok(connection) => {
                failures = 0;
                info!("push channel connected");
                let exit = pump(connection, &shared, &mut outbound_rx, &mut shutdown_rx).await;
                shared.set_connected(false);
                match exit {
                    PumpExit::Shutdown => break,
                    PumpExit::Lost(reason) => warn!(reason = %reason, "push channel disconnected"),
                }
            }
            Err(err) => {
                failures += 1;
                warn!(attempt = failures, error = %err, "push channel connect failed");
                if failures > policy.attempts {
                    error!(
                        attempts = policy.attempts,
                        "push channel reconnect attempts exhausted; staying offline"
                    );
                    break;
                }
            }
        }

        info!(
            attempt = failures + 1,
            delay_ms = policy.delay.as_millis() as u64,
            "push channel reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    shared.set_connected(false);
    shared.stopped.store(true, Ordering::Release);
    debug!("push channel driver stopped");
}

async fn pump(
    connection: ChannelConnection,
    shared: &ChannelShared,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> PumpExit {
    let ChannelConnection {
        mut outbound,
        mut inbound,
    } = connection;

    // The room set is authoritative; anything queued offline is stale.
    let mut discarded = 0usize;
    while outbound_rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(discarded, "dropped frames queued while offline");
    }

    for project_id in shared.rooms() {
        let frame = ClientFrame::JoinProject { project_id };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => return PumpExit::Lost(err.to_string()),
        };
        if let Err(err) = outbound.send(text).await {
            return PumpExit::Lost(format!("room re-join failed: {err}"));
        }
    }
    shared.connections.fetch_add(1, Ordering::AcqRel);
    shared.set_connected(true);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = outbound.close().await;
                return PumpExit::Shutdown;
            }
            frame = outbound_rx.recv() => match frame {
                Some(text) => {
                    if let Err(err) = outbound.send(text).await {
                        return PumpExit::Lost(format!("send failed: {err}"));
                    }
                }
                None => return PumpExit::Shutdown,
            },
            message = inbound.next() => match message {
                Some(Ok(text)) => shared.dispatch_text(&text),
                Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                None => return PumpExit::Lost("stream ended".into()),
            },
        }
    }
}

/// Process-wide holder of the session's channel. The only way to obtain a
/// [`Channel`]; tests build one over a fake transport.
pub struct ChannelProvider {
    transport: Arc<dyn ChannelTransport>,
    policy: ReconnectPolicy,
    current: Mutex<Option<Arc<Channel>>>,
}

impl ChannelProvider {
    pub fn new(transport: Arc<dyn ChannelTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            current: Mutex::new(None),
        }
    }

    /// Returns the live channel for `token`, creating it if needed. A
    /// different token means a new session: the old connection is torn down.
    pub fn connect(&self, token: &str) -> Arc<Channel> {
        let mut current = lock(&self.current);
        if let Some(existing) = current.as_ref() {
            if existing.token() == token && !existing.is_closed() {
                debug!("reusing existing push channel");
                return Arc::clone(existing);
            }
            if existing.token() == token {
                info!("push channel stopped; starting a new one");
            } else {
                info!("session changed; replacing push channel");
            }
            existing.close();
        }
        let channel = Channel::spawn(Arc::clone(&self.transport), token, self.policy);
        *current = Some(Arc::clone(&channel));
        channel
    }

    pub fn current(&self) -> Option<Arc<Channel>> {
        lock(&self.current).clone()
    }

    /// Tears the session's connection down and forgets it.
    pub fn disconnect(&self) {
        if let Some(channel) = lock(&self.current).take() {
            info!("closing push channel for ended session");
            channel.close();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
