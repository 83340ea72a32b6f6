//! Connection lifecycle
//!
//! [`BrokerRuntime`] owns the consumer, producer and admin sessions and is
//! the only writer of [`ConnectionState`]:
//!
//! ```text
//!                 connect()                 ok
//!  Disconnected ───────────▶ Connecting ─────────▶ Connected
//!       ▲                        │                    │
//!       │        open failure    │                    │ fault event
//!       └────────────────────────┘                    ▼
//!                                   connect()  ◀── Restarting
//!
//!  any state ── disconnect() ──▶ Stopped (terminal)
//! ```
//!
//! Faults reach the runtime as events on an unbounded channel with a single
//! supervisor task as consumer, so reconnects never overlap. Each successful
//! connect starts a new generation; fault events from an older generation
//! are discarded.

use crate::codec::Deserializer;
use crate::config::KafkaSettings;
use crate::dispatch::Dispatcher;
use crate::driver::{
    AdminSession, BrokerDriver, ConsumerOptions, ConsumerSession, FaultKind, ProducerSession,
};
use crate::envelope::RecordMetadata;
use crate::error::{Error, Result};
use crate::offsets::{self, OffsetSnapshot};
use crate::producer::{self, OutboundMessage};
use crate::registry::ResolvedRegistry;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Restarting,
    /// Terminal, reached only through `disconnect()`
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a restart happened, for audit logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartReason {
    /// Broker-reported fault
    Fault(FaultKind),
    /// A handler or decode failure
    EachMessage,
    /// The previous reconnect attempt failed
    ConnectFailed,
    /// Requested by the host
    Manual,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fault(kind) => kind.as_str(),
            Self::EachMessage => "each_message",
            Self::ConnectFailed => "connect_failed",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FaultKind> for RestartReason {
    fn from(kind: FaultKind) -> Self {
        Self::Fault(kind)
    }
}

/// Events processed by the supervisor
#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    Fault {
        reason: RestartReason,
        generation: u64,
    },
    Shutdown,
}

/// Sessions opened so far, closed together on failure or teardown
#[derive(Default)]
struct Sessions {
    consumer: Option<Arc<dyn ConsumerSession>>,
    producer: Option<Arc<dyn ProducerSession>>,
    admin: Option<Arc<dyn AdminSession>>,
}

impl Sessions {
    /// Close every open session concurrently; errors are logged, never returned
    async fn close_all(self) {
        let Sessions {
            consumer,
            producer,
            admin,
        } = self;

        let consumer = async move {
            if let Some(session) = consumer {
                if let Err(e) = session.close().await {
                    warn!(session = "consumer", error = %e, "Failed to close session");
                }
            }
        };
        let producer = async move {
            if let Some(session) = producer {
                if let Err(e) = session.close().await {
                    warn!(session = "producer", error = %e, "Failed to close session");
                }
            }
        };
        let admin = async move {
            if let Some(session) = admin {
                if let Err(e) = session.close().await {
                    warn!(session = "admin", error = %e, "Failed to close session");
                }
            }
        };
        futures::join!(consumer, producer, admin);
    }
}

struct ActiveSession {
    generation: u64,
    sessions: Sessions,
    cancel: CancellationToken,
    receive_loop: JoinHandle<()>,
}

struct Inner {
    settings: KafkaSettings,
    driver: Arc<dyn BrokerDriver>,
    registry: Arc<ResolvedRegistry>,
    deserializer: Arc<dyn Deserializer>,
    state: watch::Sender<ConnectionState>,
    /// Serializes connect, restart and teardown
    session: Mutex<Option<ActiveSession>>,
    /// Kept apart from `session` so handlers can send while a restart waits
    producer: RwLock<Option<Arc<dyn ProducerSession>>>,
    snapshot: RwLock<OffsetSnapshot>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    events_rx: SyncMutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
    supervisor: SyncMutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    restarts: AtomicU64,
    reconnect_failures: AtomicU32,
}

/// Builder for [`BrokerRuntime`]
pub struct RuntimeBuilder {
    settings: KafkaSettings,
    driver: Arc<dyn BrokerDriver>,
    registry: ResolvedRegistry,
    deserializer: Option<Arc<dyn Deserializer>>,
}

impl RuntimeBuilder {
    /// Handlers to dispatch to. Defaults to an empty registry.
    pub fn registry(mut self, registry: ResolvedRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Override the deserializer selected by `payload_format`
    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = Some(deserializer);
        self
    }

    pub fn build(self) -> BrokerRuntime {
        let deserializer = self
            .deserializer
            .unwrap_or_else(|| self.settings.payload_format.deserializer());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        BrokerRuntime {
            inner: Arc::new(Inner {
                settings: self.settings,
                driver: self.driver,
                registry: Arc::new(self.registry),
                deserializer,
                state,
                session: Mutex::new(None),
                producer: RwLock::new(None),
                snapshot: RwLock::new(OffsetSnapshot::default()),
                events_tx,
                events_rx: SyncMutex::new(Some(events_rx)),
                supervisor: SyncMutex::new(None),
                generation: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                reconnect_failures: AtomicU32::new(0),
            }),
        }
    }
}

/// Supervised broker connection. Cheap to clone.
///
/// Call [`BrokerRuntime::disconnect`] on shutdown; dropping the last handle
/// does not close the sessions.
#[derive(Clone)]
pub struct BrokerRuntime {
    inner: Arc<Inner>,
}

impl fmt::Debug for BrokerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerRuntime")
            .field("driver", &self.inner.driver.name())
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("topics", &self.inner.registry.len())
            .finish()
    }
}

impl BrokerRuntime {
    pub fn builder<D: BrokerDriver>(settings: KafkaSettings, driver: D) -> RuntimeBuilder {
        Self::builder_with_driver(settings, Arc::new(driver))
    }

    pub fn builder_with_driver(settings: KafkaSettings, driver: Arc<dyn BrokerDriver>) -> RuntimeBuilder {
        RuntimeBuilder {
            settings,
            driver,
            registry: ResolvedRegistry::default(),
            deserializer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Restarts performed so far (restarts ignored because of `Stopped` are not counted)
    pub fn restart_count(&self) -> u64 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Successful connects so far
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &ResolvedRegistry {
        &self.inner.registry
    }

    /// Watermarks taken by the latest connect
    pub fn offset_snapshot(&self) -> OffsetSnapshot {
        self.inner.snapshot.read().clone()
    }

    fn is_stopped(&self) -> bool {
        self.state() == ConnectionState::Stopped
    }

    /// Move to `next` unless stopped. Returns false when stopped.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut allowed = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Stopped {
                return false;
            }
            allowed = true;
            if *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "Connection state change");
            *state = next;
            true
        });
        allowed
    }

    // ========================================================================
    // Host hooks
    // ========================================================================

    /// "Application ready" hook.
    ///
    /// Validates the settings, starts the supervisor and, when `auto_connect`
    /// is set, connects in the background after `startup_delay`. A failed
    /// connect is retried through the restart path. Only configuration errors
    /// are returned.
    pub async fn start(&self) -> Result<()> {
        let settings = &self.inner.settings;
        if !settings.enabled {
            info!("Broker runtime disabled, not connecting");
            return Ok(());
        }
        validate(settings)?;
        if self.is_stopped() {
            return Err(Error::Stopped);
        }

        self.ensure_supervisor();
        if !settings.auto_connect {
            info!("Auto-connect disabled, waiting for an explicit connect()");
            return Ok(());
        }

        let runtime = self.clone();
        let delay = settings.startup_delay;
        info!(
            driver = self.inner.driver.name(),
            brokers = ?settings.bootstrap_servers,
            delay_ms = delay.as_millis() as u64,
            "Scheduling broker connect"
        );
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = runtime.connect().await {
                runtime.on_connect_failure(e);
            }
        });
        Ok(())
    }

    /// Open consumer, producer and admin sessions, snapshot watermarks,
    /// subscribe, arm the receive loop, apply seeks and start consuming.
    ///
    /// A failure closes whatever was opened and leaves `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_supervisor();
        let mut slot = self.inner.session.lock().await;
        self.connect_locked(&mut slot).await
    }

    /// Full reconnect. A no-op once stopped.
    ///
    /// Waits for the current receive loop to finish, so a handler must not
    /// await this; use [`BrokerRuntime::request_restart`] instead.
    pub async fn restart(&self, reason: RestartReason) {
        if self.is_stopped() {
            debug!(reason = %reason, "Runtime stopped, ignoring restart");
            return;
        }
        let count = self.inner.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reason = %reason, restarts = count, "Broker consumer {}, restarting", reason);

        let mut slot = self.inner.session.lock().await;
        if !self.transition(ConnectionState::Restarting) {
            debug!(reason = %reason, "Runtime stopped while waiting to restart");
            return;
        }

        match self.connect_locked(&mut slot).await {
            Ok(()) => {}
            Err(e) => {
                drop(slot);
                self.on_connect_failure(e);
            }
        }
    }

    /// Queue a restart for the supervisor without waiting for it
    pub fn request_restart(&self, reason: RestartReason) {
        self.emit(reason);
    }

    /// Shutdown hook: mark `Stopped`, stop the receive loop (an in-flight
    /// handler finishes first) and close every session. Idempotent.
    pub async fn disconnect(&self) {
        let previous = self.inner.state.send_replace(ConnectionState::Stopped);
        if previous != ConnectionState::Stopped {
            info!(from = %previous, "Disconnecting broker runtime");
        }
        let _ = self.inner.events_tx.send(LifecycleEvent::Shutdown);

        let active = self.inner.session.lock().await.take();
        if let Some(active) = active {
            self.teardown(active).await;
        }
        *self.inner.producer.write() = None;

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Lifecycle supervisor panicked");
                }
            }
        }

        if previous != ConnectionState::Stopped {
            info!("Broker runtime stopped");
        }
    }

    /// Publish a message through the producer session
    pub async fn send(&self, topic: &str, message: OutboundMessage) -> Result<Vec<RecordMetadata>> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let producer = self
            .inner
            .producer
            .read()
            .clone()
            .ok_or(Error::NotConnected)?;
        producer::send(producer.as_ref(), topic, message).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn connect_locked(&self, slot: &mut Option<ActiveSession>) -> Result<()> {
        let inner = &self.inner;
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        if let Some(previous) = slot.take() {
            self.teardown(previous).await;
        }
        if !self.transition(ConnectionState::Connecting) {
            return Err(Error::Stopped);
        }

        let settings = &inner.settings;
        let options = ConsumerOptions {
            group_id: settings.group_id.clone(),
            client_id: settings.client_id.clone(),
            from_beginning: false,
        };
        let mut sessions = Sessions::default();

        let consumer = match inner.driver.open_consumer(&options).await {
            Ok(session) => session,
            Err(e) => return self.abort_connect(sessions, Error::connect("consumer", e)).await,
        };
        sessions.consumer = Some(Arc::clone(&consumer));

        let producer = match inner.driver.open_producer(&settings.client_id).await {
            Ok(session) => session,
            Err(e) => return self.abort_connect(sessions, Error::connect("producer", e)).await,
        };
        sessions.producer = Some(Arc::clone(&producer));

        let admin = match inner.driver.open_admin(&settings.client_id).await {
            Ok(session) => session,
            Err(e) => return self.abort_connect(sessions, Error::connect("admin", e)).await,
        };
        sessions.admin = Some(Arc::clone(&admin));

        let snapshot = offsets::snapshot(admin.as_ref(), inner.registry.topics()).await;

        for topic in inner.registry.topics() {
            if let Err(e) = consumer.subscribe(topic).await {
                warn!(topic = %topic, error = %e, "Subscribe failed");
                return self.abort_connect(sessions, Error::connect("consumer", e)).await;
            }
        }
        if let Err(e) = consumer.join().await {
            warn!(group = %settings.group_id, error = %e, "Consumer group join failed");
            return self.abort_connect(sessions, Error::connect("consumer", e)).await;
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            consumer: Arc::clone(&consumer),
            registry: Arc::clone(&inner.registry),
            deserializer: Arc::clone(&inner.deserializer),
            auto_commit: settings.auto_commit.clone(),
            poll_wait: settings.poll_max_wait,
            events: inner.events_tx.clone(),
            cancel: cancel.clone(),
            generation,
        };

        let seeks = offsets::apply_seek(consumer.as_ref(), &snapshot, &inner.registry).await;
        let receive_loop = tokio::spawn(dispatcher.run());

        *inner.producer.write() = Some(producer);
        *inner.snapshot.write() = snapshot;
        *slot = Some(ActiveSession {
            generation,
            sessions,
            cancel,
            receive_loop,
        });

        if !self.transition(ConnectionState::Connected) {
            if let Some(active) = slot.take() {
                self.teardown(active).await;
            }
            return Err(Error::Stopped);
        }
        inner.reconnect_failures.store(0, Ordering::SeqCst);

        info!(
            driver = inner.driver.name(),
            generation,
            group = %settings.group_id,
            topics = inner.registry.len(),
            seeks,
            "Broker runtime connected"
        );
        Ok(())
    }

    async fn abort_connect(&self, sessions: Sessions, err: Error) -> Result<()> {
        sessions.close_all().await;
        self.transition(ConnectionState::Disconnected);
        Err(err)
    }

    async fn teardown(&self, active: ActiveSession) {
        debug!(generation = active.generation, "Tearing down sessions");
        active.cancel.cancel();
        if let Err(e) = active.receive_loop.await {
            if e.is_panic() {
                error!(generation = active.generation, error = %e, "Receive loop panicked");
            }
        }
        *self.inner.producer.write() = None;
        active.sessions.close_all().await;
    }

    /// Route a failed connect into the restart path
    fn on_connect_failure(&self, err: Error) {
        if matches!(err, Error::Stopped) {
            debug!("Connect abandoned, runtime stopped");
            return;
        }
        let failures = self.inner.reconnect_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.inner.settings.reconnect.delay(failures);
        error!(error = %err, attempt = failures, delay_ms = delay.as_millis() as u64, "Broker connect failed");

        if delay.is_zero() {
            self.emit(RestartReason::ConnectFailed);
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                BrokerRuntime { inner }.emit(RestartReason::ConnectFailed);
            }
        });
    }

    fn emit(&self, reason: RestartReason) {
        let event = LifecycleEvent::Fault {
            reason,
            generation: self.generation(),
        };
        if self.inner.events_tx.send(event).is_err() {
            debug!(reason = %reason, "Supervisor is gone, dropping restart request");
        }
    }

    fn ensure_supervisor(&self) {
        let Some(events) = self.inner.events_rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(supervise(Arc::downgrade(&self.inner), events));
        *self.inner.supervisor.lock() = Some(handle);
    }
}

/// Processes lifecycle events one at a time
async fn supervise(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<LifecycleEvent>) {
    debug!("Lifecycle supervisor started");
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let runtime = BrokerRuntime { inner };
        match event {
            LifecycleEvent::Shutdown => break,
            LifecycleEvent::Fault { reason, generation } => {
                let current = runtime.generation();
                if generation != current {
                    debug!(reason = %reason, generation, current, "Discarding stale fault event");
                    continue;
                }
                runtime.restart(reason).await;
            }
        }
    }
    debug!("Lifecycle supervisor stopped");
}

fn validate(settings: &KafkaSettings) -> Result<()> {
    if settings.bootstrap_servers.is_empty() {
        return Err(Error::config("no bootstrap servers configured"));
    }
    if settings.group_id.is_empty() {
        return Err(Error::config("consumer group id is empty"));
    }
    if let Some(protocol) = settings.security_protocol {
        if protocol.uses_sasl() && settings.sasl.is_none() {
            return Err(Error::config(format!(
                "security protocol {} requires SASL credentials",
                protocol
            )));
        }
    }
    if settings.poll_max_wait > Duration::from_secs(60) {
        warn!(
            wait_ms = settings.poll_max_wait.as_millis() as u64,
            "Long poll wait delays shutdown by up to the same amount"
        );
    }
    Ok(())
}
