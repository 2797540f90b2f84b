//! The socket channel: one persistent connection per app session, with a
//! listener registry that sync hooks attach to.

use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::transport::{run_transport, SocketConfig};
use stockyard_core::sync::SocketEnvelope;

/// Handler invoked synchronously for each matching event, in delivery order.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    handler: EventHandler,
}

pub(crate) struct ChannelInner {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    next_listener_id: AtomicU64,
    connected: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<SocketEnvelope>,
    pub(crate) outbound_rx: Mutex<mpsc::UnboundedReceiver<SocketEnvelope>>,
    transport: Mutex<Option<Transport>>,
}

/// The running transport task. `done` resolves once the task has exited,
/// whether it returned or was aborted.
struct Transport {
    handle: JoinHandle<()>,
    done: watch::Receiver<()>,
}

impl ChannelInner {
    pub(crate) fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            info!(
                "[Socket] {}",
                if connected { "Connected" } else { "Disconnected" }
            );
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn remove_listener(&self, event: &str, id: Option<ListenerId>) -> usize {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(registered) = listeners.get_mut(event) else {
            return 0;
        };
        let before = registered.len();
        match id {
            Some(id) => registered.retain(|listener| listener.id != id),
            None => registered.clear(),
        }
        let removed = before - registered.len();
        if registered.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Run every handler registered for the envelope's event.
    pub(crate) fn dispatch(&self, envelope: &SocketEnvelope) -> usize {
        // Handlers may register or remove listeners, so call them unlocked.
        let handlers: Vec<EventHandler> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.event_name)
            .map(|registered| {
                registered
                    .iter()
                    .map(|listener| Arc::clone(&listener.handler))
                    .collect()
            })
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("[Socket] No listeners for '{}'", envelope.event_name);
        }
        for handler in &handlers {
            handler(&envelope.payload);
        }
        handlers.len()
    }
}

/// Removes its handler when dropped or explicitly unsubscribed.
#[must_use = "dropping a Subscription removes the handler immediately"]
pub struct Subscription {
    channel: Weak<ChannelInner>,
    event: String,
    id: ListenerId,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.remove_listener(&self.event, Some(self.id));
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

/// Shared handle to the app's socket connection.
#[derive(Clone)]
pub struct SocketChannel {
    inner: Arc<ChannelInner>,
}

impl Default for SocketChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketChannel")
            .field("connected", &self.connected())
            .finish()
    }
}

impl SocketChannel {
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                outbound_tx,
                outbound_rx: Mutex::new(outbound_rx),
                transport: Mutex::new(None),
            }),
        }
    }

    pub fn connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Register a handler for `event`. Keep the returned [`Subscription`]
    /// alive for as long as the handler should run.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.clone())
            .or_default()
            .push(Listener {
                id,
                handler: Arc::new(handler),
            });
        debug!("[Socket] Listening for '{}' ({:?})", event, id);

        Subscription {
            channel: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Remove one handler, or every handler for `event` when `id` is `None`.
    /// Returns how many were removed.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        self.inner.remove_listener(event, id)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Queue an outbound event. Events emitted while disconnected are sent
    /// once the connection is up.
    pub fn emit(&self, event: impl Into<String>, payload: Value) {
        let envelope = SocketEnvelope::new(event, payload);
        if self.inner.outbound_tx.send(envelope).is_err() {
            warn!("[Socket] Outbound queue closed; event dropped");
        }
    }

    /// Deliver an envelope to local handlers as if it arrived on the wire.
    /// Returns the number of handlers run.
    pub fn dispatch(&self, envelope: &SocketEnvelope) -> usize {
        self.inner.dispatch(envelope)
    }

    /// Start the background transport unless it is already running.
    pub async fn connect(&self, config: SocketConfig) {
        let mut guard = self.inner.transport.lock().await;
        if let Some(transport) = guard.as_ref() {
            if !transport.handle.is_finished() {
                return;
            }
            // Transport gave up or the server disconnected us; start over.
            guard.take();
        }

        let inner = Arc::clone(&self.inner);
        let (done_tx, done) = watch::channel(());
        let handle = tokio::spawn(async move {
            run_transport(inner, config).await;
            drop(done_tx);
        });
        *guard = Some(Transport { handle, done });
    }

    /// Stop the transport and mark the channel disconnected.
    pub async fn disconnect(&self) {
        if let Some(transport) = self.inner.transport.lock().await.take() {
            transport.handle.abort();
        }
        self.inner.set_connected(false);
    }

    /// Whether a transport task is still running.
    pub async fn is_running(&self) -> bool {
        self.inner
            .transport
            .lock()
            .await
            .as_ref()
            .is_some_and(|transport| !transport.handle.is_finished())
    }

    /// Wait until the background transport stops. Cancelling this future
    /// leaves the transport in place for `disconnect`.
    pub async fn closed(&self) {
        let done = self
            .inner
            .transport
            .lock()
            .await
            .as_ref()
            .map(|transport| transport.done.clone());
        if let Some(mut done) = done {
            // Errors once the sender is dropped with the task.
            while done.changed().await.is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_inner = Arc::clone(&seen);
        (seen, move |payload: &Value| {
            seen_inner.lock().expect("lock").push(payload.clone());
        })
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let channel = SocketChannel::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let first_order = Arc::clone(&order);
        let second_order = Arc::clone(&order);
        let _first = channel.on("vendor:created", move |_| {
            first_order.lock().expect("lock").push(1)
        });
        let _second = channel.on("vendor:created", move |_| {
            second_order.lock().expect("lock").push(2)
        });

        let ran = channel.dispatch(&SocketEnvelope::new("vendor:created", json!({ "id": "v1" })));
        assert_eq!(ran, 2);
        assert_eq!(*order.lock().expect("lock"), vec![1, 2]);
    }

    #[test]
    fn dropping_subscription_unregisters_handler() {
        let channel = SocketChannel::new();
        let (seen, handler) = recorder();
        let subscription = channel.on("package:receive", handler);
        assert_eq!(channel.listener_count("package:receive"), 1);

        drop(subscription);
        assert_eq!(channel.listener_count("package:receive"), 0);
        channel.dispatch(&SocketEnvelope::new("package:receive", json!({ "id": "p1" })));
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn remounting_does_not_accumulate_handlers() {
        let channel = SocketChannel::new();
        let (seen, handler) = recorder();
        let handler = Arc::new(handler);

        for _ in 0..3 {
            let handler = Arc::clone(&handler);
            let subscription = channel.on("user:created", move |payload| handler(payload));
            subscription.unsubscribe();
        }
        let handler_for_mount = Arc::clone(&handler);
        let _mounted = channel.on("user:created", move |payload| handler_for_mount(payload));

        channel.dispatch(&SocketEnvelope::new("user:created", json!({ "id": "u1" })));
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn off_without_id_removes_every_handler() {
        let channel = SocketChannel::new();
        let (_seen, handler) = recorder();
        let handler = Arc::new(handler);
        let a = Arc::clone(&handler);
        let b = Arc::clone(&handler);
        let _first = channel.on("calendar:created", move |p| a(p));
        let _second = channel.on("calendar:created", move |p| b(p));

        assert_eq!(channel.off("calendar:created", None), 2);
        assert_eq!(channel.listener_count("calendar:created"), 0);
    }

    #[test]
    fn off_with_id_removes_only_that_handler() {
        let channel = SocketChannel::new();
        let first = channel.on("vendor:updated", |_| {});
        let _second = channel.on("vendor:updated", |_| {});

        assert_eq!(channel.off("vendor:updated", Some(first.id())), 1);
        assert_eq!(channel.listener_count("vendor:updated"), 1);
        // dropping an already-removed subscription is harmless
        drop(first);
        assert_eq!(channel.listener_count("vendor:updated"), 1);
    }

    #[test]
    fn handler_may_subscribe_during_dispatch() {
        let channel = SocketChannel::new();
        let nested = Arc::new(StdMutex::new(Vec::new()));
        let channel_for_handler = channel.clone();
        let nested_inner = Arc::clone(&nested);
        let _outer = channel.on("Truck:receive", move |_| {
            let subscription = channel_for_handler.on("Truck:receive", |_| {});
            nested_inner.lock().expect("lock").push(subscription);
        });

        channel.dispatch(&SocketEnvelope::new("Truck:receive", json!({})));
        assert_eq!(channel.listener_count("Truck:receive"), 2);
    }

    #[test]
    fn new_channel_starts_disconnected() {
        assert!(!SocketChannel::new().connected());
    }

    #[tokio::test]
    async fn cancelled_wait_keeps_transport_stoppable() {
        use crate::transport::ReconnectPolicy;
        use std::time::Duration;

        let channel = SocketChannel::new();
        let policy = ReconnectPolicy {
            max_attempts: 1_000,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            randomization_factor: 0.0,
        };
        channel
            .connect(SocketConfig::new("ws://127.0.0.1:9/socket.io/").with_reconnect(policy))
            .await;

        let waited = tokio::time::timeout(Duration::from_millis(50), channel.closed()).await;
        assert!(waited.is_err());
        assert!(channel.is_running().await);

        channel.disconnect().await;
        assert!(!channel.is_running().await);
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .expect("no transport left to wait for");
    }
}
