//! Event routing.
//!
//! The router owns the event-name→handler table, the active protocol, custom
//! payload decoders and the connection lifecycle hooks. Handlers are
//! registered with their payload shape; the decode step (a custom decoder
//! for that shape, or the protocol's generic unmarshal) is resolved once at
//! registration time and baked into the stored handler, so dispatch is a
//! plain table lookup. Shape mismatches are compile errors rather than
//! dispatch-time surprises.

use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::protocol::{JsonProtocol, Protocol};
use crate::server::Handshake;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, trace, warn};

type EventHandler = Arc<dyn Fn(&Connection, &dyn Protocol, &[u8]) + Send + Sync>;
type LifecycleHook = Arc<dyn Fn(&Connection) + Send + Sync>;
type HandshakeHook = Arc<dyn Fn(&Handshake) -> bool + Send + Sync>;
type Decoder<T> = Arc<dyn Fn(&[u8]) -> Option<T> + Send + Sync>;

/// Maps event names to typed handlers and owns the active [`Protocol`].
pub struct Router {
    handlers: RwLock<HashMap<String, EventHandler>>,
    protocol: RwLock<Arc<dyn Protocol>>,
    decoders: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    connect_hook: RwLock<Option<LifecycleHook>>,
    close_hook: RwLock<Option<LifecycleHook>>,
    handshake_hook: RwLock<Option<HandshakeHook>>,
    allowed_origins: RwLock<Vec<String>>,
    heartbeat: AtomicBool,
}

impl Router {
    /// A router speaking the default JSON protocol, with heartbeats enabled
    /// and every origin admitted.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            protocol: RwLock::new(Arc::new(JsonProtocol)),
            decoders: RwLock::new(HashMap::new()),
            connect_hook: RwLock::new(None),
            close_hook: RwLock::new(None),
            handshake_hook: RwLock::new(None),
            allowed_origins: RwLock::new(Vec::new()),
            heartbeat: AtomicBool::new(true),
        }
    }

    /// Register a typed handler for an event name.
    ///
    /// The payload is decoded with the custom decoder registered for `T`, if
    /// any, otherwise with the active protocol. Payloads that fail to decode
    /// are dropped with a diagnostic and never reach the handler.
    pub fn on<T, F>(&self, event: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&Connection, T) + Send + Sync + 'static,
    {
        let event = event.into();
        let wrapped: EventHandler = match self.decoder_for::<T>() {
            Some(decode) => {
                let event = event.clone();
                Arc::new(
                    move |connection: &Connection, _protocol: &dyn Protocol, payload: &[u8]| {
                        match decode(payload) {
                            Some(value) => handler(connection, value),
                            None => debug!(%event, "custom decoder rejected payload"),
                        }
                    },
                )
            }
            None => {
                let event = event.clone();
                Arc::new(move |connection: &Connection, protocol: &dyn Protocol, payload: &[u8]| {
                    let decoded = protocol.unmarshal(payload).and_then(|value| {
                        serde_json::from_value::<T>(value)
                            .map_err(|e| ProtocolError::Decode(e.to_string()))
                    });
                    match decoded {
                        Ok(value) => handler(connection, value),
                        Err(reason) => debug!(%event, %reason, "dropping undecodable payload"),
                    }
                })
            }
        };
        self.insert(event, wrapped);
    }

    /// Register a handler that receives the raw payload bytes untouched.
    pub fn on_raw<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Connection, &[u8]) + Send + Sync + 'static,
    {
        self.insert(
            event.into(),
            Arc::new(
                move |connection: &Connection, _protocol: &dyn Protocol, payload: &[u8]| {
                    handler(connection, payload)
                },
            ),
        );
    }

    /// Register a handler for events whose payload is irrelevant.
    pub fn on_signal<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.insert(
            event.into(),
            Arc::new(
                move |connection: &Connection, _protocol: &dyn Protocol, _payload: &[u8]| {
                    handler(connection)
                },
            ),
        );
    }

    /// Register a custom decoder for payload shape `T`, used instead of the
    /// protocol by every handler registered for `T` afterwards.
    pub fn add_protocol_extension<T, F>(&self, decoder: F)
    where
        T: 'static,
        F: Fn(&[u8]) -> Option<T> + Send + Sync + 'static,
    {
        let decoder: Decoder<T> = Arc::new(decoder);
        let mut decoders = self.decoders.write().expect("router lock poisoned");
        if decoders
            .insert(TypeId::of::<T>(), Box::new(decoder))
            .is_some()
        {
            warn!(
                shape = std::any::type_name::<T>(),
                "replacing previously registered decoder"
            );
        }
    }

    /// Decode an inbound frame and invoke the matching handler.
    ///
    /// Unknown event names are ignored; frames without a separator are
    /// dropped with a diagnostic; a panicking handler is caught here so it
    /// cannot take down the connection's read loop.
    pub fn dispatch(&self, connection: &Connection, raw: &[u8]) {
        let protocol = self.protocol();
        let (event, payload) = match protocol.unpack(raw) {
            Ok(parts) => parts,
            Err(reason) => {
                debug!(id = %connection.id(), %reason, "dropping unparseable frame");
                return;
            }
        };

        let handler = {
            let handlers = self.handlers.read().expect("router lock poisoned");
            handlers.get(event).cloned()
        };
        let Some(handler) = handler else {
            trace!(event, "no handler registered");
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| {
            handler(connection, protocol.as_ref(), payload)
        }))
        .is_err()
        {
            error!(event, id = %connection.id(), "event handler panicked");
        }
    }

    /// Swap the active protocol. Dispatch and every emit use the current one.
    pub fn set_protocol<P: Protocol + 'static>(&self, protocol: P) {
        *self.protocol.write().expect("router lock poisoned") = Arc::new(protocol);
    }

    pub fn protocol(&self) -> Arc<dyn Protocol> {
        self.protocol.read().expect("router lock poisoned").clone()
    }

    /// Hook invoked once a connection is registered and about to start.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        *self.connect_hook.write().expect("router lock poisoned") = Some(Arc::new(hook));
    }

    /// Hook invoked during connection teardown.
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        *self.close_hook.write().expect("router lock poisoned") = Some(Arc::new(hook));
    }

    /// Pre-upgrade authorization. Returning `false` rejects the handshake
    /// with a 403 before the connection exists.
    pub fn on_handshake<F>(&self, hook: F)
    where
        F: Fn(&Handshake) -> bool + Send + Sync + 'static,
    {
        *self.handshake_hook.write().expect("router lock poisoned") = Some(Arc::new(hook));
    }

    /// Enable or disable outbound heartbeat pings.
    pub fn set_heartbeat(&self, enabled: bool) {
        self.heartbeat.store(enabled, Ordering::SeqCst);
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat.load(Ordering::SeqCst)
    }

    /// Append an origin to the allow-list. An empty list admits everyone; a
    /// non-empty list requires an exact match on the `Origin` header.
    pub fn allow_origin(&self, origin: impl Into<String>) {
        self.allowed_origins
            .write()
            .expect("router lock poisoned")
            .push(origin.into());
    }

    pub fn set_allowed_origins(&self, origins: Vec<String>) {
        *self.allowed_origins.write().expect("router lock poisoned") = origins;
    }

    pub(crate) fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let allowed = self.allowed_origins.read().expect("router lock poisoned");
        if allowed.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => allowed.iter().any(|a| a == origin),
            None => false,
        }
    }

    pub(crate) fn verify_handshake(&self, handshake: &Handshake) -> bool {
        let hook = self
            .handshake_hook
            .read()
            .expect("router lock poisoned")
            .clone();
        match hook {
            Some(hook) => hook(handshake),
            None => true,
        }
    }

    pub(crate) fn invoke_connect(&self, connection: &Connection) {
        let hook = self
            .connect_hook
            .read()
            .expect("router lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(connection);
        }
    }

    pub(crate) fn invoke_close(&self, connection: &Connection) {
        let hook = self
            .close_hook
            .read()
            .expect("router lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(connection);
        }
    }

    fn insert(&self, event: String, handler: EventHandler) {
        let mut handlers = self.handlers.write().expect("router lock poisoned");
        if handlers.insert(event.clone(), handler).is_some() {
            warn!(%event, "replacing previously registered handler");
        }
    }

    fn decoder_for<T: 'static>(&self) -> Option<Decoder<T>> {
        let decoders = self.decoders.read().expect("router lock poisoned");
        decoders
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<Decoder<T>>())
            .cloned()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SocketMessage;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Chat {
        text: String,
    }

    fn connection(router: &Arc<Router>) -> (Connection, mpsc::Receiver<SocketMessage>) {
        Connection::new(router.clone(), 8)
    }

    #[tokio::test]
    async fn typed_handler_receives_decoded_payload() {
        let router = Arc::new(Router::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        router.on("chat.message", move |_conn: &Connection, message: Chat| {
            sink.lock().unwrap().push(message);
        });

        let (conn, _rx) = connection(&router);
        router.dispatch(&conn, b"chat.message {\"text\":\"hi\"}");

        assert_eq!(
            *received.lock().unwrap(),
            vec![Chat {
                text: "hi".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn undecodable_payload_never_reaches_the_handler() {
        let router = Arc::new(Router::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        router.on("chat.message", move |_conn: &Connection, _message: Chat| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (conn, _rx) = connection(&router);
        router.dispatch(&conn, b"chat.message {\"text\":42}");
        router.dispatch(&conn, b"chat.message not-json");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_events_and_bad_frames_are_ignored() {
        let router = Arc::new(Router::new());
        let (conn, _rx) = connection(&router);

        router.dispatch(&conn, b"ghost.event {}");
        router.dispatch(&conn, b"no-separator");
        router.dispatch(&conn, b"");
    }

    #[tokio::test]
    async fn custom_decoder_takes_precedence_over_the_protocol() {
        let router = Arc::new(Router::new());
        router.add_protocol_extension::<Chat, _>(|payload| {
            std::str::from_utf8(payload).ok().map(|text| Chat {
                text: format!("custom:{text}"),
            })
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        router.on("chat.message", move |_conn: &Connection, message: Chat| {
            sink.lock().unwrap().push(message);
        });

        let (conn, _rx) = connection(&router);
        // Not JSON at all; only the custom decoder can accept this.
        router.dispatch(&conn, b"chat.message plain words");

        assert_eq!(
            *received.lock().unwrap(),
            vec![Chat {
                text: "custom:plain words".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn raw_and_signal_handlers() {
        let router = Arc::new(Router::new());
        let raw_payloads = Arc::new(Mutex::new(Vec::new()));
        let signals = Arc::new(AtomicUsize::new(0));

        let sink = raw_payloads.clone();
        router.on_raw("blob.push", move |_conn, payload| {
            sink.lock().unwrap().push(payload.to_vec());
        });
        let counter = signals.clone();
        router.on_signal("session.refresh", move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (conn, _rx) = connection(&router);
        router.dispatch(&conn, b"blob.push \x01\x02");
        router.dispatch(&conn, b"session.refresh {\"ignored\":true}");

        assert_eq!(*raw_payloads.lock().unwrap(), vec![vec![1u8, 2u8]]);
        assert_eq!(signals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let router = Arc::new(Router::new());
        router.on_signal("boom", |_conn| panic!("handler bug"));

        let survived = Arc::new(AtomicUsize::new(0));
        let counter = survived.clone();
        router.on_signal("after", move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (conn, _rx) = connection(&router);
        router.dispatch(&conn, b"boom {}");
        router.dispatch(&conn, b"after {}");

        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn origin_allow_list() {
        let router = Router::new();
        assert!(router.origin_allowed(None));
        assert!(router.origin_allowed(Some("http://anywhere.example")));

        router.allow_origin("http://app.example");
        assert!(router.origin_allowed(Some("http://app.example")));
        assert!(!router.origin_allowed(Some("http://evil.example")));
        assert!(!router.origin_allowed(None));
    }

    #[tokio::test]
    async fn heartbeat_toggle() {
        let router = Router::new();
        assert!(router.heartbeat_enabled());
        router.set_heartbeat(false);
        assert!(!router.heartbeat_enabled());
    }
}
