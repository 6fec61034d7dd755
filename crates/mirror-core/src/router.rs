//! Call session router.
//!
//! The router keeps no per-call state. Each inbound event is planned into
//! zero or more [`Route`]s using only the event, the sender's identity and
//! the call id, then executed: replies go straight back to the sender, and
//! relays are delivered to the target if this process holds it and published
//! once on the event bus so whichever instance holds the target delivers it
//! too.
//!
//! Events arriving from the bus are delivered locally only and never
//! published again.

use callmirror_bus::EventBus;
use mirror_protocol::{
    BusEnvelope, ClientEvent, PresenceEntry, PresencePayload, ServerEvent, TargetScope,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::call::CallId;
use crate::directory::Directory;
use crate::error::RoutingError;
use crate::identity::Identity;
use crate::registry::{ConnectionHandle, Registry};

/// Default bus topic shared by every instance.
pub const DEFAULT_TOPIC: &str = "call-events";

/// One outbound event produced by planning.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Send back to the originating connection only.
    Reply(ServerEvent),
    /// Deliver to a target held locally, and publish on the bus.
    Relay {
        /// Target identity or connection id.
        to: String,
        /// How `to` is interpreted.
        scope: TargetScope,
        /// The event to deliver.
        event: ServerEvent,
    },
}

impl Route {
    fn relay(to: impl Into<String>, event: ServerEvent) -> Self {
        Route::Relay {
            to: to.into(),
            scope: TargetScope::Identity,
            event,
        }
    }
}

/// Result of dispatching one client event.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Events delivered to connections on this process.
    pub delivered: usize,
    /// Envelopes published on the bus.
    pub published: usize,
    /// Bus publishes that failed.
    pub publish_failures: usize,
    /// The routing error reported to the sender, if any.
    pub error: Option<RoutingError>,
}

/// What became of an envelope received from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDelivery {
    /// Delivered to a local connection.
    Delivered,
    /// The target is not held here.
    NotHeld,
    /// Published by this instance; already delivered locally.
    OwnOrigin,
    /// Published by an incompatible protocol version.
    Incompatible,
    /// The carried event could not be decoded.
    Malformed,
}

impl RemoteDelivery {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteDelivery::Delivered => "delivered",
            RemoteDelivery::NotHeld => "not_held",
            RemoteDelivery::OwnOrigin => "own_origin",
            RemoteDelivery::Incompatible => "incompatible",
            RemoteDelivery::Malformed => "malformed",
        }
    }
}

/// Routes call-lifecycle and negotiation events.
pub struct CallRouter {
    instance_id: String,
    topic: String,
    registry: Arc<Registry>,
    directory: Arc<dyn Directory>,
    bus: Arc<dyn EventBus>,
}

impl CallRouter {
    /// Create a router for this instance.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        registry: Arc<Registry>,
        directory: Arc<dyn Directory>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            topic: DEFAULT_TOPIC.to_string(),
            registry,
            directory,
            bus,
        }
    }

    /// Use a different bus topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// This instance's id, stamped as envelope origin.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The bus topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Handle one event from a local connection.
    pub async fn dispatch(&self, sender: &ConnectionHandle, event: ClientEvent) -> DispatchOutcome {
        let name = event.name();
        match self.plan(sender, event).await {
            Ok(routes) => self.execute(sender, routes).await,
            Err(error) => {
                debug!(
                    connection = %sender.id(),
                    identity = %sender.identity(),
                    event = name,
                    code = error.code(),
                    error = %error,
                    "Call event rejected"
                );
                sender.send(ServerEvent::call_error(
                    error.code(),
                    error.to_string(),
                    error.call_id().map(str::to_string),
                ));
                DispatchOutcome {
                    error: Some(error),
                    ..Default::default()
                }
            }
        }
    }

    /// Work out where the events caused by `event` must go.
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] when the event cannot be routed; nothing is
    /// delivered in that case.
    pub async fn plan(
        &self,
        sender: &ConnectionHandle,
        event: ClientEvent,
    ) -> Result<Vec<Route>, RoutingError> {
        let me = sender.identity();

        let routes = match event {
            ClientEvent::CallInitiate { contact_id, media } => {
                let target = self.resolve_target(me, &contact_id).await?;
                let call_id = CallId::mint(me, &target).to_string();

                vec![
                    Route::Reply(ServerEvent::CallInitiated {
                        call_id: call_id.clone(),
                        to: target.to_string(),
                        media,
                    }),
                    Route::relay(
                        target.into_string(),
                        ServerEvent::CallIncoming {
                            call_id,
                            from: PresenceEntry::online(me.as_str()),
                            media,
                        },
                    ),
                ]
            }

            ClientEvent::CallAccept { call_id } => {
                let peer = peer_for(&call_id, me)?;
                vec![Route::relay(
                    peer.into_string(),
                    ServerEvent::CallAccepted {
                        call_id,
                        by: me.to_string(),
                    },
                )]
            }

            ClientEvent::CallDecline { call_id } => {
                let peer = peer_for(&call_id, me)?;
                vec![Route::relay(
                    peer.into_string(),
                    ServerEvent::CallDeclined {
                        call_id,
                        by: me.to_string(),
                    },
                )]
            }

            ClientEvent::CallEnd { call_id } => {
                let peer = peer_for(&call_id, me)?;
                vec![Route::relay(
                    peer.into_string(),
                    ServerEvent::CallEnded {
                        call_id,
                        by: me.to_string(),
                    },
                )]
            }

            ClientEvent::CallSignal { call_id, signal } => {
                let peer = peer_for(&call_id, me)?;
                vec![Route::relay(
                    peer.into_string(),
                    ServerEvent::CallSignal {
                        call_id,
                        from: me.to_string(),
                        signal,
                    },
                )]
            }

            ClientEvent::WebrtcOffer(body) => {
                let to = body.to.clone();
                vec![Route::relay(
                    to,
                    ServerEvent::WebrtcOffer(body.stamped(me.as_str())),
                )]
            }

            ClientEvent::WebrtcAnswer(body) => {
                let to = body.to.clone();
                vec![Route::relay(
                    to,
                    ServerEvent::WebrtcAnswer(body.stamped(me.as_str())),
                )]
            }

            ClientEvent::WebrtcIce(body) => {
                let to = body.to.clone();
                vec![Route::relay(
                    to,
                    ServerEvent::WebrtcIce(body.stamped(me.as_str())),
                )]
            }

            ClientEvent::PresenceUpdate(body) => {
                let to = body.to.clone();
                vec![Route::relay(
                    to,
                    ServerEvent::PresenceUpdate(PresencePayload::Relay(body.stamped(me.as_str()))),
                )]
            }

            ClientEvent::Signal { to, signal } => vec![Route::Relay {
                to,
                scope: TargetScope::Connection,
                event: ServerEvent::Signal {
                    from: sender.id().to_string(),
                    signal,
                },
            }],
        };

        Ok(routes)
    }

    /// Carry out planned routes.
    pub async fn execute(&self, sender: &ConnectionHandle, routes: Vec<Route>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for route in routes {
            match route {
                Route::Reply(event) => {
                    if sender.send(event) {
                        outcome.delivered += 1;
                    }
                }
                Route::Relay { to, scope, event } => {
                    if let Some(target) = self.local_target(&to, scope) {
                        if target.send(event.clone()) {
                            outcome.delivered += 1;
                        }
                    }
                    if self.publish(&to, scope, &event).await {
                        outcome.published += 1;
                    } else {
                        outcome.publish_failures += 1;
                    }
                }
            }
        }

        outcome
    }

    /// Deliver an envelope received from the bus to a local connection.
    pub fn deliver_remote(&self, envelope: BusEnvelope) -> RemoteDelivery {
        if envelope.origin == self.instance_id {
            return RemoteDelivery::OwnOrigin;
        }
        if !envelope.is_compatible() {
            debug!(origin = %envelope.origin, v = envelope.v, "Ignoring incompatible envelope");
            return RemoteDelivery::Incompatible;
        }

        let event = match envelope.server_event() {
            Ok(event) => event,
            Err(e) => {
                debug!(origin = %envelope.origin, event = %envelope.event, error = %e, "Ignoring malformed envelope");
                return RemoteDelivery::Malformed;
            }
        };

        match self.local_target(&envelope.to, envelope.scope) {
            Some(target) if target.send(event) => {
                trace!(
                    origin = %envelope.origin,
                    to = %envelope.to,
                    event = %envelope.event,
                    "Delivered remote event"
                );
                RemoteDelivery::Delivered
            }
            _ => RemoteDelivery::NotHeld,
        }
    }

    async fn resolve_target(&self, me: &Identity, reference: &str) -> Result<Identity, RoutingError> {
        if *me == *reference {
            return Err(RoutingError::SelfCall);
        }

        let contact = self
            .directory
            .resolve(reference)
            .await
            .map_err(|e| RoutingError::Lookup(e.to_string()))?
            .ok_or_else(|| RoutingError::NotFound(reference.to_string()))?;

        if contact.identity == *me {
            return Err(RoutingError::SelfCall);
        }

        let held = self.registry.contains(contact.identity.as_str());
        if !held && contact.online == Some(false) {
            return Err(RoutingError::Offline(contact.identity.into_string()));
        }

        Ok(contact.identity)
    }

    fn local_target(&self, to: &str, scope: TargetScope) -> Option<ConnectionHandle> {
        match scope {
            TargetScope::Identity => self.registry.get(to),
            TargetScope::Connection => self.registry.connection(to),
        }
    }

    async fn publish(&self, to: &str, scope: TargetScope, event: &ServerEvent) -> bool {
        let envelope = match BusEnvelope::new(self.instance_id.as_str(), to, scope, event) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(event = event.name(), error = %e, "Failed to build bus envelope");
                return false;
            }
        };

        match self.bus.publish(&self.topic, &envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    bus = self.bus.name(),
                    event = event.name(),
                    to,
                    error = %e,
                    "Bus publish failed, delivered locally only"
                );
                false
            }
        }
    }
}

fn peer_for(call_id: &str, me: &Identity) -> Result<Identity, RoutingError> {
    CallId::parse(call_id)?.peer_of(me.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryDirectory, PassthroughDirectory};
    use crate::presence::PresenceTracker;
    use async_trait::async_trait;
    use callmirror_bus::{BusError, MemoryBus, Subscription};
    use mirror_protocol::{MediaType, RelayBody, SignalPayload};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Node {
        router: Arc<CallRouter>,
        presence: PresenceTracker,
    }

    fn node(instance: &str, bus: &MemoryBus, directory: &InMemoryDirectory) -> Node {
        let registry = Arc::new(Registry::new());
        let router = CallRouter::new(
            instance,
            Arc::clone(&registry),
            Arc::new(directory.clone()),
            Arc::new(bus.clone()),
        );
        Node {
            router: Arc::new(router),
            presence: PresenceTracker::new(registry, Arc::new(directory.clone())),
        }
    }

    async fn join(node: &Node, identity: &str) -> (ConnectionHandle, UnboundedReceiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::channel(Identity::new(identity));
        node.presence.connect(handle.clone()).await;
        (handle, rx)
    }

    /// Drain everything except presence chatter.
    fn calls(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(
                event,
                ServerEvent::PresenceUpdate(PresencePayload::Snapshot(_))
                    | ServerEvent::PresenceOffline { .. }
            ) {
                events.push(event);
            }
        }
        events
    }

    /// Wait for the next non-presence event.
    async fn next_call(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("connection closed");
            if !matches!(
                event,
                ServerEvent::PresenceUpdate(PresencePayload::Snapshot(_))
                    | ServerEvent::PresenceOffline { .. }
            ) {
                return event;
            }
        }
    }

    fn pump(router: &Arc<CallRouter>, mut subscription: Subscription) {
        let router = Arc::clone(router);
        tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                router.deliver_remote(envelope);
            }
        });
    }

    fn initiate(contact: &str) -> ClientEvent {
        ClientEvent::CallInitiate {
            contact_id: contact.into(),
            media: MediaType::Video,
        }
    }

    #[tokio::test]
    async fn test_initiate_local() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let mut bus_rx = bus.subscribe(DEFAULT_TOPIC).await.unwrap();

        let (alice, mut alice_rx) = join(&n, "alice").await;
        let (_bob, mut bob_rx) = join(&n, "bob").await;

        let outcome = n.router.dispatch(&alice, initiate("bob")).await;
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.published, 1);
        assert!(outcome.error.is_none());

        let ServerEvent::CallInitiated { call_id, to, media } = calls(&mut alice_rx).remove(0) else {
            panic!("expected call:initiated");
        };
        assert_eq!(to, "bob");
        assert_eq!(media, MediaType::Video);
        assert!(call_id.starts_with("alice-"));
        assert!(call_id.ends_with("-bob"));

        assert_eq!(
            calls(&mut bob_rx),
            vec![ServerEvent::CallIncoming {
                call_id: call_id.clone(),
                from: PresenceEntry::online("alice"),
                media: MediaType::Video,
            }]
        );

        let envelope = bus_rx.recv().await.unwrap();
        assert_eq!(envelope.origin, "node-1");
        assert_eq!(envelope.to, "bob");
        assert_eq!(envelope.event, "call:incoming");
    }

    #[tokio::test]
    async fn test_initiate_self_is_rejected() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let mut bus_rx = bus.subscribe(DEFAULT_TOPIC).await.unwrap();
        let (alice, mut alice_rx) = join(&n, "alice").await;

        let outcome = n.router.dispatch(&alice, initiate("alice")).await;
        assert_eq!(outcome.error, Some(RoutingError::SelfCall));
        assert_eq!(outcome.published, 0);

        let events = calls(&mut alice_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ServerEvent::CallError { code, call_id: None, .. } if code == "self_call"
        ));
        assert!(bus_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_initiate_self_through_alias() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        directory.alias("me@example.com", "alice");
        let n = node("node-1", &bus, &directory);
        let (alice, _rx) = join(&n, "alice").await;

        let outcome = n.router.dispatch(&alice, initiate("me@example.com")).await;
        assert_eq!(outcome.error, Some(RoutingError::SelfCall));
    }

    #[tokio::test]
    async fn test_initiate_unknown_and_offline() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        directory.register("carol");
        let n = node("node-1", &bus, &directory);
        let mut bus_rx = bus.subscribe(DEFAULT_TOPIC).await.unwrap();
        let (alice, mut alice_rx) = join(&n, "alice").await;
        let (_bob, mut bob_rx) = join(&n, "bob").await;

        let unknown = n.router.dispatch(&alice, initiate("nobody")).await;
        assert_eq!(unknown.error.as_ref().map(RoutingError::code), Some("not_found"));

        let offline = n.router.dispatch(&alice, initiate("carol")).await;
        assert_eq!(offline.error.as_ref().map(RoutingError::code), Some("offline"));

        let errors = calls(&mut alice_rx);
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ServerEvent::CallError { .. })));
        assert!(calls(&mut bob_rx).is_empty());
        assert!(bus_rx.try_recv().is_none());
    }

    /// Without a directory that knows liveness, only the instance holding
    /// the target can answer, so the call goes out on the bus.
    #[tokio::test]
    async fn test_passthrough_directory_defers_to_bus() {
        let bus = MemoryBus::new();
        let registry = Arc::new(Registry::new());
        let router = CallRouter::new(
            "node-1",
            Arc::clone(&registry),
            Arc::new(PassthroughDirectory),
            Arc::new(bus.clone()),
        );
        let mut bus_rx = bus.subscribe(DEFAULT_TOPIC).await.unwrap();
        let (alice, _rx) = ConnectionHandle::channel(Identity::new("alice"));
        registry.put(alice.clone());

        let outcome = router.dispatch(&alice, initiate("bob")).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.published, 1);
        assert_eq!(bus_rx.recv().await.unwrap().to, "bob");
    }

    #[tokio::test]
    async fn test_accept_decline_end_reach_peer() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (alice, mut alice_rx) = join(&n, "alice").await;
        let (bob, _bob_rx) = join(&n, "bob").await;
        let call_id = CallId::mint(alice.identity(), bob.identity()).to_string();

        let accept = ClientEvent::CallAccept {
            call_id: call_id.clone(),
        };
        let decline = ClientEvent::CallDecline {
            call_id: call_id.clone(),
        };
        let end = ClientEvent::CallEnd {
            call_id: call_id.clone(),
        };
        for event in [accept, decline, end] {
            let outcome = n.router.dispatch(&bob, event).await;
            assert_eq!((outcome.delivered, outcome.published), (1, 1));
        }

        assert_eq!(
            calls(&mut alice_rx),
            vec![
                ServerEvent::CallAccepted {
                    call_id: call_id.clone(),
                    by: "bob".into()
                },
                ServerEvent::CallDeclined {
                    call_id: call_id.clone(),
                    by: "bob".into()
                },
                ServerEvent::CallEnded {
                    call_id,
                    by: "bob".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_end_twice_relays_twice() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (alice, _alice_rx) = join(&n, "alice").await;
        let (_bob, mut bob_rx) = join(&n, "bob").await;
        let end = ClientEvent::CallEnd {
            call_id: "alice-1700000000000-bob".into(),
        };

        let first = n.router.dispatch(&alice, end.clone()).await;
        let second = n.router.dispatch(&alice, end).await;
        assert_eq!(first, second);
        assert!(first.error.is_none());

        let events = calls(&mut bob_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], events[1]);
    }

    #[tokio::test]
    async fn test_signal_relayed_verbatim() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (alice, _alice_rx) = join(&n, "alice").await;
        let (_bob, mut bob_rx) = join(&n, "bob").await;
        let payload = json!({ "type": "offer", "sdp": "v=0\r\n", "extra": [1, { "x": null }] });

        n.router
            .dispatch(
                &alice,
                ClientEvent::CallSignal {
                    call_id: "alice-5-bob".into(),
                    signal: SignalPayload::new(payload.clone()),
                },
            )
            .await;

        assert_eq!(
            calls(&mut bob_rx),
            vec![ServerEvent::CallSignal {
                call_id: "alice-5-bob".into(),
                from: "alice".into(),
                signal: SignalPayload::new(payload),
            }]
        );
    }

    #[tokio::test]
    async fn test_bad_call_id() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (alice, mut alice_rx) = join(&n, "alice").await;

        let outcome = n
            .router
            .dispatch(
                &alice,
                ClientEvent::CallAccept {
                    call_id: "garbage".into(),
                },
            )
            .await;
        assert_eq!(outcome.error.as_ref().map(RoutingError::code), Some("invalid_call_id"));

        let events = calls(&mut alice_rx);
        assert!(matches!(
            &events[0],
            ServerEvent::CallError { call_id: Some(id), .. } if id == "garbage"
        ));
    }

    #[tokio::test]
    async fn test_webrtc_relay_stamps_sender() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (alice, _alice_rx) = join(&n, "alice").await;
        let (_bob, mut bob_rx) = join(&n, "bob").await;

        // A forged `from` is replaced.
        let mut body = RelayBody::new("bob").with_field("candidate", json!("c1"));
        body.from = Some("mallory".into());
        n.router.dispatch(&alice, ClientEvent::WebrtcIce(body)).await;

        let events = calls(&mut bob_rx);
        let ServerEvent::WebrtcIce(relayed) = &events[0] else {
            panic!("expected webrtc:ice");
        };
        assert_eq!(relayed.from.as_deref(), Some("alice"));
        assert_eq!(relayed.rest.get("candidate"), Some(&json!("c1")));
    }

    #[tokio::test]
    async fn test_presence_relay() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (alice, _alice_rx) = join(&n, "alice").await;
        let (_bob, mut bob_rx) = join(&n, "bob").await;

        let body = RelayBody::new("bob").with_field("status", json!("busy"));
        n.router
            .dispatch(&alice, ClientEvent::PresenceUpdate(body))
            .await;

        let events = calls(&mut bob_rx);
        let ServerEvent::PresenceUpdate(PresencePayload::Relay(relayed)) = &events[0] else {
            panic!("expected presence relay");
        };
        assert_eq!(relayed.from.as_deref(), Some("alice"));
        assert_eq!(relayed.rest.get("status"), Some(&json!("busy")));
    }

    #[tokio::test]
    async fn test_direct_signal_by_connection() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (alice, _alice_rx) = join(&n, "alice").await;
        let (old_bob, mut old_rx) = join(&n, "bob").await;
        let (_new_bob, mut new_rx) = join(&n, "bob").await;

        // The superseded socket is still addressable directly.
        n.router
            .dispatch(
                &alice,
                ClientEvent::Signal {
                    to: old_bob.id().to_string(),
                    signal: SignalPayload::new(json!({ "candidate": "c" })),
                },
            )
            .await;

        assert_eq!(
            calls(&mut old_rx),
            vec![ServerEvent::Signal {
                from: alice.id().to_string(),
                signal: SignalPayload::new(json!({ "candidate": "c" })),
            }]
        );
        assert!(calls(&mut new_rx).is_empty());
    }

    #[tokio::test]
    async fn test_cross_process_call() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let one = node("node-1", &bus, &directory);
        let two = node("node-2", &bus, &directory);
        pump(&one.router, bus.subscribe(DEFAULT_TOPIC).await.unwrap());
        pump(&two.router, bus.subscribe(DEFAULT_TOPIC).await.unwrap());

        let (alice, mut alice_rx) = join(&one, "alice").await;
        let (bob, mut bob_rx) = join(&two, "bob").await;

        // Bob is online according to the shared directory, though not held on node-1.
        let outcome = one.router.dispatch(&alice, initiate("bob")).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.delivered, 1);

        let ServerEvent::CallIncoming { call_id, from, .. } = next_call(&mut bob_rx).await else {
            panic!("expected call:incoming");
        };
        assert_eq!(from, PresenceEntry::online("alice"));

        // Bob answers from node-2; alice hears it on node-1.
        two.router
            .dispatch(&bob, ClientEvent::CallAccept { call_id: call_id.clone() })
            .await;

        assert_eq!(
            next_call(&mut alice_rx).await,
            ServerEvent::CallInitiated {
                call_id: call_id.clone(),
                to: "bob".into(),
                media: MediaType::Video,
            }
        );
        assert_eq!(
            next_call(&mut alice_rx).await,
            ServerEvent::CallAccepted {
                call_id,
                by: "bob".into()
            }
        );
        assert!(calls(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_own_envelopes_not_redelivered() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let mut subscription = bus.subscribe(DEFAULT_TOPIC).await.unwrap();
        let (alice, _alice_rx) = join(&n, "alice").await;
        let (_bob, mut bob_rx) = join(&n, "bob").await;

        n.router.dispatch(&alice, initiate("bob")).await;
        assert_eq!(calls(&mut bob_rx).len(), 1);

        let echoed = subscription.recv().await.unwrap();
        assert_eq!(n.router.deliver_remote(echoed), RemoteDelivery::OwnOrigin);
        assert!(calls(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_deliver_remote_filters() {
        let bus = MemoryBus::new();
        let directory = InMemoryDirectory::new();
        let n = node("node-1", &bus, &directory);
        let (_bob, mut bob_rx) = join(&n, "bob").await;
        let event = ServerEvent::CallEnded {
            call_id: "alice-1-bob".into(),
            by: "alice".into(),
        };

        let held = BusEnvelope::new("node-2", "bob", TargetScope::Identity, &event).unwrap();
        assert_eq!(n.router.deliver_remote(held.clone()), RemoteDelivery::Delivered);
        assert_eq!(calls(&mut bob_rx), vec![event.clone()]);

        let elsewhere = BusEnvelope::new("node-2", "carol", TargetScope::Identity, &event).unwrap();
        assert_eq!(n.router.deliver_remote(elsewhere), RemoteDelivery::NotHeld);

        let mut future = held.clone();
        future.v += 1;
        assert_eq!(n.router.deliver_remote(future), RemoteDelivery::Incompatible);

        let mut broken = held;
        broken.event = "call:unknown".into();
        assert_eq!(n.router.deliver_remote(broken), RemoteDelivery::Malformed);
        assert!(calls(&mut bob_rx).is_empty());
    }

    struct DownBus;

    #[async_trait]
    impl EventBus for DownBus {
        async fn publish(&self, _: &str, _: &BusEnvelope) -> Result<(), BusError> {
            Err(BusError::Unavailable("connection refused".into()))
        }

        async fn subscribe(&self, _: &str) -> Result<Subscription, BusError> {
            Err(BusError::Unavailable("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_local_delivery_survives_bus_outage() {
        let registry = Arc::new(Registry::new());
        let router = CallRouter::new(
            "node-1",
            Arc::clone(&registry),
            Arc::new(PassthroughDirectory),
            Arc::new(DownBus),
        );
        let (alice, _alice_rx) = ConnectionHandle::channel(Identity::new("alice"));
        let (bob, mut bob_rx) = ConnectionHandle::channel(Identity::new("bob"));
        registry.put(alice.clone());
        registry.put(bob);

        let outcome = router
            .dispatch(
                &alice,
                ClientEvent::CallEnd {
                    call_id: "alice-1-bob".into(),
                },
            )
            .await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.publish_failures, 1);
        assert!(matches!(bob_rx.try_recv(), Ok(ServerEvent::CallEnded { .. })));
    }
}
