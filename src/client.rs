//! The public façade: aggregates the cache, codec, connection manager, model
//! type registry and event bus behind one cheaply-`Clone`able handle, and
//! drives the inbound-frame dispatch loop.
//!
//! `ClientFacade` is a thin `Rc` wrapper, the same `Rc`-handle shape used
//! for shared client state elsewhere in this kind of codebase: cloning it
//! is an `Rc` bump, not a deep copy, so it can be captured by the
//! `spawn_local` tasks that drive reconnects and inbound dispatch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::{CacheEntry, CacheItem, ModelHandle, ReleaseOutcome, ResourceCache};
use crate::codec::{build_method, encode_set_params, wrap_params, Inbound, ProtocolCodec};
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::Error;
use crate::eventbus::{EventBus, HandlerId, LocalEventBus};
use crate::model_type::{ModelType, ModelTypeRegistry};
use crate::resource::Identified;
#[cfg(test)]
use crate::resource::Model;
use crate::sync::SyncEngine;
use crate::transport::{TransportConnector, TransportEvent};

/// Scope used for client-level events (`connect`, `close`, `error`), which
/// are not tied to any particular resource id.
const CLIENT_EVENT_TARGET: &str = "";

type ConnectHook = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), Error>>>;

struct Inner {
    cache: ResourceCache,
    registry: RefCell<ModelTypeRegistry>,
    event_bus: LocalEventBus,
    codec: ProtocolCodec,
    connection: ConnectionManager,
    on_connect: RefCell<Option<ConnectHook>>,
}

#[derive(Clone)]
pub struct ClientFacade(Rc<Inner>);

/// Weak handle to the facade's shared state, held by [`crate::resource::Model`]
/// and [`crate::resource::Collection`] values so they can reach back into the
/// cache and event bus for their own `on`/`off` without keeping the client
/// alive themselves. A strong back-reference here would cycle: client ->
/// cache -> cached item -> client.
#[derive(Debug, Clone, Default)]
pub(crate) struct WeakClientFacade(Weak<Inner>);

impl WeakClientFacade {
    pub(crate) fn upgrade(&self) -> Option<ClientFacade> {
        self.0.upgrade().map(ClientFacade)
    }
}

impl ClientFacade {
    pub fn new(
        url: impl Into<String>,
        connector: Rc<dyn TransportConnector>,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        Ok(Self(Rc::new(Inner {
            cache: ResourceCache::new(),
            registry: RefCell::new(ModelTypeRegistry::new()),
            event_bus: LocalEventBus::new(),
            codec: ProtocolCodec::new(),
            connection: ConnectionManager::new(url, connector, config)?,
            on_connect: RefCell::new(None),
        })))
    }

    #[cfg(feature = "ws-transport")]
    pub fn with_defaults(url: impl Into<String>) -> Result<Self, Error> {
        let config = ClientConfig::default();
        let connector = Rc::new(crate::transport::ws::WsConnector::new(config.max_event_backlog));
        Self::new(url, connector, config)
    }

    #[cfg(test)]
    pub(crate) fn test_instance() -> Self {
        struct UnusedConnector;
        #[async_trait::async_trait(?Send)]
        impl TransportConnector for UnusedConnector {
            async fn connect(
                &self,
                _url: &str,
            ) -> Result<(Rc<dyn crate::transport::Transport>, mpsc::Receiver<TransportEvent>), crate::error::TransportError>
            {
                Err(crate::error::TransportError::Open("test instance has no transport".into()))
            }
        }
        Self::new("ws://test.invalid", Rc::new(UnusedConnector), ClientConfig::default())
            .expect("ws://test.invalid is a valid url")
    }

    pub fn model_type_registry_snapshot(&self) -> ModelTypeRegistry {
        self.0.registry.borrow().clone()
    }

    pub(crate) fn downgrade(&self) -> WeakClientFacade {
        WeakClientFacade(Rc::downgrade(&self.0))
    }

    // ---- client-level events -------------------------------------------------

    pub fn on(&self, events: &str, handler: Box<dyn FnMut(&Value)>) -> HandlerId {
        let namespace = self.0.connection.config().namespace.clone();
        self.0.event_bus.on(CLIENT_EVENT_TARGET, events, &namespace, handler)
    }

    pub fn off(&self, events: &str, handler: HandlerId) {
        let namespace = self.0.connection.config().namespace.clone();
        self.0.event_bus.off(CLIENT_EVENT_TARGET, events, &namespace, handler);
    }

    pub fn set_on_connect<Fut>(&self, hook: impl Fn() -> Fut + 'static)
    where
        Fut: std::future::Future<Output = Result<(), Error>> + 'static,
    {
        *self.0.on_connect.borrow_mut() = Some(Rc::new(move || Box::pin(hook())));
    }

    fn emit_client_event(&self, name: &str, data: Value) {
        self.0.event_bus.emit(CLIENT_EVENT_TARGET, name, &data);
    }

    // ---- connection -----------------------------------------------------------

    pub async fn connect(&self) -> Result<(), Error> {
        let opened_client = self.clone();
        let on_opened = move || {
            let client = opened_client.clone();
            async move { client.handle_transport_opened().await }
        };
        let pump_client = self.clone();
        let spawn_pump = move |events| {
            tokio::task::spawn_local(run_dispatch_loop(pump_client, events));
        };
        self.0.connection.connect(on_opened, spawn_pump).await?;
        self.emit_client_event("connect", Value::Null);
        Ok(())
    }

    pub fn disconnect(&self) {
        if let Some(transport) = self.0.connection.disconnect() {
            tokio::task::spawn_local(async move { transport.close().await });
        }
    }

    async fn handle_transport_opened(&self) -> Result<(), Error> {
        let hook = self.0.on_connect.borrow().clone();
        if let Some(hook) = hook {
            hook().await?;
        }
        self.resubscribe_stale().await;
        Ok(())
    }

    /// On (re)connect, re-issues `subscribe` for every entry that isn't
    /// purely indirect and isn't already subscribed (§4.5). Individual
    /// failures are logged and leave the entry in its prior state rather
    /// than aborting the whole pass.
    async fn resubscribe_stale(&self) {
        let rids = self.0.cache.rids();
        for rid in rids {
            let Some(entry) = self.0.cache.get(&rid) else { continue };
            if entry.subscribed() || (entry.indirect() > 0 && entry.direct() == 0) {
                continue;
            }
            match self.send_subscribe(&rid).await {
                Ok(payload) => {
                    entry.set_subscribed(true);
                    if let Err(err) = self.apply_snapshot(&rid, payload) {
                        tracing::warn!(%rid, %err, "resync after resubscribe failed");
                    }
                }
                Err(err) => {
                    let err = anyhow::Error::new(err).context(format!("resubscribing {rid}"));
                    tracing::warn!(%rid, %err, "resubscribe failed");
                }
            }
        }
    }

    /// On transport close, every entry loses its subscription. Entries kept
    /// alive only by direct listeners are not individually timer-armed here;
    /// `resubscribe_stale` already re-subscribes them all in one sweep the
    /// moment the connection reopens, so arming N redundant per-entry timers
    /// against a connection that is already down would only buy a pile of
    /// failed subscribe attempts.
    fn mark_all_stale(&self) {
        for rid in self.0.cache.rids() {
            if let Some(entry) = self.0.cache.get(&rid) {
                entry.set_subscribed(false);
                self.try_release(&entry);
            }
        }
    }

    /// Runs the cache's GC decision for `entry` and drives its
    /// [`ReleaseOutcome`] into the timer-arming decision it exists for: if
    /// the entry is kept alive only by direct listeners on a now-unsubscribed
    /// resource, arms the stale-resubscribe timer.
    fn try_release(&self, entry: &Rc<CacheEntry>) {
        let outcome = self.0.cache.try_release(entry);
        self.handle_release_outcome(entry, outcome);
    }

    /// Shared by [`ClientFacade::try_release`] and
    /// [`crate::sync::SyncEngine::handle_remove_event`], which runs the same
    /// GC decision against `self.0.cache` directly since it already holds a
    /// `&ResourceCache` borrow.
    pub(crate) fn handle_release_outcome(&self, entry: &Rc<CacheEntry>, outcome: ReleaseOutcome) {
        if outcome == ReleaseOutcome::RetainedNeedsResubscribe && entry.arm_stale_timer() {
            self.arm_stale_resubscribe(entry.rid.clone());
        }
    }

    async fn handle_closed(&self) {
        let should_reconnect = self.0.connection.note_closed();
        self.0.codec.fail_all(crate::error::TransportError::Closed);
        self.mark_all_stale();
        self.emit_client_event("close", Value::Null);
        if should_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let client = self.clone();
        tokio::task::spawn_local(async move {
            loop {
                if !client.0.connection.should_keep_trying() {
                    return;
                }
                tokio::time::sleep(client.0.connection.reconnect_delay()).await;
                if !client.0.connection.should_keep_trying() {
                    return;
                }
                match client.connect().await {
                    Ok(()) => return,
                    Err(err) => {
                        let err = anyhow::Error::new(err).context("scheduled reconnect attempt");
                        tracing::warn!(%err, "reconnect attempt failed");
                    }
                }
            }
        });
    }

    // ---- requests ---------------------------------------------------------

    async fn ensure_connected(&self) -> Result<(), Error> {
        if self.0.connection.is_open() {
            return Ok(());
        }
        self.connect().await
    }

    async fn request(&self, method: String, params: Option<Value>) -> Result<Value, Error> {
        self.ensure_connected().await?;
        let (id, text, rx) = self.0.codec.prepare_request(method, params);
        let transport = self
            .0
            .connection
            .transport()
            .ok_or_else(|| Error::Transport(crate::error::TransportError::Closed))?;
        if let Err(err) = transport.send(text).await {
            self.0.codec.fail(id, err.clone());
            return Err(Error::Transport(err));
        }
        rx.await
            .map_err(|_| Error::Transport(crate::error::TransportError::Closed))?
    }

    async fn send_subscribe(&self, rid: &str) -> Result<Value, Error> {
        self.request(build_method("subscribe", rid, None), None).await
    }

    // ---- public resource API ----------------------------------------------

    pub async fn get_resource(&self, rid: &str) -> Result<CacheItem, Error> {
        let client = self.clone();
        let subscribe_client = client.clone();
        let registry_snapshot = self.model_type_registry_snapshot();
        self.0
            .cache
            .get_or_fetch(rid, &client, &registry_snapshot, move |rid| async move {
                subscribe_client.send_subscribe(&rid).await
            })
            .await
    }

    pub async fn create_model(&self, collection_rid: &str, props: Value) -> Result<ModelHandle, Error> {
        let result = self
            .request(build_method("call", collection_rid, Some("create")), wrap_params(props))
            .await?;
        let rid = result
            .get("rid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("create response missing rid"))?
            .to_string();
        match self.get_resource(&rid).await? {
            CacheItem::Model(m) => Ok(m),
            CacheItem::Collection(_) => Err(Error::protocol(format!("{rid} resolved to a collection"))),
        }
    }

    pub async fn remove_model(&self, collection_rid: &str, rid: &str) -> Result<(), Error> {
        self.request(
            build_method("call", collection_rid, Some("delete")),
            wrap_params(serde_json::json!({"rid": rid})),
        )
        .await?;
        Ok(())
    }

    pub async fn set_model(&self, rid: &str, props: HashMap<String, Option<Value>>) -> Result<Value, Error> {
        self.request(build_method("call", rid, Some("set")), Some(encode_set_params(props)))
            .await
    }

    pub async fn call_model(&self, rid: &str, method: &str, params: Value) -> Result<Value, Error> {
        self.request(build_method("call", rid, Some(method)), wrap_params(params)).await
    }

    pub async fn authenticate(&self, rid: &str, method: &str, params: Value) -> Result<Value, Error> {
        self.request(build_method("auth", rid, Some(method)), wrap_params(params)).await
    }

    pub fn register_model_type(&self, model_type: ModelType) -> Result<(), Error> {
        self.0.registry.borrow_mut().register(model_type)
    }

    pub fn unregister_model_type(&self, id: &str) -> Option<ModelType> {
        self.0.registry.borrow_mut().unregister(id)
    }

    // ---- direct-listener lifecycle (§4.6) -----------------------------------

    /// Attaches `handler` for `events` scoped to `rid` on the event bus, and
    /// bumps the entry's `direct` count. Pairs with [`ClientFacade::release`],
    /// which must be called with the same `events`/[`HandlerId`] to detach
    /// this registration and run the teardown sequence.
    pub fn add_direct_listener(
        &self,
        rid: &str,
        events: &str,
        handler: Box<dyn FnMut(&Value)>,
    ) -> HandlerId {
        self.0.cache.add_direct(rid);
        let namespace = self.0.connection.config().namespace.clone();
        self.0.event_bus.on(rid, events, &namespace, handler)
    }

    /// Detaches `handler` from `events` on `rid`, decrements the direct
    /// count, and runs the teardown sequence from §4.6 if nothing else keeps
    /// the entry alive.
    pub async fn release(&self, rid: &str, events: &str, handler: HandlerId) {
        let namespace = self.0.connection.config().namespace.clone();
        self.0.event_bus.off(rid, events, &namespace, handler);

        let Some(entry) = self.0.cache.remove_direct(rid) else { return };
        if entry.direct() > 0 {
            return;
        }
        if !entry.subscribed() {
            self.try_release(&entry);
            return;
        }

        if let Some(CacheItem::Collection(collection)) = entry.item() {
            let at_risk: Vec<String> = collection
                .borrow()
                .iter()
                .filter_map(|child| {
                    let child_rid = child.rid();
                    let child_entry = self.0.cache.get(&child_rid)?;
                    let at_risk = child_entry.direct() > 0
                        && child_entry.indirect() == 1
                        && !child_entry.subscribed();
                    at_risk.then_some(child_rid)
                })
                .collect();
            for child_rid in at_risk {
                if let Ok(payload) = self.send_subscribe(&child_rid).await {
                    if let Some(child_entry) = self.0.cache.get(&child_rid) {
                        child_entry.set_subscribed(true);
                        let _ = self.apply_snapshot(&child_rid, payload);
                    }
                }
            }
        }

        if self.0.connection.is_open() {
            let _ = self.request(build_method("unsubscribe", rid, None), None).await;
        }
        entry.set_subscribed(false);
        self.try_release(&entry);
    }

    // ---- inbound dispatch ---------------------------------------------------

    fn handle_inbound(&self, text: &str) {
        let parsed = match self.0.codec.parse(text) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed inbound frame");
                return;
            }
        };
        match parsed {
            Inbound::Response { id, result } => self.handle_response(id, result),
            Inbound::Event { rid, name, data } => self.handle_event(&rid, &name, data),
        }
    }

    fn handle_response(&self, id: u64, result: Result<Value, (i64, String, Option<Value>)>) {
        match self.0.codec.complete(id, result) {
            Ok(Some(resource_err)) => {
                tracing::warn!(code = resource_err.code, message = %resource_err.message, "server returned an error response");
                self.emit_client_event(
                    "error",
                    serde_json::json!({
                        "code": resource_err.code,
                        "message": resource_err.message,
                        "method": resource_err.method,
                    }),
                );
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "response correlation failed"),
        }
    }

    fn handle_event(&self, rid: &str, name: &str, data: Value) {
        if let Err(err) = self.dispatch_event(rid, name, data) {
            tracing::error!(%rid, %name, %err, "event handling failed");
        }
    }

    fn dispatch_event(&self, rid: &str, name: &str, data: Value) -> Result<(), Error> {
        match name {
            "change" => self.handle_change(rid, data),
            "add" => self.handle_add(rid, data),
            "remove" => self.handle_remove(rid, data),
            "unsubscribe" => self.handle_server_unsubscribe(rid),
            _ => {
                self.0.event_bus.emit(rid, name, &data);
                Ok(())
            }
        }
    }

    fn handle_change(&self, rid: &str, data: Value) -> Result<(), Error> {
        let entry = self
            .0
            .cache
            .get(rid)
            .ok_or_else(|| Error::cache_integrity(rid, "change event for unknown entry"))?;
        let model = match entry.item() {
            Some(CacheItem::Model(m)) => m,
            Some(CacheItem::Collection(_)) => {
                return Err(Error::protocol(format!("change event for collection {rid}")))
            }
            None => return Err(Error::cache_integrity(rid, "change event before snapshot arrived")),
        };
        let model_type = entry
            .model_type()
            .unwrap_or_else(|| self.0.registry.borrow().resolve(rid).clone());
        let delta = data
            .as_object()
            .ok_or_else(|| Error::protocol("change payload is not an object"))?;
        SyncEngine::handle_change_event(self, &self.0.event_bus, &model, &model_type, delta)
    }

    fn handle_add(&self, rid: &str, data: Value) -> Result<(), Error> {
        let entry = self
            .0
            .cache
            .get(rid)
            .ok_or_else(|| Error::cache_integrity(rid, "add event for unknown entry"))?;
        let collection = match entry.item() {
            Some(CacheItem::Collection(c)) => c,
            _ => return Err(Error::protocol(format!("add event for non-collection {rid}"))),
        };
        let obj = data
            .as_object()
            .ok_or_else(|| Error::protocol("add payload is not an object"))?;
        let idx = obj
            .get("idx")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::protocol("add payload missing idx"))? as usize;
        let child_rid = obj
            .get("rid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("add payload missing rid"))?
            .to_string();
        let child_data = obj.get("data").cloned().unwrap_or(Value::Null);
        SyncEngine::handle_add_event(
            &self.0.cache,
            self,
            &self.0.event_bus,
            &collection,
            rid,
            idx,
            &child_rid,
            child_data,
        )
    }

    fn handle_remove(&self, rid: &str, data: Value) -> Result<(), Error> {
        let entry = self
            .0
            .cache
            .get(rid)
            .ok_or_else(|| Error::cache_integrity(rid, "remove event for unknown entry"))?;
        let collection = match entry.item() {
            Some(CacheItem::Collection(c)) => c,
            _ => return Err(Error::protocol(format!("remove event for non-collection {rid}"))),
        };
        let idx = data
            .get("idx")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::protocol("remove payload missing idx"))? as usize;
        SyncEngine::handle_remove_event(&self.0.cache, self, &self.0.event_bus, &collection, rid, idx)
    }

    fn handle_server_unsubscribe(&self, rid: &str) -> Result<(), Error> {
        let entry = self
            .0
            .cache
            .get(rid)
            .ok_or_else(|| Error::cache_integrity(rid, "unsubscribe event for unknown entry"))?;
        entry.set_subscribed(false);
        let item = entry.item();
        self.try_release(&entry);
        self.0.event_bus.emit(rid, "unsubscribe", &item.map(cache_item_summary).unwrap_or(Value::Null));
        Ok(())
    }

    fn arm_stale_resubscribe(&self, rid: String) {
        let client = self.clone();
        let delay = self.0.connection.config().stale_resubscribe_delay;
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            let Some(entry) = client.0.cache.get(&rid) else { return };
            entry.disarm_stale_timer();
            if entry.subscribed() || entry.direct() == 0 {
                return;
            }
            match client.send_subscribe(&rid).await {
                Ok(payload) => {
                    entry.set_subscribed(true);
                    if let Err(err) = client.apply_snapshot(&rid, payload) {
                        tracing::warn!(%rid, %err, "stale-resubscribe resync failed");
                    }
                }
                Err(err) => {
                    let err = anyhow::Error::new(err).context(format!("stale-resubscribing {rid}"));
                    tracing::warn!(%rid, %err, "stale-resubscribe failed");
                    entry.set_subscribed(false);
                    client.try_release(&entry);
                }
            }
        });
    }

    /// Routes a freshly (re)fetched snapshot for an already-bound entry
    /// through the sync engine, or binds it fresh if this is the first time.
    fn apply_snapshot(&self, rid: &str, payload: Value) -> Result<(), Error> {
        let entry = self
            .0
            .cache
            .get(rid)
            .ok_or_else(|| Error::cache_integrity(rid, "snapshot for unknown entry"))?;
        match entry.item() {
            None => {
                let registry = self.model_type_registry_snapshot();
                self.0.cache.ingest_snapshot(rid, payload, false, self, &registry)?;
                Ok(())
            }
            Some(CacheItem::Model(model)) => {
                let obj = payload
                    .as_object()
                    .ok_or_else(|| Error::protocol("model resync snapshot is not an object"))?;
                let model_type = entry.model_type().unwrap_or_else(|| self.0.registry.borrow().resolve(rid).clone());
                let delta: serde_json::Map<String, Value> = obj.clone();
                SyncEngine::handle_change_event(self, &self.0.event_bus, &model, &model_type, &delta)
            }
            Some(CacheItem::Collection(collection)) => {
                let fresh = payload
                    .as_array()
                    .cloned()
                    .ok_or_else(|| Error::protocol("collection resync snapshot is not an array"))?;
                SyncEngine::resync_collection(&self.0.cache, self, &self.0.event_bus, rid, &collection, fresh)
            }
        }
    }
}

fn cache_item_summary(item: CacheItem) -> Value {
    match item {
        CacheItem::Model(m) => serde_json::json!({"rid": m.rid()}),
        CacheItem::Collection(c) => serde_json::json!({"rid": c.borrow().rid()}),
    }
}

async fn run_dispatch_loop(client: ClientFacade, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(text) => client.handle_inbound(&text),
            TransportEvent::Error(err) => {
                tracing::warn!(%err, "transport reported an error");
            }
            TransportEvent::Closed => break,
            TransportEvent::Opened => {
                tracing::warn!("unexpected duplicate Opened event");
            }
        }
    }
    client.handle_closed().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_model_type_roundtrip() {
        let client = ClientFacade::test_instance();
        let mt = ModelType {
            id: "svc.x".to_string(),
            factory: Rc::new(|c, rid, data| Model::new(c, rid, data)),
            change: None,
        };
        assert!(client.register_model_type(mt).is_ok());
        assert!(client.unregister_model_type("svc.x").is_some());
        assert!(client.unregister_model_type("svc.x").is_none());
    }

    #[test]
    fn duplicate_model_type_registration_fails() {
        let client = ClientFacade::test_instance();
        let mt = |id: &str| ModelType {
            id: id.to_string(),
            factory: Rc::new(|c, rid, data| Model::new(c, rid, data)),
            change: None,
        };
        assert!(client.register_model_type(mt("svc.x")).is_ok());
        assert!(matches!(
            client.register_model_type(mt("svc.x")),
            Err(Error::Config(_))
        ));
    }

    /// Lets the dispatch loop (and anything it spawns) make progress without
    /// a real clock tick: every hop it needs — reading the fake transport's
    /// channel, routing through the codec, applying to the cache — is one
    /// `.await` point, so a handful of cooperative yields drains it.
    async fn pump() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn subscribe_then_change_event_updates_model_end_to_end() {
        use crate::transport::fake::FakeConnector;
        use crate::transport::TransportEvent;

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let connector = Rc::new(FakeConnector::default());
                let client =
                    ClientFacade::new("ws://test.invalid", connector.clone(), ClientConfig::default())
                        .unwrap();
                client.connect().await.unwrap();

                let transport = connector.last_transport.borrow().clone().unwrap();
                let events_tx = connector.last_events_tx.borrow().clone().unwrap();

                let fetch_client = client.clone();
                let fetch = tokio::task::spawn_local(async move {
                    fetch_client.get_resource("user.42").await
                });
                pump().await;

                let sent = transport.sent.borrow().first().cloned().expect("subscribe sent");
                let req: Value = serde_json::from_str(&sent).unwrap();
                assert_eq!(req["method"], "subscribe.user.42");
                let id = req["id"].as_u64().unwrap();

                events_tx
                    .send(TransportEvent::Message(format!(
                        r#"{{"id":{id},"result":{{"name":"A"}}}}"#
                    )))
                    .await
                    .unwrap();
                pump().await;

                let item = fetch.await.unwrap().unwrap();
                let model = item.as_model().unwrap().clone();
                assert_eq!(model.borrow().get("name"), Some(&serde_json::json!("A")));

                events_tx
                    .send(TransportEvent::Message(
                        r#"{"event":"user.42.change","data":{"name":"B"}}"#.to_string(),
                    ))
                    .await
                    .unwrap();
                pump().await;

                assert_eq!(model.borrow().get("name"), Some(&serde_json::json!("B")));
            })
            .await;
    }

    #[tokio::test]
    async fn transport_close_fails_pending_requests_and_marks_entries_stale() {
        use crate::transport::fake::FakeConnector;
        use crate::transport::TransportEvent;

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let connector = Rc::new(FakeConnector::default());
                let client =
                    ClientFacade::new("ws://test.invalid", connector.clone(), ClientConfig::default())
                        .unwrap();
                client.connect().await.unwrap();
                let events_tx = connector.last_events_tx.borrow().clone().unwrap();

                let call_client = client.clone();
                let call = tokio::task::spawn_local(async move {
                    call_client.call_model("user.42", "greet", Value::Null).await
                });
                pump().await;

                events_tx.send(TransportEvent::Closed).await.unwrap();
                pump().await;

                assert!(matches!(call.await.unwrap(), Err(Error::Transport(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn model_on_change_notifies_registered_handler() {
        use crate::transport::fake::FakeConnector;
        use crate::transport::TransportEvent;

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let connector = Rc::new(FakeConnector::default());
                let client =
                    ClientFacade::new("ws://test.invalid", connector.clone(), ClientConfig::default())
                        .unwrap();
                client.connect().await.unwrap();
                let events_tx = connector.last_events_tx.borrow().clone().unwrap();

                let fetch_client = client.clone();
                let fetch = tokio::task::spawn_local(async move {
                    fetch_client.get_resource("user.42").await
                });
                pump().await;
                events_tx
                    .send(TransportEvent::Message(
                        r#"{"id":1,"result":{"name":"A"}}"#.to_string(),
                    ))
                    .await
                    .unwrap();
                pump().await;
                let item = fetch.await.unwrap().unwrap();
                let model = item.as_model().unwrap().clone();

                let seen = Rc::new(RefCell::new(Vec::new()));
                let seen2 = seen.clone();
                let handler_id = model
                    .borrow()
                    .on("change", Box::new(move |data: &Value| seen2.borrow_mut().push(data.clone())))
                    .expect("client is still alive");

                events_tx
                    .send(TransportEvent::Message(
                        r#"{"event":"user.42.change","data":{"name":"B"}}"#.to_string(),
                    ))
                    .await
                    .unwrap();
                pump().await;
                assert_eq!(seen.borrow().len(), 1);
                assert_eq!(model.borrow().get("name"), Some(&serde_json::json!("B")));

                model.borrow().off("change", handler_id);
                pump().await;

                events_tx
                    .send(TransportEvent::Message(
                        r#"{"event":"user.42.change","data":{"name":"C"}}"#.to_string(),
                    ))
                    .await
                    .unwrap();
                pump().await;
                assert_eq!(seen.borrow().len(), 1, "handler must not fire after off()");
            })
            .await;
    }

    #[tokio::test]
    async fn collection_on_add_and_remove_notifies_registered_handler() {
        use crate::transport::fake::FakeConnector;
        use crate::transport::TransportEvent;

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let connector = Rc::new(FakeConnector::default());
                let client =
                    ClientFacade::new("ws://test.invalid", connector.clone(), ClientConfig::default())
                        .unwrap();
                client.connect().await.unwrap();
                let events_tx = connector.last_events_tx.borrow().clone().unwrap();

                let fetch_client = client.clone();
                let fetch = tokio::task::spawn_local(async move {
                    fetch_client.get_resource("rooms").await
                });
                pump().await;
                events_tx
                    .send(TransportEvent::Message(r#"{"id":1,"result":[]}"#.to_string()))
                    .await
                    .unwrap();
                pump().await;
                let item = fetch.await.unwrap().unwrap();
                let collection = item.as_collection().unwrap().clone();

                let added = Rc::new(RefCell::new(Vec::new()));
                let added2 = added.clone();
                let removed = Rc::new(RefCell::new(Vec::new()));
                let removed2 = removed.clone();
                collection
                    .borrow()
                    .on("add", Box::new(move |data: &Value| added2.borrow_mut().push(data.clone())))
                    .expect("client is still alive");
                collection
                    .borrow()
                    .on(
                        "remove",
                        Box::new(move |data: &Value| removed2.borrow_mut().push(data.clone())),
                    )
                    .expect("client is still alive");

                events_tx
                    .send(TransportEvent::Message(
                        r#"{"event":"rooms.add","data":{"idx":0,"rid":"room.1","data":{"name":"one"}}}"#
                            .to_string(),
                    ))
                    .await
                    .unwrap();
                pump().await;
                assert_eq!(added.borrow().len(), 1);
                assert_eq!(collection.borrow().len(), 1);

                events_tx
                    .send(TransportEvent::Message(
                        r#"{"event":"rooms.remove","data":{"idx":0}}"#.to_string(),
                    ))
                    .await
                    .unwrap();
                pump().await;
                assert_eq!(removed.borrow().len(), 1);
                assert_eq!(collection.borrow().len(), 0);
            })
            .await;
    }
}
