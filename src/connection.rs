//! The connection lifecycle state machine: idle, connecting, open,
//! reconnecting. Owns the transport handle exclusively; nothing outside this
//! module ever touches `Rc<dyn Transport>` directly.
//!
//! Orchestration that needs the cache or event bus (resubscribing stale
//! entries on open, marking everything stale on close) is exposed as hooks
//! the caller (`crate::client::ClientFacade`) drives, the same
//! closure-injection pattern `crate::cache::ResourceCache` uses to stay
//! decoupled from its own caller.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::config::ClientConfig;
use crate::error::{Error, TransportError};
use crate::transport::{Transport, TransportConnector, TransportEvent};

#[cfg(feature = "ws-transport")]
fn validate_url(url: &str) -> Result<(), Error> {
    let parsed = url::Url::parse(url).map_err(|e| Error::Config(format!("invalid url {url:?}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(Error::Config(format!(
            "url scheme must be ws or wss, got {other:?}"
        ))),
    }
}

#[cfg(not(feature = "ws-transport"))]
fn validate_url(_url: &str) -> Result<(), Error> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
}

pub struct ConnectionManager {
    url: String,
    connector: Rc<dyn TransportConnector>,
    config: ClientConfig,
    state: RefCell<ConnState>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    try_connect: Cell<bool>,
    waiters: RefCell<Vec<oneshot::Sender<Result<(), Error>>>>,
}

impl ConnectionManager {
    /// `url` must be an absolute `ws://`/`wss://` URL. There is no "host
    /// document" to resolve a relative URL against in a non-browser
    /// process, so that branch of the original design is dropped rather
    /// than stubbed out; anything else is a `ConfigError`.
    pub fn new(
        url: impl Into<String>,
        connector: Rc<dyn TransportConnector>,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        let url = url.into();
        validate_url(&url)?;
        Ok(Self {
            url,
            connector,
            config,
            state: RefCell::new(ConnState::Idle),
            transport: RefCell::new(None),
            try_connect: Cell::new(false),
            waiters: RefCell::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The live transport handle, if the connection is open. Cloned out of
    /// the `RefCell` so the caller can hold it across an `.await` without
    /// keeping this manager's borrow alive.
    pub fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.transport.borrow().clone()
    }

    /// Begins connecting if idle, or joins the in-flight attempt if one is
    /// already underway. Returns immediately if already open.
    ///
    /// `on_opened` runs once the transport reports `Opened`, before the
    /// connect future resolves — it is the resubscribe-stale step, injected
    /// so this module has no direct cache dependency. Its failure closes the
    /// transport without resolving the connect future, matching
    /// `onConnectHook` semantics. `spawn_pump` receives the inbound event
    /// receiver exactly once, the moment the transport opens, and is
    /// responsible for spawning whatever reads it (`ClientFacade` spawns its
    /// dispatch loop there); this module only ever sees the `Opened`
    /// handshake event.
    pub async fn connect<F, Fut, P>(&self, on_opened: F, spawn_pump: P) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
        P: FnOnce(tokio::sync::mpsc::Receiver<TransportEvent>),
    {
        match self.state() {
            ConnState::Open => return Ok(()),
            ConnState::Connecting | ConnState::Reconnecting => {
                let (tx, rx) = oneshot::channel();
                self.waiters.borrow_mut().push(tx);
                return rx.await.map_err(|_| Error::protocol("connect future was dropped"))?;
            }
            ConnState::Idle => {}
        }

        *self.state.borrow_mut() = ConnState::Connecting;
        self.try_connect.set(true);
        self.open_once(on_opened, spawn_pump).await
    }

    async fn open_once<F, Fut, P>(&self, on_opened: F, spawn_pump: P) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
        P: FnOnce(tokio::sync::mpsc::Receiver<TransportEvent>),
    {
        let opened = tokio::time::timeout(self.config.ws_connect_timeout, self.connector.connect(&self.url))
            .await
            .map_err(|_| Error::Transport(TransportError::Open("connect timed out".into())))
            .and_then(|r| r.map_err(Error::Transport));

        let (transport, mut events) = match opened {
            Ok(pair) => pair,
            Err(err) => {
                *self.state.borrow_mut() = ConnState::Idle;
                self.fail_waiters(err.clone());
                return Err(err);
            }
        };

        // Drain the initial `Opened` event synchronously before handing the
        // receiver off, so the caller's dispatch loop only ever sees
        // post-handshake traffic.
        match events.recv().await {
            Some(TransportEvent::Opened) => {}
            other => {
                let err = Error::Transport(TransportError::Open(format!(
                    "expected Opened as first transport event, got {other:?}"
                )));
                *self.state.borrow_mut() = ConnState::Idle;
                self.fail_waiters(err.clone());
                return Err(err);
            }
        }

        // The transport is stored and the state flipped to `Open` *before*
        // `on_opened` runs, not after: `on_opened` is the resubscribe-stale
        // step, and it sends requests through this same manager, which
        // would otherwise see a connection that looks not-yet-open and try
        // to recursively reconnect.
        *self.transport.borrow_mut() = Some(transport.clone());
        *self.state.borrow_mut() = ConnState::Open;

        if let Err(err) = on_opened().await {
            transport.close().await;
            *self.transport.borrow_mut() = None;
            *self.state.borrow_mut() = ConnState::Idle;
            self.fail_waiters(err.clone());
            return Err(err);
        }

        self.resolve_waiters();
        spawn_pump(events);
        Ok(())
    }

    fn fail_waiters(&self, err: Error) {
        for waiter in self.waiters.borrow_mut().drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn resolve_waiters(&self) {
        for waiter in self.waiters.borrow_mut().drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Records the transport close: clears the held handle, resets state,
    /// and reports whether a reconnect should be scheduled.
    pub fn note_closed(&self) -> bool {
        *self.transport.borrow_mut() = None;
        let was_open = self.state() == ConnState::Open;
        *self.state.borrow_mut() = if self.try_connect.get() {
            ConnState::Reconnecting
        } else {
            ConnState::Idle
        };
        self.fail_waiters(Error::Transport(TransportError::Closed));
        was_open && self.try_connect.get()
    }

    /// Marks the manager as no longer wanting a connection and returns the
    /// transport handle, if any, so the caller can close it asynchronously
    /// (this method itself is synchronous, matching the facade's
    /// `disconnect()` contract).
    pub fn disconnect(&self) -> Option<Rc<dyn Transport>> {
        self.try_connect.set(false);
        *self.state.borrow_mut() = ConnState::Idle;
        self.fail_waiters(Error::Transport(TransportError::Closed));
        self.transport.borrow_mut().take()
    }

    pub fn reconnect_delay(&self) -> std::time::Duration {
        self.config.reconnect_delay
    }

    pub fn should_keep_trying(&self) -> bool {
        self.try_connect.get()
    }
}
