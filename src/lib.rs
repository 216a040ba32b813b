//! Client for a resource-oriented, subscription-based RPC protocol carried
//! over a persistent bidirectional message stream (typically a WebSocket).
//!
//! Remote resources are presented as local, live-updating values — key/value
//! [`resource::Model`]s or ordered [`resource::Collection`]s of them — kept
//! synchronized with the server by a reference-counted cache that
//! multiplexes subscriptions, degrades idle resources to a stale state, and
//! resynchronizes them transparently on reconnect.
//!
//! # Execution model
//!
//! This crate is deliberately single-threaded and cooperative: the cache,
//! codec, and connection state are held behind `Rc<RefCell<_>>`, not
//! `Arc<Mutex<_>>`. [`client::ClientFacade`] and everything it owns are
//! `!Send` and `!Sync`. Run it on a [`tokio::task::LocalSet`] and drive
//! background work (reconnects, stale-resubscribe timers) with
//! `tokio::task::spawn_local`, never `tokio::spawn`. Mixing this crate's
//! types across threads will not compile.

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod eventbus;
pub mod model_type;
pub mod resource;
pub mod rid;
pub mod sync;
pub mod transport;

pub use cache::CacheItem;
pub use client::ClientFacade;
pub use config::ClientConfig;
pub use error::{Error, ResourceError, TransportError};
pub use eventbus::{EventBus, HandlerId, LocalEventBus};
pub use model_type::{ModelType, ModelTypeRegistry};
pub use resource::{Collection, Identified, Model};
