//! The transport contract the client consumes. Only a framed text-message
//! interface is specified; the concrete socket implementation is an external
//! collaborator (see [`ws`] for the default `tokio-tungstenite` one).

#[cfg(feature = "ws-transport")]
pub mod ws;

use std::rc::Rc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Inbound notifications from the transport, standing in for the classic
/// `onopen`/`onmessage`/`onerror`/`onclose` socket callbacks.
#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Error(TransportError),
    Closed,
}

/// A live, open connection: the `send`/`close` half of the transport
/// contract. `?Send`: this crate's cache and connection state are driven
/// from a single `tokio::task::LocalSet`, never across threads, so neither
/// this trait nor its futures need to be `Send`.
#[async_trait(?Send)]
pub trait Transport {
    async fn send(&self, message: String) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Opens a new transport connection, returning the live handle plus the
/// channel its inbound events arrive on. Implemented once per underlying
/// socket library; [`ws::WsConnector`] is the default.
#[async_trait(?Send)]
pub trait TransportConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Rc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError>;
}
