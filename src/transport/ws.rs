//! Default [`TransportConnector`] backed by `tokio-tungstenite`, gated
//! behind the `ws-transport` feature the same way an optional network
//! transport integration is gated behind its own Cargo feature.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{Transport, TransportConnector, TransportEvent};
use crate::error::TransportError;

type WriteHalf = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

pub struct WsTransport {
    write: RefCell<WriteHalf>,
}

#[async_trait(?Send)]
impl Transport for WsTransport {
    async fn send(&self, message: String) -> Result<(), TransportError> {
        // The write half is borrowed only across this single `.send` call;
        // no other borrow of it is ever held across an `.await` elsewhere.
        let mut write = self.write.borrow_mut();
        write
            .send(WsMessage::Text(message))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        let mut write = self.write.borrow_mut();
        let _ = write.close().await;
    }
}

#[derive(Default)]
pub struct WsConnector {
    channel_capacity: usize,
}

impl WsConnector {
    pub fn new(channel_capacity: usize) -> Self {
        Self { channel_capacity }
    }
}

#[async_trait(?Send)]
impl TransportConnector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Rc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;
        let (write, mut read) = stream.split();

        let capacity = self.channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let _ = tx.send(TransportEvent::Opened).await;

        tokio::task::spawn_local(async move {
            loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if tx.send(TransportEvent::Message(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        let _ = tx.send(TransportEvent::Closed).await;
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary/ping/pong frames carry no resource-protocol
                        // meaning; ignore them.
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(TransportEvent::Error(TransportError::Io(e.to_string())))
                            .await;
                        let _ = tx.send(TransportEvent::Closed).await;
                        break;
                    }
                }
            }
        });

        Ok((
            Rc::new(WsTransport {
                write: RefCell::new(write),
            }),
            rx,
        ))
    }
}
