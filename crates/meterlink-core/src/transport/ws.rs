//! WebSocket transport built on tokio-tungstenite.

use super::{Duplex, TransportConnector};
use crate::error::EngineError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Connects to `ws://` and `wss://` host endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Duplex, EngineError> {
        let (stream, _response) = connect_async(endpoint)
            .await
            .map_err(|err| EngineError::Transport(format!("connect to {endpoint} failed: {err}")))?;
        debug!("websocket connected (endpoint={})", endpoint);

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(frame)).await {
                    warn!(
                        "websocket send failed (endpoint={}, err={})",
                        writer_endpoint, err
                    );
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(
                                "dropping non-utf8 binary frame (endpoint={})",
                                reader_endpoint
                            );
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(
                            "websocket receive failed (endpoint={}, err={})",
                            reader_endpoint, err
                        );
                        break;
                    }
                };
                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
            debug!("websocket reader finished (endpoint={})", reader_endpoint);
        });

        Ok(Duplex {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
