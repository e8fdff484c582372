// =============================================================================
// Transport seam
// =============================================================================
//
// The hub client and the upstream feed only see a pair of text channels.
// Dropping the outbound sender closes the socket; the inbound receiver
// yielding `None` means the transport is gone.
// =============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::error::Result;

/// One live connection as seen by its owner.
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl Transport {
    /// Two transports wired back to back. Useful for in-process peers.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outbound: a_tx,
                inbound: a_rx,
            },
            Transport {
                outbound: b_tx,
                inbound: b_rx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Transport>;
}

/// WebSocket connector. Protocol-level pings are answered by tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Transport> {
        let (ws_stream, _response) = connect_async(url).await?;
        info!(url = %url, "websocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!(error = %e, "websocket write failed");
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "peer closed websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Transport {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
