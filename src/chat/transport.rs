use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::debug;

/// What the transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text message (may hold several STOMP frames).
    Text(String),
    /// The peer closed the link, with its close reason if it gave one.
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// An open text link. Dropping `outbound` closes the link.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens text links to the broker. `ConnectionManager` only talks to the
/// network through this seam.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: String) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn open(&self, url: String) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        Box::pin(async move {
            let (stream, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError(format!("WebSocket connect to {url} failed: {e}")))?;
            debug!("WebSocket open to {url}");

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(stream, outbound_rx, inbound_tx));

            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

/// Shuttles text between the socket and the link's channels until either
/// side goes away.
async fn pump<S>(
    stream: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => TransportEvent::Text(text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => TransportEvent::Text(text),
                        Err(_) => {
                            debug!("Dropping non UTF-8 binary message");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let _ = inbound.send(TransportEvent::Closed(
                            frame.map(|f| f.reason.into_owned()),
                        ));
                        break;
                    }
                    // Ping/pong are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = inbound.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = inbound.send(TransportEvent::Closed(None));
                        break;
                    }
                };
                if inbound.send(event).is_err() {
                    // Nobody listening any more.
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        let _ = inbound.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}
