//! Socket seam between the connection state machine and the wire.

use async_trait::async_trait;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};

const OUTBOUND_BUFFER: usize = 64;

/// Decoded transport-level frame. Control frames never reach this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

pub type FrameStream = BoxStream<'static, ClientResult<Frame>>;

/// One open socket: inbound frames plus a sender for outbound text.
/// Dropping `outbound` closes the socket.
pub struct SocketHandle {
    pub frames: FrameStream,
    pub outbound: mpsc::Sender<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: Url) -> ClientResult<SocketHandle>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: Url) -> ClientResult<SocketHandle> {
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut ws_writer, ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(WsMessage::Text(text)).await {
                    warn!(error = %err, "ws: outbound send failed");
                    return;
                }
            }
            debug!("ws: outbound channel closed, closing socket");
            let _ = ws_writer.close().await;
        });

        let frames = ws_reader
            .filter_map(|message| async move {
                match message {
                    Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(WsMessage::Close(frame)) => Some(Ok(Frame::Closed {
                        code: frame.as_ref().map(|frame| u16::from(frame.code)),
                        reason: frame
                            .map(|frame| frame.reason.into_owned())
                            .unwrap_or_default(),
                    })),
                    Ok(_) => None,
                    Err(err) => Some(Err(ClientError::from(err))),
                }
            })
            .boxed();

        Ok(SocketHandle { frames, outbound })
    }
}
