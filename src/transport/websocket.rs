use async_trait::async_trait;
use futures_util::{future, SinkExt, StreamExt};
use secrecy::SecretString;
use tokio_tungstenite::tungstenite::Message;

use crate::client::utils::build_request;
use crate::error::ClientError;
use crate::transport::{Connector, FrameSink, FrameStream};

/// [`Connector`] over `tokio-tungstenite`, authenticating the upgrade with a bearer token.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str, token: &SecretString) -> Result<(FrameSink, FrameStream), ClientError> {
        let request = build_request(url, token)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!("websocket connected");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(ClientError::from)
            .with(|text: String| future::ready(Ok::<_, ClientError>(Message::Text(text))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bin)) => {
                    tracing::warn!("unexpected binary message: {} bytes", bin.len());
                    None
                }
                Ok(Message::Close(reason)) => {
                    tracing::info!("connection closed: {:?}", reason);
                    None
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::error!("failed to read message: {}", e);
                    Some(Err(ClientError::from(e)))
                }
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
