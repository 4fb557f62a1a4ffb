use crate::errors::NotaryError;
use crate::types::{Message, Reply, Request};
use async_trait::async_trait;
use futures_util::{stream::SplitSink, SinkExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite::Message as TungMessage, WebSocketStream};

/// Transport boundary of the operation pipeline: one request out, one reply
/// back (or a transport failure). Timeouts are the implementor's concern and
/// surface as `NotaryError::Transport`.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn round_trip(&self, request: Request) -> Result<Reply, NotaryError>;
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, NotaryError> {
    bincode::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| NotaryError::Serialization(e.to_string()))
}

pub fn decode_message(data: &[u8]) -> Result<Message, NotaryError> {
    let (message, _) = bincode::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| NotaryError::Serialization(e.to_string()))?;
    Ok(message)
}

/// Writes one message as a binary WebSocket frame.
pub async fn send_message<S>(
    sink: &mut SplitSink<WebSocketStream<S>, TungMessage>,
    message: &Message,
) -> Result<(), NotaryError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let data = encode_message(message)?;
    sink.send(TungMessage::Binary(data.into()))
        .await
        .map_err(|e| NotaryError::Transport(e.to_string()))?;
    Ok(())
}
