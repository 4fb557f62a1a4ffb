use crate::Notary;
use futures_util::StreamExt;
use notary_common::{decode_message, send_message, Message, NotaryError};
use std::sync::Arc;
use tokio_tungstenite::{accept_async, tungstenite::Message as TungMessage};
use tracing::{info, warn};
use uuid::Uuid;

/// Accepts client connections and answers each request on the connection it
/// arrived on. Replies are never broadcast; they are correlated per session.
pub struct NotaryListener {
    notary: Arc<Notary>,
}

impl NotaryListener {
    pub fn new(notary: Arc<Notary>) -> Self {
        NotaryListener { notary }
    }

    pub async fn listen(&self, address: &str) -> Result<(), NotaryError> {
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|e| NotaryError::Transport(e.to_string()))?;
        info!("WebSocket server listening on {}", address);

        while let Ok((stream, _)) = listener.accept().await {
            let notary = self.notary.clone();
            tokio::spawn(async move {
                let Ok(ws_stream) = accept_async(stream).await else {
                    return;
                };
                let session_id = Uuid::new_v4();
                info!("session {session_id} opened");
                let (mut write, mut read) = ws_stream.split();
                while let Some(Ok(frame)) = read.next().await {
                    let TungMessage::Binary(data) = frame else {
                        continue;
                    };
                    match decode_message(&data) {
                        Ok(Message::Request(request)) => {
                            let reply = notary.handle_request(request).await;
                            if let Err(e) = send_message(&mut write, &Message::Reply(reply)).await {
                                warn!("session {session_id}: failed to send reply: {e}");
                                break;
                            }
                        }
                        Ok(Message::Reply(_)) => {
                            warn!("session {session_id}: unexpected reply frame")
                        }
                        Err(e) => warn!("session {session_id}: undecodable frame: {e}"),
                    }
                }
                info!("Session with ID {:?} terminated", session_id);
            });
        }
        Ok(())
    }
}
