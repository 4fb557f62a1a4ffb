use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{stream::SplitSink, StreamExt};
use notary_common::{
    decode_message, send_message, DeliveryChannel, Message, NotaryError, Reply, Request,
    RequestNumber,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

type ClientSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, TungMessage>;

/// WebSocket delivery channel to one notary. Replies are correlated to
/// pending round trips by their echoed request number; anything that cannot
/// be correlated within the deadline is a transport failure.
pub struct WsChannel {
    sink: Arc<Mutex<ClientSink>>,
    pending: Arc<DashMap<RequestNumber, oneshot::Sender<Reply>>>,
    deadline: Duration,
}

impl WsChannel {
    pub async fn connect(url: &str, deadline: Duration) -> Result<Self, NotaryError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| NotaryError::Transport(e.to_string()))?;
        let (sink, mut stream) = ws_stream.split();
        let pending: Arc<DashMap<RequestNumber, oneshot::Sender<Reply>>> =
            Arc::new(DashMap::new());

        // Route incoming replies to whoever is waiting on them.
        let router = pending.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                let TungMessage::Binary(data) = frame else {
                    continue;
                };
                match decode_message(&data) {
                    Ok(Message::Reply(reply)) => {
                        match router.remove(&reply.request_number) {
                            Some((_, slot)) => {
                                let _ = slot.send(reply);
                            }
                            None => warn!(
                                request_number = reply.request_number,
                                "reply without a pending round trip"
                            ),
                        }
                    }
                    Ok(Message::Request(_)) => {
                        warn!("client received a request frame; dropping it")
                    }
                    Err(e) => warn!("failed to decode frame: {e}"),
                }
            }
            // Dropping the map entries closes the waiting slots, which the
            // round trips observe as transport failures.
            router.clear();
            info!("notary connection closed");
        });

        Ok(WsChannel {
            sink: Arc::new(Mutex::new(sink)),
            pending,
            deadline,
        })
    }
}

#[async_trait]
impl DeliveryChannel for WsChannel {
    async fn round_trip(&self, request: Request) -> Result<Reply, NotaryError> {
        let request_number = request.request_number;
        let (slot_tx, slot_rx) = oneshot::channel();
        self.pending.insert(request_number, slot_tx);

        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = send_message(&mut sink, &Message::Request(request)).await {
                self.pending.remove(&request_number);
                return Err(e);
            }
        }

        match tokio::time::timeout(self.deadline, slot_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NotaryError::Transport(
                "connection closed before the reply arrived".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&request_number);
                Err(NotaryError::Transport("round trip timed out".to_string()))
            }
        }
    }
}
