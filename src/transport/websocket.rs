use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::broker::Broker;
use crate::broker::message::SubscriptionRequest;
use crate::config::DeliverySettings;
use crate::transport::LocalTransport;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::BrokerError;

/// Per-connection state.
#[derive(Debug, Clone)]
pub struct Session {
    /// Inbox every subscription of this connection delivers to.
    pub inbox: String,
    /// Set by a `connect` request.
    pub client_id: Option<String>,
    defaults: DeliverySettings,
}

impl Session {
    pub fn new(inbox: &str, defaults: DeliverySettings) -> Self {
        Self {
            inbox: inbox.to_string(),
            client_id: None,
            defaults,
        }
    }

    fn client_id(&self) -> Result<&str, BrokerError> {
        self.client_id
            .as_deref()
            .ok_or_else(|| BrokerError::InvalidRequest("connect first".into()))
    }
}

/// Runs one request against the broker and builds the reply frame.
pub async fn handle_client_message(
    broker: &Broker,
    session: &mut Session,
    msg: ClientMessage,
) -> ServerMessage {
    let result = match msg {
        ClientMessage::Connect { client_id } => {
            if let Some(current) = &session.client_id {
                Err(BrokerError::already_exists("client", current.clone()))
            } else {
                broker.connect(&client_id).await.map(|_| {
                    session.client_id = Some(client_id.clone());
                    ServerMessage::Connected { client_id }
                })
            }
        }

        ClientMessage::Subscribe {
            channel,
            durable_name,
            queue_group,
            max_in_flight,
            ack_wait_ms,
            start,
        } => match session.client_id() {
            Ok(client_id) => {
                let mut request = SubscriptionRequest::new(
                    client_id,
                    &channel,
                    &session.inbox,
                    max_in_flight.unwrap_or(session.defaults.default_max_in_flight),
                )
                .start_at(start);
                request.ack_wait_ms = ack_wait_ms.unwrap_or(session.defaults.default_ack_wait_ms);
                request.durable_name = durable_name;
                request.queue_group = queue_group;
                broker
                    .subscribe(request)
                    .await
                    .map(|info| ServerMessage::Subscribed {
                        channel: info.channel,
                        sub_id: info.id,
                    })
            }
            Err(err) => Err(err),
        },

        ClientMessage::Unsubscribe { channel, sub_id } => broker
            .unsubscribe(&channel, sub_id)
            .await
            .map(|_| ServerMessage::Ok),

        ClientMessage::Close { channel, sub_id } => broker
            .close_subscription(&channel, sub_id)
            .await
            .map(|_| ServerMessage::Ok),

        ClientMessage::Publish { channel, payload } => broker
            .publish(&channel, payload.into_bytes())
            .await
            .map(|sequence| ServerMessage::Published { channel, sequence }),

        ClientMessage::Ack {
            channel,
            sub_id,
            sequence,
        } => broker
            .ack(&channel, sub_id, sequence)
            .await
            .map(|_| ServerMessage::Ok),

        ClientMessage::Disconnect => match session.client_id.take() {
            Some(client_id) => broker.disconnect(&client_id).await.map(|_| ServerMessage::Ok),
            None => Ok(ServerMessage::Ok),
        },
    };
    result.unwrap_or_else(ServerMessage::error)
}

fn encode(msg: &ServerMessage) -> Option<WsMessage> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(WsMessage::text(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize server message");
            None
        }
    }
}

pub async fn start_websocket_server(
    addr: &str,
    broker: Arc<Broker>,
    transport: Arc<LocalTransport>,
    max_connections: usize,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", addr);
    serve(listener, broker, transport, max_connections).await;
    Ok(())
}

/// Accepts connections on `listener` until accepting fails.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    transport: Arc<LocalTransport>,
    max_connections: usize,
) {
    let connections = Arc::new(AtomicUsize::new(0));

    while let Ok((stream, peer)) = listener.accept().await {
        if connections.load(Ordering::Acquire) >= max_connections {
            warn!(%peer, max_connections, "connection limit reached, refusing");
            continue;
        }
        connections.fetch_add(1, Ordering::AcqRel);

        let broker = broker.clone();
        let transport = transport.clone();
        let connections = connections.clone();
        let inbox = format!("inbox-{}", uuid::Uuid::new_v4());

        tokio::spawn(async move {
            serve_connection(stream, broker, transport.clone(), &inbox).await;
            transport.unregister(&inbox);
            connections.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    broker: Arc<Broker>,
    transport: Arc<LocalTransport>,
    inbox: &str,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake error");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Replies and deliveries share one outgoing queue.
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut deliveries = transport.register(inbox);

    let inbox_for_sender = inbox.to_string();
    spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                warn!(inbox = %inbox_for_sender, error = %e, "failed to send frame");
                break;
            }
        }
        debug!(inbox = %inbox_for_sender, "send loop closed");
    });

    let delivery_tx = tx.clone();
    let forwarder = spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let Some(frame) = encode(&ServerMessage::from(&delivery)) else {
                continue;
            };
            if delivery_tx.send(frame).is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(inbox, broker.settings().clone());

    while let Some(Ok(msg)) = ws_receiver.next().await {
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };
        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(request) => handle_client_message(&broker, &mut session, request).await,
            Err(err) => {
                warn!(inbox = %inbox, error = %err, "invalid client message");
                ServerMessage::error(BrokerError::InvalidRequest(err.to_string()))
            }
        };
        if let Some(frame) = encode(&reply) {
            if tx.send(frame).is_err() {
                break;
            }
        }
    }

    forwarder.abort();
    if let Some(client_id) = session.client_id.take() {
        if let Err(err) = broker.disconnect(&client_id).await {
            warn!(client = %client_id, error = %err, "cleanup of disconnected client failed");
        }
        info!(client = %client_id, "{} disconnected", client_id);
    }
}
