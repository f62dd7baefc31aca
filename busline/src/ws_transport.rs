//! Websocket transport: each connection is admitted as a peer, and its
//! text frames are decoded/encoded as whole JSON packet envelopes (one
//! frame per packet, matching the bus's original websocket behavior).

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State,
    },
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use busline_core::dispatcher::{forward_peer_traffic, DispatcherHandles};
use busline_core::error::BuslineError;
use busline_core::peer::{new_peer, DEFAULT_QUEUE_CAPACITY};
use busline_core::packet::Packet;

pub async fn serve(bind_addr: &str, handles: DispatcherHandles) -> std::io::Result<()> {
    let router = Router::new()
        .route("/", get(upgrade))
        .with_state(handles);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "websocket transport listening");
    axum::serve(listener, router).await
}

async fn upgrade(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(handles): State<DispatcherHandles>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, handles))
}

async fn handle_socket(socket: WebSocket, handles: DispatcherHandles) {
    let (created, peer_handle) = new_peer(DEFAULT_QUEUE_CAPACITY);
    let (admission, out_rx) = created.into_parts();
    let peer_id = admission.id;

    tokio::spawn(forward_peer_traffic(peer_id, out_rx, handles.traffic_tx.clone()));

    if let Err(err) = handles.admission_tx.send_async(admission).await {
        let err = BuslineError::admission_failed(err.to_string());
        warn!(%err, "rejecting websocket connection");
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let out_tx = peer_handle.out_tx;
    let in_rx = peer_handle.in_rx;

    let writer = tokio::spawn(async move {
        while let Ok(packet) = in_rx.recv_async().await {
            let Ok(json) = serde_json::to_string(&packet) else {
                continue;
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(err) => {
                debug!(peer = %peer_id, %err, "websocket read error");
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let packet: Packet = match serde_json::from_str::<Packet>(&text).map_err(BuslineError::from) {
            Ok(p) => p,
            Err(err) => {
                warn!(peer = %peer_id, %err, "dropping malformed packet");
                continue;
            }
        };

        if out_tx.send_async(packet).await.is_err() {
            break;
        }
    }

    // Dropping `out_tx` here closes the peer's outbound queue, which the
    // forwarder task observes and reports to the dispatcher as a
    // disconnect.
    drop(out_tx);
    writer.abort();
    info!(peer = %peer_id, "websocket connection closed");
}
