use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket}, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};

use super::Gateway;

#[debug_handler(state = crate::AppState)]
pub async fn signal_ws(
    State(gateway): State<Gateway>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve(gateway, stream))
}

async fn serve(gateway: Gateway, stream: WebSocket) {
    let (id, mut rx) = gateway.connect();
    let (mut sender, mut receiver) = stream.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(event = event.name(), error = %e, "unserializable event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => gateway.handle_text(id, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %id, error = %e, "socket error");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    gateway.disconnect(id).await;
    writer.abort();
}
