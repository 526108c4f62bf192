use askflow_ai::{ClientMessage, ServerMessage};
use axum::{
    Extension,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, future};
use std::sync::Arc;

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one client socket onto a relay session. The inbound side ends on a
/// close frame or transport error, which the session treats as a disconnect.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();

    let inbound = receiver
        .take_while(|msg| future::ready(matches!(msg, Ok(msg) if !matches!(msg, Message::Close(_)))))
        .filter_map(|msg| future::ready(msg.ok().and_then(parse_client_message)));

    let outbound = sender.with(|msg: ServerMessage| {
        future::ready(
            serde_json::to_string(&msg)
                .map(|text| Message::Text(text.into()))
                .map_err(axum::Error::new),
        )
    });

    let outcome = state
        .sessions
        .serve(Box::pin(inbound), Box::pin(outbound))
        .await;
    tracing::debug!(?outcome, "WebSocket session finished");
}

/// Text frames become questions; control and binary frames are skipped.
fn parse_client_message(msg: Message) -> Option<askflow_ai::Result<ClientMessage>> {
    match msg {
        Message::Text(text) => Some(ClientMessage::parse(text.as_str())),
        _ => None,
    }
}
