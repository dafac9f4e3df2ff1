//! WebSocket push subscription
//!
//! A subscriber first receives a `subscribed` frame, then every signal
//! addressed to it as a `signal` frame: stored ones in sequence order,
//! then live ones as they are published.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use studyroom_webrtc::signaling::{PushFrame, Subscription};
use studyroom_webrtc::Error;
use tracing::{debug, info, warn};

use super::{AppState, RelayError};

/// `GET /webrtc/subscribe/:session_id/:user_id`
///
/// Membership is checked before the upgrade so unknown rooms and users get
/// a plain 404/403.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    Path((session_id, user_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    if !state.store.has_room(&session_id) {
        return RelayError::from(Error::SessionNotFound(session_id)).into_response();
    }
    if !state
        .store
        .participants(&session_id)
        .iter()
        .any(|p| p.user_id == user_id)
    {
        return RelayError::from(Error::PeerNotFound(format!(
            "{} is not in room {}",
            user_id, session_id
        )))
        .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, user_id: String) {
    // The user may have left between the check and the upgrade
    let subscription = match state.store.subscribe(&session_id, &user_id) {
        Ok(subscription) => subscription,
        Err(e) => {
            debug!(room = %session_id, user_id = %user_id, error = %e, "Subscription refused");
            return;
        }
    };
    info!(room = %session_id, user_id = %user_id, subscription = subscription.id, "Push subscriber connected");

    let id = subscription.id;
    forward(socket, &session_id, &user_id, subscription).await;

    state.store.unsubscribe(&session_id, &user_id, id);
    info!(room = %session_id, user_id = %user_id, subscription = id, "Push subscriber disconnected");
}

async fn forward(socket: WebSocket, session_id: &str, user_id: &str, subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let mut signals = subscription.receiver;

    let subscribed = PushFrame::Subscribed {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
    };
    if send_frame(&mut sender, &subscribed).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            signal = signals.recv() => {
                // Sender dropped: the user left or subscribed again elsewhere
                let Some(envelope) = signal else {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let seq = envelope.seq;
                if send_frame(&mut sender, &PushFrame::Signal(envelope)).await.is_err() {
                    warn!(room = %session_id, user_id = %user_id, seq, "Push delivery failed");
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(room = %session_id, user_id = %user_id, error = %e, "Push socket error");
                    break;
                }
                // Clients do not send anything meaningful; pings are answered by axum
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_frame<S>(sender: &mut S, frame: &PushFrame) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode push frame");
            return Err(());
        }
    };
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
