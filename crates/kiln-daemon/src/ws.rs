//! Live channel for panels: join groups, receive their log/progress/state events, and
//! send console commands.

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use kiln_process::InstanceId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    auth::AuthUser,
    broadcast::{HubEvent, SUBSCRIBER_CAPACITY, Subscriber, instance_group},
    state::AppState,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { group: String },
    Leave { group: String },
    Command { instance_id: InstanceId, command: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyFrame {
    Joined { group: String },
    Left { group: String },
    CommandResult {
        instance_id: InstanceId,
        success: bool,
        message: String,
    },
    Error { message: String },
}

#[derive(Serialize)]
struct EventFrame<'a> {
    group: &'a str,
    #[serde(flatten)]
    event: &'a HubEvent,
}

fn encode<T: Serialize>(frame: &T) -> Option<Message> {
    serde_json::to_string(frame).ok().map(Message::Text)
}

pub async fn upgrade(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, user, socket))
}

async fn handle_socket(state: AppState, user: AuthUser, socket: WebSocket) {
    let (subscriber, mut hub_rx) = state.hub.subscribe(SUBSCRIBER_CAPACITY);
    let span = tracing::info_span!("ws", user = %user.username, subscriber = subscriber.id());
    async move {
        let (mut sender, mut receiver) = socket.split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ReplyFrame>();
        let evicted = subscriber.evicted();
        tracing::debug!("connected");

        let writer = {
            let evicted = evicted.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        Some(d) = hub_rx.recv() => {
                            encode(&EventFrame { group: &d.group, event: &d.event })
                        }
                        Some(r) = reply_rx.recv() => encode(&r),
                        _ = evicted.cancelled() => {
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                        else => break,
                    };
                    let Some(msg) = msg else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
            })
        };

        loop {
            let msg = tokio::select! {
                msg = receiver.next() => msg,
                _ = evicted.cancelled() => {
                    tracing::warn!("closing connection that fell behind");
                    break;
                }
            };
            let Some(Ok(msg)) = msg else { break };
            let reply = match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => handle_frame(&state, &user, &subscriber, frame).await,
                    Err(e) => ReplyFrame::Error {
                        message: format!("invalid frame: {e}"),
                    },
                },
                Message::Close(_) => break,
                _ => continue,
            };
            if reply_tx.send(reply).is_err() {
                break;
            }
        }

        state.hub.leave_all(subscriber.id());
        drop(reply_tx);
        drop(subscriber);
        if evicted.is_cancelled() {
            let _ = writer.await;
        } else {
            writer.abort();
        }
        tracing::debug!("disconnected");
    }
    .instrument(span)
    .await
}

pub(crate) async fn handle_frame(
    state: &AppState,
    user: &AuthUser,
    subscriber: &Subscriber,
    frame: ClientFrame,
) -> ReplyFrame {
    match frame {
        ClientFrame::Join { group } => {
            if !user.can_access(&group) {
                return ReplyFrame::Error {
                    message: format!("no access to {group}"),
                };
            }
            state.hub.join(&group, subscriber);
            ReplyFrame::Joined { group }
        }
        ClientFrame::Leave { group } => {
            state.hub.leave(&group, subscriber.id());
            ReplyFrame::Left { group }
        }
        ClientFrame::Command {
            instance_id,
            command,
        } => {
            if !user.can_access(&instance_group(instance_id)) {
                return ReplyFrame::Error {
                    message: format!("no access to instance {instance_id}"),
                };
            }
            let (success, message) = if command.contains('\n') {
                (false, "command must be a single line".to_string())
            } else {
                match state.instances.send_command(instance_id, &command).await {
                    Ok(()) => (true, "sent".to_string()),
                    Err(e) => (false, e.to_string()),
                }
            };
            ReplyFrame::CommandResult {
                instance_id,
                success,
                message,
            }
        }
    }
}
