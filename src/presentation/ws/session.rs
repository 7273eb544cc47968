//! C5: the per-connection session state machine (spec.md §4.5).
//!
//! One reader task drives Pending -> Active -> Closing -> Closed; a
//! separate writer task drains the session's bounded outbound queue to the
//! socket so a slow peer never stalls the reader or the room it's in.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::domain::User;
use crate::error::AppError;
use crate::infrastructure::realtime::{CloseReason, CloseSignal, Hub, SessionHandle, SessionRecord};
use crate::presentation::ws::codec::{
    decode_delta, decode_inbound, encode_delta, encode_outbound, CodecError, InboundFrame,
    OutboundFrame, WireParticipant,
};

enum SessionState {
    Pending,
    Active { room_id: String, user: User },
}

pub async fn run_session(hub: Arc<Hub>, socket: WebSocket) {
    let client_id = hub.mint_client_id();
    let (ws_sink, ws_stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(hub.config().outbound_queue);
    let close = Arc::new(CloseSignal::default());

    let writer = tokio::spawn(run_writer(ws_sink, outbound_rx, close.clone(), Duration::from_secs(10)));

    run_reader(hub, client_id, ws_stream, outbound_tx, close).await;

    let _ = writer.await;
}

async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    close: Arc<CloseSignal>,
    write_deadline: Duration,
) {
    while let Some(frame) = outbound_rx.recv().await {
        // `encode_outbound` only ever emits valid UTF-8 JSON.
        let text = String::from_utf8(frame).expect("outbound frames are always UTF-8");
        match tokio::time::timeout(write_deadline, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                tracing::warn!("session:write_deadline_exceeded");
                close.trigger(CloseReason::Overflow);
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn run_reader(
    hub: Arc<Hub>,
    client_id: String,
    mut stream: SplitStream<WebSocket>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    close: Arc<CloseSignal>,
) {
    let mut state = SessionState::Pending;
    let idle_timeout = hub.config().idle_timeout;
    let max_frame_bytes = hub.config().max_frame_bytes;

    loop {
        let message = tokio::select! {
            biased;
            reason = close.triggered() => {
                send_error(&outbound_tx, reason.wire_code(), "session closed by server").await;
                break;
            }
            next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(err))) => {
                    tracing::debug!(client_id = %client_id, error = %err, "session:socket_error");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(client_id = %client_id, "session:idle_timeout");
                    break;
                }
            },
        };

        let raw: Vec<u8> = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bin) => bin,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let frame = match decode_inbound(&raw, max_frame_bytes) {
            Ok(frame) => frame,
            Err(CodecError::TooLarge(_)) => {
                send_error(&outbound_tx, "INVALID_MESSAGE", "frame too large").await;
                break;
            }
            Err(err) => {
                send_error(&outbound_tx, "INVALID_MESSAGE", &err.to_string()).await;
                continue;
            }
        };

        match (&mut state, frame) {
            (SessionState::Pending, InboundFrame::Connect { room_id, user, token: _ }) => {
                match handle_connect(&hub, &client_id, &room_id, &user, &outbound_tx, &close).await {
                    Ok(()) => state = SessionState::Active { room_id, user },
                    Err(err) => {
                        send_error(&outbound_tx, err.wire_code(), &err.to_string()).await;
                        break;
                    }
                }
            }
            (SessionState::Pending, _) => {
                send_error(&outbound_tx, "NOT_CONNECTED", "send connect first").await;
                break;
            }
            (SessionState::Active { .. }, InboundFrame::Connect { .. }) => {
                send_error(&outbound_tx, "ALREADY_CONNECTED", "connect already accepted").await;
            }
            (SessionState::Active { room_id, .. }, InboundFrame::Update { delta }) => {
                if !handle_update(&hub, &client_id, room_id, &delta, &outbound_tx).await {
                    break;
                }
            }
            (SessionState::Active { room_id, .. }, InboundFrame::Presence { client_id: _, cursor, selection, viewport }) => {
                let frame = OutboundFrame::Presence {
                    client_id: client_id.clone(),
                    cursor,
                    selection,
                    viewport,
                };
                hub.broadcast(room_id, &encode_outbound(&frame), Some(&client_id)).await;
            }
            (SessionState::Active { room_id, .. }, InboundFrame::Chat { user_name, message, timestamp }) => {
                let frame = OutboundFrame::Chat {
                    user_name,
                    message,
                    timestamp,
                    client_id: client_id.clone(),
                };
                hub.broadcast(room_id, &encode_outbound(&frame), None).await;
            }
            (SessionState::Active { .. }, InboundFrame::Heartbeat { timestamp }) => {
                let frame = OutboundFrame::Heartbeat { timestamp };
                let _ = outbound_tx.send(encode_outbound(&frame)).await;
            }
            (SessionState::Active { .. }, InboundFrame::Leave) => {
                break;
            }
        }
    }

    if let SessionState::Active { .. } = state {
        if let Some((room_id, user)) = hub.disconnect(&client_id).await {
            let frame = OutboundFrame::Leave {
                client_id: client_id.clone(),
                user_id: user.id,
            };
            hub.broadcast(&room_id, &encode_outbound(&frame), None).await;
        }
    }
}

/// Runs the handshake and, on success, places `sync-response` on this
/// session's own outbound queue before attaching it to the registry —
/// guaranteeing it precedes any peer-sourced frame (spec.md §5 ordering
/// guarantee #2), then broadcasts `join`.
async fn handle_connect(
    hub: &Hub,
    client_id: &str,
    room_id: &str,
    user: &User,
    outbound_tx: &mpsc::Sender<Vec<u8>>,
    close: &Arc<CloseSignal>,
) -> Result<(), AppError> {
    let result = hub.prepare_connect(room_id, user, client_id).await?;

    // `result.members` was captured before this session attached (deliberately,
    // so the session's own sync-response can be queued ahead of any broadcast
    // reaching it — see finalize_connect below); append self so each client's
    // participant list reflects who is actually in the room once it joins,
    // without needing a second registry read after attach.
    let mut participants: Vec<WireParticipant> = result
        .members
        .iter()
        .map(|m| WireParticipant {
            client_id: m.client_id.clone(),
            user: m.user.clone(),
        })
        .collect();
    participants.push(WireParticipant {
        client_id: client_id.to_string(),
        user: user.clone(),
    });
    let sync = OutboundFrame::SyncResponse {
        snapshot_data: encode_delta(&result.snapshot_data),
        participants,
    };
    let _ = outbound_tx.send(encode_outbound(&sync)).await;

    let session = SessionHandle(Arc::new(SessionRecord {
        client_id: client_id.to_string(),
        user: user.clone(),
        joined_at: Utc::now(),
        outbound: outbound_tx.clone(),
        close: close.clone(),
    }));
    if let Err(err) = hub.finalize_connect(room_id, session).await {
        // `prepare_connect` already opened a participant row (and acquired
        // the Document) on the strength of reaching Active; since we never
        // get there, undo both rather than leaking them — the reader loop's
        // teardown guard only fires for sessions that made it to Active.
        hub.abort_connect(room_id, client_id).await;
        return Err(err);
    }

    let join = OutboundFrame::Join {
        user: user.clone(),
        client_id: client_id.to_string(),
        room_id: room_id.to_string(),
    };
    hub.broadcast(room_id, &encode_outbound(&join), Some(client_id)).await;
    Ok(())
}

/// Applies the update and relays it to peers. Returns `false` if the
/// session should close (malformed delta or a flooded apply queue).
async fn handle_update(
    hub: &Hub,
    client_id: &str,
    room_id: &str,
    delta: &str,
    outbound_tx: &mpsc::Sender<Vec<u8>>,
) -> bool {
    let payload = match decode_delta(delta) {
        Ok(payload) => payload,
        Err(err) => {
            send_error(outbound_tx, "INVALID_MESSAGE", &err.to_string()).await;
            return false;
        }
    };

    match hub.apply_update(room_id, &payload).await {
        Ok(_) => {
            let frame = OutboundFrame::Update {
                delta: delta.to_string(),
                from: client_id.to_string(),
            };
            hub.broadcast(room_id, &encode_outbound(&frame), Some(client_id)).await;
            true
        }
        Err(err @ AppError::Resource(_)) => {
            send_error(outbound_tx, err.wire_code(), &err.to_string()).await;
            false
        }
        Err(err) => {
            tracing::error!(room_id, client_id, error = %err, "session:apply_update_failed");
            send_error(outbound_tx, err.wire_code(), &err.to_string()).await;
            false
        }
    }
}

async fn send_error(outbound_tx: &mpsc::Sender<Vec<u8>>, code: &'static str, message: &str) {
    let frame = OutboundFrame::Error {
        code,
        message: message.to_string(),
    };
    let _ = outbound_tx.send(encode_outbound(&frame)).await;
}
