use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use lobby_core::{ConnectionId, Participant, SessionId, SessionSummary};
use lobby_engine::{Handshake, HandshakeState, JoinRequest, RejectReason};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::protocol::ServerFrame;
use crate::server::AppState;

/// Query string of `GET /ws`. Without `sessionId` the client must send a
/// join request as its first text frame.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub session_id: Option<SessionId>,
    pub display_name: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(mut socket: WebSocket, params: ConnectParams, state: AppState) {
    let mut handshake = Handshake::new(ConnectionId::new());
    tracing::debug!(connection_id = %handshake.connection_id(), "WebSocket upgraded, handshake pending");

    let request = match params.session_id {
        Some(session_id) => Ok(JoinRequest {
            session_id,
            display_name: params.display_name,
        }),
        None => read_join_request(&mut socket, state.config.handshake_timeout)
            .await
            .map(|mut req| {
                req.display_name = req.display_name.or(params.display_name);
                req
            }),
    };

    match request {
        Ok(request) => state.gateway.attempt(&mut handshake, request),
        Err((reason, detail)) => {
            tracing::info!(connection_id = %handshake.connection_id(), %reason, detail = %detail, "Handshake failed");
            let _ = handshake.reject(reason, detail);
        }
    }

    match handshake.state().clone() {
        HandshakeState::Bound {
            participant,
            session,
        } => run_bound(socket, participant, session, state).await,
        HandshakeState::Rejected { reason, .. } => close_with(&mut socket, reason).await,
        HandshakeState::Pending => close_with(&mut socket, RejectReason::Internal).await,
    }
}

/// Wait for the first text frame and parse it as a join request.
async fn read_join_request(
    socket: &mut WebSocket,
    timeout: Duration,
) -> Result<JoinRequest, (RejectReason, String)> {
    let first_frame = async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    return JoinRequest::parse(text.as_str())
                        .map_err(|e| (RejectReason::InvalidRequest, e.to_string()));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    return Err((
                        RejectReason::InvalidRequest,
                        "join request must be a text frame".to_string(),
                    ));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err((
                        RejectReason::InvalidRequest,
                        "connection closed before join".to_string(),
                    ));
                }
            }
        }
    };

    tokio::time::timeout(timeout, first_frame)
        .await
        .unwrap_or_else(|_| {
            Err((
                RejectReason::HandshakeTimeout,
                format!("no join request within {}ms", timeout.as_millis()),
            ))
        })
}

async fn close_with(socket: &mut WebSocket, reason: RejectReason) {
    let frame = CloseFrame {
        code: reason.close_code(),
        reason: reason.as_str().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, %reason, "Could not deliver close frame");
    }
}

async fn run_bound(
    mut socket: WebSocket,
    participant: Participant,
    session: SessionSummary,
    state: AppState,
) {
    let (conn, rx) = state
        .connections
        .register(participant.connection_id.clone(), participant.session_id.clone());

    let ack = ServerFrame::Bound {
        session_id: session.id.clone(),
        connection_id: participant.connection_id.clone(),
        display_name: participant.display_name.clone(),
        participant_count: session.participant_count,
        state: session.state,
    };
    let Some(ack) = ack.to_message() else {
        let _ = state.connections.unregister(&conn.id);
        let _ = state.gateway.release(&participant);
        close_with(&mut socket, RejectReason::Internal).await;
        return;
    };

    // The peer only counts as bound once it has the acknowledgement.
    let delivered = tokio::time::timeout(state.config.handshake_timeout, socket.send(ack)).await;
    if !matches!(delivered, Ok(Ok(()))) {
        tracing::warn!(connection_id = %conn.id, session_id = %conn.session_id, "Bound acknowledgement not delivered");
        let _ = state.connections.unregister(&conn.id);
        let _ = state.gateway.release(&participant);
        return;
    }

    // Others may have joined or left while the ack was in flight.
    let joined = ServerFrame::ParticipantJoined {
        connection_id: participant.connection_id.clone(),
        display_name: participant.display_name.clone(),
        participant_count: live_participant_count(&state, &conn.session_id)
            .unwrap_or(session.participant_count),
    };
    broadcast_frame(&state, &conn.session_id, &joined, Some(&conn.id));

    relay(socket, Arc::clone(&conn), rx, &state).await;

    let _ = state.connections.unregister(&conn.id);
    if let Some(session) = state.gateway.release(&participant) {
        let left = ServerFrame::ParticipantLeft {
            connection_id: participant.connection_id.clone(),
            display_name: participant.display_name.clone(),
            participant_count: session.participant_count(),
        };
        broadcast_frame(&state, &session.id, &left, None);
    }
    tracing::info!(connection_id = %conn.id, session_id = %conn.session_id, "WebSocket connection closed");
}

fn live_participant_count(state: &AppState, session_id: &SessionId) -> Option<usize> {
    state
        .registry
        .get(session_id)
        .ok()
        .map(|s| s.participant_count())
}

fn broadcast_frame(
    state: &AppState,
    session_id: &SessionId,
    frame: &ServerFrame,
    except: Option<&ConnectionId>,
) {
    if let Some(message) = frame.to_message() {
        let _ = state
            .connections
            .broadcast_to_session(session_id, &message, except);
    }
}

/// Pump frames until either side stops. Data frames from the peer are
/// fanned out to the rest of its session unchanged.
async fn relay(
    socket: WebSocket,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Message>,
    state: &AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: outbound queue, periodic ping, server-side close
    let cancel = conn.cancelled();
    let heartbeat = state.config.heartbeat_interval;
    let writer_id = conn.id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: "server closing connection".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if ws_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "Sent ping");
                }
            }
        }
    });

    // Reader task: relay data frames, track liveness
    let connections = Arc::clone(&state.connections);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(_) | Message::Binary(_) => {
                    conn.touch();
                    let _ = connections.broadcast_to_session(&conn.session_id, &msg, Some(&conn.id));
                }
                Message::Pong(_) | Message::Ping(_) => conn.touch(),
                Message::Close(_) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}
