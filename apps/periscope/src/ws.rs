use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use periscope_proto::{ClientMessage, ServerMessage};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError};
use crate::session::{Outbound, Role, SessionHandle};

pub struct AppState {
    pub broker: Broker,
    pub metrics: PrometheusHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let session = SessionHandle::new(tx);
    counter!("periscope_connections_total", 1);
    debug!(session = %session.id(), %remote_addr, "socket connected");

    // Writer half: everything the rest of the server wants to say to this
    // connection funnels through the unbounded channel. A failed write means
    // the connection is gone; the read half notices on its own.
    let writer_id = session.id();
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(msg) => {
                    let Ok(json) = serde_json::to_string(&msg) else {
                        continue;
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Shutdown => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!(session = %writer_id, "writer task ended");
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                // Transport failure is an implicit close, never retried here.
                debug!(session = %session.id(), error = %err, "socket read failed");
                break;
            }
        };
        let text = match &frame {
            Message::Text(text) => text.as_str(),
            // Some clients send JSON in binary frames; accept both.
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(session = %session.id(), "non-UTF-8 binary frame");
                    break;
                }
            },
            Message::Close(_) => break,
            // Ping/pong are handled by the transport.
            _ => continue,
        };

        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(session = %session.id(), error = %err, "unparseable message");
                break;
            }
        };

        match route(&state.broker, &session, msg) {
            Ok(()) => {}
            Err(BrokerError::PoolExhausted) => {
                session.send(ServerMessage::Error {
                    message: "no agent available".into(),
                });
            }
            Err(BrokerError::StaleSlot) => {
                debug!(session = %session.id(), "closing agent for abandoned slot");
                break;
            }
            Err(err @ BrokerError::Violation(_)) => {
                counter!("periscope_protocol_violations_total", 1);
                warn!(session = %session.id(), %err, "closing session");
                break;
            }
        }
    }

    state.broker.session_closed(&session);
    session.close();
    debug!(session = %session.id(), "socket disconnected");
}

/// Validate the message kind against the session's role and dispatch. All
/// paths are synchronous; anything that needs to wait for a peer runs as its
/// own task so this loop keeps draining the socket.
fn route(broker: &Broker, session: &SessionHandle, msg: ClientMessage) -> Result<(), BrokerError> {
    if let ClientMessage::Identify {
        socket_kind,
        slot_id,
    } = msg
    {
        return broker.classify(session, socket_kind, slot_id);
    }

    match (session.role(), msg) {
        (Role::Unclassified, _) => Err(BrokerError::Violation("message before identify")),
        (Role::Viewer, ClientMessage::StartRecording { url }) => {
            broker.start_recording(session, url)
        }
        (Role::Viewer, ClientMessage::StopRecording) => {
            broker.stop_recording(session);
            Ok(())
        }
        (Role::Viewer, ClientMessage::IceCandidate { candidate }) => {
            relay(session, ServerMessage::IceCandidate { candidate })
        }
        (Role::Viewer, ClientMessage::Answer { answer }) => {
            relay(session, ServerMessage::Answer { answer })
        }
        (
            Role::Viewer,
            input @ (ClientMessage::ResizeEvent { .. }
            | ClientMessage::MouseEvent { .. }
            | ClientMessage::KeyboardEvent { .. }),
        ) => {
            broker.forward_input(session, input);
            Ok(())
        }
        (Role::Agent, ClientMessage::Offer { offer }) => {
            relay(session, ServerMessage::Offer { offer })
        }
        (Role::Agent, ClientMessage::IceCandidate { candidate }) => {
            relay(session, ServerMessage::IceCandidate { candidate })
        }
        (Role::PoolManager, ClientMessage::SlotResult { slot_id, result }) => {
            broker.slot_result(slot_id, result);
            Ok(())
        }
        _ => Err(BrokerError::Violation("message kind not allowed for role")),
    }
}

fn relay(session: &SessionHandle, msg: ServerMessage) -> Result<(), BrokerError> {
    counter!("periscope_relay_messages_total", 1);
    if session.relay(msg) {
        Ok(())
    } else {
        Err(BrokerError::Violation("relay without an active pairing"))
    }
}
