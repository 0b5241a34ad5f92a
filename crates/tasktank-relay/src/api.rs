use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tasktank_shared::wire::RelayFrame;

use crate::relay::{RelayState, Session};

/// Room for the frame envelope around a maximum-size record.
const FRAME_OVERHEAD: usize = 4096;

pub fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(relay_socket))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
    records: usize,
}

async fn health_check(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.connections(),
        records: state.stored().await,
    })
}

async fn relay_socket(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    let limit = state.config.max_record_size + FRAME_OVERHEAD;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| run_connection(socket, state, addr))
}

async fn send_frames(
    sink: &mut SplitSink<WebSocket, Message>,
    frames: Vec<RelayFrame>,
) -> Result<(), axum::Error> {
    for frame in frames {
        sink.send(Message::Text(frame.to_json())).await?;
    }
    Ok(())
}

async fn run_connection(socket: WebSocket, state: RelayState, addr: SocketAddr) {
    let open = state.connection_opened();
    info!(peer = %addr, open, "client connected");

    let (mut sink, mut stream) = socket.split();
    let mut live = state.subscribe_live();
    let mut session = Session::new(state.clone(), addr.to_string());

    loop {
        let frames = tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(peer = %addr, error = %e, "socket error");
                    break;
                }
            },
            record = live.recv() => match record {
                Ok(record) => session.on_live(&record),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(peer = %addr, skipped, "client too slow, live records dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        if let Err(e) = send_frames(&mut sink, frames).await {
            debug!(peer = %addr, error = %e, "send failed");
            break;
        }
    }

    let open = state.connection_closed();
    info!(peer = %addr, open, subs = session.subscription_count(), "client disconnected");
}

/// Serve on an already-bound listener until the server fails.
pub async fn serve_on(listener: TcpListener, state: RelayState) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub async fn serve(state: RelayState, addr: SocketAddr) -> anyhow::Result<()> {
    info!(addr = %addr, "Starting relay server");
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}
