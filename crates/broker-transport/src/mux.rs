//! Listener / multiplexer.
//!
//! One axum router fronts everything: native gRPC (HTTP/2) and gRPC-Web
//! (HTTP/1.1 POST) are handled by the wrapped tonic services; the
//! WebSocket-wrapped gRPC-Web variant is bridged by hand since
//! `tonic-web` only speaks the POST variant. Unmatched requests fall
//! through to a plain-text advisory.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tower::ServiceExt;
use tracing::{info, warn};

use crate::generated::guest_service_server::GuestServiceServer;
use crate::generated::host_service_server::HostServiceServer;
use crate::generated::{GuestRequest, GuestResponse};
use crate::guest::{run_guest_channel, GuestServiceImpl};
use crate::host::HostServiceImpl;
use crate::state::BrokerState;
use crate::wire::{encode_data_frame, encode_trailer_frame, FrameDecoder};

/// Consulted for every WebSocket upgrade. The default denies every origin;
/// operators must supply an allow-list.
pub type OriginPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub fn deny_all() -> OriginPredicate {
    Arc::new(|_| false)
}

pub fn allow_list(origins: Vec<String>) -> OriginPredicate {
    Arc::new(move |origin| origins.iter().any(|allowed| allowed == origin))
}

const GRPC_WEBSOCKETS_SUBPROTOCOL: &str = "grpc-websockets";
const BRIDGE_CHANNEL_CAPACITY: usize = 4;

#[derive(Clone)]
struct MuxState {
    broker: BrokerState,
    origin_allowed: OriginPredicate,
    /// The tonic-backed router (native gRPC + gRPC-Web-over-POST, CORS and
    /// `GrpcWebLayer` applied), kept around so the guest channel's dispatch
    /// handler can hand off any non-upgrade request to it directly instead
    /// of shadowing tonic's own route for the same path.
    guest_channel_grpc: Router,
}

/// Builds the single listener router described in the module doc.
pub fn build_router(broker: BrokerState, origin_allowed: OriginPredicate) -> Router {
    let host_service = HostServiceServer::new(HostServiceImpl::new(broker.clone()));
    let guest_service = GuestServiceServer::new(GuestServiceImpl::new(broker.clone()));

    let grpc_routes = tonic::service::Routes::builder()
        .add_service(host_service)
        .add_service(guest_service)
        .routes();

    let grpc_router: Router = grpc_routes
        .into_axum_router()
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::cors::CorsLayer::permissive())
                .layer(tonic_web::GrpcWebLayer::new()),
        )
        .fallback(plain_text_advisory);

    let mux_state = MuxState {
        broker,
        origin_allowed,
        guest_channel_grpc: grpc_router.clone(),
    };

    // `/GuestService/TerminalChannel` serves both a WebSocket upgrade (GET)
    // and native gRPC / gRPC-Web (POST) on the same path, so it can't be a
    // plain merge of two routers registering the same route: a GET-only
    // route here plus tonic's POST-only route underneath would either
    // shadow one or the other, or conflict outright. Instead this is the
    // only explicit route on the top-level router; every other path
    // (HostService/*, and anything unmatched) falls through to the tonic
    // router's own routes and fallback.
    Router::new()
        .route("/GuestService/TerminalChannel", any(guest_channel_dispatch))
        .with_state(mux_state)
        .fallback_service(grpc_router)
}

async fn plain_text_advisory() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "this endpoint speaks gRPC, gRPC-Web, or gRPC-Web over WebSocket\n",
    )
        .into_response()
}

/// Dispatches `/GuestService/TerminalChannel`: a GET carrying the
/// `grpc-websockets` subprotocol is upgraded and bridged by hand; every
/// other request (native gRPC over HTTP/2, gRPC-Web over HTTP/1.1 POST) is
/// handed untouched to the tonic-backed [`GuestService`] implementation.
async fn guest_channel_dispatch(State(mux): State<MuxState>, request: Request) -> Response {
    if request.method() != Method::GET {
        return mux
            .guest_channel_grpc
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|err: Infallible| match err {});
    }

    let (mut parts, body) = request.into_parts();

    let requests_grpc_websockets = parts
        .headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .any(|protocol| protocol == GRPC_WEBSOCKETS_SUBPROTOCOL)
        })
        .unwrap_or(false);

    if !requests_grpc_websockets {
        // Not a websocket upgrade in disguise as GET; give tonic a chance
        // (a GET with no upgrade headers has no legitimate gRPC meaning,
        // but this keeps the dispatch symmetric rather than hand-rolling
        // a second error path).
        return mux
            .guest_channel_grpc
            .clone()
            .oneshot(Request::from_parts(parts, body))
            .await
            .unwrap_or_else(|err: Infallible| match err {});
    }

    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !(mux.origin_allowed)(&origin) {
        warn!(origin, "rejected websocket upgrade: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &mux).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(origin, "accepted guest websocket upgrade");
    let broker = mux.broker.clone();
    ws.protocols([GRPC_WEBSOCKETS_SUBPROTOCOL])
        .on_upgrade(move |socket| bridge_guest_socket(socket, broker))
}

/// Decodes gRPC-Web frames off the socket into `GuestRequest`s feeding a
/// `ReceiverStream`, runs the same guest state machine the tonic-fed path
/// uses, and re-frames its responses back onto the socket. No second
/// network hop: the decoded stream is handed straight to
/// [`run_guest_channel`] in-process.
async fn bridge_guest_socket(socket: WebSocket, broker: BrokerState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (inbound_tx, inbound_rx) = mpsc::channel::<Result<GuestRequest, Status>>(BRIDGE_CHANNEL_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Result<GuestResponse, Status>>(BRIDGE_CHANNEL_CAPACITY);

    tokio::spawn(run_guest_channel(
        broker.registry.clone(),
        broker.metrics.clone(),
        broker.process_lifetime.clone(),
        ReceiverStream::new(inbound_rx),
        outbound_tx,
    ));

    let decode_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        while let Some(message) = ws_rx.next().await {
            let chunk = match message {
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            decoder.push(&chunk);
            while let Some(frame) = decoder.next_frame() {
                if frame.is_trailer {
                    continue;
                }
                let request = match GuestRequest::decode(frame.payload) {
                    Ok(request) => request,
                    Err(err) => {
                        let _ = inbound_tx
                            .send(Err(Status::invalid_argument(err.to_string())))
                            .await;
                        return;
                    }
                };
                if inbound_tx.send(Ok(request)).await.is_err() {
                    return;
                }
            }
        }
    });

    while let Some(result) = outbound_rx.recv().await {
        let frame = match result {
            Ok(response) => encode_data_frame(&response.encode_to_vec()),
            Err(status) => encode_trailer_frame(&[
                ("grpc-status", &status.code().to_string()),
                ("grpc-message", status.message()),
            ]),
        };
        if ws_tx.send(Message::Binary(frame.to_vec())).await.is_err() {
            break;
        }
    }

    decode_task.abort();
}
