//! Guest stream: authenticates, creates a Session, proxies I/O.
//!
//! `AwaitHello -> Authorised -> Proxying -> Terminated`
//!
//! The core of this state machine is generic over its inbound message
//! source (`S: Stream<Item = Result<GuestRequest, Status>>`) rather than
//! tied to `tonic::Streaming` directly. `GuestServiceImpl::terminal_channel`
//! feeds it the stream tonic decoded from HTTP/2 or gRPC-Web-over-POST;
//! [`crate::mux`]'s WebSocket bridge feeds it a `ReceiverStream` fed by
//! hand-decoded frames, without a second network hop.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info_span, warn, Instrument};

use broker_core::{Dimensions, Registry, Session};
use tokio_util::sync::CancellationToken;

use crate::generated::guest_request::Payload as GuestRequestPayload;
use crate::generated::guest_response::Payload as GuestResponsePayload;
use crate::generated::guest_service_server::GuestService;
use crate::generated::{Data, GuestRequest, GuestResponse};
use crate::metrics::ServiceMetrics;
use crate::redact::hash_for_log;
use crate::state::BrokerState;

const CHANNEL_CAPACITY: usize = 4;

pub struct GuestServiceImpl {
    state: BrokerState,
}

impl GuestServiceImpl {
    pub fn new(state: BrokerState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl GuestService for GuestServiceImpl {
    type TerminalChannelStream =
        Pin<Box<dyn Stream<Item = Result<GuestResponse, Status>> + Send + 'static>>;

    async fn terminal_channel(
        &self,
        request: Request<Streaming<GuestRequest>>,
    ) -> Result<Response<Self::TerminalChannelStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(run_guest_channel(
            self.state.registry.clone(),
            self.state.metrics.clone(),
            self.state.process_lifetime.clone(),
            inbound,
            tx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Drives one guest stream to completion. Reusable by any inbound source
/// that yields `Result<GuestRequest, Status>` items, which is what lets
/// the WebSocket bridge share this implementation with the tonic-fed path.
const STREAM_KIND: &str = "guest";

pub(crate) async fn run_guest_channel<S>(
    registry: Arc<Registry>,
    metrics: Arc<ServiceMetrics>,
    process_lifetime: CancellationToken,
    mut inbound: S,
    outbound: mpsc::Sender<Result<GuestResponse, Status>>,
) where
    S: Stream<Item = Result<GuestRequest, Status>> + Unpin + Send + 'static,
{
    let start = metrics.record_stream_start();
    let stream_lifetime = process_lifetime.child_token();

    let (locator, secret, dimensions) = match await_hello(&mut inbound).await {
        Ok(v) => v,
        Err(status) => {
            metrics.record_error(STREAM_KIND);
            metrics.record_stream_end(STREAM_KIND, "error", start);
            let _ = outbound.send(Err(status)).await;
            return;
        }
    };

    let span = info_span!("guest", locator = %locator);
    async move {
        let Some(terminal) = registry.find(&locator).await else {
            metrics.record_error(STREAM_KIND);
            let _ = outbound.send(Err(Status::not_found("unknown locator"))).await;
            metrics.record_stream_end(STREAM_KIND, "error", start);
            return;
        };

        if !terminal.is_secret_valid(&secret) {
            warn!(secret_hash = %hash_for_log(&secret), "rejected guest with invalid secret");
            metrics.record_error(STREAM_KIND);
            let _ = outbound
                .send(Err(Status::permission_denied("invalid secret")))
                .await;
            metrics.record_stream_end(STREAM_KIND, "error", start);
            return;
        }

        let session = Arc::new(Session::new(&stream_lifetime, dimensions));
        if let Err(err) = terminal.register_session(session.clone()).await {
            let service_err: crate::error::ServiceError = err.into();
            metrics.record_error(STREAM_KIND);
            let _ = outbound.send(Err(service_err.into())).await;
            metrics.record_stream_end(STREAM_KIND, "error", start);
            return;
        }
        metrics.active_sessions.inc();

        let outcome = tokio::select! {
            _ = stream_lifetime.cancelled() => "closed",
            send_result = terminal.new_sessions_sender().send(session.clone()) => {
                if send_result.is_ok() {
                    proxy(&session, &stream_lifetime, &mut inbound, &outbound, &metrics).await
                } else {
                    "closed"
                }
            }
        };

        terminal.unregister_session(session.token()).await;
        session.close();
        metrics.active_sessions.dec();
        metrics.record_stream_end(STREAM_KIND, outcome, start);
    }
    .instrument(span)
    .await;
}

async fn await_hello<S>(inbound: &mut S) -> Result<(String, String, Dimensions), Status>
where
    S: Stream<Item = Result<GuestRequest, Status>> + Unpin,
{
    match inbound.next().await {
        Some(Ok(GuestRequest {
            payload: Some(GuestRequestPayload::Hello(hello)),
        })) => {
            let wire_dims = hello.requested_dimensions.unwrap_or_default();
            Ok((
                hello.locator,
                hello.secret,
                Dimensions::new(wire_dims.cols, wire_dims.rows),
            ))
        }
        Some(Ok(_)) => Err(Status::failed_precondition("expected Hello as first message")),
        Some(Err(status)) => Err(status),
        None => Err(Status::failed_precondition("stream closed before Hello")),
    }
}

/// Loss of host connectivity — the session's lifetime ends without the
/// guest stream's lifetime also ending — is reported as `Aborted`; a
/// normal guest disconnect is silent. Returns the outcome label recorded
/// against `stream_duration_seconds`/`streams_total`.
async fn proxy<S>(
    session: &Arc<Session>,
    stream_lifetime: &CancellationToken,
    inbound: &mut S,
    outbound: &mpsc::Sender<Result<GuestResponse, Status>>,
    metrics: &ServiceMetrics,
) -> &'static str
where
    S: Stream<Item = Result<GuestRequest, Status>> + Unpin,
{
    let upward_outcome = tokio::select! {
        _ = downward(session, stream_lifetime, outbound) => "closed",
        outcome = upward(session, stream_lifetime, inbound, outbound, metrics) => outcome,
    };

    if session.lifetime().is_cancelled() && !stream_lifetime.is_cancelled() {
        metrics.record_error(STREAM_KIND);
        let _ = outbound.send(Err(Status::aborted("host disconnected"))).await;
        return "error";
    }

    upward_outcome
}

async fn downward(
    session: &Arc<Session>,
    stream_lifetime: &CancellationToken,
    outbound: &mpsc::Sender<Result<GuestResponse, Status>>,
) {
    let mut output_rx = session.output_receiver().lock().await;
    loop {
        tokio::select! {
            _ = stream_lifetime.cancelled() => return,
            _ = session.lifetime().cancelled() => return,
            data = output_rx.recv() => {
                let Some(data) = data else { return };
                let msg = GuestResponse {
                    payload: Some(GuestResponsePayload::Output(Data { data })),
                };
                if outbound.send(Ok(msg)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn upward<S>(
    session: &Arc<Session>,
    stream_lifetime: &CancellationToken,
    inbound: &mut S,
    outbound: &mpsc::Sender<Result<GuestResponse, Status>>,
    metrics: &ServiceMetrics,
) -> &'static str
where
    S: Stream<Item = Result<GuestRequest, Status>> + Unpin,
{
    loop {
        tokio::select! {
            _ = stream_lifetime.cancelled() => return "closed",
            _ = session.lifetime().cancelled() => return "closed",
            message = inbound.next() => {
                match message {
                    Some(Ok(GuestRequest { payload: Some(GuestRequestPayload::Input(Data { data })) })) => {
                        tokio::select! {
                            _ = stream_lifetime.cancelled() => return "closed",
                            _ = session.lifetime().cancelled() => return "closed",
                            result = session.input_sender().send(data) => {
                                if result.is_err() { return "closed"; }
                            }
                        }
                    }
                    Some(Ok(GuestRequest { payload: Some(GuestRequestPayload::ChangeDimensions(cd)) })) => {
                        let dims = Dimensions::new(cd.cols, cd.rows);
                        tokio::select! {
                            _ = stream_lifetime.cancelled() => return "closed",
                            _ = session.lifetime().cancelled() => return "closed",
                            result = session.resize_sender().send(dims) => {
                                if result.is_err() { return "closed"; }
                            }
                        }
                    }
                    Some(Ok(_)) => {
                        metrics.record_error(STREAM_KIND);
                        let _ = outbound
                            .send(Err(Status::failed_precondition("unexpected message variant")))
                            .await;
                        return "error";
                    }
                    Some(Err(_)) | None => return "closed",
                }
            }
        }
    }
}
