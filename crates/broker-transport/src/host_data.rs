//! Host data stream: the per-session proxy between the broker and the
//! host's pseudo-terminal.
//!
//! `AwaitHello -> Proxying -> Terminated`

use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Status, Streaming};
use tracing::{info_span, warn, Instrument};

use broker_core::{Registry, Session};
use tokio_util::sync::CancellationToken;

use crate::generated::host_data_request::Payload as HostDataRequestPayload;
use crate::generated::host_data_response::Payload as HostDataResponsePayload;
use crate::generated::{ChangeDimensions, Data, HostDataRequest, HostDataResponse};
use crate::metrics::ServiceMetrics;
use crate::redact::hash_for_log;

const STREAM_KIND: &str = "host_data";

pub async fn run_data_channel(
    registry: Arc<Registry>,
    metrics: Arc<ServiceMetrics>,
    stream_lifetime: CancellationToken,
    mut inbound: Streaming<HostDataRequest>,
    outbound: mpsc::Sender<Result<HostDataResponse, Status>>,
) {
    let start = metrics.record_stream_start();

    let (locator, token) = match await_hello(&mut inbound).await {
        Ok(pair) => pair,
        Err(status) => {
            metrics.record_error(STREAM_KIND);
            metrics.record_stream_end(STREAM_KIND, "error", start);
            let _ = outbound.send(Err(status)).await;
            return;
        }
    };

    let span = info_span!("host_data", locator = %locator, token_hash = %hash_for_log(&token));
    async move {
        let Some(terminal) = registry.find(&locator).await else {
            metrics.record_error(STREAM_KIND);
            let _ = outbound.send(Err(Status::not_found("unknown locator"))).await;
            metrics.record_stream_end(STREAM_KIND, "error", start);
            return;
        };

        let Some(session) = terminal.find_session(&token).await else {
            metrics.record_error(STREAM_KIND);
            let _ = outbound.send(Err(Status::not_found("unknown token"))).await;
            metrics.record_stream_end(STREAM_KIND, "error", start);
            return;
        };

        metrics.active_sessions.inc();

        // Closing the data stream does not close the Session; the guest
        // stream owns that lifetime. This proxy's effective lifetime is
        // only the intersection of the data stream and session lifetimes.
        let outcome = tokio::select! {
            _ = downward(&session, &outbound, &stream_lifetime) => "closed",
            outcome = upward(&session, &mut inbound, &outbound, &stream_lifetime, &metrics) => outcome,
        };

        metrics.active_sessions.dec();
        metrics.record_stream_end(STREAM_KIND, outcome, start);
    }
    .instrument(span)
    .await;
}

async fn await_hello(inbound: &mut Streaming<HostDataRequest>) -> Result<(String, String), Status> {
    match inbound.message().await {
        Ok(Some(HostDataRequest {
            payload: Some(HostDataRequestPayload::Hello(hello)),
        })) => Ok((hello.locator, hello.token)),
        Ok(Some(_)) => Err(Status::failed_precondition("expected Hello as first message")),
        Ok(None) => Err(Status::failed_precondition("stream closed before Hello")),
        Err(status) => Err(status),
    }
}

/// Broker -> host. Forwards `session.input` as wire message `Input` and
/// `session.resize` as `ChangeDimensions`.
async fn downward(
    session: &Arc<Session>,
    outbound: &mpsc::Sender<Result<HostDataResponse, Status>>,
    stream_lifetime: &CancellationToken,
) {
    let mut input_rx = session.input_receiver().lock().await;
    let mut resize_rx = session.resize_receiver().lock().await;
    loop {
        tokio::select! {
            _ = stream_lifetime.cancelled() => return,
            _ = session.lifetime().cancelled() => return,
            data = input_rx.recv() => {
                let Some(data) = data else { return };
                let msg = HostDataResponse {
                    payload: Some(HostDataResponsePayload::Input(Data { data })),
                };
                if outbound.send(Ok(msg)).await.is_err() {
                    return;
                }
            }
            dims = resize_rx.recv() => {
                let Some(dims) = dims else { return };
                let msg = HostDataResponse {
                    payload: Some(HostDataResponsePayload::ChangeDimensions(ChangeDimensions {
                        cols: dims.cols,
                        rows: dims.rows,
                    })),
                };
                if outbound.send(Ok(msg)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Host -> broker. Only `Output` is a legal message here; anything else is
/// a protocol error. Returns the outcome label recorded against
/// `stream_duration_seconds`/`streams_total`.
async fn upward(
    session: &Arc<Session>,
    inbound: &mut Streaming<HostDataRequest>,
    outbound: &mpsc::Sender<Result<HostDataResponse, Status>>,
    stream_lifetime: &CancellationToken,
    metrics: &ServiceMetrics,
) -> &'static str {
    loop {
        tokio::select! {
            _ = stream_lifetime.cancelled() => return "closed",
            _ = session.lifetime().cancelled() => return "closed",
            message = inbound.message() => {
                match message {
                    Ok(Some(HostDataRequest { payload: Some(HostDataRequestPayload::Output(Data { data })) })) => {
                        tokio::select! {
                            _ = stream_lifetime.cancelled() => return "closed",
                            _ = session.lifetime().cancelled() => return "closed",
                            result = session.output_sender().send(data) => {
                                if result.is_err() {
                                    return "closed";
                                }
                            }
                        }
                    }
                    Ok(Some(_)) => {
                        warn!("unexpected message variant on host data stream");
                        metrics.record_error(STREAM_KIND);
                        let _ = outbound
                            .send(Err(Status::failed_precondition("unexpected message variant")))
                            .await;
                        return "error";
                    }
                    Ok(None) | Err(_) => return "closed",
                }
            }
        }
    }
}
