//! Host control stream: registration and session announcements.
//!
//! `AwaitHello -> Registered -> AnnouncingSessions -> Terminated`

use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Status, Streaming};
use tracing::{info, info_span, warn, Instrument};

use broker_core::{Registry, Terminal};
use tokio_util::sync::CancellationToken;

use crate::generated::host_control_request::Payload as ControlRequestPayload;
use crate::generated::host_control_response::Payload as ControlResponsePayload;
use crate::generated::{
    BrokerControlHello, DataChannelRequest, Dimensions as WireDimensions, HostControlRequest,
    HostControlResponse,
};
use crate::metrics::ServiceMetrics;

/// A 128-bit, URL-safe random locator. UUIDs already are a URL-safe
/// 128-bit random identifier, so the crate reuses them rather than
/// hand-rolling a base64 encoder for one call site.
fn generate_locator() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Drives one host control stream until the stream or process lifetime
/// ends. Deregisters the terminal and cancels its sessions on every exit
/// path.
const STREAM_KIND: &str = "host_control";

pub async fn run_control_channel(
    registry: Arc<Registry>,
    metrics: Arc<ServiceMetrics>,
    process_lifetime: CancellationToken,
    mut inbound: Streaming<HostControlRequest>,
    outbound: mpsc::Sender<Result<HostControlResponse, Status>>,
) {
    let start = metrics.record_stream_start();
    let stream_lifetime = process_lifetime.child_token();

    let trusted_secret = match await_hello(&mut inbound).await {
        Ok(secret) => secret,
        Err(status) => {
            metrics.record_error(STREAM_KIND);
            metrics.record_stream_end(STREAM_KIND, "error", start);
            let _ = outbound.send(Err(status)).await;
            return;
        }
    };

    let locator = generate_locator();
    let span = info_span!("host_control", locator = %locator);
    async move {
        let terminal = Arc::new(Terminal::new(&stream_lifetime, locator.clone(), trusted_secret));

        if let Err(err) = registry.register(terminal.clone()).await {
            warn!(%err, "locator collision registering terminal");
            metrics.record_error(STREAM_KIND);
            let _ = outbound.send(Err(Status::internal(err.to_string()))).await;
            metrics.record_stream_end(STREAM_KIND, "error", start);
            return;
        }

        info!("terminal registered");
        metrics.registered_terminals.inc();
        metrics.active_control_streams.inc();

        let hello = HostControlResponse {
            payload: Some(ControlResponsePayload::Hello(BrokerControlHello {
                locator: locator.clone(),
            })),
        };
        if outbound.send(Ok(hello)).await.is_ok() {
            announce_sessions(&terminal, &stream_lifetime, &mut inbound, &outbound).await;
        }

        registry.unregister(&locator).await;
        terminal.close().await;
        metrics.registered_terminals.dec();
        metrics.active_control_streams.dec();
        info!("terminal deregistered");
        metrics.record_stream_end(STREAM_KIND, "closed", start);
    }
    .instrument(span)
    .await;
}

async fn await_hello(inbound: &mut Streaming<HostControlRequest>) -> Result<String, Status> {
    match inbound.message().await {
        Ok(Some(HostControlRequest {
            payload: Some(ControlRequestPayload::Hello(hello)),
        })) => Ok(hello.trusted_secret),
        Ok(Some(_)) => Err(Status::failed_precondition("expected Hello as first message")),
        Ok(None) => Err(Status::failed_precondition("stream closed before Hello")),
        Err(status) => Err(status),
    }
}

/// Concurrently drains (and ignores) further inbound messages while
/// forwarding each newly-created session to the host as a
/// `DataChannelRequest`.
async fn announce_sessions(
    terminal: &Arc<Terminal>,
    stream_lifetime: &CancellationToken,
    inbound: &mut Streaming<HostControlRequest>,
    outbound: &mpsc::Sender<Result<HostControlResponse, Status>>,
) {
    let mut new_sessions = terminal.new_sessions_receiver().lock().await;
    loop {
        tokio::select! {
            _ = stream_lifetime.cancelled() => return,
            inbound_msg = inbound.message() => {
                match inbound_msg {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return,
                }
            }
            session = new_sessions.recv() => {
                let Some(session) = session else { return };
                let dimensions = session.requested_dimensions();
                let request = HostControlResponse {
                    payload: Some(ControlResponsePayload::DataChannelRequest(DataChannelRequest {
                        token: session.token().to_string(),
                        requested_dimensions: Some(WireDimensions {
                            cols: dimensions.cols,
                            rows: dimensions.rows,
                        }),
                    })),
                };
                if outbound.send(Ok(request)).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locators_are_unique() {
        let a = generate_locator();
        let b = generate_locator();
        assert_ne!(a, b);
    }
}
