//! End-to-end tests that spin up the broker in-process and drive it with
//! generated tonic clients. A lightweight task stands in for a real
//! PTY-driving host, echoing bytes back so the round trip can be asserted
//! without a real shell.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;

use broker_transport::generated::guest_request::Payload as GuestRequestPayload;
use broker_transport::generated::guest_service_client::GuestServiceClient;
use broker_transport::generated::host_control_request::Payload as HostControlRequestPayload;
use broker_transport::generated::host_control_response::Payload as HostControlResponsePayload;
use broker_transport::generated::host_data_request::Payload as HostDataRequestPayload;
use broker_transport::generated::host_data_response::Payload as HostDataResponsePayload;
use broker_transport::generated::host_service_client::HostServiceClient;
use broker_transport::generated::{
    ChangeDimensions, Data, Dimensions, GuestHello, GuestRequest, HostControlHello,
    HostControlRequest, HostDataHello, HostDataRequest,
};
use broker_transport::mux;
use broker_transport::server::GrpcServer;

async fn spawn_broker() -> (String, CancellationToken) {
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let lifetime = CancellationToken::new();
    let server = GrpcServer::new(lifetime.clone(), mux::deny_all(), None).unwrap();

    tokio::spawn(async move {
        // Reconstruct the server's router manually against the already
        // bound listener, mirroring GrpcServer::serve's non-TLS path.
        let router = axum::Router::new().merge(mux::build_router(
            broker_transport::BrokerState::new(server.registry(), server.metrics(), lifetime.clone()),
            mux::deny_all(),
        ));
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { lifetime.cancelled().await })
            .await
            .unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("http://{}", local_addr), CancellationToken::new())
}

/// A fake host: registers a terminal, then for every announced session
/// echoes guest input straight back as host output.
async fn run_fake_host(
    server_url: String,
    trusted_secret: &'static str,
) -> (String, tokio::task::JoinHandle<()>) {
    let mut control_client = HostServiceClient::connect(server_url.clone()).await.unwrap();

    let (control_tx, control_rx) = mpsc::channel(4);
    control_tx
        .send(HostControlRequest {
            payload: Some(HostControlRequestPayload::Hello(HostControlHello {
                trusted_secret: trusted_secret.to_string(),
            })),
        })
        .await
        .unwrap();

    let mut control_stream = control_client
        .control_channel(Request::new(ReceiverStream::new(control_rx)))
        .await
        .unwrap()
        .into_inner();

    let locator = match control_stream.message().await.unwrap().unwrap().payload {
        Some(HostControlResponsePayload::Hello(hello)) => hello.locator,
        other => panic!("expected Hello, got {other:?}"),
    };

    let handle = tokio::spawn({
        let server_url = server_url.clone();
        let locator = locator.clone();
        async move {
            while let Ok(Some(announcement)) = control_stream.message().await {
                let token = match announcement.payload {
                    Some(HostControlResponsePayload::DataChannelRequest(req)) => req.token,
                    _ => continue,
                };

                let mut data_client = HostServiceClient::connect(server_url.clone()).await.unwrap();
                let (data_tx, data_rx) = mpsc::channel(4);
                data_tx
                    .send(HostDataRequest {
                        payload: Some(HostDataRequestPayload::Hello(HostDataHello {
                            locator: locator.clone(),
                            token,
                        })),
                    })
                    .await
                    .unwrap();

                let mut data_stream = data_client
                    .data_channel(Request::new(ReceiverStream::new(data_rx)))
                    .await
                    .unwrap()
                    .into_inner();

                let data_tx = data_tx.clone();
                tokio::spawn(async move {
                    while let Ok(Some(msg)) = data_stream.message().await {
                        match msg.payload {
                            Some(HostDataResponsePayload::Input(Data { data })) => {
                                let _ = data_tx
                                    .send(HostDataRequest {
                                        payload: Some(HostDataRequestPayload::Output(Data { data })),
                                    })
                                    .await;
                            }
                            Some(HostDataResponsePayload::ChangeDimensions(_)) => {}
                            None => {}
                        }
                    }
                });
            }
        }
    });

    (locator, handle)
}

#[tokio::test]
async fn guest_input_is_echoed_back_through_the_fake_host() {
    let (server_url, _process_lifetime) = spawn_broker().await;
    let (locator, _host_task) = run_fake_host(server_url.clone(), "s3cret").await;

    let mut guest_client = GuestServiceClient::connect(server_url).await.unwrap();
    let (guest_tx, guest_rx) = mpsc::channel(4);

    guest_tx
        .send(GuestRequest {
            payload: Some(GuestRequestPayload::Hello(GuestHello {
                locator,
                secret: "s3cret".to_string(),
                requested_dimensions: Some(Dimensions { cols: 80, rows: 24 }),
            })),
        })
        .await
        .unwrap();

    let mut guest_stream = guest_client
        .terminal_channel(Request::new(ReceiverStream::new(guest_rx)))
        .await
        .unwrap()
        .into_inner();

    guest_tx
        .send(GuestRequest {
            payload: Some(GuestRequestPayload::Input(Data {
                data: b"echo hi".to_vec(),
            })),
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), guest_stream.message())
        .await
        .expect("timed out waiting for echoed output")
        .unwrap()
        .unwrap();

    match response.payload {
        Some(broker_transport::generated::guest_response::Payload::Output(Data { data })) => {
            assert_eq!(data, b"echo hi");
        }
        other => panic!("expected Output, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_secret_is_rejected_with_permission_denied() {
    let (server_url, _process_lifetime) = spawn_broker().await;
    let (locator, _host_task) = run_fake_host(server_url.clone(), "s3cret").await;

    let mut guest_client = GuestServiceClient::connect(server_url).await.unwrap();
    let (guest_tx, guest_rx) = mpsc::channel(4);

    guest_tx
        .send(GuestRequest {
            payload: Some(GuestRequestPayload::Hello(GuestHello {
                locator,
                secret: "wrong".to_string(),
                requested_dimensions: Some(Dimensions { cols: 80, rows: 24 }),
            })),
        })
        .await
        .unwrap();

    let mut guest_stream = guest_client
        .terminal_channel(Request::new(ReceiverStream::new(guest_rx)))
        .await
        .unwrap()
        .into_inner();

    let err = guest_stream.message().await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::PermissionDenied);
}

#[tokio::test]
async fn unknown_locator_is_rejected_with_not_found() {
    let (server_url, _process_lifetime) = spawn_broker().await;

    let mut guest_client = GuestServiceClient::connect(server_url).await.unwrap();
    let (guest_tx, guest_rx) = mpsc::channel(4);

    guest_tx
        .send(GuestRequest {
            payload: Some(GuestRequestPayload::Hello(GuestHello {
                locator: "does-not-exist".to_string(),
                secret: "whatever".to_string(),
                requested_dimensions: Some(Dimensions { cols: 80, rows: 24 }),
            })),
        })
        .await
        .unwrap();

    let mut guest_stream = guest_client
        .terminal_channel(Request::new(ReceiverStream::new(guest_rx)))
        .await
        .unwrap()
        .into_inner();

    let err = guest_stream.message().await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[allow(unused)]
fn assert_unused_change_dimensions_type_is_wired(_: ChangeDimensions) {}
#[allow(unused)]
fn assert_unused_arc_import(_: Arc<()>) {}
