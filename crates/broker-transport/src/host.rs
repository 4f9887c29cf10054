//! `HostService` trait glue: dispatches to the control and data stream
//! handlers in [`crate::host_control`] and [`crate::host_data`].

use std::pin::Pin;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::generated::host_service_server::HostService;
use crate::generated::{HostControlRequest, HostControlResponse, HostDataRequest, HostDataResponse};
use crate::host_control::run_control_channel;
use crate::host_data::run_data_channel;
use crate::state::BrokerState;

const CHANNEL_CAPACITY: usize = 4;

pub struct HostServiceImpl {
    state: BrokerState,
}

impl HostServiceImpl {
    pub fn new(state: BrokerState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl HostService for HostServiceImpl {
    type ControlChannelStream =
        Pin<Box<dyn Stream<Item = Result<HostControlResponse, Status>> + Send + 'static>>;

    async fn control_channel(
        &self,
        request: Request<Streaming<HostControlRequest>>,
    ) -> Result<Response<Self::ControlChannelStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(run_control_channel(
            self.state.registry.clone(),
            self.state.metrics.clone(),
            self.state.process_lifetime.clone(),
            inbound,
            tx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    type DataChannelStream =
        Pin<Box<dyn Stream<Item = Result<HostDataResponse, Status>> + Send + 'static>>;

    async fn data_channel(
        &self,
        request: Request<Streaming<HostDataRequest>>,
    ) -> Result<Response<Self::DataChannelStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(run_data_channel(
            self.state.registry.clone(),
            self.state.metrics.clone(),
            self.state.process_lifetime.child_token(),
            inbound,
            tx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
