//! Bidirectional discovery streams.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use xds_types::{wire, DiscoveryRequest, DiscoveryResponse, ProtocolMode};

use crate::binding::StreamRoute;

pub type ResponseStream = BoxStream<'static, Result<DiscoveryResponse, StreamError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("cannot open stream {method}: {detail}")]
    Open { method: String, detail: String },
    #[error("stream failed with {code}: {message}")]
    Status { code: String, message: String },
    #[error("stream deadline of {0:?} elapsed")]
    DeadlineElapsed(Duration),
    #[error("stream no longer accepts requests")]
    SendClosed,
}

impl From<tonic::Status> for StreamError {
    fn from(status: tonic::Status) -> Self {
        Self::Status {
            code: format!("{:?}", status.code()),
            message: status.message().to_string(),
        }
    }
}

/// Opens a discovery stream. Requests are read from `requests` until the
/// sender is dropped, which half-closes the stream.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    async fn open_stream(
        &self,
        route: &StreamRoute,
        requests: mpsc::Receiver<DiscoveryRequest>,
    ) -> Result<ResponseStream, StreamError>;
}

/// tonic client for the discovery services.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    channel: Channel,
}

impl GrpcTransport {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl DiscoveryTransport for GrpcTransport {
    async fn open_stream(
        &self,
        route: &StreamRoute,
        requests: mpsc::Receiver<DiscoveryRequest>,
    ) -> Result<ResponseStream, StreamError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|error| StreamError::Open {
            method: route.method.to_string(),
            detail: error.to_string(),
        })?;
        let path = PathAndQuery::from_static(route.method);
        tracing::debug!(method = route.method, mode = ?route.mode, "opening discovery stream");

        match route.mode {
            ProtocolMode::StateOfTheWorld => {
                let outbound = ReceiverStream::new(requests)
                    .map(|request| wire::DiscoveryRequest::from(&request));
                let codec =
                    ProstCodec::<wire::DiscoveryRequest, wire::DiscoveryResponse>::default();
                let response = grpc
                    .streaming(tonic::Request::new(outbound), path, codec)
                    .await?;
                Ok(response
                    .into_inner()
                    .map(|item| item.map(DiscoveryResponse::from).map_err(StreamError::from))
                    .boxed())
            }
            ProtocolMode::Incremental => {
                let outbound = ReceiverStream::new(requests)
                    .map(|request| wire::DeltaDiscoveryRequest::from(&request));
                let codec = ProstCodec::<
                    wire::DeltaDiscoveryRequest,
                    wire::DeltaDiscoveryResponse,
                >::default();
                let response = grpc
                    .streaming(tonic::Request::new(outbound), path, codec)
                    .await?;
                Ok(response
                    .into_inner()
                    .map(|item| item.map(DiscoveryResponse::from).map_err(StreamError::from))
                    .boxed())
            }
        }
    }
}
