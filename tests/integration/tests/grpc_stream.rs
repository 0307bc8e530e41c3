use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::server::{NamedService, StreamingService};
use tonic::transport::Server;
use xds_audit::InMemoryAuditLog;
use xds_runner::{Connector, Conversation, ConversationConfig, GrpcConnector, KindRegistry};
use xds_types::{type_url, wire, ConversationState, DiscoveryRequest, Variant};

type ListenerStream = BoxStream<'static, Result<wire::DiscoveryResponse, tonic::Status>>;

/// Listener discovery server that sends its response headers together with
/// the first response, which it only produces once the first request has
/// arrived.
#[derive(Debug, Clone, Default)]
struct HeadersAfterFirstRequest;

impl NamedService for HeadersAfterFirstRequest {
    const NAME: &'static str = "envoy.service.listener.v3.ListenerDiscoveryService";
}

struct StreamListeners;

impl StreamingService<wire::DiscoveryRequest> for StreamListeners {
    type Response = wire::DiscoveryResponse;
    type ResponseStream = ListenerStream;
    type Future = BoxFuture<tonic::Response<ListenerStream>, tonic::Status>;

    fn call(
        &mut self,
        request: tonic::Request<tonic::Streaming<wire::DiscoveryRequest>>,
    ) -> Self::Future {
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let first = inbound
                .message()
                .await?
                .ok_or_else(|| tonic::Status::cancelled("stream closed before the first request"))?;
            let response = wire::DiscoveryResponse {
                version_info: "1".to_string(),
                type_url: first.type_url,
                nonce: "1".to_string(),
                ..wire::DiscoveryResponse::default()
            };
            // read acknowledgements until the client half-closes
            let acks = stream::unfold(inbound, |mut inbound| async move {
                match inbound.message().await {
                    Ok(Some(_)) => Some(((), inbound)),
                    _ => None,
                }
            })
            .filter_map(|()| async { None::<Result<wire::DiscoveryResponse, tonic::Status>> });
            let responses: ListenerStream = stream::once(async { Ok(response) }).chain(acks).boxed();
            Ok(tonic::Response::new(responses))
        })
    }
}

impl<B> Service<http::Request<B>> for HeadersAfterFirstRequest
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        Box::pin(async move {
            let codec = ProstCodec::<wire::DiscoveryResponse, wire::DiscoveryRequest>::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.streaming(StreamListeners, request).await)
        })
    }
}

async fn serve_listeners() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local address");
    tokio::spawn(
        Server::builder()
            .add_service(HeadersAfterFirstRequest)
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    format!(":{}", address.port())
}

#[tokio::test]
async fn first_request_reaches_a_target_that_withholds_headers() {
    let address = serve_listeners().await;
    let transport = GrpcConnector
        .connect_target(&address, Duration::from_secs(2))
        .await
        .expect("connect");
    let registry = Arc::new(KindRegistry::standard());
    let route = registry
        .route("LDS", Variant::SotwNonAggregated, Duration::from_secs(5))
        .expect("route");

    let mut conversation = tokio::time::timeout(
        Duration::from_secs(5),
        Conversation::start(
            ConversationConfig {
                id: "grpc-1".to_string(),
                node_id: "test-id".to_string(),
                route,
                drain_timeout: Duration::from_secs(1),
            },
            registry,
            Arc::new(InMemoryAuditLog::new()),
            transport,
            DiscoveryRequest::subscribe("test-id", type_url::LISTENER, Vec::new()),
        ),
    )
    .await
    .expect("stream opens once the first request is delivered")
    .expect("start");
    assert_eq!(conversation.state(), ConversationState::Streaming);

    let mut requests = Vec::new();
    for _ in 0..200 {
        requests = conversation.cache().await.requests;
        if requests.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(requests.len(), 2, "{requests:?}");
    assert_eq!(requests[1].version_info, "1");
    assert_eq!(requests[1].response_nonce, "1");
    assert_eq!(conversation.cache().await.responses.len(), 1);

    conversation.terminate().await.expect("terminate");
    assert_eq!(conversation.state(), ConversationState::Closed);
}
