//! Client for the companion adapter that programs and resets the state of
//! the system under test.

use async_trait::async_trait;
use thiserror::Error;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use xds_types::{wire, Snapshot};

const SET_STATE_METHOD: &str = "/adapter.Adapter/SetState";
const UPDATE_STATE_METHOD: &str = "/adapter.Adapter/UpdateState";
const CLEAR_STATE_METHOD: &str = "/adapter.Adapter/ClearState";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("adapter {operation} failed with {code}: {message}")]
    Rpc {
        operation: &'static str,
        code: String,
        message: String,
    },
    #[error("adapter is not ready: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CompanionAdapter: Send + Sync {
    async fn set_state(&self, snapshot: &Snapshot) -> Result<String, AdapterError>;
    async fn update_state(&self, snapshot: &Snapshot) -> Result<String, AdapterError>;
    async fn clear_state(&self, node_id: &str) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct GrpcAdapterClient {
    channel: Channel,
}

impl GrpcAdapterClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    async fn call<M1, M2>(
        &self,
        operation: &'static str,
        method: &'static str,
        message: M1,
    ) -> Result<M2, AdapterError>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|error| AdapterError::Unavailable(error.to_string()))?;
        let response = grpc
            .unary(
                tonic::Request::new(message),
                PathAndQuery::from_static(method),
                ProstCodec::<M1, M2>::default(),
            )
            .await
            .map_err(|status| AdapterError::Rpc {
                operation,
                code: format!("{:?}", status.code()),
                message: status.message().to_string(),
            })?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl CompanionAdapter for GrpcAdapterClient {
    async fn set_state(&self, snapshot: &Snapshot) -> Result<String, AdapterError> {
        let reply: wire::SetStateResponse = self
            .call("SetState", SET_STATE_METHOD, wire::Snapshot::from(snapshot))
            .await?;
        Ok(reply.message)
    }

    async fn update_state(&self, snapshot: &Snapshot) -> Result<String, AdapterError> {
        let reply: wire::UpdateStateResponse = self
            .call("UpdateState", UPDATE_STATE_METHOD, wire::Snapshot::from(snapshot))
            .await?;
        Ok(reply.message)
    }

    async fn clear_state(&self, node_id: &str) -> Result<String, AdapterError> {
        let reply: wire::ClearResponse = self
            .call(
                "ClearState",
                CLEAR_STATE_METHOD,
                wire::ClearRequest {
                    node: node_id.to_string(),
                },
            )
            .await?;
        Ok(reply.response)
    }
}
