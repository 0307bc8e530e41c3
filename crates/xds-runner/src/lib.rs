//! Conversation engine, service bindings and sessions that drive a
//! discovery server through scripted protocol exchanges.

mod ack;
mod adapter;
mod binding;
mod connector;
mod conversation;
mod memory;
mod session;
mod transport;

pub use ack::{build_nack, build_pass_through_ack, AckBuilder, ParseError, NACK_STATUS_CODE};
pub use adapter::{AdapterError, CompanionAdapter, GrpcAdapterClient};
pub use binding::{
    BindingError, IdentityField, KindRegistry, ResourceKind, StreamRoute, ADS_DELTA_METHOD,
    ADS_SOTW_METHOD,
};
pub use connector::{ConnectionError, ConnectionRole, Connector, GrpcConnector};
pub use conversation::{
    audit_payload, Conversation, ConversationConfig, ConversationError, SessionCache,
};
pub use memory::{AdapterCall, InMemoryConnector, InMemoryControlPlane};
pub use session::{Session, SessionConfig, SessionError};
pub use transport::{DiscoveryTransport, GrpcTransport, ResponseStream, StreamError};
