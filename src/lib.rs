//! Public API for the `livewire` realtime client library.
//!
//! This crate provides the realtime connection subsystem of a pub/sub
//! messaging client: a persistent, authenticated, full-duplex session with
//! the messaging endpoint, delivering outbound protocol frames and routing
//! inbound ones to subscribers, with resume/recover, heartbeats, host
//! failover and acknowledgement tracking.

pub mod auth;
pub mod bus;
pub mod codec;
pub mod connection;
mod endpoint;
pub mod error;
pub mod options;
pub mod protocol;
pub mod transport;

pub use auth::{AuthParams, AuthProvider};
pub use bus::SubscriptionToken;
pub use codec::WireFormat;
pub use connection::{Connection, ConnectionInfo, ConnectionState, Delivery, StateChange};
pub use error::{Error, Result};
pub use options::{Auth, ClientOptions, ClientOptionsBuilder};
pub use protocol::{Action, ErrorInfo, PayloadMessage, ProtocolMessage};
pub use transport::{ConnectRequest, Connector, Transport};
