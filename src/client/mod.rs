pub mod connector;
pub mod manager;

pub use connector::{Connector, Transport, TungsteniteConnector};
pub use manager::{
    Backoff, ClientConfig, ClientEvent, ConnectionHandle, ConnectionManager, ConnectionStatus,
    SubscriptionId,
};
