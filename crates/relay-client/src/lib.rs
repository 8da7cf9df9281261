pub mod client;
pub mod reconnect;
pub mod stream;

pub use client::{ClientConfig, ClientError, ClientEvent, RelayClient, SubscribeResponse};
pub use reconnect::{BackoffConfig, ConnectionState, ReconnectionManager};
pub use stream::{CompletedMessage, StreamReconstructor};
