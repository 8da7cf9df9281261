pub mod auth;
pub mod clock;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod payload;
pub mod topic;

pub use envelope::{decode, encode, Envelope, MessageKind, PROTOCOL_VERSION};
pub use errors::{DecodeError, ProtocolRaceError, SubscribeErrorCode, TransportFailure};
pub use topic::Topic;
