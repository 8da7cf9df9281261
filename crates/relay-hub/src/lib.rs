pub mod handlers;
pub mod router;
pub mod server;
pub mod session;

pub use router::{BroadcastStats, SubscribeOutcome, TopicRouter};
pub use server::{start, HubConfig, HubHandle};
pub use session::SessionHandle;
