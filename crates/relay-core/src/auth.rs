use async_trait::async_trait;

use crate::envelope::MessageKind;
use crate::errors::SubscribeErrorCode;
use crate::ids::UserId;
use crate::topic::Topic;

/// Authenticated caller identity. Established once when a connection opens
/// and immutable for the session's lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// Per-topic authorization policy. An external collaborator: the hub asks it
/// once per requested topic on subscribe and per message for the kinds that
/// need publish checks (`agent_event`, `run_update`).
#[async_trait]
pub trait TopicAuthorizer: Send + Sync {
    /// May `identity` receive broadcasts for `topic`?
    async fn authorize(&self, identity: &Identity, topic: &Topic)
        -> Result<(), SubscribeErrorCode>;

    /// May `identity` publish `kind` to `topic`? Defaults to the subscribe
    /// policy; override where publishing is stricter than listening.
    async fn authorize_publish(
        &self,
        identity: &Identity,
        _kind: &MessageKind,
        topic: &Topic,
    ) -> Result<(), SubscribeErrorCode> {
        self.authorize(identity, topic).await
    }
}

/// Maps a connection-open credential to an [`Identity`]. External
/// collaborator; token minting and verification live elsewhere.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Permits everything. For tests and for deployments that enforce policy in
/// front of the hub.
pub struct AllowAll;

#[async_trait]
impl TopicAuthorizer for AllowAll {
    async fn authorize(
        &self,
        _identity: &Identity,
        _topic: &Topic,
    ) -> Result<(), SubscribeErrorCode> {
        Ok(())
    }
}

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, token: &str) -> Option<Identity> {
        Some(Identity::new(UserId::from_raw(token), token))
    }
}
