use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::{AgentId, ExecutionId, ThreadId, UserId};

/// A routing address identifying one broadcast channel.
///
/// Wire form: `system`, `thread:{id}`, `agent:{id}`, `user:{id}`,
/// `workflow_execution:{id}`. A topic is a routing key only; it carries
/// no payload.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Topic {
    System,
    Thread(ThreadId),
    Agent(AgentId),
    User(UserId),
    WorkflowExecution(ExecutionId),
}

impl Topic {
    pub fn thread(id: impl Into<String>) -> Self {
        Self::Thread(ThreadId::from_raw(id))
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::Agent(AgentId::from_raw(id))
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::User(UserId::from_raw(id))
    }

    pub fn workflow_execution(id: impl Into<String>) -> Self {
        Self::WorkflowExecution(ExecutionId::from_raw(id))
    }

    /// The address scheme without the id part.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Thread(_) => "thread",
            Self::Agent(_) => "agent",
            Self::User(_) => "user",
            Self::WorkflowExecution(_) => "workflow_execution",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Thread(id) => write!(f, "thread:{id}"),
            Self::Agent(id) => write!(f, "agent:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::WorkflowExecution(id) => write!(f, "workflow_execution:{id}"),
        }
    }
}

/// Failure to parse a topic address string.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicParseError {
    #[error("unknown topic scheme: {0}")]
    UnknownScheme(String),
    #[error("topic {0} is missing an id")]
    MissingId(&'static str),
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "system" {
            return Ok(Self::System);
        }
        let (scheme, id) = match s.split_once(':') {
            Some(parts) => parts,
            None => return Err(TopicParseError::UnknownScheme(s.to_string())),
        };
        match scheme {
            "thread" if id.is_empty() => Err(TopicParseError::MissingId("thread")),
            "agent" if id.is_empty() => Err(TopicParseError::MissingId("agent")),
            "user" if id.is_empty() => Err(TopicParseError::MissingId("user")),
            "workflow_execution" if id.is_empty() => {
                Err(TopicParseError::MissingId("workflow_execution"))
            }
            "thread" => Ok(Self::thread(id)),
            "agent" => Ok(Self::agent(id)),
            "user" => Ok(Self::user(id)),
            "workflow_execution" => Ok(Self::workflow_execution(id)),
            other => Err(TopicParseError::UnknownScheme(other.to_string())),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
