use serde::{Deserialize, Serialize};

use super::resolver::{OwnerInfo, ResolverError};

/// Which of an owner's topics a source consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicSelector {
    /// The schedule topics (cold view)
    #[default]
    Schedules,
    /// The single history topic
    History,
}

/// Broker coordinates and topics consumed for one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub owner_id: String,
    pub bootstrap_servers: String,
    pub topics: Vec<String>,
}

impl Bucket {
    pub fn new<I, T>(owner_id: impl Into<String>, bootstrap_servers: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            owner_id: owner_id.into(),
            bootstrap_servers: bootstrap_servers.into(),
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Bucket of `owner`, failing when it carries no broker info.
    pub fn from_owner(owner: &dyn OwnerInfo, selector: TopicSelector) -> Result<Self, ResolverError> {
        let info = owner
            .broker_info()
            .ok_or_else(|| ResolverError::MissingBrokerInfo(owner.name().to_string()))?;

        let topics = match selector {
            TopicSelector::Schedules => info.topics,
            TopicSelector::History => vec![info.history_topic],
        };
        Ok(Self::new(owner.name(), info.bootstrap_servers, topics))
    }

    /// Whether consuming `other` needs a fresh consumer.
    pub fn differs_from(&self, other: &Bucket) -> bool {
        self.bootstrap_servers != other.bootstrap_servers || self.topics != other.topics
    }
}
