//! Owner discovery
//!
//! A [`Resolver`] lists the scheduler instances currently known. The
//! topology-aware source also needs each owner's broker coordinates, exposed
//! through [`OwnerInfo::broker_info`]; owners without them are rejected.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCategory;

/// Broker coordinates of one owner
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub bootstrap_servers: String,
    /// Schedule topics
    pub topics: Vec<String>,
    pub history_topic: String,
}

/// One discovered owner
pub trait OwnerInfo: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Broker coordinates, when the resolver knows them.
    fn broker_info(&self) -> Option<BrokerInfo> {
        None
    }
}

pub type Owners = Vec<Arc<dyn OwnerInfo>>;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("no resolver hosts configured")]
    NoHosts,

    #[error("no owner could be resolved")]
    NoResults,

    /// Some owners resolved, others did not; `resolved` is usable
    #[error("partial resolution, failed: {}", .failed.join(", "))]
    Partial { resolved: Owners, failed: Vec<String> },

    #[error("owner {0} has no broker info")]
    MissingBrokerInfo(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ResolverError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ResolverError::NoHosts
            | ResolverError::NoResults
            | ResolverError::Partial { .. }
            | ResolverError::Other(_) => ErrorCategory::Transient,
            ResolverError::MissingBrokerInfo(_) => ErrorCategory::Permanent,
        }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn list(&self) -> Result<Owners, ResolverError>;
}

/// Owner known by name only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedOwner(pub String);

impl OwnerInfo for NamedOwner {
    fn name(&self) -> &str {
        &self.0
    }
}

/// Owner with its broker coordinates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerInfo {
    pub name: String,
    pub bootstrap_servers: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub history_topic: String,
}

impl SchedulerInfo {
    pub fn new(name: impl Into<String>, bootstrap_servers: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    pub fn with_topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_history_topic(mut self, topic: impl Into<String>) -> Self {
        self.history_topic = topic.into();
        self
    }
}

impl OwnerInfo for SchedulerInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn broker_info(&self) -> Option<BrokerInfo> {
        Some(BrokerInfo {
            bootstrap_servers: self.bootstrap_servers.clone(),
            topics: self.topics.clone(),
            history_topic: self.history_topic.clone(),
        })
    }
}

/// In-memory resolver over a mutable owner list
#[derive(Debug, Default)]
pub struct StaticResolver {
    owners: RwLock<Owners>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owners(owners: impl IntoIterator<Item = Arc<dyn OwnerInfo>>) -> Self {
        Self {
            owners: RwLock::new(owners.into_iter().collect()),
        }
    }

    pub fn add(&self, owner: impl OwnerInfo + 'static) {
        self.owners.write().push(Arc::new(owner));
    }

    /// Replace the owner with the same name, or add it.
    pub fn set(&self, owner: impl OwnerInfo + 'static) {
        let mut owners = self.owners.write();
        let owner: Arc<dyn OwnerInfo> = Arc::new(owner);
        match owners.iter().position(|o| o.name() == owner.name()) {
            Some(at) => owners[at] = owner,
            None => owners.push(owner),
        }
    }

    pub fn remove(&self, name: &str) {
        self.owners.write().retain(|o| o.name() != name);
    }

    pub fn reset(&self) {
        self.owners.write().clear();
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn list(&self) -> Result<Owners, ResolverError> {
        Ok(self.owners.read().clone())
    }
}
