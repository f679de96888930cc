//! Tiers: the three databases the admin read path serves
//!
//! | tier    | topics    | backend                          |
//! |---------|-----------|----------------------------------|
//! | cold    | schedules | [`SyncDb`] under `<root>/cold`    |
//! | history | history   | [`SyncDb`] under `<root>/history` |
//! | live    | schedules | [`SimpleDb`] over a live cache   |
//!
//! Each tier owns its own [`TopologySource`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use scheduler_admin_store::{Event, LiveCacheStore, MutableStore, Watchable};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::SyncConfig;
use crate::db::{Db, DbPaths, SimpleDb, SyncDb};
use crate::error::Result;
use crate::source::{ConsumerFactory, Resolver, TopicSelector, TopologySource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cold,
    History,
    Live,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Cold, Tier::History, Tier::Live];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cold => "cold",
            Tier::History => "history",
            Tier::Live => "live",
        }
    }

    pub fn selector(&self) -> TopicSelector {
        match self {
            Tier::Cold | Tier::Live => TopicSelector::Schedules,
            Tier::History => TopicSelector::History,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Backend {
    Indexed(SyncDb),
    Live {
        db: SimpleDb<LiveCacheStore>,
        mirror: Mutex<Option<JoinHandle<()>>>,
    },
}

/// One tier: its source and the database it feeds
pub struct TierDb {
    tier: Tier,
    source: TopologySource,
    backend: Backend,
}

impl TierDb {
    pub async fn open(
        tier: Tier,
        resolver: Arc<dyn Resolver>,
        factory: Arc<dyn ConsumerFactory>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let source =
            TopologySource::start(resolver, factory, tier.selector(), config.source.clone()).await?;

        let backend = match Self::open_backend(tier, &source, config) {
            Ok(backend) => backend,
            Err(err) => {
                if let Err(close_err) = source.close().await {
                    error!(tier = %tier, error = %close_err, "source close failed");
                }
                return Err(err);
            }
        };

        info!(tier = %tier, "tier opened");
        Ok(Self {
            tier,
            source,
            backend,
        })
    }

    fn open_backend(tier: Tier, source: &TopologySource, config: &SyncConfig) -> Result<Backend> {
        match tier {
            Tier::Cold | Tier::History => {
                let paths = DbPaths::new(config.tier_dir(tier.as_str()));
                Ok(Backend::Indexed(SyncDb::open(&paths, source, config)?))
            }
            Tier::Live => {
                let store = Arc::new(LiveCacheStore::unwatched(config.batch_options()));
                let events = source.watch()?;
                let mirror = tokio::spawn(mirror(Arc::clone(&store), events));
                Ok(Backend::Live {
                    db: SimpleDb::new(store, config.search),
                    mirror: Mutex::new(Some(mirror)),
                })
            }
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn db(&self) -> &dyn Db {
        match &self.backend {
            Backend::Indexed(db) => db,
            Backend::Live { db, .. } => db,
        }
    }

    pub fn source(&self) -> &TopologySource {
        &self.source
    }

    /// Close the source first, so the database drains a finished stream.
    pub async fn close(&self) -> Result<()> {
        let source = self.source.close().await;
        let backend = match &self.backend {
            Backend::Indexed(db) => db.close().await,
            Backend::Live { mirror, .. } => {
                let handle = mirror.lock().take();
                match handle {
                    Some(handle) => handle.await.map_err(Into::into),
                    None => Ok(()),
                }
            }
        };
        info!(tier = %self.tier, "tier closed");
        source.and(backend)
    }
}

/// Apply the live stream to the cache, resets included.
async fn mirror(store: Arc<LiveCacheStore>, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        let result = match event {
            Event::Upsert(record) => {
                let owner = record.owner_id.clone();
                store.add(&owner, vec![record]).await
            }
            Event::Delete(record) => {
                let owner = record.owner_id.clone();
                store.delete(&owner, vec![record]).await
            }
            Event::Reset { owner_id } => {
                store.reset(&owner_id);
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(error = %err, "live cache write failed");
        }
    }
    debug!("live mirror stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_topics() {
        assert_eq!(Tier::Cold.selector(), TopicSelector::Schedules);
        assert_eq!(Tier::History.selector(), TopicSelector::History);
        assert_eq!(Tier::Live.selector(), TopicSelector::Schedules);
        let names: Vec<String> = Tier::ALL.iter().map(|t| t.to_string()).collect();
        assert_eq!(names, vec!["cold", "history", "live"]);
    }
}
