//! Version store interface and in-process implementation

use crate::error::StoreError;
use async_trait::async_trait;
use autonomic_model::{AgentConfig, AgentId};
use dashmap::DashMap;
use tracing::info;

/// Ordered history of agent configurations
///
/// Appends are optimistic: `expected_prev` must equal the latest version or
/// the append fails with [`StoreError::Conflict`] and nothing is written.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Latest configuration of an agent
    async fn get_latest(&self, agent_id: &AgentId) -> Result<AgentConfig, StoreError>;

    /// A specific version of an agent's configuration
    async fn get_by_version(
        &self,
        agent_id: &AgentId,
        version: u64,
    ) -> Result<AgentConfig, StoreError>;

    /// Append `config` as version `expected_prev + 1`, returning the new version
    async fn append(
        &self,
        agent_id: &AgentId,
        config: AgentConfig,
        expected_prev: u64,
    ) -> Result<u64, StoreError>;

    /// Every version, oldest first
    async fn history(&self, agent_id: &AgentId) -> Result<Vec<AgentConfig>, StoreError>;
}

/// Version store kept in memory
///
/// Each agent's history lives in one map entry; appends run under that
/// entry's lock so concurrent commits for one agent serialize.
#[derive(Debug, Default)]
pub struct InMemoryVersionStore {
    histories: DashMap<AgentId, Vec<AgentConfig>>,
}

impl InMemoryVersionStore {
    /// Create new empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the initial configuration of an agent, replacing any history
    pub fn seed(&self, config: AgentConfig) {
        info!(agent_id = %config.agent_id, version = config.version, "seeded agent configuration");
        self.histories.insert(config.agent_id.clone(), vec![config]);
    }

    /// Number of agents with a history
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.histories.len()
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn get_latest(&self, agent_id: &AgentId) -> Result<AgentConfig, StoreError> {
        self.histories
            .get(agent_id)
            .and_then(|h| h.last().cloned())
            .ok_or_else(|| StoreError::NotFound(agent_id.clone()))
    }

    async fn get_by_version(
        &self,
        agent_id: &AgentId,
        version: u64,
    ) -> Result<AgentConfig, StoreError> {
        let history = self
            .histories
            .get(agent_id)
            .ok_or_else(|| StoreError::NotFound(agent_id.clone()))?;
        history
            .iter()
            .find(|c| c.version == version)
            .cloned()
            .ok_or_else(|| StoreError::VersionNotFound {
                agent_id: agent_id.clone(),
                version,
            })
    }

    async fn append(
        &self,
        agent_id: &AgentId,
        mut config: AgentConfig,
        expected_prev: u64,
    ) -> Result<u64, StoreError> {
        if &config.agent_id != agent_id {
            return Err(StoreError::AgentMismatch {
                expected: agent_id.clone(),
                actual: config.agent_id,
            });
        }
        let mut history = self
            .histories
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(agent_id.clone()))?;
        let latest = history.last().map_or(0, |c| c.version);
        if latest != expected_prev {
            return Err(StoreError::Conflict {
                agent_id: agent_id.clone(),
                expected: expected_prev,
                actual: latest,
            });
        }
        let version = latest + 1;
        config.version = version;
        history.push(config);
        info!(agent_id = %agent_id, version, "appended agent configuration");
        Ok(version)
    }

    async fn history(&self, agent_id: &AgentId) -> Result<Vec<AgentConfig>, StoreError> {
        self.histories
            .get(agent_id)
            .map(|h| h.clone())
            .ok_or_else(|| StoreError::NotFound(agent_id.clone()))
    }
}
