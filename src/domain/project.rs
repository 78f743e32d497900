//! Project entity: channel ↔ filesystem ↔ preferred-agent binding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::primitives::{AgentId, ChannelId, ProjectId};

/// Which agent a project's tasks are dispatched to.
///
/// `auto` is a dispatch sentinel, not an agent id: it floats to any online
/// agent. A pinned selector always prefers its agent — even while offline —
/// because that agent's local filesystem holds the project checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentSelector {
    Auto,
    Pinned(AgentId),
}

impl AgentSelector {
    /// Parses the stored representation (`auto` or an agent id).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Some(Self::Auto)
        } else {
            AgentId::try_new(s.to_string()).ok().map(Self::Pinned)
        }
    }

    /// Stored/text representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Auto => "auto",
            Self::Pinned(agent) => agent.as_str(),
        }
    }

    /// The pinned agent, if any.
    #[must_use]
    pub fn pinned(&self) -> Option<&AgentId> {
        match self {
            Self::Auto => None,
            Self::Pinned(agent) => Some(agent),
        }
    }
}

/// A configured project: one chat channel mapped to one workspace path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Unique per project; the channel is the routing key for chat events.
    pub channel_id: ChannelId,
    pub agent: AgentSelector,
    /// Absolute path of the project checkout on the agent host.
    pub local_path: String,
    pub default_model: String,
    pub default_max_budget: Option<f64>,
    /// Identifier of the project on the deployment platform, when wired.
    pub deploy_platform_id: Option<String>,
    pub auto_commit_push: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parses_sentinel_case_insensitively() {
        assert_eq!(AgentSelector::parse("auto"), Some(AgentSelector::Auto));
        assert_eq!(AgentSelector::parse(" AUTO "), Some(AgentSelector::Auto));
    }

    #[test]
    fn selector_parses_agent_ids() {
        let sel = AgentSelector::parse("worker-1").unwrap();
        assert_eq!(sel.pinned().unwrap().as_str(), "worker-1");
        assert_eq!(sel.as_str(), "worker-1");
    }
}
