//! Upstream scheduler API client.
//!
//! Provides the three calls the reconciler needs against the scheduler's
//! agents API:
//! - Listing every known agent
//! - Disabling a batch of agents
//! - Deleting a batch of agents
//!
//! Batch calls with an empty batch return immediately without touching the
//! network.

use async_trait::async_trait;
use podpool_id::{AgentUuid, InstanceId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::error::SchedulerError;

const AGENTS_MEDIA_TYPE: &str = "application/vnd.go.cd.v7+json";

/// Agent status as known to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Building,
    Idle,
    LostContact,
    Disabled,
}

/// A scheduler-side agent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    /// The scheduler's identifier, used by disable/delete.
    pub uuid: AgentUuid,

    /// The pod backing this agent. `None` for agents this controller does
    /// not manage.
    pub instance_id: Option<InstanceId>,

    pub status: AgentStatus,
}

/// Scheduler control API.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, SchedulerError>;

    /// Disable a batch of agents. No-op on an empty batch.
    async fn disable_agents(&self, agents: &[AgentRecord]) -> Result<(), SchedulerError>;

    /// Delete a batch of agents. No-op on an empty batch.
    async fn delete_agents(&self, agents: &[AgentRecord]) -> Result<(), SchedulerError>;
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct AgentsResponse {
    #[serde(rename = "_embedded", default)]
    embedded: AgentsEmbedded,
}

#[derive(Debug, Default, Deserialize)]
struct AgentsEmbedded {
    #[serde(default)]
    agents: Vec<AgentPayload>,
}

#[derive(Debug, Deserialize)]
struct AgentPayload {
    uuid: String,
    #[serde(default)]
    elastic_agent_id: Option<String>,
    #[serde(default)]
    elastic_plugin_id: Option<String>,
    #[serde(default)]
    agent_config_state: Option<String>,
    #[serde(default)]
    agent_state: Option<String>,
    #[serde(default)]
    build_state: Option<String>,
}

impl AgentPayload {
    fn status(&self) -> AgentStatus {
        if self.agent_config_state.as_deref() == Some("Disabled") {
            return AgentStatus::Disabled;
        }
        match (self.agent_state.as_deref(), self.build_state.as_deref()) {
            (Some("LostContact") | Some("Missing"), _) => AgentStatus::LostContact,
            (Some("Building"), _) | (_, Some("Building")) => AgentStatus::Building,
            _ => AgentStatus::Idle,
        }
    }

    fn into_record(self, plugin_id: &str) -> Option<AgentRecord> {
        let uuid = match self.uuid.parse::<AgentUuid>() {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!(uuid = %self.uuid, error = %e, "Skipping agent with invalid uuid");
                return None;
            }
        };
        let status = self.status();
        let instance_id = match (&self.elastic_plugin_id, &self.elastic_agent_id) {
            (Some(plugin), Some(elastic_id)) if plugin == plugin_id => elastic_id.parse().ok(),
            _ => None,
        };
        Some(AgentRecord {
            uuid,
            instance_id,
            status,
        })
    }
}

fn uuids(agents: &[AgentRecord]) -> Vec<&str> {
    agents.iter().map(|a| a.uuid.as_str()).collect()
}

// =============================================================================
// HTTP client
// =============================================================================

/// Scheduler client over the agents REST API.
pub struct HttpSchedulerClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    plugin_id: String,
}

impl HttpSchedulerClient {
    /// Create a new scheduler client.
    pub fn new(settings: &Settings) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| SchedulerError::Transport {
                operation: "configure",
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: settings.server_url.trim_end_matches('/').to_string(),
            token: settings.server_token.clone(),
            plugin_id: settings.agent_plugin_id.clone(),
        })
    }

    fn agents_url(&self) -> String {
        format!("{}/api/agents", self.base_url)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SchedulerError> {
        let mut request = request.header(reqwest::header::ACCEPT, AGENTS_MEDIA_TYPE);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchedulerError::Transport {
                operation,
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(operation, status = %status, body = %body, "Scheduler request failed");
            return Err(SchedulerError::UpstreamUnavailable {
                operation,
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl SchedulerApi for HttpSchedulerClient {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, SchedulerError> {
        let response = self
            .send("list_agents", self.client.get(self.agents_url()))
            .await?;

        let payload: AgentsResponse =
            response.json().await.map_err(|e| SchedulerError::Decode {
                operation: "list_agents",
                message: e.to_string(),
            })?;

        let agents: Vec<_> = payload
            .embedded
            .agents
            .into_iter()
            .filter_map(|a| a.into_record(&self.plugin_id))
            .collect();
        debug!(agent_count = agents.len(), "Listed agents");
        Ok(agents)
    }

    async fn disable_agents(&self, agents: &[AgentRecord]) -> Result<(), SchedulerError> {
        debug!(agents = ?uuids(agents), "Disabling agents");
        if agents.is_empty() {
            return Ok(());
        }

        let body = json!({
            "uuids": uuids(agents),
            "agent_config_state": "Disabled",
        });
        self.send("disable_agents", self.client.patch(self.agents_url()).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_agents(&self, agents: &[AgentRecord]) -> Result<(), SchedulerError> {
        debug!(agents = ?uuids(agents), "Deleting agents");
        if agents.is_empty() {
            return Ok(());
        }

        let body = json!({ "uuids": uuids(agents) });
        self.send("delete_agents", self.client.delete(self.agents_url()).json(&body))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Mock
// =============================================================================

/// A call recorded by [`MockScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    List,
    Disable(Vec<AgentUuid>),
    Delete(Vec<AgentUuid>),
}

#[derive(Debug, Default)]
struct MockSchedulerState {
    agents: Vec<AgentRecord>,
    calls: Vec<SchedulerCall>,
    fail_list: bool,
    fail_disable: bool,
    fail_delete: bool,
}

/// In-memory scheduler for tests and development.
///
/// Empty batches are not recorded, mirroring the HTTP client which issues
/// no request for them.
#[derive(Debug, Default)]
pub struct MockScheduler {
    state: Mutex<MockSchedulerState>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent: AgentRecord) {
        self.state.lock().await.agents.push(agent);
    }

    pub async fn agents(&self) -> Vec<AgentRecord> {
        self.state.lock().await.agents.clone()
    }

    pub async fn calls(&self) -> Vec<SchedulerCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn set_fail_list(&self, fail: bool) {
        self.state.lock().await.fail_list = fail;
    }

    pub async fn set_fail_disable(&self, fail: bool) {
        self.state.lock().await.fail_disable = fail;
    }

    pub async fn set_fail_delete(&self, fail: bool) {
        self.state.lock().await.fail_delete = fail;
    }

    fn mock_failure(operation: &'static str) -> SchedulerError {
        SchedulerError::UpstreamUnavailable {
            operation,
            status: 500,
            body: "mock scheduler configured to fail".to_string(),
        }
    }
}

#[async_trait]
impl SchedulerApi for MockScheduler {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, SchedulerError> {
        let mut state = self.state.lock().await;
        state.calls.push(SchedulerCall::List);
        if state.fail_list {
            return Err(Self::mock_failure("list_agents"));
        }
        Ok(state.agents.clone())
    }

    async fn disable_agents(&self, agents: &[AgentRecord]) -> Result<(), SchedulerError> {
        if agents.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state
            .calls
            .push(SchedulerCall::Disable(agents.iter().map(|a| a.uuid.clone()).collect()));
        if state.fail_disable {
            return Err(Self::mock_failure("disable_agents"));
        }
        for agent in state.agents.iter_mut() {
            if agents.iter().any(|a| a.uuid == agent.uuid) {
                agent.status = AgentStatus::Disabled;
            }
        }
        Ok(())
    }

    async fn delete_agents(&self, agents: &[AgentRecord]) -> Result<(), SchedulerError> {
        if agents.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state
            .calls
            .push(SchedulerCall::Delete(agents.iter().map(|a| a.uuid.clone()).collect()));
        if state.fail_delete {
            return Err(Self::mock_failure("delete_agents"));
        }
        state
            .agents
            .retain(|agent| !agents.iter().any(|a| a.uuid == agent.uuid));
        Ok(())
    }
}
