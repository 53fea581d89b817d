//! Kubernetes REST implementation of the platform.
//!
//! Only the three pod calls the controller needs are implemented:
//! create, delete, and a label-selected list in one namespace.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podpool_id::{InstanceId, PoolName};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use super::{InstanceShape, ObservedInstance, Platform};
use crate::config::Settings;
use crate::error::PlatformError;

/// Label marking pods owned by this controller.
pub const MANAGED_BY_LABEL: &str = "podpool.dev/managed-by";

/// Label carrying the pod's pool.
pub const POOL_LABEL: &str = "podpool.dev/pool";

const MANAGED_BY_VALUE: &str = "podpool";

/// Kubernetes platform client.
pub struct KubernetesPlatform {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    token: String,
}

impl KubernetesPlatform {
    /// Create a client from settings.
    pub fn new(settings: &Settings) -> Result<Self, PlatformError> {
        let mut builder = reqwest::Client::builder().timeout(settings.request_timeout());
        if let Some(pem) = &settings.cluster_ca_cert {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
                PlatformError::Request {
                    operation: "configure",
                    message: format!("invalid cluster CA certificate: {e}"),
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }
        Self::with_client(
            builder,
            &settings.cluster_url,
            &settings.namespace,
            &settings.security_token,
        )
    }

    /// Create a client against an arbitrary base URL (used by tests).
    pub fn with_base_url(
        base_url: &str,
        namespace: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        Self::with_client(
            reqwest::Client::builder().timeout(timeout),
            base_url,
            namespace,
            token,
        )
    }

    fn with_client(
        builder: reqwest::ClientBuilder,
        base_url: &str,
        namespace: &str,
        token: &str,
    ) -> Result<Self, PlatformError> {
        let client = builder.build().map_err(|e| PlatformError::Request {
            operation: "configure",
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token: token.to_string(),
        })
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, self.namespace)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PlatformError> {
        request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| PlatformError::Request {
                operation,
                message: e.to_string(),
            })
    }
}

/// Build the pod manifest for a new instance.
fn pod_manifest(
    id: &InstanceId,
    pool: &PoolName,
    shape: &InstanceShape,
) -> Result<serde_json::Value, PlatformError> {
    let spec = match shape {
        serde_json::Value::Object(_) => shape.clone(),
        other => {
            return Err(PlatformError::InvalidShape(format!(
                "expected a pod spec object, got {other}"
            )))
        }
    };
    Ok(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": id.as_str(),
            "labels": {
                MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                POOL_LABEL: pool.as_str(),
            },
        },
        "spec": spec,
    }))
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

impl Pod {
    fn is_ready(&self) -> bool {
        self.status.phase.as_deref() == Some("Running")
            && self
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
    }

    fn is_terminal(&self) -> bool {
        matches!(self.status.phase.as_deref(), Some("Failed" | "Succeeded"))
    }

    fn into_observed(self) -> Option<ObservedInstance> {
        let ready = self.is_ready();
        let terminal = self.is_terminal();
        let id = match self.metadata.name.parse::<InstanceId>() {
            Ok(id) => id,
            Err(e) => {
                warn!(name = %self.metadata.name, error = %e, "Skipping pod with invalid name");
                return None;
            }
        };
        let pool = match self.metadata.labels.get(POOL_LABEL).map(|p| p.parse::<PoolName>()) {
            Some(Ok(pool)) => pool,
            _ => {
                warn!(instance_id = %id, "Skipping pod without a valid pool label");
                return None;
            }
        };
        Some(ObservedInstance {
            id,
            pool,
            ready,
            terminal,
            created_at: self.metadata.creation_timestamp.unwrap_or_else(Utc::now),
        })
    }
}

async fn rejected(operation: &'static str, response: reqwest::Response) -> PlatformError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(operation, status = %status, body = %body, "Platform request rejected");
    PlatformError::Rejected {
        operation,
        status: status.as_u16(),
        body,
    }
}

#[async_trait]
impl Platform for KubernetesPlatform {
    async fn create_instance(
        &self,
        id: &InstanceId,
        pool: &PoolName,
        shape: &InstanceShape,
    ) -> Result<ObservedInstance, PlatformError> {
        let manifest = pod_manifest(id, pool, shape)?;
        debug!(instance_id = %id, pool = %pool, "Creating pod");

        let response = self
            .send("create", self.client.post(self.pods_url()).json(&manifest))
            .await?;
        if !response.status().is_success() {
            return Err(rejected("create", response).await);
        }

        let pod: Pod = response.json().await.map_err(|e| PlatformError::Decode {
            operation: "create",
            message: e.to_string(),
        })?;
        Ok(ObservedInstance {
            id: id.clone(),
            pool: pool.clone(),
            ready: pod.is_ready(),
            terminal: pod.is_terminal(),
            created_at: pod.metadata.creation_timestamp.unwrap_or_else(Utc::now),
        })
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<(), PlatformError> {
        let url = format!("{}/{}", self.pods_url(), id);
        debug!(instance_id = %id, "Deleting pod");

        let response = self.send("delete", self.client.delete(&url)).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(instance_id = %id, "Pod already gone");
                Ok(())
            }
            _ => Err(rejected("delete", response).await),
        }
    }

    async fn list_instances(&self) -> Result<Vec<ObservedInstance>, PlatformError> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let request = self
            .client
            .get(self.pods_url())
            .query(&[("labelSelector", selector.as_str())]);

        let response = self.send("list", request).await?;
        if !response.status().is_success() {
            return Err(rejected("list", response).await);
        }

        let list: PodList = response.json().await.map_err(|e| PlatformError::Decode {
            operation: "list",
            message: e.to_string(),
        })?;
        Ok(list
            .items
            .into_iter()
            .filter_map(Pod::into_observed)
            .collect())
    }
}
