//! Compute (hypervisor) cluster client.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use conclave_common::ServiceType;

use super::client::ControlClient;
use super::{ClusterService, JoinConfig, ServiceError};

#[derive(Serialize)]
struct ClusterPut<'a> {
    server_name: &'a str,
    server_address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_token: Option<&'a str>,
    enabled: bool,
}

#[derive(Serialize)]
struct MembersPost<'a> {
    server_name: &'a str,
}

#[derive(Deserialize)]
struct JoinToken {
    token: String,
}

#[derive(Deserialize)]
struct ComputeMember {
    server_name: String,
    url: String,
}

/// Client of the compute daemon's cluster API
pub struct ComputeService {
    client: ControlClient,
}

impl ComputeService {
    pub fn new(url: &str) -> Self {
        Self {
            client: ControlClient::new(url),
        }
    }
}

/// `https://10.0.0.2:8443` -> `10.0.0.2:8443`
fn strip_scheme(url: &str) -> String {
    url.split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .trim_end_matches('/')
        .to_string()
}

#[async_trait]
impl ClusterService for ComputeService {
    fn service_type(&self) -> ServiceType {
        ServiceType::Compute
    }

    async fn bootstrap(&self, name: &str, address: &str) -> Result<(), ServiceError> {
        let body = ClusterPut {
            server_name: name,
            server_address: address,
            cluster_token: None,
            enabled: true,
        };
        self.client.put("/1.0/cluster", &body).await
    }

    async fn issue_token(&self, peer: &str) -> Result<String, ServiceError> {
        let token: JoinToken = self
            .client
            .post("/1.0/cluster/members", &MembersPost { server_name: peer })
            .await?;
        Ok(token.token)
    }

    async fn delete_token(&self, peer: &str) -> Result<(), ServiceError> {
        self.client.delete(&format!("/1.0/cluster/tokens/{peer}")).await
    }

    async fn join(&self, config: &JoinConfig) -> Result<(), ServiceError> {
        let body = ClusterPut {
            server_name: &config.name,
            server_address: &config.address,
            cluster_token: Some(&config.token),
            enabled: true,
        };
        self.client.put("/1.0/cluster", &body).await
    }

    async fn cluster_members(&self) -> Result<HashMap<String, String>, ServiceError> {
        let members: Vec<ComputeMember> = self.client.get("/1.0/cluster/members").await?;
        Ok(members
            .into_iter()
            .map(|m| (m.server_name, strip_scheme(&m.url)))
            .collect())
    }

    async fn delete_cluster_member(&self, name: &str, force: bool) -> Result<(), ServiceError> {
        let path = if force {
            format!("/1.0/cluster/members/{name}?force=1")
        } else {
            format!("/1.0/cluster/members/{name}")
        };
        self.client.delete(&path).await
    }
}
