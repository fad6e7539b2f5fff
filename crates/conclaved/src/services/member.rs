//! Client for services built on the shared member-cluster control API:
//! the orchestrator's own control plane, storage, and network.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use conclave_common::ServiceType;

use super::client::ControlClient;
use super::{ClusterService, JoinConfig, ServiceError};

#[derive(Serialize)]
struct ControlPut<'a> {
    name: &'a str,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    join_token: Option<&'a str>,
    bootstrap: bool,
}

#[derive(Serialize)]
struct TokensPost<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct Member {
    name: String,
    address: String,
}

pub struct MemberClusterService {
    kind: ServiceType,
    client: ControlClient,
}

impl MemberClusterService {
    pub fn new(kind: ServiceType, url: &str) -> Self {
        Self {
            kind,
            client: ControlClient::new(url),
        }
    }
}

#[async_trait]
impl ClusterService for MemberClusterService {
    fn service_type(&self) -> ServiceType {
        self.kind
    }

    async fn bootstrap(&self, name: &str, address: &str) -> Result<(), ServiceError> {
        let body = ControlPut {
            name,
            address,
            join_token: None,
            bootstrap: true,
        };
        self.client.put("/cluster/control", &body).await
    }

    async fn issue_token(&self, peer: &str) -> Result<String, ServiceError> {
        self.client
            .post("/cluster/1.0/tokens", &TokensPost { name: peer })
            .await
    }

    async fn delete_token(&self, peer: &str) -> Result<(), ServiceError> {
        self.client.delete(&format!("/cluster/1.0/tokens/{peer}")).await
    }

    async fn join(&self, config: &JoinConfig) -> Result<(), ServiceError> {
        let body = ControlPut {
            name: &config.name,
            address: &config.address,
            join_token: Some(&config.token),
            bootstrap: false,
        };
        self.client.put("/cluster/control", &body).await
    }

    async fn cluster_members(&self) -> Result<HashMap<String, String>, ServiceError> {
        let members: Vec<Member> = self.client.get("/cluster/1.0/cluster").await?;
        Ok(members.into_iter().map(|m| (m.name, m.address)).collect())
    }

    async fn delete_cluster_member(&self, name: &str, force: bool) -> Result<(), ServiceError> {
        let path = if force {
            format!("/cluster/1.0/cluster/{name}?force=1")
        } else {
            format!("/cluster/1.0/cluster/{name}")
        };
        self.client.delete(&path).await
    }
}
