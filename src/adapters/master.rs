//! Master RPC Adapter
//!
//! Implements the `MasterClient` port against a master's HTTP API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::domain::ports::MasterClient;
use crate::error::{Error, Result};
use crate::topology::{Location, Topology};

/// HTTP-backed master RPC client.
pub struct HttpMasterClient {
    base_url: String,
    client: Client,
}

impl HttpMasterClient {
    pub fn new(master_addr: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: format!("http://{master_addr}"),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl std::fmt::Debug for HttpMasterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMasterClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct VolumeListResponse {
    topology: Topology,
    #[serde(rename = "volumeSizeLimitMB")]
    volume_size_limit_mb: u64,
}

#[derive(Debug, Deserialize)]
struct LookupVolumeResponse {
    locations: HashMap<String, Vec<Location>>,
}

#[derive(Debug, Deserialize)]
struct ListClusterNodesResponse {
    nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LockResponse {
    token: String,
}

#[async_trait]
impl MasterClient for HttpMasterClient {
    #[instrument(skip(self))]
    async fn volume_list(&self) -> Result<(Topology, u64)> {
        let resp = self
            .client
            .get(self.url("/vol/status"))
            .query(&[("pretty", "false")])
            .send()
            .await
            .map_err(|e| Error::Fatal(format!("master unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Fatal(format!(
                "master returned status {} for volume_list",
                resp.status()
            )));
        }

        let parsed: VolumeListResponse = resp
            .json()
            .await
            .map_err(|e| Error::Fatal(format!("failed to parse topology: {e}")))?;

        debug!(
            dcs = parsed.topology.data_centers.len(),
            "fetched topology snapshot"
        );
        Ok((parsed.topology, parsed.volume_size_limit_mb))
    }

    #[instrument(skip(self, ids))]
    async fn lookup_volume(&self, ids: &[u32]) -> Result<HashMap<u32, Vec<Location>>> {
        let id_list = ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let resp = self
            .client
            .get(self.url("/vol/lookup"))
            .query(&[("volumeId", id_list.as_str())])
            .send()
            .await?;

        let parsed: LookupVolumeResponse = resp.json().await.map_err(Error::from)?;
        Ok(parsed
            .locations
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (id, v)))
            .collect())
    }

    #[instrument(skip(self))]
    async fn collection_delete(&self, name: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/col/delete"))
            .query(&[("collection", name)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Transient(format!(
                "collection_delete({name}) returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_cluster_nodes(
        &self,
        client_type: &str,
        filer_group: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut query = vec![("clientType", client_type.to_string())];
        if let Some(group) = filer_group {
            query.push(("filerGroup", group.to_string()));
        }

        let resp = self
            .client
            .get(self.url("/cluster/list"))
            .query(&query)
            .send()
            .await?;

        let parsed: ListClusterNodesResponse = resp.json().await.map_err(Error::from)?;
        Ok(parsed.nodes)
    }

    #[instrument(skip(self))]
    async fn acquire_lock(&self, owner: &str) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/cluster/lock"))
            .query(&[("owner", owner)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::LockLost);
        }
        let parsed: LockResponse = resp.json().await.map_err(Error::from)?;
        Ok(parsed.token)
    }

    #[instrument(skip(self))]
    async fn check_lock(&self, token: &str) -> Result<()> {
        let resp = self
            .client
            .get(self.url("/cluster/lock/check"))
            .query(&[("token", token)])
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::LockLost)
        }
    }

    #[instrument(skip(self))]
    async fn release_lock(&self, token: &str) -> Result<()> {
        // Best-effort: the lock's own lease will expire even if this fails.
        let _ = self
            .client
            .post(self.url("/cluster/unlock"))
            .query(&[("token", token)])
            .send()
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_urls_relative_to_master_addr() {
        let client = HttpMasterClient::new("master.local:9333", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/vol/status"), "http://master.local:9333/vol/status");
    }
}
