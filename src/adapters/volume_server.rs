//! Volume Server RPC Adapter
//!
//! Implements the `VolumeServerClient` port against a volume server's HTTP
//! API. Every method takes `server` as a `host:port` pair and builds its own
//! URL; unlike the master adapter there is no single fixed base address,
//! since engines talk to whichever node in the topology currently holds the
//! relevant replica or shard.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::domain::ports::{CopyProgress, IndexExt, NeedleMeta, VolumeServerClient};
use crate::error::{Error, Result};

pub struct HttpVolumeServerClient {
    client: Client,
}

impl HttpVolumeServerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn url(server: &str, path: &str) -> String {
        format!("http://{server}{path}")
    }
}

impl std::fmt::Debug for HttpVolumeServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVolumeServerClient").finish()
    }
}

#[derive(Debug, Deserialize)]
struct NeedleMetaResponse {
    #[serde(rename = "lastModifiedNs")]
    last_modified_ns: i64,
}

async fn expect_success(resp: reqwest::Response, op: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(Error::Transient(format!("{op} returned status {}", resp.status())))
    }
}

#[async_trait]
impl VolumeServerClient for HttpVolumeServerClient {
    #[instrument(skip(self))]
    async fn volume_mount(&self, server: &str, vid: u32) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(server, "/admin/volume/mount"))
            .query(&[("volume", vid.to_string())])
            .send()
            .await?;
        expect_success(resp, "volume_mount").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn volume_unmount(&self, server: &str, vid: u32) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(server, "/admin/volume/unmount"))
            .query(&[("volume", vid.to_string())])
            .send()
            .await?;
        expect_success(resp, "volume_unmount").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn volume_delete(&self, server: &str, vid: u32) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(server, "/admin/volume/delete"))
            .query(&[("volume", vid.to_string())])
            .send()
            .await?;
        expect_success(resp, "volume_delete").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn volume_mark_writable(&self, server: &str, vid: u32, writable: bool) -> Result<()> {
        let path = if writable {
            "/admin/volume/mark_writable"
        } else {
            "/admin/volume/mark_readonly"
        };
        let resp = self
            .client
            .post(Self::url(server, path))
            .query(&[("volume", vid.to_string())])
            .send()
            .await?;
        expect_success(resp, "volume_mark_writable").await?;
        Ok(())
    }

    #[instrument(skip(self, cancel))]
    async fn copy_file(
        &self,
        server: &str,
        vid: u32,
        ext: IndexExt,
        collection: &str,
        is_ec: bool,
        compaction_revision: u32,
        stop_offset: u64,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let resp = self
            .client
            .get(Self::url(server, "/admin/copy_file"))
            .query(&[
                ("volume", vid.to_string()),
                ("ext", ext.as_str().to_string()),
                ("collection", collection.to_string()),
                ("isEc", is_ec.to_string()),
                ("compactionRevision", compaction_revision.to_string()),
                ("stopOffset", stop_offset.to_string()),
            ])
            .send()
            .await?;
        let resp = expect_success(resp, "copy_file").await?;

        let stream = resp.bytes_stream().map(|item| item.map_err(Error::from));
        let guarded = guarded_by_cancel(stream, cancel);
        Ok(Box::pin(guarded))
    }

    #[instrument(skip(self))]
    async fn read_needle_meta(
        &self,
        server: &str,
        vid: u32,
        needle_id: u64,
        offset: u32,
        size: u32,
    ) -> Result<NeedleMeta> {
        let resp = self
            .client
            .get(Self::url(server, "/admin/needle/meta"))
            .query(&[
                ("volume", vid.to_string()),
                ("needleId", needle_id.to_string()),
                ("offset", offset.to_string()),
                ("size", size.to_string()),
            ])
            .send()
            .await?;
        let parsed: NeedleMetaResponse = resp.json().await.map_err(Error::from)?;
        Ok(NeedleMeta {
            last_modified_ns: parsed.last_modified_ns,
        })
    }

    #[instrument(skip(self))]
    async fn read_needle_blob(
        &self,
        server: &str,
        vid: u32,
        needle_id: u64,
        offset: u32,
        size: u32,
    ) -> Result<Bytes> {
        let resp = self
            .client
            .get(Self::url(server, "/admin/needle/blob"))
            .query(&[
                ("volume", vid.to_string()),
                ("needleId", needle_id.to_string()),
                ("offset", offset.to_string()),
                ("size", size.to_string()),
            ])
            .send()
            .await?;
        let resp = expect_success(resp, "read_needle_blob").await?;
        Ok(resp.bytes().await?)
    }

    #[instrument(skip(self, blob))]
    async fn write_needle_blob(
        &self,
        server: &str,
        vid: u32,
        needle_id: u64,
        size: u32,
        blob: Bytes,
    ) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(server, "/admin/needle/blob"))
            .query(&[
                ("volume", vid.to_string()),
                ("needleId", needle_id.to_string()),
                ("size", size.to_string()),
            ])
            .body(blob)
            .send()
            .await?;
        expect_success(resp, "write_needle_blob").await?;
        Ok(())
    }

    #[instrument(skip(self, cancel))]
    async fn volume_copy(
        &self,
        server: &str,
        vid: u32,
        source_data_node: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<CopyProgress>>> {
        let resp = self
            .client
            .post(Self::url(server, "/admin/volume/copy"))
            .query(&[
                ("volume", vid.to_string()),
                ("sourceDataNode", source_data_node.to_string()),
            ])
            .send()
            .await?;
        let resp = expect_success(resp, "volume_copy").await?;

        let stream = resp.bytes_stream().map(|item| {
            item.map_err(Error::from).and_then(|chunk| {
                let n: u64 = std::str::from_utf8(&chunk)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| Error::Transient("malformed volume_copy progress chunk".into()))?;
                Ok(CopyProgress { processed_bytes: n })
            })
        });
        let guarded = guarded_by_cancel(stream, cancel);
        Ok(Box::pin(guarded))
    }

    #[instrument(skip(self))]
    async fn volume_ec_shards_copy(
        &self,
        server: &str,
        vid: u32,
        collection: &str,
        shard_ids: &[u32],
        copy_ecx_file: bool,
        copy_ecj_file: bool,
        copy_vif_file: bool,
        source_data_node: &str,
    ) -> Result<()> {
        let ids = shard_ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let resp = self
            .client
            .post(Self::url(server, "/admin/ec/shards/copy"))
            .query(&[
                ("volume", vid.to_string()),
                ("collection", collection.to_string()),
                ("shardIds", ids),
                ("copyEcxFile", copy_ecx_file.to_string()),
                ("copyEcjFile", copy_ecj_file.to_string()),
                ("copyVifFile", copy_vif_file.to_string()),
                ("sourceDataNode", source_data_node.to_string()),
            ])
            .send()
            .await?;
        expect_success(resp, "volume_ec_shards_copy").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn volume_ec_shards_to_volume(&self, server: &str, vid: u32, collection: &str) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(server, "/admin/ec/shards/to_volume"))
            .query(&[("volume", vid.to_string()), ("collection", collection.to_string())])
            .send()
            .await?;
        expect_success(resp, "volume_ec_shards_to_volume").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn volume_ec_shards_delete(
        &self,
        server: &str,
        vid: u32,
        collection: &str,
        shard_ids: &[u32],
    ) -> Result<()> {
        let ids = shard_ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let resp = self
            .client
            .post(Self::url(server, "/admin/ec/shards/delete"))
            .query(&[
                ("volume", vid.to_string()),
                ("collection", collection.to_string()),
                ("shardIds", ids),
            ])
            .send()
            .await?;
        expect_success(resp, "volume_ec_shards_delete").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn volume_ec_shards_unmount(&self, server: &str, vid: u32, shard_ids: &[u32]) -> Result<()> {
        let ids = shard_ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let resp = self
            .client
            .post(Self::url(server, "/admin/ec/shards/unmount"))
            .query(&[("volume", vid.to_string()), ("shardIds", ids)])
            .send()
            .await?;
        expect_success(resp, "volume_ec_shards_unmount").await?;
        Ok(())
    }

    #[instrument(skip(self, fids))]
    async fn delete_files(&self, server: &str, fids: &[String]) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(server, "/admin/delete_files"))
            .json(&fids)
            .send()
            .await?;
        expect_success(resp, "delete_files").await?;
        Ok(())
    }
}

/// Wraps a stream so it stops yielding items once `cancel` is triggered.
fn guarded_by_cancel<T, S>(stream: S, cancel: CancellationToken) -> impl futures::Stream<Item = T>
where
    S: futures::Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    futures::stream::unfold((Box::pin(stream), cancel), |(mut s, cancel)| async move {
        if cancel.is_cancelled() {
            return None;
        }
        let item = s.next().await?;
        Some((item, (s, cancel)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_urls_relative_to_server_addr() {
        assert_eq!(
            HttpVolumeServerClient::url("vol1.local:8080", "/admin/volume/mount"),
            "http://vol1.local:8080/admin/volume/mount"
        );
    }
}
