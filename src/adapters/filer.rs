//! Filer RPC Adapter
//!
//! Implements the `FilerClient` port against a filer's HTTP API. The
//! recursive directory walk (`read_dir_all_entries`) necessarily issues one
//! HTTP call per directory as it descends, so this adapter performs the BFS
//! itself and hands back the accumulated result as a stream, rather than
//! exposing paging details to callers.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::domain::ports::{FilerChunkRef, FilerClient, FilerConfiguration, FilerEntry};
use crate::error::{Error, Result};

pub struct HttpFilerClient {
    base_url: String,
    client: Client,
}

impl HttpFilerClient {
    pub fn new(filer_addr: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: format!("http://{filer_addr}"),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl std::fmt::Debug for HttpFilerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFilerClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ListDirResponse {
    entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "FullPath")]
    full_path: String,
    #[serde(rename = "isDirectory")]
    is_directory: bool,
    #[serde(default)]
    chunks: Vec<RawChunk>,
}

#[derive(Debug, Deserialize)]
struct RawChunk {
    #[serde(rename = "volumeId")]
    volume_id: u32,
    #[serde(rename = "fileKey")]
    file_key: u64,
    cookie: u32,
    #[serde(rename = "mtimeNs")]
    mtime_ns: i64,
    #[serde(rename = "isChunkManifest", default)]
    is_chunk_manifest: bool,
}

#[derive(Debug, Deserialize)]
struct FilerConfResponse {
    collection: Option<String>,
    #[serde(rename = "maxMB")]
    max_mb: u32,
}

impl HttpFilerClient {
    async fn list_dir(&self, path: &str) -> Result<Vec<RawEntry>> {
        let resp = self
            .client
            .get(self.url("/"))
            .query(&[("limit", "100000"), ("path", path)])
            .header("Accept", "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Transient(format!(
                "list_dir({path}) returned status {}",
                resp.status()
            )));
        }

        let parsed: ListDirResponse = resp.json().await.map_err(Error::from)?;
        Ok(parsed.entries)
    }
}

#[async_trait]
impl FilerClient for HttpFilerClient {
    #[instrument(skip(self))]
    async fn read_dir_all_entries(&self, path: &str) -> Result<BoxStream<'static, Result<FilerEntry>>> {
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(path.to_string());

        while let Some(dir) = queue.pop_front() {
            let raw_entries = self.list_dir(&dir).await?;
            for raw in raw_entries {
                if raw.is_directory {
                    queue.push_back(raw.full_path.clone());
                }
                let chunks = raw
                    .chunks
                    .into_iter()
                    .map(|c| FilerChunkRef {
                        volume_id: c.volume_id,
                        file_key: c.file_key,
                        cookie: c.cookie,
                        mtime_ns: c.mtime_ns,
                        full_path: raw.full_path.clone(),
                        is_chunk_manifest: c.is_chunk_manifest,
                    })
                    .collect();
                out.push(Ok(FilerEntry {
                    full_path: raw.full_path,
                    is_directory: raw.is_directory,
                    chunks,
                }));
            }
        }

        Ok(Box::pin(futures::stream::iter(out)))
    }

    #[instrument(skip(self, chunk))]
    async fn resolve_chunk_manifest(&self, chunk: &FilerChunkRef) -> Result<Vec<FilerChunkRef>> {
        let resp = self
            .client
            .get(self.url("/admin/chunk_manifest"))
            .query(&[
                ("volumeId", chunk.volume_id.to_string()),
                ("fileKey", chunk.file_key.to_string()),
                ("cookie", chunk.cookie.to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Transient(format!(
                "resolve_chunk_manifest({}) returned status {}",
                chunk.full_path,
                resp.status()
            )));
        }

        let raw: Vec<RawChunk> = resp.json().await.map_err(Error::from)?;
        Ok(raw
            .into_iter()
            .map(|c| FilerChunkRef {
                volume_id: c.volume_id,
                file_key: c.file_key,
                cookie: c.cookie,
                mtime_ns: c.mtime_ns,
                full_path: chunk.full_path.clone(),
                is_chunk_manifest: c.is_chunk_manifest,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete_entry(&self, full_path: &str) -> Result<u16> {
        let resp = self
            .client
            .delete(self.url(full_path))
            .query(&[("recursive", "true")])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(full_path, %status, "filer delete_entry returned non-2xx");
        }
        Ok(status.as_u16())
    }

    #[instrument(skip(self))]
    async fn get_filer_configuration(&self) -> Result<FilerConfiguration> {
        let resp = self
            .client
            .get(self.url("/.filer.conf"))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(FilerConfiguration {
                collection: None,
                max_mb: 0,
            });
        }

        let parsed: FilerConfResponse = resp.json().await.map_err(Error::from)?;
        Ok(FilerConfiguration {
            collection: parsed.collection,
            max_mb: parsed.max_mb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_urls_relative_to_filer_addr() {
        let client = HttpFilerClient::new("filer.local:8888", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/foo"), "http://filer.local:8888/foo");
    }
}
