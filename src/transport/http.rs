//! HTTP transport talking to the source service in [`crate::api`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};

use super::{FileStream, RemoteFile, RemoteSnapshot, SnapshotSource};
use crate::api::{ErrorResponse, SnapshotRequest};
use crate::error::{Error, Result};
use crate::snapshot::SnapshotScope;
use crate::tablet::{SchemaHash, TabletId, TabletVersionSet};

/// Snapshot source reached over HTTP
pub struct HttpSnapshotSource {
    client: Client,
    token: Option<String>,
}

impl HttpSnapshotSource {
    /// Create a new HTTP source. Requests carry `token` when one is configured.
    pub fn new(connect_timeout: Duration, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, token })
    }

    fn url(replica: &str, path: &str) -> String {
        format!("http://{}{}", replica, path)
    }

    fn token_query(&self) -> Vec<(&'static str, String)> {
        self.token
            .iter()
            .map(|t| ("token", t.clone()))
            .collect()
    }

    /// Turn a non-success response into the matching error
    async fn check(replica: &str, tablet_id: TabletId, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body: Option<ErrorResponse> = resp.json().await.ok();
        let message = body
            .as_ref()
            .map(|b| b.error.clone())
            .unwrap_or_else(|| status.to_string());

        Err(match body.as_ref().map(|b| b.code.as_str()) {
            Some("version_unavailable") => Error::VersionUnavailable(message),
            Some("not_found") => Error::TabletNotFound(tablet_id),
            Some("forbidden") => {
                Error::SourceUnreachable(format!("{} refused the request: {}", replica, message))
            }
            _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Error::Network(format!("{} answered {}: {}", replica, status, message))
            }
            _ => Error::ValidationFailed(format!("{} rejected the request: {}", replica, message)),
        })
    }
}

/// Classify a reqwest failure so the fetcher knows whether to retry
fn send_error(replica: &str, e: reqwest::Error) -> Error {
    if e.is_connect() {
        Error::ConnectionFailed {
            address: replica.to_string(),
            reason: e.to_string(),
        }
    } else if e.is_timeout() {
        Error::ConnectionTimeout(replica.to_string())
    } else {
        Error::Network(format!("{}: {}", replica, e))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn list_versions(&self, replica: &str, tablet_id: TabletId) -> Result<TabletVersionSet> {
        let url = Self::url(replica, &format!("/api/tablets/{}/versions", tablet_id));
        let resp = self
            .client
            .get(&url)
            .query(&self.token_query())
            .send()
            .await
            .map_err(|e| send_error(replica, e))?;

        Self::check(replica, tablet_id, resp)
            .await?
            .json()
            .await
            .map_err(|e| send_error(replica, e))
    }

    async fn make_snapshot(
        &self,
        replica: &str,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        scope: &SnapshotScope,
    ) -> Result<RemoteSnapshot> {
        let url = Self::url(replica, &format!("/api/tablets/{}/snapshot", tablet_id));
        let request = SnapshotRequest {
            schema_hash,
            versions: match scope {
                SnapshotScope::Full => None,
                SnapshotScope::Versions(ranges) => Some(ranges.clone()),
            },
        };

        let resp = self
            .client
            .post(&url)
            .query(&self.token_query())
            .json(&request)
            .send()
            .await
            .map_err(|e| send_error(replica, e))?;

        Self::check(replica, tablet_id, resp)
            .await?
            .json()
            .await
            .map_err(|e| send_error(replica, e))
    }

    async fn open_file(
        &self,
        replica: &str,
        snapshot: &RemoteSnapshot,
        file: &RemoteFile,
    ) -> Result<FileStream> {
        let url = Self::url(replica, "/api/_download");
        let path = format!("{}/{}", snapshot.path.trim_end_matches('/'), file.name);
        let mut query = self.token_query();
        query.push(("file", path));

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| send_error(replica, e))?;
        let resp = Self::check(replica, snapshot.tablet_id, resp).await?;

        let replica = replica.to_string();
        Ok(resp
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| send_error(&replica, e)))
            .boxed())
    }

    async fn release_snapshot(&self, replica: &str, snapshot: &RemoteSnapshot) -> Result<()> {
        let url = Self::url(replica, "/api/snapshot");
        let mut query = self.token_query();
        query.push(("path", snapshot.path.clone()));

        let resp = self
            .client
            .delete(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| send_error(replica, e))?;
        Self::check(replica, snapshot.tablet_id, resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        // nothing listens on port 1
        let source = HttpSnapshotSource::new(Duration::from_millis(500), None).unwrap();
        let err = source.list_versions("127.0.0.1:1", 5).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error {:?}", err);
    }
}
