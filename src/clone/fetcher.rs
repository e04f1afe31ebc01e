//! Remote Snapshot Fetcher
//!
//! Downloads a snapshot from one source replica into a fresh staging
//! directory, retrying transient transport failures with backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::staging::StagingDir;
use super::CloneMode;
use crate::config::CloneConfig;
use crate::error::{Error, Result};
use crate::tablet::{SchemaHash, TabletId, TabletVersionSet};
use crate::transport::{RemoteFile, RemoteSnapshot, SnapshotSource};
use crate::util::is_plain_file_name;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        let base = self.backoff.saturating_mul(factor).min(self.backoff_max);
        let jitter_ms = base.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl From<&CloneConfig> for RetryPolicy {
    fn from(config: &CloneConfig) -> Self {
        Self {
            max_attempts: config.download_max_attempts.max(1),
            backoff: config.retry_backoff(),
            backoff_max: config.retry_backoff_max(),
        }
    }
}

/// Snapshot staged on local disk, not yet trusted
#[derive(Debug)]
pub struct FetchedSnapshot {
    pub staging: StagingDir,
    pub bytes_copied: u64,
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Failed fetch, with the counters gathered up to the failure
#[derive(Debug)]
pub struct FetchError {
    pub error: Error,
    pub bytes_copied: u64,
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Pulls snapshots from source replicas
pub struct SnapshotFetcher {
    source: Arc<dyn SnapshotSource>,
    clone_root: PathBuf,
    retry: RetryPolicy,
    request_timeout: Duration,
    disk_reserve: u64,
}

impl SnapshotFetcher {
    pub fn new(source: Arc<dyn SnapshotSource>, clone_root: PathBuf, config: &CloneConfig) -> Self {
        Self {
            source,
            clone_root,
            retry: RetryPolicy::from(config),
            request_timeout: config.download_timeout(),
            disk_reserve: config.disk_reserve_mb.saturating_mul(1024 * 1024),
        }
    }

    /// Ask `replica` for its committed versions, with the same retry policy as downloads
    pub async fn list_versions(
        &self,
        replica: &str,
        tablet_id: TabletId,
        cancel: &CancellationToken,
    ) -> Result<TabletVersionSet> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                r = timeout(self.request_timeout, self.source.list_versions(replica, tablet_id)) => {
                    r.unwrap_or_else(|_| Err(Error::ConnectionTimeout(replica.to_string())))
                }
            };

            match result {
                Err(e) if e.is_retryable() => {
                    self.backoff_or_give_up(replica, attempt, e, cancel).await?;
                }
                other => return other,
            }
        }
    }

    /// Download a snapshot of `tablet_id` scoped by `mode` into a new staging directory
    pub async fn fetch(
        &self,
        replica: &str,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        mode: &CloneMode,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchedSnapshot, FetchError> {
        let start = Instant::now();
        let mut bytes_copied = 0u64;
        let mut attempt = 0;

        let fail = |error: Error, bytes_copied: u64, attempts: u32| FetchError {
            error,
            bytes_copied,
            elapsed: start.elapsed(),
            attempts,
        };

        let staging = StagingDir::create(&self.clone_root, tablet_id)
            .map_err(|e| fail(Error::from_staging_io(e, "create staging directory"), 0, 0))?;

        loop {
            attempt += 1;
            let result = self
                .attempt(replica, tablet_id, schema_hash, mode, staging.path(), &mut bytes_copied, cancel)
                .await;

            let err = match result {
                Ok(()) => {
                    tracing::info!(
                        "Fetched {} snapshot of tablet {} from {}: {} bytes in {:?}",
                        mode,
                        tablet_id,
                        replica,
                        bytes_copied,
                        start.elapsed()
                    );
                    return Ok(FetchedSnapshot {
                        staging,
                        bytes_copied,
                        elapsed: start.elapsed(),
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(fail(err, bytes_copied, attempt));
            }
            if let Err(e) = self.backoff_or_give_up(replica, attempt, err, cancel).await {
                return Err(fail(e, bytes_copied, attempt));
            }
            if let Err(e) = staging.reset() {
                return Err(fail(Error::from_staging_io(e, "reset staging directory"), bytes_copied, attempt));
            }
        }
    }

    /// Sleep before the next attempt, or turn the error into `SourceUnreachable`
    async fn backoff_or_give_up(
        &self,
        replica: &str,
        attempt: u32,
        err: Error,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if attempt >= self.retry.max_attempts {
            return Err(Error::SourceUnreachable(format!(
                "{} failed {} attempts, last error: {}",
                replica, attempt, err
            )));
        }

        let delay = self.retry.delay(attempt);
        tracing::warn!(
            "Attempt {}/{} against {} failed: {}; retrying in {:?}",
            attempt,
            self.retry.max_attempts,
            replica,
            err,
            delay
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// One make-download-release round trip.
    ///
    /// Once the source has made a snapshot it is released on every exit,
    /// cancellation included.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        replica: &str,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        mode: &CloneMode,
        dir: &Path,
        bytes_copied: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let scope = mode.scope();
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = timeout(
                self.request_timeout,
                self.source.make_snapshot(replica, tablet_id, schema_hash, &scope),
            ) => r.map_err(|_| Error::ConnectionTimeout(replica.to_string()))??,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = self.download_all(replica, tablet_id, &snapshot, dir, bytes_copied) => r,
        };

        match timeout(self.request_timeout, self.source.release_snapshot(replica, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Failed to release snapshot {} on {}: {}", snapshot.path, replica, e)
            }
            Err(_) => tracing::warn!("Timed out releasing snapshot {} on {}", snapshot.path, replica),
        }
        result
    }

    async fn download_all(
        &self,
        replica: &str,
        tablet_id: TabletId,
        snapshot: &RemoteSnapshot,
        dir: &Path,
        bytes_copied: &mut u64,
    ) -> Result<()> {
        if snapshot.tablet_id != tablet_id {
            return Err(Error::CorruptSnapshot(format!(
                "{} returned a snapshot of tablet {}",
                replica, snapshot.tablet_id
            )));
        }
        self.check_capacity(dir, snapshot.total_size())?;

        for file in &snapshot.files {
            if !is_plain_file_name(&file.name) {
                return Err(Error::CorruptSnapshot(format!(
                    "{} advertised file {:?}",
                    replica, file.name
                )));
            }
            timeout(
                self.request_timeout,
                self.download_file(replica, snapshot, file, dir, bytes_copied),
            )
            .await
            .map_err(|_| Error::ConnectionTimeout(replica.to_string()))??;
        }
        Ok(())
    }

    async fn download_file(
        &self,
        replica: &str,
        snapshot: &RemoteSnapshot,
        file: &RemoteFile,
        dir: &Path,
        bytes_copied: &mut u64,
    ) -> Result<()> {
        let mut stream = self.source.open_file(replica, snapshot, file).await?;
        let path = dir.join(&file.name);
        let mut out = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::from_staging_io(e, &file.name))?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > file.size {
                return Err(Error::CorruptSnapshot(format!(
                    "{} is longer than the advertised {} bytes",
                    file.name, file.size
                )));
            }
            out.write_all(&chunk)
                .await
                .map_err(|e| Error::from_staging_io(e, &file.name))?;
            *bytes_copied += chunk.len() as u64;
        }
        out.sync_all()
            .await
            .map_err(|e| Error::from_staging_io(e, &file.name))?;

        if written != file.size {
            return Err(Error::Network(format!(
                "truncated download of {} from {}: {} of {} bytes",
                file.name, replica, written, file.size
            )));
        }
        Ok(())
    }

    /// Fail with `DiskFull` when the staging disk cannot hold `needed` bytes plus the reserve
    fn check_capacity(&self, dir: &Path, needed: u64) -> Result<()> {
        let dir = dir.canonicalize()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let available = pick_disk(
            disks.list().iter().map(|d| (d.mount_point(), d.available_space())),
            &dir,
        );

        match available {
            Some(available) if available < needed.saturating_add(self.disk_reserve) => {
                Err(Error::DiskFull(format!(
                    "{} bytes needed in {:?}, {} available with {} reserved",
                    needed, dir, available, self.disk_reserve
                )))
            }
            Some(_) => Ok(()),
            None => {
                tracing::debug!("No disk found for {:?}, skipping capacity check", dir);
                Ok(())
            }
        }
    }
}

/// Available space of the disk whose mount point is the longest prefix of `path`
fn pick_disk<'a>(disks: impl Iterator<Item = (&'a Path, u64)>, path: &Path) -> Option<u64> {
    disks
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| available)
}
