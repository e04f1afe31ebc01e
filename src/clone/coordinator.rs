//! Clone Coordinator
//!
//! Drives one clone request through planning, fetching, conversion and
//! publishing. Each pass runs a forward-only [`CloneStateMachine`]; a pass
//! that loses a revision race at publish time is repeated once from the start.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::converter::SnapshotConverter;
use super::fetcher::SnapshotFetcher;
use super::planner::{ClonePlan, PlannerPolicy, VersionDiffPlanner};
use super::publisher::ClonePublisher;
use super::{CloneFailure, CloneMode, CloneOutcome, CloneRequest, CloneState};
use crate::config::CloneConfig;
use crate::error::{Error, Result};
use crate::tablet::{TabletEngine, TabletMeta, TabletVersionSet};
use crate::transport::SnapshotSource;

/// Forward-only coordinator state
#[derive(Debug, Clone)]
pub struct CloneStateMachine {
    current: CloneState,
    history: Vec<CloneState>,
}

impl Default for CloneStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CloneStateMachine {
    pub fn new() -> Self {
        Self {
            current: CloneState::Planning,
            history: vec![CloneState::Planning],
        }
    }

    pub fn current(&self) -> CloneState {
        self.current
    }

    /// Every state visited so far, in order
    pub fn history(&self) -> &[CloneState] {
        &self.history
    }

    /// Move to `next`. Only the next stage, `Failed`, or the in-sync
    /// shortcut from `Planning` to `Succeeded` are accepted.
    pub fn advance(&mut self, next: CloneState) -> Result<()> {
        use CloneState::*;

        let allowed = match (self.current, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Planning, Fetching) | (Planning, Succeeded) => true,
            (Fetching, Converting) | (Converting, Publishing) | (Publishing, Succeeded) => true,
            _ => false,
        };
        if !allowed {
            return Err(Error::Internal(format!(
                "illegal clone transition {} -> {}",
                self.current, next
            )));
        }

        self.current = next;
        self.history.push(next);
        Ok(())
    }
}

/// Outcome of probing one source replica
enum Probe {
    InSync,
    Candidate(String, CloneMode),
}

/// Counters and notes carried across passes of one request
#[derive(Default)]
struct RunContext {
    diagnostics: Vec<String>,
    bytes_copied: u64,
    attempts: u32,
    states: Vec<CloneState>,
}

impl RunContext {
    fn note(&mut self, message: String) {
        tracing::debug!("{}", message);
        self.diagnostics.push(message);
    }
}

/// Runs clone requests against the local engine
pub struct CloneCoordinator {
    engine: Arc<TabletEngine>,
    planner: VersionDiffPlanner,
    fetcher: SnapshotFetcher,
    converter: SnapshotConverter,
    publisher: ClonePublisher,
}

impl CloneCoordinator {
    pub fn new(engine: Arc<TabletEngine>, source: Arc<dyn SnapshotSource>, config: &CloneConfig) -> Self {
        let clone_root = engine.paths().clone_dir();
        Self {
            planner: VersionDiffPlanner::new(PlannerPolicy::from(config)),
            fetcher: SnapshotFetcher::new(source, clone_root, config),
            converter: SnapshotConverter::new(),
            publisher: ClonePublisher::new(Arc::clone(&engine)),
            engine,
        }
    }

    /// Bring the local replica of `request.tablet_id` up to date
    pub async fn run(
        &self,
        request: &CloneRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<CloneOutcome, CloneFailure> {
        tracing::info!(
            "Clone of tablet {} (signature {}) from {:?} started",
            request.tablet_id,
            request.signature,
            request.sources
        );

        let mut ctx = RunContext::default();
        let mut pass = 0;
        loop {
            pass += 1;
            match self.run_pass(request, cancel, &mut ctx).await {
                Ok(mut outcome) => {
                    outcome.bytes_copied = ctx.bytes_copied;
                    outcome.attempts = ctx.attempts;
                    outcome.diagnostics = ctx.diagnostics;
                    outcome.states = ctx.states;
                    tracing::info!(
                        "Clone of tablet {} (signature {}) succeeded: {:?} to version {} from {:?}, {} bytes in {} ms",
                        request.tablet_id,
                        request.signature,
                        outcome.kind,
                        outcome.committed_version,
                        outcome.source,
                        outcome.bytes_copied,
                        outcome.copy_time_ms
                    );
                    return Ok(outcome);
                }
                Err((stage, err @ Error::VersionConflict { .. })) if pass == 1 => {
                    tracing::warn!(
                        "Clone of tablet {} lost a race while {}: {}; planning again",
                        request.tablet_id,
                        stage,
                        err
                    );
                    ctx.note(format!("pass 1 failed while {}: {}", stage, err));
                }
                Err((stage, error)) => {
                    tracing::error!(
                        "Clone of tablet {} (signature {}) failed while {}: {}",
                        request.tablet_id,
                        request.signature,
                        stage,
                        error
                    );
                    return Err(CloneFailure {
                        stage,
                        error,
                        bytes_copied: ctx.bytes_copied,
                        attempts: ctx.attempts,
                        diagnostics: ctx.diagnostics,
                        states: ctx.states,
                    });
                }
            }
        }
    }

    /// One pass through the state machine
    async fn run_pass(
        &self,
        request: &CloneRequest,
        cancel: &CancellationToken,
        ctx: &mut RunContext,
    ) -> std::result::Result<CloneOutcome, (CloneState, Error)> {
        let mut machine = CloneStateMachine::new();
        let result = self.drive(request, cancel, ctx, &mut machine).await;

        let stage = machine.current();
        let terminal = if result.is_ok() {
            CloneState::Succeeded
        } else {
            CloneState::Failed
        };
        let advanced = if stage.is_terminal() {
            Ok(())
        } else {
            machine.advance(terminal)
        };
        ctx.states.extend_from_slice(machine.history());

        match (result, advanced) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err((stage, e)),
            (Err(e), _) => Err((stage, e)),
        }
    }

    async fn drive(
        &self,
        request: &CloneRequest,
        cancel: &CancellationToken,
        ctx: &mut RunContext,
        machine: &mut CloneStateMachine,
    ) -> Result<CloneOutcome> {
        if request.sources.is_empty() {
            return Err(Error::ValidationFailed("clone request names no source".into()));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Planning
        let local = self.engine.get_tablet(request.tablet_id).await?;
        if let Some(local) = &local {
            if local.schema_hash != request.schema_hash {
                return Err(Error::ValidationFailed(format!(
                    "local tablet {} has schema hash {}, request has {}",
                    request.tablet_id, local.schema_hash, request.schema_hash
                )));
            }
        }
        let local_versions = local.as_ref().map(TabletMeta::version_set).transpose()?;

        let mut next_source = 0;
        let (mut replica, mut mode) = match self
            .next_candidate(request, local_versions.as_ref(), &mut next_source, true, cancel, ctx)
            .await?
        {
            Some(Probe::Candidate(replica, mode)) => (replica, mode),
            Some(Probe::InSync) => {
                machine.advance(CloneState::Succeeded)?;
                let version = local.as_ref().map_or(0, TabletMeta::max_version);
                return Ok(CloneOutcome::already_in_sync(
                    version,
                    local.as_ref().map(TabletMeta::tablet_info),
                ));
            }
            None => return Err(no_usable_source(request)),
        };

        // Fetching
        machine.advance(CloneState::Fetching)?;
        let fetched = loop {
            tracing::info!(
                "Fetching {} snapshot of tablet {} from {}",
                mode,
                request.tablet_id,
                replica
            );
            let err = match self
                .fetcher
                .fetch(&replica, request.tablet_id, request.schema_hash, &mode, cancel)
                .await
            {
                Ok(fetched) => {
                    ctx.bytes_copied += fetched.bytes_copied;
                    ctx.attempts += fetched.attempts;
                    break fetched;
                }
                Err(failed) => {
                    ctx.bytes_copied += failed.bytes_copied;
                    ctx.attempts += failed.attempts;
                    failed.error
                }
            };

            if matches!(err, Error::VersionUnavailable(_)) && matches!(mode, CloneMode::Incremental(_)) {
                ctx.note(format!(
                    "{}: {}, falling back to full clone",
                    replica, err
                ));
                mode = CloneMode::Full;
                continue;
            }

            let replica_failed = matches!(
                err,
                Error::SourceUnreachable(_)
                    | Error::TabletNotFound(_)
                    | Error::VersionUnavailable(_)
                    | Error::CorruptSnapshot(_)
            );
            if !replica_failed {
                return Err(err);
            }

            ctx.note(format!("{}: {}", replica, err));
            match self
                .next_candidate(request, local_versions.as_ref(), &mut next_source, false, cancel, ctx)
                .await?
            {
                Some(Probe::Candidate(next_replica, next_mode)) => {
                    replica = next_replica;
                    mode = next_mode;
                }
                _ => return Err(err),
            }
        };

        // Converting
        machine.advance(CloneState::Converting)?;
        let header = self
            .converter
            .convert(fetched.staging.path(), request.tablet_id)?;

        // Publishing
        machine.advance(CloneState::Publishing)?;
        let mut outcome = self
            .publisher
            .publish(request, local.as_ref(), &header, fetched, &mode)
            .await?;
        outcome.source = Some(replica);
        Ok(outcome)
    }

    /// Probe sources from `next_source` on until one can serve the request.
    ///
    /// `allow_in_sync` is false once a replica has already asked for data; a
    /// later replica that has nothing newer is then skipped.
    async fn next_candidate(
        &self,
        request: &CloneRequest,
        local: Option<&TabletVersionSet>,
        next_source: &mut usize,
        allow_in_sync: bool,
        cancel: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<Option<Probe>> {
        while let Some(replica) = request.sources.get(*next_source) {
            *next_source += 1;

            let versions = match self
                .fetcher
                .list_versions(replica, request.tablet_id, cancel)
                .await
            {
                Ok(versions) => versions,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    ctx.note(format!("{}: {}", replica, e));
                    continue;
                }
            };

            match self.planner.plan(local, &versions, request.committed_version) {
                ClonePlan::AlreadyInSync if allow_in_sync => return Ok(Some(Probe::InSync)),
                ClonePlan::AlreadyInSync => {
                    ctx.note(format!("{}: holds nothing newer than the local replica", replica));
                }
                ClonePlan::Unsatisfiable(reason) => {
                    ctx.note(format!("{}: {}", replica, reason));
                }
                ClonePlan::Incremental(ranges) => {
                    return Ok(Some(Probe::Candidate(
                        replica.clone(),
                        CloneMode::Incremental(ranges),
                    )))
                }
                ClonePlan::Full => {
                    return Ok(Some(Probe::Candidate(replica.clone(), CloneMode::Full)))
                }
            }
        }
        Ok(None)
    }
}

fn no_usable_source(request: &CloneRequest) -> Error {
    Error::SourceUnreachable(format!(
        "none of {} source replicas can serve tablet {}",
        request.sources.len(),
        request.tablet_id
    ))
}
