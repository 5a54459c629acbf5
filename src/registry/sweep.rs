//! Startup recovery and the recurring reclamation sweep.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use super::{FileStatus, Registry, RegistryState, TaskStatus};
use crate::config::IngestConfig;
use crate::error::Result;

/// Message recorded on tasks interrupted by a restart
pub const ABANDONED_BY_RESTART: &str = "abandoned by restart";

/// Ages beyond a century are treated as "never"
const MAX_AGE_SECS: i64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub evicted: usize,
    pub recovered: usize,
    pub orphans_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tasks_reclaimed: usize,
    pub records_evicted: usize,
    pub artifacts_removed: usize,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(age.as_secs()).ok()?.min(MAX_AGE_SECS);
    now.checked_sub_signed(chrono::Duration::seconds(secs))
}

/// Drop file and task records older than `horizon`. Records in flight are kept.
pub fn evict_expired(state: &mut RegistryState, horizon: Duration, now: DateTime<Utc>) -> usize {
    let Some(cutoff) = cutoff(now, horizon) else {
        return 0;
    };
    let files_before = state.files.len();
    let tasks_before = state.tasks.len();

    state
        .files
        .retain(|_, f| f.status == FileStatus::Processing || f.uploaded_at >= cutoff);
    state
        .tasks
        .retain(|_, t| t.status == TaskStatus::Processing || t.started_at >= cutoff);

    (files_before - state.files.len()) + (tasks_before - state.tasks.len())
}

/// Reset work interrupted by a restart: files back to `pending`, their tasks to `error`.
///
/// A processing file whose task already completed lost only its final write;
/// its record is dropped and the bytes are left to the orphan sweep.
pub fn recover(state: &mut RegistryState) -> usize {
    let finished: Vec<String> = state
        .files
        .values()
        .filter(|f| f.status == FileStatus::Processing)
        .filter(|f| {
            f.task_id
                .as_ref()
                .and_then(|id| state.tasks.get(id))
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
        .map(|f| f.id.clone())
        .collect();
    for id in &finished {
        state.files.remove(id);
        log::info!("File {} was ingested before shutdown; dropping its record", id);
    }

    let mut recovered = 0;
    for file in state.files.values_mut() {
        if file.status == FileStatus::Processing {
            file.status = FileStatus::Pending;
            file.task_id = None;
            recovered += 1;
        }
    }
    for task in state.tasks.values_mut() {
        if task.status == TaskStatus::Processing {
            task.finish(TaskStatus::Error, Some(ABANDONED_BY_RESTART.to_string()));
        }
    }
    recovered
}

/// Names of upload artifacts still referenced by a file record
fn referenced_names(state: &RegistryState) -> HashSet<OsString> {
    state
        .files
        .values()
        .filter_map(|f| f.stored_path.file_name().map(|n| n.to_os_string()))
        .collect()
}

/// Delete files in `uploads_dir` that no record references.
///
/// With `min_age`, artifacts modified more recently than that are left alone.
pub fn reclaim_orphans(
    uploads_dir: &Path,
    referenced: &HashSet<OsString>,
    min_age: Option<Duration>,
) -> Result<usize> {
    if !uploads_dir.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(uploads_dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Skipping unreadable upload entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || referenced.contains(entry.file_name()) {
            continue;
        }
        if let Some(min_age) = min_age {
            let age = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                log::info!("Removed orphan upload {}", entry.path().display());
                removed += 1;
            }
            Err(e) => log::warn!("Failed to remove orphan {}: {}", entry.path().display(), e),
        }
    }
    Ok(removed)
}

/// Recovery performed once when the registry is loaded
pub async fn recover_on_startup(registry: &Registry, config: &IngestConfig) -> Result<StartupReport> {
    let now = Utc::now();
    let horizon = config.registry_horizon();
    let (recovered, evicted) = registry
        .mutate(|s| {
            let recovered = recover(s);
            Ok((recovered, evict_expired(s, horizon, now)))
        })
        .await?;

    if recovered > 0 {
        log::warn!("{} file(s) were processing at shutdown and are pending again", recovered);
    }

    let referenced = registry.read(referenced_names).await;
    let orphans_removed = reclaim_orphans(registry.uploads_dir(), &referenced, None)?;

    Ok(StartupReport {
        evicted,
        recovered,
        orphans_removed,
    })
}

/// One pass of the recurring sweep
pub async fn sweep_once(registry: &Registry, config: &IngestConfig) -> Result<SweepReport> {
    let now = Utc::now();
    let retention = cutoff(now, config.task_retention());
    let horizon = config.registry_horizon();

    let (tasks_reclaimed, records_evicted) = registry
        .mutate(|s| {
            let before = s.tasks.len();
            if let Some(retention) = retention {
                s.tasks.retain(|_, t| match t.completed_at {
                    Some(done) if t.is_terminal() => done >= retention,
                    _ => true,
                });
            }
            let reclaimed = before - s.tasks.len();
            Ok((reclaimed, evict_expired(s, horizon, now)))
        })
        .await?;

    let referenced = registry.read(referenced_names).await;
    let artifacts_removed = reclaim_orphans(
        registry.uploads_dir(),
        &referenced,
        Some(config.artifact_horizon()),
    )?;

    Ok(SweepReport {
        tasks_reclaimed,
        records_evicted,
        artifacts_removed,
    })
}

/// Run `sweep_once` every `sweep_interval_secs` until the runtime shuts down
pub fn spawn_sweeper(registry: Arc<Registry>, config: IngestConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
        // The first tick fires immediately; startup recovery already covered it.
        interval.tick().await;
        loop {
            interval.tick().await;
            match sweep_once(&registry, &config).await {
                Ok(report) if report != SweepReport::default() => log::info!(
                    "Sweep: {} task(s) reclaimed, {} record(s) evicted, {} artifact(s) removed",
                    report.tasks_reclaimed,
                    report.records_evicted,
                    report.artifacts_removed
                ),
                Ok(_) => log::debug!("Sweep: nothing to reclaim"),
                Err(e) => log::error!("Sweep failed: {}", e),
            }
        }
    })
}
