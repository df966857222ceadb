use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::Error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use backy_datastore::prune::Schedule;
use backy_datastore::repository::Repository;
use backy_datastore::revision::Revision;

use crate::config::SourceSpec;
use crate::source::{self, BackupSource};
use crate::{backup, verify};

/// A run counts as slow if the previous completed run of the job took
/// at least this long.
pub const SLOW_THRESHOLD_SECS: f64 = 600.0;

const BACKOFF_BASE_SECS: u64 = 2 * 60;
const BACKOFF_CAP_SECS: u64 = 6 * 60 * 60;

/// Backoff after `failures` consecutive failures:
/// `min(6h, 2min * 2^(failures-1))`.
pub fn backoff_delay(failures: u32) -> std::time::Duration {
    let exp = failures.saturating_sub(1).min(16);
    std::time::Duration::from_secs(BACKOFF_CAP_SECS.min(BACKOFF_BASE_SECS << exp))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    Fast,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Dead,
    WaitingDeadline,
    WaitingSlot(PoolKind),
    Running(PoolKind),
    Finished,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Dead => write!(f, "dead"),
            JobState::WaitingDeadline => write!(f, "waiting-deadline"),
            JobState::WaitingSlot(PoolKind::Fast) => write!(f, "waiting-slot-fast"),
            JobState::WaitingSlot(PoolKind::Slow) => write!(f, "waiting-slot-slow"),
            JobState::Running(PoolKind::Fast) => write!(f, "running-fast"),
            JobState::Running(PoolKind::Slow) => write!(f, "running-slow"),
            JobState::Finished => write!(f, "finished"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Runtime state of one scheduled repository. Everything here is
/// in-memory; the durable facts live in the repository itself.
pub struct Job {
    pub name: String,
    pub repo_path: PathBuf,
    schedule: Mutex<Schedule>,
    source: Mutex<SourceSpec>,
    state: Mutex<JobState>,
    failures: AtomicU32,
    last_duration: Mutex<Option<f64>>,
    /// Set while a failure backoff delays the next attempt.
    backoff_until: Mutex<Option<DateTime<Utc>>>,
    /// Wakes the job loop for an ad-hoc run.
    pub(super) trigger: Notify,
    removed: AtomicBool,
}

impl Job {
    pub fn new(name: String, repo_path: PathBuf, schedule: Schedule, source: SourceSpec) -> Self {
        Job {
            name,
            repo_path,
            schedule: Mutex::new(schedule),
            source: Mutex::new(source),
            state: Mutex::new(JobState::WaitingDeadline),
            failures: AtomicU32::new(0),
            last_duration: Mutex::new(None),
            backoff_until: Mutex::new(None),
            trigger: Notify::new(),
            removed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    pub(super) fn set_state(&self, state: JobState) {
        log::debug!("job {}: -> {state}", self.name);
        *self.state.lock().unwrap() = state;
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_duration(&self) -> Option<f64> {
        *self.last_duration.lock().unwrap()
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule.lock().unwrap().clone()
    }

    pub fn source(&self) -> SourceSpec {
        self.source.lock().unwrap().clone()
    }

    /// Applied on reload; the job keeps its state and counters.
    pub(super) fn update_config(&self, schedule: Schedule, source: SourceSpec) {
        *self.schedule.lock().unwrap() = schedule;
        *self.source.lock().unwrap() = source;
    }

    /// Marks the job as vanished from the configuration. A running
    /// backup finishes; the loop exits afterwards.
    pub(super) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Relaxed);
        self.trigger.notify_one();
    }

    pub(super) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Relaxed)
    }

    /// Which pool the next run goes to: jobs whose previous run was
    /// long queue behind other long jobs only.
    pub fn pool(&self) -> PoolKind {
        match self.last_duration() {
            Some(d) if d >= SLOW_THRESHOLD_SECS => PoolKind::Slow,
            _ => PoolKind::Fast,
        }
    }

    /// Next wanted fire time: the retention engine's earliest due tag,
    /// pushed out by an active failure backoff.
    pub fn next_due(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let repo = Repository::open(&self.repo_path)?;
        let revisions = repo.revisions()?;
        let now = Utc::now();
        let due = self.schedule.lock().unwrap().next_due(&revisions, now);
        let backoff = *self.backoff_until.lock().unwrap();
        Ok(match (due, backoff) {
            (Some(due), Some(backoff)) => Some(due.max(backoff)),
            (due, backoff) => due.or(backoff),
        })
    }

    pub(super) fn record_success(&self, rev: &Revision) {
        self.failures.store(0, Ordering::Relaxed);
        *self.last_duration.lock().unwrap() = Some(rev.duration);
        *self.backoff_until.lock().unwrap() = None;
    }

    /// Bumps the failure counter and returns the new backoff delay.
    pub(super) fn record_failure(&self) -> std::time::Duration {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = backoff_delay(failures);
        *self.backoff_until.lock().unwrap() =
            Some(Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::hours(6)));
        delay
    }

    /// One blocking backup run: pick the due tags, back up, chase down
    /// distrusted revisions, expire. Runs on the blocking pool.
    pub(super) fn run_once(&self) -> Result<Revision, Error> {
        let schedule = self.schedule();
        let source_spec = self.source();
        let repo = Repository::open(&self.repo_path)?;
        let mut source = source::open(&source_spec);

        let revisions = repo.revisions()?;
        let mut tags: BTreeSet<String> = schedule.due_tags(&revisions, Utc::now());
        if tags.is_empty() {
            // ad-hoc run with nothing due: tag with the full schedule,
            // expiry trims the excess
            tags = schedule.tags().map(String::from).collect();
        }

        let rev = backup::backup(&repo, source.as_mut(), tags)?;

        if repo.has_distrusted()? {
            // live sources can only be compared block-wise when no
            // snapshot scope is needed to read them
            let by_content: Option<&mut dyn BackupSource> = match source_spec {
                SourceSpec::File { .. } => Some(source.as_mut()),
                _ => None,
            };
            verify::verify_distrusted(&repo, by_content)?;
        }

        repo.expire(&schedule)?;
        Ok(rev)
    }

    /// Repository status as the completion callback sees it on stdin.
    pub fn status_yaml(&self) -> Result<String, Error> {
        let repo = Repository::open(&self.repo_path)?;
        let revisions = repo.revisions()?;
        Ok(serde_yaml::to_string(&revisions)?)
    }
}
