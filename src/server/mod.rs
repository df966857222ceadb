//! The scheduling daemon: one cooperative task per job, two bounded
//! worker pools, failure backoff and SLA reporting.
//!
//! Long running backups must not starve the many short ones, so
//! dispatch is segregated: a job whose previous run took at least
//! [SLOW_THRESHOLD_SECS](job::SLOW_THRESHOLD_SECS) queues in the slow
//! pool, everything else in the fast pool. Each pool holds
//! `worker-limit` slots, so short jobs always have capacity reserved
//! for them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{format_err, Error};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use backy_datastore::repository::Repository;

use crate::config::{Config, JobConfig, SourceSpec};

pub mod job;

pub use job::{backoff_delay, Job, JobState, PoolKind};

/// How long a SIGTERM waits for running backups before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3600);

/// Re-check deadlines at least this often, so config edits and clock
/// oddities cannot park a job forever.
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(3600);

pub struct Scheduler {
    config_path: PathBuf,
    base_dir: PathBuf,
    worker_limit: usize,
    callback: Mutex<Option<String>>,
    fast_pool: Arc<Semaphore>,
    slow_pool: Arc<Semaphore>,
    jobs: Mutex<BTreeMap<String, Arc<Job>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// One row of `status()` output.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub state: String,
    pub failures: u32,
    pub last_duration: Option<f64>,
    pub next_due: Option<DateTime<Utc>>,
    pub revisions: usize,
    pub sla_ok: bool,
    pub overdue_tags: Vec<String>,
}

impl Scheduler {
    pub fn new(config_path: PathBuf, config: &Config) -> Result<Arc<Self>, Error> {
        let (shutdown, _) = watch::channel(false);
        let scheduler = Arc::new(Scheduler {
            config_path,
            base_dir: config.global.base_dir.clone(),
            worker_limit: config.global.worker_limit,
            callback: Mutex::new(config.global.backup_completed_callback.clone()),
            fast_pool: Arc::new(Semaphore::new(config.global.worker_limit)),
            slow_pool: Arc::new(Semaphore::new(config.global.worker_limit)),
            jobs: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        });
        for (name, job_config) in &config.jobs {
            let job = scheduler.materialize_job(name, job_config, config)?;
            scheduler.jobs.lock().unwrap().insert(name.clone(), job);
        }
        Ok(scheduler)
    }

    /// Sets up the job's repository directory and runtime state. The
    /// `config` snippet inside the repository mirrors what the daemon
    /// currently runs for the job.
    fn materialize_job(
        &self,
        name: &str,
        job_config: &JobConfig,
        config: &Config,
    ) -> Result<Arc<Job>, Error> {
        let repo_path = self.base_dir.join(name);
        std::fs::create_dir_all(&repo_path)
            .map_err(|err| format_err!("unable to create {repo_path:?} - {err}"))?;

        #[derive(Serialize)]
        struct RepoConfig<'a> {
            schedule: &'a str,
            source: &'a SourceSpec,
        }
        let snippet = serde_yaml::to_string(&RepoConfig {
            schedule: &job_config.schedule,
            source: &job_config.source,
        })?;
        std::fs::write(repo_path.join("config"), snippet)?;

        let schedule = config.schedule(&job_config.schedule)?;
        Ok(Arc::new(Job::new(
            name.to_string(),
            repo_path,
            schedule,
            job_config.source.clone(),
        )))
    }

    fn pool(&self, kind: PoolKind) -> Arc<Semaphore> {
        match kind {
            PoolKind::Fast => self.fast_pool.clone(),
            PoolKind::Slow => self.slow_pool.clone(),
        }
    }

    pub fn jobs(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().cloned().collect()
    }

    fn job(&self, name: &str) -> Result<Arc<Job>, Error> {
        self.jobs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| format_err!("no such job '{name}'"))
    }

    /// Ad-hoc run: skips the deadline wait, still queues for a pool
    /// slot. Failure counters are not touched here, so a failing
    /// forced run backs off like any other.
    pub fn run_job(&self, name: &str) -> Result<(), Error> {
        let job = self.job(name)?;
        job.trigger.notify_one();
        log::info!("job {name}: run requested");
        Ok(())
    }

    /// Reloads the configuration file. A broken file keeps the current
    /// configuration: new jobs start waiting, vanished jobs die after
    /// finishing their current run, everything else keeps its state.
    pub fn reload(self: &Arc<Self>) -> Result<(), Error> {
        let config = Config::load(&self.config_path)?;

        if config.global.worker_limit != self.worker_limit {
            log::warn!("worker-limit changes take effect on restart");
        }
        if config.global.base_dir != self.base_dir {
            log::warn!("base-dir changes take effect on restart");
        }
        *self.callback.lock().unwrap() = config.global.backup_completed_callback.clone();

        let mut spawn = Vec::new();
        {
            let mut jobs = self.jobs.lock().unwrap();
            for (name, job) in jobs.iter() {
                if !config.jobs.contains_key(name) {
                    log::info!("job {name}: removed from configuration");
                    job.mark_removed();
                }
            }
            // vanished jobs stay visible to status() while they finish
            // their current run; job_loop evicts them when it exits
            jobs.retain(|name, job| {
                config.jobs.contains_key(name)
                    || matches!(
                        job.state(),
                        JobState::Running(_) | JobState::WaitingSlot(_)
                    )
            });

            for (name, job_config) in &config.jobs {
                match jobs.get(name).cloned() {
                    Some(job) if !job.is_removed() => {
                        job.update_config(
                            config.schedule(&job_config.schedule)?,
                            job_config.source.clone(),
                        );
                        // refresh the repo config snippet as well
                        let _ = self.materialize_job(name, job_config, &config)?;
                    }
                    // absent, or a winding-down namesake from an
                    // earlier removal: start a fresh job either way
                    _ => {
                        log::info!("job {name}: added to configuration");
                        let job = self.materialize_job(name, job_config, &config)?;
                        jobs.insert(name.clone(), job.clone());
                        spawn.push(job);
                    }
                }
            }
        }
        for job in spawn {
            self.spawn_job(job);
        }
        log::info!("configuration reloaded");
        Ok(())
    }

    pub fn status(&self) -> Vec<JobStatus> {
        let jobs: Vec<Arc<Job>> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.iter()
            .map(|job| {
                let state = job.state();
                let schedule = job.schedule();
                let (revisions, overdue) = match Repository::open(&job.repo_path)
                    .and_then(|repo| repo.revisions())
                {
                    Ok(revs) => {
                        let overdue = schedule.overdue_tags(&revs, Utc::now());
                        (revs.len(), overdue)
                    }
                    Err(err) => {
                        log::warn!("job {}: cannot read repository: {err:#}", job.name);
                        (0, Vec::new())
                    }
                };
                let running = matches!(state, JobState::Running(_));
                JobStatus {
                    name: job.name.clone(),
                    state: state.to_string(),
                    failures: job.failures(),
                    last_duration: job.last_duration(),
                    next_due: job.next_due().ok().flatten(),
                    revisions,
                    sla_ok: overdue.is_empty() || running,
                    overdue_tags: overdue,
                }
            })
            .collect()
    }

    fn spawn_job(self: &Arc<Self>, job: Arc<Job>) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            job_loop(scheduler, job).await;
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Final eviction of a vanished job once its loop has exited. The
    /// pointer comparison protects a namesake that a later reload may
    /// have added in the meantime.
    fn evict_job(&self, job: &Arc<Job>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(current) = jobs.get(&job.name) {
            if Arc::ptr_eq(current, job) {
                jobs.remove(&job.name);
            }
        }
    }

    async fn run_callback(&self, job: &Arc<Job>) {
        let command = self.callback.lock().unwrap().clone();
        let command = match command {
            Some(command) => command,
            None => return,
        };

        let status = {
            let job = job.clone();
            tokio::task::spawn_blocking(move || job.status_yaml()).await
        };
        let yaml = match status {
            Ok(Ok(yaml)) => yaml,
            Ok(Err(err)) => {
                log::warn!("job {}: callback skipped, no status: {err:#}", job.name);
                return;
            }
            Err(err) => {
                log::warn!("job {}: callback skipped: {err}", job.name);
                return;
            }
        };

        let spawned = tokio::process::Command::new(&command)
            .arg(&job.name)
            .stdin(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                log::warn!("cannot spawn callback '{command}': {err}");
                return;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(yaml.as_bytes()).await {
                log::warn!("cannot feed callback '{command}': {err}");
            }
        }
        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => log::warn!("callback '{command}' exited with {status}"),
            Err(err) => log::warn!("callback '{command}' failed: {err}"),
        }
    }

    /// Runs until SIGTERM/SIGINT. SIGHUP reloads the configuration.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let initial: Vec<Arc<Job>> = self.jobs.lock().unwrap().values().cloned().collect();
        for job in initial {
            self.spawn_job(job);
        }

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = sigterm.recv() => break,
                _ = sigint.recv() => break,
                _ = sighup.recv() => {
                    if let Err(err) = self.reload() {
                        log::error!("keeping previous configuration: {err:#}");
                    }
                }
            }
        }

        log::info!("shutting down, waiting for running backups");
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let drained = futures::future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_GRACE, drained).await.is_err() {
            log::warn!("running backups did not finish within the shutdown grace period");
        }
        Ok(())
    }
}

enum Wake {
    Due,
    Shutdown,
}

async fn wait_for_deadline(scheduler: &Arc<Scheduler>, job: &Arc<Job>) -> Wake {
    let mut shutdown = scheduler.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            return Wake::Shutdown;
        }
        let due = match job.next_due() {
            Ok(due) => due,
            Err(err) => {
                log::warn!("job {}: cannot compute deadline: {err:#}", job.name);
                Some(Utc::now() + chrono::Duration::seconds(60))
            }
        };
        let wanted = match due {
            Some(due) => {
                let millis = (due - Utc::now()).num_milliseconds();
                if millis <= 0 {
                    return Wake::Due;
                }
                Duration::from_millis(millis as u64)
            }
            None => MAX_IDLE_SLEEP,
        };
        let sleep = wanted.min(MAX_IDLE_SLEEP);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {
                if sleep == wanted && due.is_some() {
                    return Wake::Due;
                }
                // idle cap hit; recompute
            }
            _ = job.trigger.notified() => return Wake::Due,
            _ = shutdown.changed() => return Wake::Shutdown,
        }
    }
}

async fn job_loop(scheduler: Arc<Scheduler>, job: Arc<Job>) {
    let mut shutdown = scheduler.shutdown.subscribe();
    loop {
        if job.is_removed() {
            job.set_state(JobState::Dead);
            scheduler.evict_job(&job);
            return;
        }
        job.set_state(JobState::WaitingDeadline);
        if matches!(wait_for_deadline(&scheduler, &job).await, Wake::Shutdown) {
            return;
        }
        if job.is_removed() {
            job.set_state(JobState::Dead);
            scheduler.evict_job(&job);
            return;
        }

        let pool = job.pool();
        job.set_state(JobState::WaitingSlot(pool));
        let semaphore = scheduler.pool(pool);
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        job.set_state(JobState::Running(pool));
        let result = {
            let job = job.clone();
            tokio::task::spawn_blocking(move || job.run_once()).await
        };
        drop(permit);

        match result {
            Ok(Ok(rev)) => {
                job.record_success(&rev);
                job.set_state(JobState::Finished);
                log::info!(
                    "job {}: backup {} finished in {:.1}s",
                    job.name,
                    rev.uuid,
                    rev.duration
                );
                scheduler.run_callback(&job).await;
            }
            Ok(Err(err)) => {
                let delay = job.record_failure();
                job.set_state(JobState::Failed);
                log::error!(
                    "job {}: backup failed ({} consecutive): {err:#}; retrying in {delay:?}",
                    job.name,
                    job.failures()
                );
            }
            Err(join_err) => {
                let delay = job.record_failure();
                job.set_state(JobState::Failed);
                log::error!("job {}: backup task died: {join_err}; retrying in {delay:?}", job.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &std::path::Path, jobs: &[&str]) -> PathBuf {
        let base = dir.join("base");
        let mut yaml = format!(
            "global:\n    base-dir: {}\n    worker-limit: 1\nschedules:\n    default:\n        daily: {{interval: 1d, keep: 2}}\njobs:\n",
            base.display()
        );
        for name in jobs {
            yaml.push_str(&format!(
                "    {name}:\n        schedule: default\n        source: {{type: file, filename: /dev/null}}\n"
            ));
        }
        let path = dir.join("backy.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn pools_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &["a"]);
        let config = Config::load(&path).unwrap();
        let scheduler = Scheduler::new(path, &config).unwrap();

        // a long job occupying the entire slow pool...
        let _slow = scheduler.pool(PoolKind::Slow).acquire_owned().await.unwrap();
        assert_eq!(scheduler.pool(PoolKind::Slow).available_permits(), 0);

        // ...leaves the fast pool untouched
        let fast = tokio::time::timeout(
            Duration::from_millis(100),
            scheduler.pool(PoolKind::Fast).acquire_owned(),
        )
        .await
        .expect("fast slot must not wait for the slow pool")
        .unwrap();
        drop(fast);
    }

    #[tokio::test]
    async fn reload_diffs_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &["a", "b"]);
        let config = Config::load(&path).unwrap();
        let scheduler = Scheduler::new(path.clone(), &config).unwrap();
        assert_eq!(scheduler.jobs(), vec!["a".to_string(), "b".to_string()]);
        let job_a = scheduler.job("a").unwrap();

        write_config(dir.path(), &["b", "c"]);
        scheduler.reload().unwrap();
        assert_eq!(scheduler.jobs(), vec!["b".to_string(), "c".to_string()]);
        assert!(job_a.is_removed());

        // repo dir + config snippet materialized for the new job
        let snippet = dir.path().join("base/c/config");
        let raw = std::fs::read_to_string(snippet).unwrap();
        assert!(raw.contains("schedule: default"));
    }

    #[tokio::test]
    async fn removed_job_stays_visible_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &["a", "b"]);
        let config = Config::load(&path).unwrap();
        let scheduler = Scheduler::new(path.clone(), &config).unwrap();

        // a's backup is mid-flight when the reload fires
        let job_a = scheduler.job("a").unwrap();
        job_a.set_state(JobState::Running(PoolKind::Fast));

        write_config(dir.path(), &["b"]);
        scheduler.reload().unwrap();

        // dead to the config, but reportable until its loop exits
        assert!(job_a.is_removed());
        assert_eq!(scheduler.jobs(), vec!["a".to_string(), "b".to_string()]);
        assert!(scheduler.status().iter().any(|s| s.name == "a"));

        // the loop's final eviction takes it out of the admin hooks
        job_a.set_state(JobState::Dead);
        scheduler.evict_job(&job_a);
        assert_eq!(scheduler.jobs(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn broken_reload_keeps_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &["a"]);
        let config = Config::load(&path).unwrap();
        let scheduler = Scheduler::new(path.clone(), &config).unwrap();

        std::fs::write(&path, "not: [valid").unwrap();
        assert!(scheduler.reload().is_err());
        assert_eq!(scheduler.jobs(), vec!["a".to_string()]);
    }

    #[test]
    fn unknown_job_cannot_be_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &["a"]);
        let config = Config::load(&path).unwrap();
        let scheduler = Scheduler::new(path, &config).unwrap();
        assert!(scheduler.run_job("a").is_ok());
        assert!(scheduler.run_job("nope").is_err());
    }
}
