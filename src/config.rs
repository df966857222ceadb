//! Daemon configuration.
//!
//! ```yaml
//! global:
//!     base-dir: /srv/backy
//!     worker-limit: 3
//!     backup-completed-callback: /usr/local/bin/report-backup
//! schedules:
//!     default:
//!         daily: {interval: 1d, keep: 9}
//!         weekly: {interval: 7d, keep: 5}
//! jobs:
//!     vm1:
//!         schedule: default
//!         source: {type: file, filename: /dev/vg/vm1}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use backy_datastore::prune::{Rule, Schedule};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(default)]
    pub schedules: BTreeMap<String, BTreeMap<String, RuleConfig>>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GlobalConfig {
    pub base_dir: PathBuf,
    /// Capacity of each of the two worker pools.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
    #[serde(default)]
    pub backup_completed_callback: Option<String>,
}

fn default_worker_limit() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub interval: String,
    pub keep: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct JobConfig {
    pub schedule: String,
    pub source: SourceSpec,
}

/// Which kind of volume a job reads and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceSpec {
    /// Raw image file or block device. There is no change tracking, so
    /// every run examines the whole volume and a `full-always` knob
    /// would be meaningless.
    File { filename: PathBuf },
    /// Ceph RBD image; snapshots give consistency and changed-block
    /// listings.
    CephRbd {
        pool: String,
        image: String,
        #[serde(rename = "full-always", default)]
        full_always: bool,
    },
    /// RBD image of a VM whose filesystem is quiesced with an external
    /// freeze command while the snapshot is taken.
    QuiescedRbd {
        pool: String,
        image: String,
        #[serde(rename = "freeze-command")]
        freeze_command: String,
        #[serde(rename = "thaw-command")]
        thaw_command: String,
        #[serde(rename = "full-always", default)]
        full_always: bool,
    },
}

/// Parses the interval grammar `<integer><s|m|h|d|w>`.
pub fn parse_interval(spec: &str) -> Result<Duration, Error> {
    let spec = spec.trim();
    if spec.is_empty() || !spec.is_ascii() {
        bail!("invalid interval '{spec}'");
    }
    let (number, unit) = spec.split_at(spec.len() - 1);
    let number: i64 = number
        .parse()
        .map_err(|_| format_err!("invalid interval '{spec}'"))?;
    if number <= 0 {
        bail!("interval '{spec}' must be positive");
    }
    Ok(match unit {
        "s" => Duration::seconds(number),
        "m" => Duration::minutes(number),
        "h" => Duration::hours(number),
        "d" => Duration::days(number),
        "w" => Duration::weeks(number),
        _ => bail!("invalid interval unit in '{spec}' (expected s|m|h|d|w)"),
    })
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format_err!("unable to read config {path:?} - {err}"))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|err| format_err!("malformed config {path:?} - {err}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.global.worker_limit < 1 {
            bail!("worker-limit must be at least 1");
        }
        for (name, rules) in &self.schedules {
            if rules.is_empty() {
                bail!("schedule '{name}' has no rules");
            }
            for (tag, rule) in rules {
                parse_interval(&rule.interval)
                    .map_err(|err| format_err!("schedule '{name}', tag '{tag}': {err}"))?;
                if rule.keep < 1 {
                    bail!("schedule '{name}', tag '{tag}': keep must be at least 1");
                }
            }
        }
        for (name, job) in &self.jobs {
            if !self.schedules.contains_key(&job.schedule) {
                bail!("job '{name}' references unknown schedule '{}'", job.schedule);
            }
        }
        Ok(())
    }

    /// Materializes the retention rules a job runs under.
    pub fn schedule(&self, name: &str) -> Result<Schedule, Error> {
        let rules = self
            .schedules
            .get(name)
            .ok_or_else(|| format_err!("unknown schedule '{name}'"))?;
        let rules = rules
            .iter()
            .map(|(tag, rule)| {
                Ok(Rule {
                    tag: tag.clone(),
                    interval: parse_interval(&rule.interval)?,
                    keep: rule.keep,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Schedule::new(rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
global:
    base-dir: /srv/backy
    worker-limit: 3
schedules:
    default:
        daily: {interval: 1d, keep: 9}
        weekly: {interval: 7d, keep: 5}
jobs:
    vm1:
        schedule: default
        source: {type: file, filename: /dev/vg/vm1}
    vm2:
        schedule: default
        source: {type: ceph-rbd, pool: rbd, image: vm2, full-always: true}
    vm3:
        schedule: default
        source:
            type: quiesced-rbd
            pool: rbd
            image: vm3
            freeze-command: fsfreeze -f /mnt/vm3
            thaw-command: fsfreeze -u /mnt/vm3
";

    #[test]
    fn parses_sample() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.global.worker_limit, 3);
        assert_eq!(config.jobs.len(), 3);
        match &config.jobs["vm2"].source {
            SourceSpec::CephRbd { pool, image, full_always } => {
                assert_eq!(pool, "rbd");
                assert_eq!(image, "vm2");
                assert!(full_always);
            }
            other => panic!("unexpected source {other:?}"),
        }
        let schedule = config.schedule("default").unwrap();
        assert_eq!(schedule.rules().len(), 2);
    }

    #[test]
    fn interval_grammar() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_interval("12h").unwrap(), Duration::hours(12));
        assert_eq!(parse_interval("1d").unwrap(), Duration::days(1));
        assert_eq!(parse_interval("2w").unwrap(), Duration::weeks(2));
        for bad in ["", "d", "1x", "-1d", "0s", "1.5h"] {
            assert!(parse_interval(bad).is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn rejects_unknown_schedule_reference() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.jobs.get_mut("vm1").unwrap().schedule = "nope".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_keep() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config
            .schedules
            .get_mut("default")
            .unwrap()
            .get_mut("daily")
            .unwrap()
            .keep = 0;
        assert!(config.validate().is_err());
    }
}
