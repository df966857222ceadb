use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alphabet for short revision uuids: base57, i.e. alphanumerics
/// without the lookalikes 0/O, 1/l/I.
const UUID_ALPHABET: &[u8; 57] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const UUID_LEN: usize = 22;

/// Integrity marker of a revision.
///
/// Fresh backups start out trusted. A single chunk hash mismatch
/// anywhere in the repository demotes every revision to distrusted;
/// a successful verification against the source promotes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trust {
    Trusted,
    Verified,
    Distrusted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunks_written: u64,
    pub chunks_reused: u64,
}

/// Metadata of one point-in-time image, persisted as `<uuid>.rev` in
/// YAML. The chunk map lives alongside in the packed `<uuid>` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub uuid: String,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock seconds of the producing backup; stays 0 until the
    /// backup completed successfully.
    pub duration: f64,
    pub size: u64,
    pub tags: BTreeSet<String>,
    pub trust: Trust,
    #[serde(default)]
    pub stats: RevisionStats,
}

impl Revision {
    pub fn new(tags: BTreeSet<String>) -> Self {
        Revision {
            uuid: generate_uuid(),
            timestamp: Utc::now(),
            duration: 0.0,
            size: 0,
            tags,
            trust: Trust::Trusted,
            stats: RevisionStats::default(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.duration > 0.0
    }

    pub fn rev_path(&self, repo: &Path) -> PathBuf {
        repo.join(format!("{}.rev", self.uuid))
    }

    pub fn map_path(&self, repo: &Path) -> PathBuf {
        repo.join(&self.uuid)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format_err!("unable to read revision {path:?} - {err}"))?;
        let rev: Revision = serde_yaml::from_str(&raw)
            .map_err(|err| format_err!("malformed revision {path:?} - {err}"))?;
        Ok(rev)
    }

    /// Writes `<uuid>.rev` via temp file + atomic rename.
    pub fn save(&self, repo: &Path) -> Result<(), Error> {
        let path = self.rev_path(repo);
        let tmp_path = repo.join(format!("{}.rev.tmp", self.uuid));
        let raw = serde_yaml::to_string(self)?;
        if let Err(err) =
            std::fs::write(&tmp_path, raw).and_then(|_| std::fs::rename(&tmp_path, &path))
        {
            let _ = std::fs::remove_file(&tmp_path);
            bail!("writing revision {path:?} failed - {err}");
        }
        Ok(())
    }
}

pub fn generate_uuid() -> String {
    let mut rng = rand::thread_rng();
    (0..UUID_LEN)
        .map(|_| UUID_ALPHABET[rng.gen_range(0..UUID_ALPHABET.len())] as char)
        .collect()
}

fn plausible_uuid(token: &str) -> bool {
    token.len() == UUID_LEN && token.bytes().all(|b| UUID_ALPHABET.contains(&b))
}

/// How a caller addresses revisions: a full uuid, the N-th newest
/// completed revision (0 = newest), `latest`/`last`, a tag (newest
/// revision bearing it), or `all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionSpec {
    All,
    Latest,
    /// N-th newest completed revision, 0 = newest.
    Index(usize),
    /// A uuid or tag; which one is decided against the revision list
    /// (uuid match wins).
    Token(String),
}

impl FromStr for RevisionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty revision specification");
        }
        Ok(match s {
            "all" => RevisionSpec::All,
            "latest" | "last" => RevisionSpec::Latest,
            _ => match s.parse::<usize>() {
                Ok(n) => RevisionSpec::Index(n),
                Err(_) => RevisionSpec::Token(s.to_string()),
            },
        })
    }
}

impl RevisionSpec {
    /// Resolves against a timestamp-sorted (oldest first) revision
    /// list, as produced by [Repository::revisions](crate::Repository::revisions).
    pub fn resolve<'a>(&self, revisions: &'a [Revision]) -> Result<Vec<&'a Revision>, Error> {
        let completed = || revisions.iter().rev().filter(|r| r.is_completed());
        let found: Vec<&Revision> = match self {
            RevisionSpec::All => revisions.iter().collect(),
            RevisionSpec::Latest => completed().take(1).collect(),
            RevisionSpec::Index(n) => completed().skip(*n).take(1).collect(),
            RevisionSpec::Token(token) => {
                if let Some(rev) = revisions.iter().find(|r| &r.uuid == token) {
                    vec![rev]
                } else if plausible_uuid(token) && !revisions.iter().any(|r| r.tags.contains(token))
                {
                    bail!("no revision with uuid '{token}'");
                } else {
                    completed()
                        .find(|r| r.tags.contains(token))
                        .into_iter()
                        .collect()
                }
            }
        };
        if found.is_empty() {
            bail!("revision specification '{self:?}' matches nothing");
        }
        Ok(found)
    }
}
