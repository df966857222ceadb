//! Tag based retention: which tags are due for a fresh backup, which
//! tag assignments have expired, and whether a repository still meets
//! its SLA.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::revision::Revision;

/// `manual:*` tags are assigned by operators and never expire.
pub const MANUAL_TAG_PREFIX: &str = "manual:";

#[derive(Debug, Clone)]
pub struct Rule {
    pub tag: String,
    pub interval: Duration,
    pub keep: usize,
}

/// Ordered list of retention rules, one per tag.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    rules: Vec<Rule>,
}

/// Expiry verdict for one revision: drop these tags; a revision whose
/// tag set empties out is forgotten entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryChange {
    pub uuid: String,
    pub remove_tags: BTreeSet<String>,
}

impl Schedule {
    pub fn new(rules: Vec<Rule>) -> Self {
        Schedule { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.tag.as_str())
    }

    /// When tag `tag` next wants a backup: interval past the newest
    /// completed revision bearing it, or immediately if there is none.
    fn due_at(&self, rule: &Rule, revisions: &[Revision], now: DateTime<Utc>) -> DateTime<Utc> {
        match newest_tagged(revisions, &rule.tag) {
            Some(rev) => rev.timestamp + rule.interval,
            None => now,
        }
    }

    /// Earliest fire time over all tags. `None` for an empty schedule.
    pub fn next_due(&self, revisions: &[Revision], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.rules
            .iter()
            .map(|rule| self.due_at(rule, revisions, now))
            .min()
    }

    /// Tags whose fire time has passed.
    pub fn due_tags(&self, revisions: &[Revision], now: DateTime<Utc>) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|rule| self.due_at(rule, revisions, now) <= now)
            .map(|rule| rule.tag.clone())
            .collect()
    }

    /// Tags that blew their SLA: more than 1.5 intervals since the
    /// newest revision bearing them. A tag that never produced a
    /// revision is not counted; the due machinery schedules it
    /// immediately anyway.
    pub fn overdue_tags(&self, revisions: &[Revision], now: DateTime<Utc>) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| {
                newest_tagged(revisions, &rule.tag).is_some_and(|rev| {
                    now > rev.timestamp + rule.interval + rule.interval / 2
                })
            })
            .map(|rule| rule.tag.clone())
            .collect()
    }
}

fn newest_tagged<'a>(revisions: &'a [Revision], tag: &str) -> Option<&'a Revision> {
    revisions
        .iter()
        .rev()
        .find(|r| r.is_completed() && r.tags.contains(tag))
}

/// Computes tag expiry over a timestamp-sorted (oldest first) revision
/// list: per schedule tag, the newest `keep` bearers stay, older ones
/// lose the tag. Manual tags and tags outside the schedule are left
/// alone. Incomplete revisions are not touched.
pub fn expire(revisions: &[Revision], schedule: &Schedule) -> Vec<ExpiryChange> {
    let mut changes: Vec<ExpiryChange> = Vec::new();

    for rule in schedule.rules() {
        if rule.tag.starts_with(MANUAL_TAG_PREFIX) {
            continue;
        }
        for rev in revisions
            .iter()
            .rev()
            .filter(|r| r.is_completed() && r.tags.contains(&rule.tag))
            .skip(rule.keep)
        {
            match changes.iter_mut().find(|c| c.uuid == rev.uuid) {
                Some(change) => {
                    change.remove_tags.insert(rule.tag.clone());
                }
                None => changes.push(ExpiryChange {
                    uuid: rev.uuid.clone(),
                    remove_tags: [rule.tag.clone()].into(),
                }),
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{RevisionStats, Trust};

    fn rev(uuid: &str, age_hours: i64, tags: &[&str]) -> Revision {
        Revision {
            uuid: uuid.into(),
            timestamp: Utc::now() - Duration::hours(age_hours),
            duration: 10.0,
            size: 0,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            trust: Trust::Trusted,
            stats: RevisionStats::default(),
        }
    }

    fn daily_weekly() -> Schedule {
        Schedule::new(vec![
            Rule {
                tag: "daily".into(),
                interval: Duration::days(1),
                keep: 3,
            },
            Rule {
                tag: "weekly".into(),
                interval: Duration::weeks(1),
                keep: 2,
            },
        ])
    }

    #[test]
    fn due_immediately_without_history() {
        let schedule = daily_weekly();
        let now = Utc::now();
        assert_eq!(
            schedule.due_tags(&[], now),
            ["daily".to_string(), "weekly".to_string()].into()
        );
        assert_eq!(schedule.next_due(&[], now), Some(now));
    }

    #[test]
    fn due_after_interval_elapses() {
        let schedule = daily_weekly();
        let now = Utc::now();
        let revs = vec![rev("a1", 25, &["daily", "weekly"])];
        // daily fired 25h ago -> due again; weekly is not
        assert_eq!(schedule.due_tags(&revs, now), ["daily".to_string()].into());

        let next = schedule.next_due(&revs, now).unwrap();
        assert!(next <= now);

        let fresh = vec![rev("a2", 0, &["daily", "weekly"])];
        assert!(schedule.due_tags(&fresh, now).is_empty());
        assert!(schedule.next_due(&fresh, now).unwrap() > now);
    }

    #[test]
    fn overdue_needs_one_and_a_half_intervals() {
        let schedule = daily_weekly();
        let now = Utc::now();
        assert!(schedule.overdue_tags(&[rev("a1", 25, &["daily"])], now).is_empty());
        assert_eq!(
            schedule.overdue_tags(&[rev("a1", 37, &["daily"])], now),
            vec!["daily".to_string()]
        );
        // no history at all is handled by due, not by the SLA
        assert!(schedule.overdue_tags(&[], now).is_empty());
    }

    #[test]
    fn expire_keeps_newest_k() {
        let schedule = daily_weekly();
        let revs: Vec<Revision> = (0..5)
            .map(|i| rev(&format!("r{i}"), 24 * (5 - i as i64), &["daily"]))
            .collect();
        let changes = expire(&revs, &schedule);
        // r0 and r1 are the two oldest of five, keep=3
        let uuids: Vec<&str> = changes.iter().map(|c| c.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["r0", "r1"]);
        for change in &changes {
            assert_eq!(change.remove_tags, ["daily".to_string()].into());
        }
    }

    #[test]
    fn expire_ignores_manual_and_foreign_tags() {
        let mut schedule = daily_weekly();
        schedule.rules.push(Rule {
            tag: "manual:pinned".into(),
            interval: Duration::days(1),
            keep: 0,
        });
        let revs = vec![
            rev("r0", 96, &["daily", "manual:pinned", "archive"]),
            rev("r1", 72, &["daily"]),
            rev("r2", 48, &["daily"]),
            rev("r3", 24, &["daily"]),
        ];
        let changes = expire(&revs, &schedule);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].uuid, "r0");
        // only the scheduled tag is dropped; manual/foreign tags stay
        assert_eq!(changes[0].remove_tags, ["daily".to_string()].into());
    }
}
