//! Retention planning and pruning.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use keeper_core::RetentionConfig;
use serde::Serialize;
use tracing::info;

use crate::chain::BackupChain;
use crate::error::{ArchiveError, ArchiveResult};
use crate::format::{ArchiveKind, checksum_path, remove_path};

/// How many fulls to keep and how old a record may get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    max_full_count: u32,
    max_age_days: u32,
}

impl RetentionWindow {
    /// `max_age_days == 0` disables age-based pruning.
    pub fn new(max_full_count: u32, max_age_days: u32) -> ArchiveResult<Self> {
        if max_full_count == 0 {
            return Err(ArchiveError::Config(
                "retention must keep at least one full archive".to_string(),
            ));
        }
        Ok(Self {
            max_full_count,
            max_age_days,
        })
    }

    pub fn from_config(cfg: &RetentionConfig) -> ArchiveResult<Self> {
        Self::new(cfg.max_full_count, cfg.max_age_days)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PruneReason {
    /// Belongs to a full beyond the newest `max_full_count`.
    FullCount,
    /// Older than `max_age_days`, or descends from such a record.
    Age,
    /// Cannot be linked into any chain.
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneItem {
    pub name: String,
    pub path: PathBuf,
    pub kind: Option<ArchiveKind>,
    pub reason: PruneReason,
}

/// Records to delete, in deletion order, and the names that survive.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrunePlan {
    pub delete: Vec<PruneItem>,
    pub keep: Vec<String>,
}

impl PrunePlan {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty()
    }
}

/// Decide what to delete from `chain` under `window` as of `now`.
///
/// The chain holding the newest record is never removed for age, and the
/// newest `max_full_count` fulls are never removed for count, so at least
/// one restorable chain always survives.
pub fn prune(chain: &BackupChain, window: &RetentionWindow, now: DateTime<Utc>) -> PrunePlan {
    let mut marked: BTreeMap<&str, PruneReason> = BTreeMap::new();

    for full in chain.fulls().into_iter().skip(window.max_full_count as usize) {
        marked.entry(full.name.as_str()).or_insert(PruneReason::FullCount);
        for d in chain.descendants(&full.name) {
            marked.entry(d.name.as_str()).or_insert(PruneReason::FullCount);
        }
    }

    if window.max_age_days > 0 {
        let cutoff = now - ChronoDuration::days(i64::from(window.max_age_days));
        let protected = chain.latest().map(|r| r.chain_root.as_str());
        for record in chain.records() {
            if Some(record.chain_root.as_str()) == protected || record.created_at >= cutoff {
                continue;
            }
            marked.entry(record.name.as_str()).or_insert(PruneReason::Age);
            for d in chain.descendants(&record.name) {
                marked.entry(d.name.as_str()).or_insert(PruneReason::Age);
            }
        }
    }

    // Deepest links first, so no record outlives its parent mid-prune.
    let depths = chain.depths();
    let mut delete = Vec::new();
    let mut keep = Vec::new();
    for record in chain.records() {
        match marked.get(record.name.as_str()) {
            Some(reason) => delete.push((
                depths.get(record.name.as_str()).copied().unwrap_or(0),
                PruneItem {
                    name: record.name.clone(),
                    path: record.path.clone(),
                    kind: Some(record.kind),
                    reason: *reason,
                },
            )),
            None => keep.push(record.name.clone()),
        }
    }
    delete.sort_by(|(da, a), (db, b)| db.cmp(da).then_with(|| b.name.cmp(&a.name)));

    let orphans = chain.orphans().iter().map(|o| PruneItem {
        name: o
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: o.path.clone(),
        kind: None,
        reason: PruneReason::Orphan,
    });

    let delete = orphans.chain(delete.into_iter().map(|(_, item)| item)).collect();
    PrunePlan { delete, keep }
}

/// Delete every record in `plan`: the archive first, then its sidecar.
pub fn apply_plan(plan: &PrunePlan) -> ArchiveResult<usize> {
    for item in &plan.delete {
        remove_path(&item.path)?;
        remove_path(&checksum_path(&item.path))?;
        info!(archive = %item.name, reason = ?item.reason, "pruned archive");
    }
    Ok(plan.delete.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainRecord;

    fn at(days_ago: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(days_ago)
    }

    fn record(
        name: &str,
        kind: ArchiveKind,
        parent: Option<&str>,
        root: &str,
        created: DateTime<Utc>,
    ) -> ChainRecord {
        ChainRecord {
            name: name.to_string(),
            path: PathBuf::from(format!("/backups/{name}")),
            kind,
            created_at: created,
            parent: parent.map(str::to_string),
            chain_root: root.to_string(),
            size_bytes: 0,
        }
    }

    /// `fulls` chains, each with two incrementals, one day apart per record.
    fn synthetic(fulls: usize, now: DateTime<Utc>) -> BackupChain {
        let mut records = Vec::new();
        let total = (fulls * 3) as i64;
        let mut age = total;
        for f in 0..fulls {
            let root = format!("f{f}");
            records.push(record(&root, ArchiveKind::Full, None, &root, at(age, now)));
            age -= 1;
            let i1 = format!("f{f}i1");
            records.push(record(&i1, ArchiveKind::Incremental, Some(&root), &root, at(age, now)));
            age -= 1;
            let i2 = format!("f{f}i2");
            records.push(record(&i2, ArchiveKind::Incremental, Some(&i1), &root, at(age, now)));
            age -= 1;
        }
        BackupChain::from_records("/backups", records)
    }

    #[test]
    fn zero_full_count_is_a_config_error() {
        assert!(matches!(
            RetentionWindow::new(0, 30),
            Err(ArchiveError::Config(_))
        ));
    }

    #[test]
    fn count_pruning_removes_oldest_chains_incrementals_first() {
        let now = Utc::now();
        let chain = synthetic(5, now);
        let plan = prune(&chain, &RetentionWindow::new(3, 0).unwrap(), now);

        let deleted: Vec<_> = plan.delete.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(deleted, vec!["f1i2", "f0i2", "f1i1", "f0i1", "f1", "f0"]);
        assert_eq!(plan.keep.len(), 9);
        assert!(plan.delete.iter().all(|i| i.reason == PruneReason::FullCount));
    }

    #[test]
    fn age_pruning_never_touches_the_newest_chain() {
        let now = Utc::now();
        let chain = synthetic(2, now);
        // Everything is at least one day old.
        let plan = prune(&chain, &RetentionWindow::new(10, 1).unwrap(), now);
        let deleted: Vec<_> = plan.delete.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(deleted, vec!["f0i2", "f0i1", "f0"]);
        assert_eq!(plan.keep, vec!["f1", "f1i1", "f1i2"]);
    }

    #[test]
    fn age_pruned_records_take_their_descendants() {
        let now = Utc::now();
        // f0 is 9 days old, its incrementals 8 and 7; only f0 is past the cutoff.
        let chain = synthetic(3, now);
        let window = RetentionWindow { max_full_count: 10, max_age_days: 8 };
        let plan = prune(&chain, &window, now);
        let deleted: Vec<_> = plan.delete.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(deleted, vec!["f0i2", "f0i1", "f0"]);

        let window = RetentionWindow { max_full_count: 10, max_age_days: 9 };
        let plan = prune(&chain, &window, now);
        assert!(plan.is_empty());
    }

    #[test]
    fn pruning_follows_links_when_the_clock_stepped_back() {
        let now = Utc::now();
        let t = |secs: i64| now - ChronoDuration::seconds(10_000 - secs);
        // i2 was written after i1 but stamped earlier.
        let chain = BackupChain::from_records(
            "/backups",
            vec![
                record("f0", ArchiveKind::Full, None, "f0", t(1000)),
                record("i1", ArchiveKind::Incremental, Some("f0"), "f0", t(1200)),
                record("i2", ArchiveKind::Incremental, Some("i1"), "f0", t(1100)),
                record("f1", ArchiveKind::Full, None, "f1", t(2000)),
            ],
        );

        let descendants: Vec<_> = chain.descendants("f0").iter().map(|r| r.name.as_str()).collect();
        assert_eq!(descendants, vec!["i1", "i2"]);

        let plan = prune(&chain, &RetentionWindow::new(1, 0).unwrap(), now);
        let deleted: Vec<_> = plan.delete.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(deleted, vec!["i2", "i1", "f0"]);
        assert_eq!(plan.keep, vec!["f1"]);
    }

    #[test]
    fn young_chains_under_the_count_are_kept() {
        let now = Utc::now();
        let chain = synthetic(2, now);
        let plan = prune(&chain, &RetentionWindow::new(3, 365).unwrap(), now);
        assert!(plan.is_empty());
        assert_eq!(plan.keep.len(), 6);
    }
}
