//! Bucketed, time-based pruning of backup snapshots.
//!
//! Each [`Rule`] keeps one survivor per interval-sized bucket for a number
//! of buckets, walking backward from the newest snapshot. Rules are evaluated
//! finest interval first; whatever falls outside the last bucket of the last
//! rule is removed as well. A `keep_min` floor caps how far deletion may go.
//!
//! Pruning only removes snapshot folders. Store objects they referenced stay
//! until the next garbage collection.

use crate::error::{Error, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Default date format of backup folder names.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H-%M-%S";

/// Keep one snapshot per `interval` for `count` consecutive intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub count: u32,
    pub interval: TimeDelta,
}

impl Rule {
    /// Create a rule; the interval must be positive.
    pub fn new(count: u32, interval: TimeDelta) -> Result<Self> {
        if interval <= TimeDelta::zero() {
            return Err(Error::invalid_rule("Interval must be positive"));
        }
        Ok(Self { count, interval })
    }
}

impl FromStr for Rule {
    type Err = Error;

    /// Parse `COUNT:INTERVAL`, e.g. `14:1d` or `5:1w`.
    fn from_str(s: &str) -> Result<Self> {
        let (count, interval) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_rule(format!("Expected COUNT:INTERVAL, got {}", s)))?;

        let count = count
            .trim()
            .parse()
            .map_err(|_| Error::invalid_rule(format!("Invalid count: {}", count)))?;

        Rule::new(count, parse_interval(interval.trim())?)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}s", self.count, self.interval.num_seconds())
    }
}

/// Parse a number with a unit suffix (`s`, `m`, `h`, `d`, `w`, `y`).
pub fn parse_interval(s: &str) -> Result<TimeDelta> {
    let unit_start = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::invalid_rule(format!("Missing unit in interval: {}", s)))?;
    let (number, unit) = s.split_at(unit_start);

    let number: i64 = number
        .parse()
        .map_err(|_| Error::invalid_rule(format!("Invalid interval: {}", s)))?;

    let unit_seconds = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        "y" => 365 * 24 * 60 * 60,
        other => return Err(Error::invalid_rule(format!("Unknown unit: {}", other))),
    };

    number
        .checked_mul(unit_seconds)
        .and_then(TimeDelta::try_seconds)
        .filter(|d| *d > TimeDelta::zero())
        .ok_or_else(|| Error::invalid_rule(format!("Interval out of range: {}", s)))
}

/// A `chrono` format string used to name and date snapshot folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    format: String,
}

impl Default for DatePattern {
    fn default() -> Self {
        Self {
            format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

impl DatePattern {
    /// Validate a format string.
    pub fn new(format: impl Into<String>) -> Result<Self> {
        let format = format.into();
        if format.is_empty() || StrftimeItems::new(&format).any(|item| item == Item::Error) {
            return Err(Error::configuration(format!("Invalid date format: {:?}", format)));
        }
        Ok(Self { format })
    }

    /// The format string.
    pub fn as_str(&self) -> &str {
        &self.format
    }

    /// Render a timestamp as a folder name.
    pub fn format(&self, date: NaiveDateTime) -> String {
        date.format(&self.format).to_string()
    }

    /// The first date embedded in `name`.
    ///
    /// Every character position is tried in turn; date-only formats are
    /// taken at midnight.
    pub fn find(&self, name: &str) -> Option<NaiveDateTime> {
        name.char_indices()
            .filter(|(_, c)| !matches!(c, '-' | '+') && !c.is_whitespace())
            .find_map(|(i, _)| self.parse_prefix(&name[i..]))
    }

    fn parse_prefix(&self, s: &str) -> Option<NaiveDateTime> {
        if let Ok((date, _)) = NaiveDateTime::parse_and_remainder(s, &self.format) {
            return Some(date);
        }
        NaiveDate::parse_and_remainder(s, &self.format)
            .ok()
            .map(|(date, _)| date.and_time(NaiveTime::MIN))
    }
}

/// A dated snapshot folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub path: PathBuf,
    pub date: NaiveDateTime,
}

/// List the dated snapshot folders of a destination.
///
/// Hidden entries, non-directories and folders without a date are ignored.
pub fn scan(destination: &Path, pattern: &DatePattern) -> Result<Vec<Snapshot>> {
    let mut snapshots = Vec::new();

    for entry in fs::read_dir(destination)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        match pattern.find(name) {
            Some(date) => snapshots.push(Snapshot {
                path: entry.path(),
                date,
            }),
            None => debug!("Ignoring undated folder {}", entry.path().display()),
        }
    }

    Ok(snapshots)
}

/// Snapshots to keep and to delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPlan {
    /// Surviving snapshots, newest first.
    pub keep: Vec<Snapshot>,
    /// Snapshots to remove, oldest first.
    pub delete: Vec<Snapshot>,
}

/// An ordered rule set plus a survivor floor.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    rules: Vec<Rule>,
    keep_min: usize,
}

impl RetentionPolicy {
    /// Create a policy. Rules are reordered by ascending interval.
    pub fn new(mut rules: Vec<Rule>, keep_min: usize) -> Result<Self> {
        if rules.is_empty() {
            return Err(Error::invalid_rule("At least one rule is required"));
        }
        rules.sort_by_key(|rule| rule.interval);
        Ok(Self { rules, keep_min })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn keep_min(&self) -> usize {
        self.keep_min
    }

    /// Decide which snapshots survive. Pure; touches no files.
    ///
    /// Candidates are taken rule by rule, finest interval first, then those
    /// older than every bucket. Within a group the oldest goes first. The
    /// first candidate whose removal would leave `keep_min` or fewer
    /// survivors ends all deletion.
    pub fn plan(&self, mut snapshots: Vec<Snapshot>) -> RetentionPlan {
        snapshots.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.path.cmp(&a.path)));

        let Some(newest) = snapshots.first().map(|s| s.date) else {
            return RetentionPlan::default();
        };

        let mut candidates: Vec<usize> = Vec::new();
        let mut end = newest;

        for rule in &self.rules {
            for _ in 0..rule.count {
                let Some(start) = end.checked_sub_signed(rule.interval) else {
                    break;
                };

                // Newest-first order: the first hit is the bucket's survivor.
                let bucket: Vec<usize> = snapshots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| start < s.date && s.date <= end)
                    .map(|(i, _)| i)
                    .skip(1)
                    .collect();
                candidates.extend(bucket.into_iter().rev());
                end = start;
            }
        }

        // Anything older than the last bucket is outside every rule.
        // Index 0 is the newest snapshot and always survives.
        candidates.extend(
            (1..snapshots.len())
                .rev()
                .filter(|&i| snapshots[i].date <= end),
        );

        let mut marked = vec![false; snapshots.len()];
        let mut survivors = snapshots.len();
        for i in candidates {
            if survivors - 1 <= self.keep_min {
                break;
            }
            marked[i] = true;
            survivors -= 1;
        }

        let mut plan = RetentionPlan::default();
        for (i, snapshot) in snapshots.into_iter().enumerate() {
            if marked[i] {
                plan.delete.push(snapshot);
            } else {
                plan.keep.push(snapshot);
            }
        }
        plan.delete.reverse();
        plan
    }
}

/// Outcome of a prune run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Snapshots kept.
    pub kept: usize,
    /// Snapshots selected for deletion, oldest first.
    pub planned: Vec<PathBuf>,
    /// Snapshots actually removed.
    pub deleted: usize,
    /// Snapshots that could not be removed.
    pub failures: usize,
    /// Whether deletion was enabled.
    pub delete_enabled: bool,
}

/// Scan a destination, plan against `policy` and optionally delete.
///
/// Without `enable_delete` nothing is removed; the report lists what would
/// have been.
pub fn prune(
    destination: &Path,
    policy: &RetentionPolicy,
    pattern: &DatePattern,
    enable_delete: bool,
) -> Result<PruneReport> {
    let plan = policy.plan(scan(destination, pattern)?);

    let mut report = PruneReport {
        kept: plan.keep.len(),
        planned: plan.delete.iter().map(|s| s.path.clone()).collect(),
        delete_enabled: enable_delete,
        ..PruneReport::default()
    };

    if !enable_delete {
        info!(
            "Prune dry run: {} snapshots would be deleted, {} kept",
            report.planned.len(),
            report.kept
        );
        return Ok(report);
    }

    for snapshot in &plan.delete {
        match fs::remove_dir_all(&snapshot.path) {
            Ok(()) => {
                debug!("Deleted snapshot {}", snapshot.path.display());
                report.deleted += 1;
            }
            Err(e) => {
                warn!("Cannot delete snapshot {}: {}", snapshot.path.display(), e);
                report.failures += 1;
            }
        }
    }

    info!(
        "Pruned {} snapshots ({} failures), {} kept",
        report.deleted, report.failures, report.kept
    );
    Ok(report)
}
