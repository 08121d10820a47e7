/*!
Retention pruning of snapshot directories.

Snapshot directories are named `<timestamp>-<suffix>` where the timestamp is
compact RFC 3339 (`20221115T232711Z`). Directories older than the retention
window are deleted unless the pre-remove check vetoes them.
*/

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Result, SnapkeepError};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Length of `TIMESTAMP_FORMAT` output plus one zone byte (`Z`, `+`, `-`)
const TIMESTAMP_PREFIX_LEN: usize = 16;

/// Unix seconds of 0001-01-01T00:00:00Z, the zero instant
const ZERO_UNIX_SECONDS: i64 = -62_135_596_800;

/// Source of the reference time for retention decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Hook consulted before deleting a snapshot; an error vetoes the deletion.
pub type PreRemoveCheck = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Snapshot directory with its parsed creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    /// `None` only for entries constructed without a timestamp; those are
    /// never selected for deletion.
    pub timestamp: Option<DateTime<Utc>>,
    pub name: String,
}

/// Parse a `<timestamp>-<suffix>` directory name.
///
/// The suffix starts at the first dash after the zone designator, so a
/// negative offset such as `-0200` stays part of the timestamp.
pub fn parse_name(name: &str) -> Result<SnapshotInfo> {
    let split = name
        .get(TIMESTAMP_PREFIX_LEN..)
        .and_then(|rest| rest.find('-'))
        .map(|i| TIMESTAMP_PREFIX_LEN + i)
        .ok_or_else(|| SnapkeepError::invalid_name(name))?;
    let raw = &name[..split];

    let timestamp = parse_timestamp(raw)
        .map_err(|e| SnapkeepError::invalid_name(format!("{name}: {e}")))?;

    Ok(SnapshotInfo {
        timestamp: Some(timestamp),
        name: name.to_string(),
    })
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    if let Some(local) = raw.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(local, TIMESTAMP_FORMAT)?;
        return Ok(Utc.from_utc_datetime(&naive));
    }

    let parsed = DateTime::parse_from_str(raw, &format!("{TIMESTAMP_FORMAT}%z"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn is_zero_instant(ts: DateTime<Utc>) -> bool {
    ts.timestamp() == ZERO_UNIX_SECONDS && ts.timestamp_subsec_nanos() == 0
}

/// Options for a single [`prune`] run
#[derive(Clone)]
pub struct PruneOptions {
    /// Directory containing the snapshot directories
    pub root: PathBuf,
    /// Keep all snapshots within this interval; must not be negative
    pub keep_within: Duration,
    pub pre_remove_check: Option<PreRemoveCheck>,
    pub clock: Arc<dyn Clock>,
}

impl PruneOptions {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            keep_within: Duration::zero(),
            pre_remove_check: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_keep_within(mut self, keep_within: Duration) -> Self {
        self.keep_within = keep_within;
        self
    }

    pub fn with_pre_remove_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        self.pre_remove_check = Some(Arc::new(check));
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.keep_within < Duration::zero() {
            return Err(SnapkeepError::validation(
                "keep_within must be larger than or equal to zero",
            ));
        }
        Ok(())
    }

    fn keep(&self, now: DateTime<Utc>, timestamp: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = timestamp else {
            return true;
        };

        if is_zero_instant(ts) || now < ts {
            return true;
        }

        // The window boundary itself is still kept.
        match ts.checked_add_signed(self.keep_within) {
            Some(until) => now <= until,
            None => true,
        }
    }

    /// Entries whose timestamp falls outside the retention window.
    pub fn select_for_deletion(&self, snapshots: &[SnapshotInfo]) -> Vec<SnapshotInfo> {
        let now = self.clock.now();
        snapshots
            .iter()
            .filter(|info| !self.keep(now, info.timestamp))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for PruneOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PruneOptions")
            .field("root", &self.root)
            .field("keep_within", &self.keep_within)
            .field("pre_remove_check", &self.pre_remove_check.is_some())
            .finish()
    }
}

/// What a prune run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Snapshots removed from disk
    pub deleted: Vec<String>,
    /// Eligible snapshots kept because the pre-remove check objected
    pub vetoed: Vec<String>,
    /// Directories ignored because their name did not parse
    pub skipped: Vec<String>,
}

/// Snapshot directories below `root`, sorted by timestamp.
///
/// Returns parsed entries and the names of directories that did not parse.
pub fn list_snapshots<P: AsRef<Path>>(root: P) -> Result<(Vec<SnapshotInfo>, Vec<String>)> {
    let mut snapshots = Vec::new();
    let mut invalid = Vec::new();

    for entry in fs::read_dir(root.as_ref())? {
        let entry = entry?;

        match entry.file_type() {
            Ok(ft) if ft.is_dir() => {}
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Ignoring unreadable entry");
                continue;
            }
        }

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %entry.path().display(), "Ignoring directory with non-UTF-8 name");
            invalid.push(entry.file_name().to_string_lossy().into_owned());
            continue;
        };

        match parse_name(&name) {
            Ok(info) => snapshots.push(info),
            Err(e) => {
                warn!(directory = %name, error = %e, "Ignoring directory");
                invalid.push(name);
            }
        }
    }

    snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
    invalid.sort();

    Ok((snapshots, invalid))
}

fn check_canceled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SnapkeepError::Canceled);
    }
    Ok(())
}

/// Delete snapshots outside the retention window.
///
/// Unparsable names and vetoed snapshots are logged and skipped. A failed
/// deletion aborts the run. Cancellation is observed after listing and after
/// every deletion.
pub fn prune(options: &PruneOptions, cancel: &CancellationToken) -> Result<PruneReport> {
    options.validate()?;

    let (snapshots, skipped) = list_snapshots(&options.root)?;
    check_canceled(cancel)?;

    let mut report = PruneReport {
        skipped,
        ..PruneReport::default()
    };

    for info in options.select_for_deletion(&snapshots) {
        if let Some(check) = &options.pre_remove_check {
            if let Err(e) = check(&info.name) {
                info!(snapshot = %info.name, reason = %e, "Not removing snapshot");
                report.vetoed.push(info.name);
                continue;
            }
        }

        info!(snapshot = %info.name, "Deleting snapshot");

        let path = options.root.join(&info.name);
        fs::remove_dir_all(&path)?;

        #[cfg(feature = "metrics")]
        crate::observability::SnapkeepMetrics::global().record_pruned();

        report.deleted.push(info.name);
        check_canceled(cancel)?;
    }

    debug!(
        deleted = report.deleted.len(),
        vetoed = report.vetoed.len(),
        skipped = report.skipped.len(),
        "Prune finished"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn info(name: &str, ts: DateTime<Utc>) -> SnapshotInfo {
        SnapshotInfo {
            timestamp: Some(ts),
            name: name.to_string(),
        }
    }

    fn mkdirs(root: &Path, names: &[&str]) {
        for name in names {
            fs::create_dir(root.join(name)).unwrap();
        }
    }

    fn remaining(root: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_parse_name() {
        let parsed = parse_name("20221115T232711Z-7ef1661077569104").unwrap();
        assert_eq!(parsed.timestamp, Some(utc(2022, 11, 15, 23, 27, 11)));
        assert_eq!(parsed.name, "20221115T232711Z-7ef1661077569104");

        let parsed = parse_name("20221110T230339+0000-c").unwrap();
        assert_eq!(parsed.timestamp, Some(utc(2022, 11, 10, 23, 3, 39)));

        let parsed = parse_name("20221110T230339+0200-c").unwrap();
        assert_eq!(parsed.timestamp, Some(utc(2022, 11, 10, 21, 3, 39)));

        let parsed = parse_name("20221110T230339-0200-c").unwrap();
        assert_eq!(parsed.timestamp, Some(utc(2022, 11, 11, 1, 3, 39)));
        assert_eq!(parsed.name, "20221110T230339-0200-c");

        let parsed = parse_name("20221110T230339-0130-with-dashes").unwrap();
        assert_eq!(parsed.timestamp, Some(utc(2022, 11, 11, 0, 33, 39)));
    }

    #[test]
    fn test_parse_name_invalid() {
        for name in [
            "",
            "bad",
            "bad-more-bad",
            "20221115T232711-x",
            "20221315T000000Z-x",
            "20221110T230339-0200",
            "2022-11-10T23:03:39Z-x",
        ] {
            let err = parse_name(name).unwrap_err();
            assert!(matches!(err, SnapkeepError::InvalidName(_)), "{name}: {err}");
        }
    }

    #[test]
    fn test_select_for_deletion_empty_and_untimed() {
        let opts = PruneOptions::new("/nonexistent");
        assert!(opts.select_for_deletion(&[]).is_empty());

        let untimed = SnapshotInfo {
            timestamp: None,
            name: "x".to_string(),
        };
        assert!(opts.select_for_deletion(&[untimed.clone(), untimed]).is_empty());
    }

    #[test]
    fn test_zero_timestamp_is_kept() {
        let zero = parse_name("00010101T000000Z-zero").unwrap();
        assert_eq!(zero.timestamp, Some(utc(1, 1, 1, 0, 0, 0)));

        let opts = PruneOptions::new("/nonexistent")
            .with_keep_within(Duration::hours(1))
            .with_clock(FixedClock(utc(2024, 3, 1, 12, 0, 0)));
        let after_zero = info("after-zero", utc(1, 1, 1, 0, 0, 1));

        let selected = opts.select_for_deletion(&[zero, after_zero.clone()]);
        assert_eq!(selected, vec![after_zero]);
    }

    #[test]
    fn test_prune_keeps_zero_timestamp_directory() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(temp_dir.path(), &["00010101T000000Z-zero", "20000101T000000Z-old"]);

        let opts = PruneOptions::new(temp_dir.path())
            .with_keep_within(Duration::hours(1))
            .with_clock(FixedClock(Utc::now()));
        let report = prune(&opts, &CancellationToken::new()).unwrap();

        assert_eq!(report.deleted, vec!["20000101T000000Z-old"]);
        assert_eq!(remaining(temp_dir.path()), vec!["00010101T000000Z-zero"]);
    }

    #[test]
    fn test_select_for_deletion_keep_within() {
        let opts = PruneOptions::new("/nonexistent")
            .with_keep_within(Duration::hours(24))
            .with_clock(FixedClock(utc(2020, 8, 15, 0, 0, 0)));

        let input = vec![
            info("1990", utc(1990, 1, 1, 0, 0, 0)),
            info("13:00", utc(2020, 8, 15, 13, 0, 0)),
            info("future", utc(2020, 9, 1, 0, 0, 0)),
            info("previous day", utc(2020, 8, 13, 23, 45, 0)),
            info("within", utc(2020, 8, 14, 1, 0, 0)),
        ];

        let selected: Vec<_> = opts
            .select_for_deletion(&input)
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(selected, vec!["1990", "previous day"]);
    }

    #[test]
    fn test_retention_boundary() {
        let now = utc(2024, 3, 1, 12, 0, 0);
        let opts = PruneOptions::new("/nonexistent")
            .with_keep_within(Duration::hours(1))
            .with_clock(FixedClock(now));

        let exact = info("exact", now - Duration::hours(1));
        let older = info("older", now - Duration::hours(1) - Duration::nanoseconds(1));
        let future = info("future", now + Duration::minutes(5));

        let selected = opts.select_for_deletion(&[exact, older.clone(), future]);
        assert_eq!(selected, vec![older]);
    }

    #[test]
    fn test_negative_keep_within_rejected() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(temp_dir.path(), &["20000101T000000Z-a"]);

        let opts = PruneOptions::new(temp_dir.path()).with_keep_within(Duration::seconds(-1));
        let err = prune(&opts, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SnapkeepError::Validation(_)));
        assert_eq!(remaining(temp_dir.path()), vec!["20000101T000000Z-a"]);
    }

    #[test]
    fn test_prune_empty_root() {
        let temp_dir = TempDir::new().unwrap();
        let report = prune(&PruneOptions::new(temp_dir.path()), &CancellationToken::new()).unwrap();
        assert_eq!(report, PruneReport::default());
    }

    #[test]
    fn test_prune_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let opts = PruneOptions::new(temp_dir.path().join("missing"));
        let err = prune(&opts, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SnapkeepError::Io(_)));
    }

    #[test]
    fn test_prune_all_skips_invalid_names() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(
            temp_dir.path(),
            &["20221110T230339Z-7aac2bc56f45ca8e", "bad", "20221115T232711Z-7ef1661077569104"],
        );
        fs::write(temp_dir.path().join("20000101T000000Z-file"), b"not a dir").unwrap();

        let opts = PruneOptions::new(temp_dir.path()).with_clock(FixedClock(utc(2023, 1, 1, 0, 0, 0)));
        let report = prune(&opts, &CancellationToken::new()).unwrap();

        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.skipped, vec!["bad"]);
        assert_eq!(remaining(temp_dir.path()), vec!["20000101T000000Z-file", "bad"]);
    }

    #[test]
    fn test_prune_selective_and_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(
            temp_dir.path(),
            &[
                "20200101T000000Z-a",
                "20211110T230339Z-b",
                "20221110T230339+0000-c",
                "20221115T232711Z-d",
            ],
        );

        let opts = PruneOptions::new(temp_dir.path())
            .with_keep_within(Duration::days(10))
            .with_clock(FixedClock(utc(2022, 11, 20, 0, 0, 0)));

        let report = prune(&opts, &CancellationToken::new()).unwrap();
        assert_eq!(report.deleted, vec!["20200101T000000Z-a", "20211110T230339Z-b"]);
        assert_eq!(
            remaining(temp_dir.path()),
            vec!["20221110T230339+0000-c", "20221115T232711Z-d"]
        );

        let second = prune(&opts, &CancellationToken::new()).unwrap();
        assert!(second.deleted.is_empty());
        assert_eq!(remaining(temp_dir.path()).len(), 2);
    }

    #[test]
    fn test_prune_veto() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(
            temp_dir.path(),
            &["20181018T000000Z-a", "20191019T000000Z-b", "20201020T000000Z-c"],
        );
        fs::write(temp_dir.path().join("20191019T000000Z-b/chunk"), b"data").unwrap();

        let opts = PruneOptions::new(temp_dir.path())
            .with_clock(FixedClock(utc(2021, 1, 1, 0, 0, 0)))
            .with_pre_remove_check(|name| {
                if name == "20191019T000000Z-b" {
                    Err(SnapkeepError::SnapshotInUse {
                        name: name.to_string(),
                        id: "d1".to_string(),
                    })
                } else {
                    Ok(())
                }
            });

        let report = prune(&opts, &CancellationToken::new()).unwrap();
        assert_eq!(report.vetoed, vec!["20191019T000000Z-b"]);
        assert_eq!(report.deleted, vec!["20181018T000000Z-a", "20201020T000000Z-c"]);
        assert_eq!(remaining(temp_dir.path()), vec!["20191019T000000Z-b"]);
    }

    #[test]
    fn test_prune_canceled_before_deleting() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(temp_dir.path(), &["20000101T000000Z-a", "20000102T000000Z-b"]);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = prune(&PruneOptions::new(temp_dir.path()), &cancel).unwrap_err();
        assert!(matches!(err, SnapkeepError::Canceled));
        assert_eq!(remaining(temp_dir.path()).len(), 2);
    }

    #[test]
    fn test_prune_canceled_after_first_deletion() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(temp_dir.path(), &["20000101T000000Z-a", "20000102T000000Z-b"]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let opts = PruneOptions::new(temp_dir.path()).with_pre_remove_check(move |_| {
            // Cancel while the first deletion is in progress.
            trigger.cancel();
            Ok(())
        });

        let err = prune(&opts, &cancel).unwrap_err();
        assert!(matches!(err, SnapkeepError::Canceled));
        assert_eq!(remaining(temp_dir.path()), vec!["20000102T000000Z-b"]);
    }

    #[test]
    fn test_list_snapshots_sorted() {
        let temp_dir = TempDir::new().unwrap();
        mkdirs(
            temp_dir.path(),
            &["20221115T232711Z-d", "junk", "20200101T000000Z-a"],
        );

        let (snapshots, invalid) = list_snapshots(temp_dir.path()).unwrap();
        let names: Vec<_> = snapshots.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["20200101T000000Z-a", "20221115T232711Z-d"]);
        assert_eq!(invalid, vec!["junk"]);
    }
}
