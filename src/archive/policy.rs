//! Wall-clock-aligned archive rotation and path naming.
//!
//! Grounded on `original_source/core/archive_policy.c`'s Rotter-compatible
//! chunking: period-aligned boundaries, six naming layouts, three clock
//! sources. Uses `chrono` for broken-down-time arithmetic and
//! `strftime`-style formatting in place of the original's
//! `localtime_r`/`gmtime_r` + `strftime` calls.

use crate::error::{AudynError, Result};
use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveLayout {
    Flat,
    Hierarchy,
    Combo,
    DailyDir,
    Accurate,
    Custom,
}

impl ArchiveLayout {
    pub fn from_str_name(name: &str) -> Option<Self> {
        Some(match name {
            "flat" => Self::Flat,
            "hierarchy" => Self::Hierarchy,
            "combo" => Self::Combo,
            "dailydir" => Self::DailyDir,
            "accurate" => Self::Accurate,
            "custom" => Self::Custom,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveClock {
    LocalTime,
    Utc,
    PtpTai,
}

impl ArchiveClock {
    pub fn from_str_name(name: &str) -> Option<Self> {
        Some(match name {
            "localtime" => Self::LocalTime,
            "utc" => Self::Utc,
            "ptp" | "tai" => Self::PtpTai,
            _ => return None,
        })
    }
}

pub const MIN_ROTATION_PERIOD_SEC: u32 = 0;
pub const MAX_ROTATION_PERIOD_SEC: u32 = 24 * 3600;
pub const DEFAULT_ROTATION_PERIOD_SEC: u32 = 3600;

pub struct ArchiveConfig {
    pub root_dir: PathBuf,
    pub suffix: String,
    pub layout: ArchiveLayout,
    pub custom_format: Option<String>,
    pub rotation_period_sec: u32,
    pub clock_source: ArchiveClock,
    pub create_directories: bool,
}

/// Period-aligned rotation boundary tracker plus path generator.
///
/// Not thread-safe: intended for exclusive use by the worker thread
/// that owns the active sink.
pub struct ArchivePolicy {
    cfg: ArchiveConfig,
    initialized: bool,
    current_period_ns: u64,
    next_boundary_ns: u64,
}

impl ArchivePolicy {
    pub fn new(cfg: ArchiveConfig) -> Result<Self> {
        if cfg.root_dir.as_os_str().is_empty() {
            return Err(AudynError::ConfigInvalid("root_dir is required".into()));
        }
        if cfg.suffix.is_empty() {
            return Err(AudynError::ConfigInvalid("suffix is required".into()));
        }
        if cfg.rotation_period_sec != 0 && cfg.rotation_period_sec > MAX_ROTATION_PERIOD_SEC {
            return Err(AudynError::ConfigInvalid(format!(
                "rotation_period_sec {} exceeds maximum {}",
                cfg.rotation_period_sec, MAX_ROTATION_PERIOD_SEC
            )));
        }
        if cfg.layout == ArchiveLayout::Custom && cfg.custom_format.is_none() {
            return Err(AudynError::ConfigInvalid(
                "custom layout requires custom_format".into(),
            ));
        }

        Ok(Self {
            cfg,
            initialized: false,
            current_period_ns: 0,
            next_boundary_ns: 0,
        })
    }

    fn now_utc(&self, now_ns: u64, clock_source_is_tai: bool) -> DateTime<Utc> {
        if clock_source_is_tai {
            let secs = (now_ns / 1_000_000_000) as i64;
            let nanos = (now_ns % 1_000_000_000) as u32;
            DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_else(|| DateTime::<Utc>::from(UNIX_EPOCH))
        } else {
            DateTime::<Utc>::from(UNIX_EPOCH + std::time::Duration::from_nanos(now_ns))
        }
    }

    fn period_start_ns(&self, now_ns: u64) -> (u64, DateTime<Local>, DateTime<Utc>) {
        let period = self.cfg.rotation_period_sec.max(1) as i64;

        match self.cfg.clock_source {
            ArchiveClock::LocalTime => {
                let local: DateTime<Local> = DateTime::<Local>::from(
                    UNIX_EPOCH + std::time::Duration::from_nanos(now_ns),
                );
                let s = local.hour() as i64 * 3600 + local.minute() as i64 * 60 + local.second() as i64;
                let period_index = s / period;
                let period_start_s = period_index * period;
                let day_start = local.date_naive().and_hms_opt(0, 0, 0).unwrap();
                let period_start_local = day_start + chrono::Duration::seconds(period_start_s);
                let period_start_local = period_start_local
                    .and_local_timezone(Local)
                    .single()
                    .unwrap_or(local);
                let ns = period_start_local.timestamp_nanos_opt().unwrap_or(0) as u64;
                (ns, period_start_local, DateTime::<Utc>::from(period_start_local))
            }
            ArchiveClock::Utc | ArchiveClock::PtpTai => {
                let utc = self.now_utc(now_ns, self.cfg.clock_source == ArchiveClock::PtpTai);
                let s = utc.hour() as i64 * 3600 + utc.minute() as i64 * 60 + utc.second() as i64;
                let period_index = s / period;
                let period_start_s = period_index * period;
                let day_start = utc.date_naive().and_hms_opt(0, 0, 0).unwrap();
                let period_start_utc = day_start + chrono::Duration::seconds(period_start_s);
                let period_start_utc = DateTime::<Utc>::from_naive_utc_and_offset(period_start_utc, Utc);
                let ns = period_start_utc.timestamp_nanos_opt().unwrap_or(0) as u64;
                (ns, DateTime::<Local>::from(period_start_utc), period_start_utc)
            }
        }
    }

    /// True if a new file must be opened: either no file has been
    /// opened yet, or `now_ns` has crossed the boundary recorded by the
    /// last `advance()`.
    pub fn should_rotate(&self, now_ns: u64) -> bool {
        if !self.initialized {
            return true;
        }
        if self.cfg.rotation_period_sec == 0 {
            return false;
        }
        now_ns >= self.next_boundary_ns
    }

    /// Generates the path for the file that should be opened at
    /// `now_ns`, creating parent directories if configured to.
    pub fn next_path(&mut self, now_ns: u64) -> Result<PathBuf> {
        let (period_start_ns, period_start_local, period_start_utc) = self.period_start_ns(now_ns);
        self.current_period_ns = period_start_ns;
        self.next_boundary_ns = if self.cfg.rotation_period_sec == 0 {
            u64::MAX
        } else {
            period_start_ns + self.cfg.rotation_period_sec as u64 * 1_000_000_000
        };

        let (y, mo, d, h, mi, s) = match self.cfg.clock_source {
            ArchiveClock::LocalTime => (
                period_start_local.year(),
                period_start_local.month(),
                period_start_local.day(),
                period_start_local.hour(),
                period_start_local.minute(),
                period_start_local.second(),
            ),
            ArchiveClock::Utc | ArchiveClock::PtpTai => (
                period_start_utc.year(),
                period_start_utc.month(),
                period_start_utc.day(),
                period_start_utc.hour(),
                period_start_utc.minute(),
                period_start_utc.second(),
            ),
        };

        let suffix = &self.cfg.suffix;
        let rel: PathBuf = match self.cfg.layout {
            ArchiveLayout::Flat => PathBuf::from(format!("{y:04}-{mo:02}-{d:02}-{h:02}.{suffix}")),
            ArchiveLayout::Hierarchy => PathBuf::from(format!(
                "{y:04}/{mo:02}/{d:02}/{h:02}/archive.{suffix}"
            )),
            ArchiveLayout::Combo => PathBuf::from(format!(
                "{y:04}/{mo:02}/{d:02}/{h:02}/{y:04}-{mo:02}-{d:02}-{h:02}.{suffix}"
            )),
            ArchiveLayout::DailyDir => PathBuf::from(format!(
                "{y:04}-{mo:02}-{d:02}/{y:04}-{mo:02}-{d:02}-{h:02}.{suffix}"
            )),
            ArchiveLayout::Accurate => {
                let now = self.now_utc(now_ns, self.cfg.clock_source == ArchiveClock::PtpTai);
                let cc = now.timestamp_subsec_millis() / 10;
                PathBuf::from(format!(
                    "{y:04}-{mo:02}-{d:02}/{y:04}-{mo:02}-{d:02}-{h:02}-{mi:02}-{s:02}-{cc:02}.{suffix}"
                ))
            }
            ArchiveLayout::Custom => {
                let fmt = self.cfg.custom_format.as_deref().unwrap_or("");
                let rendered = match self.cfg.clock_source {
                    ArchiveClock::LocalTime => period_start_local.format(fmt).to_string(),
                    ArchiveClock::Utc | ArchiveClock::PtpTai => period_start_utc.format(fmt).to_string(),
                };
                PathBuf::from(format!("{rendered}.{suffix}"))
            }
        };

        let full = self.cfg.root_dir.join(rel);

        if self.cfg.create_directories {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AudynError::RotationFailure(format!(
                        "failed to create archive directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        Ok(full)
    }

    /// Commits the boundary computed by the last `next_path` call;
    /// must be called after successfully opening the returned path.
    pub fn advance(&mut self) {
        self.initialized = true;
    }

    pub fn next_boundary_ns(&self) -> u64 {
        self.next_boundary_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(layout: ArchiveLayout, root: &std::path::Path) -> ArchiveConfig {
        ArchiveConfig {
            root_dir: root.to_path_buf(),
            suffix: "wav".into(),
            layout,
            custom_format: None,
            rotation_period_sec: 3600,
            clock_source: ArchiveClock::Utc,
            create_directories: true,
        }
    }

    #[test]
    fn first_call_always_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let policy = ArchivePolicy::new(cfg(ArchiveLayout::Flat, dir.path())).unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64;
        assert!(policy.should_rotate(now));
    }

    #[test]
    fn zero_period_disables_rotation_after_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cfg(ArchiveLayout::Flat, dir.path());
        c.rotation_period_sec = 0;
        let mut policy = ArchivePolicy::new(c).unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64;
        assert!(policy.should_rotate(now));
        let _ = policy.next_path(now).unwrap();
        policy.advance();
        assert!(!policy.should_rotate(now + 1_000_000_000_000));
        assert_eq!(policy.next_boundary_ns(), u64::MAX);
    }

    #[test]
    fn flat_layout_matches_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = ArchivePolicy::new(cfg(ArchiveLayout::Flat, dir.path())).unwrap();
        // 2026-01-02 03:00:00 UTC
        let now = 1_767_322_800u64 * 1_000_000_000;
        let path = policy.next_path(now).unwrap();
        assert_eq!(path, dir.path().join("2026-01-02-03.wav"));
    }

    #[test]
    fn hierarchy_layout_matches_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cfg(ArchiveLayout::Hierarchy, dir.path());
        c.suffix = "opus".into();
        let mut policy = ArchivePolicy::new(c).unwrap();
        let now = 1_767_322_800u64 * 1_000_000_000;
        let path = policy.next_path(now).unwrap();
        assert_eq!(path, dir.path().join("2026/01/02/03/archive.opus"));
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn invalid_rotation_period_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cfg(ArchiveLayout::Flat, dir.path());
        c.rotation_period_sec = MAX_ROTATION_PERIOD_SEC + 1;
        assert!(ArchivePolicy::new(c).is_err());
    }

    #[test]
    fn custom_layout_without_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let c = cfg(ArchiveLayout::Custom, dir.path());
        assert!(ArchivePolicy::new(c).is_err());
    }

    #[test]
    fn should_rotate_is_false_immediately_after_advance() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = ArchivePolicy::new(cfg(ArchiveLayout::Flat, dir.path())).unwrap();
        let now = 1_767_322_800u64 * 1_000_000_000;
        let _ = policy.next_path(now).unwrap();
        policy.advance();
        assert!(!policy.should_rotate(now + 1000));
    }
}
