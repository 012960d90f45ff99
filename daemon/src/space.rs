// Copyright 2025 Oxide Computer Company

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use slog::{warn, Logger};

use hoard_common::PoolDrive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveSpace {
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/**
 * Free/used space per pool drive at one point in time, in pool
 * configuration order.  The order matters: it is the tie-break for the
 * selection policy's sorts.
 */
#[derive(Debug, Clone, Default)]
pub struct SpaceReport {
    entries: Vec<(PathBuf, DriveSpace)>,
}

impl SpaceReport {
    pub fn new(entries: Vec<(PathBuf, DriveSpace)>) -> SpaceReport {
        SpaceReport { entries }
    }

    pub fn get(&self, drive: &Path) -> Option<DriveSpace> {
        self.entries
            .iter()
            .find(|(p, _)| p == drive)
            .map(|(_, s)| *s)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PathBuf, DriveSpace)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub trait SpaceSource: Send + Sync {
    fn query(&self, drive: &Path) -> Result<DriveSpace>;
}

/// Direct statvfs(3) query; no subprocess involved.
pub struct StatvfsSource;

impl SpaceSource for StatvfsSource {
    fn query(&self, drive: &Path) -> Result<DriveSpace> {
        let c = CString::new(drive.as_os_str().as_bytes())
            .map_err(|e| anyhow!("bad path {:?}: {}", drive, e))?;
        let mut out = MaybeUninit::<libc::statvfs>::zeroed();
        let r = unsafe { libc::statvfs(c.as_ptr(), out.as_mut_ptr()) };
        if r != 0 {
            return Err(anyhow!(
                "statvfs {:?}: {}",
                drive,
                std::io::Error::last_os_error()
            ));
        }
        let vfs = unsafe { out.assume_init() };

        let frsize = vfs.f_frsize as u64;
        let used = (vfs.f_blocks as u64).saturating_sub(vfs.f_bfree as u64)
            * frsize;
        let available = vfs.f_bavail as u64 * frsize;

        Ok(DriveSpace {
            used_bytes: used,
            available_bytes: available,
        })
    }
}

/**
 * Cached space observations for the whole pool.  One report is shared
 * by every draft for `cache_ttl`; a drive whose query fails is left
 * out of the report and therefore out of any draft until the next
 * refresh.
 */
pub struct SpaceTracker {
    log: Logger,
    drives: Vec<PoolDrive>,
    source: Box<dyn SpaceSource>,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, SpaceReport)>>,
}

impl SpaceTracker {
    pub fn new(
        log: Logger,
        drives: Vec<PoolDrive>,
        source: Box<dyn SpaceSource>,
        cache_ttl: Duration,
    ) -> SpaceTracker {
        SpaceTracker {
            log,
            drives,
            source,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn report(&self) -> SpaceReport {
        let mut cache = self.cache.lock().unwrap();
        if let Some((t, report)) = cache.as_ref() {
            if t.elapsed() < self.cache_ttl {
                return report.clone();
            }
        }

        let report = self.refresh();
        *cache = Some((Instant::now(), report.clone()));
        report
    }

    fn refresh(&self) -> SpaceReport {
        let mut entries = Vec::with_capacity(self.drives.len());
        for d in &self.drives {
            match self.source.query(&d.path) {
                Ok(mut space) => {
                    /*
                     * The configured reserve is not usable space as far
                     * as placement is concerned.
                     */
                    space.available_bytes =
                        space.available_bytes.saturating_sub(d.min_free);
                    entries.push((d.path.clone(), space));
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "cannot query space for {:?}: {:#}", d.path, e
                    );
                }
            }
        }
        SpaceReport::new(entries)
    }

    pub fn invalidate(&self) {
        *self.cache.lock().unwrap() = None;
    }

    /**
     * Pool-wide (total, free) in bytes, for the Samba dfree helper.
     * Unlike `report`, the reserve is not subtracted here; dfree
     * describes the filesystems, not placement policy.
     */
    pub fn pool_totals(&self) -> (u64, u64) {
        let mut total = 0u64;
        let mut free = 0u64;
        for d in &self.drives {
            match self.source.query(&d.path) {
                Ok(space) => {
                    total += space.used_bytes + space.available_bytes;
                    free += space.available_bytes;
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "cannot query space for {:?}: {:#}", d.path, e
                    );
                }
            }
        }
        (total, free)
    }
}

#[cfg(test)]
pub struct FakeSpaceSource {
    spaces: Mutex<std::collections::BTreeMap<PathBuf, DriveSpace>>,
}

#[cfg(test)]
impl FakeSpaceSource {
    pub fn new() -> FakeSpaceSource {
        FakeSpaceSource {
            spaces: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    pub fn set(&self, drive: &Path, used: u64, available: u64) {
        self.spaces.lock().unwrap().insert(
            drive.to_path_buf(),
            DriveSpace {
                used_bytes: used,
                available_bytes: available,
            },
        );
    }
}

#[cfg(test)]
impl SpaceSource for FakeSpaceSource {
    fn query(&self, drive: &Path) -> Result<DriveSpace> {
        self.spaces
            .lock()
            .unwrap()
            .get(drive)
            .copied()
            .ok_or_else(|| anyhow!("no such drive {:?}", drive))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hoard_common::build_logger;
    use std::sync::Arc;

    fn csl() -> Logger {
        build_logger()
    }

    fn drive(path: &str, min_free: u64) -> PoolDrive {
        PoolDrive {
            path: PathBuf::from(path),
            min_free,
        }
    }

    #[test]
    fn reserve_subtracted_and_order_preserved() {
        let source = FakeSpaceSource::new();
        source.set(Path::new("/mnt/b"), 100, 1000);
        source.set(Path::new("/mnt/a"), 200, 2000);

        let tracker = SpaceTracker::new(
            csl(),
            vec![drive("/mnt/b", 300), drive("/mnt/a", 0)],
            Box::new(source),
            Duration::ZERO,
        );

        let report = tracker.report();
        let entries: Vec<_> = report.iter().collect();
        // Configuration order, not path order.
        assert_eq!(entries[0].0, PathBuf::from("/mnt/b"));
        assert_eq!(entries[0].1.available_bytes, 700);
        assert_eq!(entries[1].0, PathBuf::from("/mnt/a"));
        assert_eq!(entries[1].1.available_bytes, 2000);
    }

    #[test]
    fn failed_drive_excluded_from_report() {
        let source = FakeSpaceSource::new();
        source.set(Path::new("/mnt/a"), 1, 1);

        let tracker = SpaceTracker::new(
            csl(),
            vec![drive("/mnt/a", 0), drive("/mnt/broken", 0)],
            Box::new(source),
            Duration::ZERO,
        );

        let report = tracker.report();
        assert!(report.get(Path::new("/mnt/a")).is_some());
        assert!(report.get(Path::new("/mnt/broken")).is_none());
    }

    #[test]
    fn report_cached_within_ttl() {
        let source = Arc::new(FakeSpaceSource::new());
        source.set(Path::new("/mnt/a"), 100, 1000);

        struct Shared(Arc<FakeSpaceSource>);
        impl SpaceSource for Shared {
            fn query(&self, drive: &Path) -> Result<DriveSpace> {
                self.0.query(drive)
            }
        }

        let tracker = SpaceTracker::new(
            csl(),
            vec![drive("/mnt/a", 0)],
            Box::new(Shared(Arc::clone(&source))),
            Duration::from_secs(3600),
        );

        let first = tracker.report();
        source.set(Path::new("/mnt/a"), 999, 1);
        let second = tracker.report();
        assert_eq!(
            first.get(Path::new("/mnt/a")),
            second.get(Path::new("/mnt/a"))
        );

        tracker.invalidate();
        let third = tracker.report();
        assert_eq!(
            third.get(Path::new("/mnt/a")).unwrap().available_bytes,
            1
        );
    }

    #[test]
    fn pool_totals_sum_all_drives() {
        let source = FakeSpaceSource::new();
        source.set(Path::new("/mnt/a"), 100, 900);
        source.set(Path::new("/mnt/b"), 50, 450);

        let tracker = SpaceTracker::new(
            csl(),
            // The reserve must not affect dfree output.
            vec![drive("/mnt/a", 500), drive("/mnt/b", 0)],
            Box::new(source),
            Duration::ZERO,
        );

        let (total, free) = tracker.pool_totals();
        assert_eq!(total, 1000 + 500);
        assert_eq!(free, 900 + 450);
    }
}
