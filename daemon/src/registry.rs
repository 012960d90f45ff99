// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use slog::{crit, info, Logger};

/**
 * Health of one pool drive, as last persisted.
 *
 * `GoneFsckPending` doubles as the "absence acknowledged" marker for a
 * drive the daemon noticed missing on its own: while a drive sits in
 * either gone state, the repair machinery will not re-create copies
 * that lived on it.  `GoneAcknowledged` is the operator saying the same
 * thing ahead of time.  `Returned` is sticky until the drive disappears
 * again, so that a re-run of an interrupted cycle stays a no-op.
 */
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    #[default]
    Owned,
    GoneAcknowledged,
    GoneFsckPending,
    Returned,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DriveRecord {
    /// Filesystem UUID we expect to find mounted at this path.  None
    /// for sentinel-marked remote mounts, which carry no UUID.
    pub expected_uuid: Option<String>,

    #[serde(default)]
    pub state: DriveState,
}

/**
 * Durable registry of drive definitions and health states, backed by a
 * JSON datafile.  Every mutation is flushed before the lock is
 * released, so a transition can be observed stale but never lost.
 */
pub struct Registry {
    log: Logger,
    conf_path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Serialize, Deserialize, Default)]
struct Inner {
    drives: BTreeMap<PathBuf, DriveRecord>,
}

impl Registry {
    pub fn open(log: Logger, path: &Path) -> Result<Registry> {
        let inner = match hoard_common::read_json_maybe(path) {
            Ok(Some(inner)) => inner,
            Ok(None) => Inner::default(),
            Err(e) => {
                bail!("failed to load registry {:?}: {:?}", path, e)
            }
        };

        Ok(Registry {
            log,
            conf_path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    /**
     * Store the registry into the JSON file.
     */
    fn store(&self, inner: MutexGuard<Inner>) {
        loop {
            match hoard_common::write_json(&self.conf_path, &*inner) {
                Ok(()) => return,
                Err(e) => {
                    /*
                     * Losing a state transition would be a correctness
                     * regression, so keep trying.
                     */
                    crit!(
                        self.log,
                        "could not write registry {:?} (will retry): {:?}",
                        &self.conf_path,
                        e
                    );
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
            }
        }
    }

    pub fn expected_uuid(&self, drive: &Path) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .drives
            .get(drive)
            .and_then(|r| r.expected_uuid.clone())
    }

    pub fn state(&self, drive: &Path) -> DriveState {
        self.inner
            .lock()
            .unwrap()
            .drives
            .get(drive)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub fn record(&self, drive: &Path) -> Option<DriveRecord> {
        self.inner.lock().unwrap().drives.get(drive).cloned()
    }

    pub fn drives(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().drives.keys().cloned().collect()
    }

    /**
     * Start tracking a drive with an empty record.  Used for mounts
     * that carry no UUID (sentinel-marked remote filesystems), which
     * still need health-state bookkeeping.
     */
    pub fn ensure_record(&self, drive: &Path) {
        let mut inner = self.inner.lock().unwrap();
        if inner.drives.contains_key(drive) {
            return;
        }
        info!(self.log, "tracking new drive {:?}", drive);
        inner
            .drives
            .insert(drive.to_path_buf(), DriveRecord::default());
        self.store(inner);
    }

    /**
     * Register (or re-register) the UUID we expect at this mount point.
     */
    pub fn register_uuid(&self, drive: &Path, uuid: &str) {
        let mut inner = self.inner.lock().unwrap();
        let r = inner.drives.entry(drive.to_path_buf()).or_default();
        info!(
            self.log,
            "drive {:?} expected UUID: {:?} -> {:?}",
            drive,
            r.expected_uuid,
            uuid
        );
        r.expected_uuid = Some(uuid.to_string());
        self.store(inner);
    }

    /**
     * Drop a stale UUID expectation, keeping the drive record.  Used
     * when a sentinel-marked remote mount turns out to have a UUID
     * registered for it.
     */
    pub fn forget_uuid(&self, drive: &Path) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.drives.get_mut(drive) {
            if r.expected_uuid.is_none() {
                return;
            }
            info!(
                self.log,
                "removing stale UUID {:?} for remote mount {:?}",
                r.expected_uuid,
                drive
            );
            r.expected_uuid = None;
            self.store(inner);
        }
    }

    pub fn set_state(&self, drive: &Path, nstate: DriveState) {
        let mut inner = self.inner.lock().unwrap();
        let r = inner.drives.entry(drive.to_path_buf()).or_default();
        if r.state == nstate {
            return;
        }
        info!(
            self.log,
            "drive {:?} state: {:?} -> {:?}", drive, r.state, nstate
        );
        r.state = nstate;
        self.store(inner);
    }

    /**
     * The operator says this drive is permanently gone: delete every
     * trace of it.
     */
    pub fn remove_drive(&self, drive: &Path) {
        let mut inner = self.inner.lock().unwrap();
        if inner.drives.remove(drive).is_some() {
            info!(self.log, "removed drive {:?} from registry", drive);
            self.store(inner);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hoard_common::build_logger;

    fn csl() -> Logger {
        build_logger()
    }

    #[test]
    fn registry_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        {
            let reg = Registry::open(csl(), &path).unwrap();
            reg.register_uuid(Path::new("/mnt/a"), "uuid-a");
            reg.set_state(
                Path::new("/mnt/a"),
                DriveState::GoneFsckPending,
            );
        }

        let reg = Registry::open(csl(), &path).unwrap();
        assert_eq!(
            reg.expected_uuid(Path::new("/mnt/a")).as_deref(),
            Some("uuid-a")
        );
        assert_eq!(
            reg.state(Path::new("/mnt/a")),
            DriveState::GoneFsckPending
        );

        // Unknown drives read back as healthy and unregistered.
        assert_eq!(reg.state(Path::new("/mnt/b")), DriveState::Owned);
        assert!(reg.expected_uuid(Path::new("/mnt/b")).is_none());
    }

    #[test]
    fn remove_drive_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let reg = Registry::open(csl(), &path).unwrap();
        reg.register_uuid(Path::new("/mnt/a"), "uuid-a");
        reg.set_state(Path::new("/mnt/a"), DriveState::GoneAcknowledged);
        reg.remove_drive(Path::new("/mnt/a"));

        assert!(reg.record(Path::new("/mnt/a")).is_none());
        assert!(reg.drives().is_empty());
    }

    #[test]
    fn forget_uuid_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let reg = Registry::open(csl(), &path).unwrap();
        reg.register_uuid(Path::new("/mnt/a"), "uuid-a");
        reg.forget_uuid(Path::new("/mnt/a"));

        let rec = reg.record(Path::new("/mnt/a")).unwrap();
        assert!(rec.expected_uuid.is_none());
        assert_eq!(rec.state, DriveState::Owned);
    }
}
