// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use slog::{info, warn, Logger};

use crate::registry::Registry;

/// Marker file found at the root of pool drives that have no block
/// device behind them (NFS, CIFS and friends).
pub const SENTINEL_FILE: &str = ".hoard_uses_this";

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("cannot stat {0:?}")]
    Stat(PathBuf, #[source] std::io::Error),

    #[error("cannot read mount table")]
    MountTable(#[source] std::io::Error),

    #[error("blkid failed for device {0:?}")]
    Blkid(String),

    #[error("uuid probe for {0:?} timed out")]
    ProbeTimeout(PathBuf),

    #[error("uuid probe for {0:?} aborted")]
    ProbeAborted(PathBuf),
}

/**
 * Source of the current filesystem UUID for a mount point.  The
 * production implementation asks the operating system; tests supply a
 * table.
 */
pub trait DeviceProbe: Send + Sync {
    /// Current filesystem UUID of the volume mounted at `drive`, or
    /// None for mounts that have no block device behind them.
    fn current_uuid(
        &self,
        drive: &Path,
    ) -> Result<Option<String>, VerificationError>;
}

/**
 * Resolves a mount point to its device via /proc/mounts, then to a
 * UUID via /dev/disk/by-uuid, with blkid(8) as a fallback for devices
 * udev has not linked.
 */
pub struct BlkidProbe {
    log: Logger,
}

impl BlkidProbe {
    pub fn new(log: Logger) -> BlkidProbe {
        BlkidProbe { log }
    }

    fn device_for_mount(
        &self,
        drive: &Path,
    ) -> Result<Option<String>, VerificationError> {
        let drive = drive
            .canonicalize()
            .map_err(|e| VerificationError::Stat(drive.to_path_buf(), e))?;
        let table = std::fs::read_to_string("/proc/mounts")
            .map_err(VerificationError::MountTable)?;

        /*
         * Deepest mount point that is a prefix of the drive path wins.
         */
        let mut best: Option<(usize, String)> = None;
        for line in table.lines() {
            let mut fields = line.split_whitespace();
            let (Some(dev), Some(mount)) = (fields.next(), fields.next())
            else {
                continue;
            };
            let mount = unescape_mount_path(mount);
            let mount = Path::new(&mount);
            if drive.starts_with(mount) {
                let depth = mount.components().count();
                if best.as_ref().map(|(d, _)| depth >= *d).unwrap_or(true) {
                    best = Some((depth, dev.to_string()));
                }
            }
        }

        Ok(best.map(|(_, dev)| dev))
    }

    fn uuid_for_device(
        &self,
        dev: &str,
    ) -> Result<Option<String>, VerificationError> {
        let canonical_dev = Path::new(dev).canonicalize().ok();

        /*
         * udev maintains /dev/disk/by-uuid as symlinks back to the
         * device nodes; scanning it avoids shelling out entirely.
         */
        let by_uuid = Path::new("/dev/disk/by-uuid");
        if let (Ok(entries), Some(canonical_dev)) =
            (std::fs::read_dir(by_uuid), canonical_dev.as_ref())
        {
            for entry in entries.flatten() {
                let Ok(target) = entry.path().canonicalize() else {
                    continue;
                };
                if &target == canonical_dev {
                    if let Some(uuid) = entry.file_name().to_str() {
                        return Ok(Some(uuid.to_string()));
                    }
                }
            }
        }

        /*
         * No by-uuid link (exotic filesystem, or udev missed it); ask
         * blkid directly.
         */
        let cmd = Command::new("blkid")
            .arg("-o")
            .arg("value")
            .arg("-s")
            .arg("UUID")
            .arg(dev)
            .output()
            .map_err(|_| VerificationError::Blkid(dev.to_string()))?;

        if !cmd.status.success() {
            let err = String::from_utf8_lossy(&cmd.stderr);
            warn!(self.log, "blkid {} failed: {:?}", dev, err);
            return Err(VerificationError::Blkid(dev.to_string()));
        }

        let uuid = String::from_utf8_lossy(&cmd.stdout).trim().to_string();
        if uuid.is_empty() {
            Ok(None)
        } else {
            Ok(Some(uuid))
        }
    }
}

impl DeviceProbe for BlkidProbe {
    fn current_uuid(
        &self,
        drive: &Path,
    ) -> Result<Option<String>, VerificationError> {
        let Some(dev) = self.device_for_mount(drive)? else {
            return Ok(None);
        };
        if !dev.starts_with("/dev/") {
            // Network share, tmpfs, or a dataset name: no UUID to have.
            return Ok(None);
        }
        self.uuid_for_device(&dev)
    }
}

/// /proc/mounts octal-escapes whitespace and backslashes.
fn unescape_mount_path(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&code, 8) {
            Ok(b) => out.push(b as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&code);
            }
        }
    }
    out
}

/**
 * Why a drive is (or is not) considered owned right now.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Owned,
    MissingDirectory,
    UuidMismatch {
        expected: String,
        current: Option<String>,
    },
    Unregistered,
}

impl Verification {
    /// One-line reason suitable for an operator notification body.
    pub fn describe(&self) -> String {
        match self {
            Verification::Owned => "owned".to_string(),
            Verification::MissingDirectory => {
                "directory doesn't exist".to_string()
            }
            Verification::UuidMismatch { expected, current } => format!(
                "expected partition UUID: {}; current partition UUID: {}",
                expected,
                current.as_deref().unwrap_or("N/A")
            ),
            Verification::Unregistered => {
                "not registered with the pool".to_string()
            }
        }
    }
}

/**
 * Decides whether a mount point is a drive this pool currently owns.
 *
 * Positive results are cached for the configured TTL so that drafting,
 * which asks on every file placement, does not stat drives
 * continuously.  Negative results are never cached: a drive that was
 * just reported missing should be able to come back immediately.
 */
pub struct OwnershipVerifier {
    log: Logger,
    registry: Arc<Registry>,
    probe: Arc<dyn DeviceProbe>,
    cache: Mutex<BTreeMap<PathBuf, Instant>>,
    cache_ttl: Duration,
    probe_timeout: Duration,
}

impl OwnershipVerifier {
    pub fn new(
        log: Logger,
        registry: Arc<Registry>,
        probe: Arc<dyn DeviceProbe>,
        cache_ttl: Duration,
        probe_timeout: Duration,
    ) -> OwnershipVerifier {
        OwnershipVerifier {
            log,
            registry,
            probe,
            cache: Mutex::new(BTreeMap::new()),
            cache_ttl,
            probe_timeout,
        }
    }

    pub fn is_owned(&self, drive: &Path) -> bool {
        matches!(self.verify(drive), Verification::Owned)
    }

    pub fn verify(&self, drive: &Path) -> Verification {
        /*
         * A vanished directory is unowned no matter what the cache
         * says.
         */
        if !drive.is_dir() {
            self.cache.lock().unwrap().remove(drive);
            return Verification::MissingDirectory;
        }

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(t) = cache.get(drive) {
                if t.elapsed() < self.cache_ttl {
                    return Verification::Owned;
                }
                cache.remove(drive);
            }
        }

        let expected = self.registry.expected_uuid(drive);
        let current = match self.probe_with_timeout(drive) {
            Ok(current) => current,
            Err(e) => {
                // Degrade to "no UUID"; the sentinel check below may
                // still claim the drive.
                warn!(
                    self.log,
                    "uuid verification for {:?} failed: {}", drive, e
                );
                None
            }
        };

        let uuid_matches = match (&expected, &current) {
            (Some(e), Some(c)) => e == c,
            _ => false,
        };

        if uuid_matches {
            self.mark_owned(drive);
            return Verification::Owned;
        }

        if drive.join(SENTINEL_FILE).exists() {
            if expected.is_some() {
                /*
                 * A remote mount should not carry a UUID expectation;
                 * self-heal the registry.
                 */
                info!(
                    self.log,
                    "sentinel found on {:?} but a UUID was registered; \
                     dropping the registry entry",
                    drive
                );
                self.registry.forget_uuid(drive);
            }
            self.mark_owned(drive);
            return Verification::Owned;
        }

        match expected {
            None => Verification::Unregistered,
            Some(expected) => Verification::UuidMismatch {
                expected,
                current,
            },
        }
    }

    /**
     * Start tracking a configured drive that has no registry record
     * yet: remember the UUID of whatever is mounted there now, or just
     * the path for sentinel-marked mounts.  A drive that cannot be
     * probed is left alone and will be adopted on a later attempt.
     */
    pub fn adopt(&self, drive: &Path) {
        if self.registry.record(drive).is_some() {
            return;
        }
        if !drive.is_dir() {
            warn!(
                self.log,
                "cannot adopt {:?}: directory doesn't exist", drive
            );
            return;
        }
        if drive.join(SENTINEL_FILE).exists() {
            self.registry.ensure_record(drive);
            return;
        }
        match self.probe_with_timeout(drive) {
            Ok(Some(uuid)) => {
                self.registry.register_uuid(drive, &uuid);
            }
            Ok(None) => {
                warn!(
                    self.log,
                    "cannot adopt {:?}: no filesystem UUID and no \
                     sentinel file; create {:?} on it if this is a \
                     remote mount",
                    drive,
                    SENTINEL_FILE
                );
            }
            Err(e) => {
                warn!(self.log, "cannot adopt {:?}: {}", drive, e);
            }
        }
    }

    fn mark_owned(&self, drive: &Path) {
        self.cache
            .lock()
            .unwrap()
            .insert(drive.to_path_buf(), Instant::now());
    }

    pub fn invalidate(&self, drive: &Path) {
        self.cache.lock().unwrap().remove(drive);
    }

    /// UUID of whatever is mounted at `drive` right now, ignoring the
    /// registry.  Used when the operator swaps a volume in.
    pub fn current_uuid(
        &self,
        drive: &Path,
    ) -> Result<Option<String>, VerificationError> {
        self.probe_with_timeout(drive)
    }

    /**
     * Run the probe on its own thread so an unresponsive mount cannot
     * stall the health cycle or a draft.
     */
    fn probe_with_timeout(
        &self,
        drive: &Path,
    ) -> Result<Option<String>, VerificationError> {
        let (tx, rx) = mpsc::channel();
        let probe = Arc::clone(&self.probe);
        let target = drive.to_path_buf();
        std::thread::spawn(move || {
            let _ = tx.send(probe.current_uuid(&target));
        });

        match rx.recv_timeout(self.probe_timeout) {
            Ok(res) => res,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(VerificationError::ProbeTimeout(drive.to_path_buf()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(VerificationError::ProbeAborted(drive.to_path_buf()))
            }
        }
    }
}

#[cfg(test)]
pub struct FakeProbe {
    uuids: Mutex<BTreeMap<PathBuf, Option<String>>>,
    delay: Option<Duration>,
}

#[cfg(test)]
impl FakeProbe {
    pub fn new() -> FakeProbe {
        FakeProbe {
            uuids: Mutex::new(BTreeMap::new()),
            delay: None,
        }
    }

    pub fn slow(delay: Duration) -> FakeProbe {
        FakeProbe {
            uuids: Mutex::new(BTreeMap::new()),
            delay: Some(delay),
        }
    }

    pub fn set(&self, drive: &Path, uuid: Option<&str>) {
        self.uuids
            .lock()
            .unwrap()
            .insert(drive.to_path_buf(), uuid.map(|s| s.to_string()));
    }
}

#[cfg(test)]
impl DeviceProbe for FakeProbe {
    fn current_uuid(
        &self,
        drive: &Path,
    ) -> Result<Option<String>, VerificationError> {
        if let Some(d) = self.delay {
            std::thread::sleep(d);
        }
        Ok(self
            .uuids
            .lock()
            .unwrap()
            .get(drive)
            .cloned()
            .flatten())
    }
}
