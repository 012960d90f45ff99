// Copyright 2025 Oxide Computer Company

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use slog::{info, warn, Logger};

use crate::notify::{self, Mailer};
use crate::ownership::{OwnershipVerifier, Verification};
use crate::registry::{DriveState, Registry};
use crate::repair::RepairTrigger;
use crate::tasks::{FsckFlag, RepairSchedulingError};

/**
 * What one health cycle observed and did.
 */
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub newly_missing: Vec<PathBuf>,
    pub newly_returned: Vec<PathBuf>,

    /// A previous cycle was still running; nothing was checked.
    pub skipped: bool,
}

/**
 * Periodic verification of every pool drive, driving the per-drive
 * state machine and kicking off repair when membership changes.
 *
 * Transitions per drive and cycle:
 *
 *   Owned | Returned      -> GoneFsckPending   drive stopped verifying
 *   GoneAcknowledged |
 *   GoneFsckPending       -> Returned          drive verifies again
 *
 * Only drives with a registered UUID take part in gone/returned
 * accounting.  A sentinel-marked remote mount has no identity to
 * verify against while it is away, so its absence is the remote
 * filesystem's problem, not a pool membership change.  Adoption of
 * new drives happens at the top of the cycle and only succeeds for
 * drives that can actually be identified.
 */
pub struct HealthMonitor {
    log: Logger,
    pool: Vec<PathBuf>,
    registry: Arc<Registry>,
    ownership: Arc<OwnershipVerifier>,
    repair: Arc<RepairTrigger>,
    mailer: Arc<dyn Mailer>,
    cycle: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        log: Logger,
        pool: Vec<PathBuf>,
        registry: Arc<Registry>,
        ownership: Arc<OwnershipVerifier>,
        repair: Arc<RepairTrigger>,
        mailer: Arc<dyn Mailer>,
    ) -> HealthMonitor {
        HealthMonitor {
            log,
            pool,
            registry,
            ownership,
            repair,
            mailer,
            cycle: Mutex::new(()),
        }
    }

    pub fn run_cycle(&self) -> Result<CycleOutcome> {
        /*
         * A cycle stuck on an unresponsive mount must not pile up
         * behind itself.
         */
        let Ok(_guard) = self.cycle.try_lock() else {
            warn!(self.log, "previous health cycle still running; skipping");
            return Ok(CycleOutcome {
                skipped: true,
                ..Default::default()
            });
        };

        for drive in &self.pool {
            self.ownership.adopt(drive);
        }

        let mut missing: Vec<(PathBuf, Verification)> = Vec::new();
        let mut returned: Vec<PathBuf> = Vec::new();

        for drive in &self.pool {
            let Some(rec) = self.registry.record(drive) else {
                continue;
            };
            if rec.expected_uuid.is_none() {
                continue;
            }

            let v = self.ownership.verify(drive);
            let owned = matches!(v, Verification::Owned);

            match (rec.state, owned) {
                (DriveState::Owned | DriveState::Returned, false) => {
                    info!(
                        self.log,
                        "drive {:?} gone: {}",
                        drive,
                        v.describe()
                    );
                    self.registry
                        .set_state(drive, DriveState::GoneFsckPending);
                    missing.push((drive.clone(), v));
                }
                (
                    DriveState::GoneAcknowledged
                    | DriveState::GoneFsckPending,
                    true,
                ) => {
                    info!(self.log, "drive {:?} has returned", drive);
                    self.registry.set_state(drive, DriveState::Returned);
                    returned.push(drive.clone());
                }
                _ => {}
            }
        }

        let schedule_result = self.schedule_repairs(&missing, &returned);

        self.send_notifications(&missing, &returned, &schedule_result);

        schedule_result?;
        Ok(CycleOutcome {
            newly_missing: missing.into_iter().map(|(p, _)| p).collect(),
            newly_returned: returned,
            skipped: false,
        })
    }

    /**
     * Stage the whole repair plan for this cycle and commit it in one
     * step.
     *
     * A missing drive gets the share symlinks repointed away from it;
     * a returned drive gets its metastore reconciled.  Either way the
     * shares themselves are checked, once, no matter how many drives
     * changed.
     */
    fn schedule_repairs(
        &self,
        missing: &[(PathBuf, Verification)],
        returned: &[PathBuf],
    ) -> Result<(), RepairSchedulingError> {
        if missing.is_empty() && returned.is_empty() {
            return Ok(());
        }

        if !missing.is_empty() {
            if let Err(e) = self.repair.fix_all_symlinks() {
                // The share fsck below re-walks everything anyway.
                warn!(self.log, "symlink fix incomplete: {:#}", e);
            }
        }

        for drive in returned {
            self.repair.stage_metastore_fsck(drive)?;
        }
        self.repair
            .stage_fsck_all_shares(&[FsckFlag::EmailReport])?;
        self.repair.commit()?;
        Ok(())
    }

    fn send_notifications(
        &self,
        missing: &[(PathBuf, Verification)],
        returned: &[PathBuf],
        schedule_result: &Result<(), RepairSchedulingError>,
    ) {
        let mut notifications = Vec::new();
        if !missing.is_empty() {
            let missing: Vec<_> =
                missing.iter().map(|(p, v)| (p.as_path(), v.clone())).collect();
            notifications.push(notify::drives_missing(&missing));
        }
        if !returned.is_empty() {
            let returned: Vec<_> =
                returned.iter().map(|p| p.as_path()).collect();
            notifications.push(notify::drives_returned(&returned));
        }

        for mut n in notifications {
            if let Err(e) = schedule_result {
                n.body.push_str(&format!(
                    "\nWARNING: scheduling the consistency check failed \
                     ({}); the check will be retried, but the pool \
                     should be fscked manually if this persists.\n",
                    e
                ));
            }
            if let Err(e) = self.mailer.send(&n) {
                warn!(
                    self.log,
                    "cannot send notification {:?}: {:#}", n.subject, e
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notify::RecordingMailer;
    use crate::ownership::{DeviceProbe, FakeProbe, SENTINEL_FILE};
    use crate::repair::METASTORE_DIR;
    use crate::tasks::TaskQueue;
    use hoard_common::{build_logger, PoolConfig, PoolDrive, ShareConfig};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn csl() -> Logger {
        build_logger()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        drives: Vec<PathBuf>,
        registry: Arc<Registry>,
        probe: Arc<FakeProbe>,
        queue: Arc<TaskQueue>,
        mailer: Arc<RecordingMailer>,
        monitor: HealthMonitor,
    }

    fn harness(n: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            Registry::open(csl(), &dir.path().join("registry.json"))
                .unwrap(),
        );
        let probe = Arc::new(FakeProbe::new());

        let mut drives = Vec::new();
        for i in 0..n {
            let p = dir.path().join(format!("drive{}", i));
            std::fs::create_dir_all(p.join("tv")).unwrap();
            probe.set(&p, Some(&format!("uuid-{}", i)));
            drives.push(p);
        }

        let landing = dir.path().join("landing");
        std::fs::create_dir(&landing).unwrap();

        let ownership = Arc::new(OwnershipVerifier::new(
            csl(),
            Arc::clone(&registry),
            Arc::clone(&probe) as Arc<dyn DeviceProbe>,
            Duration::ZERO,
            Duration::from_secs(5),
        ));

        let queue = Arc::new(
            TaskQueue::open(csl(), &dir.path().join("tasks.db")).unwrap(),
        );

        let config = PoolConfig {
            drives: drives
                .iter()
                .map(|p| PoolDrive {
                    path: p.clone(),
                    min_free: 0,
                })
                .collect(),
            drive_selection_algorithm: "most_available_space".to_string(),
            drive_selection_groups: BTreeMap::new(),
            shares: [(
                "tv".to_string(),
                ShareConfig {
                    landing_zone: landing,
                    num_copies: 1,
                    drive_selection_algorithm: None,
                    drive_selection_groups: None,
                },
            )]
            .into_iter()
            .collect(),
            df_cache_time: 15,
            health_check_interval: 60,
            email_to: "root".to_string(),
            registry_path: dir.path().join("registry.json"),
            queue_path: dir.path().join("tasks.db"),
        };

        let repair = Arc::new(RepairTrigger::new(
            csl(),
            config,
            Arc::clone(&queue),
            Arc::clone(&ownership),
        ));

        let mailer = Arc::new(RecordingMailer::new());

        let monitor = HealthMonitor::new(
            csl(),
            drives.clone(),
            Arc::clone(&registry),
            ownership,
            repair,
            Arc::clone(&mailer) as Arc<dyn Mailer>,
        );

        Harness {
            _dir: dir,
            drives,
            registry,
            probe,
            queue,
            mailer,
            monitor,
        }
    }

    #[test]
    fn first_cycle_adopts_drives() {
        let h = harness(2);
        let outcome = h.monitor.run_cycle().unwrap();
        assert!(outcome.newly_missing.is_empty());
        assert!(outcome.newly_returned.is_empty());

        assert_eq!(
            h.registry.expected_uuid(&h.drives[0]).as_deref(),
            Some("uuid-0")
        );
        assert_eq!(h.registry.state(&h.drives[0]), DriveState::Owned);
        assert!(h.mailer.subjects().is_empty());
        assert!(h.queue.pending().unwrap().is_empty());
    }

    #[test]
    fn sentinel_drive_adopted_without_uuid() {
        let h = harness(1);
        h.probe.set(&h.drives[0], None);
        std::fs::write(h.drives[0].join(SENTINEL_FILE), b"").unwrap();

        h.monitor.run_cycle().unwrap();
        let rec = h.registry.record(&h.drives[0]).unwrap();
        assert!(rec.expected_uuid.is_none());
        assert_eq!(rec.state, DriveState::Owned);
    }

    #[test]
    fn sentinel_drive_absence_is_not_a_gone_event() {
        let h = harness(2);
        // drive1 is a remote mount: no UUID, claimed via sentinel.
        h.probe.set(&h.drives[1], None);
        std::fs::write(h.drives[1].join(SENTINEL_FILE), b"").unwrap();
        h.monitor.run_cycle().unwrap();

        // The remote end goes away; there is no registered identity
        // to have lost, so this is not a pool membership change.
        std::fs::remove_file(h.drives[1].join(SENTINEL_FILE)).unwrap();
        let outcome = h.monitor.run_cycle().unwrap();
        assert!(outcome.newly_missing.is_empty());
        assert_eq!(h.registry.state(&h.drives[1]), DriveState::Owned);
        assert!(h.mailer.subjects().is_empty());
        assert!(h.queue.pending().unwrap().is_empty());

        // And coming back is equally uneventful.
        std::fs::write(h.drives[1].join(SENTINEL_FILE), b"").unwrap();
        let outcome = h.monitor.run_cycle().unwrap();
        assert!(outcome.newly_returned.is_empty());
        assert_eq!(h.registry.state(&h.drives[1]), DriveState::Owned);
    }

    #[test]
    fn missing_drive_transitions_once() {
        let h = harness(2);
        h.monitor.run_cycle().unwrap();

        // drive1's volume is swapped out from under us.
        h.probe.set(&h.drives[1], Some("uuid-stranger"));

        let outcome = h.monitor.run_cycle().unwrap();
        assert_eq!(outcome.newly_missing, vec![h.drives[1].clone()]);
        assert_eq!(
            h.registry.state(&h.drives[1]),
            DriveState::GoneFsckPending
        );

        // One gone notification, naming the drive.
        let subjects = h.mailer.subjects();
        assert_eq!(subjects.len(), 1);
        assert!(subjects[0].contains("gone"));
        assert!(
            subjects[0].contains(&h.drives[1].display().to_string())
        );

        // The repair plan was committed: one fsck per share, asking
        // for the completion report the notification promises.
        let pending = h.queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].options, vec!["email".to_string()]);

        // A second cycle with nothing changed is quiet.
        let outcome = h.monitor.run_cycle().unwrap();
        assert!(outcome.newly_missing.is_empty());
        assert_eq!(h.mailer.subjects().len(), 1);
        assert_eq!(h.queue.pending().unwrap().len(), 1);
    }

    #[test]
    fn returned_drive_gets_metastore_fsck() {
        let h = harness(2);
        h.monitor.run_cycle().unwrap();

        h.probe.set(&h.drives[1], Some("uuid-stranger"));
        h.monitor.run_cycle().unwrap();

        // Put the right volume back.
        h.probe.set(&h.drives[1], Some("uuid-1"));
        let outcome = h.monitor.run_cycle().unwrap();
        assert_eq!(outcome.newly_returned, vec![h.drives[1].clone()]);
        assert_eq!(h.registry.state(&h.drives[1]), DriveState::Returned);

        let subjects = h.mailer.subjects();
        assert_eq!(subjects.len(), 2);
        assert!(subjects[1].contains("returned"));

        // Missing cycle queued 1 share fsck; the return adds the
        // metastore fsck plus another share fsck.
        let pending = h.queue.pending().unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending
            .iter()
            .any(|t| t.target == h.drives[1].join(METASTORE_DIR)));

        // Returned is sticky; a further cycle changes nothing.
        let outcome = h.monitor.run_cycle().unwrap();
        assert!(outcome.newly_returned.is_empty());
        assert_eq!(h.registry.state(&h.drives[1]), DriveState::Returned);
    }

    #[test]
    fn acknowledged_drive_is_not_reported_missing() {
        let h = harness(2);
        h.monitor.run_cycle().unwrap();

        // The operator announces maintenance ahead of time.
        h.registry
            .set_state(&h.drives[1], DriveState::GoneAcknowledged);
        h.probe.set(&h.drives[1], None);

        let outcome = h.monitor.run_cycle().unwrap();
        assert!(outcome.newly_missing.is_empty());
        assert!(h.mailer.subjects().is_empty());
        assert!(h.queue.pending().unwrap().is_empty());

        // When it comes back it is still a "returned" event.
        h.probe.set(&h.drives[1], Some("uuid-1"));
        let outcome = h.monitor.run_cycle().unwrap();
        assert_eq!(outcome.newly_returned, vec![h.drives[1].clone()]);
    }

    #[test]
    fn missing_drive_triggers_symlink_fix() {
        let h = harness(2);

        // A share file with copies on both drives, linked to drive1.
        let landing = h._dir.path().join("landing");
        for d in &h.drives {
            std::fs::write(d.join("tv/a.mkv"), b"x").unwrap();
        }
        let link = landing.join("a.mkv");
        std::os::unix::fs::symlink(h.drives[1].join("tv/a.mkv"), &link)
            .unwrap();

        h.monitor.run_cycle().unwrap();

        // drive1 disappears wholesale.
        std::fs::remove_dir_all(&h.drives[1]).unwrap();
        h.monitor.run_cycle().unwrap();

        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            h.drives[0].join("tv/a.mkv")
        );
    }

    #[test]
    fn unregistered_drive_skipped() {
        let h = harness(2);
        // drive1 has no UUID and no sentinel: adoption fails, and the
        // cycle must not invent a gone event for it.
        h.probe.set(&h.drives[1], None);

        let outcome = h.monitor.run_cycle().unwrap();
        assert!(outcome.newly_missing.is_empty());
        assert!(h.registry.record(&h.drives[1]).is_none());
        assert!(h.mailer.subjects().is_empty());

        // drive0 was adopted fine.
        assert!(h.registry.record(&h.drives[0]).is_some());
    }

    #[test]
    fn missing_directory_reported_with_reason() {
        let h = harness(1);
        h.monitor.run_cycle().unwrap();

        std::fs::remove_dir_all(&h.drives[0]).unwrap();
        let outcome = h.monitor.run_cycle().unwrap();
        assert_eq!(outcome.newly_missing, vec![h.drives[0].clone()]);

        let sent = h.mailer.sent.lock().unwrap();
        assert!(sent[0].body.contains("directory doesn't exist"));
        assert!(sent[0].body.contains("hoardd gone"));
    }
}
