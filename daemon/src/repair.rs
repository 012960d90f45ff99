// Copyright 2025 Oxide Computer Company

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use slog::{info, warn, Logger};

use crate::ownership::OwnershipVerifier;
use crate::tasks::{FsckFlag, RepairSchedulingError, TaskQueue};
use hoard_common::PoolConfig;

/// Per-drive directory holding copy metadata for the files stored on
/// that drive.
pub const METASTORE_DIR: &str = ".hoard/metastore";

/**
 * Schedules consistency repair work in response to pool membership
 * changes, and repoints share symlinks whose targets went away.
 *
 * Scheduling is two-phase: callers stage any number of tasks and then
 * `commit` them in one step, so the executor never sees a partial
 * repair plan.
 */
pub struct RepairTrigger {
    log: Logger,
    config: PoolConfig,
    queue: Arc<TaskQueue>,
    ownership: Arc<OwnershipVerifier>,
}

impl RepairTrigger {
    pub fn new(
        log: Logger,
        config: PoolConfig,
        queue: Arc<TaskQueue>,
        ownership: Arc<OwnershipVerifier>,
    ) -> RepairTrigger {
        RepairTrigger {
            log,
            config,
            queue,
            ownership,
        }
    }

    /**
     * Stage one fsck task per share, rooted at the share's landing
     * zone.
     */
    pub fn stage_fsck_all_shares(
        &self,
        flags: &[FsckFlag],
    ) -> Result<usize, RepairSchedulingError> {
        let options: Vec<String> =
            flags.iter().map(|f| f.to_string()).collect();
        let mut n = 0;
        for (name, share) in &self.config.shares {
            info!(self.log, "staging fsck of share {:?}", name);
            self.queue.stage("fsck", &share.landing_zone, &options)?;
            n += 1;
        }
        Ok(n)
    }

    /**
     * Stage an fsck of one drive's metastore, reconciling the copy
     * metadata of a drive that just returned to the pool.
     */
    pub fn stage_metastore_fsck(
        &self,
        drive: &Path,
    ) -> Result<(), RepairSchedulingError> {
        info!(self.log, "staging metastore fsck for drive {:?}", drive);
        self.queue.stage("fsck", &drive.join(METASTORE_DIR), &[])
    }

    /// Release everything staged so far to the executor.
    pub fn commit(&self) -> Result<usize, RepairSchedulingError> {
        self.queue.release()
    }

    /// Stage and commit a pool-wide fsck in one call, for the operator
    /// command path.
    pub fn schedule_fsck_all_shares(
        &self,
        flags: &[FsckFlag],
    ) -> Result<usize, RepairSchedulingError> {
        let n = self.stage_fsck_all_shares(flags)?;
        self.commit()?;
        Ok(n)
    }

    /**
     * Walk every share and repoint broken symlinks to a surviving
     * copy.  Errors on individual files are logged and skipped; the
     * walk itself failing is reported.
     */
    pub fn fix_all_symlinks(&self) -> Result<()> {
        for (name, share) in &self.config.shares {
            self.fix_symlinks_on_share(name, &share.landing_zone)?;
        }
        Ok(())
    }

    pub fn fix_symlinks_on_share(
        &self,
        share: &str,
        landing_zone: &Path,
    ) -> Result<()> {
        info!(self.log, "fixing symlinks on share {:?}", share);

        let mut fixed = 0u64;
        let mut dirs = vec![landing_zone.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(self.log, "cannot read {:?}: {}", dir, e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = std::fs::symlink_metadata(&path) else {
                    continue;
                };
                if meta.is_dir() {
                    dirs.push(path);
                    continue;
                }
                if !meta.is_symlink() {
                    continue;
                }
                /*
                 * fs::metadata follows the link; an error here means
                 * the target is gone.
                 */
                if std::fs::metadata(&path).is_ok() {
                    continue;
                }
                match self.relink(share, landing_zone, &path) {
                    Ok(true) => fixed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            self.log,
                            "cannot fix symlink {:?}: {:#}", path, e
                        );
                    }
                }
            }
        }

        if fixed > 0 {
            info!(
                self.log,
                "fixed {} symlinks on share {:?}", fixed, share
            );
        }
        Ok(())
    }

    /**
     * Repoint one broken share symlink to the first owned drive that
     * holds a copy at the same relative path.
     */
    fn relink(
        &self,
        share: &str,
        landing_zone: &Path,
        link: &Path,
    ) -> Result<bool> {
        let rel = link.strip_prefix(landing_zone)?;

        for drive in self.config.pool_drive_paths() {
            if !self.ownership.is_owned(&drive) {
                continue;
            }
            let candidate = drive.join(share).join(rel);
            if !candidate.is_file() {
                continue;
            }

            /*
             * symlink(2) will not overwrite; build the replacement
             * next to the original and rename over it, so a reader
             * never sees the entry missing.
             */
            let tmp = link.with_extension("hoard-relink");
            let _ = std::fs::remove_file(&tmp);
            std::os::unix::fs::symlink(&candidate, &tmp)?;
            std::fs::rename(&tmp, link)?;
            info!(
                self.log,
                "repointed {:?} to {:?}", link, candidate
            );
            return Ok(true);
        }

        warn!(
            self.log,
            "no surviving copy found for broken symlink {:?}", link
        );
        Ok(false)
    }
}
