// Copyright 2025 Oxide Computer Company

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use human_bytes::human_bytes;
use signal_hook::consts::{SIGINT, SIGTERM};
use slog::{error, info, o, Logger};

use hoard_common::{build_logger, PoolConfig};
use hoard_daemon::health::HealthMonitor;
use hoard_daemon::notify::SendmailMailer;
use hoard_daemon::ownership::{
    BlkidProbe, DeviceProbe, OwnershipVerifier, SENTINEL_FILE,
};
use hoard_daemon::registry::{DriveState, Registry};
use hoard_daemon::repair::RepairTrigger;
use hoard_daemon::selection::{Algorithm, PolicyTable};
use hoard_daemon::space::{SpaceTracker, StatvfsSource};
use hoard_daemon::tasks::{FsckFlag, TaskQueue};

const PROG: &str = "hoardd";

#[derive(Debug, Parser)]
#[clap(name = PROG, about = "Storage pool control daemon")]
enum Args {
    /// Run the daemon.
    Run {
        #[clap(short = 'c', long, default_value = "/etc/hoard.toml")]
        config: PathBuf,
    },
    /// Mark a pool drive as temporarily away for maintenance; its
    /// absence will not raise alerts or repair until it returns.
    WaitFor {
        #[clap(short = 'c', long, default_value = "/etc/hoard.toml")]
        config: PathBuf,

        drive: PathBuf,
    },
    /// Remove a pool drive for good and re-create the file copies it
    /// held on the remaining drives.
    Gone {
        #[clap(short = 'c', long, default_value = "/etc/hoard.toml")]
        config: PathBuf,

        drive: PathBuf,
    },
    /// Accept the volume currently mounted at a pool drive path as a
    /// replacement, and restore file copies onto it.
    Replace {
        #[clap(short = 'c', long, default_value = "/etc/hoard.toml")]
        config: PathBuf,

        drive: PathBuf,
    },
    /// Schedule a consistency check of every share.
    Fsck {
        #[clap(short = 'c', long, default_value = "/etc/hoard.toml")]
        config: PathBuf,

        /// Also re-verify stored file checksums, not just copy counts.
        #[clap(long)]
        checksums: bool,
    },
    /// Show which drives the selection policy would pick right now.
    Draft {
        #[clap(short = 'c', long, default_value = "/etc/hoard.toml")]
        config: PathBuf,

        /// Only draft for this share.
        #[clap(short = 's', long)]
        share: Option<String>,
    },
    /// Print pool totals in the Samba dfree format.
    Dfree {
        #[clap(short = 'c', long, default_value = "/etc/hoard.toml")]
        config: PathBuf,
    },
}

/**
 * Everything the daemon and the operator commands share: the loaded
 * configuration and the component stack built on top of it.
 */
struct Pool {
    config: PoolConfig,
    registry: Arc<Registry>,
    ownership: Arc<OwnershipVerifier>,
    tracker: SpaceTracker,
    repair: Arc<RepairTrigger>,
}

fn open_pool(log: &Logger, config_path: &Path) -> Result<Pool> {
    let config = PoolConfig::load(config_path)?;

    hoard_common::mkdir_for_file(&config.registry_path)?;
    hoard_common::mkdir_for_file(&config.queue_path)?;

    let registry = Arc::new(Registry::open(
        log.new(o!("component" => "registry")),
        &config.registry_path,
    )?);

    let probe = Arc::new(BlkidProbe::new(
        log.new(o!("component" => "blkid")),
    ));
    let ownership = Arc::new(OwnershipVerifier::new(
        log.new(o!("component" => "ownership")),
        Arc::clone(&registry),
        probe as Arc<dyn DeviceProbe>,
        Duration::from_secs(config.df_cache_time),
        Duration::from_secs(30),
    ));

    let tracker = SpaceTracker::new(
        log.new(o!("component" => "space")),
        config.drives.clone(),
        Box::new(StatvfsSource),
        Duration::from_secs(config.df_cache_time),
    );

    let queue = Arc::new(TaskQueue::open(
        log.new(o!("component" => "tasks")),
        &config.queue_path,
    )?);

    let repair = Arc::new(RepairTrigger::new(
        log.new(o!("component" => "repair")),
        config.clone(),
        queue,
        Arc::clone(&ownership),
    ));

    Ok(Pool {
        config,
        registry,
        ownership,
        tracker,
        repair,
    })
}

impl Pool {
    /// Operator commands take a drive path; it has to be one of ours.
    fn check_pool_drive(&self, drive: &Path) -> Result<()> {
        if !self.config.pool_drive_paths().iter().any(|p| p == drive) {
            bail!(
                "{:?} is not a pool drive; configured drives are: {}",
                drive,
                self.config
                    .pool_drive_paths()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log = build_logger();

    match args {
        Args::Run { config } => run(log, &config),
        Args::WaitFor { config, drive } => {
            let pool = open_pool(&log, &config)?;
            pool.check_pool_drive(&drive)?;
            pool.registry
                .set_state(&drive, DriveState::GoneAcknowledged);
            println!(
                "{:?} marked as away for maintenance; its absence will \
                 not raise alerts",
                drive
            );
            Ok(())
        }
        Args::Gone { config, drive } => {
            let pool = open_pool(&log, &config)?;
            pool.check_pool_drive(&drive)?;

            pool.registry.remove_drive(&drive);
            pool.ownership.invalidate(&drive);

            /*
             * Point share symlinks at surviving copies now, then have
             * the executor walk the shares and restore the copy
             * counts.
             */
            if let Err(e) = pool.repair.fix_all_symlinks() {
                error!(log, "symlink fix incomplete: {:#}", e);
            }
            let n = pool
                .repair
                .schedule_fsck_all_shares(&[FsckFlag::EmailReport])?;
            println!(
                "{:?} removed from the pool; {} share checks scheduled",
                drive, n
            );
            Ok(())
        }
        Args::Replace { config, drive } => {
            let pool = open_pool(&log, &config)?;
            pool.check_pool_drive(&drive)?;

            match pool.ownership.current_uuid(&drive)? {
                Some(uuid) => {
                    pool.registry.register_uuid(&drive, &uuid);
                }
                None if drive.join(SENTINEL_FILE).exists() => {
                    pool.registry.ensure_record(&drive);
                    pool.registry.forget_uuid(&drive);
                }
                None => {
                    bail!(
                        "no filesystem UUID found at {:?}; if this is a \
                         remote mount, create {:?} on it first",
                        drive,
                        SENTINEL_FILE
                    );
                }
            }
            pool.registry.set_state(&drive, DriveState::Owned);
            pool.ownership.invalidate(&drive);

            let n = pool
                .repair
                .schedule_fsck_all_shares(&[FsckFlag::EmailReport])?;
            println!(
                "{:?} accepted as a replacement; {} share checks \
                 scheduled to restore its copies",
                drive, n
            );
            Ok(())
        }
        Args::Fsck { config, checksums } => {
            let pool = open_pool(&log, &config)?;
            let mut flags = vec![FsckFlag::EmailReport];
            if checksums {
                flags.push(FsckFlag::Checksums);
            }
            let n = pool.repair.schedule_fsck_all_shares(&flags)?;
            println!("{} share checks scheduled", n);
            Ok(())
        }
        Args::Draft { config, share } => {
            let pool = open_pool(&log, &config)?;
            let policy = PolicyTable::from_config(&pool.config, &log)?;

            let shares: Vec<String> = match share {
                Some(s) => {
                    if !pool.config.shares.contains_key(&s) {
                        bail!("no share named {:?}", s);
                    }
                    vec![s]
                }
                None => pool.config.shares.keys().cloned().collect(),
            };

            let report = pool.tracker.report();
            for name in shares {
                println!("share {}:", name);
                for rule in policy.rules_for_share(&name) {
                    let d = rule.draft(&report, &pool.ownership);
                    let unit = match rule.algorithm {
                        Algorithm::MostAvailableSpace => "free",
                        Algorithm::LeastUsedSpace => "used",
                    };
                    for (drive, metric) in &d.primary {
                        println!(
                            "  {} ({} {})",
                            drive.display(),
                            human_bytes(*metric as f64),
                            unit
                        );
                    }
                    for (drive, metric) in &d.last_resort {
                        println!(
                            "  {} ({} {}, last resort)",
                            drive.display(),
                            human_bytes(*metric as f64),
                            unit
                        );
                    }
                }
            }
            Ok(())
        }
        Args::Dfree { config } => {
            let pool = open_pool(&log, &config)?;
            let (total, free) = pool.tracker.pool_totals();
            // Samba's dfree protocol: total and free in KiB, then the
            // block size.
            println!("{} {} 1024", total / 1024, free / 1024);
            Ok(())
        }
    }
}

fn run(log: Logger, config_path: &Path) -> Result<()> {
    let pool = open_pool(&log, config_path)?;

    /*
     * A bad selection descriptor must stop the daemon now, not the
     * first time a draft is asked for.
     */
    PolicyTable::from_config(&pool.config, &log)?;

    let mailer = Arc::new(SendmailMailer::new(
        log.new(o!("component" => "notify")),
        &pool.config.email_to,
    ));

    let monitor = HealthMonitor::new(
        log.new(o!("component" => "health")),
        pool.config.pool_drive_paths(),
        Arc::clone(&pool.registry),
        Arc::clone(&pool.ownership),
        Arc::clone(&pool.repair),
        mailer,
    );

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&term))?;

    info!(
        log,
        "{} starting", PROG;
        "drives" => pool.config.drives.len(),
        "shares" => pool.config.shares.len()
    );

    let interval = Duration::from_secs(pool.config.health_check_interval);
    while !term.load(Ordering::Relaxed) {
        if let Err(e) = monitor.run_cycle() {
            error!(log, "health cycle failed: {:#}", e);
        }

        /*
         * Sleep in one-second slices so a signal is honored promptly.
         */
        let mut slept = Duration::ZERO;
        while slept < interval && !term.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(1));
            slept += Duration::from_secs(1);
        }
    }

    info!(log, "shutting down on signal");
    Ok(())
}
