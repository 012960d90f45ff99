// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/*
 * Typed view of /etc/hoard.toml.  Everything here is validated at load
 * time; components downstream never see a value that has not already
 * been checked.  Raw file inclusion, deprecated-key renaming and the
 * like are the business of whatever produced the file, not ours.
 */

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("no pool drives configured; the daemon cannot run")]
    NoPoolDrives,

    #[error("invalid min_free {value:?} for pool drive {drive:?}")]
    BadByteCount { drive: PathBuf, value: String },

    #[error("invalid num_copies {value:?} for share {share:?}")]
    BadNumCopies { share: String, value: String },

    #[error("unknown drive selection algorithm {0:?}")]
    UnknownAlgorithm(String),

    #[error("cannot parse drive selection rule {0:?}")]
    BadSelectionRule(String),

    #[error(
        "share {share:?} landing zone {landing_zone:?} is inside pool \
         drive {drive:?}; shares must live outside the pool"
    )]
    LandingZoneInsidePool {
        share: String,
        landing_zone: PathBuf,
        drive: PathBuf,
    },

    #[error(
        "pool drive {drive:?} is inside the landing zone of share \
         {share:?}; pool drives must live outside every share"
    )]
    PoolDriveInsideLandingZone { share: String, drive: PathBuf },
}

/**
 * One mount point contributing capacity to the pool, with the amount of
 * space that must be left free on it.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct PoolDrive {
    pub path: PathBuf,
    pub min_free: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareConfig {
    pub landing_zone: PathBuf,
    pub num_copies: u32,

    /// Per-share override of the pool-wide selection descriptor.
    pub drive_selection_algorithm: Option<String>,

    /// Per-share selection groups; when absent, the pool-wide groups
    /// apply to this share's descriptor.
    pub drive_selection_groups: Option<BTreeMap<String, Vec<PathBuf>>>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub drives: Vec<PoolDrive>,
    pub drive_selection_algorithm: String,
    pub drive_selection_groups: BTreeMap<String, Vec<PathBuf>>,
    pub shares: BTreeMap<String, ShareConfig>,

    /// How long a cached space/ownership observation stays trusted.
    pub df_cache_time: u64,

    /// Seconds between health-check cycles.
    pub health_check_interval: u64,

    pub email_to: String,
    pub registry_path: PathBuf,
    pub queue_path: PathBuf,
}

/*
 * Serde-facing shapes.  Kept separate so the public structs only ever
 * hold validated values.
 */

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    pool_drive: Vec<RawDrive>,

    #[serde(default = "default_algorithm")]
    drive_selection_algorithm: String,

    #[serde(default)]
    drive_selection_groups: BTreeMap<String, Vec<PathBuf>>,

    #[serde(default)]
    shares: BTreeMap<String, RawShare>,

    #[serde(default = "default_df_cache_time")]
    df_cache_time: u64,

    #[serde(default = "default_health_check_interval")]
    health_check_interval: u64,

    #[serde(default = "default_email_to")]
    email_to: String,

    #[serde(default = "default_registry_path")]
    registry_path: PathBuf,

    #[serde(default = "default_queue_path")]
    queue_path: PathBuf,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDrive {
    path: PathBuf,
    min_free: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawShare {
    landing_zone: PathBuf,

    #[serde(default = "default_num_copies")]
    num_copies: RawNumCopies,

    drive_selection_algorithm: Option<String>,
    drive_selection_groups: Option<BTreeMap<String, Vec<PathBuf>>>,
}

/// `num_copies = 2` or `num_copies = "max"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumCopies {
    Count(u32),
    Word(String),
}

fn default_algorithm() -> String {
    "most_available_space".to_string()
}

fn default_df_cache_time() -> u64 {
    15
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_email_to() -> String {
    "root".to_string()
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/hoard/registry.json")
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("/var/lib/hoard/tasks.db")
}

fn default_num_copies() -> RawNumCopies {
    RawNumCopies::Count(1)
}

impl PoolConfig {
    pub fn load(path: &Path) -> Result<PoolConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        Self::from_toml(&text, path)
    }

    pub fn from_toml(
        text: &str,
        path: &Path,
    ) -> Result<PoolConfig, ConfigError> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: Box::new(e),
            })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<PoolConfig, ConfigError> {
        if raw.pool_drive.is_empty() {
            return Err(ConfigError::NoPoolDrives);
        }

        let mut drives = Vec::with_capacity(raw.pool_drive.len());
        for d in raw.pool_drive {
            let min_free = match &d.min_free {
                Some(s) => crate::parse_byte_count(s).map_err(|_| {
                    ConfigError::BadByteCount {
                        drive: d.path.clone(),
                        value: s.clone(),
                    }
                })?,
                None => 0,
            };
            drives.push(PoolDrive {
                path: d.path,
                min_free,
            });
        }

        let pool_size = drives.len() as u32;
        let mut shares = BTreeMap::new();
        for (name, s) in raw.shares {
            let num_copies = match s.num_copies {
                RawNumCopies::Count(n) => n.min(pool_size),
                RawNumCopies::Word(w)
                    if w.eq_ignore_ascii_case("max") =>
                {
                    pool_size
                }
                RawNumCopies::Word(w) => {
                    return Err(ConfigError::BadNumCopies {
                        share: name,
                        value: w,
                    });
                }
            };

            /*
             * A landing zone inside a pool drive (or the reverse) would
             * make the daemon replicate into its own replica store.
             */
            for d in &drives {
                if s.landing_zone.starts_with(&d.path) {
                    return Err(ConfigError::LandingZoneInsidePool {
                        share: name,
                        landing_zone: s.landing_zone,
                        drive: d.path.clone(),
                    });
                }
                if d.path.starts_with(&s.landing_zone) {
                    return Err(ConfigError::PoolDriveInsideLandingZone {
                        share: name,
                        drive: d.path.clone(),
                    });
                }
            }

            shares.insert(
                name,
                ShareConfig {
                    landing_zone: s.landing_zone,
                    num_copies,
                    drive_selection_algorithm: s.drive_selection_algorithm,
                    drive_selection_groups: s.drive_selection_groups,
                },
            );
        }

        Ok(PoolConfig {
            drives,
            drive_selection_algorithm: raw.drive_selection_algorithm,
            drive_selection_groups: raw.drive_selection_groups,
            shares,
            df_cache_time: raw.df_cache_time,
            health_check_interval: raw.health_check_interval,
            email_to: raw.email_to,
            registry_path: raw.registry_path,
            queue_path: raw.queue_path,
        })
    }

    pub fn pool_drive_paths(&self) -> Vec<PathBuf> {
        self.drives.iter().map(|d| d.path.clone()).collect()
    }

    pub fn min_free_for(&self, drive: &Path) -> u64 {
        self.drives
            .iter()
            .find(|d| d.path == drive)
            .map(|d| d.min_free)
            .unwrap_or(0)
    }
}
