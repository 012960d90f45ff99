// Copyright 2025 Oxide Computer Company

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use slog::{warn, Logger};

use crate::ownership::OwnershipVerifier;
use crate::space::SpaceReport;
use hoard_common::{ConfigError, PoolConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    MostAvailableSpace,
    LeastUsedSpace,
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "most_available_space" => Ok(Algorithm::MostAvailableSpace),
            "least_used_space" => Ok(Algorithm::LeastUsedSpace),
            other => {
                Err(ConfigError::UnknownAlgorithm(other.to_string()))
            }
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::MostAvailableSpace => {
                write!(f, "most_available_space")
            }
            Algorithm::LeastUsedSpace => write!(f, "least_used_space"),
        }
    }
}

/**
 * One drafting rule: draw up to `num_drives_per_draft` drives out of
 * `drives`, ordered by `algorithm`.  A share (or the pool default)
 * owns an ordered sequence of these.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct DriveSelection {
    pub num_drives_per_draft: usize,
    pub algorithm: Algorithm,
    pub drives: Vec<PathBuf>,
    pub is_forced: bool,
}

/**
 * Outcome of one draft.  `primary` drives satisfied the rule's own
 * drive set; `last_resort` drives were drawn from the rest of the pool
 * to cover a shortfall.  Values are the sort metric (used or available
 * bytes, depending on the algorithm).
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    pub primary: Vec<(PathBuf, u64)>,
    pub last_resort: Vec<(PathBuf, u64)>,
}

impl DriveSelection {
    /**
     * Parse a selection descriptor.  Either a bare algorithm name,
     * which applies to every pool drive, or
     * `forced(<count-or-all>x <group>, ...) <algorithm>`.
     *
     * A clause naming an undefined group is skipped with a warning,
     * matching how the pool behaves when a group definition is removed
     * but a share still references it; everything else that fails to
     * parse is fatal.
     */
    pub fn parse(
        config_string: &str,
        groups: &BTreeMap<String, Vec<PathBuf>>,
        pool_drives: &[PathBuf],
        log: &Logger,
    ) -> Result<Vec<DriveSelection>, ConfigError> {
        let s = config_string.trim();

        if s == "most_available_space" || s == "least_used_space" {
            return Ok(vec![DriveSelection {
                num_drives_per_draft: pool_drives.len(),
                algorithm: s.parse()?,
                drives: pool_drives.to_vec(),
                is_forced: false,
            }]);
        }

        let bad =
            || ConfigError::BadSelectionRule(config_string.to_string());

        let rest = s.strip_prefix("forced").ok_or_else(bad)?;
        let rest = rest.trim_start();
        let rest = rest.strip_prefix('(').ok_or_else(bad)?;
        let close = rest.find(')').ok_or_else(bad)?;
        let clauses = &rest[..close];
        let algorithm: Algorithm = rest[close + 1..].parse()?;

        let mut ds = Vec::new();
        for clause in clauses.split(',') {
            let clause = clause.trim();
            let (count_tok, group_name) = split_clause(clause)
                .ok_or_else(bad)?;

            let Some(group) = groups.get(group_name) else {
                warn!(
                    log,
                    "drive selection group named {:?} is undefined; \
                     skipping",
                    group_name
                );
                continue;
            };

            let num_drives = if count_tok.eq_ignore_ascii_case("all") {
                group.len()
            } else {
                let n: usize = count_tok.parse().map_err(|_| bad())?;
                // An over-large count saturates to the group size.
                n.min(group.len())
            };

            ds.push(DriveSelection {
                num_drives_per_draft: num_drives,
                algorithm,
                drives: group.clone(),
                is_forced: true,
            });
        }
        Ok(ds)
    }

    /**
     * Re-derive the drive set and count from the live pool.  Rules can
     * be parsed before the full pool is known, and the pool can grow
     * between rule definition and use; forced rules are pinned to
     * their group and never change.
     */
    pub fn refresh(&mut self, pool_drives: &[PathBuf]) {
        if !self.is_forced {
            self.num_drives_per_draft = pool_drives.len();
            self.drives = pool_drives.to_vec();
        }
    }

    /**
     * Draft target drives for one replica set.
     *
     * Candidates are sorted by the rule's metric and drawn from the
     * front; each draw re-checks ownership so a drive reclassified
     * mid-draft is skipped rather than counted.  If the rule's own
     * drive set cannot satisfy the count, the remainder is drawn from
     * the whole pool as a last resort.
     */
    pub fn draft(
        &self,
        space: &SpaceReport,
        ownership: &OwnershipVerifier,
    ) -> Draft {
        let mut draft = Draft::default();
        if self.num_drives_per_draft == 0 {
            return draft;
        }

        let mut primary = self.sorted_candidates(space, Some(&self.drives));
        while draft.primary.len() < self.num_drives_per_draft {
            let Some((drive, metric)) = primary.pop_front() else {
                break;
            };
            if !ownership.is_owned(&drive) {
                continue;
            }
            draft.primary.push((drive, metric));
        }

        let mut fallback = self.sorted_candidates(space, None);
        while draft.primary.len() + draft.last_resort.len()
            < self.num_drives_per_draft
        {
            let Some((drive, metric)) = fallback.pop_front() else {
                break;
            };
            if draft.primary.iter().any(|(d, _)| d == &drive) {
                continue;
            }
            if !ownership.is_owned(&drive) {
                continue;
            }
            draft.last_resort.push((drive, metric));
        }

        draft
    }

    fn sorted_candidates(
        &self,
        space: &SpaceReport,
        restrict: Option<&[PathBuf]>,
    ) -> VecDeque<(PathBuf, u64)> {
        let mut candidates: Vec<(PathBuf, u64)> = space
            .iter()
            .filter(|(p, _)| {
                restrict
                    .map(|drives| drives.iter().any(|d| d == p))
                    .unwrap_or(true)
            })
            .map(|(p, s)| {
                let metric = match self.algorithm {
                    Algorithm::LeastUsedSpace => s.used_bytes,
                    Algorithm::MostAvailableSpace => s.available_bytes,
                };
                (p.clone(), metric)
            })
            .collect();

        /*
         * Stable sorts: ties keep the pool configuration order.
         */
        match self.algorithm {
            Algorithm::LeastUsedSpace => {
                candidates.sort_by_key(|(_, m)| *m);
            }
            Algorithm::MostAvailableSpace => {
                candidates.sort_by_key(|(_, m)| Reverse(*m));
            }
        }

        candidates.into()
    }
}

fn split_clause(clause: &str) -> Option<(&str, &str)> {
    /*
     * "2x GroupA", "2xGroupA" or "all GroupA".
     */
    if let Some(x) = clause.find('x') {
        if x > 0 && clause[..x].bytes().all(|b| b.is_ascii_digit()) {
            let group = clause[x + 1..].trim();
            if !group.is_empty() {
                return Some((&clause[..x], group));
            }
            return None;
        }
    }
    let (count, group) = clause.split_once(char::is_whitespace)?;
    let group = group.trim();
    if group.is_empty() {
        None
    } else {
        Some((count, group))
    }
}

/**
 * Every share's parsed rule sequence, plus the pool default.  Built
 * once at startup so a bad descriptor aborts before the daemon starts
 * serving decisions.
 */
pub struct PolicyTable {
    pub default: Vec<DriveSelection>,
    pub shares: BTreeMap<String, Vec<DriveSelection>>,
}

impl PolicyTable {
    pub fn from_config(
        config: &PoolConfig,
        log: &Logger,
    ) -> Result<PolicyTable, ConfigError> {
        let pool = config.pool_drive_paths();

        let mut default = DriveSelection::parse(
            &config.drive_selection_algorithm,
            &config.drive_selection_groups,
            &pool,
            log,
        )?;
        for ds in &mut default {
            ds.refresh(&pool);
        }

        let mut shares = BTreeMap::new();
        for (name, share) in &config.shares {
            let rules = match &share.drive_selection_algorithm {
                Some(descriptor) => {
                    let groups = share
                        .drive_selection_groups
                        .as_ref()
                        .unwrap_or(&config.drive_selection_groups);
                    let mut rules = DriveSelection::parse(
                        descriptor, groups, &pool, log,
                    )?;
                    for ds in &mut rules {
                        ds.refresh(&pool);
                    }
                    rules
                }
                None => default.clone(),
            };
            shares.insert(name.clone(), rules);
        }

        let table = PolicyTable { default, shares };
        table.warn_unreachable_drives(config, log);
        Ok(table)
    }

    pub fn rules_for_share(&self, share: &str) -> &[DriveSelection] {
        self.shares
            .get(share)
            .map(|r| r.as_slice())
            .unwrap_or(&self.default)
    }

    /// A pool drive no rule can ever reach will never receive a copy;
    /// that is almost always a configuration mistake worth flagging.
    fn warn_unreachable_drives(&self, config: &PoolConfig, log: &Logger) {
        for d in &config.drives {
            let reachable = self
                .default
                .iter()
                .chain(self.shares.values().flatten())
                .any(|ds| ds.drives.iter().any(|p| p == &d.path));
            if !reachable {
                warn!(
                    log,
                    "pool drive {:?} is not part of any drive selection \
                     rule and will never receive file copies",
                    d.path
                );
            }
        }
    }
}
